//! [`RemoteFs`] over an SFTP subsystem channel.

use std::path::Path;

use filetime::FileTime;
use russh::client;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

use super::{FileKind, ProgressFn, RemoteAttributes, RemoteFs, join_remote, split_remote};
use crate::connection::ClientHandler;
use crate::error::RemoteError;

const CHUNK_SIZE: usize = 32 * 1024;

pub struct SftpChannel {
    session: SftpSession,
    cwd: String,
    // Dropping the handle closes the SSH connection underneath the session.
    _ssh: client::Handle<ClientHandler>,
}

impl SftpChannel {
    pub fn new(session: SftpSession, ssh: client::Handle<ClientHandler>, cwd: String) -> Self {
        Self {
            session,
            cwd,
            _ssh: ssh,
        }
    }

    fn resolve(&self, path: &str) -> String {
        join_remote(&self.cwd, path)
    }

    fn to_attributes(dir: &str, filename: String, meta: &FileAttributes) -> RemoteAttributes {
        let file_type = meta.file_type();
        // Symlinks are reported as such, never followed
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };
        RemoteAttributes {
            filename,
            size: meta.size.unwrap_or(0),
            mtime: meta.mtime.map(u64::from).unwrap_or(0),
            atime: meta.atime.map(u64::from).unwrap_or(0),
            mode: meta.permissions.unwrap_or(0),
            kind,
            path: dir.to_string(),
        }
    }
}

impl RemoteFs for SftpChannel {
    fn current_directory(&self) -> String {
        self.cwd.clone()
    }

    async fn change_directory(&mut self, path: &str) -> Result<String, RemoteError> {
        let target = self.resolve(path);
        let canonical = self.session.canonicalize(target.as_str()).await?;
        let meta = self.session.metadata(canonical.as_str()).await?;
        if !meta.is_dir() {
            return Err(RemoteError::Other(format!("{canonical} is not a directory")));
        }
        debug!("SFTP chdir: {}", canonical);
        self.cwd = canonical.clone();
        Ok(canonical)
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteAttributes>, RemoteError> {
        let dir = self.resolve(path);
        let read_dir = self.session.read_dir(dir.as_str()).await.map_err(|e| {
            error!("SFTP read_dir failed for '{}': {}", dir, e);
            RemoteError::from(e)
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let filename = entry.file_name();
            if filename == "." || filename == ".." {
                continue;
            }
            let meta = entry.metadata();
            entries.push(Self::to_attributes(&dir, filename, &meta));
        }

        debug!("SFTP read_dir completed for '{}': {} entries", dir, entries.len());
        Ok(entries)
    }

    async fn attributes(&self, path: &str) -> Result<RemoteAttributes, RemoteError> {
        let full = self.resolve(path);
        let meta = self.session.symlink_metadata(full.as_str()).await?;
        let (dir, name) = split_remote(&full);
        Ok(Self::to_attributes(dir, name.to_string(), &meta))
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        match self.session.symlink_metadata(self.resolve(path)).await {
            Ok(_) => Ok(true),
            Err(e) => match RemoteError::from(e) {
                RemoteError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn remove(&self, path: &str) -> Result<(), RemoteError> {
        let full = self.resolve(path);
        debug!("SFTP deleting file: {}", full);
        self.session.remove_file(full).await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), RemoteError> {
        self.session
            .rename(self.resolve(old), self.resolve(new))
            .await?;
        Ok(())
    }

    async fn make_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.session.create_dir(self.resolve(path)).await?;
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.session.remove_dir(self.resolve(path)).await?;
        Ok(())
    }

    async fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let remote = self.resolve(remote);
        let total = self
            .session
            .metadata(remote.as_str())
            .await?
            .size
            .unwrap_or(0);
        let mut source = self.session.open(remote.as_str()).await?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut target = tokio::fs::File::create(local).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        progress(0, total);
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n]).await?;
            transferred += n as u64;
            progress(transferred, total);
        }
        target.flush().await?;

        debug!("SFTP get {} -> {:?}: {} bytes", remote, local, transferred);
        Ok(transferred)
    }

    async fn put(
        &self,
        local: &Path,
        remote: &str,
        preserve_mtime: bool,
        progress: ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let remote = self.resolve(remote);
        let mut source = tokio::fs::File::open(local).await?;
        let local_meta = source.metadata().await?;
        let total = local_meta.len();
        let mut target = self.session.create(remote.as_str()).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut transferred = 0u64;
        progress(0, total);
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n]).await?;
            transferred += n as u64;
            progress(transferred, total);
        }
        target.shutdown().await?;

        if preserve_mtime {
            let mtime = FileTime::from_last_modification_time(&local_meta);
            let atime = FileTime::from_last_access_time(&local_meta);
            let attrs = FileAttributes {
                mtime: Some(mtime.unix_seconds() as u32),
                atime: Some(atime.unix_seconds() as u32),
                ..FileAttributes::empty()
            };
            self.session.set_metadata(remote.as_str(), attrs).await?;
        }

        debug!("SFTP put {:?} -> {}: {} bytes", local, remote, transferred);
        Ok(transferred)
    }
}
