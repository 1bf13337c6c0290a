//! Local cache of the thumbnails stored next to remote files.
//!
//! A directory `D` keeps its thumbnails in `D/<thumb_dir>/<name>.jpg`; the
//! cache mirrors them under `<cache_dir>/D/<thumb_dir>/`. Staleness is judged by
//! modification time alone, so a downloaded thumbnail gets the remote mtime.

use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::RemoteError;
use crate::remote::{FileKind, RemoteAttributes, RemoteFs, SharedChannel, join_remote};

const THUMBNAIL_EXT: &str = ".jpg";

pub struct ThumbnailSync<C> {
    channel: SharedChannel<C>,
    enabled: bool,
    thumb_dir: String,
    cache_dir: PathBuf,
}

fn thumbnail_name(name: &str) -> String {
    format!("{name}{THUMBNAIL_EXT}")
}

impl<C: RemoteFs> ThumbnailSync<C> {
    pub fn new(channel: SharedChannel<C>, settings: &Settings) -> Self {
        Self {
            channel,
            enabled: settings.thumbnails,
            thumb_dir: settings.thumb_dir.clone(),
            cache_dir: settings.cache_dir.clone(),
        }
    }

    /// Cache directory holding the thumbnails of remote directory `dir`.
    pub fn local_dir(&self, dir: &str) -> PathBuf {
        dir.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.cache_dir.clone(), |path, part| path.join(part))
            .join(&self.thumb_dir)
    }

    pub fn remote_dir(&self, dir: &str) -> String {
        join_remote(dir, &self.thumb_dir)
    }

    /// Cached thumbnail of entry `name` in remote directory `dir`.
    pub fn local_thumbnail(&self, dir: &str, name: &str) -> PathBuf {
        self.local_dir(dir).join(thumbnail_name(name))
    }

    fn is_stale(&self, dir: &str, remote: &RemoteAttributes) -> bool {
        let local = self.local_dir(dir).join(&remote.filename);
        match std::fs::metadata(&local) {
            Ok(meta) => {
                let local_mtime = FileTime::from_last_modification_time(&meta).unix_seconds();
                // Any difference counts, the clocks may be skewed either way
                local_mtime != remote.mtime as i64
            }
            Err(_) => true,
        }
    }

    /// Bring the cache for `dir` up to date with the remote thumbnails.
    ///
    /// Returns the names of the entries whose thumbnail was downloaded. Only
    /// transport errors are returned; anything else is logged.
    pub async fn reconcile(&self, dir: &str) -> Result<Vec<String>, RemoteError> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let remote_dir = self.remote_dir(dir);
        let entries = match self.channel.list_directory(&remote_dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                debug!("No thumbnails for {}: {}", dir, e);
                return Ok(Vec::new());
            }
        };

        let stale: Vec<RemoteAttributes> = entries
            .into_iter()
            .filter(|entry| entry.kind == FileKind::File && self.is_stale(dir, entry))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        info!("Refreshing {} thumbnails of {}", stale.len(), dir);
        let batch = tokio::spawn(download_batch(
            self.channel.clone(),
            stale,
            self.local_dir(dir),
        ));
        batch
            .await
            .map_err(|e| RemoteError::Other(format!("Thumbnail download failed: {e}")))?
    }

    /// Move the thumbnail of `old_dir/old_name` to `new_dir/new_name`, both
    /// in the cache and on the remote side. Failures are only logged.
    pub async fn move_thumbnail(&self, old_dir: &str, old_name: &str, new_dir: &str, new_name: &str) {
        if !self.enabled {
            return;
        }

        let old_local = self.local_thumbnail(old_dir, old_name);
        if old_local.exists() {
            let new_local = self.local_thumbnail(new_dir, new_name);
            let moved = (|| -> std::io::Result<()> {
                if let Some(parent) = new_local.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if new_local.exists() {
                    std::fs::remove_file(&new_local)?;
                }
                std::fs::rename(&old_local, &new_local)
            })();
            if let Err(e) = moved {
                warn!("Failed to rename local thumbnail {:?}: {}", old_local, e);
            }
        }

        let old_remote = join_remote(&self.remote_dir(old_dir), &thumbnail_name(old_name));
        let new_remote = join_remote(&self.remote_dir(new_dir), &thumbnail_name(new_name));
        let renamed = match self.channel.acquire().await {
            Ok(channel) => channel.rename(&old_remote, &new_remote).await,
            Err(e) => Err(e),
        };
        match renamed {
            Ok(()) => debug!("Renamed remote thumbnail {} -> {}", old_remote, new_remote),
            Err(e) if e.is_not_found() => debug!("No remote thumbnail {}", old_remote),
            Err(e) => warn!("Failed to rename remote thumbnail {}: {}", old_remote, e),
        }
    }

    /// Make `image`, an already scaled picture, the thumbnail of entry `name`
    /// in remote directory `dir`.
    ///
    /// The cached copy ends up with the remote mtime so the next
    /// [`reconcile`](Self::reconcile) leaves it alone.
    pub async fn upload_thumbnail(
        &self,
        dir: &str,
        name: &str,
        image: &Path,
    ) -> Result<(), RemoteError> {
        let local = self.local_thumbnail(dir, name);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(image, &local).await?;

        let remote_dir = self.remote_dir(dir);
        let remote = join_remote(&remote_dir, &thumbnail_name(name));
        let dir_exists = self
            .channel
            .try_attributes(&remote_dir)
            .await?
            .is_some_and(|attrs| attrs.is_dir());
        {
            let channel = self.channel.acquire().await?;
            if !dir_exists {
                channel.make_directory(&remote_dir).await?;
            }
            channel.put(&local, &remote, true, &mut |_, _| {}).await?;
        }

        let uploaded = self.channel.attributes(&remote).await?;
        let mtime = FileTime::from_unix_time(uploaded.mtime as i64, 0);
        if let Err(e) = filetime::set_file_mtime(&local, mtime) {
            warn!("Failed to set mtime of {:?}: {}", local, e);
        }
        info!("Uploaded thumbnail of {} to {}", name, remote);
        Ok(())
    }
}

async fn download_batch<C: RemoteFs>(
    channel: SharedChannel<C>,
    entries: Vec<RemoteAttributes>,
    local_dir: PathBuf,
) -> Result<Vec<String>, RemoteError> {
    tokio::fs::create_dir_all(&local_dir).await?;

    let mut refreshed = Vec::new();
    for entry in entries {
        let target = local_dir.join(&entry.filename);
        let result = match channel.acquire().await {
            Ok(remote) => remote.get(&entry.full_path(), &target, &mut |_, _| {}).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                let mtime = FileTime::from_unix_time(entry.mtime as i64, 0);
                if let Err(e) = filetime::set_file_mtime(&target, mtime) {
                    warn!("Failed to set mtime of {:?}: {}", target, e);
                }
                let name = entry
                    .filename
                    .strip_suffix(THUMBNAIL_EXT)
                    .unwrap_or(&entry.filename);
                refreshed.push(name.to_string());
            }
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => warn!("Failed to download thumbnail {}: {}", entry.full_path(), e),
        }
    }
    Ok(refreshed)
}
