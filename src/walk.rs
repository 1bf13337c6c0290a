//! Expansion of directory transfers into per-entry tasks.
//!
//! Walks push their tasks into the transfer queue as they discover them, so a
//! large tree starts moving before the walk is over. A branch whose destination
//! has the wrong type is skipped and handed to the user as a confirmation; the
//! rest of the tree carries on.
//!
//! A walk resumed after a reconnect skips files whose destination already
//! matches the source in size and modification time.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::events::{ConfirmRequest, Continuation, SessionEvent};
use crate::remote::{
    FileKind, RemoteAttributes, RemoteFs, SharedChannel, TreeVisitor, WalkControl, join_remote,
};
use crate::transfer::{Submitter, Task};

pub(crate) struct WalkContext<C> {
    pub channel: SharedChannel<C>,
    pub submitter: Submitter,
    pub events: UnboundedSender<SessionEvent>,
}

impl<C> WalkContext<C> {
    fn confirm(&self, message: String, continuation: Continuation) {
        info!("Walk paused for confirmation: {}", message);
        let request = ConfirmRequest::new(message, continuation);
        let _ = self.events.send(SessionEvent::ConfirmationNeeded(request));
    }
}

/// Local file with the size and mtime of the remote entry.
fn is_same_file(local: &std::fs::Metadata, remote: &RemoteAttributes) -> bool {
    local.is_file()
        && local.len() == remote.size
        && FileTime::from_last_modification_time(local).unix_seconds() == remote.mtime as i64
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Make sure `path` is a local directory. `Ok(false)` when a file is in the way.
fn prepare_local_dir(path: &Path) -> io::Result<bool> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

struct DownloadVisitor<'a, C> {
    ctx: &'a WalkContext<C>,
    root: &'a str,
    local_root: &'a Path,
    template: &'a Task,
    resume: bool,
}

impl<C> DownloadVisitor<'_, C> {
    /// Re-root a remote path under the local destination.
    fn local_path(&self, remote: &str) -> PathBuf {
        let relative = remote.strip_prefix(self.root).unwrap_or(remote);
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.local_root.to_path_buf(), |path, part| path.join(part))
    }

    fn download_task(&self, remote: &str, local: &Path, attrs: &RemoteAttributes) -> Task {
        Task::download(remote, path_string(local))
            .with_attributes(attrs.clone())
            .with_progress(self.template.progress.clone())
    }

    fn file(&mut self, remote: &str, attrs: &RemoteAttributes) {
        let local = self.local_path(remote);
        let task = self.download_task(remote, &local, attrs);
        if self.resume
            && std::fs::metadata(&local).is_ok_and(|meta| is_same_file(&meta, attrs))
        {
            debug!("{:?} already downloaded", local);
            return;
        }
        if local.is_dir() {
            self.ctx.confirm(
                format!(
                    "Path {} already exists but it is a directory.\n\
                     Do you agree to delete the directory and download the file?",
                    local.display()
                ),
                Continuation::ReplaceLocalFile { path: local, then: task },
            );
        } else {
            self.ctx.submitter.submit(task);
        }
    }
}

impl<C: Send + Sync> TreeVisitor for DownloadVisitor<'_, C> {
    fn on_directory(&mut self, path: &str, attrs: &RemoteAttributes) -> WalkControl {
        let local = self.local_path(path);
        match prepare_local_dir(&local) {
            Ok(true) => WalkControl::Descend,
            Ok(false) => {
                let task = self.download_task(path, &local, attrs);
                self.ctx.confirm(
                    format!(
                        "Path {} already exists but it is a file.\n\
                         Do you agree to delete the file and create the directory?",
                        local.display()
                    ),
                    Continuation::ReplaceLocalFile { path: local, then: task },
                );
                WalkControl::Skip
            }
            Err(e) => {
                warn!("Failed to create local directory {:?}: {}", local, e);
                WalkControl::Skip
            }
        }
    }

    fn on_file(&mut self, path: &str, attrs: &RemoteAttributes) {
        self.file(path, attrs);
    }

    fn on_other(&mut self, path: &str, attrs: &RemoteAttributes) {
        self.file(path, attrs);
    }
}

/// Expand the download of remote directory `task.source` into `task.destination`.
pub(crate) async fn download_tree<C: RemoteFs>(
    ctx: &WalkContext<C>,
    task: &Task,
    resume: bool,
) -> Result<(), RemoteError> {
    let root = match task.source.trim_end_matches('/') {
        "" => "/",
        root => root,
    };
    let local_root = PathBuf::from(&task.destination);

    if !prepare_local_dir(&local_root)? {
        ctx.confirm(
            format!(
                "Path {} already exists but it is a file.\n\
                 Do you agree to delete the file and create the directory?",
                local_root.display()
            ),
            Continuation::ReplaceLocalFile {
                path: local_root,
                then: task.clone(),
            },
        );
        return Ok(());
    }

    debug!("Download walk {} -> {:?}", root, local_root);
    let mut visitor = DownloadVisitor {
        ctx,
        root,
        local_root: &local_root,
        template: task,
        resume,
    };
    ctx.channel.walk_tree(root, &mut visitor).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteSlot {
    Absent,
    Directory,
    Blocked,
}

impl RemoteSlot {
    fn of(kind: Option<FileKind>) -> Self {
        match kind {
            None => RemoteSlot::Absent,
            Some(FileKind::Directory) => RemoteSlot::Directory,
            Some(_) => RemoteSlot::Blocked,
        }
    }
}

/// Files and subdirectories of a local directory, each sorted by name.
async fn read_local_dir(dir: &Path) -> io::Result<(Vec<(String, PathBuf)>, Vec<(String, PathBuf)>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        // Follow symlinks to the actual type
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => dirs.push((name, path)),
            Ok(meta) if meta.is_file() => files.push((name, path)),
            Ok(_) => debug!("Skipping special file {:?}", path),
            Err(e) => warn!("Failed to read metadata of {:?}: {}", path, e),
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((files, dirs))
}

/// Expand the upload of local directory `task.source` to remote `task.destination`.
///
/// Depth first, files of a directory before its subdirectories. Remote
/// directories are created only when absent; the root's completion callback
/// moves to the task creating it.
pub(crate) async fn upload_tree<C: RemoteFs>(
    ctx: &WalkContext<C>,
    task: &Task,
    resume: bool,
) -> Result<(), RemoteError> {
    let root_kind = ctx
        .channel
        .try_attributes(&task.destination)
        .await?
        .map(|attrs| attrs.kind);
    let mut stack = vec![(
        PathBuf::from(&task.source),
        task.destination.clone(),
        RemoteSlot::of(root_kind),
    )];

    debug!("Upload walk {} -> {}", task.source, task.destination);
    while let Some((local_dir, remote_dir, slot)) = stack.pop() {
        let is_root = remote_dir == task.destination;
        let existing: HashMap<String, RemoteAttributes> = match slot {
            RemoteSlot::Blocked => {
                let mut then = Task::upload(path_string(&local_dir), remote_dir.clone())
                    .with_progress(task.progress.clone());
                if is_root {
                    then.on_complete = task.on_complete.clone();
                }
                ctx.confirm(
                    format!(
                        "Path {remote_dir} already exists on remote server but it is a file.\n\
                         To upload the directory there it must be removed.\n\n\
                         Do you agree to delete the file and create the directory?"
                    ),
                    Continuation::ReplaceRemoteEntry {
                        path: remote_dir,
                        then,
                    },
                );
                continue;
            }
            RemoteSlot::Absent => {
                let mut make_dir = Task::make_dir(remote_dir.clone());
                if is_root {
                    make_dir.on_complete = task.on_complete.clone();
                }
                ctx.submitter.submit(make_dir);
                HashMap::new()
            }
            RemoteSlot::Directory => ctx
                .channel
                .list_directory(&remote_dir)
                .await?
                .into_iter()
                .map(|attrs| (attrs.filename.clone(), attrs))
                .collect(),
        };

        let (files, dirs) = match read_local_dir(&local_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read local directory {:?}: {}", local_dir, e);
                continue;
            }
        };

        for (name, path) in files {
            let remote = join_remote(&remote_dir, &name);
            let upload =
                Task::upload(path_string(&path), remote.clone()).with_progress(task.progress.clone());
            let remote_entry = existing.get(&name);
            if resume
                && let Some(attrs) = remote_entry
                && std::fs::metadata(&path).is_ok_and(|meta| is_same_file(&meta, attrs))
            {
                debug!("{} already uploaded", remote);
                continue;
            }
            if remote_entry.is_some_and(|attrs| attrs.is_dir()) {
                ctx.confirm(
                    format!(
                        "Path {remote} already exists on remote server but it is a directory.\n\
                         Do you agree to delete the directory and upload the file?"
                    ),
                    Continuation::ReplaceRemoteEntry {
                        path: remote,
                        then: upload,
                    },
                );
            } else {
                ctx.submitter.submit(upload);
            }
        }

        for (name, path) in dirs.into_iter().rev() {
            let slot = RemoteSlot::of(existing.get(&name).map(|attrs| attrs.kind));
            stack.push((path, join_remote(&remote_dir, &name), slot));
        }
    }
    Ok(())
}
