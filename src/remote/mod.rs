//! Remote filesystem primitives and the single shared channel.

pub mod sftp;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, watch};
use tracing::debug;

use crate::error::RemoteError;

pub use sftp::SftpChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Snapshot of a remote entry as returned by a listing or stat call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttributes {
    pub filename: String,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub mtime: u64,
    pub atime: u64,
    pub mode: u32,
    pub kind: FileKind,
    /// Directory the entry lives in.
    pub path: String,
}

impl RemoteAttributes {
    pub fn full_path(&self) -> String {
        join_remote(&self.path, &self.filename)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Join remote path components with `/`, regardless of the local platform.
pub fn join_remote(base: &str, component: &str) -> String {
    if component.starts_with('/') || base.is_empty() || base == "." {
        return component.to_string();
    }
    if component.is_empty() || component == "." {
        return base.to_string();
    }
    if base.ends_with('/') {
        format!("{base}{component}")
    } else {
        format!("{base}/{component}")
    }
}

/// Split a remote path into its parent directory and final component.
pub fn split_remote(path: &str) -> (&str, &str) {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

/// Progress callback invoked with `(transferred, total)` bytes.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Operations the remote file server supports over one logical channel.
///
/// Relative paths resolve against the current directory.
pub trait RemoteFs: Send + Sync + 'static {
    fn current_directory(&self) -> String;

    /// Returns the canonical path of the new current directory.
    fn change_directory(
        &mut self,
        path: &str,
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;

    fn list_directory(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Vec<RemoteAttributes>, RemoteError>> + Send;

    fn attributes(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<RemoteAttributes, RemoteError>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = Result<bool, RemoteError>> + Send;

    fn remove(&self, path: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn rename(&self, old: &str, new: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn make_directory(&self, path: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn remove_directory(&self, path: &str)
    -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: ProgressFn<'_>,
    ) -> impl Future<Output = Result<u64, RemoteError>> + Send;

    fn put(
        &self,
        local: &Path,
        remote: &str,
        preserve_mtime: bool,
        progress: ProgressFn<'_>,
    ) -> impl Future<Output = Result<u64, RemoteError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Disconnected,
    Connected(u64),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Descend,
    Skip,
}

/// Callbacks of [`SharedChannel::walk_tree`].
pub trait TreeVisitor: Send {
    fn on_directory(&mut self, path: &str, attrs: &RemoteAttributes) -> WalkControl;
    fn on_file(&mut self, path: &str, attrs: &RemoteAttributes);
    /// Entries that are neither regular files nor directories.
    fn on_other(&mut self, path: &str, attrs: &RemoteAttributes);
}

struct ChannelSlot<C> {
    slot: Mutex<Option<C>>,
    state: watch::Sender<ChannelState>,
    installs: AtomicU64,
}

/// The one channel to the remote host.
///
/// Every protocol call goes through [`SharedChannel::acquire`], so at most one
/// call is in flight at any time no matter how many tasks hold a clone.
pub struct SharedChannel<C> {
    inner: Arc<ChannelSlot<C>>,
}

impl<C> Clone for SharedChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RemoteFs> Default for SharedChannel<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: RemoteFs> SharedChannel<C> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelSlot {
                slot: Mutex::new(None),
                state,
                installs: AtomicU64::new(0),
            }),
        }
    }

    /// Replace whatever channel is held by a freshly connected one.
    pub async fn install(&self, channel: C) {
        let mut slot = self.inner.slot.lock().await;
        if *self.inner.state.borrow() == ChannelState::Closed {
            return;
        }
        *slot = Some(channel);
        let generation = self.inner.installs.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .state
            .send_replace(ChannelState::Connected(generation));
        debug!("Channel installed (generation {})", generation);
    }

    /// Drop the channel if it is still the one of `generation`.
    ///
    /// A failure observed on an older channel (or while none was installed)
    /// must not take down a newer one.
    pub async fn invalidate(&self, generation: Option<u64>) {
        let Some(generation) = generation else {
            return;
        };
        let mut slot = self.inner.slot.lock().await;
        if self.generation() != Some(generation) {
            return;
        }
        slot.take();
        self.inner.state.send_replace(ChannelState::Disconnected);
        debug!("Channel invalidated (generation {})", generation);
    }

    /// Tear down for good; waiters in [`Self::wait_connected`] give up.
    pub async fn close(&self) {
        self.inner.slot.lock().await.take();
        self.inner.state.send_replace(ChannelState::Closed);
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.borrow(), ChannelState::Connected(_))
    }

    pub fn generation(&self) -> Option<u64> {
        match *self.inner.state.borrow() {
            ChannelState::Connected(generation) => Some(generation),
            _ => None,
        }
    }

    /// Wait until a channel newer than `stale` is installed.
    ///
    /// Returns `false` once the channel has been closed for good.
    pub async fn wait_connected(&self, stale: Option<u64>) -> bool {
        let mut state = self.inner.state.subscribe();
        let result = state
            .wait_for(|state| match *state {
                ChannelState::Connected(generation) => Some(generation) != stale,
                ChannelState::Closed => true,
                ChannelState::Disconnected => false,
            })
            .await;
        matches!(result.map(|state| *state), Ok(ChannelState::Connected(_)))
    }

    pub async fn acquire(&self) -> Result<MappedMutexGuard<'_, C>, RemoteError> {
        let guard = self.inner.slot.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| RemoteError::channel_closed())
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<RemoteAttributes>, RemoteError> {
        self.acquire().await?.list_directory(path).await
    }

    pub async fn attributes(&self, path: &str) -> Result<RemoteAttributes, RemoteError> {
        self.acquire().await?.attributes(path).await
    }

    /// `None` when nothing exists at `path`.
    pub async fn try_attributes(&self, path: &str) -> Result<Option<RemoteAttributes>, RemoteError> {
        match self.attributes(path).await {
            Ok(attrs) => Ok(Some(attrs)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.acquire().await?.exists(path).await
    }

    /// Depth-first pre-order walk below `root`.
    ///
    /// The channel is released between listings so queued transfers can
    /// interleave with a long walk.
    pub async fn walk_tree<V: TreeVisitor>(
        &self,
        root: &str,
        visitor: &mut V,
    ) -> Result<(), RemoteError> {
        let mut stack = vec![self.list_directory(root).await?.into_iter()];

        while let Some(entries) = stack.last_mut() {
            let Some(entry) = entries.next() else {
                stack.pop();
                continue;
            };
            let path = entry.full_path();
            match entry.kind {
                FileKind::Directory => {
                    if visitor.on_directory(&path, &entry) == WalkControl::Descend {
                        stack.push(self.list_directory(&path).await?.into_iter());
                    }
                }
                FileKind::File => visitor.on_file(&path, &entry),
                FileKind::Symlink | FileKind::Other => visitor.on_other(&path, &entry),
            }
        }
        Ok(())
    }
}
