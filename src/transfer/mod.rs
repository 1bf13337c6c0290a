//! Transfer tasks and progress reporting.

pub mod manager;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::remote::RemoteAttributes;

pub use manager::{Submitter, TransferManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKind {
    Download,
    Upload,
    RemoveRemote,
    /// Remove an emptied remote directory, the last step of a tree removal.
    RemoveDirectory,
    /// Download to a temporary path, then hand it to the platform opener.
    Open,
    MakeDir,
}

/// What a finished task reports to its completion callback.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub kind: TaskKind,
    pub source: String,
    pub destination: String,
    pub attributes: Option<RemoteAttributes>,
}

pub type OnComplete = Arc<dyn Fn(&TaskOutput) + Send + Sync>;

/// One remote filesystem operation.
///
/// `destination` is always the full target path: local for downloads and
/// opens, remote for everything else. Single-path tasks carry the same path
/// in both fields.
#[derive(Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub source: String,
    pub destination: String,
    pub attributes: Option<RemoteAttributes>,
    pub on_complete: Option<OnComplete>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl Task {
    fn new(kind: TaskKind, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            destination: destination.into(),
            attributes: None,
            on_complete: None,
            progress: None,
        }
    }

    pub fn download(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self::new(TaskKind::Download, remote, local)
    }

    pub fn upload(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self::new(TaskKind::Upload, local, remote)
    }

    pub fn remove(remote: impl Into<String>) -> Self {
        let remote = remote.into();
        Self::new(TaskKind::RemoveRemote, remote.clone(), remote)
    }

    pub fn remove_directory(remote: impl Into<String>) -> Self {
        let remote = remote.into();
        Self::new(TaskKind::RemoveDirectory, remote.clone(), remote)
    }

    pub fn open(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self::new(TaskKind::Open, remote, local)
    }

    pub fn make_dir(remote: impl Into<String>) -> Self {
        let remote = remote.into();
        Self::new(TaskKind::MakeDir, remote.clone(), remote)
    }

    pub fn with_attributes(mut self, attributes: RemoteAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskOutput) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn with_progress(mut self, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        self.progress = sink;
        self
    }

    pub(crate) fn output(&self, attributes: Option<RemoteAttributes>) -> TaskOutput {
        TaskOutput {
            kind: self.kind,
            source: self.source.clone(),
            destination: self.destination.clone(),
            attributes: attributes.or_else(|| self.attributes.clone()),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("attributes", &self.attributes)
            .field("on_complete", &self.on_complete.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Byte-level progress of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.transferred as f64 / self.total as f64).clamp(0.0, 1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.transferred >= self.total
    }
}

/// Receives progress of download, upload and open tasks.
pub trait ProgressSink: Send + Sync {
    fn transfer_started(&self, task: &Task);
    fn progress(&self, progress: TransferProgress);
    fn transfer_stopped(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        kind: TaskKind,
        source: String,
        destination: String,
    },
    Progress(TransferProgress),
    Stopped,
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn transfer_started(&self, task: &Task) {
        let _ = self.send(ProgressEvent::Started {
            kind: task.kind,
            source: task.source.clone(),
            destination: task.destination.clone(),
        });
    }

    fn progress(&self, progress: TransferProgress) {
        let _ = self.send(ProgressEvent::Progress(progress));
    }

    fn transfer_stopped(&self) {
        let _ = self.send(ProgressEvent::Stopped);
    }
}

/// Lets through at most one update per interval, plus the final one.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn admit(&mut self, progress: TransferProgress) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due || progress.is_finished() {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}
