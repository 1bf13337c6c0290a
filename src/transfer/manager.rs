//! The single serialized executor of [`Task`]s.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use filetime::FileTime;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tracing::{debug, error, info, warn};

use super::{ProgressThrottle, Task, TaskKind, TaskOutput, TransferProgress};
use crate::error::RemoteError;
use crate::events::SessionEvent;
use crate::remote::{RemoteAttributes, RemoteFs, SharedChannel, TreeVisitor, WalkControl};
use crate::walk::{self, WalkContext};

/// Tasks queued or running, plus running expansion walks.
#[derive(Default)]
struct QueueState {
    pending: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn begin(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Cloneable handle that appends to the transfer queue.
#[derive(Clone)]
pub struct Submitter {
    queue: UnboundedSender<Task>,
    state: Arc<QueueState>,
}

impl Submitter {
    pub fn submit(&self, task: Task) {
        self.state.begin();
        debug!("Queued {:?} {} -> {}", task.kind, task.source, task.destination);
        if self.queue.send(task).is_err() {
            self.state.finish();
            warn!("Transfer queue closed, task dropped");
        }
    }

    /// A submitter whose queue is read by the caller instead of a worker.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, UnboundedReceiver<Task>) {
        let (queue, tasks) = mpsc::unbounded_channel();
        (
            Self {
                queue,
                state: Arc::default(),
            },
            tasks,
        )
    }
}

struct Worker<C> {
    tasks: UnboundedReceiver<Task>,
    // Weak so that dropping the manager ends the worker once walks are done.
    queue: WeakUnboundedSender<Task>,
    state: Arc<QueueState>,
    channel: SharedChannel<C>,
    events: UnboundedSender<SessionEvent>,
    progress_interval: Duration,
}

/// FIFO task queue drained by one worker over the shared channel.
///
/// The worker is spawned on the first submit.
pub struct TransferManager<C> {
    submitter: Submitter,
    worker: Option<Worker<C>>,
}

impl<C: RemoteFs> TransferManager<C> {
    pub fn new(
        channel: SharedChannel<C>,
        events: UnboundedSender<SessionEvent>,
        progress_interval: Duration,
    ) -> Self {
        let (queue, tasks) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());
        let worker = Worker {
            tasks,
            queue: queue.downgrade(),
            state: Arc::clone(&state),
            channel,
            events,
            progress_interval,
        };
        Self {
            submitter: Submitter { queue, state },
            worker: Some(worker),
        }
    }

    /// Queue a task; never blocks.
    pub fn submit(&mut self, task: Task) {
        self.submitter.submit(task);
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn pending(&self) -> usize {
        self.submitter.state.pending.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is queued, running or being expanded.
    pub async fn wait_idle(&self) {
        let state = &self.submitter.state;
        loop {
            let notified = state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if state.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Collects a tree for removal, parents before children.
#[derive(Default)]
struct RemovalPlan {
    files: Vec<String>,
    dirs: Vec<String>,
}

impl TreeVisitor for RemovalPlan {
    fn on_directory(&mut self, path: &str, _attrs: &RemoteAttributes) -> WalkControl {
        self.dirs.push(path.to_string());
        WalkControl::Descend
    }

    fn on_file(&mut self, path: &str, _attrs: &RemoteAttributes) {
        self.files.push(path.to_string());
    }

    fn on_other(&mut self, path: &str, _attrs: &RemoteAttributes) {
        self.files.push(path.to_string());
    }
}

impl RemovalPlan {
    /// Leaf tasks: files first, then directories deepest first, `root` last.
    fn into_tasks(self, root: &str) -> Vec<Task> {
        let files = self.files.into_iter().map(Task::remove);
        let dirs = self
            .dirs
            .into_iter()
            .rev()
            .chain(std::iter::once(root.to_string()))
            .map(Task::remove_directory);
        files.chain(dirs).collect()
    }
}

impl<C: RemoteFs> Worker<C> {
    async fn run(mut self) {
        debug!("Transfer worker started");
        while let Some(task) = self.tasks.recv().await {
            self.process(task).await;
            self.state.finish();
        }
        debug!("Transfer worker stopped");
    }

    /// Run one task to its end, replaying it after every reconnect.
    async fn process(&self, task: Task) {
        loop {
            let generation = self.channel.generation();
            match self.execute(&task).await {
                Ok(Some(output)) => {
                    debug!("{:?} {} done", task.kind, task.destination);
                    if let Some(on_complete) = &task.on_complete {
                        on_complete(&output);
                    }
                    return;
                }
                Ok(None) => return,
                Err(e) if e.is_transport() => {
                    warn!(
                        "Transport error during {:?} {}: {}",
                        task.kind, task.source, e
                    );
                    self.channel.invalidate(generation).await;
                    let _ = self.events.send(SessionEvent::ConnectionLost);
                    if !self.channel.wait_connected(generation).await {
                        warn!("Session closed, dropping {:?} {}", task.kind, task.source);
                        return;
                    }
                    info!("Replaying {:?} {}", task.kind, task.source);
                }
                Err(e)
                    if e.is_not_found()
                        && matches!(task.kind, TaskKind::RemoveRemote | TaskKind::RemoveDirectory) =>
                {
                    debug!("{} already gone", task.source);
                    if let Some(on_complete) = &task.on_complete {
                        on_complete(&task.output(None));
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        "{:?} {} -> {} failed: {}",
                        task.kind, task.source, task.destination, e
                    );
                    return;
                }
            }
        }
    }

    /// `Ok(None)` when the task was expanded into a walk.
    async fn execute(&self, task: &Task) -> Result<Option<TaskOutput>, RemoteError> {
        match task.kind {
            TaskKind::Download => {
                if self.is_remote_dir(task).await? {
                    self.spawn_walk(task.clone());
                    return Ok(None);
                }
                self.transfer(task).await?;
                if let Some(attrs) = &task.attributes {
                    let mtime = FileTime::from_unix_time(attrs.mtime as i64, 0);
                    if let Err(e) = filetime::set_file_mtime(&task.destination, mtime) {
                        warn!("Failed to set mtime of {}: {}", task.destination, e);
                    }
                }
                Ok(Some(task.output(None)))
            }
            TaskKind::Upload => {
                if tokio::fs::metadata(&task.source).await?.is_dir() {
                    self.spawn_walk(task.clone());
                    return Ok(None);
                }
                self.transfer(task).await?;
                let attributes = self.channel.attributes(&task.destination).await?;
                Ok(Some(task.output(Some(attributes))))
            }
            TaskKind::Open => {
                self.transfer(task).await?;
                Ok(Some(task.output(None)))
            }
            TaskKind::RemoveRemote => {
                if self.is_remote_dir(task).await? {
                    self.remove_tree(&task.source).await?;
                } else {
                    self.remove_leaf(task).await?;
                }
                Ok(Some(task.output(None)))
            }
            TaskKind::RemoveDirectory => {
                self.remove_leaf(task).await?;
                Ok(Some(task.output(None)))
            }
            TaskKind::MakeDir => {
                self.channel
                    .acquire()
                    .await?
                    .make_directory(&task.destination)
                    .await?;
                let attributes = self.channel.attributes(&task.destination).await?;
                Ok(Some(task.output(Some(attributes))))
            }
        }
    }

    async fn is_remote_dir(&self, task: &Task) -> Result<bool, RemoteError> {
        match &task.attributes {
            Some(attrs) => Ok(attrs.is_dir()),
            None => Ok(self.channel.attributes(&task.source).await?.is_dir()),
        }
    }

    async fn transfer(&self, task: &Task) -> Result<u64, RemoteError> {
        let sink = task.progress.as_deref();
        if let Some(sink) = sink {
            sink.transfer_started(task);
        }

        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut report = |transferred, total| {
            let progress = TransferProgress { transferred, total };
            if let Some(sink) = sink
                && throttle.admit(progress)
            {
                sink.progress(progress);
            }
        };

        let result = match self.channel.acquire().await {
            Ok(channel) => match task.kind {
                TaskKind::Upload => {
                    channel
                        .put(Path::new(&task.source), &task.destination, true, &mut report)
                        .await
                }
                _ => {
                    channel
                        .get(&task.source, Path::new(&task.destination), &mut report)
                        .await
                }
            },
            Err(e) => Err(e),
        };

        if let Some(sink) = sink {
            sink.transfer_stopped();
        }
        result
    }

    async fn remove_leaf(&self, task: &Task) -> Result<(), RemoteError> {
        let channel = self.channel.acquire().await?;
        match task.kind {
            TaskKind::RemoveDirectory => channel.remove_directory(&task.source).await,
            _ => channel.remove(&task.source).await,
        }
    }

    /// Remove a whole remote tree before the next queued task runs.
    async fn remove_tree(&self, root: &str) -> Result<(), RemoteError> {
        let mut plan = RemovalPlan::default();
        self.channel.walk_tree(root, &mut plan).await?;

        for leaf in plan.into_tasks(root) {
            match self.remove_leaf(&leaf).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("{} already gone", leaf.source),
                Err(e) => return Err(e),
            }
        }
        info!("Removed remote tree {}", root);
        Ok(())
    }

    fn spawn_walk(&self, task: Task) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let ctx = WalkContext {
            channel: self.channel.clone(),
            submitter: Submitter {
                queue,
                state: Arc::clone(&self.state),
            },
            events: self.events.clone(),
        };

        self.state.begin();
        tokio::spawn(async move {
            let mut resume = false;
            loop {
                let generation = ctx.channel.generation();
                let result = match task.kind {
                    TaskKind::Upload => walk::upload_tree(&ctx, &task, resume).await,
                    _ => walk::download_tree(&ctx, &task, resume).await,
                };
                match result {
                    Ok(()) => break,
                    Err(e) if e.is_transport() => {
                        warn!("Walk of {} interrupted: {}", task.source, e);
                        ctx.channel.invalidate(generation).await;
                        let _ = ctx.events.send(SessionEvent::ConnectionLost);
                        if !ctx.channel.wait_connected(generation).await {
                            warn!("Session closed, dropping walk of {}", task.source);
                            break;
                        }
                        info!("Resuming walk of {}", task.source);
                        resume = true;
                    }
                    Err(e) => {
                        error!("Walk of {} failed: {}", task.source, e);
                        break;
                    }
                }
            }
            ctx.submitter.state.finish();
        });
    }
}
