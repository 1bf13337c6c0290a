//! Top-level session state and the translation of user intents into tasks.
//!
//! The controller lives on a single task. Background work never touches its
//! state; it reports through [`SessionEvent`]s which are applied here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Credentials, Settings};
use crate::connection::{Connector, TrustDecision};
use crate::error::{ConnectError, ErrorKind, RemoteError};
use crate::events::{ConfirmRequest, Continuation, SessionEvent};
use crate::history::NavigationHistory;
use crate::remote::{RemoteAttributes, RemoteFs, SharedChannel, join_remote, split_remote};
use crate::thumbnails::ThumbnailSync;
use crate::transfer::{ProgressSink, Task, TransferManager};
use crate::view::{FileView, Opener, Prompter, SystemOpener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Navigation {
    Visit,
    Back,
    Forward,
}

pub struct SessionController<K: Connector> {
    connector: K,
    settings: Settings,
    channel: SharedChannel<K::Channel>,
    transfers: TransferManager<K::Channel>,
    thumbnails: ThumbnailSync<K::Channel>,
    view: Box<dyn FileView>,
    prompter: Box<dyn Prompter>,
    opener: Box<dyn Opener>,
    progress: Option<Arc<dyn ProgressSink>>,

    history: NavigationHistory,
    current_path: String,
    base_path: Option<String>,
    trust: TrustDecision,
    reconnect_attempts: u32,
    reconnect_scheduled: bool,
    /// Directory to enter once the next connection is up.
    replay: Option<String>,
    confirmations: HashMap<Uuid, Continuation>,

    events: UnboundedSender<SessionEvent>,
    event_rx: UnboundedReceiver<SessionEvent>,
}

impl<K: Connector> SessionController<K> {
    pub fn new(
        connector: K,
        settings: Settings,
        view: Box<dyn FileView>,
        prompter: Box<dyn Prompter>,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let channel = SharedChannel::new();
        let transfers =
            TransferManager::new(channel.clone(), events.clone(), settings.progress_interval());
        let thumbnails = ThumbnailSync::new(channel.clone(), &settings);

        Self {
            connector,
            current_path: settings.default_remote.clone(),
            settings,
            channel,
            transfers,
            thumbnails,
            view,
            prompter,
            opener: Box::new(SystemOpener),
            progress: None,
            history: NavigationHistory::new(),
            base_path: None,
            trust: TrustDecision::Verify,
            reconnect_attempts: 0,
            reconnect_scheduled: false,
            replay: None,
            confirmations: HashMap::new(),
            events,
            event_rx,
        }
    }

    pub fn with_opener(mut self, opener: Box<dyn Opener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Sender for answers coming from the user interface.
    pub fn event_sender(&self) -> UnboundedSender<SessionEvent> {
        self.events.clone()
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    /// Directory the user landed in after logging in.
    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    pub fn history(&self) -> &NavigationHistory {
        &self.history
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn pending_transfers(&self) -> usize {
        self.transfers.pending()
    }

    pub fn pending_confirmations(&self) -> usize {
        self.confirmations.len()
    }

    /// Connect and enter the current (or replayed) directory.
    pub async fn connect(&mut self) -> bool {
        let trust = std::mem::take(&mut self.trust);
        let channel = match self.connector.connect(trust).await {
            Ok(channel) => channel,
            Err(e) => {
                self.connect_failed(e);
                return false;
            }
        };

        self.channel.install(channel).await;
        self.reconnect_attempts = 0;
        info!("Successfully connected to server");

        let target = self
            .replay
            .take()
            .unwrap_or_else(|| self.current_path.clone());
        if !self.change_directory(&target).await {
            return false;
        }
        if self.base_path.is_none() {
            self.base_path = Some(self.current_path.clone());
        }
        true
    }

    fn connect_failed(&mut self, error: ConnectError) {
        match error.kind() {
            ErrorKind::Configuration => {
                warn!("Configuration problem: {}", error);
                let errors = match error {
                    ConnectError::InvalidConfig(errors) => errors,
                    _ => Vec::new(),
                };
                self.prompter.request_credentials(&errors);
            }
            ErrorKind::Trust => {
                info!("Host key needs a decision: {}", error);
                self.prompter.host_key(&error.to_string());
            }
            _ => {
                error!("Connection exception: {}", error);
                self.reconnect();
            }
        }
    }

    /// Schedule a connection attempt after a delay growing with each attempt.
    pub fn reconnect(&mut self) {
        if self.reconnect_scheduled {
            return;
        }
        let delay = self.settings.reconnect_delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.reconnect_scheduled = true;
        info!(
            "Reconnecting to remote server in {:?} (attempt {})",
            delay, self.reconnect_attempts
        );

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ReconnectDue);
        });
    }

    async fn transport_failed(&mut self, generation: Option<u64>, error: &RemoteError) {
        warn!("Lost connection: {}", error);
        self.channel.invalidate(generation).await;
        self.reconnect();
    }

    pub async fn change_directory(&mut self, path: &str) -> bool {
        self.navigate(path, Navigation::Visit).await
    }

    pub async fn go_back(&mut self) -> bool {
        match self.history.peek_back().map(str::to_string) {
            Some(target) => self.navigate(&target, Navigation::Back).await,
            None => false,
        }
    }

    pub async fn go_forward(&mut self) -> bool {
        match self.history.peek_forward().map(str::to_string) {
            Some(target) => self.navigate(&target, Navigation::Forward).await,
            None => false,
        }
    }

    async fn navigate(&mut self, path: &str, mut navigation: Navigation) -> bool {
        let mut target = path.to_string();
        loop {
            let generation = self.channel.generation();
            let result = match self.channel.acquire().await {
                Ok(mut channel) => channel.change_directory(&target).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(canonical) => {
                    if let Err(e) = self.show_directory(&canonical).await {
                        if e.is_transport() {
                            self.replay = Some(canonical);
                            self.transport_failed(generation, &e).await;
                        } else {
                            error!("List dir exception {}", e);
                        }
                        return false;
                    }
                    match navigation {
                        Navigation::Visit => self.history.visit(&canonical),
                        Navigation::Back => {
                            self.history.back();
                        }
                        Navigation::Forward => {
                            self.history.forward();
                        }
                    }
                    self.current_path = canonical;
                    return true;
                }
                Err(e) if e.is_not_found() && target != self.current_path => {
                    warn!(
                        "Failed to change dir to {}: {}, staying in {}",
                        target, e, self.current_path
                    );
                    target = self.current_path.clone();
                    navigation = Navigation::Visit;
                }
                Err(e) if e.is_transport() => {
                    self.replay = Some(target);
                    self.transport_failed(generation, &e).await;
                    return false;
                }
                Err(e) => {
                    error!("Failed to change dir to {}: {}", target, e);
                    return false;
                }
            }
        }
    }

    /// Refresh thumbnails, then fill the view with the listing of `dir`.
    async fn show_directory(&mut self, dir: &str) -> Result<(), RemoteError> {
        let refreshed = self.thumbnails.reconcile(dir).await?;
        let mut entries = self.channel.list_directory(dir).await?;
        entries.retain(|entry| entry.filename != self.settings.thumb_dir);
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));

        debug!("Listing {}: {} entries", dir, entries.len());
        self.view.fill(&entries);
        for name in refreshed {
            self.view.refresh_thumbnail(&name);
        }
        Ok(())
    }

    /// Re-list the current directory.
    pub async fn list_directory(&mut self) -> bool {
        let generation = self.channel.generation();
        let dir = self.current_path.clone();
        match self.show_directory(&dir).await {
            Ok(()) => true,
            Err(e) if e.is_transport() => {
                self.replay = Some(dir);
                self.transport_failed(generation, &e).await;
                false
            }
            Err(e) => {
                error!("List dir exception {}", e);
                false
            }
        }
    }

    fn remote_path(&self, name: &str) -> String {
        join_remote(&self.current_path, name)
    }

    /// Attributes of `name` in the current directory.
    pub async fn entry(&self, name: &str) -> Result<RemoteAttributes, RemoteError> {
        self.channel.attributes(&self.remote_path(name)).await
    }

    pub fn download(&mut self, entry: &RemoteAttributes) {
        let destination = self.settings.download_dir.join(&entry.filename);
        let task = Task::download(
            self.remote_path(&entry.filename),
            destination.to_string_lossy(),
        )
        .with_attributes(entry.clone())
        .with_progress(self.progress.clone());
        self.transfers.submit(task);
    }

    /// Upload a local file or directory dropped onto the view, optionally
    /// onto the subdirectory `destination` of the current directory.
    pub fn external_drop(&mut self, local_path: &Path, destination: Option<&str>) {
        let Some(name) = local_path.file_name() else {
            warn!("Ignoring drop of {:?}", local_path);
            return;
        };
        let dir = match destination {
            Some(sub) => self.remote_path(sub),
            None => self.current_path.clone(),
        };
        let remote = join_remote(&dir, &name.to_string_lossy());

        let events = self.events.clone();
        let task = Task::upload(local_path.to_string_lossy(), remote)
            .with_progress(self.progress.clone())
            .on_complete(move |output| {
                if let Some(attrs) = &output.attributes {
                    let _ = events.send(SessionEvent::FileAdded {
                        dir: attrs.path.clone(),
                        attrs: attrs.clone(),
                    });
                }
            });
        self.transfers.submit(task);
    }

    pub fn make_dir(&mut self, name: &str) {
        let events = self.events.clone();
        let task = Task::make_dir(self.remote_path(name)).on_complete(move |output| {
            if let Some(attrs) = &output.attributes {
                let _ = events.send(SessionEvent::DirectoryCreated {
                    dir: attrs.path.clone(),
                    attrs: attrs.clone(),
                });
            }
        });
        self.transfers.submit(task);
    }

    /// Remove entries of the current directory; more than one needs confirming.
    pub fn remove(&mut self, entries: &[RemoteAttributes]) {
        if entries.len() > 1 {
            self.ask(
                format!("Do you want to remove {} items?", entries.len()),
                Continuation::RemoveEntries(entries.to_vec()),
            );
        } else {
            self.remove_entries(entries.to_vec());
        }
    }

    fn remove_entries(&mut self, entries: Vec<RemoteAttributes>) {
        for entry in entries {
            let events = self.events.clone();
            let task = Task::remove(self.remote_path(&entry.filename))
                .with_attributes(entry)
                .on_complete(move |output| {
                    let _ = events.send(SessionEvent::FileRemoved {
                        path: output.source.clone(),
                    });
                });
            self.transfers.submit(task);
        }
    }

    /// Rename `old` to `new` in the current directory. With `is_drop` the
    /// entry was dragged onto a subdirectory and `new` is `<subdir>/<name>`.
    pub async fn rename_file(&mut self, old: &str, new: &str, is_drop: bool) {
        let dir = self.current_path.clone();
        let old_path = join_remote(&dir, old);
        let new_path = join_remote(&dir, new);
        let (new_dir, new_name) = split_remote(&new_path);

        let generation = self.channel.generation();
        match self.channel.exists(&new_path).await {
            Ok(false) => {}
            Ok(true) => {
                self.ask(
                    "File already exists in destination directory.\n\n\
                     Click \"Yes\" if you wish to remove existing file and move",
                    Continuation::Rename {
                        old: old.to_string(),
                        new: new.to_string(),
                        is_drop,
                    },
                );
                return;
            }
            Err(e) => {
                if e.is_transport() {
                    self.transport_failed(generation, &e).await;
                } else {
                    error!("Failed to check {}: {}", new_path, e);
                }
                return;
            }
        }

        let renamed = match self.channel.acquire().await {
            Ok(channel) => channel.rename(&old_path, &new_path).await,
            Err(e) => Err(e),
        };
        match renamed {
            Ok(()) => {
                info!("File renamed from {} to {}", old, new);
                self.view.remove_file(old);
                if !is_drop {
                    match self.channel.attributes(&new_path).await {
                        Ok(attrs) => self.view.add_file(&attrs),
                        Err(e) => warn!("Failed to get file attrs {}", e),
                    }
                }
                self.thumbnails
                    .move_thumbnail(&dir, old, new_dir, new_name)
                    .await;
            }
            Err(e) => {
                warn!("Failed to rename file {}: {}", old, e);
                if e.is_transport() {
                    self.transport_failed(generation, &e).await;
                }
            }
        }
        self.view.refresh_thumbnail(new_name);
    }

    /// Directories are entered, files are downloaded and opened locally.
    pub async fn open_file(&mut self, entry: &RemoteAttributes) {
        let remote = self.remote_path(&entry.filename);
        if entry.is_dir() {
            self.change_directory(&remote).await;
            return;
        }

        let local = std::env::temp_dir()
            .join("remotesync")
            .join(&entry.filename);
        let events = self.events.clone();
        let task = Task::open(remote, local.to_string_lossy())
            .with_attributes(entry.clone())
            .with_progress(self.progress.clone())
            .on_complete(move |output| {
                let _ = events.send(SessionEvent::OpenReady {
                    path: PathBuf::from(&output.destination),
                });
            });
        self.transfers.submit(task);
    }

    /// Use the picture at `image` as the thumbnail of entry `name`.
    pub async fn set_thumbnail(&mut self, name: &str, image: &Path) -> bool {
        let dir = self.current_path.clone();
        let generation = self.channel.generation();
        match self.thumbnails.upload_thumbnail(&dir, name, image).await {
            Ok(()) => {
                self.view.refresh_thumbnail(name);
                true
            }
            Err(e) => {
                if e.is_transport() {
                    self.transport_failed(generation, &e).await;
                } else {
                    error!("Failed to upload thumbnail for {}: {}", name, e);
                }
                false
            }
        }
    }

    fn ask(&mut self, message: impl Into<String>, continuation: Continuation) {
        self.prompt(ConfirmRequest::new(message, continuation));
    }

    fn prompt(&mut self, request: ConfirmRequest) {
        self.prompter.confirm(&request);
        self.confirmations.insert(request.id, request.continuation);
    }

    pub async fn answer_confirmation(&mut self, id: Uuid, accepted: bool) {
        let Some(continuation) = self.confirmations.remove(&id) else {
            warn!("Answer to unknown confirmation {}", id);
            return;
        };
        if !accepted {
            debug!("Confirmation {} declined", id);
            return;
        }

        match continuation {
            Continuation::ReplaceLocalFile { path, then } => {
                let removed = match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
                    Ok(_) => tokio::fs::remove_file(&path).await,
                    Err(e) => Err(e),
                };
                match removed {
                    Ok(()) => self.transfers.submit(then),
                    Err(e) => error!("Could not remove {:?}: {}", path, e),
                }
            }
            Continuation::ReplaceRemoteEntry { path, then } => {
                let events = self.events.clone();
                self.transfers
                    .submit(Task::remove(path).on_complete(move |output| {
                        let _ = events.send(SessionEvent::FileRemoved {
                            path: output.source.clone(),
                        });
                    }));
                self.transfers.submit(then);
            }
            Continuation::Rename { old, new, is_drop } => {
                let target = self.remote_path(&new);
                let generation = self.channel.generation();
                let removed = match self.channel.acquire().await {
                    Ok(channel) => channel.remove(&target).await,
                    Err(e) => Err(e),
                };
                match removed {
                    Ok(()) => {
                        if !is_drop {
                            self.view.remove_file(&new);
                        }
                        self.rename_file(&old, &new, is_drop).await;
                    }
                    Err(e) if e.is_not_found() => self.rename_file(&old, &new, is_drop).await,
                    Err(e) if e.is_transport() => self.transport_failed(generation, &e).await,
                    Err(e) => error!("Failed to remove and rename file {}", e),
                }
            }
            Continuation::RemoveEntries(entries) => self.remove_entries(entries),
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectionLost => {
                if !self.channel.is_connected() {
                    self.reconnect();
                }
            }
            SessionEvent::ReconnectDue => {
                self.reconnect_scheduled = false;
                if self.channel.is_connected() {
                    debug!("Already connected, skipping reconnect");
                } else {
                    self.connect().await;
                }
            }
            SessionEvent::FileRemoved { path } => {
                let (dir, name) = split_remote(&path);
                if dir == self.current_path {
                    self.view.remove_file(name);
                }
            }
            SessionEvent::FileAdded { dir, attrs } => {
                if dir == self.current_path {
                    if attrs.is_dir() {
                        self.view.add_icon(&attrs, false);
                    } else {
                        self.view.add_file(&attrs);
                    }
                }
            }
            SessionEvent::DirectoryCreated { dir, attrs } => {
                if dir == self.current_path {
                    self.view.add_icon(&attrs, true);
                }
            }
            SessionEvent::OpenReady { path } => {
                if let Err(e) = self.opener.open(&path) {
                    error!("Failed to open {:?}: {}", path, e);
                }
            }
            SessionEvent::ConfirmationNeeded(request) => self.prompt(request),
            SessionEvent::ConfirmationAnswered { id, accepted } => {
                self.answer_confirmation(id, accepted).await
            }
            SessionEvent::HostKeyAnswered(trust) => {
                self.trust = trust;
                self.connect().await;
            }
            SessionEvent::CredentialsProvided(credentials) => {
                self.store_credentials(credentials);
                self.connect().await;
            }
        }
    }

    fn store_credentials(&mut self, credentials: Credentials) {
        if let Err(e) = self.connector.store_credentials(credentials) {
            error!("Failed to store credentials: {}", e);
        }
    }

    /// Apply events that are already waiting, without blocking.
    pub async fn process_pending_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    /// Apply events for as long as the session lives.
    pub async fn run(&mut self) {
        while let Some(event) = self.event_rx.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Apply events until no transfer, confirmation or reconnect is pending.
    pub async fn run_until_idle(&mut self) {
        loop {
            tokio::select! {
                biased;
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                },
                _ = self.transfers.wait_idle(),
                    if self.confirmations.is_empty() && !self.reconnect_scheduled => return,
            }
        }
    }

    /// Close the channel for good; a worker waiting for a reconnect gives up.
    pub async fn shutdown(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::FieldError;
    use crate::remote::FileKind;
    use crate::test_support::{MockChannel, MockConnector, RecordingPrompter, RecordingView};

    #[derive(Clone, Default)]
    struct RecordingOpener {
        opened: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl Opener for RecordingOpener {
        fn open(&mut self, path: &Path) -> std::io::Result<()> {
            self.opened.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    struct Fixture {
        session: SessionController<MockConnector>,
        mock: MockChannel,
        view: RecordingView,
        prompter: RecordingPrompter,
        attempts: Arc<Mutex<Vec<TrustDecision>>>,
        failures: Arc<Mutex<std::collections::VecDeque<ConnectError>>>,
        local: tempfile::TempDir,
    }

    fn fixture(mock: MockChannel) -> Fixture {
        let local = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_dir: local.path().join("cache"),
            download_dir: local.path().join("downloads"),
            default_remote: "/home".to_string(),
            reconnect_base_secs: 0,
            reconnect_step_ms: 5,
            progress_interval_ms: 0,
            ..Settings::default()
        };
        let connector = MockConnector::new(mock.clone());
        let attempts = Arc::clone(&connector.attempts);
        let failures = Arc::clone(&connector.failures);
        let view = RecordingView::default();
        let prompter = RecordingPrompter::default();
        let session = SessionController::new(
            connector,
            settings,
            Box::new(view.clone()),
            Box::new(prompter.clone()),
        );
        Fixture {
            session,
            mock,
            view,
            prompter,
            attempts,
            failures,
            local,
        }
    }

    fn home() -> MockChannel {
        let mock = MockChannel::new();
        mock.add_file("/home/f.txt", b"f", 1);
        mock.add_file("/home/g.txt", b"g", 1);
        mock.add_dir("/home/docs");
        mock
    }

    fn attrs(dir: &str, name: &str, kind: FileKind) -> RemoteAttributes {
        RemoteAttributes {
            filename: name.to_string(),
            size: 1,
            mtime: 1,
            atime: 1,
            mode: 0o100644,
            kind,
            path: dir.to_string(),
        }
    }

    /// Handle events until `done` holds.
    async fn drive<F>(session: &mut SessionController<MockConnector>, done: F)
    where
        F: Fn(&SessionController<MockConnector>) -> bool,
    {
        while !done(session) {
            let event = tokio::time::timeout(Duration::from_secs(5), session.event_rx.recv())
                .await
                .expect("timed out waiting for a session event")
                .expect("event channel closed");
            session.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn test_connect_lists_default_directory() {
        let mut f = fixture(home());
        assert!(f.session.connect().await);

        assert_eq!(f.session.current_path(), "/home");
        assert_eq!(f.session.base_path(), Some("/home"));
        assert_eq!(f.session.history().entries(), ["/home"]);
        assert_eq!(f.view.calls(), vec!["fill docs,f.txt,g.txt"]);
    }

    #[tokio::test]
    async fn test_missing_directory_falls_back_to_current() {
        let mut f = fixture(home());
        f.session.connect().await;

        assert!(f.session.change_directory("/home/nope").await);
        assert_eq!(f.session.current_path(), "/home");
        assert_eq!(f.session.history().entries(), ["/home"]);
    }

    #[tokio::test]
    async fn test_closed_channel_reconnects_and_replays_chdir() {
        let mut f = fixture(home());
        f.session.connect().await;
        f.mock
            .fail_next("chdir /home/docs", RemoteError::channel_closed());

        assert!(!f.session.change_directory("/home/docs").await);
        assert!(!f.session.is_connected());

        drive(&mut f.session, |s| s.current_path() == "/home/docs").await;

        assert!(f.session.is_connected());
        assert_eq!(f.session.reconnect_attempts, 0);
        assert_eq!(f.session.base_path(), Some("/home"));
        assert_eq!(f.session.history().entries(), ["/home", "/home/docs"]);
        assert_eq!(f.attempts.lock().unwrap().len(), 2);
        let chdirs = f
            .mock
            .log()
            .iter()
            .filter(|op| *op == "chdir /home/docs")
            .count();
        assert_eq!(chdirs, 2);
    }

    #[tokio::test]
    async fn test_reconnect_delay_grows_until_success() {
        let mut f = fixture(home());
        for _ in 0..3 {
            f.failures
                .lock()
                .unwrap()
                .push_back(ConnectError::ConnectionFailure("refused".into()));
        }

        assert!(!f.session.connect().await);
        assert_eq!(f.session.reconnect_attempts, 1);
        drive(&mut f.session, |s| s.is_connected()).await;

        assert_eq!(f.attempts.lock().unwrap().len(), 4);
        assert_eq!(f.session.reconnect_attempts, 0);
        assert_eq!(f.session.current_path(), "/home");
    }

    #[tokio::test]
    async fn test_go_back_and_forward() {
        let mut f = fixture(home());
        f.session.connect().await;
        f.session.change_directory("docs").await;

        assert!(f.session.go_back().await);
        assert_eq!(f.session.current_path(), "/home");
        assert!(!f.session.go_back().await);
        assert!(f.session.go_forward().await);
        assert_eq!(f.session.current_path(), "/home/docs");
        assert_eq!(f.session.history().entries(), ["/home", "/home/docs"]);
    }

    #[tokio::test]
    async fn test_rename_onto_existing_waits_for_confirmation() {
        let mut f = fixture(home());
        f.session.connect().await;
        f.mock.clear_log();

        f.session.rename_file("f.txt", "g.txt", false).await;
        assert!(!f.mock.log().iter().any(|op| op.starts_with("rename")));
        assert!(!f.mock.log().iter().any(|op| op.starts_with("remove")));

        let request = f.prompter.confirmations().pop().unwrap();
        assert!(request.message.contains("already exists"));
        f.session.answer_confirmation(request.id, true).await;

        let log = f.mock.log();
        let removed = log.iter().position(|op| op == "remove /home/g.txt").unwrap();
        let renamed = log
            .iter()
            .position(|op| op == "rename /home/f.txt /home/g.txt")
            .unwrap();
        assert!(removed < renamed);
        assert_eq!(f.mock.file("/home/g.txt").unwrap(), b"f");
        assert_eq!(f.session.pending_confirmations(), 0);
    }

    #[tokio::test]
    async fn test_declined_rename_changes_nothing() {
        let mut f = fixture(home());
        f.session.connect().await;

        f.session.rename_file("f.txt", "g.txt", false).await;
        let request = f.prompter.confirmations().pop().unwrap();
        f.session.answer_confirmation(request.id, false).await;

        assert_eq!(f.mock.file("/home/g.txt").unwrap(), b"g");
        assert!(f.mock.contains("/home/f.txt"));
    }

    #[tokio::test]
    async fn test_rename_updates_view_and_thumbnail() {
        let mock = home();
        mock.add_file("/home/.thumbnails/f.txt.jpg", b"t", 7);
        let mut f = fixture(mock);
        f.session.connect().await;

        f.session.rename_file("f.txt", "h.txt", false).await;

        let calls = f.view.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            ["remove_file f.txt", "add_file h.txt", "refresh_thumbnail h.txt"]
        );
        assert!(f.mock.contains("/home/.thumbnails/h.txt.jpg"));
        assert!(
            f.session
                .thumbnails
                .local_thumbnail("/home", "h.txt")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_drop_onto_subdirectory_moves_entry_out_of_view() {
        let mut f = fixture(home());
        f.session.connect().await;

        f.session.rename_file("f.txt", "docs/f.txt", true).await;

        assert!(f.mock.contains("/home/docs/f.txt"));
        let calls = f.view.calls();
        assert!(calls.contains(&"remove_file f.txt".to_string()));
        assert!(!calls.iter().any(|call| call.starts_with("add_file")));
        assert_eq!(calls.last().unwrap(), "refresh_thumbnail f.txt");
    }

    #[tokio::test]
    async fn test_remove_missing_entry_detaches_it() {
        let mut f = fixture(home());
        f.session.connect().await;

        f.session
            .remove(&[attrs("/home", "ghost.txt", FileKind::File)]);
        f.session.transfers.wait_idle().await;
        f.session.process_pending_events().await;

        assert!(f.view.calls().contains(&"remove_file ghost.txt".to_string()));
        assert!(f.prompter.confirmations().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_remove_needs_confirmation() {
        let mut f = fixture(home());
        f.session.connect().await;

        f.session.remove(&[
            attrs("/home", "f.txt", FileKind::File),
            attrs("/home", "docs", FileKind::Directory),
        ]);
        assert!(f.mock.contains("/home/f.txt"));

        let request = f.prompter.confirmations().pop().unwrap();
        f.session.answer_confirmation(request.id, true).await;
        f.session.transfers.wait_idle().await;
        f.session.process_pending_events().await;

        assert!(!f.mock.contains("/home/f.txt"));
        assert!(!f.mock.contains("/home/docs"));
        let calls = f.view.calls();
        assert!(calls.contains(&"remove_file f.txt".to_string()));
        assert!(calls.contains(&"remove_file docs".to_string()));
    }

    #[tokio::test]
    async fn test_make_dir_and_upload_reach_the_view() {
        let mut f = fixture(home());
        f.session.connect().await;
        let file = f.local.path().join("up.txt");
        fs::write(&file, b"up").unwrap();

        f.session.make_dir("new");
        f.session.external_drop(&file, None);
        f.session.external_drop(&file, Some("docs"));
        f.session.transfers.wait_idle().await;
        f.session.process_pending_events().await;

        let calls = f.view.calls();
        assert!(calls.contains(&"add_icon new true".to_string()));
        assert_eq!(
            calls.iter().filter(|call| *call == "add_file up.txt").count(),
            1
        );
        assert_eq!(f.mock.file("/home/docs/up.txt").unwrap(), b"up");
    }

    #[tokio::test]
    async fn test_walk_conflict_resumes_after_confirmation() {
        let mock = home();
        mock.add_file("/home/docs/a.txt", b"a", 1);
        mock.add_file("/home/docs/sub/b.txt", b"b", 1);
        let mut f = fixture(mock);
        f.session.connect().await;

        let blocked = f.local.path().join("downloads/docs/sub");
        fs::create_dir_all(blocked.parent().unwrap()).unwrap();
        fs::write(&blocked, b"in the way").unwrap();

        f.session
            .download(&attrs("/home", "docs", FileKind::Directory));
        drive(&mut f.session, |s| s.pending_confirmations() == 1).await;

        let request = f.prompter.confirmations().pop().unwrap();
        assert!(request.message.contains("it is a file"));
        f.session.answer_confirmation(request.id, true).await;
        f.session.run_until_idle().await;

        let downloads = f.local.path().join("downloads/docs");
        assert_eq!(fs::read(downloads.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(downloads.join("sub/b.txt")).unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_accepted_upload_conflict_replaces_remote_file() {
        let mock = home();
        mock.add_file("/home/up", b"old", 1);
        let mut f = fixture(mock);
        f.session.connect().await;
        let up = f.local.path().join("up");
        fs::create_dir_all(&up).unwrap();
        fs::write(up.join("x.txt"), b"x").unwrap();

        f.session.external_drop(&up, None);
        drive(&mut f.session, |s| s.pending_confirmations() == 1).await;
        assert!(f.mock.file("/home/up").is_some());

        let request = f.prompter.confirmations().pop().unwrap();
        assert!(request.message.contains("it is a file"));
        f.session.answer_confirmation(request.id, true).await;
        f.session.run_until_idle().await;

        let log = f.mock.log();
        let removed = log.iter().position(|op| op == "remove /home/up").unwrap();
        let created = log.iter().position(|op| op == "mkdir /home/up").unwrap();
        assert!(removed < created);
        assert_eq!(f.mock.file("/home/up/x.txt").unwrap(), b"x");
        let calls = f.view.calls();
        let detached = calls.iter().position(|call| call == "remove_file up").unwrap();
        let attached = calls.iter().position(|call| call == "add_icon up false").unwrap();
        assert!(detached < attached);
    }

    #[tokio::test]
    async fn test_set_thumbnail_refreshes_entry() {
        let mut f = fixture(home());
        f.session.connect().await;
        let image = f.local.path().join("f.jpg");
        fs::write(&image, b"jpeg").unwrap();

        assert!(f.session.set_thumbnail("f.txt", &image).await);

        assert_eq!(f.mock.file("/home/.thumbnails/f.txt.jpg").unwrap(), b"jpeg");
        assert_eq!(f.view.calls().last().unwrap(), "refresh_thumbnail f.txt");
        assert!(f.session.thumbnails.reconcile("/home").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_file_downloads_then_opens() {
        let mut f = fixture(home());
        let opener = RecordingOpener::default();
        let opened = Arc::clone(&opener.opened);
        f.session = f.session.with_opener(Box::new(opener));
        f.session.connect().await;

        f.session
            .open_file(&attrs("/home", "docs", FileKind::Directory))
            .await;
        assert_eq!(f.session.current_path(), "/home/docs");
        f.session.go_back().await;

        f.session
            .open_file(&attrs("/home", "f.txt", FileKind::File))
            .await;
        f.session.run_until_idle().await;

        let opened = opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(fs::read(&opened[0]).unwrap(), b"f");
    }

    #[tokio::test]
    async fn test_configuration_and_trust_errors_prompt() {
        let mut f = fixture(home());
        f.failures.lock().unwrap().push_back(ConnectError::InvalidConfig(vec![FieldError {
            field: "host",
            message: "Host cannot be empty".into(),
        }]));
        f.failures
            .lock()
            .unwrap()
            .push_back(ConnectError::HostKeyNotFound("fingerprint SHA256:abc".into()));

        assert!(!f.session.connect().await);
        let requests = f.prompter.credential_requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][0].field, "host");

        let credentials = Credentials::new("example.org".into(), 22, "alice".into(), "pw".into());
        f.session
            .handle_event(SessionEvent::CredentialsProvided(credentials))
            .await;
        assert!(!f.session.is_connected());
        assert_eq!(f.session.connector.stored.lock().unwrap().len(), 1);
        assert_eq!(
            f.prompter.host_keys.lock().unwrap().clone(),
            vec!["Host key not found: fingerprint SHA256:abc".to_string()]
        );

        f.session
            .handle_event(SessionEvent::HostKeyAnswered(TrustDecision::AcceptAndRemember))
            .await;
        assert!(f.session.is_connected());
        assert_eq!(
            *f.attempts.lock().unwrap(),
            vec![
                TrustDecision::Verify,
                TrustDecision::Verify,
                TrustDecision::AcceptAndRemember,
            ]
        );
    }

    #[tokio::test]
    async fn test_lost_connection_during_transfer_is_replayed() {
        let mut f = fixture(home());
        f.session.connect().await;
        f.mock.fail_next("get /home/f.txt", RemoteError::channel_closed());

        f.session.download(&attrs("/home", "f.txt", FileKind::File));
        f.session.run_until_idle().await;

        let downloaded = f.local.path().join("downloads/f.txt");
        assert_eq!(fs::read(downloaded).unwrap(), b"f");
        assert!(f.session.is_connected());
        assert_eq!(f.attempts.lock().unwrap().len(), 2);
    }
}
