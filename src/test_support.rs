//! In-memory doubles for the remote channel and the session collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use filetime::FileTime;

use crate::config::Credentials;
use crate::connection::{Connector, TrustDecision};
use crate::error::{ConnectError, FieldError, RemoteError, Result as AppResult};
use crate::events::ConfirmRequest;
use crate::remote::{FileKind, ProgressFn, RemoteAttributes, RemoteFs, join_remote, split_remote};
use crate::view::{FileView, Prompter};

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, mtime: u64 },
    Dir,
    Symlink,
}

#[derive(Default)]
struct MockState {
    tree: Mutex<BTreeMap<String, Entry>>,
    log: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<(String, RemoteError)>>,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
}

/// Clears the in-flight flag when the operation ends.
struct Flight(Arc<MockState>);

impl Drop for Flight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Remote filesystem kept in memory. Clones share the tree and the log but
/// each has its own current directory, like a fresh connection would.
#[derive(Clone)]
pub(crate) struct MockChannel {
    state: Arc<MockState>,
    cwd: String,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            cwd: "/".to_string(),
        }
    }

    fn insert_parents(tree: &mut BTreeMap<String, Entry>, path: &str) {
        let (parent, _) = split_remote(path);
        if parent.is_empty() || parent == "/" {
            return;
        }
        Self::insert_parents(tree, parent);
        tree.entry(parent.to_string()).or_insert(Entry::Dir);
    }

    fn insert(&self, path: &str, entry: Entry) {
        let mut tree = self.state.tree.lock().unwrap();
        Self::insert_parents(&mut tree, path);
        tree.insert(path.to_string(), entry);
    }

    pub fn add_dir(&self, path: &str) {
        self.insert(path, Entry::Dir);
    }

    pub fn add_file(&self, path: &str, data: &[u8], mtime: u64) {
        self.insert(
            path,
            Entry::File {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub fn add_symlink(&self, path: &str) {
        self.insert(path, Entry::Symlink);
    }

    /// Make the next operation whose log line starts with `prefix` fail.
    pub fn fail_next(&self, prefix: &str, error: RemoteError) {
        self.state
            .failures
            .lock()
            .unwrap()
            .push_back((prefix.to_string(), error));
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().unwrap().clear();
    }

    /// Number of times an operation started while another was in flight.
    pub fn overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.tree.lock().unwrap().contains_key(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.tree.lock().unwrap().get(path) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mtime(&self, path: &str) -> Option<u64> {
        match self.state.tree.lock().unwrap().get(path) {
            Some(Entry::File { mtime, .. }) => Some(*mtime),
            _ => None,
        }
    }

    fn resolve(&self, path: &str) -> String {
        let full = join_remote(&self.cwd, path);
        if full.len() > 1 {
            full.trim_end_matches('/').to_string()
        } else {
            full
        }
    }

    async fn begin(&self, op: String) -> Result<Flight, RemoteError> {
        if self.state.in_flight.swap(true, Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let flight = Flight(Arc::clone(&self.state));
        self.state.log.lock().unwrap().push(op.clone());
        tokio::task::yield_now().await;

        let mut failures = self.state.failures.lock().unwrap();
        if let Some(index) = failures.iter().position(|(prefix, _)| op.starts_with(prefix)) {
            if let Some((_, error)) = failures.remove(index) {
                return Err(error);
            }
        }
        Ok(flight)
    }

    fn entry(&self, path: &str) -> Option<Entry> {
        if path == "/" {
            return Some(Entry::Dir);
        }
        self.state.tree.lock().unwrap().get(path).cloned()
    }

    fn attributes_of(&self, path: &str) -> Result<RemoteAttributes, RemoteError> {
        let entry = self
            .entry(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        let (dir, name) = split_remote(path);
        let (kind, size, mtime, mode) = match entry {
            Entry::File { data, mtime } => (FileKind::File, data.len() as u64, mtime, 0o100644),
            Entry::Dir => (FileKind::Directory, 0, 0, 0o040755),
            Entry::Symlink => (FileKind::Symlink, 0, 0, 0o120777),
        };
        Ok(RemoteAttributes {
            filename: name.to_string(),
            size,
            mtime,
            atime: mtime,
            mode,
            kind,
            path: dir.to_string(),
        })
    }

    fn require_parent_dir(&self, path: &str) -> Result<(), RemoteError> {
        let (parent, _) = split_remote(path);
        match self.entry(if parent.is_empty() { "/" } else { parent }) {
            Some(Entry::Dir) => Ok(()),
            _ => Err(RemoteError::NotFound(parent.to_string())),
        }
    }
}

impl RemoteFs for MockChannel {
    fn current_directory(&self) -> String {
        self.cwd.clone()
    }

    async fn change_directory(&mut self, path: &str) -> Result<String, RemoteError> {
        let full = self.resolve(path);
        let _flight = self.begin(format!("chdir {full}")).await?;
        match self.entry(&full) {
            Some(Entry::Dir) => {
                self.cwd = full.clone();
                Ok(full)
            }
            Some(_) => Err(RemoteError::Other(format!("{full} is not a directory"))),
            None => Err(RemoteError::NotFound(full)),
        }
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteAttributes>, RemoteError> {
        let dir = self.resolve(path);
        let _flight = self.begin(format!("list {dir}")).await?;
        match self.entry(&dir) {
            Some(Entry::Dir) => {}
            Some(_) => return Err(RemoteError::Other(format!("{dir} is not a directory"))),
            None => return Err(RemoteError::NotFound(dir)),
        }
        let children: Vec<String> = self
            .state
            .tree
            .lock()
            .unwrap()
            .keys()
            .filter(|key| {
                let (parent, _) = split_remote(key);
                parent == dir
            })
            .cloned()
            .collect();
        children.iter().map(|child| self.attributes_of(child)).collect()
    }

    async fn attributes(&self, path: &str) -> Result<RemoteAttributes, RemoteError> {
        let full = self.resolve(path);
        let _flight = self.begin(format!("stat {full}")).await?;
        self.attributes_of(&full)
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        let full = self.resolve(path);
        let _flight = self.begin(format!("exists {full}")).await?;
        Ok(self.entry(&full).is_some())
    }

    async fn remove(&self, path: &str) -> Result<(), RemoteError> {
        let full = self.resolve(path);
        let _flight = self.begin(format!("remove {full}")).await?;
        let mut tree = self.state.tree.lock().unwrap();
        match tree.get(&full) {
            Some(Entry::Dir) => Err(RemoteError::Other(format!("{full} is a directory"))),
            Some(_) => {
                tree.remove(&full);
                Ok(())
            }
            None => Err(RemoteError::NotFound(full)),
        }
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), RemoteError> {
        let old = self.resolve(old);
        let new = self.resolve(new);
        let _flight = self.begin(format!("rename {old} {new}")).await?;
        let mut tree = self.state.tree.lock().unwrap();
        if tree.contains_key(&new) {
            return Err(RemoteError::Other(format!("{new} already exists")));
        }
        let moved: Vec<String> = tree
            .keys()
            .filter(|key| **key == old || key.starts_with(&format!("{old}/")))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(RemoteError::NotFound(old));
        }
        for key in moved {
            if let Some(entry) = tree.remove(&key) {
                tree.insert(format!("{new}{}", &key[old.len()..]), entry);
            }
        }
        Ok(())
    }

    async fn make_directory(&self, path: &str) -> Result<(), RemoteError> {
        let full = self.resolve(path);
        let _flight = self.begin(format!("mkdir {full}")).await?;
        self.require_parent_dir(&full)?;
        let mut tree = self.state.tree.lock().unwrap();
        if tree.contains_key(&full) {
            return Err(RemoteError::AlreadyExists(full));
        }
        tree.insert(full, Entry::Dir);
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> Result<(), RemoteError> {
        let full = self.resolve(path);
        let _flight = self.begin(format!("rmdir {full}")).await?;
        let mut tree = self.state.tree.lock().unwrap();
        if !matches!(tree.get(&full), Some(Entry::Dir)) {
            return Err(RemoteError::NotFound(full));
        }
        let prefix = format!("{full}/");
        if tree.keys().any(|key| key.starts_with(&prefix)) {
            return Err(RemoteError::Other(format!("{full} is not empty")));
        }
        tree.remove(&full);
        Ok(())
    }

    async fn get(
        &self,
        remote: &str,
        local: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let full = self.resolve(remote);
        let _flight = self.begin(format!("get {full}")).await?;
        let data = match self.entry(&full) {
            Some(Entry::File { data, .. }) => data,
            Some(_) => return Err(RemoteError::Other(format!("{full} is not a file"))),
            None => return Err(RemoteError::NotFound(full)),
        };
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let total = data.len() as u64;
        progress(0, total);
        std::fs::write(local, &data)?;
        progress(total, total);
        Ok(total)
    }

    async fn put(
        &self,
        local: &Path,
        remote: &str,
        preserve_mtime: bool,
        progress: ProgressFn<'_>,
    ) -> Result<u64, RemoteError> {
        let full = self.resolve(remote);
        let _flight = self.begin(format!("put {full}")).await?;
        self.require_parent_dir(&full)?;
        if matches!(self.entry(&full), Some(Entry::Dir)) {
            return Err(RemoteError::Other(format!("{full} is a directory")));
        }
        let data = std::fs::read(local)?;
        let mtime = if preserve_mtime {
            let meta = std::fs::metadata(local)?;
            FileTime::from_last_modification_time(&meta).unix_seconds() as u64
        } else {
            0
        };
        let total = data.len() as u64;
        progress(0, total);
        self.state
            .tree
            .lock()
            .unwrap()
            .insert(full, Entry::File { data, mtime });
        progress(total, total);
        Ok(total)
    }
}

/// Hands out clones of one [`MockChannel`], optionally failing first.
pub(crate) struct MockConnector {
    pub channel: MockChannel,
    pub failures: Arc<Mutex<VecDeque<ConnectError>>>,
    pub attempts: Arc<Mutex<Vec<TrustDecision>>>,
    pub stored: Arc<Mutex<Vec<Credentials>>>,
}

impl MockConnector {
    pub fn new(channel: MockChannel) -> Self {
        Self {
            channel,
            failures: Arc::default(),
            attempts: Arc::default(),
            stored: Arc::default(),
        }
    }
}

impl Connector for MockConnector {
    type Channel = MockChannel;

    async fn connect(&mut self, trust: TrustDecision) -> Result<MockChannel, ConnectError> {
        self.attempts.lock().unwrap().push(trust);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut channel = self.channel.clone();
        channel.cwd = "/".to_string();
        Ok(channel)
    }

    fn store_credentials(&mut self, credentials: Credentials) -> AppResult<()> {
        self.stored.lock().unwrap().push(credentials);
        Ok(())
    }
}

/// Every call a [`FileView`] receives, in order.
#[derive(Clone, Default)]
pub(crate) struct RecordingView {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingView {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl FileView for RecordingView {
    fn fill(&mut self, entries: &[RemoteAttributes]) {
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        self.record(format!("fill {}", names.join(",")));
    }

    fn add_icon(&mut self, attrs: &RemoteAttributes, is_new_dir: bool) {
        self.record(format!("add_icon {} {}", attrs.filename, is_new_dir));
    }

    fn add_file(&mut self, attrs: &RemoteAttributes) {
        self.record(format!("add_file {}", attrs.filename));
    }

    fn remove_file(&mut self, name: &str) {
        self.record(format!("remove_file {name}"));
    }

    fn refresh_thumbnail(&mut self, name: &str) {
        self.record(format!("refresh_thumbnail {name}"));
    }
}

/// Remembers every question; tests answer through the controller.
#[derive(Clone, Default)]
pub(crate) struct RecordingPrompter {
    pub confirmations: Arc<Mutex<Vec<ConfirmRequest>>>,
    pub host_keys: Arc<Mutex<Vec<String>>>,
    pub credential_requests: Arc<Mutex<Vec<Vec<FieldError>>>>,
}

impl RecordingPrompter {
    pub fn confirmations(&self) -> Vec<ConfirmRequest> {
        self.confirmations.lock().unwrap().clone()
    }
}

impl Prompter for RecordingPrompter {
    fn confirm(&mut self, request: &ConfirmRequest) {
        self.confirmations.lock().unwrap().push(request.clone());
    }

    fn request_credentials(&mut self, errors: &[FieldError]) {
        self.credential_requests
            .lock()
            .unwrap()
            .push(errors.to_vec());
    }

    fn host_key(&mut self, message: &str) {
        self.host_keys.lock().unwrap().push(message.to_string());
    }
}
