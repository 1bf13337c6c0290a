use std::path::PathBuf;

use uuid::Uuid;

use crate::config::Credentials;
use crate::connection::TrustDecision;
use crate::remote::RemoteAttributes;
use crate::transfer::Task;

/// An operation paused until the user answers a confirmation.
#[derive(Debug, Clone)]
pub enum Continuation {
    /// A local entry of the wrong type blocks a download.
    ReplaceLocalFile { path: PathBuf, then: Task },
    /// A remote entry of the wrong type blocks an upload.
    ReplaceRemoteEntry { path: String, then: Task },
    /// Rename onto an existing name in the current directory.
    Rename {
        old: String,
        new: String,
        is_drop: bool,
    },
    RemoveEntries(Vec<RemoteAttributes>),
}

#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub id: Uuid,
    pub message: String,
    pub continuation: Continuation,
}

impl ConfirmRequest {
    pub fn new(message: impl Into<String>, continuation: Continuation) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            continuation,
        }
    }
}

/// Everything background work reports back to the session controller.
#[derive(Debug)]
pub enum SessionEvent {
    /// A protocol call failed with a transport error.
    ConnectionLost,
    /// The reconnect delay has elapsed.
    ReconnectDue,
    /// Remote entry is gone, by removal or because it never existed.
    FileRemoved { path: String },
    FileAdded {
        dir: String,
        attrs: RemoteAttributes,
    },
    DirectoryCreated {
        dir: String,
        attrs: RemoteAttributes,
    },
    /// Downloaded copy is ready for the platform opener.
    OpenReady { path: PathBuf },
    ConfirmationNeeded(ConfirmRequest),
    ConfirmationAnswered { id: Uuid, accepted: bool },
    HostKeyAnswered(TrustDecision),
    CredentialsProvided(Credentials),
}
