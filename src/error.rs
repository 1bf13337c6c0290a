use std::fmt;

use thiserror::Error;

/// Error categories a caller reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid credentials, needs human input.
    Configuration,
    /// Unknown or mismatched host key, needs a human decision.
    Trust,
    /// Channel closed or connection reset, recoverable by reconnecting.
    Transport,
    NotFound,
    /// Destination exists or has the wrong type.
    Conflict,
    Unknown,
}

/// Error of a single remote (or local, during a transfer) file operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Transport(_) => ErrorKind::Transport,
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::AlreadyExists(_) => ErrorKind::Conflict,
            RemoteError::PermissionDenied(_) | RemoteError::Io(_) | RemoteError::Other(_) => {
                ErrorKind::Unknown
            }
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn channel_closed() -> Self {
        RemoteError::Transport("Socket is closed".to_string())
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::BrokenPipe
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::UnexpectedEof => RemoteError::Transport(err.to_string()),
            Io::NotFound => RemoteError::NotFound(err.to_string()),
            Io::AlreadyExists => RemoteError::AlreadyExists(err.to_string()),
            Io::PermissionDenied => RemoteError::PermissionDenied(err.to_string()),
            _ => RemoteError::Io(err),
        }
    }
}

impl From<russh_sftp::client::error::Error> for RemoteError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as Sftp;
        use russh_sftp::protocol::StatusCode;

        match err {
            Sftp::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => RemoteError::NotFound(status.error_message),
                StatusCode::PermissionDenied => RemoteError::PermissionDenied(status.error_message),
                StatusCode::NoConnection | StatusCode::ConnectionLost => {
                    RemoteError::Transport(status.error_message)
                }
                _ => RemoteError::Other(status.error_message),
            },
            Sftp::IO(msg) => RemoteError::Transport(msg),
            Sftp::Timeout => RemoteError::Transport("SFTP request timed out".to_string()),
            other => RemoteError::Other(other.to_string()),
        }
    }
}

/// A single invalid credential field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection config not found")]
    ConfigNotFound,

    #[error("Invalid connection config: {}", format_fields(.0))]
    InvalidConfig(Vec<FieldError>),

    #[error("Host key not found: {0}")]
    HostKeyNotFound(String),

    #[error("Host key mismatch: {0}")]
    HostKeyMismatch(String),

    #[error("Connection failed: {0}")]
    ConnectionFailure(String),
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::ConfigNotFound | ConnectError::InvalidConfig(_) => {
                ErrorKind::Configuration
            }
            ConnectError::HostKeyNotFound(_) | ConnectError::HostKeyMismatch(_) => ErrorKind::Trust,
            ConnectError::ConnectionFailure(_) => ErrorKind::Transport,
        }
    }
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<russh::Error> for ConnectError {
    fn from(err: russh::Error) -> Self {
        ConnectError::ConnectionFailure(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for ConnectError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        ConnectError::ConnectionFailure(err.to_string())
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        ConnectError::ConnectionFailure(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;
