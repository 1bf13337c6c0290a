mod config;
mod connection;
mod error;
mod events;
mod history;
mod remote;
mod session;
mod thumbnails;
mod transfer;
mod utils;
mod view;
mod walk;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{Config, ConfigManager, Credentials, Settings};
pub use connection::{ClientHandler, Connector, SftpConnector, TrustDecision, connect};
pub use error::{AppError, ConnectError, ErrorKind, FieldError, RemoteError, Result};
pub use events::{ConfirmRequest, Continuation, SessionEvent};
pub use history::NavigationHistory;
pub use remote::{
    FileKind, RemoteAttributes, RemoteFs, SftpChannel, SharedChannel, TreeVisitor, WalkControl,
    join_remote, split_remote,
};
pub use session::SessionController;
pub use thumbnails::ThumbnailSync;
pub use transfer::{
    ProgressEvent, ProgressSink, Submitter, Task, TaskKind, TaskOutput, TransferManager,
    TransferProgress,
};
pub use utils::{LOG_FILE, format_size, init_tracing};
pub use view::{FileView, Opener, Prompter, SystemOpener};
