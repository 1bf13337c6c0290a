//! Seams to the user-facing side: the file view, prompts and the platform opener.

use std::io;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::FieldError;
use crate::events::ConfirmRequest;
use crate::remote::RemoteAttributes;

/// Displays the current remote directory.
pub trait FileView: Send {
    fn fill(&mut self, entries: &[RemoteAttributes]);
    fn add_icon(&mut self, attrs: &RemoteAttributes, is_new_dir: bool);
    fn add_file(&mut self, attrs: &RemoteAttributes);
    fn remove_file(&mut self, name: &str);
    fn refresh_thumbnail(&mut self, name: &str);
}

/// Questions for the user.
///
/// Answers come back asynchronously as session events
/// (`ConfirmationAnswered`, `CredentialsProvided`, `HostKeyAnswered`).
pub trait Prompter: Send {
    fn confirm(&mut self, request: &ConfirmRequest);
    fn request_credentials(&mut self, errors: &[FieldError]);
    fn host_key(&mut self, message: &str);
}

pub trait Opener: Send {
    fn open(&mut self, path: &Path) -> io::Result<()>;
}

/// Hands files to the desktop's default application.
#[derive(Debug, Default)]
pub struct SystemOpener;

impl Opener for SystemOpener {
    fn open(&mut self, path: &Path) -> io::Result<()> {
        debug!("Opening {:?}", path);
        let mut command = if cfg!(target_os = "windows") {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", ""]);
            command
        } else if cfg!(target_os = "macos") {
            Command::new("open")
        } else {
            Command::new("xdg-open")
        };
        command.arg(path).spawn()?;
        Ok(())
    }
}
