use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use remotesync::{
    AppError, ConfigManager, ConfirmRequest, Credentials, FieldError, FileView, ProgressEvent,
    Prompter, RemoteAttributes, SessionController, SessionEvent, Settings, SftpConnector,
    TrustDecision, format_size, init_tracing,
};

#[derive(Parser)]
#[command(name = "remotesync")]
#[command(about = "Browse and sync a remote directory over SFTP")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for remotesync.log
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,

    /// Trust and remember an unknown host key without asking
    #[arg(long)]
    accept_host_key: bool,

    /// Remote directory to run the command in
    #[arg(short = 'C', long)]
    dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    Ls { path: Option<String> },
    /// Download files or directories into the download directory
    Get { names: Vec<String> },
    /// Upload local files or directories
    Put {
        files: Vec<PathBuf>,
        /// Subdirectory of the remote directory to upload into
        #[arg(long)]
        into: Option<String>,
    },
    /// Remove remote entries, directories included
    Rm { names: Vec<String> },
    Mkdir { name: String },
    /// Rename an entry, or move it into a subdirectory with `sub/name`
    Mv { old: String, new: String },
    /// Download a file and open it with the default application
    Open { name: String },
    /// Upload a ready-made JPEG as the thumbnail of an entry
    Thumb { name: String, image: PathBuf },
}

/// Prints what the session shows.
struct ConsoleView {
    show_listing: Arc<AtomicBool>,
}

fn describe(attrs: &RemoteAttributes) -> String {
    let modified = DateTime::from_timestamp(attrs.mtime as i64, 0)
        .map(|time| {
            time.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_default();
    let marker = if attrs.is_dir() { "/" } else { "" };
    format!(
        "{:>10}  {}  {}{}",
        format_size(attrs.size),
        modified,
        attrs.filename,
        marker
    )
}

impl FileView for ConsoleView {
    fn fill(&mut self, entries: &[RemoteAttributes]) {
        if !self.show_listing.load(Ordering::Relaxed) {
            return;
        }
        for entry in entries {
            println!("{}", describe(entry));
        }
    }

    fn add_icon(&mut self, attrs: &RemoteAttributes, _is_new_dir: bool) {
        println!("+ {}/", attrs.filename);
    }

    fn add_file(&mut self, attrs: &RemoteAttributes) {
        println!("+ {}", describe(attrs));
    }

    fn remove_file(&mut self, name: &str) {
        println!("- {}", name);
    }

    fn refresh_thumbnail(&mut self, name: &str) {
        info!("Thumbnail of {} refreshed", name);
    }
}

/// Asks on the terminal and answers through the session's event sender.
struct StdinPrompter {
    reply: Arc<OnceLock<UnboundedSender<SessionEvent>>>,
    accept_host_key: bool,
}

impl StdinPrompter {
    fn send(&self, event: SessionEvent) {
        match self.reply.get() {
            Some(reply) => {
                let _ = reply.send(event);
            }
            None => warn!("Answer dropped, session not ready"),
        }
    }
}

/// Blocks on stdin after handing the runtime worker off.
fn ask(question: &str) -> Option<String> {
    tokio::task::block_in_place(|| {
        print!("{}", question);
        io::stdout().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
}

fn is_yes(answer: Option<String>) -> bool {
    matches!(answer.as_deref(), Some("y" | "Y" | "yes"))
}

impl Prompter for StdinPrompter {
    fn confirm(&mut self, request: &ConfirmRequest) {
        println!("{}", request.message);
        let accepted = is_yes(ask("Continue? [y/N] "));
        self.send(SessionEvent::ConfirmationAnswered {
            id: request.id,
            accepted,
        });
    }

    fn request_credentials(&mut self, errors: &[FieldError]) {
        for error in errors {
            eprintln!("{}", error);
        }
        println!("Connection details needed");
        let Some(host) = ask("Host: ") else { return };
        let port = ask("Port [22]: ")
            .and_then(|port| port.parse().ok())
            .unwrap_or(22);
        let Some(username) = ask("Username: ") else {
            return;
        };
        let Some(password) = ask("Password: ") else {
            return;
        };
        self.send(SessionEvent::CredentialsProvided(Credentials::new(
            host, port, username, password,
        )));
    }

    fn host_key(&mut self, message: &str) {
        println!("{}", message);
        let trust = if self.accept_host_key {
            TrustDecision::AcceptAndRemember
        } else {
            match ask("Trust this host? [y]es / [o]nce / [N]o ").as_deref() {
                Some("y" | "Y" | "yes") => TrustDecision::AcceptAndRemember,
                Some("o" | "once") => TrustDecision::AcceptOnce,
                _ => return,
            }
        };
        self.send(SessionEvent::HostKeyAnswered(trust));
    }
}

fn spawn_progress_printer(mut progress: UnboundedReceiver<ProgressEvent>) {
    tokio::spawn(async move {
        while let Some(event) = progress.recv().await {
            match event {
                ProgressEvent::Started {
                    kind,
                    source,
                    destination,
                } => eprintln!("{:?} {} -> {}", kind, source, destination),
                ProgressEvent::Progress(progress) => eprint!(
                    "\r{:>5.1}% {}",
                    progress.ratio() * 100.0,
                    format_size(progress.transferred)
                ),
                ProgressEvent::Stopped => eprintln!(),
            }
        }
    });
}

fn load_settings(config: Option<&PathBuf>) -> Settings {
    let manager = match config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };
    match manager {
        Ok(manager) => manager.settings().clone(),
        Err(e) => {
            warn!("Using default settings: {}", e);
            Settings::default()
        }
    }
}

async fn entries(
    session: &SessionController<SftpConnector>,
    names: &[String],
) -> remotesync::Result<Vec<RemoteAttributes>> {
    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        entries.push(session.entry(name).await?);
    }
    Ok(entries)
}

#[tokio::main]
async fn main() -> remotesync::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, &cli.log_dir)?;

    let settings = load_settings(cli.config.as_ref());
    let reply = Arc::new(OnceLock::new());
    let prompter = StdinPrompter {
        reply: Arc::clone(&reply),
        accept_host_key: cli.accept_host_key,
    };
    // Only `ls` prints listings, and only the one it asked for
    let show_listing = Arc::new(AtomicBool::new(false));
    let view = ConsoleView {
        show_listing: Arc::clone(&show_listing),
    };
    let (progress, progress_rx) = mpsc::unbounded_channel();
    spawn_progress_printer(progress_rx);

    let mut session = SessionController::new(
        SftpConnector::new(cli.config.clone()),
        settings,
        Box::new(view),
        Box::new(prompter),
    )
    .with_progress(Arc::new(progress));
    let _ = reply.set(session.event_sender());

    if !session.connect().await {
        session.run_until_idle().await;
    }
    if !session.is_connected() {
        return Err(AppError::ConfigError("Not connected".to_string()));
    }
    info!("Session started in {}", session.current_path());

    if let Some(dir) = &cli.dir {
        if !session.change_directory(dir).await {
            return Err(AppError::ValidationError(format!("Cannot enter {}", dir)));
        }
    }

    match &cli.command {
        Commands::Ls { path } => {
            show_listing.store(true, Ordering::Relaxed);
            match path {
                Some(path) => session.change_directory(path).await,
                None => session.list_directory().await,
            };
        }
        Commands::Get { names } => {
            for entry in entries(&session, names).await? {
                session.download(&entry);
            }
        }
        Commands::Put { files, into } => {
            for file in files {
                session.external_drop(file, into.as_deref());
            }
        }
        Commands::Rm { names } => {
            let entries = entries(&session, names).await?;
            session.remove(&entries);
        }
        Commands::Mkdir { name } => session.make_dir(name),
        Commands::Mv { old, new } => {
            session.rename_file(old, new, new.contains('/')).await;
        }
        Commands::Open { name } => {
            let entry = session.entry(name).await?;
            session.open_file(&entry).await;
        }
        Commands::Thumb { name, image } => {
            session.entry(name).await?;
            session.set_thumbnail(name, image).await;
        }
    }

    session.run_until_idle().await;
    session.shutdown().await;
    Ok(())
}
