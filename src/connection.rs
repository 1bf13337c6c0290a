use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::MethodKind;
use russh_sftp::client::SftpSession;
use tracing::{debug, info, warn};

use crate::config::{ConfigManager, Credentials, Settings};
use crate::error::{ConnectError, Result as AppResult};
use crate::remote::{RemoteFs, SftpChannel};

/// How to treat a host key that is not already trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustDecision {
    /// Only keys recorded in known_hosts are accepted.
    #[default]
    Verify,
    /// Accept an unknown key and append it to known_hosts.
    AcceptAndRemember,
    /// Accept whatever the server presents for this connection only.
    AcceptOnce,
}

pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: PathBuf,
    trust: TrustDecision,
}

impl client::Handler for ClientHandler {
    type Error = ConnectError;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        match keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts,
        ) {
            Ok(true) => Ok(true),
            Ok(false) => match self.trust {
                TrustDecision::Verify => Err(ConnectError::HostKeyNotFound(format!(
                    "The authenticity of host '{}:{}' can't be established.\nKey fingerprint is {}.",
                    self.host, self.port, fingerprint
                ))),
                TrustDecision::AcceptAndRemember => {
                    keys::known_hosts::learn_known_hosts_path(
                        &self.host,
                        self.port,
                        server_public_key,
                        &self.known_hosts,
                    )
                    .map_err(|e| ConnectError::ConnectionFailure(e.to_string()))?;
                    info!("Added {} to {:?}", self.host, self.known_hosts);
                    Ok(true)
                }
                TrustDecision::AcceptOnce => Ok(true),
            },
            Err(keys::Error::KeyChanged { line }) => match self.trust {
                TrustDecision::AcceptOnce => {
                    warn!("Accepting changed host key for {} once", self.host);
                    Ok(true)
                }
                _ => Err(ConnectError::HostKeyMismatch(format!(
                    "The host key for '{}' has changed (known_hosts line {}).\nNew key fingerprint is {}.",
                    self.host, line, fingerprint
                ))),
            },
            Err(e) => Err(ConnectError::ConnectionFailure(e.to_string())),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

async fn authenticate(
    session: &mut client::Handle<ClientHandler>,
    credentials: &Credentials,
) -> std::result::Result<(), ConnectError> {
    let username = credentials.username.as_str();

    if let Some(key_path) = &credentials.private_key_path {
        let algo = session.best_supported_rsa_hash().await?.flatten();
        let passphrase = (!credentials.password.is_empty()).then_some(credentials.password.as_str());
        let private_key = keys::load_secret_key(expand_home(key_path), passphrase)
            .map_err(|e| ConnectError::ConnectionFailure(e.to_string()))?;
        let auth_result = session
            .authenticate_publickey(
                username,
                PrivateKeyWithHashAlg::new(Arc::new(private_key), algo),
            )
            .await?;
        return if auth_result.success() {
            Ok(())
        } else {
            Err(ConnectError::ConnectionFailure(
                "Public key authentication failed".to_string(),
            ))
        };
    }

    let mut interactive = false;
    if let AuthResult::Failure {
        remaining_methods, ..
    } = session.authenticate_none(username).await?
    {
        interactive = remaining_methods.contains(&MethodKind::KeyboardInteractive)
            && !remaining_methods.contains(&MethodKind::Password);
    }

    if !interactive {
        let auth_result = session
            .authenticate_password(username, &credentials.password)
            .await?;
        return if auth_result.success() {
            Ok(())
        } else {
            Err(ConnectError::ConnectionFailure(
                "Password authentication failed".to_string(),
            ))
        };
    }

    let mut response = session
        .authenticate_keyboard_interactive_start(username, None)
        .await?;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(()),
            KeyboardInteractiveAuthResponse::Failure { .. } => {
                return Err(ConnectError::ConnectionFailure(
                    "Keyboard-interactive authentication failed".to_string(),
                ));
            }
            KeyboardInteractiveAuthResponse::InfoRequest { ref prompts, .. } => {
                let answers = prompts
                    .iter()
                    .map(|_| credentials.password.clone())
                    .collect();
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await?;
            }
        }
    }
}

/// Open an SSH connection and the `sftp` subsystem on it.
pub async fn connect(
    credentials: &Credentials,
    settings: &Settings,
    trust: TrustDecision,
) -> std::result::Result<SftpChannel, ConnectError> {
    credentials
        .validate()
        .map_err(ConnectError::InvalidConfig)?;

    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let handler = ClientHandler {
        host: credentials.host.clone(),
        port: credentials.port,
        known_hosts: settings.known_hosts.clone(),
        trust,
    };

    info!("Connecting to {}", credentials.host_port());
    let timeout = Duration::from_secs(settings.connection_timeout);
    let mut session = tokio::time::timeout(
        timeout,
        client::connect(config, (credentials.host.as_str(), credentials.port), handler),
    )
    .await
    .map_err(|_| {
        ConnectError::ConnectionFailure(format!(
            "Timed out connecting to {}",
            credentials.host_port()
        ))
    })??;

    authenticate(&mut session, credentials).await?;

    let channel = session.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    let sftp = SftpSession::new(channel.into_stream()).await?;
    let home = sftp.canonicalize(".").await?;
    debug!("SFTP session ready, home is {}", home);

    Ok(SftpChannel::new(sftp, session, home))
}

/// Produces fresh channels for the session controller.
pub trait Connector: Send + 'static {
    type Channel: RemoteFs;

    fn connect(
        &mut self,
        trust: TrustDecision,
    ) -> impl Future<Output = std::result::Result<Self::Channel, ConnectError>> + Send;

    /// Persist credentials entered by the user after a configuration error.
    fn store_credentials(&mut self, credentials: Credentials) -> AppResult<()>;
}

/// Reads the configuration file on every attempt so edits apply on reconnect.
pub struct SftpConnector {
    config_path: Option<PathBuf>,
}

impl SftpConnector {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    fn manager(&self) -> AppResult<ConfigManager> {
        match &self.config_path {
            Some(path) => ConfigManager::with_path(path),
            None => ConfigManager::new(),
        }
    }
}

impl Connector for SftpConnector {
    type Channel = SftpChannel;

    async fn connect(
        &mut self,
        trust: TrustDecision,
    ) -> std::result::Result<SftpChannel, ConnectError> {
        let mut manager = self.manager().map_err(|e| {
            warn!("Failed to load configuration: {}", e);
            ConnectError::ConfigNotFound
        })?;
        let credentials = manager.credentials()?;
        let channel = connect(&credentials, manager.settings(), trust).await?;

        if let Err(e) = manager.touch_last_used() {
            warn!("Failed to record last use of credentials: {}", e);
        }
        Ok(channel)
    }

    fn store_credentials(&mut self, credentials: Credentials) -> AppResult<()> {
        self.manager()?.set_credentials(credentials)
    }
}
