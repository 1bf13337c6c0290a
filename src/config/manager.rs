use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::encryption::SecretBox;
use crate::error::{AppError, ConnectError, FieldError, Result};

fn serialize_password<S>(plain: &str, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let sealed = SecretBox::new()
        .seal(plain)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&sealed)
}

fn deserialize_password<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let sealed = String::deserialize(deserializer)?;
    if sealed.is_empty() {
        return Ok(sealed);
    }
    SecretBox::new()
        .open(&sealed)
        .map_err(serde::de::Error::custom)
}

fn default_port() -> u16 {
    22
}

/// Login data for the remote host.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Credentials {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(
        default,
        alias = "encrypted_password",
        serialize_with = "serialize_password",
        deserialize_with = "deserialize_password"
    )]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        Self {
            host,
            port,
            username,
            password,
            private_key_path: None,
            created_at: Utc::now(),
            last_used: None,
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Collects every invalid field instead of stopping at the first one.
    pub fn validate(&self) -> std::result::Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push(FieldError {
                field: "host",
                message: "Host cannot be empty".to_string(),
            });
        }
        if self.port == 0 {
            errors.push(FieldError {
                field: "port",
                message: "Port must be greater than 0".to_string(),
            });
        }
        if self.username.trim().is_empty() {
            errors.push(FieldError {
                field: "username",
                message: "Username cannot be empty".to_string(),
            });
        }
        if self.password.trim().is_empty() && self.private_key_path.is_none() {
            errors.push(FieldError {
                field: "password",
                message: "Password or private key is required".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn update_last_used(&mut self) {
        self.last_used = Some(Utc::now());
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("remotesync")
        .join("thumbnails")
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_known_hosts() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("known_hosts")
}

/// Application settings
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    pub thumbnails: bool,
    pub thumb_dir: String,
    pub cache_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Remote directory entered right after login.
    pub default_remote: String,
    pub known_hosts: PathBuf,
    pub reconnect_base_secs: u64,
    pub reconnect_step_ms: u64,
    pub progress_interval_ms: u64,
    pub connection_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thumbnails: true,
            thumb_dir: ".thumbnails".to_string(),
            cache_dir: default_cache_dir(),
            download_dir: default_download_dir(),
            default_remote: ".".to_string(),
            known_hosts: default_known_hosts(),
            reconnect_base_secs: 5,
            reconnect_step_ms: 1000,
            progress_interval_ms: 100,
            connection_timeout: 20,
        }
    }
}

impl Settings {
    /// Delay before reconnect attempt number `attempts` (zero based).
    pub fn reconnect_delay(&self, attempts: u32) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
            + Duration::from_millis(self.reconnect_step_ms) * attempts
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Main configuration structure
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub settings: Settings,
}

/// Loads and persists the TOML configuration file.
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_config_path()?)
    }

    pub fn with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::ConfigError("No config directory available".to_string()))?
            .join("remotesync");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|e| {
                AppError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        Ok(config_dir.join("config.toml"))
    }

    fn load_config_from_path(config_path: &Path) -> Result<Config> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(config_path)
            .map_err(|e| AppError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&config_content)
            .map_err(|e| AppError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(&self.config)
            .map_err(|e| AppError::ConfigError(format!("Failed to serialize config: {}", e)))?;
        fs::write(&self.config_path, toml)
            .map_err(|e| AppError::ConfigError(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    /// Credentials ready for a connection attempt.
    pub fn credentials(&self) -> std::result::Result<Credentials, ConnectError> {
        let credentials = self
            .config
            .credentials
            .clone()
            .ok_or(ConnectError::ConfigNotFound)?;
        credentials
            .validate()
            .map_err(ConnectError::InvalidConfig)?;
        Ok(credentials)
    }

    pub fn set_credentials(&mut self, credentials: Credentials) -> Result<()> {
        credentials.validate().map_err(|errors| {
            AppError::ValidationError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        })?;
        self.config.credentials = Some(credentials);
        self.save()
    }

    pub fn touch_last_used(&mut self) -> Result<()> {
        if let Some(credentials) = self.config.credentials.as_mut() {
            credentials.update_last_used();
            self.save()?;
        }
        Ok(())
    }
}
