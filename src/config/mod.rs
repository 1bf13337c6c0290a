pub mod encryption;
pub mod manager;

pub use manager::{Config, ConfigManager, Credentials, Settings};
