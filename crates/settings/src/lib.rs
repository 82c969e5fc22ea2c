//! SignalCraft Settings
//!
//! Relay configuration file management.
//!
//! ## Features
//!
//! - Server settings (listen address, long-term key files)
//! - Relay tunables (timeouts, frame and queue limits, task policy)
//! - JSON serialization with per-field defaults
//!
//! ## Usage
//!
//! ```no_run
//! use signalcraft_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.relay.handshake_timeout_secs = 30;
//! let config = settings.relay_config()?;
//! settings.save()?;
//! # Ok::<(), signalcraft_settings::SettingsError>(())
//! ```

mod config;

pub use config::{RelaySettings, ServerSettings, Settings};

use std::path::PathBuf;

use thiserror::Error;
use signalcraft_keystore::default_config_dir;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(#[from] signalcraft_core::SignalError),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
