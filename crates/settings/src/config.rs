//! Configuration types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use signalcraft_core::{
    RelayConfig, TaskPolicy, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_OUTBOUND_QUEUE, DEFAULT_PONG_TIMEOUT, MAX_RESPONDER_SLOTS,
};

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Listener and key settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Relay tunables
    #[serde(default)]
    pub relay: RelaySettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Save settings to the path they were loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Validated runtime configuration
    pub fn relay_config(&self) -> Result<RelayConfig> {
        let config = self.relay.to_config();
        config.validate()?;
        Ok(config)
    }
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Socket address to accept WebSocket connections on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Long-term key files; the first one is the default key
    #[serde(default = "default_key_files")]
    pub key_files: Vec<String>,

    /// Debug logging for signalcraft crates
    #[serde(default)]
    pub verbose: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_key_files() -> Vec<String> {
    vec!["~/.signalcraft/keys/relay.key".to_string()]
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            key_files: default_key_files(),
            verbose: false,
        }
    }
}

/// Relay tunables, durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Frames buffered per connection before it is dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    #[serde(default = "default_max_responders")]
    pub max_responders: usize,

    #[serde(default)]
    pub task_policy: TaskPolicy,
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_keepalive_interval() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL.as_secs()
}

fn default_pong_timeout() -> u64 {
    DEFAULT_PONG_TIMEOUT.as_secs()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_outbound_queue() -> usize {
    DEFAULT_OUTBOUND_QUEUE
}

fn default_max_responders() -> usize {
    MAX_RESPONDER_SLOTS
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            pong_timeout_secs: default_pong_timeout(),
            max_frame_size: default_max_frame_size(),
            outbound_queue: default_outbound_queue(),
            max_responders: default_max_responders(),
            task_policy: TaskPolicy::default(),
        }
    }
}

impl RelaySettings {
    pub fn to_config(&self) -> RelayConfig {
        RelayConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            max_frame_size: self.max_frame_size,
            outbound_queue: self.outbound_queue,
            max_responders: self.max_responders,
            task_policy: self.task_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.listen_addr, "0.0.0.0:8765");
        assert_eq!(settings.server.key_files.len(), 1);
        assert_eq!(settings.relay.handshake_timeout_secs, 60);
        assert_eq!(settings.relay.keepalive_interval_secs, 3600);
        assert_eq!(settings.relay.max_responders, 254);
    }

    #[test]
    fn test_defaults_match_runtime_config() {
        let config = Settings::default().relay_config().unwrap();
        let runtime = RelayConfig::default();
        assert_eq!(config.handshake_timeout, runtime.handshake_timeout);
        assert_eq!(config.keepalive_interval, runtime.keepalive_interval);
        assert_eq!(config.pong_timeout, runtime.pong_timeout);
        assert_eq!(config.outbound_queue, runtime.outbound_queue);
        assert_eq!(config.task_policy, runtime.task_policy);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{"relay": {"outbound_queue": 8, "task_policy": "initiator"}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.relay.outbound_queue, 8);
        assert_eq!(settings.relay.task_policy, TaskPolicy::Initiator);
        assert_eq!(settings.relay.pong_timeout_secs, 30);
        assert_eq!(settings.server.listen_addr, "0.0.0.0:8765");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::load_from(&path).unwrap();
        settings.server.listen_addr = "127.0.0.1:9000".to_string();
        settings.relay.max_frame_size = 4096;
        settings.save().unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(loaded.relay.max_frame_size, 4096);
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_invalid_limits_rejected() {
        let mut settings = Settings::default();
        settings.relay.max_responders = 300;
        assert!(matches!(
            settings.relay_config(),
            Err(SettingsError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(SettingsError::ParseError(_))
        ));
    }

    #[test]
    fn test_unknown_task_policy() {
        let json = r#"{"relay": {"task_policy": "random"}}"#;
        assert!(serde_json::from_str::<Settings>(json).is_err());
    }
}
