//! Configuration loading and management

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bitsync_core::HostPort;
use serde::{Deserialize, Serialize};

use crate::handler::HandlerConfig;
use crate::reconnect::ReconnectConfig;

pub const CONFIG_FILE: &str = "bitsync.json";

/// Main configuration for the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host announced to peers in handshakes
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory to synchronize
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Peers to dial at startup, as `host:port`
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_max_incoming_connections")]
    pub max_incoming_connections: usize,

    /// Bytes requested per FILE_BYTES round trip
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Seconds between full announcements to every peer
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Attempts before a known address is forgotten (unlimited if unset)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            max_attempts: None,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_secs(settings.initial_delay_secs),
            max_delay: Duration::from_secs(settings.max_delay_secs),
            backoff_factor: settings.backoff_factor,
            max_attempts: settings.max_attempts,
        }
    }
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_path() -> PathBuf {
    PathBuf::from("share")
}

fn default_max_incoming_connections() -> usize {
    10
}

fn default_block_size() -> u64 {
    64 * 1024
}

fn default_sync_interval() -> u64 {
    60
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_initial_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    60
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            advertised_host: default_advertised_host(),
            port: default_port(),
            path: default_path(),
            peers: Vec::new(),
            max_incoming_connections: default_max_incoming_connections(),
            block_size: default_block_size(),
            sync_interval_secs: default_sync_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            request_timeout_secs: default_request_timeout(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config directory, writing defaults on
    /// first run.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", CONFIG_FILE))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_file
            );
            let config = Config::default();

            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// The address we announce to peers.
    pub fn local(&self) -> HostPort {
        HostPort::new(self.advertised_host.clone(), self.port)
    }

    /// Configured peers, parsed. Fails on the first malformed entry.
    pub fn peer_addresses(&self) -> Result<Vec<HostPort>> {
        self.peers
            .iter()
            .map(|peer| {
                peer.parse::<HostPort>()
                    .with_context(|| format!("Invalid peer address: {}", peer))
            })
            .collect()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            local: self.local(),
            max_incoming_connections: self.max_incoming_connections,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            reconnect: ReconnectConfig::from(&self.reconnect),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_run_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());

        // Second load reads the file back
        assert_eq!(Config::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"port": 5001, "peers": ["10.0.0.2:5000"], "reconnect": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.port, 5001);
        assert_eq!(config.block_size, 64 * 1024);
        assert_eq!(config.reconnect.initial_delay_secs, 5);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(
            config.peer_addresses().unwrap(),
            vec![HostPort::new("10.0.0.2", 5000)]
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn test_bad_peer_address() {
        let config = Config {
            peers: vec!["no-port".to_string()],
            ..Default::default()
        };
        assert!(config.peer_addresses().is_err());
    }

    #[test]
    fn test_handler_config() {
        let config = Config {
            advertised_host: "10.0.0.1".to_string(),
            port: 4100,
            handshake_timeout_secs: 3,
            ..Default::default()
        };
        let handler = config.handler_config();
        assert_eq!(handler.local, HostPort::new("10.0.0.1", 4100));
        assert_eq!(handler.handshake_timeout, Duration::from_secs(3));
        assert_eq!(handler.reconnect, ReconnectConfig::default());
    }
}
