//! # Agent Configuration
//!
//! TOML config with four sections. Every key has a default except the
//! registration token; a missing token is a fatal startup error. When no
//! config file is given, `--server` and `--token` form a minimal config.
//!
//! ```toml
//! [client]
//! server_url = "http://localhost:8080"
//! token = "..."
//!
//! [connection]
//! reconnect_interval = 5
//! max_reconnect_interval = 60
//! heartbeat_interval = 30
//!
//! [logging]
//! level = "info"
//!
//! [forwarder]
//! buffer_size = 32768
//! connect_timeout = 10
//! idle_timeout = 300
//! ```

use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub client: ClientConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
    pub forwarder: ForwarderConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Control-plane base URL.
    pub server_url: String,
    /// Registration token; required.
    pub token: String,
    /// Cosmetic IP override shown to the control plane.
    pub report_ip: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            token: String::new(),
            report_ip: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Initial reconnect backoff, seconds.
    pub reconnect_interval: u64,
    /// Backoff cap, seconds.
    pub max_reconnect_interval: u64,
    /// Control-plane heartbeat period, seconds.
    pub heartbeat_interval: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: 5,
            max_reconnect_interval: 60,
            heartbeat_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file path; stderr when empty.
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Splice read chunk size, bytes.
    pub buffer_size: usize,
    /// Dial / tunnel handshake timeout, seconds.
    pub connect_timeout: u64,
    /// Per-direction idle timeout, seconds.
    pub idle_timeout: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            connect_timeout: 10,
            idle_timeout: 300,
        }
    }
}

impl AgentConfig {
    /// Loads a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// The minimal config formed by `--server` and `--token`.
    pub fn minimal(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: ClientConfig {
                server_url: server_url.into(),
                token: token.into(),
                report_ip: None,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client.token.is_empty() {
            bail!("registration token is required (set [client].token or pass --token)");
        }
        Ok(())
    }
}
