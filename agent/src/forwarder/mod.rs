//! # Forwarders
//!
//! Per-rule components that accept local TCP connections and move their
//! bytes to the configured destination:
//!
//! - [`DirectForwarder`] splices each accepted connection straight to a
//!   target TCP endpoint.
//! - [`RelayForwarder`] opens a multiplexed stream through the broker and
//!   splices the connection over the control link.
//!
//! Both share the same surface: `start` binds the listener and reports the
//! outcome through the status callback; `stop` is idempotent, safe before or
//! after `start`, and waits for in-flight connection tasks.

mod direct;
mod relay;
pub(crate) mod splice;

use std::sync::Arc;
use std::time::Duration;

pub use direct::DirectForwarder;
pub use relay::RelayForwarder;

use crate::config::ForwarderConfig;

/// Rule state reported through the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Running,
    Error,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Running => "running",
            RuleStatus::Error => "error",
        }
    }
}

/// Callback invoked with `(rule_id, status, error)` on rule transitions.
pub type StatusFn = Arc<dyn Fn(&str, RuleStatus, &str) + Send + Sync>;

/// Tunables shared by both forwarder types.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&ForwarderConfig> for ForwarderSettings {
    fn from(config: &ForwarderConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            idle_timeout: Duration::from_secs(config.idle_timeout),
        }
    }
}

/// A started forwarder of either kind.
pub enum Forwarder {
    Direct(Arc<DirectForwarder>),
    Relay(Arc<RelayForwarder>),
}

impl Forwarder {
    pub async fn start(&self) -> anyhow::Result<()> {
        match self {
            Forwarder::Direct(f) => f.clone().start().await,
            Forwarder::Relay(f) => f.clone().start().await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Forwarder::Direct(f) => f.stop().await,
            Forwarder::Relay(f) => f.stop().await,
        }
    }
}
