//! # Lattice Edge Agent
//!
//! The edge process of the relay fabric. It keeps one persistent WebSocket
//! to the broker, runs the forwarding rules the control plane assigns it,
//! and serves as the exit for tunnels other agents open toward it.
//!
//! - [`config`]    — TOML configuration with CLI fallback
//! - [`control`]   — JSON-RPC client toward the management service
//! - [`link`]      — the persistent control link with reconnect backoff
//! - [`dispatch`]  — inbound message dispatch and the exit handler
//! - [`forwarder`] — direct and relay forwarders
//! - [`rules`]     — rule model and reconciliation

pub mod config;
pub mod control;
pub mod dispatch;
pub mod forwarder;
pub mod link;
pub mod rules;

pub use config::AgentConfig;
pub use control::ControlClient;
pub use dispatch::Dispatcher;
pub use link::{Backoff, ControlLink, LinkConfig};
pub use rules::{Rule, RuleKind, RuleManager};

/// Agent build version reported at registration.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
