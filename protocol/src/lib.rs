//! # Lattice Wire Protocol
//!
//! The shared protocol crate for the Lattice relay fabric. Both the broker
//! and the agents depend on it for:
//!
//! - [`message`] — the eight tunnel message types and their wire model
//! - [`codec`]   — the framed binary codec (9-byte header + typed payload)
//! - [`pool`]    — the three-tier frame buffer pool used on the marshal path
//! - [`crypto`]  — authenticated encryption of Data payloads
//! - [`stream`]  — per-link multiplexed streams and their registry
//! - [`traffic`] — atomic per-rule traffic counters with snapshot-and-reset

pub mod codec;
pub mod crypto;
pub mod error;
pub mod message;
pub mod pool;
pub mod stream;
pub mod traffic;

pub use codec::{marshal, unmarshal, HEADER_LEN, MAX_PAYLOAD, MAX_STRING};
pub use crypto::{cipher, install_cipher, PayloadCipher};
pub use error::ProtocolError;
pub use message::{MessageType, TunnelMessage};
pub use pool::{pool, BufferPool};
pub use stream::{Stream, StreamRegistry, SENTINEL_CONNACK, SENTINEL_ERROR};
pub use traffic::{TrafficSnapshot, TrafficStats};
