//! Protocol-level errors for the framed codec and the payload cipher.

use thiserror::Error;

/// Errors surfaced by the wire codec and the payload cipher.
///
/// Frame-level errors are recoverable: the offending frame is dropped and
/// the link stays alive. Only the caller decides whether to escalate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header.
    #[error("frame too short: {got} bytes, header needs {need}")]
    InvalidHeader { got: usize, need: usize },

    /// Unknown message type byte.
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    /// Declared or supplied payload exceeds the wire limit.
    #[error("payload too large: {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// An embedded string exceeds the wire limit on the write side.
    #[error("embedded string too long: {len} bytes exceeds limit {limit}")]
    StringTooLong { len: usize, limit: usize },

    /// Header declares more payload bytes than the frame carries.
    #[error("truncated payload: header declares {declared} bytes, frame carries {got}")]
    TruncatedPayload { declared: usize, got: usize },

    /// AEAD open failed: tampered ciphertext, wrong key, or short input.
    #[error("payload decrypt failed")]
    DecryptFailed,

    /// AEAD seal failed.
    #[error("payload encrypt failed")]
    EncryptFailed,
}
