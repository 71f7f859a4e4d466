//! # Tunnel Messages
//!
//! The eight message types exchanged between agents and the broker, and the
//! decoded wire frame they all share. The binary layout lives in [`crate::codec`].

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Wire type byte for each tunnel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Open a multiplexed stream toward a target address.
    Connect = 0x01,
    /// The exit side dialed the target successfully.
    ConnAck = 0x02,
    /// One chunk of tunneled bytes for a stream.
    Data = 0x03,
    /// Tear down a stream.
    Close = 0x04,
    /// Stream-scoped failure, carries a reason string.
    Error = 0x05,
    /// Broker asks the agent to re-fetch its forwarding rules.
    RuleUpdate = 0x06,
    /// Broker asks whether a local address is bindable.
    CheckPort = 0x07,
    /// Agent's answer to [`MessageType::CheckPort`].
    CheckPortResult = 0x08,
}

/// One decoded tunnel frame.
///
/// `target`, `rule_id` and `error` are optional on the wire; the empty string
/// stands for absent (the codec encodes them as length-prefixed strings where
/// a zero length is indistinguishable from omission).
///
/// `payload` carries raw tunneled bytes for `Data` (encrypted on the wire),
/// the next-hop reference for `Connect`, and is empty otherwise. After
/// [`crate::codec::unmarshal`] it aliases the input frame; the refcount keeps
/// the backing buffer alive for as long as the payload is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    pub msg_type: MessageType,
    pub stream_id: u32,
    pub target: String,
    pub rule_id: String,
    pub error: String,
    pub payload: Bytes,
}

impl TunnelMessage {
    /// An empty message of the given type for the given stream.
    pub fn new(msg_type: MessageType, stream_id: u32) -> Self {
        Self {
            msg_type,
            stream_id,
            target: String::new(),
            rule_id: String::new(),
            error: String::new(),
            payload: Bytes::new(),
        }
    }

    /// A Connect carrying the exit target, the owning rule and the next hop.
    pub fn connect(
        stream_id: u32,
        target: impl Into<String>,
        rule_id: impl Into<String>,
        next_hop: Bytes,
    ) -> Self {
        Self {
            target: target.into(),
            rule_id: rule_id.into(),
            payload: next_hop,
            ..Self::new(MessageType::Connect, stream_id)
        }
    }

    pub fn conn_ack(stream_id: u32) -> Self {
        Self::new(MessageType::ConnAck, stream_id)
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::new(MessageType::Data, stream_id)
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(MessageType::Close, stream_id)
    }

    pub fn error(stream_id: u32, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::new(MessageType::Error, stream_id)
        }
    }

    pub fn rule_update() -> Self {
        Self::new(MessageType::RuleUpdate, 0)
    }

    /// A port probe; `stream_id` doubles as the request correlation id.
    pub fn check_port(request_id: u32, addr: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            target: addr.into(),
            rule_id: rule_id.into(),
            ..Self::new(MessageType::CheckPort, request_id)
        }
    }

    /// The probe answer; an empty `error` means the address is bindable.
    pub fn check_port_result(request_id: u32, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::new(MessageType::CheckPortResult, request_id)
        }
    }
}
