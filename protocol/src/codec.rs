//! # Framed Binary Codec
//!
//! Every tunnel message travels as one binary WebSocket frame:
//!
//! ```text
//! type:1 | stream_id:4 | payload_length:4 | payload…        (big-endian)
//! ```
//!
//! Payload layout by type:
//!
//! - `Data` — raw opaque bytes (encrypted by the agents, opaque to the broker).
//! - `Connect`, `CheckPort` — `target_len:2 | target | rule_id_len:2 | rule_id
//!   | tail`, where the tail carries the next-hop reference for `Connect` and
//!   is empty for `CheckPort`.
//! - `Error`, `CheckPortResult` — `error_len:2 | error`.
//! - `ConnAck`, `Close`, `RuleUpdate` — empty.
//!
//! Payloads are capped at 64 KiB and embedded strings at 4 KiB. The write
//! side rejects over-limit input with a distinct error kind; the read side
//! clamps an oversize string length to the bytes left in the payload — a
//! malformed frame is tolerated by reading what fits, never by reading past
//! the declared payload length.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::{MessageType, TunnelMessage};
use crate::pool::pool;

/// Fixed frame header: type byte, stream id, payload length.
pub const HEADER_LEN: usize = 9;

/// Maximum payload bytes per frame.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Maximum bytes for an embedded string (target, rule id, error).
pub const MAX_STRING: usize = 4 * 1024;

/// Serializes `msg` into a pooled frame buffer.
///
/// The returned [`Bytes`] is the complete frame, ready for a binary socket
/// write. Its backing allocation comes from the buffer pool and is reclaimed
/// once the frame (and any payload slices aliasing it) are dropped.
pub fn marshal(msg: &TunnelMessage) -> Result<Bytes, ProtocolError> {
    let payload_len = encoded_payload_len(msg)?;
    let mut buf = pool().acquire_for(payload_len);

    buf.put_u8(msg.msg_type.into());
    buf.put_u32(msg.stream_id);
    buf.put_u32(payload_len as u32);
    write_payload(&mut buf, msg);

    let frame = buf.split().freeze();
    pool().release(buf);
    Ok(frame)
}

/// Decodes one frame. `payload` on the returned message aliases `frame`.
pub fn unmarshal(frame: &Bytes) -> Result<TunnelMessage, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidHeader {
            got: frame.len(),
            need: HEADER_LEN,
        });
    }

    let msg_type =
        MessageType::try_from(frame[0]).map_err(|_| ProtocolError::UnknownType(frame[0]))?;
    let stream_id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let declared = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) as usize;

    if declared > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: declared,
            limit: MAX_PAYLOAD,
        });
    }
    if frame.len() < HEADER_LEN + declared {
        return Err(ProtocolError::TruncatedPayload {
            declared,
            got: frame.len() - HEADER_LEN,
        });
    }

    let payload = frame.slice(HEADER_LEN..HEADER_LEN + declared);
    let mut msg = TunnelMessage::new(msg_type, stream_id);

    match msg_type {
        MessageType::Data => {
            msg.payload = payload;
        }
        MessageType::Connect | MessageType::CheckPort => {
            let mut cursor = StrCursor::new(payload);
            msg.target = cursor.read_str();
            msg.rule_id = cursor.read_str();
            msg.payload = cursor.rest();
        }
        MessageType::Error | MessageType::CheckPortResult => {
            let mut cursor = StrCursor::new(payload);
            msg.error = cursor.read_str();
        }
        MessageType::ConnAck | MessageType::Close | MessageType::RuleUpdate => {}
    }

    Ok(msg)
}

fn encoded_payload_len(msg: &TunnelMessage) -> Result<usize, ProtocolError> {
    let len = match msg.msg_type {
        MessageType::Data => msg.payload.len(),
        MessageType::Connect | MessageType::CheckPort => {
            check_string(&msg.target)?;
            check_string(&msg.rule_id)?;
            2 + msg.target.len() + 2 + msg.rule_id.len() + msg.payload.len()
        }
        MessageType::Error | MessageType::CheckPortResult => {
            check_string(&msg.error)?;
            2 + msg.error.len()
        }
        MessageType::ConnAck | MessageType::Close | MessageType::RuleUpdate => 0,
    };
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            limit: MAX_PAYLOAD,
        });
    }
    Ok(len)
}

fn check_string(s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_STRING {
        return Err(ProtocolError::StringTooLong {
            len: s.len(),
            limit: MAX_STRING,
        });
    }
    Ok(())
}

fn write_payload(buf: &mut BytesMut, msg: &TunnelMessage) {
    match msg.msg_type {
        MessageType::Data => buf.put_slice(&msg.payload),
        MessageType::Connect | MessageType::CheckPort => {
            put_str(buf, &msg.target);
            put_str(buf, &msg.rule_id);
            buf.put_slice(&msg.payload);
        }
        MessageType::Error | MessageType::CheckPortResult => put_str(buf, &msg.error),
        MessageType::ConnAck | MessageType::Close | MessageType::RuleUpdate => {}
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Reads length-prefixed strings out of a payload slice, clamping declared
/// lengths to the bytes that remain.
struct StrCursor {
    payload: Bytes,
    pos: usize,
}

impl StrCursor {
    fn new(payload: Bytes) -> Self {
        Self { payload, pos: 0 }
    }

    fn read_str(&mut self) -> String {
        if self.pos + 2 > self.payload.len() {
            self.pos = self.payload.len();
            return String::new();
        }
        let declared =
            u16::from_be_bytes([self.payload[self.pos], self.payload[self.pos + 1]]) as usize;
        self.pos += 2;
        let take = declared.min(self.payload.len() - self.pos);
        let s = String::from_utf8_lossy(&self.payload[self.pos..self.pos + take]).into_owned();
        self.pos += take;
        s
    }

    fn rest(&self) -> Bytes {
        self.payload.slice(self.pos..)
    }
}
