//! Binary encoding of an [`ActionMessage`] body.
//!
//! All integers are big-endian. The body layout is:
//!
//! ```text
//! action i32 | message_id i32 | source_id i32 | source_handle i32
//! dest_id i32 | dest_handle i32 | flags u16
//! name_len u16 | name bytes | payload_len u32 | payload bytes
//! ```
//!
//! The body carries no length of its own; framing (see [`crate::frame`])
//! supplies it.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Action, ActionMessage, ProtocolError};

/// Size of a body with an empty name and an empty payload.
pub const MIN_BODY_SIZE: usize = 6 * 4 + 2 + 2 + 4;

/// Longest name representable in the `u16` length prefix.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

impl ActionMessage {
    /// Number of bytes [`encode_body`] will produce for this message.
    pub fn encoded_len(&self) -> usize {
        MIN_BODY_SIZE + self.name.len() + self.payload.len()
    }

    /// Serializes the message body into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        encode_body(self, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Deserializes a message body. The whole slice must be consumed.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        decode_body(data)
    }
}

/// Appends the body encoding of `msg` to `buf`.
///
/// # Errors
/// Returns [`ProtocolError::FieldTooLarge`] if the name or payload does not
/// fit its length prefix. Nothing is written in that case.
pub fn encode_body(
    msg: &ActionMessage,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if msg.name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::FieldTooLarge {
            field: "name",
            len: msg.name.len(),
            max: MAX_NAME_LEN,
        });
    }
    let payload_len = u32::try_from(msg.payload.len()).map_err(|_| {
        ProtocolError::FieldTooLarge {
            field: "payload",
            len: msg.payload.len(),
            max: u32::MAX as usize,
        }
    })?;

    buf.reserve(msg.encoded_len());
    buf.put_i32(msg.action.code());
    buf.put_i32(msg.message_id);
    buf.put_i32(msg.source_id);
    buf.put_i32(msg.source_handle);
    buf.put_i32(msg.dest_id);
    buf.put_i32(msg.dest_handle);
    buf.put_u16(msg.flags);
    buf.put_u16(msg.name.len() as u16);
    buf.put_slice(msg.name.as_bytes());
    buf.put_u32(payload_len);
    buf.put_slice(&msg.payload);
    Ok(())
}

/// Decodes a complete body. Truncated input and leftover bytes are both
/// errors; a partially-initialised message is never returned.
pub fn decode_body(mut body: &[u8]) -> Result<ActionMessage, ProtocolError> {
    ensure(body, MIN_BODY_SIZE)?;

    let action = Action::try_from(body.get_i32())?;
    let message_id = body.get_i32();
    let source_id = body.get_i32();
    let source_handle = body.get_i32();
    let dest_id = body.get_i32();
    let dest_handle = body.get_i32();
    let flags = body.get_u16();

    let name_len = body.get_u16() as usize;
    ensure(body, name_len + 4)?;
    let name = String::from_utf8(body[..name_len].to_vec())?;
    body.advance(name_len);

    let payload_len = body.get_u32() as usize;
    ensure(body, payload_len)?;
    let payload = body[..payload_len].to_vec();
    body.advance(payload_len);

    if body.has_remaining() {
        return Err(ProtocolError::TrailingBytes(body.remaining()));
    }

    Ok(ActionMessage {
        action,
        message_id,
        source_id,
        source_handle,
        dest_id,
        dest_handle,
        flags,
        name,
        payload,
    })
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}
