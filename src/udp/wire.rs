//! Binary record format for the datagram transport.
//!
//! One record per datagram: a 1-byte type tag, a 16-bit little-endian
//! message identifier (except Confirm, which carries only the identifier it
//! acknowledges), then the kind's fields in fixed order. Strings are
//! null-terminated ASCII, booleans a single byte.
//!
//! ```text
//! [tag][id u16] <fields...>                       Auth/Join/Msg/Err/Bye
//! [tag=0x00][ref_id u16]                          Confirm
//! [tag=0x01][id u16][status u8][ref_id u16][content\0]   Reply
//! ```

use bytes::{BufMut, BytesMut};

use crate::types::{ChatError, Message, ReplyStatus};

pub const TAG_CONFIRM: u8 = 0x00;
pub const TAG_REPLY: u8 = 0x01;
pub const TAG_AUTH: u8 = 0x02;
pub const TAG_JOIN: u8 = 0x03;
pub const TAG_MSG: u8 = 0x04;
pub const TAG_ERR: u8 = 0xFE;
pub const TAG_BYE: u8 = 0xFF;

/// A decoded inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Confirm { ref_id: u16 },
    Message { id: u16, message: Message },
}

/// Encodes an identified message into one datagram.
pub fn encode(message: &Message, id: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    match message {
        Message::Auth {
            username,
            display_name,
            secret,
        } => {
            buf.put_u8(TAG_AUTH);
            buf.put_u16_le(id);
            put_str(&mut buf, username);
            put_str(&mut buf, display_name);
            put_str(&mut buf, secret);
        }
        Message::Join {
            channel_id,
            display_name,
        } => {
            buf.put_u8(TAG_JOIN);
            buf.put_u16_le(id);
            put_str(&mut buf, channel_id);
            put_str(&mut buf, display_name);
        }
        Message::Msg {
            display_name,
            content,
        } => {
            buf.put_u8(TAG_MSG);
            buf.put_u16_le(id);
            put_str(&mut buf, display_name);
            put_str(&mut buf, content);
        }
        Message::Err {
            display_name,
            content,
        } => {
            buf.put_u8(TAG_ERR);
            buf.put_u16_le(id);
            put_str(&mut buf, display_name);
            put_str(&mut buf, content);
        }
        Message::Reply { status, content } => {
            // The client never originates replies; the ref field is only
            // meaningful server-side.
            buf.put_u8(TAG_REPLY);
            buf.put_u16_le(id);
            buf.put_u8(match status {
                ReplyStatus::Ok => 1,
                ReplyStatus::Nok => 0,
            });
            buf.put_u16_le(0);
            put_str(&mut buf, content);
        }
        Message::Bye => {
            buf.put_u8(TAG_BYE);
            buf.put_u16_le(id);
        }
    }
    buf.to_vec()
}

/// Encodes an acknowledgment for the given inbound identifier.
pub fn encode_confirm(ref_id: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(TAG_CONFIRM);
    buf.put_u16_le(ref_id);
    buf.to_vec()
}

/// Decodes one datagram. Truncated records, unknown tags and trailing bytes
/// are all malformed.
pub fn decode(data: &[u8]) -> Result<Record, ChatError> {
    let mut data = data;
    let tag = take_u8(&mut data)?;

    if tag == TAG_CONFIRM {
        let ref_id = take_u16_le(&mut data)?;
        ensure_consumed(data)?;
        return Ok(Record::Confirm { ref_id });
    }

    let id = take_u16_le(&mut data)?;
    let message = match tag {
        TAG_AUTH => Message::Auth {
            username: take_str(&mut data)?,
            display_name: take_str(&mut data)?,
            secret: take_str(&mut data)?,
        },
        TAG_JOIN => Message::Join {
            channel_id: take_str(&mut data)?,
            display_name: take_str(&mut data)?,
        },
        TAG_MSG => Message::Msg {
            display_name: take_str(&mut data)?,
            content: take_str(&mut data)?,
        },
        TAG_ERR => Message::Err {
            display_name: take_str(&mut data)?,
            content: take_str(&mut data)?,
        },
        TAG_REPLY => {
            let status = match take_u8(&mut data)? {
                0 => ReplyStatus::Nok,
                1 => ReplyStatus::Ok,
                other => {
                    return Err(ChatError::InvalidMessageReceived(format!(
                        "unknown reply status byte 0x{other:02x}"
                    )))
                }
            };
            let _ref_id = take_u16_le(&mut data)?;
            Message::Reply {
                status,
                content: take_str(&mut data)?,
            }
        }
        TAG_BYE => Message::Bye,
        other => {
            return Err(ChatError::InvalidMessageReceived(format!(
                "unknown type tag 0x{other:02x}"
            )))
        }
    };
    ensure_consumed(data)?;

    Ok(Record::Message { id, message })
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn take_u8(data: &mut &[u8]) -> Result<u8, ChatError> {
    let (&first, rest) = data
        .split_first()
        .ok_or_else(|| ChatError::InvalidMessageReceived("truncated record".into()))?;
    *data = rest;
    Ok(first)
}

fn take_u16_le(data: &mut &[u8]) -> Result<u16, ChatError> {
    if data.len() < 2 {
        return Err(ChatError::InvalidMessageReceived("truncated record".into()));
    }
    let value = u16::from_le_bytes([data[0], data[1]]);
    *data = &data[2..];
    Ok(value)
}

fn take_str(data: &mut &[u8]) -> Result<String, ChatError> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ChatError::InvalidMessageReceived("unterminated string".into()))?;
    let value = std::str::from_utf8(&data[..end])
        .map_err(|_| ChatError::InvalidMessageReceived("string is not valid ASCII".into()))?
        .to_string();
    *data = &data[end + 1..];
    Ok(value)
}

fn ensure_consumed(data: &[u8]) -> Result<(), ChatError> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(ChatError::InvalidMessageReceived(
            "trailing bytes after record".into(),
        ))
    }
}
