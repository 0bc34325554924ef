//! Decode helpers for the packet bodies the engine interprets.
//!
//! These operate on the body bytes after the fixed header has been
//! consumed by the socket driver, and return borrowed views — payload
//! data never leaves the caller's buffer.

use crate::protocol::{ProtocolError, QoS};

/// CONNACK return code for an accepted connection.
const CONNACK_ACCEPTED: u8 = 0;

/// Read a length-prefixed UTF-8 string starting at `*offset`.
pub fn read_utf8<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a str, ProtocolError> {
    if *offset + 2 > bytes.len() {
        return Err(ProtocolError::IncompletePacket {
            available: bytes.len(),
        });
    }
    let len = u16::from_be_bytes([bytes[*offset], bytes[*offset + 1]]) as usize;
    *offset += 2;
    if *offset + len > bytes.len() {
        return Err(ProtocolError::IncompletePacket {
            available: bytes.len(),
        });
    }
    let s = core::str::from_utf8(&bytes[*offset..*offset + len])
        .map_err(|_| ProtocolError::InvalidUtf8String)?;
    *offset += len;
    Ok(s)
}

/// Interpret a fully received CONNACK body (session-present byte plus
/// return code).
pub fn connack_status(body: &[u8]) -> Result<(), ProtocolError> {
    if body.len() != 2 {
        return Err(ProtocolError::InvalidConnAck);
    }
    match body[1] {
        CONNACK_ACCEPTED => Ok(()),
        code @ 1..=5 => Err(ProtocolError::ConnectionRefused { return_code: code }),
        _ => Err(ProtocolError::InvalidConnAck),
    }
}

/// Borrowed view of a received PUBLISH body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishView<'a> {
    pub topic: &'a str,
    pub packet_id: Option<u16>,
    pub payload: &'a [u8],
}

/// Split a fully received PUBLISH body into topic, optional packet id and
/// payload. `qos` comes from the fixed-header flags.
pub fn publish_body(body: &[u8], qos: QoS) -> Result<PublishView<'_>, ProtocolError> {
    let mut offset = 0;
    let topic = read_utf8(body, &mut offset)?;
    if topic.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }

    let packet_id = if qos != QoS::AtMostOnce {
        if offset + 2 > body.len() {
            return Err(ProtocolError::IncompletePacket {
                available: body.len(),
            });
        }
        let id = u16::from_be_bytes([body[offset], body[offset + 1]]);
        if id == 0 {
            return Err(ProtocolError::MissingPacketId);
        }
        offset += 2;
        Some(id)
    } else {
        None
    };

    Ok(PublishView {
        topic,
        packet_id,
        payload: &body[offset..],
    })
}
