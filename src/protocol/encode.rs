//! Per-operation packet builders.
//!
//! Every builder computes the exact remaining length first, verifies the
//! whole packet fits the caller's buffer, and only then writes. Payload
//! bytes are written in place; nothing is copied out again later.

use crate::protocol::fixed_header::{self, remaining_length_size, REMAINING_LENGTH_MAX};
use crate::protocol::{filter, PacketType, ProtocolError, QoS};

/// Longest client identifier MQTT 3.1.1 requires a broker to accept.
pub const CLIENT_ID_MAX_LEN: usize = 23;

/// Encoded size of a PUBACK/PUBREC/PUBREL/PUBCOMP packet.
pub const ACK_PACKET_LEN: usize = 4;

/// Smallest useful message buffer: fixed header plus a packet identifier.
pub const MIN_BUFFER_LEN: usize = 4;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CONNECT_VAR_HEADER_LEN: usize = 10;
const UTF8_LEN_SIZE: usize = 2;
const PACKET_ID_SIZE: usize = 2;

const CONNECT_FLAG_USERNAME: u8 = 0x80;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_WILL_QOS_SHIFT: u8 = 3;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;

/// Last-will configuration carried in the CONNECT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Fields of the CONNECT variable header and payload.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub keep_alive_s: u16,
    pub clean_session: bool,
    pub will: Option<LastWill<'a>>,
}

fn total_packet_len(remaining: usize) -> Result<usize, ProtocolError> {
    if remaining > REMAINING_LENGTH_MAX {
        return Err(ProtocolError::RemainingLengthTooLarge { length: remaining });
    }
    Ok(1 + remaining_length_size(remaining) + remaining)
}

fn check_fits(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn write_utf8(
    buf: &mut [u8],
    offset: &mut usize,
    s: &str,
) -> Result<(), ProtocolError> {
    write_binary(buf, offset, s.as_bytes())
}

pub(crate) fn write_binary(
    buf: &mut [u8],
    offset: &mut usize,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    let len = bytes.len();
    if len > u16::MAX as usize {
        return Err(ProtocolError::RemainingLengthTooLarge { length: len });
    }
    check_fits(buf, *offset + UTF8_LEN_SIZE + len)?;
    buf[*offset..*offset + 2].copy_from_slice(&(len as u16).to_be_bytes());
    *offset += 2;
    buf[*offset..*offset + len].copy_from_slice(bytes);
    *offset += len;
    Ok(())
}

fn write_u16(buf: &mut [u8], offset: &mut usize, value: u16) {
    buf[*offset..*offset + 2].copy_from_slice(&value.to_be_bytes());
    *offset += 2;
}

/// Encode a CONNECT packet. Returns the total packet length.
pub fn connect(buf: &mut [u8], params: &ConnectParams<'_>) -> Result<usize, ProtocolError> {
    if params.client_id.len() > CLIENT_ID_MAX_LEN {
        return Err(ProtocolError::ClientIdTooLong {
            max_length: CLIENT_ID_MAX_LEN,
            actual_length: params.client_id.len(),
        });
    }

    let mut remaining = CONNECT_VAR_HEADER_LEN + UTF8_LEN_SIZE + params.client_id.len();
    if let Some(will) = &params.will {
        remaining += UTF8_LEN_SIZE + will.topic.len();
        remaining += UTF8_LEN_SIZE + will.message.len();
    }
    if let Some(username) = params.username {
        remaining += UTF8_LEN_SIZE + username.len();
    }
    if let Some(password) = params.password {
        remaining += UTF8_LEN_SIZE + password.len();
    }

    let total = total_packet_len(remaining)?;
    check_fits(buf, total)?;

    let mut offset =
        fixed_header::encode(buf, PacketType::Connect, false, QoS::AtMostOnce, false, remaining)?;

    write_utf8(buf, &mut offset, PROTOCOL_NAME)?;
    buf[offset] = PROTOCOL_LEVEL;
    offset += 1;

    let mut flags = 0u8;
    if params.username.is_some() {
        flags |= CONNECT_FLAG_USERNAME;
    }
    if params.password.is_some() {
        flags |= CONNECT_FLAG_PASSWORD;
    }
    if let Some(will) = &params.will {
        flags |= CONNECT_FLAG_WILL;
        flags |= (will.qos as u8) << CONNECT_FLAG_WILL_QOS_SHIFT;
        if will.retain {
            flags |= CONNECT_FLAG_WILL_RETAIN;
        }
    }
    if params.clean_session {
        flags |= CONNECT_FLAG_CLEAN_SESSION;
    }
    buf[offset] = flags;
    offset += 1;

    write_u16(buf, &mut offset, params.keep_alive_s);
    write_utf8(buf, &mut offset, params.client_id)?;
    if let Some(will) = &params.will {
        write_utf8(buf, &mut offset, will.topic)?;
        write_binary(buf, &mut offset, will.message)?;
    }
    if let Some(username) = params.username {
        write_utf8(buf, &mut offset, username)?;
    }
    if let Some(password) = params.password {
        write_utf8(buf, &mut offset, password)?;
    }

    debug_assert_eq!(offset, total);
    Ok(total)
}

/// Encode a PUBLISH packet. Returns the total packet length.
///
/// `packet_id` is required for QoS 1 and 2 and must be absent for QoS 0.
pub fn publish(
    buf: &mut [u8],
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    packet_id: Option<u16>,
) -> Result<usize, ProtocolError> {
    filter::validate_topic(topic)?;
    if qos != QoS::AtMostOnce && packet_id.is_none() {
        return Err(ProtocolError::MissingPacketId);
    }

    let mut remaining = UTF8_LEN_SIZE + topic.len();
    if qos != QoS::AtMostOnce {
        remaining += PACKET_ID_SIZE;
    }
    remaining += payload.len();

    let total = total_packet_len(remaining)?;
    check_fits(buf, total)?;

    let mut offset = fixed_header::encode(buf, PacketType::Publish, false, qos, retain, remaining)?;
    write_utf8(buf, &mut offset, topic)?;
    if qos != QoS::AtMostOnce {
        write_u16(buf, &mut offset, packet_id.unwrap_or(0));
    }
    buf[offset..offset + payload.len()].copy_from_slice(payload);
    offset += payload.len();

    debug_assert_eq!(offset, total);
    Ok(total)
}

/// Result of encoding a SUBSCRIBE packet.
///
/// The buffer is laid out as `[requested QoS values | topic count | wire
/// packet]`: `buf[0..n]` holds one requested QoS per topic in order,
/// `buf[n]` the topic count `n`, and the on-wire bytes start at
/// `payload_offset = n + 1`. The completion path reads the requested
/// values back from this prefix to verify the broker's granted QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeLayout {
    /// Offset of the first on-wire byte.
    pub payload_offset: usize,
    /// Length of the on-wire packet starting at `payload_offset`.
    pub wire_len: usize,
}

/// Encode a SUBSCRIBE packet with the requested-QoS prefix described on
/// [`SubscribeLayout`]. Requires `buf.len() >= wire_len + topics.len() + 1`.
pub fn subscribe(
    buf: &mut [u8],
    packet_id: u16,
    topics: &[(&str, QoS)],
) -> Result<SubscribeLayout, ProtocolError> {
    if topics.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }
    if topics.len() > u8::MAX as usize {
        return Err(ProtocolError::TooManyTopics {
            max: u8::MAX as usize,
            actual: topics.len(),
        });
    }

    let mut remaining = PACKET_ID_SIZE;
    for (topic, _) in topics {
        filter::validate_filter(topic)?;
        remaining += UTF8_LEN_SIZE + topic.len() + 1;
    }

    let meta_len = topics.len() + 1;
    let wire_len = total_packet_len(remaining)?;
    check_fits(buf, meta_len + wire_len)?;

    for (i, (_, qos)) in topics.iter().enumerate() {
        buf[i] = *qos as u8;
    }
    buf[topics.len()] = topics.len() as u8;

    let wire = &mut buf[meta_len..];
    let mut offset = fixed_header::encode(
        wire,
        PacketType::Subscribe,
        false,
        QoS::AtLeastOnce,
        false,
        remaining,
    )?;
    write_u16(wire, &mut offset, packet_id);
    for (topic, qos) in topics {
        write_utf8(wire, &mut offset, topic)?;
        wire[offset] = *qos as u8;
        offset += 1;
    }

    debug_assert_eq!(offset, wire_len);
    Ok(SubscribeLayout {
        payload_offset: meta_len,
        wire_len,
    })
}

/// Encode an UNSUBSCRIBE packet. Returns the total packet length.
pub fn unsubscribe(
    buf: &mut [u8],
    packet_id: u16,
    topics: &[&str],
) -> Result<usize, ProtocolError> {
    if topics.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }

    let mut remaining = PACKET_ID_SIZE;
    for topic in topics {
        filter::validate_filter(topic)?;
        remaining += UTF8_LEN_SIZE + topic.len();
    }

    let total = total_packet_len(remaining)?;
    check_fits(buf, total)?;

    let mut offset = fixed_header::encode(
        buf,
        PacketType::Unsubscribe,
        false,
        QoS::AtLeastOnce,
        false,
        remaining,
    )?;
    write_u16(buf, &mut offset, packet_id);
    for topic in topics {
        write_utf8(buf, &mut offset, topic)?;
    }

    debug_assert_eq!(offset, total);
    Ok(total)
}

/// Encode a PINGREQ packet (always two bytes).
pub fn ping_req(buf: &mut [u8]) -> Result<usize, ProtocolError> {
    check_fits(buf, 2)?;
    fixed_header::encode(buf, PacketType::PingReq, false, QoS::AtMostOnce, false, 0)
}

/// Encode a DISCONNECT packet (always two bytes).
pub fn disconnect(buf: &mut [u8]) -> Result<usize, ProtocolError> {
    check_fits(buf, 2)?;
    fixed_header::encode(buf, PacketType::Disconnect, false, QoS::AtMostOnce, false, 0)
}

/// Encode a PUBACK/PUBREC/PUBREL/PUBCOMP acknowledgment (always four
/// bytes). PUBREL carries the reserved 0b0010 flag pattern.
pub fn ack(
    buf: &mut [u8],
    packet_type: PacketType,
    packet_id: u16,
) -> Result<usize, ProtocolError> {
    let qos = match packet_type {
        PacketType::PubAck | PacketType::PubRec | PacketType::PubComp => QoS::AtMostOnce,
        PacketType::PubRel => QoS::AtLeastOnce,
        other => {
            return Err(ProtocolError::InvalidPacketType {
                packet_type: (other as u8) << 4,
            })
        }
    };

    check_fits(buf, ACK_PACKET_LEN)?;
    let mut offset = fixed_header::encode(buf, packet_type, false, qos, false, PACKET_ID_SIZE)?;
    write_u16(buf, &mut offset, packet_id);
    debug_assert_eq!(offset, ACK_PACKET_LEN);
    Ok(ACK_PACKET_LEN)
}
