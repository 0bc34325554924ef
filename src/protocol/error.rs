/// Wire-level codec error with diagnostic detail.
///
/// These are mapped into the public [`ErrorKind`](crate::ErrorKind)
/// taxonomy at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small for the composed packet
    BufferTooSmall { needed: usize, available: usize },
    /// Remaining length exceeds the 4-byte varint maximum (268 435 455)
    RemainingLengthTooLarge { length: usize },
    /// Not enough bytes to decode the field
    IncompletePacket { available: usize },
    /// Reserved or unknown packet type nibble
    InvalidPacketType { packet_type: u8 },
    /// QoS level outside 0..=2
    InvalidQosLevel { level: u8 },
    /// String field is not valid UTF-8
    InvalidUtf8String,
    /// Client identifier length exceeded the 23-byte protocol limit
    ClientIdTooLong { max_length: usize, actual_length: usize },
    /// Topic or topic filter is empty
    EmptyTopic,
    /// Wildcard placement violates the filter grammar
    InvalidTopicFilter,
    /// Wildcard present in a publish topic name
    WildcardInTopic,
    /// More topics in one SUBSCRIBE than the engine can track
    TooManyTopics { max: usize, actual: usize },
    /// Broker refused the connection (CONNACK return code 1..=5)
    ConnectionRefused { return_code: u8 },
    /// Malformed CONNACK (wrong length or unknown return code)
    InvalidConnAck,
    /// Packet Identifier required but missing or zero
    MissingPacketId,
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolError::BufferTooSmall { needed, available } => {
                write!(f, "Buffer too small: need {}, have {}", needed, available)
            }
            ProtocolError::RemainingLengthTooLarge { length } => {
                write!(f, "Remaining length too large: {}", length)
            }
            ProtocolError::IncompletePacket { available } => {
                write!(f, "Incomplete packet: {} bytes available", available)
            }
            ProtocolError::InvalidPacketType { packet_type } => {
                write!(f, "Invalid packet type: {:#04x}", packet_type)
            }
            ProtocolError::InvalidQosLevel { level } => {
                write!(f, "Invalid QoS level: {}", level)
            }
            ProtocolError::InvalidUtf8String => write!(f, "Invalid UTF-8 string"),
            ProtocolError::ClientIdTooLong {
                max_length,
                actual_length,
            } => {
                write!(
                    f,
                    "Client ID length exceeded: length {}, max {}",
                    actual_length, max_length
                )
            }
            ProtocolError::EmptyTopic => write!(f, "Topic is empty"),
            ProtocolError::InvalidTopicFilter => {
                write!(f, "Invalid wildcard placement in topic filter")
            }
            ProtocolError::WildcardInTopic => {
                write!(f, "Wildcard not allowed in publish topic")
            }
            ProtocolError::TooManyTopics { max, actual } => {
                write!(f, "Too many topics: {}, max {}", actual, max)
            }
            ProtocolError::ConnectionRefused { return_code } => {
                write!(f, "Connection refused by broker: return code {}", return_code)
            }
            ProtocolError::InvalidConnAck => write!(f, "Malformed CONNACK packet"),
            ProtocolError::MissingPacketId => {
                write!(f, "Missing Packet Identifier where one is required")
            }
        }
    }
}

impl core::error::Error for ProtocolError {}
