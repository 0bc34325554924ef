//! Public error taxonomy.

use crate::protocol::ProtocolError;
use crate::traits::SocketError;

/// Outcome category reported to callers, either synchronously from an
/// operation builder or asynchronously through a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Malformed argument: bad topic filter, oversized client id, missing
    /// required field.
    InvalidArgument,
    /// The caller's buffer is too small for the composed packet.
    WouldOverflow,
    /// Operation issued on a message that is still in flight.
    InvalidState,
    /// The connection is not open, or was torn down while the operation
    /// was queued.
    SocketClosed,
    /// The broker violated the protocol: unexpected packet type, bad
    /// CONNACK return code, granted QoS below the requested level.
    ProtocolFailure,
    /// A bounded resource is exhausted: no free message identifier, or
    /// the request queue is full.
    ResourceExhausted,
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "Invalid argument"),
            ErrorKind::WouldOverflow => write!(f, "Buffer too small for packet"),
            ErrorKind::InvalidState => write!(f, "Message already in flight"),
            ErrorKind::SocketClosed => write!(f, "Connection closed"),
            ErrorKind::ProtocolFailure => write!(f, "Protocol violation by peer"),
            ErrorKind::ResourceExhausted => write!(f, "Resource exhausted"),
        }
    }
}

impl core::error::Error for ErrorKind {}

impl From<ProtocolError> for ErrorKind {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::BufferTooSmall { .. } => ErrorKind::WouldOverflow,
            ProtocolError::RemainingLengthTooLarge { .. }
            | ProtocolError::InvalidQosLevel { .. }
            | ProtocolError::ClientIdTooLong { .. }
            | ProtocolError::EmptyTopic
            | ProtocolError::InvalidTopicFilter
            | ProtocolError::WildcardInTopic
            | ProtocolError::TooManyTopics { .. }
            | ProtocolError::MissingPacketId => ErrorKind::InvalidArgument,
            ProtocolError::IncompletePacket { .. }
            | ProtocolError::InvalidPacketType { .. }
            | ProtocolError::InvalidUtf8String
            | ProtocolError::ConnectionRefused { .. }
            | ProtocolError::InvalidConnAck => ErrorKind::ProtocolFailure,
        }
    }
}

impl From<SocketError> for ErrorKind {
    fn from(err: SocketError) -> Self {
        match err {
            // WouldBlock is handled at the driver level and never surfaces
            // as an outcome; mapping it keeps the conversion total.
            SocketError::WouldBlock | SocketError::Closed | SocketError::Fault => {
                ErrorKind::SocketClosed
            }
        }
    }
}

/// Crate-wide result alias. The error type defaults to [`ErrorKind`] but
/// can be overridden (socket and codec layers carry their own).
pub type Result<T, E = ErrorKind> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_mapping() {
        assert_eq!(
            ErrorKind::from(ProtocolError::BufferTooSmall {
                needed: 8,
                available: 4
            }),
            ErrorKind::WouldOverflow
        );
        assert_eq!(
            ErrorKind::from(ProtocolError::InvalidTopicFilter),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            ErrorKind::from(ProtocolError::ConnectionRefused { return_code: 2 }),
            ErrorKind::ProtocolFailure
        );
    }
}
