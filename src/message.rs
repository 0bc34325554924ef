//! In-flight operation state.
//!
//! A [`Message`] is one protocol operation — one packet exchange, possibly
//! spanning a multi-packet QoS handshake — over a caller-supplied buffer.
//! What the operation *is* never changes ([`OperationKind`]); where it is
//! in its handshake advances separately ([`HandshakeStep`]), so the two
//! are never conflated.

use crate::error::ErrorKind;
use crate::protocol::{PacketType, QoS};

/// Caller-supplied packet buffer. Any owned or borrowed byte storage
/// works: `[u8; N]`, `&mut [u8]`, `heapless::Vec<u8, N>`, ...
pub trait PacketBuffer: AsRef<[u8]> + AsMut<[u8]> {}

impl<T: AsRef<[u8]> + AsMut<[u8]>> PacketBuffer for T {}

/// The caller-facing operation a message performs. Stable for the whole
/// lifetime of the operation, whatever packet the handshake is currently
/// exchanging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationKind {
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
    PingReq,
    Disconnect,
}

/// Where a message currently is in its exchange.
///
/// The linear lattice is `Idle → Transmit → FlushTransmit → AwaitReply →
/// Complete`, with `Transmit`/`AwaitReply` re-entered once per additional
/// handshake packet (QoS 2 chains PUBLISH→PUBREC→PUBREL→PUBCOMP). The
/// embedded [`PacketType`] names the packet being sent or awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandshakeStep {
    /// Not yet handed to the engine.
    Idle,
    /// Bytes of the named packet still need to go out.
    Transmit(PacketType),
    /// The named packet is fully transmitted; the handshake advances on
    /// the next write-driver pass.
    FlushTransmit(PacketType),
    /// Waiting for the named packet from the broker.
    AwaitReply(PacketType),
    /// Operation finished; the message may be reused.
    Complete,
}

/// One in-flight protocol operation over a caller-owned buffer.
///
/// The buffer must outlive the operation and is never copied: builders
/// encode into it, the socket driver transmits and receives through it,
/// and completion hands it back.
pub struct Message<B: PacketBuffer> {
    pub(crate) buf: B,
    pub(crate) kind: Option<OperationKind>,
    pub(crate) step: HandshakeStep,
    pub(crate) qos: QoS,
    pub(crate) msg_id: Option<u16>,
    /// Offset of the first on-wire byte. Nonzero only for SUBSCRIBE,
    /// whose requested-QoS prefix lives below it.
    pub(crate) payload_offset: usize,
    /// On-wire length of the packet currently being transmitted.
    pub(crate) wire_len: usize,
    /// Remaining length the awaited reply must carry (after its packet
    /// identifier, where one is present).
    pub(crate) expected_len: usize,
    pub(crate) error: Option<ErrorKind>,
}

impl<B: PacketBuffer> Message<B> {
    /// Wrap a caller buffer into an idle message.
    pub fn new(buf: B) -> Self {
        Self {
            buf,
            kind: None,
            step: HandshakeStep::Idle,
            qos: QoS::AtMostOnce,
            msg_id: None,
            payload_offset: 0,
            wire_len: 0,
            expected_len: 0,
            error: None,
        }
    }

    /// Clear all operation state, keeping the buffer. Equivalent to
    /// constructing a fresh message over the same storage.
    pub fn reset(&mut self) {
        self.kind = None;
        self.step = HandshakeStep::Idle;
        self.qos = QoS::AtMostOnce;
        self.msg_id = None;
        self.payload_offset = 0;
        self.wire_len = 0;
        self.expected_len = 0;
        self.error = None;
    }

    /// The operation this message is (or last was) performing.
    pub fn kind(&self) -> Option<OperationKind> {
        self.kind
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Allocated message identifier, if the operation holds one.
    pub fn message_id(&self) -> Option<u16> {
        self.msg_id
    }

    /// Error recorded by the last completion, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn is_complete(&self) -> bool {
        self.step == HandshakeStep::Complete
    }

    /// A message may carry a new operation only before its first use or
    /// after the previous operation completed.
    pub fn is_reusable(&self) -> bool {
        matches!(self.step, HandshakeStep::Idle | HandshakeStep::Complete)
    }

    pub fn buffer(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    /// Recover the buffer after completion.
    pub fn into_buffer(self) -> B {
        self.buf
    }

    /// Arm the message for a freshly encoded operation.
    pub(crate) fn begin(
        &mut self,
        kind: OperationKind,
        first_packet: PacketType,
        qos: QoS,
        msg_id: Option<u16>,
        wire_len: usize,
        payload_offset: usize,
    ) {
        self.kind = Some(kind);
        self.step = HandshakeStep::Transmit(first_packet);
        self.qos = qos;
        self.msg_id = msg_id;
        self.payload_offset = payload_offset;
        self.wire_len = wire_len;
        self.expected_len = 0;
        self.error = None;
    }

    /// Whether the current step is the one a successful completion of
    /// this operation is expected to happen at. Completing anywhere else
    /// means the handshake was cut short.
    pub(crate) fn at_terminal_step(&self) -> bool {
        let expected = match (self.kind, self.qos) {
            (Some(OperationKind::Connect), _) => HandshakeStep::AwaitReply(PacketType::ConnAck),
            (Some(OperationKind::Publish), QoS::AtMostOnce) => {
                HandshakeStep::FlushTransmit(PacketType::Publish)
            }
            (Some(OperationKind::Publish), QoS::AtLeastOnce) => {
                HandshakeStep::AwaitReply(PacketType::PubAck)
            }
            (Some(OperationKind::Publish), QoS::ExactlyOnce) => {
                HandshakeStep::AwaitReply(PacketType::PubComp)
            }
            (Some(OperationKind::Subscribe), _) => HandshakeStep::AwaitReply(PacketType::SubAck),
            (Some(OperationKind::Unsubscribe), _) => {
                HandshakeStep::AwaitReply(PacketType::UnsubAck)
            }
            (Some(OperationKind::PingReq), _) => HandshakeStep::AwaitReply(PacketType::PingResp),
            (Some(OperationKind::Disconnect), _) => {
                HandshakeStep::FlushTransmit(PacketType::Disconnect)
            }
            (None, _) => return false,
        };
        self.step == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_reusable() {
        let msg = Message::new([0u8; 16]);
        assert!(msg.is_reusable());
        assert_eq!(msg.kind(), None);
        assert_eq!(msg.message_id(), None);
    }

    #[test]
    fn armed_message_is_not_reusable() {
        let mut msg = Message::new([0u8; 16]);
        msg.begin(
            OperationKind::Publish,
            PacketType::Publish,
            QoS::AtLeastOnce,
            Some(3),
            10,
            0,
        );
        assert!(!msg.is_reusable());
        assert_eq!(msg.kind(), Some(OperationKind::Publish));
        assert_eq!(msg.message_id(), Some(3));

        msg.step = HandshakeStep::Complete;
        assert!(msg.is_reusable());
    }

    #[test]
    fn reset_clears_state() {
        let mut msg = Message::new([0u8; 16]);
        msg.begin(
            OperationKind::Subscribe,
            PacketType::Subscribe,
            QoS::AtLeastOnce,
            Some(1),
            8,
            3,
        );
        msg.error = Some(ErrorKind::ProtocolFailure);
        msg.reset();
        assert!(msg.is_reusable());
        assert_eq!(msg.kind(), None);
        assert_eq!(msg.last_error(), None);
        assert_eq!(msg.payload_offset, 0);
    }

    #[test]
    fn terminal_steps_per_operation() {
        let mut msg = Message::new([0u8; 16]);
        msg.begin(
            OperationKind::Publish,
            PacketType::Publish,
            QoS::AtMostOnce,
            None,
            4,
            0,
        );
        msg.step = HandshakeStep::FlushTransmit(PacketType::Publish);
        assert!(msg.at_terminal_step());

        msg.begin(
            OperationKind::Publish,
            PacketType::Publish,
            QoS::ExactlyOnce,
            Some(1),
            4,
            0,
        );
        msg.step = HandshakeStep::AwaitReply(PacketType::PubRec);
        assert!(!msg.at_terminal_step());
        msg.step = HandshakeStep::AwaitReply(PacketType::PubComp);
        assert!(msg.at_terminal_step());
    }
}
