//! One MQTT session over one socket.

use log::debug;

use crate::error::{ErrorKind, Result};
use crate::message::{HandshakeStep, Message, OperationKind, PacketBuffer};
use crate::protocol::encode::LastWill;
use crate::protocol::fixed_header::RemainingLengthDecoder;
use crate::protocol::{PacketType, QoS};
use crate::traits::{Interest, TcpSocket};

/// Default MQTT broker port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Default socket-open timeout, in milliseconds.
pub const DEFAULT_OPEN_TIMEOUT_MS: u32 = 10_000;

/// Bytes reserved at the start of the publish-receive buffer so the
/// PUBACK/PUBREC/PUBCOMP reply can be built in place (fixed header plus
/// packet identifier) without overwriting the received body.
pub const PUBLISH_RX_RESERVED: usize = 4;

/// Static parameters of a connection.
///
/// String fields are borrowed and must outlive the connection; the engine
/// reads them when encoding CONNECT and never copies them.
#[derive(Debug, Clone)]
pub struct ConnectionConfig<'a> {
    pub broker_host: &'a str,
    pub broker_port: u16,
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    /// Keep-alive interval declared in CONNECT; 0 disables it.
    pub keep_alive_s: u16,
    /// Session inactivity timeout, for platform code that enforces one;
    /// 0 disables it.
    pub inactivity_timeout_s: u16,
    /// Timeout for the blocking socket open.
    pub open_timeout_ms: u32,
    pub clean_session: bool,
    pub will: Option<LastWill<'a>>,
}

impl<'a> ConnectionConfig<'a> {
    /// Config with protocol defaults: port 1883, 10 s open timeout,
    /// keep-alive disabled, clean session, no credentials, no will.
    pub fn new(broker_host: &'a str, client_id: &'a str) -> Self {
        Self {
            broker_host,
            broker_port: DEFAULT_BROKER_PORT,
            client_id,
            username: None,
            password: None,
            keep_alive_s: 0,
            inactivity_timeout_s: 0,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            clean_session: true,
            will: None,
        }
    }
}

/// Completion handlers for one connection.
///
/// All methods have empty defaults; implement the ones the application
/// cares about. For every completed operation the engine first calls the
/// generic [`on_complete`](Self::on_complete) (message by reference),
/// then the operation-specific method (message by value, returning buffer
/// ownership to the application).
pub trait ConnectionEvents<B: PacketBuffer> {
    /// Generic completion hook, invoked before the operation-specific one.
    fn on_complete(&self, _kind: OperationKind, _msg: &mut Message<B>, _result: Result<()>) {}

    fn on_connect_complete(&self, _msg: Message<B>, _result: Result<()>) {}
    fn on_publish_complete(&self, _msg: Message<B>, _result: Result<()>) {}
    fn on_subscribe_complete(&self, _msg: Message<B>, _result: Result<()>) {}
    fn on_unsubscribe_complete(&self, _msg: Message<B>, _result: Result<()>) {}
    fn on_ping_complete(&self, _msg: Message<B>, _result: Result<()>) {}
    fn on_disconnect_complete(&self, _msg: Message<B>, _result: Result<()>) {}

    /// An inbound PUBLISH arrived on a subscribed topic. Fires as soon as
    /// the body is fully received, before any acknowledgment is sent.
    /// The slices borrow the connection's publish-receive buffer.
    fn on_publish_received(&self, _topic: &str, _payload: &[u8], _qos: QoS) {}

    /// The connection was torn down by a socket fault or protocol
    /// violation. Queued operations have already been completed with
    /// [`ErrorKind::SocketClosed`].
    fn on_connection_error(&self, _err: ErrorKind) {}
}

/// Incremental decode state for the packet currently arriving.
///
/// Every field survives a `WouldBlock` so a packet split across socket
/// reads resumes exactly where it stopped.
#[derive(Debug, Default)]
pub(crate) struct InboundState {
    /// Fixed-header first byte, once read.
    pub header: Option<u8>,
    /// Packet type decoded from `header`.
    pub kind: Option<PacketType>,
    /// Partial remaining-length varint.
    pub len_decoder: RemainingLengthDecoder,
    pub len_complete: bool,
    /// Body bytes still to receive (after the packet id, where present).
    pub remaining: usize,
    /// First packet-identifier byte when the id itself got split.
    pub msg_id_first: Option<u8>,
    pub msg_id: Option<u16>,
    pub msg_id_complete: bool,
    /// Body bytes received so far.
    pub rx_count: usize,
    /// Where the packet is being routed, once known.
    pub target: Option<InboundTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundTarget {
    /// The connection's dedicated publish-receive slot.
    PublishSlot,
    /// The message at the head of the transmit queue.
    TxHead,
}

impl InboundState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One open MQTT session: socket, configuration, completion handlers, the
/// dedicated publish-receive message slot, and the incremental inbound
/// decode state.
///
/// Created by the caller, handed to the engine with the CONNECT request,
/// owned by the dispatch task until teardown.
pub struct Connection<'a, S: TcpSocket, B: PacketBuffer> {
    pub(crate) socket: Option<S>,
    pub(crate) cfg: ConnectionConfig<'a>,
    pub(crate) events: &'a dyn ConnectionEvents<B>,
    pub(crate) publish_rx: Message<B>,
    /// Remaining length of the inbound PUBLISH currently in the slot.
    pub(crate) publish_rem_len: usize,
    pub(crate) interest: Interest,
    /// Transmit progress of the message currently going out.
    pub(crate) tx_cursor: usize,
    pub(crate) inbound: InboundState,
}

impl<'a, S: TcpSocket, B: PacketBuffer> Connection<'a, S, B> {
    /// Open a socket to the configured broker and build the connection
    /// around it. Runs on the application thread; this is the only
    /// blocking call of the connection lifecycle.
    ///
    /// `publish_rx_buf` becomes the dedicated publish-receive buffer; it
    /// must hold [`PUBLISH_RX_RESERVED`] bytes plus the largest expected
    /// inbound PUBLISH.
    pub fn open(
        cfg: ConnectionConfig<'a>,
        events: &'a dyn ConnectionEvents<B>,
        publish_rx_buf: B,
    ) -> Result<Self> {
        let socket = S::open(cfg.broker_host, cfg.broker_port, cfg.open_timeout_ms)
            .map_err(|_| ErrorKind::SocketClosed)?;
        debug!("opened socket to {}:{}", cfg.broker_host, cfg.broker_port);
        Ok(Self::from_socket(socket, cfg, events, publish_rx_buf))
    }

    /// Build the connection around an already established socket (for
    /// example one with a TLS session negotiated by the caller).
    pub fn from_socket(
        socket: S,
        cfg: ConnectionConfig<'a>,
        events: &'a dyn ConnectionEvents<B>,
        publish_rx_buf: B,
    ) -> Self {
        let mut publish_rx = Message::new(publish_rx_buf);
        publish_rx.kind = Some(OperationKind::Publish);
        publish_rx.step = HandshakeStep::AwaitReply(PacketType::Publish);

        Self {
            socket: Some(socket),
            cfg,
            events,
            publish_rx,
            publish_rem_len: 0,
            interest: Interest::NONE,
            tx_cursor: 0,
            inbound: InboundState::new(),
        }
    }

    /// The socket handle is present if and only if the connection is open.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Return the publish-receive slot to waiting-for-PUBLISH after a
    /// received message (and its acknowledgment, if any) finished.
    pub(crate) fn rearm_publish_rx(&mut self) {
        self.publish_rx.step = HandshakeStep::AwaitReply(PacketType::Publish);
        self.publish_rx.qos = QoS::AtMostOnce;
        self.publish_rx.msg_id = None;
        self.publish_rx.payload_offset = 0;
        self.publish_rx.wire_len = 0;
        self.publish_rx.error = None;
        self.publish_rem_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = ConnectionConfig::new("broker.local", "dev01");
        assert_eq!(cfg.broker_port, DEFAULT_BROKER_PORT);
        assert_eq!(cfg.open_timeout_ms, DEFAULT_OPEN_TIMEOUT_MS);
        assert_eq!(cfg.keep_alive_s, 0);
        assert!(cfg.clean_session);
        assert!(cfg.username.is_none());
        assert!(cfg.will.is_none());
    }
}
