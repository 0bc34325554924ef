//! Client context and the application-side operation builders.
//!
//! [`MqttContext`] is the single data block the whole client shares — the
//! admission channel, the message-id bitmap, the per-slot open flags and
//! the dispatch-task wake signal — created once and passed explicitly, no
//! hidden global. [`MqttContext::split`] divides it into the two halves of
//! the producer/consumer boundary: a cloneable [`Requester`] for
//! application threads and the [`Dispatcher`](crate::Dispatcher) that owns
//! every connection and socket.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use log::warn;

use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::error::{ErrorKind, Result};
use crate::id_pool::MsgIdPool;
use crate::message::{Message, OperationKind, PacketBuffer};
use crate::protocol::{encode, PacketType, QoS};
use crate::queue::{ChannelQueue, Sender};
use crate::traits::{Signal, TcpSocket};

/// Caller-chosen connection slot, `0..MAX_CONNS`.
///
/// The slot index is the connection's identity for every operation call;
/// it is claimed by [`Requester::connect`] and vacated on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnId(pub usize);

pub(crate) const SLOT_VACANT: u8 = 0;
pub(crate) const SLOT_OPEN: u8 = 1;

/// A unit of work posted from an application thread to the dispatch task.
pub(crate) enum Request<'a, S: TcpSocket, B: PacketBuffer> {
    /// Admit a new connection together with its CONNECT message.
    Open {
        id: ConnId,
        conn: Connection<'a, S, B>,
        msg: Message<B>,
    },
    /// Queue an already encoded operation on an admitted connection.
    Operation { id: ConnId, msg: Message<B> },
    /// Tear the connection down and post `done` when finished.
    Close { id: ConnId, done: &'a dyn Signal },
}

/// The client instance's shared state.
///
/// Create exactly one per client, then [`split`](Self::split) it. The
/// context must outlive both halves; re-initialization is not supported —
/// drop the context and build a new one instead.
///
/// Capacities are compile-time: `MAX_CONNS` connection slots,
/// `QUEUE_DEPTH` admission-queue entries (must be a power of two), and
/// `32 * ID_WORDS` concurrently outstanding QoS > 0 message identifiers
/// shared across all connections.
pub struct MqttContext<
    'a,
    S: TcpSocket,
    B: PacketBuffer,
    const MAX_CONNS: usize,
    const QUEUE_DEPTH: usize,
    const ID_WORDS: usize,
> {
    pub(crate) requests: ChannelQueue<Request<'a, S, B>, QUEUE_DEPTH>,
    pub(crate) ids: MsgIdPool<ID_WORDS>,
    pub(crate) slot_states: [AtomicU8; MAX_CONNS],
    /// Connections currently admitted to the dispatcher's registry.
    pub(crate) registered: AtomicUsize,
    pub(crate) wake: &'a dyn Signal,
}

impl<
        'a,
        S: TcpSocket,
        B: PacketBuffer,
        const MAX_CONNS: usize,
        const QUEUE_DEPTH: usize,
        const ID_WORDS: usize,
    > MqttContext<'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>
{
    /// Build the context around the dispatch-task wake signal.
    pub fn new(wake: &'a dyn Signal) -> Self {
        Self {
            requests: ChannelQueue::new(),
            ids: MsgIdPool::new(),
            slot_states: [const { AtomicU8::new(SLOT_VACANT) }; MAX_CONNS],
            registered: AtomicUsize::new(0),
            wake,
        }
    }

    /// Split into the application-side [`Requester`] and the dispatch-side
    /// [`Dispatcher`]. Call once; the requester can be cloned per thread.
    pub fn split<'c>(
        &'c mut self,
    ) -> (
        Requester<'c, 'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>,
        Dispatcher<'c, 'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>,
    ) {
        let ctx: &'c Self = self;
        let (tx, rx) = ctx.requests.split();
        (Requester { ctx, tx }, Dispatcher::new(ctx, rx))
    }

    /// Total message identifiers this context can have outstanding.
    pub const fn id_capacity(&self) -> usize {
        ID_WORDS * 32
    }
}

/// Application-side handle: the operation builders.
///
/// Every builder validates synchronously, encodes the packet into the
/// caller's message buffer, and posts the message to the dispatch task.
/// A non-error return means "queued, outcome pending" — completion,
/// success or failure, always arrives through the connection's
/// [`ConnectionEvents`](crate::ConnectionEvents) handler. If the admission
/// queue is full the message is dropped and `ResourceExhausted` returned.
pub struct Requester<
    'c,
    'a,
    S: TcpSocket,
    B: PacketBuffer,
    const MAX_CONNS: usize,
    const QUEUE_DEPTH: usize,
    const ID_WORDS: usize,
> {
    ctx: &'c MqttContext<'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>,
    tx: Sender<Request<'a, S, B>, QUEUE_DEPTH>,
}

impl<
        'c,
        'a,
        S: TcpSocket,
        B: PacketBuffer,
        const MAX_CONNS: usize,
        const QUEUE_DEPTH: usize,
        const ID_WORDS: usize,
    > Clone for Requester<'c, 'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>
{
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx,
            tx: self.tx.clone(),
        }
    }
}

impl<
        'c,
        'a,
        S: TcpSocket,
        B: PacketBuffer,
        const MAX_CONNS: usize,
        const QUEUE_DEPTH: usize,
        const ID_WORDS: usize,
    > Requester<'c, 'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>
{
    /// Send CONNECT on an opened connection, claiming slot `id`.
    ///
    /// The connection (with its publish-receive slot) travels to the
    /// dispatch task and is owned by it until teardown.
    pub fn connect(
        &self,
        id: ConnId,
        conn: Connection<'a, S, B>,
        mut msg: Message<B>,
    ) -> Result<()> {
        if id.0 >= MAX_CONNS {
            return Err(ErrorKind::InvalidArgument);
        }
        if !msg.is_reusable() {
            return Err(ErrorKind::InvalidState);
        }
        if !conn.is_open() {
            return Err(ErrorKind::SocketClosed);
        }

        let state = &self.ctx.slot_states[id.0];
        if state
            .compare_exchange(SLOT_VACANT, SLOT_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ErrorKind::InvalidState);
        }

        let params = encode::ConnectParams {
            client_id: conn.cfg.client_id,
            username: conn.cfg.username,
            password: conn.cfg.password,
            keep_alive_s: conn.cfg.keep_alive_s,
            clean_session: conn.cfg.clean_session,
            will: conn.cfg.will,
        };
        let wire_len = match encode::connect(msg.buffer_mut(), &params) {
            Ok(n) => n,
            Err(e) => {
                state.store(SLOT_VACANT, Ordering::Release);
                return Err(e.into());
            }
        };
        msg.begin(
            OperationKind::Connect,
            PacketType::Connect,
            QoS::AtMostOnce,
            None,
            wire_len,
            0,
        );

        if self.post(Request::Open { id, conn, msg }).is_err() {
            state.store(SLOT_VACANT, Ordering::Release);
            return Err(ErrorKind::ResourceExhausted);
        }
        Ok(())
    }

    /// Publish `payload` on `topic`. QoS > 0 allocates a message
    /// identifier for the acknowledgment handshake.
    pub fn publish(
        &self,
        id: ConnId,
        mut msg: Message<B>,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.check_operation(id, &msg)?;

        let msg_id = if qos != QoS::AtMostOnce {
            Some(self.ctx.ids.allocate().ok_or(ErrorKind::ResourceExhausted)?)
        } else {
            None
        };

        let wire_len = match encode::publish(msg.buffer_mut(), topic, payload, qos, retain, msg_id)
        {
            Ok(n) => n,
            Err(e) => {
                self.release_id(msg_id);
                return Err(e.into());
            }
        };
        msg.begin(OperationKind::Publish, PacketType::Publish, qos, msg_id, wire_len, 0);
        self.post_operation(id, msg)
    }

    /// Subscribe to a single topic filter.
    pub fn subscribe(
        &self,
        id: ConnId,
        msg: Message<B>,
        topic: &str,
        requested_qos: QoS,
    ) -> Result<()> {
        self.subscribe_many(id, msg, &[(topic, requested_qos)])
    }

    /// Subscribe to several topic filters in one SUBSCRIBE packet.
    ///
    /// The message buffer must hold the wire packet plus one byte per
    /// topic plus one: the requested QoS values are kept in front of the
    /// packet for verification against the SUBACK grant.
    pub fn subscribe_many(
        &self,
        id: ConnId,
        mut msg: Message<B>,
        topics: &[(&str, QoS)],
    ) -> Result<()> {
        self.check_operation(id, &msg)?;

        let msg_id = self.ctx.ids.allocate().ok_or(ErrorKind::ResourceExhausted)?;
        let layout = match encode::subscribe(msg.buffer_mut(), msg_id, topics) {
            Ok(layout) => layout,
            Err(e) => {
                self.ctx.ids.release(msg_id);
                return Err(e.into());
            }
        };
        msg.begin(
            OperationKind::Subscribe,
            PacketType::Subscribe,
            QoS::AtLeastOnce,
            Some(msg_id),
            layout.wire_len,
            layout.payload_offset,
        );
        self.post_operation(id, msg)
    }

    /// Unsubscribe from a single topic filter.
    pub fn unsubscribe(&self, id: ConnId, msg: Message<B>, topic: &str) -> Result<()> {
        self.unsubscribe_many(id, msg, &[topic])
    }

    /// Unsubscribe from several topic filters in one UNSUBSCRIBE packet.
    pub fn unsubscribe_many(
        &self,
        id: ConnId,
        mut msg: Message<B>,
        topics: &[&str],
    ) -> Result<()> {
        self.check_operation(id, &msg)?;

        let msg_id = self.ctx.ids.allocate().ok_or(ErrorKind::ResourceExhausted)?;
        let wire_len = match encode::unsubscribe(msg.buffer_mut(), msg_id, topics) {
            Ok(n) => n,
            Err(e) => {
                self.ctx.ids.release(msg_id);
                return Err(e.into());
            }
        };
        msg.begin(
            OperationKind::Unsubscribe,
            PacketType::Unsubscribe,
            QoS::AtLeastOnce,
            Some(msg_id),
            wire_len,
            0,
        );
        self.post_operation(id, msg)
    }

    /// Send a PINGREQ.
    pub fn ping_req(&self, id: ConnId, mut msg: Message<B>) -> Result<()> {
        self.check_operation(id, &msg)?;
        let wire_len = encode::ping_req(msg.buffer_mut()).map_err(ErrorKind::from)?;
        msg.begin(
            OperationKind::PingReq,
            PacketType::PingReq,
            QoS::AtMostOnce,
            None,
            wire_len,
            0,
        );
        self.post_operation(id, msg)
    }

    /// Send a DISCONNECT. Completing it tears the connection down and
    /// completes everything still queued behind it with `SocketClosed`.
    pub fn disconnect(&self, id: ConnId, mut msg: Message<B>) -> Result<()> {
        self.check_operation(id, &msg)?;
        let wire_len = encode::disconnect(msg.buffer_mut()).map_err(ErrorKind::from)?;
        msg.begin(
            OperationKind::Disconnect,
            PacketType::Disconnect,
            QoS::AtMostOnce,
            None,
            wire_len,
            0,
        );
        self.post_operation(id, msg)
    }

    /// Request connection teardown. The dispatch task completes every
    /// queued message with `SocketClosed` and posts `done` when finished.
    pub fn request_close(&self, id: ConnId, done: &'a dyn Signal) -> Result<()> {
        if id.0 >= MAX_CONNS {
            return Err(ErrorKind::InvalidArgument);
        }
        if self.ctx.slot_states[id.0].load(Ordering::Acquire) != SLOT_OPEN {
            return Err(ErrorKind::SocketClosed);
        }
        self.post(Request::Close { id, done })
            .map_err(|_| ErrorKind::ResourceExhausted)
    }

    /// Synchronous close: request teardown and block on `done` until the
    /// dispatch task has finished it.
    pub fn close(&self, id: ConnId, done: &'a dyn Signal) -> Result<()> {
        self.request_close(id, done)?;
        done.wait();
        Ok(())
    }

    fn check_operation(&self, id: ConnId, msg: &Message<B>) -> Result<()> {
        if id.0 >= MAX_CONNS {
            return Err(ErrorKind::InvalidArgument);
        }
        if !msg.is_reusable() {
            return Err(ErrorKind::InvalidState);
        }
        if self.ctx.slot_states[id.0].load(Ordering::Acquire) != SLOT_OPEN {
            return Err(ErrorKind::SocketClosed);
        }
        Ok(())
    }

    fn post_operation(&self, id: ConnId, msg: Message<B>) -> Result<()> {
        let msg_id = msg.msg_id;
        if self.post(Request::Operation { id, msg }).is_err() {
            self.release_id(msg_id);
            warn!("request queue full, dropping operation for slot {}", id.0);
            return Err(ErrorKind::ResourceExhausted);
        }
        Ok(())
    }

    fn post(&self, request: Request<'a, S, B>) -> core::result::Result<(), ()> {
        self.tx.try_send(request).map_err(|_| ())?;
        // The dispatch task blocks on the wake signal while no connection
        // is registered; a post in that window must wake it.
        if self.ctx.registered.load(Ordering::Acquire) == 0 {
            self.ctx.wake.post();
        }
        Ok(())
    }

    fn release_id(&self, msg_id: Option<u16>) {
        if let Some(id) = msg_id {
            self.ctx.ids.release(id);
        }
    }
}
