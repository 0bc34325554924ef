//! The dispatch task: connection registry, socket drivers and the
//! cooperative loop.
//!
//! Exactly one [`Dispatcher`] exists per context. It owns every admitted
//! connection, performs all socket I/O and all message state transitions,
//! and is the only code that runs completion callbacks. It never blocks
//! except in [`run`](Dispatcher::run)'s idle wait and tick sleep.

use core::sync::atomic::Ordering;

use heapless::Deque;
use log::{debug, error, trace, warn};

use crate::client::{ConnId, MqttContext, Request, SLOT_VACANT};
use crate::connection::{Connection, ConnectionEvents, InboundTarget, PUBLISH_RX_RESERVED};
use crate::error::{ErrorKind, Result};
use crate::id_pool::MsgIdPool;
use crate::message::{HandshakeStep, Message, OperationKind, PacketBuffer};
use crate::protocol::{decode, encode, PacketType, QoS};
use crate::queue::Receiver;
use crate::traits::{Delay, Interest, TcpSocket};

/// Default sleep between loop iterations, in milliseconds.
pub const DEFAULT_TICK_MS: u32 = 1;

/// One registry entry: the connection plus its FIFO transmit queue.
struct ConnSlot<'a, S: TcpSocket, B: PacketBuffer, const QUEUE_DEPTH: usize> {
    conn: Connection<'a, S, B>,
    tx_queue: Deque<Message<B>, QUEUE_DEPTH>,
}

/// Which message the write driver services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteSource {
    /// The connection's publish-receive slot (acknowledgment replies).
    PublishSlot,
    /// The head of the transmit queue.
    TxHead,
}

/// What one pump of the inbound decoder produced.
enum ReadOutcome {
    /// Blocked mid-packet; progress is saved for the next iteration.
    Pending,
    /// A complete packet body is in its target buffer.
    BodyReady,
    /// The connection cannot continue.
    Fatal(ErrorKind),
}

/// The dispatch half of a split [`MqttContext`].
///
/// Drive it with [`poll`](Self::poll) from an existing loop, or hand it a
/// task and call [`run`](Self::run).
pub struct Dispatcher<
    'c,
    'a,
    S: TcpSocket,
    B: PacketBuffer,
    const MAX_CONNS: usize,
    const QUEUE_DEPTH: usize,
    const ID_WORDS: usize,
> {
    ctx: &'c MqttContext<'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>,
    rx: Receiver<Request<'a, S, B>, QUEUE_DEPTH>,
    conns: [Option<ConnSlot<'a, S, B, QUEUE_DEPTH>>; MAX_CONNS],
    tick_ms: u32,
}

impl<
        'c,
        'a,
        S: TcpSocket,
        B: PacketBuffer,
        const MAX_CONNS: usize,
        const QUEUE_DEPTH: usize,
        const ID_WORDS: usize,
    > Dispatcher<'c, 'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>
{
    pub(crate) fn new(
        ctx: &'c MqttContext<'a, S, B, MAX_CONNS, QUEUE_DEPTH, ID_WORDS>,
        rx: Receiver<Request<'a, S, B>, QUEUE_DEPTH>,
    ) -> Self {
        Self {
            ctx,
            rx,
            conns: [const { None }; MAX_CONNS],
            tick_ms: DEFAULT_TICK_MS,
        }
    }

    /// Sleep between loop iterations.
    pub fn set_tick_ms(&mut self, tick_ms: u32) {
        self.tick_ms = tick_ms;
    }

    /// Number of connections currently admitted.
    pub fn registered_count(&self) -> usize {
        self.conns.iter().filter(|slot| slot.is_some()).count()
    }

    /// One cooperative iteration: service readiness on every registered
    /// connection, then drain newly posted requests.
    pub fn poll(&mut self) {
        self.io_pass();
        self.drain_requests();
    }

    /// Run the dispatch loop forever. Blocks on the context's wake signal
    /// while no connection is registered, otherwise sleeps `tick_ms`
    /// between iterations.
    pub fn run(&mut self, delay: &mut impl Delay) -> ! {
        loop {
            if self.ctx.registered.load(Ordering::Acquire) == 0 {
                self.ctx.wake.wait();
            } else {
                self.io_pass();
            }
            self.drain_requests();
            delay.sleep_ms(self.tick_ms);
        }
    }

    fn io_pass(&mut self) {
        for idx in 0..MAX_CONNS {
            if self.conns[idx].is_some() {
                self.service_slot(idx);
            }
        }
    }

    /// Readiness check plus at most one driver invocation for one slot.
    /// Write and read are mutually exclusive within one pass; a pending
    /// transmission is serviced before any receive.
    fn service_slot(&mut self, idx: usize) {
        enum Action {
            None,
            Write(WriteSource),
            Read,
        }

        let action = {
            let slot = match self.conns[idx].as_mut() {
                Some(slot) => slot,
                None => return,
            };
            let interest = slot.conn.interest;
            let ready = match slot.conn.socket.as_mut() {
                Some(sock) if interest.any() => sock.readiness(interest),
                _ => return,
            };

            let want_write = interest.write && ready.writable;
            let want_read =
                (interest.read && ready.readable) || (interest.error && ready.errored);

            if want_write {
                let slot_step = slot.conn.publish_rx.step;
                let head_step = slot.tx_queue.front().map(|m| m.step);
                if matches!(slot_step, HandshakeStep::FlushTransmit(_)) {
                    Action::Write(WriteSource::PublishSlot)
                } else if matches!(head_step, Some(HandshakeStep::FlushTransmit(_))) {
                    Action::Write(WriteSource::TxHead)
                } else if matches!(slot_step, HandshakeStep::Transmit(_)) {
                    Action::Write(WriteSource::PublishSlot)
                } else if matches!(head_step, Some(HandshakeStep::Transmit(_))) {
                    Action::Write(WriteSource::TxHead)
                } else {
                    slot.conn.interest.write = false;
                    Action::None
                }
            } else if want_read {
                Action::Read
            } else {
                Action::None
            }
        };

        match action {
            Action::Write(source) => self.drive_write(idx, source),
            Action::Read => self.drive_read(idx),
            Action::None => {}
        }

        // A queued message waiting to transmit keeps write interest up.
        if let Some(slot) = self.conns[idx].as_mut() {
            if matches!(
                slot.tx_queue.front().map(|m| m.step),
                Some(HandshakeStep::Transmit(_))
            ) {
                slot.conn.interest.write = true;
            }
        }
    }

    // ===== WRITE PATH =====

    fn drive_write(&mut self, idx: usize, source: WriteSource) {
        let step = {
            let slot = match self.conns[idx].as_ref() {
                Some(slot) => slot,
                None => return,
            };
            match source {
                WriteSource::PublishSlot => slot.conn.publish_rx.step,
                WriteSource::TxHead => slot
                    .tx_queue
                    .front()
                    .map(|m| m.step)
                    .unwrap_or(HandshakeStep::Idle),
            }
        };

        match step {
            HandshakeStep::Transmit(packet) => self.transmit_step(idx, source, packet),
            HandshakeStep::FlushTransmit(packet) => {
                self.advance_after_transmit(idx, source, packet)
            }
            _ => {}
        }
    }

    /// Push the next chunk of the current packet through the socket.
    fn transmit_step(&mut self, idx: usize, source: WriteSource, packet: PacketType) {
        enum TxOutcome {
            Progress,
            Blocked,
            Fatal,
        }

        fn send_chunk<S: TcpSocket, B: PacketBuffer>(
            sock: &mut S,
            msg: &mut Message<B>,
            cursor: &mut usize,
            packet: PacketType,
        ) -> TxOutcome {
            let start = msg.payload_offset + *cursor;
            let end = msg.payload_offset + msg.wire_len;
            match sock.send(&msg.buf.as_ref()[start..end]) {
                Ok(sent) => {
                    trace!("transmitted {} bytes of {:?}", sent, packet);
                    *cursor += sent;
                    if *cursor >= msg.wire_len {
                        msg.step = HandshakeStep::FlushTransmit(packet);
                        *cursor = 0;
                    }
                    TxOutcome::Progress
                }
                Err(crate::traits::SocketError::WouldBlock) => TxOutcome::Blocked,
                Err(err) => {
                    error!("transmit error: {:?}", err);
                    TxOutcome::Fatal
                }
            }
        }

        let outcome = {
            let slot = match self.conns[idx].as_mut() {
                Some(slot) => slot,
                None => return,
            };
            // Sending CONNECT is the point where the connection starts
            // listening for the broker's reply.
            if packet == PacketType::Connect {
                slot.conn.interest.read = true;
                slot.conn.interest.error = true;
            }
            match source {
                WriteSource::PublishSlot => {
                    let conn = &mut slot.conn;
                    match conn.socket.as_mut() {
                        Some(sock) => {
                            send_chunk(sock, &mut conn.publish_rx, &mut conn.tx_cursor, packet)
                        }
                        None => return,
                    }
                }
                WriteSource::TxHead => {
                    match (slot.conn.socket.as_mut(), slot.tx_queue.front_mut()) {
                        (Some(sock), Some(msg)) => {
                            send_chunk(sock, msg, &mut slot.conn.tx_cursor, packet)
                        }
                        _ => return,
                    }
                }
            }
        };

        if matches!(outcome, TxOutcome::Fatal) {
            self.teardown_slot(idx, Some(ErrorKind::SocketClosed));
        }
    }

    /// A packet finished transmitting: advance its handshake.
    fn advance_after_transmit(&mut self, idx: usize, source: WriteSource, packet: PacketType) {
        match (source, packet) {
            // Acknowledgment replies on the publish-receive slot.
            (WriteSource::PublishSlot, PacketType::PubAck)
            | (WriteSource::PublishSlot, PacketType::PubComp) => {
                if let Some(slot) = self.conns[idx].as_mut() {
                    trace!("inbound publish acknowledged on slot {}", idx);
                    slot.conn.rearm_publish_rx();
                }
            }
            (WriteSource::PublishSlot, PacketType::PubRec) => {
                if let Some(slot) = self.conns[idx].as_mut() {
                    slot.conn.publish_rx.step = HandshakeStep::AwaitReply(PacketType::PubRel);
                }
            }
            (WriteSource::PublishSlot, other) => {
                error!("publish-receive slot flushed unexpected {:?}", other);
            }

            (WriteSource::TxHead, PacketType::Connect) => {
                self.await_reply(idx, PacketType::ConnAck, 2);
            }
            (WriteSource::TxHead, PacketType::Publish) => {
                let qos = match self.conns[idx].as_ref().and_then(|s| s.tx_queue.front()) {
                    Some(head) => head.qos,
                    None => return,
                };
                match qos {
                    QoS::AtMostOnce => self.complete_head(idx, Ok(())),
                    QoS::AtLeastOnce => self.await_reply(idx, PacketType::PubAck, 0),
                    QoS::ExactlyOnce => self.await_reply(idx, PacketType::PubRec, 0),
                }
            }
            (WriteSource::TxHead, PacketType::PubRel) => {
                self.await_reply(idx, PacketType::PubComp, 0);
            }
            (WriteSource::TxHead, PacketType::Subscribe) => {
                // The topic count sits just below the wire packet; the
                // SUBACK grant list must be exactly that long.
                let count = match self.conns[idx].as_ref().and_then(|s| s.tx_queue.front()) {
                    Some(head) if head.payload_offset > 0 => {
                        head.buf.as_ref()[head.payload_offset - 1] as usize
                    }
                    _ => return,
                };
                self.await_reply(idx, PacketType::SubAck, count);
            }
            (WriteSource::TxHead, PacketType::Unsubscribe) => {
                self.await_reply(idx, PacketType::UnsubAck, 0);
            }
            (WriteSource::TxHead, PacketType::PingReq) => {
                self.await_reply(idx, PacketType::PingResp, 0);
            }
            (WriteSource::TxHead, PacketType::Disconnect) => {
                debug!("disconnect transmitted on slot {}, tearing down", idx);
                self.complete_head(idx, Ok(()));
                self.teardown_slot(idx, None);
            }
            (WriteSource::TxHead, other) => {
                error!("transmit queue flushed unexpected {:?}", other);
            }
        }
    }

    fn await_reply(&mut self, idx: usize, reply: PacketType, expected_len: usize) {
        if let Some(head) = self.conns[idx]
            .as_mut()
            .and_then(|slot| slot.tx_queue.front_mut())
        {
            trace!("awaiting {:?} on slot {}", reply, idx);
            head.step = HandshakeStep::AwaitReply(reply);
            head.expected_len = expected_len;
        }
    }

    // ===== READ PATH =====

    fn drive_read(&mut self, idx: usize) {
        let outcome = {
            let ids = &self.ctx.ids;
            match self.conns[idx].as_mut() {
                Some(slot) => Self::pump_inbound(slot, ids),
                None => return,
            }
        };

        match outcome {
            ReadOutcome::Pending => {}
            ReadOutcome::Fatal(kind) => self.teardown_slot(idx, Some(kind)),
            ReadOutcome::BodyReady => self.interpret_inbound(idx),
        }
    }

    /// Pump inbound bytes through the staged decoder: header byte,
    /// expected-type check, remaining-length varint, packet identifier,
    /// body. Any `WouldBlock` returns with all progress retained in the
    /// connection's [`InboundState`].
    fn pump_inbound(
        slot: &mut ConnSlot<'a, S, B, QUEUE_DEPTH>,
        ids: &MsgIdPool<ID_WORDS>,
    ) -> ReadOutcome {
        use crate::traits::SocketError;

        macro_rules! recv_byte {
            ($sock:expr) => {{
                let mut byte = [0u8; 1];
                match $sock.receive(&mut byte) {
                    Ok(0) => return ReadOutcome::Pending,
                    Ok(_) => byte[0],
                    Err(SocketError::WouldBlock) => return ReadOutcome::Pending,
                    Err(err) => {
                        error!("receive error: {:?}", err);
                        return ReadOutcome::Fatal(ErrorKind::SocketClosed);
                    }
                }
            }};
        }

        let conn = &mut slot.conn;

        if conn.inbound.target.is_none() {
            // Stage 1: fixed-header first byte.
            if conn.inbound.header.is_none() {
                let sock = match conn.socket.as_mut() {
                    Some(sock) => sock,
                    None => return ReadOutcome::Pending,
                };
                let header = recv_byte!(sock);
                let kind = match PacketType::from_header_byte(header) {
                    Some(kind) if kind.is_server_to_client() => kind,
                    _ => {
                        error!("received unreceivable packet header {:#04x}", header);
                        return ReadOutcome::Fatal(ErrorKind::ProtocolFailure);
                    }
                };
                trace!("inbound {:?}", kind);
                conn.inbound.header = Some(header);
                conn.inbound.kind = Some(kind);
            }
            let kind = match conn.inbound.kind {
                Some(kind) => kind,
                None => return ReadOutcome::Pending,
            };

            // Stage 2: the packet must be the one an in-flight message is
            // waiting for. Anything else cannot be resynchronized.
            let slot_expect = match conn.publish_rx.step {
                HandshakeStep::AwaitReply(pt) => Some(pt),
                _ => None,
            };
            let head_expect = slot.tx_queue.front().and_then(|m| match m.step {
                HandshakeStep::AwaitReply(pt) => Some(pt),
                _ => None,
            });
            let target = if slot_expect == Some(kind) {
                InboundTarget::PublishSlot
            } else if head_expect == Some(kind) {
                InboundTarget::TxHead
            } else {
                error!(
                    "unexpected inbound {:?} (slot awaits {:?}, head awaits {:?})",
                    kind, slot_expect, head_expect
                );
                return ReadOutcome::Fatal(ErrorKind::ProtocolFailure);
            };

            // Stage 3: remaining length, one byte at a time.
            if !conn.inbound.len_complete {
                loop {
                    let sock = match conn.socket.as_mut() {
                        Some(sock) => sock,
                        None => return ReadOutcome::Pending,
                    };
                    let byte = recv_byte!(sock);
                    match conn.inbound.len_decoder.push(byte) {
                        Ok(Some(len)) => {
                            conn.inbound.remaining = len;
                            conn.inbound.len_complete = true;
                            if kind == PacketType::Publish {
                                conn.publish_rem_len = len;
                            }
                            trace!("inbound remaining length {}", len);
                            break;
                        }
                        Ok(None) => continue,
                        Err(err) => {
                            error!("bad remaining length: {}", err);
                            return ReadOutcome::Fatal(ErrorKind::ProtocolFailure);
                        }
                    }
                }
            }

            // Stage 4: packet identifier, for the types that carry one in
            // the variable header. Survives a split between the bytes.
            let has_msg_id = matches!(
                kind,
                PacketType::PubAck
                    | PacketType::PubRec
                    | PacketType::PubRel
                    | PacketType::PubComp
                    | PacketType::SubAck
                    | PacketType::UnsubAck
            );
            if has_msg_id && !conn.inbound.msg_id_complete {
                while conn.inbound.msg_id.is_none() {
                    let sock = match conn.socket.as_mut() {
                        Some(sock) => sock,
                        None => return ReadOutcome::Pending,
                    };
                    let byte = recv_byte!(sock);
                    match conn.inbound.msg_id_first {
                        None => conn.inbound.msg_id_first = Some(byte),
                        Some(high) => {
                            conn.inbound.msg_id = Some(u16::from_be_bytes([high, byte]))
                        }
                    }
                }
                conn.inbound.remaining = conn.inbound.remaining.saturating_sub(2);
                conn.inbound.msg_id_complete = true;
                trace!("inbound packet id {:?}", conn.inbound.msg_id);
            }

            // Stage 5: route the body and validate its length.
            match target {
                InboundTarget::PublishSlot => {
                    if kind == PacketType::Publish {
                        let capacity = conn.publish_rx.buf.as_ref().len();
                        if conn.inbound.remaining + PUBLISH_RX_RESERVED > capacity {
                            // A length-prefixed stream cannot be resumed
                            // past bytes there is no room to read.
                            error!(
                                "inbound publish of {} bytes exceeds receive buffer of {}",
                                conn.inbound.remaining, capacity
                            );
                            return ReadOutcome::Fatal(ErrorKind::WouldOverflow);
                        }
                    }
                    conn.inbound.target = Some(InboundTarget::PublishSlot);
                }
                InboundTarget::TxHead => {
                    let head_ok = {
                        let head = match slot.tx_queue.front() {
                            Some(head) => head,
                            None => return ReadOutcome::Pending,
                        };
                        conn.inbound.remaining == head.expected_len
                            && head.payload_offset + conn.inbound.remaining
                                <= head.buf.as_ref().len()
                    };
                    if !head_ok {
                        error!(
                            "inbound {:?} length {} does not match expectation",
                            kind, conn.inbound.remaining
                        );
                        let events = conn.events;
                        if let Some(msg) = slot.tx_queue.pop_front() {
                            Self::finish_message(events, ids, msg, Err(ErrorKind::ProtocolFailure));
                        }
                        conn.inbound.reset();
                        return ReadOutcome::Pending;
                    }
                    conn.inbound.target = Some(InboundTarget::TxHead);
                }
            }
        }

        // Stage 6: body bytes into the target buffer.
        let target = match conn.inbound.target {
            Some(target) => target,
            None => return ReadOutcome::Pending,
        };
        if conn.inbound.remaining > 0 {
            let remaining = conn.inbound.remaining;
            let rx_count = conn.inbound.rx_count;
            let (start, buf): (usize, &mut [u8]) = match target {
                InboundTarget::PublishSlot => {
                    (PUBLISH_RX_RESERVED + rx_count, conn.publish_rx.buf.as_mut())
                }
                InboundTarget::TxHead => match slot.tx_queue.front_mut() {
                    Some(head) => (head.payload_offset + rx_count, head.buf.as_mut()),
                    None => return ReadOutcome::Pending,
                },
            };
            let sock = match conn.socket.as_mut() {
                Some(sock) => sock,
                None => return ReadOutcome::Pending,
            };
            let read = match sock.receive(&mut buf[start..start + remaining]) {
                Ok(0) => return ReadOutcome::Pending,
                Ok(read) => read,
                Err(SocketError::WouldBlock) => return ReadOutcome::Pending,
                Err(err) => {
                    error!("receive error: {:?}", err);
                    return ReadOutcome::Fatal(ErrorKind::SocketClosed);
                }
            };
            conn.inbound.remaining -= read;
            conn.inbound.rx_count += read;
            if conn.inbound.remaining > 0 {
                return ReadOutcome::Pending;
            }
        }

        ReadOutcome::BodyReady
    }

    /// A full packet body arrived: act on it.
    fn interpret_inbound(&mut self, idx: usize) {
        let (target, kind) = {
            let slot = match self.conns[idx].as_ref() {
                Some(slot) => slot,
                None => return,
            };
            match (slot.conn.inbound.target, slot.conn.inbound.kind) {
                (Some(target), Some(kind)) => (target, kind),
                _ => return,
            }
        };

        match (target, kind) {
            (InboundTarget::PublishSlot, PacketType::Publish) => self.inbound_publish(idx),
            (InboundTarget::PublishSlot, PacketType::PubRel) => self.inbound_pubrel(idx),
            (InboundTarget::PublishSlot, other) => {
                error!("publish-receive slot got {:?}", other);
                self.teardown_slot(idx, Some(ErrorKind::ProtocolFailure));
            }
            (InboundTarget::TxHead, kind) => self.head_reply(idx, kind),
        }
    }

    /// A PUBLISH from the broker is fully received: deliver it, then (for
    /// QoS > 0) build the acknowledgment in the same buffer and queue it
    /// for transmission.
    fn inbound_publish(&mut self, idx: usize) {
        let fatal: Option<ErrorKind> = {
            let slot = match self.conns[idx].as_mut() {
                Some(slot) => slot,
                None => return,
            };
            let conn = &mut slot.conn;
            let header = conn.inbound.header.unwrap_or(0);
            let body_len = conn.publish_rem_len;

            match QoS::from_u8((header >> 1) & 0x3) {
                Ok(qos) => {
                    let packet_id = {
                        let body = &conn.publish_rx.buf.as_ref()
                            [PUBLISH_RX_RESERVED..PUBLISH_RX_RESERVED + body_len];
                        match decode::publish_body(body, qos) {
                            Ok(view) => {
                                debug!(
                                    "publish received on '{}' ({} bytes, {:?})",
                                    view.topic,
                                    view.payload.len(),
                                    qos
                                );
                                conn.events.on_publish_received(view.topic, view.payload, qos);
                                view.packet_id
                            }
                            Err(err) => {
                                error!("malformed inbound publish: {}", err);
                                conn.inbound.reset();
                                return;
                            }
                        }
                    };

                    match (qos, packet_id) {
                        (QoS::AtMostOnce, _) => {
                            conn.rearm_publish_rx();
                            conn.inbound.reset();
                            None
                        }
                        (_, Some(id)) => {
                            let reply = if qos == QoS::AtLeastOnce {
                                PacketType::PubAck
                            } else {
                                PacketType::PubRec
                            };
                            match encode::ack(conn.publish_rx.buf.as_mut(), reply, id) {
                                Ok(len) => {
                                    conn.publish_rx.step = HandshakeStep::Transmit(reply);
                                    conn.publish_rx.wire_len = len;
                                    conn.publish_rx.payload_offset = 0;
                                    conn.publish_rx.qos = qos;
                                    conn.publish_rx.msg_id = Some(id);
                                    conn.interest.write = true;
                                    conn.inbound.reset();
                                    None
                                }
                                Err(_) => Some(ErrorKind::WouldOverflow),
                            }
                        }
                        // decode::publish_body guarantees an id for QoS > 0.
                        (_, None) => Some(ErrorKind::ProtocolFailure),
                    }
                }
                Err(_) => Some(ErrorKind::ProtocolFailure),
            }
        };

        if let Some(kind) = fatal {
            self.teardown_slot(idx, Some(kind));
        }
    }

    /// PUBREL for an inbound QoS 2 publish: reply with PUBCOMP.
    fn inbound_pubrel(&mut self, idx: usize) {
        let fatal = {
            let slot = match self.conns[idx].as_mut() {
                Some(slot) => slot,
                None => return,
            };
            let conn = &mut slot.conn;
            let id = conn
                .publish_rx
                .msg_id
                .or(conn.inbound.msg_id)
                .unwrap_or(0);
            match encode::ack(conn.publish_rx.buf.as_mut(), PacketType::PubComp, id) {
                Ok(len) => {
                    conn.publish_rx.step = HandshakeStep::Transmit(PacketType::PubComp);
                    conn.publish_rx.wire_len = len;
                    conn.publish_rx.payload_offset = 0;
                    conn.interest.write = true;
                    conn.inbound.reset();
                    false
                }
                Err(_) => true,
            }
        };
        if fatal {
            self.teardown_slot(idx, Some(ErrorKind::WouldOverflow));
        }
    }

    /// The awaited reply for the transmit-queue head is fully received.
    fn head_reply(&mut self, idx: usize, kind: PacketType) {
        match kind {
            PacketType::ConnAck => {
                let result = {
                    let slot = match self.conns[idx].as_mut() {
                        Some(slot) => slot,
                        None => return,
                    };
                    let outcome = match slot.tx_queue.front() {
                        Some(head) if slot.conn.inbound.rx_count == 2 => {
                            let base = head.payload_offset;
                            decode::connack_status(&head.buf.as_ref()[base..base + 2])
                                .map_err(ErrorKind::from)
                        }
                        _ => Err(ErrorKind::ProtocolFailure),
                    };
                    slot.conn.inbound.reset();
                    outcome
                };
                if let Err(err) = result {
                    debug!("connack not accepted: {:?}", err);
                }
                self.complete_head(idx, result);
            }

            PacketType::PubAck
            | PacketType::PubComp
            | PacketType::UnsubAck
            | PacketType::PingResp => {
                if let Some(slot) = self.conns[idx].as_mut() {
                    slot.conn.inbound.reset();
                }
                self.complete_head(idx, Ok(()));
            }

            PacketType::PubRec => {
                // Outbound QoS 2 publish, second leg: release it.
                let fatal = {
                    let slot = match self.conns[idx].as_mut() {
                        Some(slot) => slot,
                        None => return,
                    };
                    match slot.tx_queue.front_mut() {
                        Some(head) => {
                            let id = head.msg_id.unwrap_or(0);
                            match encode::ack(head.buf.as_mut(), PacketType::PubRel, id) {
                                Ok(len) => {
                                    head.step = HandshakeStep::Transmit(PacketType::PubRel);
                                    head.wire_len = len;
                                    slot.conn.interest.write = true;
                                    slot.conn.inbound.reset();
                                    false
                                }
                                Err(_) => true,
                            }
                        }
                        None => return,
                    }
                };
                if fatal {
                    self.teardown_slot(idx, Some(ErrorKind::WouldOverflow));
                }
            }

            PacketType::SubAck => {
                let result = {
                    let slot = match self.conns[idx].as_mut() {
                        Some(slot) => slot,
                        None => return,
                    };
                    let outcome = match slot.tx_queue.front() {
                        Some(head) if slot.conn.inbound.rx_count > 0 => {
                            let base = head.payload_offset;
                            let count = head.buf.as_ref()[base - 1] as usize;
                            let buf = head.buf.as_ref();
                            let requested = &buf[..count];
                            let granted = &buf[base..base + count];
                            let mut outcome = Ok(());
                            for (topic_ix, (&want, &got)) in
                                requested.iter().zip(granted.iter()).enumerate()
                            {
                                if want != got {
                                    error!(
                                        "qos not granted for topic {}: requested {}, got {}",
                                        topic_ix, want, got
                                    );
                                    outcome = Err(ErrorKind::ProtocolFailure);
                                    break;
                                }
                            }
                            outcome
                        }
                        _ => Err(ErrorKind::ProtocolFailure),
                    };
                    slot.conn.inbound.reset();
                    outcome
                };
                self.complete_head(idx, result);
            }

            other => {
                error!("reply handler got {:?}", other);
                if let Some(slot) = self.conns[idx].as_mut() {
                    slot.conn.inbound.reset();
                }
            }
        }
    }

    // ===== COMPLETION =====

    /// Detach the head message and run its completion callbacks.
    fn complete_head(&mut self, idx: usize, result: Result<()>) {
        let detached = {
            let slot = match self.conns[idx].as_mut() {
                Some(slot) => slot,
                None => return,
            };
            let events = slot.conn.events;
            slot.tx_queue.pop_front().map(|msg| (events, msg))
        };
        if let Some((events, msg)) = detached {
            Self::finish_message(events, &self.ctx.ids, msg, result);
        }
    }

    /// Terminal bookkeeping for one message: verify the handshake really
    /// reached its expected end, release the message id, then invoke the
    /// generic completion callback followed by the operation-specific one.
    fn finish_message(
        events: &dyn ConnectionEvents<B>,
        ids: &MsgIdPool<ID_WORDS>,
        mut msg: Message<B>,
        mut result: Result<()>,
    ) {
        if result.is_ok() && !msg.at_terminal_step() {
            result = Err(ErrorKind::ProtocolFailure);
        }
        if let Some(id) = msg.msg_id.take() {
            ids.release(id);
        }
        msg.step = HandshakeStep::Complete;
        msg.error = result.err();

        let kind = match msg.kind {
            Some(kind) => kind,
            None => {
                warn!("completing a message that was never armed");
                return;
            }
        };
        trace!("completing {:?}: {:?}", kind, result);

        events.on_complete(kind, &mut msg, result);
        match kind {
            OperationKind::Connect => events.on_connect_complete(msg, result),
            OperationKind::Publish => events.on_publish_complete(msg, result),
            OperationKind::Subscribe => events.on_subscribe_complete(msg, result),
            OperationKind::Unsubscribe => events.on_unsubscribe_complete(msg, result),
            OperationKind::PingReq => events.on_ping_complete(msg, result),
            OperationKind::Disconnect => events.on_disconnect_complete(msg, result),
        }
    }

    // ===== ADMISSION =====

    fn drain_requests(&mut self) {
        while let Some(request) = self.rx.try_receive() {
            self.handle_request(request);
        }
    }

    fn handle_request(&mut self, request: Request<'a, S, B>) {
        match request {
            Request::Open { id, conn, msg } => self.admit(id, conn, msg),
            Request::Operation { id, msg } => self.enqueue_operation(id, msg),
            Request::Close { id, done } => {
                if id.0 < MAX_CONNS {
                    self.teardown_slot(id.0, None);
                }
                done.post();
            }
        }
    }

    fn admit(&mut self, id: ConnId, mut conn: Connection<'a, S, B>, msg: Message<B>) {
        if id.0 >= MAX_CONNS || self.conns[id.0].is_some() {
            error!("cannot admit connection into slot {}", id.0);
            let events = conn.events;
            Self::finish_message(events, &self.ctx.ids, msg, Err(ErrorKind::InvalidState));
            return;
        }

        debug!("connection admitted into slot {}", id.0);
        conn.interest.write = true;
        let mut slot = ConnSlot {
            conn,
            tx_queue: Deque::new(),
        };
        // Capacity is at least one; the queue was just created.
        let _ = slot.tx_queue.push_back(msg);
        self.conns[id.0] = Some(slot);
        self.ctx.registered.fetch_add(1, Ordering::AcqRel);
    }

    fn enqueue_operation(&mut self, id: ConnId, msg: Message<B>) {
        let ids = &self.ctx.ids;
        match self.conns.get_mut(id.0).and_then(|slot| slot.as_mut()) {
            Some(slot) => {
                let events = slot.conn.events;
                match slot.tx_queue.push_back(msg) {
                    Ok(()) => slot.conn.interest.write = true,
                    Err(msg) => {
                        warn!("transmit queue full on slot {}", id.0);
                        Self::finish_message(events, ids, msg, Err(ErrorKind::ResourceExhausted));
                    }
                }
            }
            None => {
                // The connection went away between post and drain. There
                // is no handler left to tell; reclaim the id and drop.
                warn!("operation for vacant slot {} dropped", id.0);
                if let Some(msg_id) = msg.msg_id {
                    ids.release(msg_id);
                }
            }
        }
    }

    // ===== TEARDOWN =====

    /// Close the connection in `idx` and complete everything queued on it
    /// with `SocketClosed`: first the transmit queue in FIFO order, then
    /// any of its requests still sitting in the admission queue. `notify`
    /// carries the fault reported through `on_connection_error`; `None`
    /// for a requested close or disconnect.
    fn teardown_slot(&mut self, idx: usize, notify: Option<ErrorKind>) {
        let mut slot = match self.conns[idx].take() {
            Some(slot) => slot,
            None => return,
        };

        slot.conn.interest = Interest::NONE;
        if let Some(mut sock) = slot.conn.socket.take() {
            sock.close();
        }
        self.ctx.registered.fetch_sub(1, Ordering::AcqRel);
        self.ctx.slot_states[idx].store(SLOT_VACANT, Ordering::Release);
        debug!("connection slot {} closed", idx);

        let events = slot.conn.events;
        while let Some(msg) = slot.tx_queue.pop_front() {
            Self::finish_message(events, &self.ctx.ids, msg, Err(ErrorKind::SocketClosed));
        }

        while let Some(request) = self.rx.try_receive() {
            match request {
                Request::Operation { id, msg } if id.0 == idx => {
                    Self::finish_message(events, &self.ctx.ids, msg, Err(ErrorKind::SocketClosed));
                }
                Request::Close { id, done } if id.0 == idx => done.post(),
                other => self.handle_request(other),
            }
        }

        if let Some(err) = notify {
            events.on_connection_error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Requester;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::traits::{Readiness, Signal, SocketError, SpinSignal};
    use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::string::{String, ToString};
    use std::vec::Vec;

    const BUF: usize = 256;
    type Buf = [u8; BUF];
    type Ctx<'a> = MqttContext<'a, MockSocket, Buf, 2, 8, 1>;
    type Req<'c, 'a> = Requester<'c, 'a, MockSocket, Buf, 2, 8, 1>;
    type Disp<'c, 'a> = Dispatcher<'c, 'a, MockSocket, Buf, 2, 8, 1>;

    // ===== MOCK TRANSPORT =====

    #[derive(Default)]
    struct MockIo {
        rx: Vec<u8>,
        rx_pos: usize,
        tx: Vec<u8>,
        peer_closed: bool,
        engine_closed: bool,
        fail_send: bool,
    }

    struct MockSocket {
        io: Rc<RefCell<MockIo>>,
    }

    fn mock_socket() -> (MockSocket, Rc<RefCell<MockIo>>) {
        let io = Rc::new(RefCell::new(MockIo::default()));
        (MockSocket { io: io.clone() }, io)
    }

    fn feed(io: &Rc<RefCell<MockIo>>, bytes: &[u8]) {
        io.borrow_mut().rx.extend_from_slice(bytes);
    }

    fn sent(io: &Rc<RefCell<MockIo>>) -> Vec<u8> {
        io.borrow().tx.clone()
    }

    fn clear_sent(io: &Rc<RefCell<MockIo>>) {
        io.borrow_mut().tx.clear();
    }

    impl TcpSocket for MockSocket {
        fn open(_host: &str, _port: u16, _timeout_ms: u32) -> Result<Self, SocketError> {
            Err(SocketError::Fault)
        }

        fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
            let mut io = self.io.borrow_mut();
            if io.fail_send {
                return Err(SocketError::Fault);
            }
            io.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
            let mut io = self.io.borrow_mut();
            let available = io.rx.len() - io.rx_pos;
            if available == 0 {
                return if io.peer_closed {
                    Err(SocketError::Closed)
                } else {
                    Err(SocketError::WouldBlock)
                };
            }
            let n = available.min(buf.len());
            let pos = io.rx_pos;
            buf[..n].copy_from_slice(&io.rx[pos..pos + n]);
            io.rx_pos += n;
            Ok(n)
        }

        fn readiness(&mut self, _interest: Interest) -> Readiness {
            let io = self.io.borrow();
            Readiness {
                readable: io.rx_pos < io.rx.len() || io.peer_closed,
                writable: true,
                errored: false,
            }
        }

        fn close(&mut self) {
            self.io.borrow_mut().engine_closed = true;
        }
    }

    // ===== EVENT RECORDER =====

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        Generic(OperationKind, Result<()>),
        Done(OperationKind, Result<()>),
        PublishRx(String, Vec<u8>, QoS),
        ConnError(ErrorKind),
    }

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<Ev>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Ev> {
            self.events.borrow_mut().drain(..).collect()
        }
    }

    impl ConnectionEvents<Buf> for Recorder {
        fn on_complete(&self, kind: OperationKind, _msg: &mut Message<Buf>, result: Result<()>) {
            self.events.borrow_mut().push(Ev::Generic(kind, result));
        }
        fn on_connect_complete(&self, _msg: Message<Buf>, result: Result<()>) {
            self.events
                .borrow_mut()
                .push(Ev::Done(OperationKind::Connect, result));
        }
        fn on_publish_complete(&self, _msg: Message<Buf>, result: Result<()>) {
            self.events
                .borrow_mut()
                .push(Ev::Done(OperationKind::Publish, result));
        }
        fn on_subscribe_complete(&self, _msg: Message<Buf>, result: Result<()>) {
            self.events
                .borrow_mut()
                .push(Ev::Done(OperationKind::Subscribe, result));
        }
        fn on_unsubscribe_complete(&self, _msg: Message<Buf>, result: Result<()>) {
            self.events
                .borrow_mut()
                .push(Ev::Done(OperationKind::Unsubscribe, result));
        }
        fn on_ping_complete(&self, _msg: Message<Buf>, result: Result<()>) {
            self.events
                .borrow_mut()
                .push(Ev::Done(OperationKind::PingReq, result));
        }
        fn on_disconnect_complete(&self, _msg: Message<Buf>, result: Result<()>) {
            self.events
                .borrow_mut()
                .push(Ev::Done(OperationKind::Disconnect, result));
        }
        fn on_publish_received(&self, topic: &str, payload: &[u8], qos: QoS) {
            self.events
                .borrow_mut()
                .push(Ev::PublishRx(topic.to_string(), payload.to_vec(), qos));
        }
        fn on_connection_error(&self, err: ErrorKind) {
            self.events.borrow_mut().push(Ev::ConnError(err));
        }
    }

    #[derive(Default)]
    struct FlagSignal {
        flag: AtomicBool,
    }

    impl Signal for FlagSignal {
        fn post(&self) {
            self.flag.store(true, AtomicOrdering::Release);
        }
        fn wait(&self) {
            while !self.flag.load(AtomicOrdering::Acquire) {
                core::hint::spin_loop();
            }
        }
    }

    // ===== HARNESS =====

    fn new_message() -> Message<Buf> {
        Message::new([0u8; BUF])
    }

    /// Drive the CONNECT/CONNACK handshake to completion on slot 0.
    fn connect_established<'c, 'a>(
        req: &Req<'c, 'a>,
        disp: &mut Disp<'c, 'a>,
        io: &Rc<RefCell<MockIo>>,
        recorder: &'a Recorder,
    ) {
        let conn = Connection::from_socket(
            MockSocket { io: io.clone() },
            ConnectionConfig::new("broker.local", "cli"),
            recorder,
            [0u8; BUF],
        );
        req.connect(ConnId(0), conn, new_message()).unwrap();
        disp.poll(); // admission
        disp.poll(); // transmit CONNECT
        disp.poll(); // advance to awaiting CONNACK
        feed(io, &[0x20, 0x02, 0x00, 0x00]);
        disp.poll(); // write pass stands down
        disp.poll(); // read CONNACK
        let events = recorder.take();
        assert!(
            events.contains(&Ev::Done(OperationKind::Connect, Ok(()))),
            "connect did not complete: {:?}",
            events
        );
        clear_sent(io);
    }

    // ===== CONNECT =====

    #[test]
    fn connect_completes_on_connack() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (sock, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();

        let conn = Connection::from_socket(
            sock,
            ConnectionConfig::new("broker.local", "cli"),
            &recorder,
            [0u8; BUF],
        );
        req.connect(ConnId(0), conn, new_message()).unwrap();

        disp.poll();
        assert_eq!(disp.registered_count(), 1);
        disp.poll();
        // CONNECT went out: type byte, remaining length 15, "MQTT".
        let tx = sent(&io);
        assert_eq!(tx[0], 0x10);
        assert_eq!(&tx[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);

        disp.poll();
        assert!(recorder.take().is_empty());

        feed(&io, &[0x20, 0x02, 0x00, 0x00]);
        disp.poll();
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Connect, Ok(())),
                Ev::Done(OperationKind::Connect, Ok(())),
            ]
        );
    }

    #[test]
    fn connect_refused_reports_protocol_failure() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (sock, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();

        let conn = Connection::from_socket(
            sock,
            ConnectionConfig::new("broker.local", "cli"),
            &recorder,
            [0u8; BUF],
        );
        req.connect(ConnId(0), conn, new_message()).unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        feed(&io, &[0x20, 0x02, 0x00, 0x05]); // not authorized
        disp.poll();
        disp.poll();
        assert!(recorder.take().contains(&Ev::Done(
            OperationKind::Connect,
            Err(ErrorKind::ProtocolFailure)
        )));
    }

    #[test]
    fn connack_split_across_reads_is_reassembled() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (sock, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();

        let conn = Connection::from_socket(
            sock,
            ConnectionConfig::new("broker.local", "cli"),
            &recorder,
            [0u8; BUF],
        );
        req.connect(ConnId(0), conn, new_message()).unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        disp.poll(); // write interest stands down

        for &byte in &[0x20u8, 0x02, 0x00] {
            feed(&io, &[byte]);
            disp.poll();
            assert!(recorder.take().is_empty(), "completed too early");
        }
        feed(&io, &[0x00]);
        disp.poll();
        assert!(recorder
            .take()
            .contains(&Ev::Done(OperationKind::Connect, Ok(()))));
    }

    // ===== PUBLISH =====

    #[test]
    fn qos0_publish_completes_after_write_alone() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.publish(
            ConnId(0),
            new_message(),
            "t/x",
            b"hi",
            QoS::AtMostOnce,
            false,
        )
        .unwrap();
        disp.poll(); // enqueue
        disp.poll(); // transmit
        disp.poll(); // advance: QoS 0 completes immediately
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Publish, Ok(())),
                Ev::Done(OperationKind::Publish, Ok(())),
            ]
        );
        assert_eq!(
            sent(&io),
            std::vec![0x30, 0x07, 0x00, 0x03, b't', b'/', b'x', b'h', b'i']
        );
    }

    #[test]
    fn qos1_publish_completes_only_on_puback_and_releases_id() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.publish(ConnId(0), new_message(), "t", b"x", QoS::AtLeastOnce, false)
            .unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        // First id from the pool is 1, carried in the variable header.
        assert_eq!(sent(&io), std::vec![0x32, 0x06, 0x00, 0x01, b't', 0x00, 0x01, b'x']);
        assert!(recorder.take().is_empty(), "completed before PUBACK");

        disp.poll(); // write interest stands down
        feed(&io, &[0x40, 0x02, 0x00, 0x01]);
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Publish, Ok(())),
                Ev::Done(OperationKind::Publish, Ok(())),
            ]
        );

        // The id was released exactly once: the next QoS 1 publish gets
        // id 1 again.
        clear_sent(&io);
        req.publish(ConnId(0), new_message(), "t", b"y", QoS::AtLeastOnce, false)
            .unwrap();
        disp.poll();
        disp.poll();
        assert_eq!(&sent(&io)[5..7], &[0x00, 0x01]);
    }

    #[test]
    fn qos2_publish_runs_full_handshake_with_single_completion() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.publish(ConnId(0), new_message(), "t", b"x", QoS::ExactlyOnce, false)
            .unwrap();
        disp.poll();
        disp.poll();
        disp.poll(); // awaiting PUBREC
        disp.poll(); // write interest stands down
        assert!(recorder.take().is_empty());
        clear_sent(&io);

        feed(&io, &[0x50, 0x02, 0x00, 0x01]); // PUBREC
        disp.poll();
        assert!(recorder.take().is_empty(), "completed on PUBREC");
        disp.poll(); // transmit PUBREL
        assert_eq!(sent(&io), std::vec![0x62, 0x02, 0x00, 0x01]);
        disp.poll(); // awaiting PUBCOMP
        disp.poll(); // write interest stands down
        assert!(recorder.take().is_empty(), "completed before PUBCOMP");

        feed(&io, &[0x70, 0x02, 0x00, 0x01]); // PUBCOMP
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Publish, Ok(())),
                Ev::Done(OperationKind::Publish, Ok(())),
            ]
        );
    }

    // ===== SUBSCRIBE =====

    #[test]
    fn subscribe_with_matching_grant_completes_ok() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.subscribe_many(
            ConnId(0),
            new_message(),
            &[
                ("a", QoS::AtMostOnce),
                ("b", QoS::AtLeastOnce),
                ("c", QoS::ExactlyOnce),
            ],
        )
        .unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        disp.poll();
        // SUBACK: id 1, granted [0, 1, 2].
        feed(&io, &[0x90, 0x05, 0x00, 0x01, 0x00, 0x01, 0x02]);
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Subscribe, Ok(())),
                Ev::Done(OperationKind::Subscribe, Ok(())),
            ]
        );
    }

    #[test]
    fn subscribe_with_downgraded_grant_fails() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.subscribe_many(
            ConnId(0),
            new_message(),
            &[
                ("a", QoS::AtMostOnce),
                ("b", QoS::AtLeastOnce),
                ("c", QoS::ExactlyOnce),
            ],
        )
        .unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        disp.poll();
        // Second topic downgraded to QoS 0.
        feed(&io, &[0x90, 0x05, 0x00, 0x01, 0x00, 0x00, 0x02]);
        disp.poll();
        assert!(recorder.take().contains(&Ev::Done(
            OperationKind::Subscribe,
            Err(ErrorKind::ProtocolFailure)
        )));
    }

    // ===== INBOUND PUBLISH =====

    #[test]
    fn inbound_qos0_publish_delivers_payload() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        feed(&io, &[0x30, 0x07, 0x00, 0x03, b't', b'/', b'x', b'h', b'i']);
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![Ev::PublishRx("t/x".to_string(), b"hi".to_vec(), QoS::AtMostOnce)]
        );
        assert!(sent(&io).is_empty(), "QoS 0 must not be acknowledged");

        // The slot re-arms: a second message is delivered too.
        feed(&io, &[0x30, 0x07, 0x00, 0x03, b't', b'/', b'x', b'h', b'o']);
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![Ev::PublishRx("t/x".to_string(), b"ho".to_vec(), QoS::AtMostOnce)]
        );
    }

    #[test]
    fn inbound_qos1_publish_delivers_then_acknowledges() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        // QoS 1 publish, id 5.
        feed(
            &io,
            &[0x32, 0x09, 0x00, 0x03, b't', b'/', b'x', 0x00, 0x05, b'h', b'i'],
        );
        disp.poll();
        // Delivery happens before the reply is even built.
        assert_eq!(
            recorder.take(),
            std::vec![Ev::PublishRx("t/x".to_string(), b"hi".to_vec(), QoS::AtLeastOnce)]
        );
        disp.poll(); // transmit PUBACK
        disp.poll(); // reply flushed, slot re-armed
        assert_eq!(sent(&io), std::vec![0x40, 0x02, 0x00, 0x05]);
    }

    #[test]
    fn inbound_qos2_publish_runs_pubrec_pubrel_pubcomp() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        feed(
            &io,
            &[0x34, 0x09, 0x00, 0x03, b't', b'/', b'x', 0x00, 0x07, b'h', b'i'],
        );
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![Ev::PublishRx("t/x".to_string(), b"hi".to_vec(), QoS::ExactlyOnce)]
        );
        disp.poll(); // transmit PUBREC
        disp.poll(); // now awaiting PUBREL
        assert_eq!(sent(&io), std::vec![0x50, 0x02, 0x00, 0x07]);
        clear_sent(&io);

        feed(&io, &[0x62, 0x02, 0x00, 0x07]); // PUBREL
        disp.poll(); // write interest stands down
        disp.poll(); // read PUBREL, build PUBCOMP
        disp.poll(); // transmit PUBCOMP
        assert_eq!(sent(&io), std::vec![0x70, 0x02, 0x00, 0x07]);
        // No duplicate delivery at PUBREL time.
        assert!(recorder.take().is_empty());
    }

    // ===== PING / UNSUBSCRIBE =====

    #[test]
    fn ping_completes_on_pingresp() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.ping_req(ConnId(0), new_message()).unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        disp.poll();
        assert_eq!(sent(&io), std::vec![0xC0, 0x00]);
        feed(&io, &[0xD0, 0x00]);
        disp.poll();
        assert!(recorder
            .take()
            .contains(&Ev::Done(OperationKind::PingReq, Ok(()))));
    }

    #[test]
    fn unsubscribe_completes_on_unsuback() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.unsubscribe(ConnId(0), new_message(), "a/b").unwrap();
        disp.poll();
        disp.poll();
        disp.poll();
        disp.poll();
        feed(&io, &[0xB0, 0x02, 0x00, 0x01]);
        disp.poll();
        assert!(recorder
            .take()
            .contains(&Ev::Done(OperationKind::Unsubscribe, Ok(()))));
    }

    // ===== TEARDOWN =====

    #[test]
    fn close_flushes_queued_messages_in_fifo_order() {
        let wake = SpinSignal::new();
        let done = FlagSignal::default();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        // Two distinct operations queued, then a close behind them; the
        // I/O pass of the same iteration has nothing to write yet, so
        // both still sit in the queue when the close lands.
        req.publish(ConnId(0), new_message(), "t", b"1", QoS::AtMostOnce, false)
            .unwrap();
        req.ping_req(ConnId(0), new_message()).unwrap();
        req.request_close(ConnId(0), &done).unwrap();
        disp.poll();

        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Publish, Err(ErrorKind::SocketClosed)),
                Ev::Done(OperationKind::Publish, Err(ErrorKind::SocketClosed)),
                Ev::Generic(OperationKind::PingReq, Err(ErrorKind::SocketClosed)),
                Ev::Done(OperationKind::PingReq, Err(ErrorKind::SocketClosed)),
            ]
        );
        assert!(done.flag.load(AtomicOrdering::Acquire));
        assert_eq!(disp.registered_count(), 0);
        assert!(io.borrow().engine_closed);

        // A later poll never references the removed connection.
        feed(&io, &[0x30, 0x04, 0x00, 0x01, b'a', b'x']);
        disp.poll();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn disconnect_completes_then_tears_down() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        req.disconnect(ConnId(0), new_message()).unwrap();
        disp.poll();
        disp.poll(); // transmit DISCONNECT
        disp.poll(); // advance: complete + teardown
        assert_eq!(sent(&io), std::vec![0xE0, 0x00]);
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Disconnect, Ok(())),
                Ev::Done(OperationKind::Disconnect, Ok(())),
            ]
        );
        assert_eq!(disp.registered_count(), 0);
        assert!(io.borrow().engine_closed);
    }

    #[test]
    fn unexpected_packet_type_is_fatal_for_the_connection() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        // A PINGRESP nobody asked for cannot be resynchronized.
        feed(&io, &[0xD0, 0x00]);
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![Ev::ConnError(ErrorKind::ProtocolFailure)]
        );
        assert_eq!(disp.registered_count(), 0);
    }

    #[test]
    fn send_fault_tears_down_and_flushes() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        io.borrow_mut().fail_send = true;
        req.publish(ConnId(0), new_message(), "t", b"x", QoS::AtMostOnce, false)
            .unwrap();
        disp.poll();
        disp.poll();
        assert_eq!(
            recorder.take(),
            std::vec![
                Ev::Generic(OperationKind::Publish, Err(ErrorKind::SocketClosed)),
                Ev::Done(OperationKind::Publish, Err(ErrorKind::SocketClosed)),
                Ev::ConnError(ErrorKind::SocketClosed),
            ]
        );
        assert_eq!(disp.registered_count(), 0);
    }

    // ===== BUILDER VALIDATION =====

    #[test]
    fn operations_on_unopened_slot_fail_synchronously() {
        let wake = SpinSignal::new();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, _disp) = ctx.split();

        assert_eq!(
            req.publish(ConnId(0), new_message(), "t", b"x", QoS::AtMostOnce, false),
            Err(ErrorKind::SocketClosed)
        );
        assert_eq!(
            req.ping_req(ConnId(1), new_message()),
            Err(ErrorKind::SocketClosed)
        );
        assert_eq!(
            req.publish(ConnId(9), new_message(), "t", b"x", QoS::AtMostOnce, false),
            Err(ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn builder_argument_errors_never_queue() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        assert_eq!(
            req.publish(ConnId(0), new_message(), "a/#", b"x", QoS::AtMostOnce, false),
            Err(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            req.subscribe(ConnId(0), new_message(), "a+/c", QoS::AtMostOnce),
            Err(ErrorKind::InvalidArgument)
        );
        assert_eq!(
            req.subscribe(ConnId(0), new_message(), "a/#/c", QoS::AtMostOnce),
            Err(ErrorKind::InvalidArgument)
        );
        assert!(req
            .subscribe(ConnId(0), new_message(), "a/+/c", QoS::AtMostOnce)
            .is_ok());

        disp.poll();
        disp.poll();
        // Only the valid subscribe made it onto the wire.
        assert_eq!(sent(&io)[0], 0x82);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn second_connect_on_claimed_slot_is_rejected() {
        let wake = SpinSignal::new();
        let recorder = Recorder::default();
        let (_, io) = mock_socket();
        let mut ctx: Ctx<'_> = MqttContext::new(&wake);
        let (req, mut disp) = ctx.split();
        connect_established(&req, &mut disp, &io, &recorder);

        let (sock2, _io2) = mock_socket();
        let conn2 = Connection::from_socket(
            sock2,
            ConnectionConfig::new("broker.local", "cli2"),
            &recorder,
            [0u8; BUF],
        );
        assert_eq!(
            req.connect(ConnId(0), conn2, new_message()),
            Err(ErrorKind::InvalidState)
        );
    }
}
