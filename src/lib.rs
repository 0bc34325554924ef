//! # EmberMQ - Embedded MQTT 3.1.1 Client Engine
//!
//! An MQTT 3.1.1 client engine for embedded `no_std` environments:
//! caller-owned packet buffers, bounded memory, and a single cooperative
//! dispatch task that owns every socket.
//!
//! ## Features
//!
//! - **no_std** compatible - No standard library, no heap
//! - **MQTT 3.1.1** client - CONNECT, PUBLISH QoS 0/1/2, SUBSCRIBE,
//!   UNSUBSCRIBE, PING, DISCONNECT
//! - **Caller-owned buffers** - Packets are encoded into and received
//!   into buffers the application supplies; payloads are never copied
//! - **Bounded bookkeeping** - Message identifiers come from a fixed
//!   bitmap shared across all connections
//! - **Generic networking** - Works with any non-blocking socket through
//!   the [`TcpSocket`] trait
//! - **Configurable** - Compile-time capacities via const generics
//!
//! ## Limitations
//!
//! - No MQTT 5.0 properties
//! - No persistent session state or offline queuing across reconnects
//! - No TLS establishment (inject a secured socket with
//!   [`Connection::from_socket`])
//!
//! ## Architecture
//!
//! A [`MqttContext`] holds everything the client shares: the admission
//! queue, the message-id bitmap and the per-slot open flags. Splitting it
//! yields a cloneable [`Requester`] for application threads and a
//! [`Dispatcher`] for the dispatch task. Builders on the requester encode
//! the packet synchronously and post it; the dispatcher performs all
//! socket I/O, drives each operation's acknowledgment handshake, and
//! reports every outcome through the connection's [`ConnectionEvents`]
//! handler.
//!
//! ```rust,ignore
//! use embermq::prelude::MediumContext;
//! use embermq::{ConnId, Connection, ConnectionConfig, Message, QoS};
//!
//! let wake = embermq::SpinSignal::new();
//! let mut ctx: MediumContext<MySocket, [u8; 1024]> = MediumContext::new(&wake);
//! let (requester, mut dispatcher) = ctx.split();
//!
//! // Dispatch task:
//! //     dispatcher.run(&mut delay);
//!
//! // Application thread:
//! let conn = Connection::open(
//!     ConnectionConfig::new("broker.local", "sensor-01"),
//!     &handler,
//!     [0u8; 1024],
//! )?;
//! requester.connect(ConnId(0), conn, Message::new([0u8; 1024]))?;
//! requester.publish(
//!     ConnId(0),
//!     Message::new([0u8; 1024]),
//!     "sensors/temp",
//!     b"22.5",
//!     QoS::AtLeastOnce,
//!     false,
//! )?;
//! ```
//!
//! ## Configuration
//!
//! Capacities are const generics on [`MqttContext`]:
//!
//! - `MAX_CONNS`: connection slots
//! - `QUEUE_DEPTH`: admission-queue entries (power of two) and per-
//!   connection transmit-queue depth
//! - `ID_WORDS`: message-id bitmap words (32 ids each)

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod id_pool;
pub mod message;
#[cfg(feature = "std")]
pub mod platform;
pub mod protocol;
pub(crate) mod queue;
pub mod traits;

// Re-export commonly used types
pub use client::{ConnId, MqttContext, Requester};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvents, DEFAULT_BROKER_PORT, PUBLISH_RX_RESERVED,
};
pub use dispatch::{Dispatcher, DEFAULT_TICK_MS};
pub use error::{ErrorKind, Result};
pub use id_pool::MsgIdPool;
pub use message::{HandshakeStep, Message, OperationKind, PacketBuffer};
pub use protocol::encode::LastWill;
pub use protocol::{PacketType, ProtocolError, QoS};
pub use traits::{Delay, Interest, Readiness, Signal, SocketError, SpinSignal, TcpSocket};

/// Common client configurations
pub mod prelude {
    use super::MqttContext;

    /// Small configuration: 1 connection, 4 queued requests, 32 ids
    pub type SmallContext<'a, S, B> = MqttContext<'a, S, B, 1, 4, 1>;

    /// Medium configuration: 2 connections, 8 queued requests, 32 ids
    pub type MediumContext<'a, S, B> = MqttContext<'a, S, B, 2, 8, 1>;

    /// Large configuration: 4 connections, 16 queued requests, 64 ids
    pub type LargeContext<'a, S, B> = MqttContext<'a, S, B, 4, 16, 2>;
}
