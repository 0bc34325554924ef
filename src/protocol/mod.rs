//! MQTT 3.1.1 wire codec.
//!
//! Stateless encode/decode over caller-supplied byte slices: the fixed
//! header with its base-128 remaining-length varint, per-operation packet
//! builders, decode helpers for the packet bodies the engine interprets,
//! and topic/filter validation.

pub mod decode;
pub mod encode;
mod error;
pub mod filter;
pub mod fixed_header;
mod packet_type;
mod qos;

pub use error::ProtocolError;
pub use packet_type::PacketType;
pub use qos::QoS;
