//! Reference platform implementations of the engine's traits.

#[cfg(feature = "std")]
pub mod std_net;

#[cfg(feature = "std")]
pub use std_net::{CondvarSignal, StdDelay, StdTcpSocket};
