//! Platform traits.
//!
//! The engine performs no I/O and no blocking of its own; everything it
//! needs from the environment — a non-blocking TCP socket, a delay, a
//! counting semaphore — comes in through these traits. Implementations
//! exist for `std` hosts behind the `std` feature; embedded targets
//! provide their own.

use core::sync::atomic::{AtomicU32, Ordering};

/// Non-blocking socket error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketError {
    /// The operation cannot make progress right now; retry on the next
    /// event-loop iteration without losing decode progress.
    WouldBlock,
    /// The peer closed the connection.
    Closed,
    /// Unrecoverable socket fault.
    Fault,
}

impl core::fmt::Display for SocketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SocketError::WouldBlock => write!(f, "Operation would block"),
            SocketError::Closed => write!(f, "Connection closed by peer"),
            SocketError::Fault => write!(f, "Socket fault"),
        }
    }
}

impl core::error::Error for SocketError {}

/// Which socket events a connection currently cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Interest {
    pub read: bool,
    pub write: bool,
    pub error: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
        error: false,
    };

    pub const fn any(&self) -> bool {
        self.read || self.write || self.error
    }
}

/// Socket readiness as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
}

/// A non-blocking TCP socket.
///
/// `send` and `receive` must never block: when no progress is possible
/// they return [`SocketError::WouldBlock`] and the dispatch loop tries
/// again on a later iteration.
pub trait TcpSocket: Sized {
    /// Open a connection to `host:port`, waiting at most `timeout_ms` for
    /// establishment. This is the only blocking call in the trait and runs
    /// on the application thread, not the dispatch task.
    fn open(host: &str, port: u16, timeout_ms: u32) -> Result<Self, SocketError>;

    /// Transmit up to `buf.len()` bytes, returning how many were accepted.
    fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError>;

    /// Receive up to `buf.len()` bytes, returning how many were read.
    /// A peer shutdown is reported as [`SocketError::Closed`], not as a
    /// zero-length read.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SocketError>;

    /// Report current readiness for the given interest set. Must not
    /// block; this is the per-socket half of the dispatch loop's
    /// multiplexed readiness poll.
    fn readiness(&mut self, interest: Interest) -> Readiness;

    /// Close the socket. Errors are not reported; the connection is being
    /// torn down regardless.
    fn close(&mut self);
}

/// Cooperative delay used between dispatch-loop iterations.
pub trait Delay {
    fn sleep_ms(&mut self, millis: u32);
}

/// Counting semaphore used for the dispatch-task wake-up and the
/// synchronous close rendezvous.
///
/// `post` increments; `wait` blocks (or spins) until the count is
/// positive, then decrements. Counting semantics matter: a `post` that
/// happens before the matching `wait` must not be lost.
pub trait Signal: Sync {
    fn post(&self);
    fn wait(&self);
}

/// Busy-wait [`Signal`] over an atomic counter.
///
/// Suitable for tests and for bare-metal targets without an RTOS
/// semaphore; hosts should prefer a blocking implementation.
#[derive(Debug, Default)]
pub struct SpinSignal {
    count: AtomicU32,
}

impl SpinSignal {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }
}

impl Signal for SpinSignal {
    fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    fn wait(&self) {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current > 0
                && self
                    .count
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_signal_counts_posts() {
        let signal = SpinSignal::new();
        signal.post();
        signal.post();
        signal.wait();
        signal.wait();
        assert_eq!(signal.count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn interest_any() {
        assert!(!Interest::NONE.any());
        let interest = Interest {
            write: true,
            ..Interest::NONE
        };
        assert!(interest.any());
    }
}
