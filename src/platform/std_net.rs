//! `std` host backend: non-blocking TCP, thread sleep, condvar semaphore.

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::traits::{Delay, Interest, Readiness, Signal, SocketError, TcpSocket};

fn map_io_error(err: std::io::Error) -> SocketError {
    match err.kind() {
        IoErrorKind::WouldBlock => SocketError::WouldBlock,
        IoErrorKind::ConnectionReset
        | IoErrorKind::ConnectionAborted
        | IoErrorKind::BrokenPipe
        | IoErrorKind::NotConnected => SocketError::Closed,
        _ => SocketError::Fault,
    }
}

/// Non-blocking TCP socket over `std::net::TcpStream`.
pub struct StdTcpSocket {
    stream: TcpStream,
}

impl TcpSocket for StdTcpSocket {
    fn open(host: &str, port: u16, timeout_ms: u32) -> Result<Self, SocketError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| SocketError::Fault)?;

        let mut last = SocketError::Fault;
        for addr in addrs {
            let connected = if timeout_ms == 0 {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms as u64))
            };
            match connected {
                Ok(stream) => {
                    stream
                        .set_nonblocking(true)
                        .map_err(|_| SocketError::Fault)?;
                    let _ = stream.set_nodelay(true);
                    return Ok(Self { stream });
                }
                Err(err) => last = map_io_error(err),
            }
        }
        Err(last)
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        self.stream.write(buf).map_err(map_io_error)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        match self.stream.read(buf) {
            Ok(0) => Err(SocketError::Closed),
            Ok(read) => Ok(read),
            Err(err) => Err(map_io_error(err)),
        }
    }

    fn readiness(&mut self, interest: Interest) -> Readiness {
        let mut probe = [0u8; 1];
        let readable = if interest.read {
            match self.stream.peek(&mut probe) {
                // A zero-length peek means the peer shut down; report
                // readable so the read path observes the close.
                Ok(_) => true,
                Err(err) => err.kind() != IoErrorKind::WouldBlock,
            }
        } else {
            false
        };
        let errored = interest.error
            && matches!(self.stream.take_error(), Ok(Some(_)) | Err(_));

        Readiness {
            readable,
            // The send path handles WouldBlock itself; claiming writable
            // costs one failed write at worst.
            writable: interest.write,
            errored,
        }
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Thread-sleep delay.
#[derive(Debug, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn sleep_ms(&mut self, millis: u32) {
        std::thread::sleep(Duration::from_millis(millis as u64));
    }
}

/// Blocking counting semaphore over a mutex and condvar.
#[derive(Debug, Default)]
pub struct CondvarSignal {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl CondvarSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Signal for CondvarSignal {
    fn post(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *count += 1;
        self.condvar.notify_one();
    }

    fn wait(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *count == 0 {
            count = self
                .condvar
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *count -= 1;
    }
}
