//! Collaborators the engine consumes: a datagram socket, a way to bind one, and a clock.

use crate::{address::PeerAddr, errors::SocketError};
use std::{sync::Arc, time::Instant};

/// A bound datagram socket.
pub trait DatagramSocket: Send {
    fn send_to(&mut self, payload: &[u8], to: PeerAddr) -> Result<usize, SocketError>;

    /// Returns `Ok(None)` when nothing is waiting. Never blocks.
    fn recv_from(&mut self, buffer: &mut [u8]) -> Result<Option<(usize, PeerAddr)>, SocketError>;

    fn local_port(&self) -> u16;
}

/// Opens datagram sockets. Port 0 binds an ephemeral port.
pub trait Network: Send + Sync {
    fn bind(&self, port: u16) -> Result<Box<dyn DatagramSocket>, SocketError>;
}

/// Monotonic millisecond tick. Wraps around after ~49 days; consumers compare with `time_diff`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u32;
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
}

/// Everything a connection needs from its environment.
#[derive(Clone)]
pub struct Services {
    pub clock: Arc<dyn Clock>,
    pub network: Arc<dyn Network>,
}

impl Services {
    pub fn new(clock: Arc<dyn Clock>, network: Arc<dyn Network>) -> Self {
        Self { clock, network }
    }
}

/// Signed difference between two ticks, correct across wrap-around.
#[inline]
pub fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}
