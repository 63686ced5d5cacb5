//! In-memory datagram network and a hand-driven clock, for exercising connections without
//! real sockets or real time.

use crate::{
    address::PeerAddr,
    errors::SocketError,
    socket::{Clock, DatagramSocket, Network, Services},
};
use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// 127.0.0.1, the only host on a simulated network.
pub const SIM_HOST: u32 = 0x7f00_0001;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

struct SimState {
    queues: HashMap<u16, VecDeque<(Vec<u8>, PeerAddr)>>,
    next_ephemeral: u16,
    loss: f64,
    rng: StdRng,
    delivered: u64,
    dropped: u64,
}

impl SimState {
    fn ephemeral_port(&mut self) -> Option<u16> {
        for _ in 0..=(u16::MAX - FIRST_EPHEMERAL_PORT) {
            let port = self.next_ephemeral;
            self.next_ephemeral = match port {
                u16::MAX => FIRST_EPHEMERAL_PORT,
                port => port + 1,
            };
            if !self.queues.contains_key(&port) {
                return Some(port);
            }
        }
        None
    }

    fn route(&mut self, datagram: &[u8], from: PeerAddr, to: PeerAddr) {
        if to.addr != SIM_HOST {
            self.dropped += 1;
            return;
        }
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            trace!("sim: lost {} bytes {} -> {}", datagram.len(), from, to);
            self.dropped += 1;
            return;
        }
        match self.queues.get_mut(&to.port) {
            Some(queue) => {
                queue.push_back((datagram.to_vec(), from));
                self.delivered += 1;
            }
            None => self.dropped += 1,
        }
    }
}

/// A lossy loopback network. Clones share the same state.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        SimNetwork::with_loss(0.0, 0)
    }

    /// Drops each datagram with probability `loss`, drawn from a generator seeded with `seed`.
    pub fn with_loss(loss: f64, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                queues: HashMap::new(),
                next_ephemeral: FIRST_EPHEMERAL_PORT,
                loss: loss.max(0.0).min(1.0),
                rng: StdRng::seed_from_u64(seed),
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    pub fn set_loss(&self, loss: f64) {
        self.lock().loss = loss.max(0.0).min(1.0);
    }

    /// Queues a raw datagram on the socket bound to `to`, bypassing loss.
    pub fn inject(&self, from: PeerAddr, to: u16, datagram: &[u8]) {
        if let Some(queue) = self.lock().queues.get_mut(&to) {
            queue.push_back((datagram.to_vec(), from));
        }
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Datagrams waiting on `port`.
    pub fn queued(&self, port: u16) -> usize {
        self.lock().queues.get(&port).map_or(0, VecDeque::len)
    }

    pub fn services(&self, clock: &ManualClock) -> Services {
        Services::new(Arc::new(clock.clone()), Arc::new(self.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        SimNetwork::new()
    }
}

impl Network for SimNetwork {
    fn bind(&self, port: u16) -> Result<Box<dyn DatagramSocket>, SocketError> {
        let mut state = self.lock();
        let port = match port {
            0 => state.ephemeral_port().ok_or(SocketError::NoResources)?,
            port if state.queues.contains_key(&port) => return Err(SocketError::AddrInUse),
            port => port,
        };
        state.queues.insert(port, VecDeque::new());
        Ok(Box::new(SimSocket {
            port,
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimSocket {
    port: u16,
    state: Arc<Mutex<SimState>>,
}

impl SimSocket {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DatagramSocket for SimSocket {
    fn send_to(&mut self, payload: &[u8], to: PeerAddr) -> Result<usize, SocketError> {
        let from = PeerAddr::new(SIM_HOST, self.port);
        self.lock().route(payload, from, to);
        Ok(payload.len())
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> Result<Option<(usize, PeerAddr)>, SocketError> {
        let port = self.port;
        let next = self
            .lock()
            .queues
            .get_mut(&port)
            .and_then(VecDeque::pop_front);
        match next {
            Some((datagram, from)) => {
                let len = datagram.len().min(buffer.len());
                buffer[..len].copy_from_slice(&datagram[..len]);
                Ok(Some((len, from)))
            }
            None => Ok(None),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        let port = self.port;
        self.lock().queues.remove(&port);
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock::default()
    }

    pub fn starting_at(ms: u32) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(ms)),
        }
    }

    pub fn advance(&self, ms: u32) {
        // wrapping, like a real tick counter
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.wrapping_add(ms))
            });
    }

    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}
