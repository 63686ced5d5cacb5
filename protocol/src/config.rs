use crate::{
    errors::{ProtocolError, ProtocolResult},
    packet::{COPY_TRAILER_SIZE, MAX_PAYLOAD, META_CHUNK_SIZE, META_TYPE_CLIENT_IDS},
};

/// Largest record that still fits a datagram together with the header and a metadata chunk.
pub const MAX_RECORD_WIDTH: usize = MAX_PAYLOAD - META_CHUNK_SIZE;

pub const DEFAULT_UNACK_LIMIT: u32 = 2048;
pub const DEFAULT_REDUNDANT_LIMIT: u32 = 64;

/// Longest timer the wrapping tick arithmetic can compare, about 24 days.
pub const MAX_INTERVAL_MS: u32 = i32::MAX as u32;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// The maximum size of a single record. Every send is one record.
    pub(crate) record_width: usize,
    /// Size of the send window in bytes, a multiple of `record_width`.
    pub(crate) send_capacity: usize,
    /// Size of the receive window in bytes, a multiple of `record_width`.
    pub(crate) recv_capacity: usize,
    /// Maximum number of queued, unacknowledged payload bytes.
    pub(crate) unack_limit: u32,
    /// Maximum number of bytes resent redundantly with each new packet.
    pub(crate) redundant_limit: u32,
    /// Metadata chunk attached to every data packet (0 = none).
    pub(crate) meta_type: u8,
    pub(crate) client_ident: u32,
    /// Keepalive interval while data is waiting for an ack.
    pub(crate) busy_keepalive_ms: u32,
    /// Keepalive interval when there is nothing in flight.
    pub(crate) idle_keepalive_ms: u32,
    /// Interval between firewall pokes / connection attempts.
    pub(crate) poke_interval_ms: u32,
    /// Minimum interval between two NAKs for the same gap.
    pub(crate) nak_interval_ms: u32,
    /// An open connection that hears nothing for this long is dead.
    pub(crate) liveness_timeout_ms: u32,
    /// How long a closing connection keeps trying to deliver unacked data.
    pub(crate) close_grace_ms: u32,
}

impl Config {
    pub fn new(record_width: usize, send_capacity: usize, recv_capacity: usize) -> Self {
        Self {
            record_width,
            send_capacity,
            recv_capacity,
            ..Config::default()
        }
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.record_width == 0 || self.record_width > MAX_RECORD_WIDTH {
            return Err(ProtocolError::InvalidConfiguration(
                "record width must be between 1 and MAX_RECORD_WIDTH.",
            ));
        }
        for capacity in &[self.send_capacity, self.recv_capacity] {
            if *capacity % self.record_width != 0 {
                return Err(ProtocolError::InvalidConfiguration(
                    "window capacity must be a multiple of the record width.",
                ));
            }
            if *capacity / self.record_width < 2 {
                return Err(ProtocolError::InvalidConfiguration(
                    "window capacity must hold at least two records.",
                ));
            }
        }
        if (self.unack_limit as usize) < self.record_width {
            return Err(ProtocolError::InvalidConfiguration(
                "unack limit must allow at least one full record.",
            ));
        }
        if self.meta_type > META_TYPE_CLIENT_IDS {
            return Err(ProtocolError::InvalidConfiguration("unknown metadata type."));
        }
        if self.busy_keepalive_ms == 0 || self.idle_keepalive_ms == 0 {
            return Err(ProtocolError::InvalidConfiguration(
                "keepalive intervals must be positive.",
            ));
        }
        let timers = [
            self.busy_keepalive_ms,
            self.idle_keepalive_ms,
            self.poke_interval_ms,
            self.nak_interval_ms,
            self.liveness_timeout_ms,
            self.close_grace_ms,
        ];
        if timers.iter().any(|ms| *ms > MAX_INTERVAL_MS) {
            return Err(ProtocolError::InvalidConfiguration(
                "timers must not exceed MAX_INTERVAL_MS.",
            ));
        }
        Ok(())
    }

    pub fn record_width(&self) -> usize {
        self.record_width
    }

    pub fn unack_limit(&self) -> u32 {
        self.unack_limit
    }

    pub fn redundant_limit(&self) -> u32 {
        self.redundant_limit
    }

    pub fn with_unack_limit(mut self, unack_limit: u32) -> Self {
        self.unack_limit = unack_limit;
        self
    }

    pub fn with_redundant_limit(mut self, redundant_limit: u32) -> Self {
        self.redundant_limit = redundant_limit;
        self
    }

    pub fn with_meta_type(mut self, meta_type: u8) -> Self {
        self.meta_type = meta_type;
        self
    }

    pub fn with_client_ident(mut self, client_ident: u32) -> Self {
        self.client_ident = client_ident;
        self
    }

    pub fn with_keepalive_ms(mut self, busy: u32, idle: u32) -> Self {
        self.busy_keepalive_ms = busy;
        self.idle_keepalive_ms = idle;
        self
    }

    pub fn with_poke_interval_ms(mut self, poke_interval_ms: u32) -> Self {
        self.poke_interval_ms = poke_interval_ms;
        self
    }

    pub fn with_nak_interval_ms(mut self, nak_interval_ms: u32) -> Self {
        self.nak_interval_ms = nak_interval_ms;
        self
    }

    pub fn with_liveness_timeout_ms(mut self, liveness_timeout_ms: u32) -> Self {
        self.liveness_timeout_ms = liveness_timeout_ms;
        self
    }

    pub fn with_close_grace_ms(mut self, close_grace_ms: u32) -> Self {
        self.close_grace_ms = close_grace_ms;
        self
    }

    /// Bytes a redundant copy of `len` bytes costs on the wire.
    #[inline]
    pub(crate) const fn copy_cost(len: usize) -> usize {
        len + COPY_TRAILER_SIZE
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            record_width: 256,
            send_capacity: 256 * 32,
            recv_capacity: 256 * 32,
            unack_limit: DEFAULT_UNACK_LIMIT,
            redundant_limit: DEFAULT_REDUNDANT_LIMIT,
            meta_type: 0,
            client_ident: 0,
            busy_keepalive_ms: 100,
            idle_keepalive_ms: 2500,
            poke_interval_ms: 1000,
            nak_interval_ms: 100,
            liveness_timeout_ms: 30_000,
            close_grace_ms: 2000,
        }
    }
}
