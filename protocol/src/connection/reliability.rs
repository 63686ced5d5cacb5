//! Sequencing, acknowledgement and retransmission for an established connection.

use super::Connection;
use crate::{
    config::Config,
    errors::{ProtocolError, ProtocolResult},
    metrics::DataPoint,
    packet::{
        self, MetaChunk, Packet, PacketKind, SequenceField, MAX_COPIES, MAX_PAYLOAD,
        META_CHUNK_SIZE, META_TYPE_CLIENT_IDS,
    },
    sequence::{is_reliable, unreliable_next},
    socket::time_diff,
    window::{Arrival, SendWindow},
};
use bytes::{BufMut, BytesMut};
use log::{debug, trace};

impl Connection {
    /// Periodic work while open or draining: retransmit, NAK, ack and keep the path alive.
    pub(super) fn service_reliable(&mut self, now: u32) {
        let busy = self.config.busy_keepalive_ms as i32;
        if self.send_window.in_flight() > 0 && time_diff(now, self.data_tick) >= busy {
            debug!(
                "connection {:08x} resending {} unacked records",
                self.conn_ident,
                self.send_window.in_flight()
            );
            self.send_window.rewind();
        }
        self.flush_records(now);
        self.maybe_nak(now);

        if self.ack_owed {
            self.send_ack();
        } else if self.send_window.in_flight() == 0
            && time_diff(now, self.send_tick) >= self.config.idle_keepalive_ms as i32
        {
            trace!("connection {:08x} idle keepalive", self.conn_ident);
            self.send_ack();
        }
    }

    /// Transmits every record from `next` to the end of the send window.
    pub(super) fn flush_records(&mut self, now: u32) {
        let peer = match self.peer {
            Some(peer) => peer,
            None => return,
        };
        let meta = self.meta_chunk();
        let ack = self.recv_window.ack_seq();
        while let Some(copies) = encode_next_record(
            &self.send_window,
            ack,
            meta.as_ref(),
            self.config.redundant_limit as usize,
            &mut self.scratch,
        ) {
            // a failed send is retried by the busy keepalive
            let _ = self.transmit(peer);
            if self.send_window.mark_sent() {
                self.metrics.increment(DataPoint::PacketsResent);
            }
            self.metrics
                .add(DataPoint::RedundantCopiesSent, u64::from(copies));
            self.data_tick = now;
        }
    }

    pub(super) fn send_unreliable(&mut self, payload: &[u8]) -> ProtocolResult<()> {
        let peer = match self.peer {
            Some(peer) => peer,
            None => return Err(ProtocolError::BadState(self.phase)),
        };
        let meta = self.meta_chunk();
        self.scratch.clear();
        packet::encode(
            SequenceField::new(PacketKind::Unreliable(self.unreliable_seq)),
            self.recv_window.ack_seq(),
            meta.as_ref(),
            payload,
            &mut self.scratch,
        );
        self.unreliable_seq = unreliable_next(self.unreliable_seq);
        self.transmit(peer)?;
        Ok(())
    }

    /// An empty reliable packet: refreshes the peer's liveness timer and carries our ack.
    fn send_ack(&mut self) {
        let peer = match self.peer {
            Some(peer) => peer,
            None => return,
        };
        self.scratch.clear();
        packet::encode_header(
            SequenceField::new(PacketKind::Reliable(self.send_window.last_sent_seq())),
            self.recv_window.ack_seq(),
            &mut self.scratch,
        );
        let _ = self.transmit(peer);
    }

    /// Asks the peer to resend, at most once per NAK interval while a gap is open.
    fn maybe_nak(&mut self, now: u32) {
        if !self.recv_window.has_gap() {
            return;
        }
        if let Some(last) = self.last_nak {
            if time_diff(now, last) < self.config.nak_interval_ms as i32 {
                return;
            }
        }
        let peer = match self.peer {
            Some(peer) => peer,
            None => return,
        };
        debug!(
            "connection {:08x} missing {}, sending NAK",
            self.conn_ident,
            self.recv_window.expected_seq()
        );
        self.last_nak = Some(now);
        self.metrics.increment(DataPoint::NaksSent);
        self.send_control(PacketKind::Nak, peer);
    }

    pub(super) fn on_ack(&mut self, ack: u32) {
        if !is_reliable(ack) {
            trace!("ignoring ack outside the reliable range: {}", ack);
            return;
        }
        let released = self.send_window.acknowledge(ack);
        if released > 0 {
            trace!("ack {} released {} records", ack, released);
        }
    }

    pub(super) fn on_nak(&mut self) {
        self.metrics.increment(DataPoint::NaksReceived);
        if self.send_window.in_flight() > 0 {
            self.send_window.rewind();
        }
    }

    pub(super) fn on_reliable(&mut self, packet: &Packet, now: u32) {
        if packet.is_ack_only() {
            return;
        }
        let records = match packet.records() {
            Ok(records) => records,
            Err(err) => {
                debug!("dropping reliable packet: {}", err);
                self.metrics.increment(DataPoint::PacketsInvalid);
                return;
            }
        };

        let newest = records.len() - 1;
        for (index, (seq, record)) in records.into_iter().enumerate() {
            match self.recv_window.deliver(seq, record, now) {
                Arrival::Delivered(released) => {
                    trace!("delivered {} (+{} held)", seq, released);
                    self.data_ready = true;
                    self.ack_owed = true;
                }
                Arrival::Stashed => self.metrics.increment(DataPoint::PacketsOutOfOrder),
                // copies of records we already have are expected, only the newest one
                // tells us the peer missed our ack
                Arrival::Duplicate if index == newest => {
                    self.metrics.increment(DataPoint::PacketsDuplicate);
                    self.ack_owed = true;
                }
                Arrival::Duplicate => {}
                Arrival::Dropped => self.metrics.increment(DataPoint::PacketsWindowFull),
            }
        }
        self.maybe_nak(now);
    }

    pub(super) fn on_unreliable(&mut self, packet: &Packet, seq: u32, now: u32) {
        if packet.payload.is_empty() {
            return;
        }
        match self.recv_window.deliver_unreliable(seq, packet.payload, now) {
            Arrival::Delivered(_) => self.data_ready = true,
            Arrival::Duplicate => self.metrics.increment(DataPoint::UnreliableDuplicates),
            _ => self.metrics.increment(DataPoint::PacketsWindowFull),
        }
    }

    fn meta_chunk(&self) -> Option<MetaChunk> {
        if self.config.meta_type == META_TYPE_CLIENT_IDS {
            Some(MetaChunk {
                source: self.config.client_ident,
                target: self.remote_client_ident,
            })
        } else {
            None
        }
    }

    /// Data addressed to another client is dropped.
    pub(super) fn accepts_meta(&mut self, packet: &Packet) -> bool {
        match packet.meta_chunk {
            Some(chunk) if chunk.target != self.config.client_ident => {
                debug!(
                    "dropping packet from client {:08x} for {:08x}",
                    chunk.source, chunk.target
                );
                self.metrics.increment(DataPoint::PacketsSpoofed);
                false
            }
            _ => true,
        }
    }
}

/// Encodes the record at `next` followed by as many of the records just before it as the
/// redundancy budget allows. Returns the number of copies, or `None` if nothing is unsent.
fn encode_next_record(
    window: &SendWindow,
    ack: u32,
    meta: Option<&MetaChunk>,
    redundant_limit: usize,
    buf: &mut BytesMut,
) -> Option<u8> {
    let (seq, newest) = window.next_unsent()?;
    let mut room = MAX_PAYLOAD - newest.len() - meta.map_or(0, |_| META_CHUNK_SIZE);
    let mut redundant = redundant_limit;
    let copies: Vec<&[u8]> = window
        .preceding()
        .take(MAX_COPIES as usize)
        .take_while(|record| {
            let cost = Config::copy_cost(record.len());
            if cost > redundant || cost > room {
                return false;
            }
            redundant -= cost;
            room -= cost;
            true
        })
        .collect();

    let mut field = SequenceField::new(PacketKind::Reliable(seq)).with_copies(copies.len() as u8);
    if meta.is_some() {
        field = field.with_meta(META_TYPE_CLIENT_IDS);
    }
    buf.clear();
    packet::encode_header(field, ack, buf);
    if let Some(chunk) = meta {
        chunk.encode(buf);
    }
    buf.put_slice(newest);
    for record in &copies {
        packet::encode_copy(record, buf);
    }
    Some(copies.len() as u8)
}
