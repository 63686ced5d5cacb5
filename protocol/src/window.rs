//! Fixed-capacity record windows.
//!
//! Both directions store records in a `RecordRing`: a byte buffer split into slots of
//! `width` bytes, addressed by byte offsets that wrap modulo the capacity. One slot is always
//! kept free so that `read == write` means empty.

use crate::{
    errors::{ProtocolError, ProtocolResult},
    sequence::{
        reliable_add, reliable_at_or_after, reliable_distance, reliable_prev, RELIABLE_BASE,
    },
};
use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct RecordRing {
    width: usize,
    capacity: usize,
    storage: Box<[u8]>,
    lens: Box<[usize]>,
    ticks: Box<[u32]>,
    read: usize,
    write: usize,
}

impl RecordRing {
    pub fn new(width: usize, capacity: usize) -> Self {
        let slots = capacity / width;
        Self {
            width,
            capacity,
            storage: vec![0; capacity].into_boxed_slice(),
            lens: vec![0; slots].into_boxed_slice(),
            ticks: vec![0; slots].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn read(&self) -> usize {
        self.read
    }

    #[inline]
    pub fn write(&self) -> usize {
        self.write
    }

    /// Offset `n` slots after `offset`.
    #[inline]
    pub fn advance(&self, offset: usize, n: usize) -> usize {
        (offset + n * self.width) % self.capacity
    }

    /// Number of records from `from` (inclusive) to `to` (exclusive).
    #[inline]
    pub fn records_between(&self, from: usize, to: usize) -> usize {
        ((to + self.capacity - from) % self.capacity) / self.width
    }

    pub fn len(&self) -> usize {
        self.records_between(self.read, self.write)
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Slots that can still be pushed.
    pub fn free(&self) -> usize {
        self.capacity / self.width - 1 - self.len()
    }

    pub fn push(&mut self, record: &[u8], tick: u32) -> ProtocolResult<()> {
        if record.len() > self.width {
            return Err(ProtocolError::PayloadTooLarge(record.len(), self.width));
        }
        if self.free() == 0 {
            return Err(ProtocolError::Saturated);
        }
        let slot = self.write / self.width;
        self.storage[self.write..self.write + record.len()].copy_from_slice(record);
        self.lens[slot] = record.len();
        self.ticks[slot] = tick;
        self.write = self.advance(self.write, 1);
        Ok(())
    }

    pub fn record_at(&self, offset: usize) -> &[u8] {
        let len = self.lens[offset / self.width];
        &self.storage[offset..offset + len]
    }

    pub fn tick_at(&self, offset: usize) -> u32 {
        self.ticks[offset / self.width]
    }

    pub fn peek(&self) -> Option<(&[u8], u32)> {
        if self.is_empty() {
            return None;
        }
        Some((self.record_at(self.read), self.tick_at(self.read)))
    }

    /// Discards the oldest record and returns its length.
    pub fn pop(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let len = self.lens[self.read / self.width];
        self.read = self.advance(self.read, 1);
        Some(len)
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

/// Outgoing reliable records.
///
/// ```ascii
///   read          next           high          write
///    |  in flight  |  to resend   |   unsent    |
/// ```
/// `next` trails `high` only after a rewind.
#[derive(Debug)]
pub(crate) struct SendWindow {
    ring: RecordRing,
    next: usize,
    high: usize,
    /// Sequence number of the record at `read`.
    snd_una_seq: u32,
    queued_bytes: usize,
    unack_limit: usize,
}

impl SendWindow {
    pub fn new(width: usize, capacity: usize, unack_limit: u32) -> Self {
        Self {
            ring: RecordRing::new(width, capacity),
            next: 0,
            high: 0,
            snd_una_seq: RELIABLE_BASE,
            queued_bytes: 0,
            unack_limit: unack_limit as usize,
        }
    }

    pub fn set_unack_limit(&mut self, unack_limit: u32) {
        self.unack_limit = unack_limit as usize;
    }

    /// Queues a record and returns the sequence number it will carry.
    pub fn push(&mut self, record: &[u8], tick: u32) -> ProtocolResult<u32> {
        if record.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if record.len() > self.ring.width() {
            return Err(ProtocolError::PayloadTooLarge(record.len(), self.ring.width()));
        }
        if self.queued_bytes + record.len() > self.unack_limit {
            return Err(ProtocolError::Saturated);
        }
        let seq = self.seq_at(self.ring.write());
        self.ring.push(record, tick)?;
        self.queued_bytes += record.len();
        Ok(seq)
    }

    fn seq_at(&self, offset: usize) -> u32 {
        reliable_add(
            self.snd_una_seq,
            self.ring.records_between(self.ring.read(), offset) as u32,
        )
    }

    /// Sequence number the next new record will get.
    pub fn write_seq(&self) -> u32 {
        self.seq_at(self.ring.write())
    }

    /// Highest sequence ever transmitted, or the one before the first if nothing was.
    pub fn last_sent_seq(&self) -> u32 {
        reliable_prev(self.seq_at(self.high))
    }

    /// Records sent at least once but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.ring.records_between(self.ring.read(), self.high)
    }

    pub fn has_unsent(&self) -> bool {
        self.next != self.ring.write()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// The record at `next` with its sequence number.
    pub fn next_unsent(&self) -> Option<(u32, &[u8])> {
        if !self.has_unsent() {
            return None;
        }
        Some((self.seq_at(self.next), self.ring.record_at(self.next)))
    }

    /// Records still in the window that immediately precede `next`, newest first.
    pub fn preceding(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let count = self.ring.records_between(self.ring.read(), self.next);
        (1..=count).map(move |back| {
            let offset = self.ring.advance(self.next, self.ring_slots() - back);
            self.ring.record_at(offset)
        })
    }

    fn ring_slots(&self) -> usize {
        self.ring.capacity / self.ring.width()
    }

    /// Moves `next` past the record just transmitted. Returns true if it was a retransmission.
    pub fn mark_sent(&mut self) -> bool {
        let resent = self.ring.records_between(self.ring.read(), self.next) < self.in_flight();
        self.next = self.ring.advance(self.next, 1);
        if !resent {
            self.high = self.next;
        }
        resent
    }

    /// Releases every record up to and including `ack`. Returns the number released.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let distance = reliable_distance(self.snd_una_seq, ack) as usize;
        if distance >= self.in_flight() {
            return 0;
        }
        let released = distance + 1;
        let sent_before = self.ring.records_between(self.ring.read(), self.next);
        for _ in 0..released {
            if let Some(len) = self.ring.pop() {
                self.queued_bytes -= len;
            }
        }
        self.snd_una_seq = reliable_add(self.snd_una_seq, released as u32);
        if released > sent_before {
            self.next = self.ring.read();
        }
        released
    }

    /// Schedules every unacknowledged record for retransmission.
    pub fn rewind(&mut self) {
        self.next = self.ring.read();
    }

    /// Abandons all queued data. Sequence numbering continues where it left off.
    pub fn clear(&mut self) {
        self.snd_una_seq = self.write_seq();
        self.ring.clear();
        self.next = 0;
        self.high = 0;
        self.queued_bytes = 0;
    }
}

/// What happened to an incoming record.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Arrival {
    /// Committed along with this many records that were waiting behind it.
    Delivered(usize),
    /// Arrived ahead of a gap and is held until the gap fills.
    Stashed,
    Duplicate,
    /// No room to deliver or hold it.
    Dropped,
}

/// Incoming records, committed in sequence order.
#[derive(Debug)]
pub(crate) struct ReceiveWindow {
    ring: RecordRing,
    /// Next reliable sequence expected.
    rcv_seq: u32,
    /// Entry `i` holds the record with sequence `rcv_seq + i`.
    pending: VecDeque<Option<(Vec<u8>, u32)>>,
    last_unreliable: Option<u32>,
}

impl ReceiveWindow {
    pub fn new(width: usize, capacity: usize) -> Self {
        Self {
            ring: RecordRing::new(width, capacity),
            rcv_seq: RELIABLE_BASE,
            pending: VecDeque::new(),
            last_unreliable: None,
        }
    }

    pub fn expected_seq(&self) -> u32 {
        self.rcv_seq
    }

    /// Last reliable sequence received in order. This is what goes into the ack field.
    pub fn ack_seq(&self) -> u32 {
        reliable_prev(self.rcv_seq)
    }

    pub fn has_gap(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }

    pub fn stashed(&self) -> usize {
        self.pending.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn deliver(&mut self, seq: u32, record: &[u8], tick: u32) -> Arrival {
        if !reliable_at_or_after(self.rcv_seq, seq) {
            return Arrival::Duplicate;
        }
        let distance = reliable_distance(self.rcv_seq, seq) as usize;
        if distance == 0 {
            if self.ring.push(record, tick).is_err() {
                return Arrival::Dropped;
            }
            self.pending.pop_front();
            self.rcv_seq = reliable_add(self.rcv_seq, 1);
            return Arrival::Delivered(self.drain_in_order());
        }
        self.stash(distance, record, tick)
    }

    fn stash(&mut self, distance: usize, record: &[u8], tick: u32) -> Arrival {
        if distance >= self.ring.free() {
            return Arrival::Dropped;
        }
        if self.pending.len() <= distance {
            self.pending.resize(distance + 1, None);
        }
        match self.pending[distance] {
            Some(_) => Arrival::Duplicate,
            None => {
                self.pending[distance] = Some((record.to_vec(), tick));
                Arrival::Stashed
            }
        }
    }

    /// Commits the records that became in order. Returns how many.
    fn drain_in_order(&mut self) -> usize {
        let mut count = 0;
        while let Some(Some((record, tick))) = self.pending.front() {
            if self.ring.push(record, *tick).is_err() {
                break;
            }
            self.pending.pop_front();
            self.rcv_seq = reliable_add(self.rcv_seq, 1);
            count += 1;
        }
        count
    }

    /// Commits an unreliable record unless it repeats the previous one or there is no room
    /// left beside the slots reserved for held records.
    pub fn deliver_unreliable(&mut self, seq: u32, record: &[u8], tick: u32) -> Arrival {
        if self.last_unreliable == Some(seq) {
            return Arrival::Duplicate;
        }
        if self.ring.free() <= self.pending.len() {
            return Arrival::Dropped;
        }
        match self.ring.push(record, tick) {
            Ok(()) => {
                self.last_unreliable = Some(seq);
                Arrival::Delivered(0)
            }
            Err(_) => Arrival::Dropped,
        }
    }

    pub fn peek(&self) -> Option<(&[u8], u32)> {
        self.ring.peek()
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.ring.pop()
    }
}
