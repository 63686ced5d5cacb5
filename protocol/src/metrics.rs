use std::fmt;

/// Per-connection packet counters, exposed through `Status`.
#[derive(Clone, Debug, PartialEq)]
pub struct Metrics {
    counters: [u64; DataPoint::Length as usize],
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: [0; DataPoint::Length as usize],
        }
    }

    pub fn get_count(&self, data_point: DataPoint) -> u64 {
        self.counters[data_point as usize]
    }

    pub(crate) fn increment(&mut self, data_point: DataPoint) {
        self.add(data_point, 1);
    }

    pub(crate) fn add(&mut self, data_point: DataPoint, count: u64) {
        self.counters[data_point as usize] += count;
    }

    pub fn reset(&mut self) {
        self.counters = [0; DataPoint::Length as usize];
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "sent={} recv={} resent={} redundant={} dup={} ooo={} full={} invalid={} spoofed={} \
             phase={} nak_out={} nak_in={} send_fail={}",
            self.get_count(DataPoint::PacketsSent),
            self.get_count(DataPoint::PacketsReceived),
            self.get_count(DataPoint::PacketsResent),
            self.get_count(DataPoint::RedundantCopiesSent),
            self.get_count(DataPoint::PacketsDuplicate),
            self.get_count(DataPoint::PacketsOutOfOrder),
            self.get_count(DataPoint::PacketsWindowFull),
            self.get_count(DataPoint::PacketsInvalid),
            self.get_count(DataPoint::PacketsSpoofed),
            self.get_count(DataPoint::PacketsWrongPhase),
            self.get_count(DataPoint::NaksSent),
            self.get_count(DataPoint::NaksReceived),
            self.get_count(DataPoint::SendFailures),
        )
    }
}

#[derive(Copy, Clone, Debug, PartialOrd, PartialEq)]
pub enum DataPoint {
    PacketsSent = 0,
    PacketsReceived = 1,
    PacketsResent = 2,
    RedundantCopiesSent = 3,
    /// Reliable records that arrived again after being committed.
    PacketsDuplicate = 4,
    /// Records stashed because they arrived ahead of a gap.
    PacketsOutOfOrder = 5,
    /// Records dropped because the receive window had no room.
    PacketsWindowFull = 6,
    PacketsInvalid = 7,
    /// Packets from an address other than the peer, control packets carrying a foreign
    /// connection ident, and data addressed to another client.
    PacketsSpoofed = 8,
    /// Packets whose kind is not expected in the current phase.
    PacketsWrongPhase = 9,
    NaksSent = 10,
    NaksReceived = 11,
    SendFailures = 12,
    UnreliableDuplicates = 13,
    Length = 14,
}

#[cfg(test)]
mod test {
    use super::{DataPoint, Metrics};

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::default();
        assert_eq!(metrics.get_count(DataPoint::PacketsResent), 0);
        assert_eq!(metrics, Metrics::new());
    }

    #[test]
    fn copies_are_added_in_bulk() {
        let mut metrics = Metrics::new();
        metrics.add(DataPoint::RedundantCopiesSent, 3);
        metrics.add(DataPoint::RedundantCopiesSent, 4);
        metrics.increment(DataPoint::PacketsSent);
        assert_eq!(metrics.get_count(DataPoint::RedundantCopiesSent), 7);
        assert_eq!(metrics.get_count(DataPoint::PacketsSent), 1);
    }

    #[test]
    fn display_lists_counters() {
        let mut metrics = Metrics::new();
        metrics.increment(DataPoint::NaksSent);
        let text = metrics.to_string();
        assert!(text.starts_with("sent=0 recv=0"));
        assert!(text.contains("nak_out=1"));
        metrics.reset();
        assert_eq!(metrics.get_count(DataPoint::NaksSent), 0);
    }
}
