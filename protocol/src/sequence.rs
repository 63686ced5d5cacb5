//! Partitioning of the 24-bit sequence value space.
//!
//! ```ascii
//!        0  invalid
//!     1..=5  control tags (INIT, CONN, DISC, NAK, POKE)
//!   6..=127  invalid
//! 128..=255  unreliable sequence numbers (wrap modulo 128)
//! 256..2^24  reliable sequence numbers (wrap modulo 2^24 - 256)
//! ```

pub const PACKET_INIT: u32 = 1;
pub const PACKET_CONN: u32 = 2;
pub const PACKET_DISC: u32 = 3;
pub const PACKET_NAK: u32 = 4;
pub const PACKET_POKE: u32 = 5;

pub const UNRELIABLE_BASE: u32 = 128;
pub const UNRELIABLE_WINDOW: u32 = 128;

pub const RELIABLE_BASE: u32 = 256;
/// Chosen so that the reliable range never reaches the metadata nibbles above bit 23.
pub const RELIABLE_WINDOW: u32 = (1 << 24) - RELIABLE_BASE;

const HALF_RELIABLE_WINDOW: u32 = RELIABLE_WINDOW / 2;

#[inline]
pub fn is_reliable(value: u32) -> bool {
    value >= RELIABLE_BASE && value < RELIABLE_BASE + RELIABLE_WINDOW
}

#[inline]
pub fn is_unreliable(value: u32) -> bool {
    value >= UNRELIABLE_BASE && value < RELIABLE_BASE
}

#[inline]
pub fn is_control(value: u32) -> bool {
    value >= PACKET_INIT && value <= PACKET_POKE
}

/// Reliable sequence `n` steps after `seq`.
#[inline]
pub fn reliable_add(seq: u32, n: u32) -> u32 {
    RELIABLE_BASE + (seq - RELIABLE_BASE + n % RELIABLE_WINDOW) % RELIABLE_WINDOW
}

#[inline]
pub fn reliable_next(seq: u32) -> u32 {
    reliable_add(seq, 1)
}

#[inline]
pub fn reliable_prev(seq: u32) -> u32 {
    reliable_add(seq, RELIABLE_WINDOW - 1)
}

/// Number of steps needed to go from `from` forward to `to`.
#[inline]
pub fn reliable_distance(from: u32, to: u32) -> u32 {
    (to + RELIABLE_WINDOW - from) % RELIABLE_WINDOW
}

/// Whether `to` lies at or after `from`, treating the nearer half of the window as the future.
#[inline]
pub fn reliable_at_or_after(from: u32, to: u32) -> bool {
    reliable_distance(from, to) < HALF_RELIABLE_WINDOW
}

#[inline]
pub fn unreliable_next(seq: u32) -> u32 {
    UNRELIABLE_BASE + (seq - UNRELIABLE_BASE + 1) % UNRELIABLE_WINDOW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_do_not_overlap() {
        for value in 0..RELIABLE_BASE + 2 {
            let kinds = [is_control(value), is_unreliable(value), is_reliable(value)];
            assert!(kinds.iter().filter(|k| **k).count() <= 1, "value {}", value);
        }
        assert!(!is_reliable(1 << 24));
        assert!(is_reliable((1 << 24) - 1));
        assert!(!is_control(0));
        assert!(!is_control(6));
    }

    // This also tests to ensure that the wrapping case is handled successfully.
    #[test]
    fn test_reliable_next_wraps() {
        let last = RELIABLE_BASE + RELIABLE_WINDOW - 1;
        assert_eq!(reliable_next(last), RELIABLE_BASE);
        assert_eq!(reliable_prev(RELIABLE_BASE), last);
        assert_eq!(reliable_add(last, 3), RELIABLE_BASE + 2);
        assert_eq!(reliable_distance(last, RELIABLE_BASE + 2), 3);
    }

    #[test]
    fn test_at_or_after_with_large_delta() {
        let seq = RELIABLE_BASE + 10;
        assert!(reliable_at_or_after(seq, seq));
        assert!(reliable_at_or_after(seq, reliable_add(seq, HALF_RELIABLE_WINDOW - 1)));
        assert!(!reliable_at_or_after(seq, reliable_add(seq, HALF_RELIABLE_WINDOW)));
        assert!(!reliable_at_or_after(seq, reliable_prev(seq)));
    }

    #[test]
    fn test_unreliable_next_wraps() {
        assert_eq!(unreliable_next(UNRELIABLE_BASE), UNRELIABLE_BASE + 1);
        assert_eq!(unreliable_next(RELIABLE_BASE - 1), UNRELIABLE_BASE);
    }
}
