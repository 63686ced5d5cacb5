/// Deterministic 32-bit string hash used to derive connection identifiers.
///
/// The right shift operates on the signed value, so a set top bit smears into the low bits.
pub fn net_hash(text: &str) -> u32 {
    text.bytes().fold(0u32, |hash, byte| {
        let smeared = ((hash as i32) >> 27) as u32;
        u32::from(byte) ^ smeared ^ (hash << 5)
    })
}

/// Hashes the part of a connection string after the first `#`, if there is one.
pub fn connection_ident(connection: &str) -> Option<u32> {
    connection
        .find('#')
        .map(|pos| net_hash(&connection[pos + 1..]))
}

#[cfg(test)]
mod test {
    use super::{connection_ident, net_hash};

    #[test]
    fn hash_matches_known_value() {
        assert_eq!(
            net_hash("$c0a8015a$c0a8015a-$c0a8015a$c0a8015a"),
            0xC662_7546
        );
    }

    #[test]
    fn connection_ident_uses_text_after_delimiter() {
        let ident =
            connection_ident("192.168.1.90:3659:3659#$c0a8015a$c0a8015a-$c0a8015a$c0a8015a");
        assert_eq!(ident, Some(0xC662_7546));
        assert_eq!(connection_ident("192.168.1.90:3659:3659"), None);
        assert_eq!(connection_ident("1.2.3.4:5#"), Some(0));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(net_hash("abc"), net_hash("abc"));
        assert_ne!(net_hash("abc"), net_hash("abd"));
        assert_eq!(net_hash(""), 0);
    }
}
