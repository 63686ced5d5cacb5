use crate::errors::{ProtocolError, ProtocolResult};
use std::{
    fmt::{self, Display, Formatter},
    net::{Ipv4Addr, SocketAddrV4},
    str::FromStr,
};

/// A flat 32-bit address plus port.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub addr: u32,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(addr: u32, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        PeerAddr::new(u32::from(*addr.ip()), addr.port())
    }
}

impl From<PeerAddr> for SocketAddrV4 {
    fn from(addr: PeerAddr) -> Self {
        SocketAddrV4::new(addr.ip(), addr.port)
    }
}

/// A parsed connection string: `[host:]port[:remote_port][#ident]`.
///
/// The host is either a dotted quad or `$` followed by eight hex digits. With a single port the
/// same port is used on both sides when listening; when connecting the local port is ephemeral.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSpec {
    pub host: Option<u32>,
    pub first_port: u16,
    pub second_port: Option<u16>,
    /// Text after the `#` delimiter.
    pub ident: Option<String>,
}

impl AddressSpec {
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let (address, ident) = match text.find('#') {
            Some(pos) => (&text[..pos], Some(text[pos + 1..].to_string())),
            None => (text, None),
        };

        let mut parts = address.split(':').peekable();
        let host = match parts.peek() {
            Some(first) if first.is_empty() => {
                parts.next();
                None
            }
            Some(first) if first.starts_with('$') || first.contains('.') => {
                let host = parse_host(first)?;
                parts.next();
                Some(host)
            }
            _ => None,
        };

        let first_port = match parts.next() {
            Some(port) => parse_port(port)?,
            None => return Err(ProtocolError::Address(format!("missing port in '{}'", text))),
        };
        let second_port = parts.next().map(parse_port).transpose()?;
        if parts.next().is_some() {
            return Err(ProtocolError::Address(format!("too many fields in '{}'", text)));
        }

        Ok(Self {
            host,
            first_port,
            second_port,
            ident,
        })
    }

    pub fn local_port_for_listen(&self) -> u16 {
        self.first_port
    }

    pub fn local_port_for_connect(&self) -> u16 {
        match self.second_port {
            Some(_) => self.first_port,
            None => 0,
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.second_port.unwrap_or(self.first_port)
    }

    pub fn peer(&self) -> Option<PeerAddr> {
        self.host.map(|host| PeerAddr::new(host, self.remote_port()))
    }

    /// Formats the remote address as `a.b.c.d<divider>port`.
    pub fn format_peer(&self, divider: char) -> ProtocolResult<String> {
        let peer = self
            .peer()
            .ok_or_else(|| ProtocolError::Address("no host to resolve".to_string()))?;
        Ok(format!("{}{}{}", peer.ip(), divider, peer.port))
    }
}

fn parse_host(text: &str) -> ProtocolResult<u32> {
    if let Some(hex) = text.strip_prefix('$') {
        return u32::from_str_radix(hex, 16)
            .map_err(|_| ProtocolError::Address(format!("invalid hex host '{}'", text)));
    }
    Ipv4Addr::from_str(text)
        .map(u32::from)
        .map_err(|_| ProtocolError::Address(format!("invalid host '{}'", text)))
}

fn parse_port(text: &str) -> ProtocolResult<u16> {
    text.parse::<u16>()
        .map_err(|_| ProtocolError::Address(format!("invalid port '{}'", text)))
}

#[cfg(test)]
mod test {
    use super::{AddressSpec, PeerAddr};
    use crate::errors::ProtocolError;

    #[test]
    fn parses_full_connection_string() {
        let spec =
            AddressSpec::parse("192.168.1.90:3659:3660#$c0a8015a$c0a8015a-$c0a8015a$c0a8015a")
                .unwrap();
        assert_eq!(spec.host, Some(0xc0a8_015a));
        assert_eq!(spec.local_port_for_connect(), 3659);
        assert_eq!(spec.remote_port(), 3660);
        assert_eq!(
            spec.ident.as_deref(),
            Some("$c0a8015a$c0a8015a-$c0a8015a$c0a8015a")
        );
        assert_eq!(spec.peer(), Some(PeerAddr::new(0xc0a8_015a, 3660)));
    }

    #[test]
    fn parses_hex_host_and_single_port() {
        let spec = AddressSpec::parse("$7f000001:9000").unwrap();
        assert_eq!(spec.host, Some(0x7f00_0001));
        assert_eq!(spec.local_port_for_connect(), 0);
        assert_eq!(spec.remote_port(), 9000);
    }

    #[test]
    fn parses_bare_port() {
        for text in &["9000", ":9000", "9000#abc"] {
            let spec = AddressSpec::parse(text).unwrap();
            assert_eq!(spec.host, None);
            assert_eq!(spec.local_port_for_listen(), 9000);
            assert_eq!(spec.peer(), None);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            AddressSpec::parse("1.2.3:80").unwrap_err(),
            ProtocolError::Address(String::new())
        );
        assert!(AddressSpec::parse("1.2.3.4").is_err());
        assert!(AddressSpec::parse("1.2.3.4:70000").is_err());
        assert!(AddressSpec::parse("1.2.3.4:1:2:3").is_err());
        assert!(AddressSpec::parse("$zz:1").is_err());
    }

    #[test]
    fn formats_resolved_peer() {
        let spec = AddressSpec::parse("10.0.0.2:5000:6000").unwrap();
        assert_eq!(spec.format_peer(':').unwrap(), "10.0.0.2:6000");
        assert_eq!(spec.format_peer('/').unwrap(), "10.0.0.2/6000");
        assert!(AddressSpec::parse("6000").unwrap().format_peer(':').is_err());
    }

    #[test]
    fn display_uses_dotted_quad() {
        assert_eq!(PeerAddr::new(0x7f00_0001, 80).to_string(), "127.0.0.1:80");
    }
}
