use log::{debug, trace};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
};
use tether_protocol::{DatagramSocket, Network, PeerAddr, SocketError};

/// Binds non-blocking IPv4 UDP sockets on all interfaces.
#[derive(Clone, Debug, Default)]
pub struct UdpNetwork;

impl UdpNetwork {
    pub fn new() -> Self {
        UdpNetwork
    }
}

impl Network for UdpNetwork {
    fn bind(&self, port: u16) -> Result<Box<dyn DatagramSocket>, SocketError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        let local_port = socket.local_addr()?.port();
        debug!("udp: bound port {}", local_port);
        Ok(Box::new(UdpDatagramSocket { socket, local_port }))
    }
}

struct UdpDatagramSocket {
    socket: UdpSocket,
    local_port: u16,
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&mut self, payload: &[u8], to: PeerAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(payload, SocketAddrV4::from(to))?)
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> Result<Option<(usize, PeerAddr)>, SocketError> {
        loop {
            match self.socket.recv_from(buffer) {
                Ok((len, SocketAddr::V4(from))) => return Ok(Some((len, from.into()))),
                Ok((_, from)) => trace!("udp: ignoring datagram from {}", from),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // an ICMP unreachable from an earlier send, reported on some platforms
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    trace!("udp: port {} got a reset", self.local_port)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}
