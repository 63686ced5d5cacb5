use crate::connection::Phase;
use std::io;
use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Attempted to send an empty buffer.")]
    EmptyPayload,
    #[error("The payload size ({0} bytes) was bigger than the max allowed size ({1} bytes).")]
    PayloadTooLarge(usize, usize),
    #[error("The send window is saturated.")]
    Saturated,
    #[error("Attempted to recv when the receive window is empty.")]
    Starved,
    #[error("Attempted to recv {0} bytes into a buffer of {1} bytes.")]
    RecvBufferTooSmall(usize, usize),
    #[error("The connection is closed.")]
    Closed,
    #[error("Operation not valid while the connection is {0:?}.")]
    BadState(Phase),
    #[error("Invalid address: {0}")]
    Address(String),
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
    #[error("A transport error occurred. Reason: {0}.")]
    Socket(#[from] SocketError),
    #[error("Invalid Configuration: {0}")]
    InvalidConfiguration(&'static str),
}

impl From<io::Error> for ProtocolError {
    fn from(inner: io::Error) -> ProtocolError {
        ProtocolError::Socket(inner.into())
    }
}

impl PartialEq for ProtocolError {
    fn eq(&self, other: &ProtocolError) -> bool {
        match (self, other) {
            (ProtocolError::EmptyPayload, ProtocolError::EmptyPayload) => true,
            (ProtocolError::PayloadTooLarge(_, _), ProtocolError::PayloadTooLarge(_, _)) => true,
            (ProtocolError::Saturated, ProtocolError::Saturated) => true,
            (ProtocolError::Starved, ProtocolError::Starved) => true,
            (ProtocolError::RecvBufferTooSmall(_, _), ProtocolError::RecvBufferTooSmall(_, _)) => {
                true
            }
            (ProtocolError::Closed, ProtocolError::Closed) => true,
            (ProtocolError::BadState(a), ProtocolError::BadState(b)) => a == b,
            (ProtocolError::Address(_), ProtocolError::Address(_)) => true,
            (ProtocolError::Malformed(_), ProtocolError::Malformed(_)) => true,
            (ProtocolError::Socket(a), ProtocolError::Socket(b)) => a == b,
            (ProtocolError::InvalidConfiguration(_), ProtocolError::InvalidConfiguration(_)) => {
                true
            }
            (_, _) => false,
        }
    }
}

/// Transport failures reported by a [`crate::DatagramSocket`] or [`crate::Network`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("the socket is closed")]
    Closed,
    #[error("the socket is not connected")]
    NotConnected,
    #[error("operation would block")]
    WouldBlock,
    #[error("the address is invalid")]
    Address,
    #[error("network cannot be accessed by this host")]
    Unreachable,
    #[error("connection refused by the recipient")]
    Refused,
    #[error("out of memory")]
    NoMemory,
    #[error("out of resources")]
    NoResources,
    #[error("unsupported operation")]
    Unsupported,
    #[error("resource or operation is invalid")]
    Invalid,
    #[error("address already in use")]
    AddrInUse,
    #[error("connection has been reset")]
    Reset,
    #[error("unclassified error")]
    Other,
}

impl From<io::Error> for SocketError {
    fn from(inner: io::Error) -> SocketError {
        match inner.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SocketError::WouldBlock,
            io::ErrorKind::NotConnected => SocketError::NotConnected,
            io::ErrorKind::ConnectionRefused => SocketError::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                SocketError::Reset
            }
            io::ErrorKind::AddrInUse => SocketError::AddrInUse,
            io::ErrorKind::AddrNotAvailable => SocketError::Address,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => SocketError::Closed,
            io::ErrorKind::OutOfMemory => SocketError::NoMemory,
            io::ErrorKind::Unsupported => SocketError::Unsupported,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => SocketError::Invalid,
            io::ErrorKind::PermissionDenied => SocketError::Unreachable,
            _ => SocketError::Other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ProtocolError, SocketError};
    use std::io;

    #[test]
    fn io_errors_are_translated() {
        let err: SocketError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, SocketError::WouldBlock);
        let err: SocketError = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert_eq!(err, SocketError::AddrInUse);
        let err: SocketError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err, SocketError::Refused);
        let err: SocketError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err, SocketError::Other);
    }

    #[test]
    fn socket_errors_compare_by_kind() {
        let a: ProtocolError = SocketError::Reset.into();
        assert_eq!(a, ProtocolError::Socket(SocketError::Reset));
        assert_ne!(a, ProtocolError::Socket(SocketError::Closed));
        assert_ne!(ProtocolError::Saturated, ProtocolError::Starved);
    }
}
