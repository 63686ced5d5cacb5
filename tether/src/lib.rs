//! Reliable, ordered datagrams over UDP for peer-to-peer sessions.
//!
//! The protocol engine lives in `tether-protocol` and never touches the OS. This crate plugs it
//! into real UDP sockets and the system clock, and can drive every connection from a background
//! thread.

mod ticker;
mod udp;

use std::sync::Arc;

pub use crate::{ticker::Ticker, udp::UdpNetwork};
pub use tether_protocol::{
    connection_ident, net_hash, AddressSpec, Callback, Clock, CloseReason, Config, Connection,
    ControlOption, DataPoint, Datagram, DatagramSocket, DeliveryGuarantee, Endpoint, Event,
    Metrics, Network, PeerAddr, Phase, ProtocolError, ProtocolResult, Registry, Services,
    SocketError, Status, SystemClock, DEFAULT_REDUNDANT_LIMIT, DEFAULT_UNACK_LIMIT,
    MAX_INTERVAL_MS, MAX_RECORD_WIDTH,
};

/// Real UDP sockets and a millisecond clock starting now.
pub fn system_services() -> Services {
    Services::new(Arc::new(SystemClock::new()), Arc::new(UdpNetwork::new()))
}
