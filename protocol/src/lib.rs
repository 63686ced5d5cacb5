mod address;
mod config;
mod connection;
mod datagram;
mod endpoint;
mod errors;
mod guarantees;
mod ident;
mod metrics;
pub mod packet;
mod registry;
pub mod sequence;
pub mod simulator;
mod socket;
mod window;

pub use crate::{
    address::{AddressSpec, PeerAddr},
    config::{
        Config, DEFAULT_REDUNDANT_LIMIT, DEFAULT_UNACK_LIMIT, MAX_INTERVAL_MS, MAX_RECORD_WIDTH,
    },
    connection::{CloseReason, Connection, ControlOption, Event, Phase, Status},
    datagram::Datagram,
    endpoint::{Callback, Endpoint},
    errors::{ProtocolError, ProtocolResult, SocketError},
    guarantees::DeliveryGuarantee,
    ident::{connection_ident, net_hash},
    metrics::{DataPoint, Metrics},
    registry::Registry,
    socket::{time_diff, Clock, DatagramSocket, Network, Services, SystemClock},
};
