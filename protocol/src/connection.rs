use crate::{
    address::{AddressSpec, PeerAddr},
    config::Config,
    datagram::Datagram,
    errors::{ProtocolError, ProtocolResult, SocketError},
    ident::connection_ident,
    metrics::{DataPoint, Metrics},
    packet::{self, ControlBody, Packet, PacketKind, SequenceField, MAX_DATAGRAM},
    sequence::UNRELIABLE_BASE,
    socket::{time_diff, DatagramSocket, Services},
    window::{ReceiveWindow, SendWindow},
};
use bytes::BytesMut;
use log::{debug, info, trace, warn};
use std::{collections::VecDeque, fmt, mem};

mod reliability;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Dead,
    Idle,
    Connecting,
    Listening,
    Open,
    Closing,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The application called `unconnect`.
    Local,
    /// The peer sent a disconnect.
    Remote,
    /// Nothing was heard from the peer for the liveness timeout.
    Timeout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Opened,
    DataReady,
    Closed(CloseReason),
}

/// Runtime adjustments accepted by `Connection::control`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlOption {
    UnackLimit(u32),
    RedundantLimit(u32),
    MetaType(u32),
    ClientIdent(u32),
}

/// A snapshot of a connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub phase: Phase,
    pub conn_ident: u32,
    pub client_ident: u32,
    pub remote_client_ident: u32,
    pub peer: Option<PeerAddr>,
    pub local_port: Option<u16>,
    /// Records in the send window, sent or not.
    pub send_queued: usize,
    /// Records sent and waiting for an ack.
    pub send_in_flight: usize,
    pub unacked_bytes: usize,
    /// Records ready to be read.
    pub recv_queued: usize,
    /// Records received ahead of a gap.
    pub recv_held: usize,
    pub send_tick: u32,
    pub recv_tick: u32,
    pub last_error: Option<SocketError>,
    pub metrics: Metrics,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.phase)?;
        if let Some(peer) = self.peer {
            write!(f, " peer={}", peer)?;
        }
        write!(
            f,
            " ident={:08x} send={}/{} recv={}+{} {}",
            self.conn_ident,
            self.send_in_flight,
            self.send_queued,
            self.recv_queued,
            self.recv_held,
            self.metrics
        )
    }
}

/// One end of a reliable UDP session.
///
/// Nothing happens on its own: `update` must be called periodically to receive datagrams,
/// acknowledge, retransmit and advance the handshake.
pub struct Connection {
    config: Config,
    services: Services,
    phase: Phase,

    conn_ident: u32,
    remote_client_ident: u32,

    socket: Option<Box<dyn DatagramSocket>>,
    /// `None` while listening for anyone.
    peer: Option<PeerAddr>,
    /// Peer named in a listen string, poked to open the local firewall.
    poke_peer: Option<PeerAddr>,

    send_window: SendWindow,
    recv_window: ReceiveWindow,
    unreliable_seq: u32,
    ack_owed: bool,

    send_tick: u32,
    /// Last time a record was put on the wire.
    data_tick: u32,
    recv_tick: u32,
    poke_tick: u32,
    closing_tick: u32,
    last_nak: Option<u32>,

    peer_closed: bool,
    close_reason: CloseReason,
    data_ready: bool,

    resolved: Option<(String, char, String)>,
    last_error: Option<SocketError>,
    metrics: Metrics,
    events: VecDeque<Event>,

    scratch: BytesMut,
    datagram: Box<[u8]>,
}

impl Connection {
    pub fn new(config: Config, services: Services) -> ProtocolResult<Self> {
        config.validate()?;
        let now = services.clock.now_ms();
        Ok(Self {
            send_window: SendWindow::new(
                config.record_width,
                config.send_capacity,
                config.unack_limit,
            ),
            recv_window: ReceiveWindow::new(config.record_width, config.recv_capacity),
            config,
            services,
            phase: Phase::Idle,
            conn_ident: 0,
            remote_client_ident: 0,
            socket: None,
            peer: None,
            poke_peer: None,
            unreliable_seq: UNRELIABLE_BASE,
            ack_owed: false,
            send_tick: now,
            data_tick: now,
            recv_tick: now,
            poke_tick: now,
            closing_tick: now,
            last_nak: None,
            peer_closed: false,
            close_reason: CloseReason::Local,
            data_ready: false,
            resolved: None,
            last_error: None,
            metrics: Metrics::new(),
            events: VecDeque::new(),
            scratch: BytesMut::with_capacity(MAX_DATAGRAM),
            // one spare byte so that oversized datagrams are noticed instead of truncated
            datagram: vec![0; MAX_DATAGRAM + 1].into_boxed_slice(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current reading of the connection's clock.
    pub fn tick(&self) -> u32 {
        self.services.clock.now_ms()
    }

    /// Formats the remote address of `addr` as `a.b.c.d<divider>port`. The last result is cached.
    pub fn resolve(&mut self, addr: &str, divider: char) -> ProtocolResult<String> {
        if let Some((cached_addr, cached_divider, resolved)) = &self.resolved {
            if cached_addr == addr && *cached_divider == divider {
                return Ok(resolved.clone());
            }
        }
        let resolved = AddressSpec::parse(addr)?.format_peer(divider)?;
        self.resolved = Some((addr.to_string(), divider, resolved.clone()));
        Ok(resolved)
    }

    pub fn unresolve(&mut self) {
        self.resolved = None;
    }

    /// Binds the local port and waits for a peer to connect.
    pub fn listen(&mut self, addr: &str) -> ProtocolResult<()> {
        if self.phase != Phase::Idle {
            return Err(ProtocolError::BadState(self.phase));
        }
        let spec = AddressSpec::parse(addr)?;
        let socket = self.services.network.bind(spec.local_port_for_listen())?;

        self.conn_ident = connection_ident(addr).unwrap_or(0);
        self.peer = None;
        self.poke_peer = spec.peer();
        self.bind(socket);
        self.set_phase(Phase::Listening);
        Ok(())
    }

    pub fn unlisten(&mut self) -> ProtocolResult<()> {
        match self.phase {
            Phase::Listening | Phase::Connecting => {
                self.socket = None;
                self.peer = None;
                self.poke_peer = None;
                self.set_phase(Phase::Idle);
                Ok(())
            }
            phase => Err(ProtocolError::BadState(phase)),
        }
    }

    /// Binds a local port and starts the handshake with the peer named in `addr`.
    pub fn connect(&mut self, addr: &str) -> ProtocolResult<()> {
        if self.phase != Phase::Idle {
            return Err(ProtocolError::BadState(self.phase));
        }
        let spec = AddressSpec::parse(addr)?;
        let peer = spec
            .peer()
            .ok_or_else(|| ProtocolError::Address(format!("no host in '{}'", addr)))?;
        let socket = self.services.network.bind(spec.local_port_for_connect())?;

        self.conn_ident = connection_ident(addr).unwrap_or(0);
        self.peer = Some(peer);
        self.poke_peer = None;
        self.bind(socket);
        self.set_phase(Phase::Connecting);
        Ok(())
    }

    /// Closes the session. An open connection first tries to deliver what is still unacked.
    pub fn unconnect(&mut self) -> ProtocolResult<()> {
        match self.phase {
            Phase::Open => {
                self.closing_tick = self.tick();
                self.close_reason = CloseReason::Local;
                self.set_phase(Phase::Closing);
                Ok(())
            }
            Phase::Connecting | Phase::Listening => {
                self.close(CloseReason::Local);
                Ok(())
            }
            Phase::Closing | Phase::Dead => Ok(()),
            Phase::Idle => Err(ProtocolError::BadState(Phase::Idle)),
        }
    }

    /// Drops the socket and everything queued, without telling the peer.
    pub fn destroy(&mut self) {
        self.socket = None;
        self.send_window.clear();
        self.events.clear();
        if self.phase != Phase::Dead {
            info!("connection {:08x} destroyed in {:?}", self.conn_ident, self.phase);
            self.phase = Phase::Dead;
        }
    }

    pub fn control(&mut self, option: ControlOption) -> ProtocolResult<()> {
        match option {
            ControlOption::UnackLimit(limit) => {
                if (limit as usize) < self.config.record_width {
                    return Err(ProtocolError::InvalidConfiguration(
                        "unack limit must allow at least one full record.",
                    ));
                }
                self.config.unack_limit = limit;
                self.send_window.set_unack_limit(limit);
            }
            ControlOption::RedundantLimit(limit) => self.config.redundant_limit = limit,
            ControlOption::MetaType(meta_type) => {
                if meta_type > u32::from(packet::META_TYPE_CLIENT_IDS) {
                    return Err(ProtocolError::InvalidConfiguration("unknown metadata type."));
                }
                self.config.meta_type = meta_type as u8;
            }
            ControlOption::ClientIdent(ident) => self.config.client_ident = ident,
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        Status {
            phase: self.phase,
            conn_ident: self.conn_ident,
            client_ident: self.config.client_ident,
            remote_client_ident: self.remote_client_ident,
            peer: self.peer,
            local_port: self.socket.as_ref().map(|socket| socket.local_port()),
            send_queued: self.send_window.len(),
            send_in_flight: self.send_window.in_flight(),
            unacked_bytes: self.send_window.queued_bytes(),
            recv_queued: self.recv_window.len(),
            recv_held: self.recv_window.stashed(),
            send_tick: self.send_tick,
            recv_tick: self.recv_tick,
            last_error: self.last_error,
            metrics: self.metrics.clone(),
        }
    }

    /// Queues one record. Reliable records go out immediately and stay in the send window
    /// until acknowledged; unreliable ones are sent once.
    pub fn send(&mut self, datagram: Datagram) -> ProtocolResult<usize> {
        match self.phase {
            Phase::Open => {}
            Phase::Closing | Phase::Dead => return Err(ProtocolError::Closed),
            phase => return Err(ProtocolError::BadState(phase)),
        }
        let payload = datagram.payload();
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if payload.len() > self.config.record_width {
            return Err(ProtocolError::PayloadTooLarge(
                payload.len(),
                self.config.record_width,
            ));
        }

        let now = self.tick();
        if datagram.is_reliable() {
            self.send_window.push(payload, now)?;
            self.flush_records(now);
        } else {
            self.send_unreliable(payload)?;
        }
        Ok(payload.len())
    }

    /// Copies the next record into `buffer` without consuming it.
    pub fn peek(&self, buffer: &mut [u8]) -> ProtocolResult<usize> {
        let (record, _) = self.next_record()?;
        if record.len() > buffer.len() {
            return Err(ProtocolError::RecvBufferTooSmall(record.len(), buffer.len()));
        }
        buffer[..record.len()].copy_from_slice(record);
        Ok(record.len())
    }

    /// Tick at which the next record was received.
    pub fn peek_tick(&self) -> ProtocolResult<u32> {
        self.next_record().map(|(_, tick)| tick)
    }

    pub fn recv(&mut self, buffer: &mut [u8]) -> ProtocolResult<usize> {
        let len = self.peek(buffer)?;
        self.recv_window.pop();
        Ok(len)
    }

    fn next_record(&self) -> ProtocolResult<(&[u8], u32)> {
        match self.recv_window.peek() {
            Some(record) => Ok(record),
            None if self.phase == Phase::Dead => Err(ProtocolError::Closed),
            None => Err(ProtocolError::Starved),
        }
    }

    /// Runs one engine step: drains the socket, then advances the handshake or the data flow.
    pub fn update(&mut self) {
        if self.phase == Phase::Dead || self.phase == Phase::Idle {
            return;
        }
        let now = self.tick();
        self.drain_socket(now);
        if mem::take(&mut self.data_ready) {
            self.events.push_back(Event::DataReady);
        }

        match self.phase {
            Phase::Listening => self.update_listening(now),
            Phase::Connecting => self.update_connecting(now),
            Phase::Open => {
                if time_diff(now, self.recv_tick) >= self.config.liveness_timeout_ms as i32 {
                    warn!(
                        "connection {:08x} heard nothing for {}ms",
                        self.conn_ident,
                        time_diff(now, self.recv_tick)
                    );
                    self.close(CloseReason::Timeout);
                } else {
                    self.service_reliable(now);
                }
            }
            Phase::Closing => self.update_closing(now),
            Phase::Dead | Phase::Idle => {}
        }
    }

    /// Events raised since the last call, oldest first.
    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    fn bind(&mut self, socket: Box<dyn DatagramSocket>) {
        let now = self.tick();
        self.socket = Some(socket);
        self.peer_closed = false;
        // the first update pokes right away
        self.poke_tick = now.wrapping_sub(self.config.poke_interval_ms);
        self.last_error = None;
    }

    fn set_phase(&mut self, phase: Phase) {
        info!(
            "connection {:08x}: {:?} -> {:?}",
            self.conn_ident, self.phase, phase
        );
        self.phase = phase;
    }

    fn open(&mut self, now: u32) {
        self.recv_tick = now;
        self.send_tick = now;
        self.data_tick = now;
        self.last_nak = None;
        self.set_phase(Phase::Open);
        self.events.push_back(Event::Opened);
    }

    fn close(&mut self, reason: CloseReason) {
        self.socket = None;
        self.close_reason = reason;
        self.set_phase(Phase::Dead);
        self.events.push_back(Event::Closed(reason));
    }

    fn update_listening(&mut self, now: u32) {
        if let Some(peer) = self.poke_peer {
            if time_diff(now, self.poke_tick) >= self.config.poke_interval_ms as i32 {
                self.poke_tick = now;
                self.send_control(PacketKind::Poke, peer);
            }
        }
    }

    fn update_connecting(&mut self, now: u32) {
        if time_diff(now, self.poke_tick) < self.config.poke_interval_ms as i32 {
            return;
        }
        self.poke_tick = now;
        if let Some(peer) = self.peer {
            self.send_control(PacketKind::Poke, peer);
            self.send_control(PacketKind::Init, peer);
        }
    }

    fn update_closing(&mut self, now: u32) {
        let draining = !self.peer_closed
            && !self.send_window.is_empty()
            && time_diff(now, self.closing_tick) < self.config.close_grace_ms as i32;
        if draining {
            self.service_reliable(now);
            return;
        }
        if !self.peer_closed {
            if let Some(peer) = self.peer {
                self.send_control(PacketKind::Disc, peer);
            }
        }
        if !self.send_window.is_empty() {
            debug!(
                "connection {:08x} abandoning {} unacked records",
                self.conn_ident,
                self.send_window.len()
            );
        }
        self.send_window.clear();
        self.close(self.close_reason);
    }

    fn drain_socket(&mut self, now: u32) {
        let mut buffer = mem::take(&mut self.datagram);
        loop {
            let received = match self.socket.as_mut() {
                Some(socket) => socket.recv_from(&mut buffer),
                None => break,
            };
            match received {
                Ok(Some((len, from))) => self.process(&buffer[..len], from, now),
                Ok(None) | Err(SocketError::WouldBlock) => break,
                Err(err) => {
                    warn!("connection {:08x} receive failed: {}", self.conn_ident, err);
                    self.last_error = Some(err);
                    break;
                }
            }
        }
        self.datagram = buffer;
    }

    fn process(&mut self, datagram: &[u8], from: PeerAddr, now: u32) {
        let packet = match Packet::decode(datagram, now) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping datagram from {}: {}", from, err);
                self.metrics.increment(DataPoint::PacketsInvalid);
                return;
            }
        };
        self.metrics.increment(DataPoint::PacketsReceived);
        trace!("recv {:?} ack={} from {}", packet.seq, packet.ack, from);

        match self.phase {
            Phase::Listening => self.on_listening(&packet, from, now),
            Phase::Connecting => self.on_connecting(&packet, from, now),
            Phase::Open | Phase::Closing => self.on_established(&packet, from, now),
            Phase::Dead | Phase::Idle => {}
        }
    }

    fn on_listening(&mut self, packet: &Packet, from: PeerAddr, now: u32) {
        match packet.seq.kind {
            PacketKind::Init => {
                if let Some(body) = self.control_body(packet, from) {
                    self.peer = Some(from);
                    self.remote_client_ident = body.client_ident.unwrap_or(0);
                    self.send_control(PacketKind::Conn, from);
                    self.open(now);
                }
            }
            PacketKind::Poke => trace!("poke from {}", from),
            kind => self.wrong_phase(kind, from),
        }
    }

    fn on_connecting(&mut self, packet: &Packet, from: PeerAddr, now: u32) {
        if self.peer != Some(from) {
            self.spoofed(from);
            return;
        }
        match packet.seq.kind {
            PacketKind::Conn => {
                if let Some(body) = self.control_body(packet, from) {
                    self.remote_client_ident = body.client_ident.unwrap_or(0);
                    self.open(now);
                }
            }
            // both sides connecting at once
            PacketKind::Init => {
                if let Some(body) = self.control_body(packet, from) {
                    self.remote_client_ident = body.client_ident.unwrap_or(0);
                    self.send_control(PacketKind::Conn, from);
                    self.open(now);
                }
            }
            PacketKind::Poke => trace!("poke from {}", from),
            kind => self.wrong_phase(kind, from),
        }
    }

    fn on_established(&mut self, packet: &Packet, from: PeerAddr, now: u32) {
        if self.peer != Some(from) {
            self.spoofed(from);
            return;
        }
        // nothing in a rejected packet is trusted, its ack included
        let kind = packet.seq.kind;
        let accepted = match kind {
            PacketKind::Init | PacketKind::Conn | PacketKind::Disc | PacketKind::Poke => {
                self.control_body(packet, from).is_some()
            }
            PacketKind::Reliable(_) | PacketKind::Unreliable(_) => self.accepts_meta(packet),
            PacketKind::Nak => true,
        };
        if !accepted {
            return;
        }

        self.recv_tick = now;
        self.on_ack(packet.ack);

        match kind {
            PacketKind::Init => {
                if self.phase == Phase::Open {
                    debug!("peer {} repeated INIT, resending CONN", from);
                    self.send_control(PacketKind::Conn, from);
                }
            }
            PacketKind::Conn | PacketKind::Poke => {}
            PacketKind::Disc => {
                self.peer_closed = true;
                if self.phase == Phase::Open {
                    self.closing_tick = now;
                    self.close_reason = CloseReason::Remote;
                    self.set_phase(Phase::Closing);
                }
            }
            PacketKind::Nak => self.on_nak(),
            PacketKind::Unreliable(seq) => self.on_unreliable(packet, seq, now),
            PacketKind::Reliable(_) => self.on_reliable(packet, now),
        }
    }

    /// Decodes a control payload and checks its connection identifier.
    fn control_body(&mut self, packet: &Packet, from: PeerAddr) -> Option<ControlBody> {
        match ControlBody::decode(packet.payload) {
            Ok(body) if body.conn_ident == self.conn_ident => Some(body),
            Ok(body) => {
                debug!(
                    "ignoring {:?} from {} with ident {:08x}, expected {:08x}",
                    packet.seq.kind, from, body.conn_ident, self.conn_ident
                );
                self.metrics.increment(DataPoint::PacketsSpoofed);
                None
            }
            Err(err) => {
                debug!("dropping {:?} from {}: {}", packet.seq.kind, from, err);
                self.metrics.increment(DataPoint::PacketsInvalid);
                None
            }
        }
    }

    fn wrong_phase(&mut self, kind: PacketKind, from: PeerAddr) {
        debug!("ignoring {:?} from {} while {:?}", kind, from, self.phase);
        self.metrics.increment(DataPoint::PacketsWrongPhase);
    }

    fn spoofed(&mut self, from: PeerAddr) {
        debug!("ignoring packet from unexpected address {}", from);
        self.metrics.increment(DataPoint::PacketsSpoofed);
    }

    fn send_control(&mut self, kind: PacketKind, to: PeerAddr) {
        let body = match kind {
            PacketKind::Init | PacketKind::Conn => Some(ControlBody {
                conn_ident: self.conn_ident,
                client_ident: Some(self.config.client_ident),
            }),
            PacketKind::Disc | PacketKind::Poke => Some(ControlBody {
                conn_ident: self.conn_ident,
                client_ident: None,
            }),
            _ => None,
        };
        self.scratch.clear();
        packet::encode_header(
            SequenceField::new(kind),
            self.recv_window.ack_seq(),
            &mut self.scratch,
        );
        if let Some(body) = body {
            body.encode(&mut self.scratch);
        }
        // failures are recorded in the status
        let _ = self.transmit(to);
    }

    /// Sends whatever is in the scratch buffer.
    fn transmit(&mut self, to: PeerAddr) -> Result<(), SocketError> {
        let now = self.tick();
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Err(SocketError::NotConnected),
        };
        match socket.send_to(&self.scratch, to) {
            Ok(_) => {
                self.send_tick = now;
                self.ack_owed = false;
                self.metrics.increment(DataPoint::PacketsSent);
                Ok(())
            }
            Err(err) => {
                warn!("connection {:08x} send to {} failed: {}", self.conn_ident, to, err);
                self.metrics.increment(DataPoint::SendFailures);
                self.last_error = Some(err);
                Err(err)
            }
        }
    }
}
