use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{ConfigError, EndpointConfig, ServerConfig};
use crate::connection::{Connection, State};
use crate::crypto::Session;
use crate::fec::FecState;
use crate::frame::FrameHandler;
use crate::packet::{PacketHeader, PacketType};
use crate::shared::{ConnectionId, Event, Transmit};
use crate::token;
use crate::{
    Side, ENFORCED_INITIAL_MTU, RESET_PACKET_MIN_SIZE, RESET_TOKEN_SIZE, SUPPORTED_VERSIONS,
};

/// Internal identifier for a `Connection` currently associated with an
/// endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Outcome of processing one incoming datagram
///
/// `accepted` is false when the last processed segment was dropped; dropped
/// segments never abort the endpoint, only the remainder of their datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DatagramStatus {
    pub accepted: bool,
    pub new_context_created: bool,
}

/// Per-segment disposition, normalized to accepted/rejected at the
/// `incoming_packet` boundary
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub(crate) enum ProcessError {
    #[error("malformed header")]
    MalformedHeader,
    #[error("initial packet below the enforced minimum size")]
    InitialTooShort,
    #[error("header protection or aead check failed")]
    AeadCheck,
    #[error("packet number already received")]
    Duplicate,
    #[error("packet not expected in this state")]
    UnexpectedPacket,
    #[error("connection id check failed")]
    CnxidCheck,
    #[error("retry observed or issued; awaiting a new initial")]
    Retry,
    #[error("stateless reset received")]
    StatelessReset,
    #[error("transient initial context deleted")]
    ConnectionDeleted,
    #[error("packet dropped")]
    Detected,
    #[error("protocol violation")]
    ProtocolViolation,
}

/// Errors preventing the creation of an outgoing connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("fec framework creation failed: {0}")]
    Fec(#[from] crate::fec::FecError),
}

/// The main entry point to the library
///
/// Performs no I/O: datagrams go in through [`incoming_packet`]
/// (`Endpoint::incoming_packet`), stateless responses come out through
/// [`poll_transmit`](Endpoint::poll_transmit), and per-connection
/// observations through [`Connection::poll_event`]. One endpoint is driven
/// from one cooperative loop; nothing here is thread-safe across
/// connections.
pub struct Endpoint<S: Session> {
    rng: StdRng,
    config: Arc<EndpointConfig<S::HmacKey>>,
    server_config: Option<Arc<ServerConfig<S::HmacKey>>>,
    transmits: VecDeque<Transmit>,
    connections: Slab<Connection<S>>,
    /// Lookup by the local CIDs issued for each connection
    connection_ids: HashMap<ConnectionId, ConnectionHandle>,
    /// Lookup by the destination CID of the first Initial
    connection_ids_initial: HashMap<ConnectionId, ConnectionHandle>,
    /// Lookup by peer address, for zero-length CIDs and reset detection
    connection_remotes: HashMap<SocketAddr, ConnectionHandle>,
}

impl<S: Session> Endpoint<S> {
    pub fn new(
        config: Arc<EndpointConfig<S::HmacKey>>,
        server_config: Option<Arc<ServerConfig<S::HmacKey>>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.fec.code.k() == 0 || config.fec.code.n() <= config.fec.code.k() {
            return Err(ConfigError::IllegalValue("fec code requires n > k >= 1"));
        }
        Ok(Self {
            rng: StdRng::from_entropy(),
            config,
            server_config,
            transmits: VecDeque::new(),
            connections: Slab::new(),
            connection_ids: HashMap::new(),
            connection_ids_initial: HashMap::new(),
            connection_remotes: HashMap::new(),
        })
    }

    fn is_server(&self) -> bool {
        self.server_config.is_some()
    }

    /// Get the next stateless packet to transmit
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn connection(&self, ch: ConnectionHandle) -> &Connection<S> {
        &self.connections[ch.0]
    }

    pub fn connection_mut(&mut self, ch: ConnectionHandle) -> &mut Connection<S> {
        &mut self.connections[ch.0]
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn first_handle(&self) -> Option<ConnectionHandle> {
        self.connections.iter().next().map(|(i, _)| ConnectionHandle(i))
    }

    /// Initiate a connection
    ///
    /// The caller transmits the first flight; the connection is created as
    /// having sent it.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        tls: S,
        now: u64,
    ) -> Result<ConnectionHandle, ConnectError> {
        let initial_cid = ConnectionId::random(&mut self.rng, 8);
        let local_cid = self.new_cid();
        let fec = FecState::new(&self.config.fec)?;
        let mut conn = Connection::new(
            Side::Client,
            0,
            initial_cid,
            local_cid,
            ConnectionId::default(),
            remote,
            None,
            0,
            tls,
            fec,
            now,
        );
        conn.initial_sent();
        trace!(icid = %initial_cid, "client connection");

        let ch = ConnectionHandle(self.connections.insert(conn));
        if self.config.local_cid_len > 0 {
            self.connection_ids.insert(local_cid, ch);
        }
        self.connection_remotes.insert(remote, ch);
        Ok(ch)
    }

    /// Process one incoming UDP datagram
    ///
    /// Splits the datagram into coalesced segments and runs each through the
    /// receive pipeline. Decryption happens in place; the buffer is dead
    /// after the call.
    pub fn incoming_packet(
        &mut self,
        data: &mut [u8],
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        if_index: u32,
        now: u64,
        frames: &mut dyn FrameHandler,
    ) -> DatagramStatus {
        let packet_length = data.len();
        let mut status = DatagramStatus {
            accepted: true,
            new_context_created: false,
        };
        let mut previous_dest_id: Option<ConnectionId> = None;
        let mut consumed_index = 0;

        while consumed_index < packet_length {
            match self.incoming_segment(
                &mut data[consumed_index..],
                packet_length,
                addr_from,
                addr_to,
                if_index,
                now,
                frames,
                &mut previous_dest_id,
                &mut status.new_context_created,
            ) {
                Ok(consumed) => consumed_index += consumed,
                Err(e) => {
                    trace!(error = %e, "segment dropped");
                    status.accepted = false;
                    break;
                }
            }
        }
        status
    }

    /// Parse, decrypt, and dispatch one segment; returns the bytes it
    /// occupied in the datagram
    #[allow(clippy::too_many_arguments)]
    fn incoming_segment(
        &mut self,
        segment: &mut [u8],
        packet_length: usize,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        if_index: u32,
        now: u64,
        frames: &mut dyn FrameHandler,
        previous_dest_id: &mut Option<ConnectionId>,
        new_context_created: &mut bool,
    ) -> Result<usize, ProcessError> {
        let mut ph = PacketHeader::parse(segment, self.config.local_cid_len).map_err(|e| {
            trace!("malformed header: {}", e);
            ProcessError::MalformedHeader
        })?;
        // Wire length of this segment, fixed before decryption shuffles the
        // header fields around the packet number
        let consumed = ph.segment_length();

        // Coalescing across destination CIDs is tolerated (multipath); only
        // the first segment pins the datagram's CID
        match previous_dest_id {
            None => *previous_dest_id = Some(ph.dest_cid),
            Some(prev) if *prev != ph.dest_cid => {
                trace!("coalesced segment for a different destination cid");
            }
            _ => {}
        }

        let mut ch = self.lookup(&ph, addr_from);

        if ph.ptype == PacketType::Initial {
            // Clients must fill their first datagram
            if ch.map_or(true, |c| self.connections[c.0].side.is_server())
                && packet_length < ENFORCED_INITIAL_MTU
            {
                return Err(ProcessError::InitialTooShort);
            }
            if ch.is_none() && self.is_server() {
                ch = self.create_server_connection(&ph, addr_from, addr_to, if_index, now);
                *new_context_created = ch.is_some();
            }
        }

        let result = self.process_segment(
            &mut ch,
            segment,
            &mut ph,
            consumed,
            addr_from,
            addr_to,
            if_index,
            now,
            frames,
            new_context_created,
        );

        // Epilogue: record the packet number, nudge the wake time, and run
        // the transport-parameter hook once
        match result {
            Ok(()) => {
                if let Some(c) = ch {
                    let conn = &mut self.connections[c.0];
                    if conn.state != State::Disconnected
                        && ph.ptype != PacketType::VersionNegotiation
                    {
                        let path = conn.get_incoming_path(&ph).unwrap_or(0);
                        conn.record_pn_received(path, ph.pc, ph.pn64);
                    }
                    conn.set_next_wake_time(now);
                    conn.process_transport_parameters_once();
                }
                Ok(consumed)
            }
            Err(ProcessError::Duplicate) => {
                // Bad packets are dropped silently, but duplicates should be
                // acknowledged
                if let Some(c) = ch {
                    let conn = &mut self.connections[c.0];
                    let path = conn.get_incoming_path(&ph).unwrap_or(0);
                    conn.paths[path].pkt_ctx[ph.pc.index()].ack_needed = true;
                    conn.set_next_wake_time(now);
                    conn.process_transport_parameters_once();
                }
                Err(ProcessError::Duplicate)
            }
            Err(e) => {
                if let Some(c) = ch {
                    self.connections[c.0].process_transport_parameters_once();
                }
                debug!(ptype = %ph.ptype, pn = ph.pn64, error = %e, "packet dropped");
                Err(e)
            }
        }
    }

    /// Decrypt and dispatch a parsed segment
    #[allow(clippy::too_many_arguments)]
    fn process_segment(
        &mut self,
        ch: &mut Option<ConnectionHandle>,
        segment: &mut [u8],
        ph: &mut PacketHeader,
        consumed: usize,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        if_index: u32,
        now: u64,
        frames: &mut dyn FrameHandler,
        new_context_created: &mut bool,
    ) -> Result<(), ProcessError> {
        let Some(c) = *ch else {
            return self.unknown_connection(segment, ph, consumed, addr_from, addr_to);
        };

        //
        // Decrypt per epoch
        //
        {
            let conn = &mut self.connections[c.0];
            let path = conn.get_incoming_path(ph).unwrap_or(0);
            match ph.ptype {
                PacketType::VersionNegotiation => {
                    // Not encrypted
                }
                PacketType::Retry => {
                    // Not encrypted, and carries no sequence number
                    ph.pn = 0;
                    ph.pn64 = 0;
                    ph.pn_mask = 0;
                }
                PacketType::Initial
                | PacketType::Handshake
                | PacketType::ZeroRtt
                | PacketType::OneRttPhi0
                | PacketType::OneRttPhi1 => {
                    if ph.ptype.is_one_rtt() {
                        // A matched connection with a supported version
                        // surfaces the spin bit
                        ph.has_spin_bit = true;
                        ph.version_index = Some(conn.version_index);
                    }
                    if let Err(e) = conn.decrypt_incoming(segment, ph, path) {
                        if e == ProcessError::AeadCheck && *new_context_created {
                            // The packet that created this context did not
                            // authenticate; tear the context back down
                            self.delete_connection(c);
                            *ch = None;
                            *new_context_created = false;
                        }
                        return Err(e);
                    }
                }
                PacketType::Error => return Err(ProcessError::Detected),
            }
        }

        //
        // Dispatch by packet type
        //
        let Self {
            connections,
            rng,
            transmits,
            server_config,
            ..
        } = self;
        let conn = &mut connections[c.0];

        let path = conn.get_incoming_path(ph);
        conn.push_event(Event::PacketReceived {
            from: addr_from,
            len: consumed,
        });
        conn.push_event(Event::HeaderParsed {
            path,
            ptype: ph.ptype,
            pn64: ph.pn64,
            consumed,
        });

        let mut initial_failed = false;
        let result = match ph.ptype {
            PacketType::VersionNegotiation => {
                if conn.state == State::ClientInitSent {
                    conn.incoming_version_negotiation(segment, ph, now)
                } else {
                    debug!("unexpected version negotiation");
                    Err(ProcessError::Detected)
                }
            }
            PacketType::Initial => {
                if ph.dest_cid == conn.initial_cid || ph.dest_cid == conn.paths[0].local_cid {
                    // Verify that the source CID matches expectation; the
                    // first packet establishes it
                    if conn.paths[0].remote_cid.is_empty() {
                        conn.paths[0].remote_cid = ph.srce_cid;
                        conn.paths[0].local_addr = addr_to;
                        Ok(())
                    } else if conn.paths[0].remote_cid != ph.srce_cid {
                        debug!("wrong source cid on initial");
                        Err(ProcessError::UnexpectedPacket)
                    } else {
                        Ok(())
                    }
                    .and_then(|()| {
                        if conn.side.is_server() {
                            let check_token = server_config
                                .as_ref()
                                .filter(|sc| sc.check_token)
                                .map(|sc| &*sc.token_key);
                            let r = conn.incoming_initial(
                                segment,
                                ph,
                                addr_from,
                                addr_to,
                                if_index,
                                now,
                                frames,
                                check_token,
                                rng,
                                transmits,
                            );
                            if (r.is_err() || conn.state == State::Disconnected)
                                && *new_context_created
                            {
                                initial_failed = true;
                            }
                            r
                        } else {
                            conn.incoming_server_cleartext(segment, ph, addr_to, now, frames)
                        }
                    })
                } else {
                    debug!("initial for an unknown destination cid");
                    Err(ProcessError::Detected)
                }
            }
            PacketType::Retry => conn.incoming_retry(segment, ph, now),
            PacketType::Handshake => {
                if conn.side.is_client() {
                    conn.incoming_server_cleartext(segment, ph, addr_to, now, frames)
                } else {
                    conn.incoming_client_cleartext(segment, ph, now, frames)
                }
            }
            PacketType::ZeroRtt => conn.incoming_0rtt(segment, ph, now, frames),
            PacketType::OneRttPhi0 | PacketType::OneRttPhi1 => {
                conn.incoming_encrypted(segment, ph, addr_from, now, frames, rng)
            }
            PacketType::Error => Err(ProcessError::Detected),
        };

        if initial_failed {
            // A transient Initial context that went nowhere is removed
            self.delete_connection(c);
            *ch = None;
            *new_context_created = false;
            return Err(ProcessError::ConnectionDeleted);
        }
        result
    }

    /// Segment for no known connection: version negotiation, stateless reset
    /// detection, or a stateless reset of our own
    fn unknown_connection(
        &mut self,
        segment: &[u8],
        ph: &PacketHeader,
        consumed: usize,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
    ) -> Result<(), ProcessError> {
        // A 1-RTT-looking packet may be a stateless reset for a connection
        // we still hold under another CID
        if ph.ptype.is_one_rtt() {
            if let Some(&c) = self.connection_remotes.get(&addr_from) {
                let conn = &mut self.connections[c.0];
                if consumed >= RESET_PACKET_MIN_SIZE
                    && segment[consumed - RESET_TOKEN_SIZE..consumed]
                        == conn.paths[0].reset_secret[..]
                {
                    debug!("stateless reset received");
                    return Err(conn.incoming_stateless_reset());
                }
            }
        }

        if ph.version_index.is_none() && ph.version != 0 {
            // Use the result of parsing to consider version negotiation
            self.prepare_version_negotiation(addr_from, addr_to, ph);
            return Ok(());
        }

        if !ph.dest_cid.is_empty() {
            self.process_unexpected_cnxid(consumed, addr_from, addr_to, ph);
        } else {
            trace!("dropping unrecognized packet without a destination cid");
        }
        Err(ProcessError::Detected)
    }

    /// Resolve the connection a parsed header belongs to
    fn lookup(&self, ph: &PacketHeader, addr_from: SocketAddr) -> Option<ConnectionHandle> {
        match ph.ptype {
            PacketType::VersionNegotiation => {
                // Version negotiation should echo the cnx-id sent by the
                // client
                if !ph.dest_cid.is_empty() {
                    self.by_id(&ph.dest_cid)
                } else {
                    self.connection_remotes
                        .get(&addr_from)
                        .copied()
                        .filter(|c| self.connections[c.0].paths[0].local_cid.is_empty())
                }
            }
            PacketType::Initial | PacketType::ZeroRtt => {
                // An address match only counts when the packet targets the
                // connection's original CID
                self.by_id(&ph.dest_cid).or_else(|| {
                    self.connection_remotes
                        .get(&addr_from)
                        .copied()
                        .filter(|c| self.connections[c.0].initial_cid == ph.dest_cid)
                })
            }
            PacketType::Handshake | PacketType::Retry => self.by_id(&ph.dest_cid),
            PacketType::OneRttPhi0 | PacketType::OneRttPhi1 => {
                if self.config.local_cid_len > 0 {
                    self.by_id(&ph.dest_cid)
                } else {
                    self.connection_remotes.get(&addr_from).copied()
                }
            }
            PacketType::Error => None,
        }
    }

    fn by_id(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connection_ids
            .get(id)
            .or_else(|| self.connection_ids_initial.get(id))
            .copied()
    }

    fn new_cid(&mut self) -> ConnectionId {
        if self.config.local_cid_len == 0 {
            return ConnectionId::default();
        }
        loop {
            let cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
        }
    }

    fn create_server_connection(
        &mut self,
        ph: &PacketHeader,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        if_index: u32,
        now: u64,
    ) -> Option<ConnectionHandle> {
        let version_index = ph.version_index?;
        let fec = match FecState::new(&self.config.fec) {
            Ok(fec) => fec,
            Err(e) => {
                debug!(error = %e, "fec framework creation failed");
                return None;
            }
        };
        let local_cid = self.new_cid();
        let conn = Connection::new(
            Side::Server,
            version_index,
            ph.dest_cid,
            local_cid,
            ph.srce_cid,
            addr_from,
            addr_to,
            if_index,
            S::new_server_session(),
            fec,
            now,
        );
        let ch = ConnectionHandle(self.connections.insert(conn));
        trace!(id = ch.0, icid = %ph.dest_cid, "connection incoming");

        if !ph.dest_cid.is_empty() {
            self.connection_ids_initial.insert(ph.dest_cid, ch);
        }
        if self.config.local_cid_len > 0 {
            self.connection_ids.insert(local_cid, ch);
        }
        self.connection_remotes.insert(addr_from, ch);
        Some(ch)
    }

    fn delete_connection(&mut self, ch: ConnectionHandle) {
        self.connection_ids.retain(|_, v| *v != ch);
        self.connection_ids_initial.retain(|_, v| *v != ch);
        self.connection_remotes.retain(|_, v| *v != ch);
        self.connections.remove(ch.0);
        trace!(id = ch.0, "connection deleted");
    }

    /// Queue a version negotiation response listing every supported version
    fn prepare_version_negotiation(
        &mut self,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        ph: &PacketHeader,
    ) {
        trace!(version = ph.version, "sending version negotiation");
        let mut buf = Vec::new();
        // Random first byte with the long-header bit forced
        buf.push(self.rng.gen::<u8>() | 0x80);
        buf.extend_from_slice(&0u32.to_be_bytes());
        // CIDs swapped relative to the incoming packet
        buf.push(ph.srce_cid.len() as u8);
        buf.extend_from_slice(&ph.srce_cid);
        buf.push(ph.dest_cid.len() as u8);
        buf.extend_from_slice(&ph.dest_cid);
        for v in SUPPORTED_VERSIONS {
            buf.extend_from_slice(&v.version.to_be_bytes());
        }
        self.transmits.push_back(Transmit {
            destination: addr_from,
            source: addr_to,
            contents: buf,
        });
    }

    /// Queue a stateless reset for a 1-RTT packet aimed at a connection we
    /// do not have
    fn process_unexpected_cnxid(
        &mut self,
        length: usize,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        ph: &PacketHeader,
    ) {
        if length <= RESET_PACKET_MIN_SIZE || !ph.ptype.is_one_rtt() {
            return;
        }
        // Stay under the inciting packet's size to avoid amplification
        let headroom = length - 1 - RESET_TOKEN_SIZE;
        let pad_size = if headroom > 20 {
            20 + self.rng.gen_range(0..headroom - 20)
        } else {
            20
        };

        debug!(cid = %ph.dest_cid, "sending stateless reset");
        let mut buf = Vec::with_capacity(1 + pad_size + RESET_TOKEN_SIZE);
        buf.push(if ph.ptype == PacketType::OneRttPhi0 {
            0x30
        } else {
            0x70
        });
        buf.resize(1 + pad_size, 0);
        self.rng.fill_bytes(&mut buf[1..]);
        buf.extend_from_slice(&token::reset_token(&*self.config.reset_key, &ph.dest_cid));

        self.transmits.push_back(Transmit {
            destination: addr_from,
            source: addr_to,
            contents: buf,
        });
    }
}
