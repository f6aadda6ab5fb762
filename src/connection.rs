use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::{rngs::StdRng, Rng};
use tracing::{debug, trace};

use crate::crypto::{self, CryptoState, HandshakeCtx, Session};
use crate::endpoint::ProcessError;
use crate::fec::{FecState, SourceSymbol};
use crate::frame::FrameHandler;
use crate::packet::{Epoch, PacketContext, PacketHeader};
use crate::range_set::RangeSet;
use crate::shared::{ConnectionId, Event, ResetToken, Transmit};
use crate::transport_error::TransportError;
use crate::{
    token, version_index, Side, BANDWIDTH_TIME_INTERVAL_MIN, INITIAL_RETRANSMIT_TIMER,
    INITIAL_RTT, SUPPORTED_VERSIONS,
};

/// Index of a path within its connection
pub type PathId = usize;

/// Connection lifecycle
///
/// Variant order is load-bearing: handshake-progress comparisons
/// (`< ClientAlmostReady`) and the closing-chain comparisons
/// (`>= ClosingReceived`) rely on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum State {
    ClientInit,
    ClientInitSent,
    ClientInitResent,
    ServerInit,
    ServerHandshake,
    ClientHandshakeStart,
    ClientHandshakeProgress,
    ClientAlmostReady,
    ClientReady,
    ServerAlmostReady,
    ServerReady,
    ClosingReceived,
    Closing,
    Draining,
    Disconnected,
}

/// Per-context packet-number tracking
#[derive(Debug, Default)]
pub(crate) struct PacketCtx {
    /// Packet numbers accepted so far
    pub(crate) sack: RangeSet,
    pub(crate) ack_needed: bool,
    pub(crate) send_sequence: u64,
}

impl PacketCtx {
    pub(crate) fn end_of_sack_range(&self) -> u64 {
        self.sack.max().unwrap_or(0)
    }
}

/// Per-destination state of a connection
#[derive(Debug)]
pub struct Path {
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) if_index: u32,
    pub(crate) remote_cid: ConnectionId,
    pub(crate) local_cid: ConnectionId,
    pub(crate) pkt_ctx: [PacketCtx; 3],
    pub(crate) challenge: u64,
    pub(crate) challenge_verified: bool,
    pub(crate) challenge_time: u64,
    pub(crate) challenge_repeat_count: u32,
    pub(crate) received: u64,
    pub(crate) received_prior: u64,
    pub(crate) receive_rate_epoch: u64,
    pub(crate) receive_rate_estimate: u64,
    pub(crate) receive_rate_max: u64,
    pub(crate) smoothed_rtt: u64,
    pub(crate) retransmit_timer: u64,
    /// Reset token the peer registered for the CID this path sends to
    pub(crate) reset_secret: ResetToken,
}

impl Path {
    fn new(
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        if_index: u32,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
    ) -> Self {
        Self {
            peer_addr,
            local_addr,
            if_index,
            remote_cid,
            local_cid,
            pkt_ctx: Default::default(),
            challenge: 0,
            challenge_verified: false,
            challenge_time: 0,
            challenge_repeat_count: 0,
            received: 0,
            received_prior: 0,
            receive_rate_epoch: 0,
            receive_rate_estimate: 0,
            receive_rate_max: 0,
            smoothed_rtt: INITIAL_RTT,
            retransmit_timer: INITIAL_RETRANSMIT_TIMER,
            reset_secret: ResetToken::default(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn remote_cid(&self) -> &ConnectionId {
        &self.remote_cid
    }

    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    pub fn challenge_verified(&self) -> bool {
        self.challenge_verified
    }

    pub fn challenge_repeat_count(&self) -> u32 {
        self.challenge_repeat_count
    }

    pub fn challenge(&self) -> u64 {
        self.challenge
    }

    pub fn challenge_time(&self) -> u64 {
        self.challenge_time
    }

    pub fn receive_rate_estimate(&self) -> u64 {
        self.receive_rate_estimate
    }

    pub fn receive_rate_max(&self) -> u64 {
        self.receive_rate_max
    }

    pub fn ack_needed(&self, pc: PacketContext) -> bool {
        self.pkt_ctx[pc.index()].ack_needed
    }
}

/// Protocol state of one QUIC connection
///
/// Owned by the [`Endpoint`](crate::Endpoint) that accepted or initiated it;
/// all mutation happens from the endpoint's single-threaded driver loop.
pub struct Connection<S: Session> {
    pub(crate) side: Side,
    pub(crate) state: State,
    pub(crate) version_index: usize,
    /// Destination CID of the client's very first Initial; stays valid for
    /// matching even after new CIDs are issued
    pub(crate) initial_cid: ConnectionId,
    pub(crate) retry_token: Option<Vec<u8>>,
    pub(crate) tls: S,
    pub(crate) crypto: CryptoState<S>,
    pub(crate) paths: Vec<Path>,
    pub(crate) handshake_done: bool,
    pub(crate) remote_params_received: bool,
    pub(crate) params_processed: bool,
    pub(crate) current_spin: bool,
    pub(crate) prev_spin: bool,
    pub(crate) spin_edge: bool,
    pub(crate) spin_vec: u8,
    pub(crate) spin_last_trigger: u64,
    pub(crate) fec: FecState,
    events: VecDeque<Event>,
    next_wake_time: u64,
}

impl<S: Session> Connection<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        side: Side,
        version_index: usize,
        initial_cid: ConnectionId,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
        if_index: u32,
        tls: S,
        fec: FecState,
        now: u64,
    ) -> Self {
        Self {
            side,
            state: match side {
                Side::Client => State::ClientInit,
                Side::Server => State::ServerInit,
            },
            version_index,
            initial_cid,
            retry_token: None,
            tls,
            crypto: CryptoState::initial(&initial_cid, side),
            paths: vec![Path::new(
                peer_addr, local_addr, if_index, local_cid, remote_cid,
            )],
            handshake_done: false,
            remote_params_received: false,
            params_processed: false,
            current_spin: false,
            prev_spin: false,
            spin_edge: false,
            spin_vec: 0,
            spin_last_trigger: 0,
            fec,
            events: VecDeque::new(),
            next_wake_time: now,
        }
    }

    //
    // Public surface
    //

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn path(&self, path: PathId) -> &Path {
        &self.paths[path]
    }

    pub fn spin_vec(&self) -> u8 {
        self.spin_vec
    }

    /// Whether the latest 1-RTT packet flipped the observed spin value;
    /// cleared by the egress engine once reflected on the wire
    pub fn spin_edge(&self) -> bool {
        self.spin_edge
    }

    /// Time (µs) of the most recent spin edge
    pub fn spin_last_trigger(&self) -> u64 {
        self.spin_last_trigger
    }

    /// Allocate the next outgoing packet number for `pc` on `path`
    ///
    /// Used by the egress engine; also the packet number under which
    /// [`FecState::finalize_and_protect_packet`] wraps the payload.
    pub fn next_send_sequence(&mut self, path: PathId, pc: PacketContext) -> u64 {
        let ctx = &mut self.paths[path].pkt_ctx[pc.index()];
        let seq = ctx.send_sequence;
        ctx.send_sequence += 1;
        seq
    }

    /// Time (µs) the driver should next run this connection
    pub fn next_wake_time(&self) -> u64 {
        self.next_wake_time
    }

    /// Next pending observation
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn fec(&self) -> &FecState {
        &self.fec
    }

    pub fn fec_mut(&mut self) -> &mut FecState {
        &mut self.fec
    }

    /// Record the reset token the peer registered for `path`
    ///
    /// Normally learned from the peer's transport parameters.
    pub fn set_peer_reset_secret(&mut self, path: PathId, secret: ResetToken) {
        self.paths[path].reset_secret = secret;
    }

    /// Mark the client's first flight as sent
    pub fn initial_sent(&mut self) {
        if self.state == State::ClientInit {
            self.set_state(State::ClientInitSent);
        }
    }

    //
    // Shared machinery
    //

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!(?state, "connection state change");
            self.state = state;
        }
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Resolve the path an incoming segment belongs to
    pub(crate) fn get_incoming_path(&self, ph: &PacketHeader) -> Option<PathId> {
        if ph.dest_cid == self.initial_cid || ph.dest_cid == self.paths[0].local_cid {
            Some(0)
        } else {
            None
        }
    }

    /// Remove header protection and decrypt one segment in place
    pub(crate) fn decrypt_incoming(
        &mut self,
        bytes: &mut [u8],
        ph: &mut PacketHeader,
        path: PathId,
    ) -> Result<(), ProcessError> {
        let pc = ph.pc.index();
        let ctx = &self.paths[path].pkt_ctx[pc];
        let keys = self.crypto.get(ph.epoch.index());
        match crypto::decrypt_packet(bytes, ph, keys, ctx.end_of_sack_range(), &ctx.sack) {
            Ok(false) => Ok(()),
            Ok(true) => Err(ProcessError::Duplicate),
            Err(_) => Err(ProcessError::AeadCheck),
        }
    }

    pub(crate) fn record_pn_received(&mut self, path: PathId, pc: PacketContext, pn64: u64) {
        self.paths[path].pkt_ctx[pc.index()].sack.insert_one(pn64);
    }

    fn tls_stream_process(&mut self) -> Result<(), ProcessError> {
        let Self {
            tls,
            state,
            crypto,
            remote_params_received,
            side,
            ..
        } = self;
        let mut ctx = HandshakeCtx {
            side: *side,
            state,
            crypto,
            transport_parameters_received: remote_params_received,
        };
        tls.stream_process(&mut ctx)
            .map_err(|_| ProcessError::Detected)
    }

    /// The packets of `pc` no longer need retransmission on `path`
    fn implicit_handshake_ack(&mut self, path: PathId, pc: PacketContext) {
        trace!(?pc, "implicit handshake ack");
        self.paths[path].pkt_ctx[pc.index()].ack_needed = false;
    }

    /// Decode a plaintext payload, wrap it as a source symbol if it was
    /// tagged with an SFPID frame, and re-inject anything FEC recovery
    /// produced before returning
    fn decode_frames_and_drain(
        &mut self,
        frames: &mut dyn FrameHandler,
        payload: &[u8],
        epoch: Epoch,
        pn64: u64,
        now: u64,
        path: PathId,
    ) -> Result<(), ProcessError> {
        frames
            .decode_frames(payload, epoch, now, path, &mut self.fec)
            .map_err(|_| ProcessError::Detected)?;

        if let Some(sfpid) = self.fec.take_noted_source_fpid() {
            let symbol = SourceSymbol::from_packet(sfpid, pn64, payload);
            self.fec.receive_source_symbol(symbol);
        }

        while let Some(recovered) = self.fec.pop_recovered() {
            trace!(pn = recovered.pn64, "decoding frames of recovered packet");
            if frames
                .decode_frames(&recovered.payload, Epoch::OneRtt, now, path, &mut self.fec)
                .is_err()
            {
                debug!(pn = recovered.pn64, "failed to decode recovered packet");
            }
            // Recovered payloads are already unwrapped symbols
            self.fec.take_noted_source_fpid();
        }
        Ok(())
    }

    /// Tear the crypto and packet-number state back down to Initial, after a
    /// retry or a version change
    fn reset(&mut self, _now: u64) {
        self.crypto.reset_initial(&self.initial_cid, self.side);
        for path in &mut self.paths {
            path.pkt_ctx = Default::default();
        }
    }

    pub(crate) fn process_transport_parameters_once(&mut self) {
        if self.remote_params_received && !self.params_processed {
            self.params_processed = true;
            self.push_event(Event::TransportParameters);
        }
    }

    pub(crate) fn set_next_wake_time(&mut self, now: u64) {
        let path = &self.paths[0];
        let mut wake = now.saturating_add(path.retransmit_timer);
        if !path.challenge_verified && path.challenge_time != 0 {
            wake = wake.min(path.challenge_time);
        }
        if self
            .paths
            .iter()
            .any(|p| p.pkt_ctx.iter().any(|c| c.ack_needed))
        {
            wake = now;
        }
        self.next_wake_time = wake;
    }

    fn connection_error(&mut self, error: TransportError) {
        debug!(%error, "closing connection");
        self.set_state(State::Closing);
    }

    //
    // Per-type handlers
    //

    /// A version negotiation packet arrived; only meaningful right after the
    /// first flight
    pub(crate) fn incoming_version_negotiation(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        now: u64,
    ) -> Result<(), ProcessError> {
        if ph.dest_cid != self.paths[0].local_cid || ph.version != 0 {
            // Not a proper echo of what we sent; log and ignore
            debug!("dropping version negotiation that fails the echo checks");
            return Ok(());
        }
        self.reset_version(&bytes[ph.offset..ph.offset + ph.payload_length], now)
    }

    fn reset_version(&mut self, offered: &[u8], now: u64) -> Result<(), ProcessError> {
        for chunk in offered.chunks_exact(4) {
            let version = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if let Some(index) = version_index(version) {
                debug!(version, "renegotiating version");
                self.version_index = index;
                self.reset(now);
                return Ok(());
            }
        }
        // The peer offered nothing we support
        Err(ProcessError::Detected)
    }

    /// Server-side processing of a client Initial, after the dispatcher's
    /// CID checks
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn incoming_initial(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        if_index: u32,
        now: u64,
        frames: &mut dyn FrameHandler,
        check_token: Option<&S::HmacKey>,
        rng: &mut StdRng,
        transmits: &mut VecDeque<Transmit>,
    ) -> Result<(), ProcessError> {
        if let Some(key) = check_token {
            let expected = token::retry_token(key, &addr_from);
            let supplied = &bytes[ph.token_offset..ph.token_offset + ph.token_length];
            if supplied != &expected[..] {
                self.queue_stateless_retry(ph, addr_from, addr_to, if_index, &expected, rng, transmits);
                return Err(ProcessError::Retry);
            }
        }

        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        self.decode_frames_and_drain(frames, payload, ph.epoch, ph.pn64, now, 0)?;
        self.tls_stream_process()?;

        // Remember the local address the packet arrived on
        self.paths[0].if_index = if_index;
        self.paths[0].local_addr = addr_to;
        if self.state == State::ServerInit {
            self.set_state(State::ServerHandshake);
        }
        Ok(())
    }

    /// Queue a retry carrying the token the client must echo
    #[allow(clippy::too_many_arguments)]
    fn queue_stateless_retry(
        &mut self,
        ph: &PacketHeader,
        addr_from: SocketAddr,
        addr_to: Option<SocketAddr>,
        _if_index: u32,
        retry_token: &[u8],
        rng: &mut StdRng,
        transmits: &mut VecDeque<Transmit>,
    ) {
        self.paths[0].remote_cid = ph.srce_cid;

        let version = SUPPORTED_VERSIONS[self.version_index].version;
        let mut buf = Vec::new();
        // Long-header retry echoing the client's source CID, from our
        // rotated CID
        buf.push(0xf0);
        buf.extend_from_slice(&version.to_be_bytes());
        buf.push(self.paths[0].remote_cid.len() as u8);
        buf.extend_from_slice(&self.paths[0].remote_cid);
        buf.push(self.paths[0].local_cid.len() as u8);
        buf.extend_from_slice(&self.paths[0].local_cid);
        // odcil in the low nibble, random high nibble
        let odcil_random = rng.gen::<u8>() & 0xf0;
        buf.push(odcil_random | self.initial_cid.len() as u8);
        buf.extend_from_slice(&self.initial_cid);
        buf.extend_from_slice(retry_token);

        trace!("queueing stateless retry");
        transmits.push_back(Transmit {
            destination: addr_from,
            source: addr_to,
            contents: buf,
        });
    }

    /// Client-side processing of a server retry
    pub(crate) fn incoming_retry(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        now: u64,
    ) -> Result<(), ProcessError> {
        if self.state != State::ClientInitSent && self.state != State::ClientInitResent {
            return Err(ProcessError::UnexpectedPacket);
        }
        // The retry must echo what was sent
        if ph.version != SUPPORTED_VERSIONS[self.version_index].version {
            return Err(ProcessError::UnexpectedPacket);
        }
        if ph.pn64 != 0 {
            return Err(ProcessError::UnexpectedPacket);
        }

        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        let odcil = usize::from(payload[0] & 0x0f);
        if odcil != self.initial_cid.len()
            || odcil + 1 > payload.len()
            || payload[1..1 + odcil] != self.initial_cid[..]
        {
            // Malformed odcil, or it does not match the initial CID
            return Err(ProcessError::UnexpectedPacket);
        }

        let token = payload[1 + odcil..].to_vec();
        // Continue the handshake against the server-chosen CID, echoing the
        // token in the next Initial
        self.initial_cid = ph.srce_cid;
        self.retry_token = Some(token);
        self.reset(now);

        // Mark the packet as not requiring an ack
        Err(ProcessError::Retry)
    }

    /// Client-side processing of server cleartext (Initial or Handshake)
    pub(crate) fn incoming_server_cleartext(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        addr_to: Option<SocketAddr>,
        now: u64,
        frames: &mut dyn FrameHandler,
    ) -> Result<(), ProcessError> {
        if self.state == State::ClientInitSent || self.state == State::ClientInitResent {
            self.set_state(State::ClientHandshakeStart);
        }
        let restricted = self.state != State::ClientHandshakeStart
            && self.state != State::ClientHandshakeProgress;

        if self.paths[0].remote_cid.is_empty() && !restricted {
            // First response from the server establishes its CID
            self.paths[0].remote_cid = ph.srce_cid;
            self.paths[0].local_addr = addr_to;
        } else if self.paths[0].remote_cid != ph.srce_cid {
            return Err(ProcessError::CnxidCheck);
        }

        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        self.decode_frames_and_drain(frames, payload, ph.epoch, ph.pn64, now, 0)?;

        if !restricted {
            self.tls_stream_process()?;
            // Once handshake keys exist the Initial packets need no repeats
            if self.crypto.get(Epoch::Handshake.index()).is_some() {
                self.implicit_handshake_ack(0, PacketContext::Initial);
            }
        }
        Ok(())
    }

    /// Server-side processing of client Handshake packets
    pub(crate) fn incoming_client_cleartext(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        now: u64,
        frames: &mut dyn FrameHandler,
    ) -> Result<(), ProcessError> {
        match self.state {
            State::ServerInit
            | State::ServerHandshake
            | State::ServerAlmostReady
            | State::ServerReady => {}
            _ => return Err(ProcessError::UnexpectedPacket),
        }
        if ph.srce_cid != self.paths[0].remote_cid {
            return Err(ProcessError::CnxidCheck);
        }

        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        self.decode_frames_and_drain(frames, payload, ph.epoch, ph.pn64, now, 0)?;
        self.tls_stream_process()?;

        // Client Finished completes the server-side handshake
        if !self.handshake_done
            && self.state == State::ServerReady
            && self.tls.is_handshake_complete()
        {
            self.handshake_done = true;
            for path in 0..self.paths.len() {
                self.implicit_handshake_ack(path, PacketContext::Initial);
                self.implicit_handshake_ack(path, PacketContext::Handshake);
            }
            self.push_event(Event::Ready);
        }
        Ok(())
    }

    /// 0-RTT data, acceptable only while the server handshake is concluding
    pub(crate) fn incoming_0rtt(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        now: u64,
        frames: &mut dyn FrameHandler,
    ) -> Result<(), ProcessError> {
        let dest_matches =
            ph.dest_cid == self.initial_cid || ph.dest_cid == self.paths[0].local_cid;
        if !dest_matches || ph.srce_cid != self.paths[0].remote_cid {
            return Err(ProcessError::CnxidCheck);
        }
        if self.state != State::ServerAlmostReady && self.state != State::ServerReady {
            return Err(ProcessError::UnexpectedPacket);
        }
        if ph.version != SUPPORTED_VERSIONS[self.version_index].version {
            self.connection_error(TransportError::PROTOCOL_VIOLATION(
                "0-rtt version differs from the negotiated version",
            ));
            return Err(ProcessError::ProtocolViolation);
        }

        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        self.decode_frames_and_drain(frames, payload, ph.epoch, ph.pn64, now, 0)?;
        // EOED handling
        self.tls_stream_process()
    }

    /// 1-RTT packets: spin observation, closing handling, migration,
    /// receive-rate sampling, then frame decoding
    pub(crate) fn incoming_encrypted(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        addr_from: SocketAddr,
        now: u64,
        frames: &mut dyn FrameHandler,
        rng: &mut StdRng,
    ) -> Result<(), ProcessError> {
        let pc = ph.pc.index();
        let path_id = self.get_incoming_path(ph).ok_or(ProcessError::CnxidCheck)?;
        if self.state < State::ClientAlmostReady {
            // Handshake is not complete yet
            return Err(ProcessError::UnexpectedPacket);
        }
        if self.state == State::Disconnected {
            return Err(ProcessError::UnexpectedPacket);
        }

        if ph.pn64 > self.paths[path_id].pkt_ctx[pc].end_of_sack_range() {
            self.current_spin = ph.spin ^ self.side.is_client();
            if ph.has_spin_bit && self.current_spin != self.prev_spin {
                // Got an edge
                self.prev_spin = self.current_spin;
                self.spin_edge = true;
                self.spin_vec = (self.spin_vec + 1).min(3);
                self.spin_last_trigger = now;
            }
        }

        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        if self.state >= State::ClosingReceived {
            // No data is processed on a closing connection; only closing
            // frames are still read
            if self.state == State::Closing {
                let closing_received = frames
                    .decode_closing_frames(payload)
                    .map_err(|_| ProcessError::Detected)?;
                if closing_received {
                    if self.side.is_client() {
                        self.set_state(State::Disconnected);
                    } else {
                        self.set_state(State::Draining);
                    }
                } else {
                    self.paths[path_id].pkt_ctx[pc].ack_needed = true;
                }
            } else {
                return Err(ProcessError::UnexpectedPacket);
            }
        } else {
            // Compare the packet address to the current path value; an
            // all-zero source is a socket artifact, not a migration
            if self.paths[path_id].peer_addr != addr_from && !is_unspecified_v4(&addr_from) {
                let path = &mut self.paths[path_id];
                debug!(old = %path.peer_addr, new = %addr_from, "peer address changed");
                path.peer_addr = addr_from;
                path.challenge = rng.gen::<u64>();
                path.challenge_verified = false;
                path.challenge_time = now + path.retransmit_timer;
                path.challenge_repeat_count = 0;
                self.push_event(Event::PeerAddressChanged {
                    path: path_id,
                    addr: addr_from,
                });
            }

            // Receive-rate sampling
            let checksum = self
                .crypto
                .get(Epoch::OneRtt.index())
                .map_or(16, |k| crypto::PacketKey::tag_len(&k.packet.remote));
            let path = &mut self.paths[path_id];
            path.received += (ph.offset + ph.payload_length + checksum) as u64;
            if path.receive_rate_epoch == 0 {
                path.received_prior = path.received;
                path.receive_rate_epoch = now;
            } else {
                let delta = now - path.receive_rate_epoch;
                if delta > path.smoothed_rtt && delta > BANDWIDTH_TIME_INTERVAL_MIN {
                    path.receive_rate_estimate =
                        ((path.received - path.received_prior) * 1_000_000) / delta;
                    path.received_prior = path.received;
                    path.receive_rate_epoch = now;
                    if path.receive_rate_estimate > path.receive_rate_max {
                        path.receive_rate_max = path.receive_rate_estimate;
                    }
                }
            }

            self.decode_frames_and_drain(frames, payload, ph.epoch, ph.pn64, now, path_id)?;
        }

        self.tls_stream_process()
    }

    /// The segment's trailing bytes matched this connection's reset secret
    pub(crate) fn incoming_stateless_reset(&mut self) -> ProcessError {
        self.set_state(State::Disconnected);
        self.push_event(Event::StatelessReset);
        ProcessError::StatelessReset
    }
}

fn is_unspecified_v4(addr: &SocketAddr) -> bool {
    addr.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
