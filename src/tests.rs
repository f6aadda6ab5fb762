use std::net::SocketAddr;
use std::sync::Arc;

use assert_matches::assert_matches;

use crate::coding::BufMutExt;
use crate::config::{EndpointConfig, FecConfig, ServerConfig};
use crate::crypto::{self, HandshakeCtx, Keys, PacketKey as _, Session};
use crate::endpoint::{ConnectionHandle, Endpoint};
use crate::fec::{FecState, FrameworkKind, ReedSolomonCode};
use crate::frame::{FrameHandler, RepairFrame, SourceFpidFrame, FEC_TYPE, SOURCE_FPID_TYPE};
use crate::packet::{Epoch, PacketContext};
use crate::shared::{ConnectionId, Event, ResetToken};
use crate::transport_error::TransportError;
use crate::{token, Side, State, SUPPORTED_VERSIONS, VERSION};

//
// Harness: a scripted TLS driver and a recording frame decoder stand in for
// the external collaborators
//

#[derive(Default)]
struct TestSession {
    complete: bool,
}

impl Session for TestSession {
    type HeaderKey = crate::crypto::ring::HeaderKey;
    type PacketKey = crate::crypto::ring::PacketKey;
    type HmacKey = ring::hmac::Key;

    fn initial_keys(dst_cid: &ConnectionId, side: Side) -> Keys<Self> {
        let (header, packet) = crate::crypto::ring::initial_keys(dst_cid, side);
        Keys { header, packet }
    }

    fn new_server_session() -> Self {
        Self::default()
    }

    fn stream_process(&mut self, _ctx: &mut HandshakeCtx<'_, Self>) -> Result<(), crypto::CryptoError> {
        Ok(())
    }

    fn is_handshake_complete(&self) -> bool {
        self.complete
    }
}

#[derive(Default)]
struct Recorder {
    decoded: Vec<(Epoch, Vec<u8>)>,
    closing_response: bool,
    parse_fec: bool,
}

impl FrameHandler for Recorder {
    fn decode_frames(
        &mut self,
        payload: &[u8],
        epoch: Epoch,
        _now: u64,
        _path: usize,
        fec: &mut FecState,
    ) -> Result<(), TransportError> {
        self.decoded.push((epoch, payload.to_vec()));
        if self.parse_fec {
            // The test payloads carry at most one FEC-related frame, first
            match payload.first() {
                Some(&FEC_TYPE) => {
                    let mut buf = &payload[1..];
                    let frame = RepairFrame::decode(&mut buf)
                        .map_err(|_| TransportError::FRAME_ENCODING_ERROR("bad fec frame"))?;
                    fec.receive_repair_frame(&frame);
                }
                Some(&SOURCE_FPID_TYPE) => {
                    let mut buf = &payload[1..];
                    let frame = SourceFpidFrame::decode(&mut buf)
                        .map_err(|_| TransportError::FRAME_ENCODING_ERROR("bad sfpid frame"))?;
                    fec.note_source_fpid(frame.source_fpid);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn decode_closing_frames(&mut self, _payload: &[u8]) -> Result<bool, TransportError> {
        Ok(self.closing_response)
    }
}

impl Recorder {
    fn count(&self, epoch: Epoch) -> usize {
        self.decoded.iter().filter(|(e, _)| *e == epoch).count()
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn hmac_key(seed: u8) -> ring::hmac::Key {
    <ring::hmac::Key as crate::crypto::HmacKey>::new(&[seed; 64]).unwrap()
}

fn server_endpoint(check_token: bool) -> Endpoint<TestSession> {
    let mut sc = ServerConfig::new(hmac_key(1));
    sc.check_token = check_token;
    Endpoint::new(Arc::new(EndpointConfig::new(hmac_key(2))), Some(Arc::new(sc))).unwrap()
}

fn client_endpoint() -> Endpoint<TestSession> {
    Endpoint::new(Arc::new(EndpointConfig::new(hmac_key(3))), None).unwrap()
}

/// Protect a client Initial, padding the datagram out to `pad_to` bytes
fn build_initial(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    version: u32,
    token: &[u8],
    payload: &[u8],
    pn: u64,
    pad_to: usize,
) -> Vec<u8> {
    let (hp, pk) = crate::crypto::ring::initial_keys(dcid, Side::Client);
    let mut buf = Vec::new();
    buf.push(0xc3); // initial, 4-byte packet number
    buf.extend_from_slice(&version.to_be_bytes());
    buf.push(dcid.len() as u8);
    buf.extend_from_slice(dcid);
    buf.push(scid.len() as u8);
    buf.extend_from_slice(scid);
    buf.write_var(token.len() as u64);
    buf.extend_from_slice(token);

    let tag_len = pk.local.tag_len();
    let mut plain = payload.to_vec();
    let overhead = buf.len() + 2 + 4 + tag_len;
    if overhead + plain.len() < pad_to {
        // Trailing zero bytes read as PADDING frames
        plain.resize(pad_to - overhead, 0);
    }
    buf.write_var((4 + plain.len() + tag_len) as u64);
    let pn_offset = buf.len();
    buf.extend_from_slice(&(pn as u32).to_be_bytes());
    let header_len = buf.len();
    buf.extend_from_slice(&plain);
    buf.resize(header_len + plain.len() + tag_len, 0);

    let (aad, body) = buf.split_at_mut(header_len);
    let sealed = pk.local.encrypt_in_place(pn, aad, body, plain.len());
    assert_eq!(sealed, body.len());
    crypto::apply_header_protection(&hp.local, &mut buf, pn_offset);
    buf
}

/// Protect a short-header packet with the Initial-derived keys of `key_cid`
fn build_one_rtt(
    key_cid: &ConnectionId,
    dcid: &ConnectionId,
    pn: u64,
    spin: bool,
    payload: &[u8],
) -> Vec<u8> {
    let (hp, pk) = crate::crypto::ring::initial_keys(key_cid, Side::Client);
    let mut buf = Vec::new();
    buf.push(0x43 | if spin { 0x20 } else { 0 }); // 4-byte packet number
    buf.extend_from_slice(dcid);
    let pn_offset = buf.len();
    buf.extend_from_slice(&(pn as u32).to_be_bytes());
    let header_len = buf.len();
    buf.extend_from_slice(payload);
    buf.resize(header_len + payload.len() + pk.local.tag_len(), 0);

    let (aad, body) = buf.split_at_mut(header_len);
    pk.local.encrypt_in_place(pn, aad, body, payload.len());
    crypto::apply_header_protection(&hp.local, &mut buf, pn_offset);
    buf
}

/// Accept one client Initial, returning the server, the connection handle,
/// and the CID its Initial keys derive from
fn server_with_connection(
    peer: SocketAddr,
) -> (Endpoint<TestSession>, ConnectionHandle, ConnectionId) {
    let mut server = server_endpoint(false);
    let mut frames = Recorder::default();
    let dcid = ConnectionId::new(&[0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8]);
    let scid = ConnectionId::new(&[0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8]);
    let mut pkt = build_initial(&dcid, &scid, VERSION, &[], &[], 0, 1200);
    let status = server.incoming_packet(&mut pkt, peer, None, 0, 0, &mut frames);
    assert!(status.accepted);
    assert!(status.new_context_created);
    let ch = server.first_handle().unwrap();
    (server, ch, dcid)
}

/// Install 1-RTT keys and force the connection into the ready state
fn make_ready(server: &mut Endpoint<TestSession>, ch: ConnectionHandle, key_cid: &ConnectionId) {
    let conn = server.connection_mut(ch);
    conn.crypto
        .set(Epoch::OneRtt.index(), TestSession::initial_keys(key_cid, Side::Server));
    conn.set_state(State::ServerReady);
    while conn.poll_event().is_some() {}
}

//
// Scenarios
//

#[test]
fn version_negotiation() {
    let mut server = server_endpoint(false);
    let mut frames = Recorder::default();
    let from = addr("198.51.100.2:1234");

    let mut pkt = Vec::new();
    pkt.push(0xc0);
    pkt.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    pkt.push(4);
    pkt.extend_from_slice(&[0x00, 0x01, 0x02, 0x03]);
    pkt.push(2);
    pkt.extend_from_slice(&[0x10, 0x11]);
    pkt.write_var(8);
    pkt.extend_from_slice(&[0u8; 8]);

    let status = server.incoming_packet(&mut pkt, from, None, 0, 0, &mut frames);
    assert!(status.accepted);
    assert!(!status.new_context_created);

    let t = server.poll_transmit().unwrap();
    assert_eq!(t.destination, from);
    let b = &t.contents;
    assert_ne!(b[0] & 0x80, 0);
    assert_eq!(&b[1..5], &[0, 0, 0, 0]);
    // CIDs swapped relative to the incoming packet
    assert_eq!(b[5], 2);
    assert_eq!(&b[6..8], &[0x10, 0x11]);
    assert_eq!(b[8], 4);
    assert_eq!(&b[9..13], &[0x00, 0x01, 0x02, 0x03]);
    // Payload lists every supported version, 4 big-endian bytes each
    let versions: Vec<u32> = b[13..]
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let expected: Vec<u32> = SUPPORTED_VERSIONS.iter().map(|v| v.version).collect();
    assert_eq!(versions, expected);
    assert!(server.poll_transmit().is_none());
}

#[test]
fn retry_token_enforcement() {
    let token_key = hmac_key(1);
    let mut server = server_endpoint(true);
    let mut frames = Recorder::default();
    let from = addr("192.0.2.5:4433");
    let dcid = ConnectionId::new(&[0x11; 8]);
    let scid = ConnectionId::new(&[0x22; 8]);

    let mut pkt = build_initial(&dcid, &scid, VERSION, &[], &[], 0, 1200);
    let status = server.incoming_packet(&mut pkt, from, None, 0, 0, &mut frames);
    assert!(!status.accepted);
    // The transient context did not survive the retry
    assert_eq!(server.connection_count(), 0);
    assert_eq!(frames.count(Epoch::Initial), 0);

    let expected = token::retry_token(&token_key, &from);
    let t = server.poll_transmit().unwrap();
    let b = &t.contents;
    assert_eq!(b[0] & 0xf0, 0xf0);
    assert_eq!(&b[1..5], &VERSION.to_be_bytes());
    // Destination echoes the client's source CID
    assert_eq!(b[5], 8);
    assert_eq!(&b[6..14], &scid[..]);
    // Rotated server CID, then the odcil byte and the original CID
    let scil = b[14] as usize;
    let odcil_at = 15 + scil;
    assert_eq!(b[odcil_at] & 0x0f, 8);
    assert_eq!(&b[odcil_at + 1..odcil_at + 9], &dcid[..]);
    // The token is the keyed hash of the peer address
    assert_eq!(&b[b.len() - 16..], &expected[..]);

    // Echoing the token advances the handshake
    let mut pkt = build_initial(&dcid, &scid, VERSION, &expected, &[], 0, 1200);
    let status = server.incoming_packet(&mut pkt, from, None, 0, 0, &mut frames);
    assert!(status.accepted);
    assert!(status.new_context_created);
    let ch = server.first_handle().unwrap();
    assert_eq!(server.connection(ch).state(), State::ServerHandshake);
    assert_eq!(frames.count(Epoch::Initial), 1);
}

#[test]
fn initial_below_mtu_is_dropped() {
    let mut server = server_endpoint(false);
    let mut frames = Recorder::default();
    let dcid = ConnectionId::new(&[0x31; 8]);
    let scid = ConnectionId::new(&[0x32; 8]);
    let mut pkt = build_initial(&dcid, &scid, VERSION, &[], &[], 0, 600);
    let status =
        server.incoming_packet(&mut pkt, addr("198.51.100.2:9000"), None, 0, 0, &mut frames);
    assert!(!status.accepted);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn duplicate_packet() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, key_cid) = server_with_connection(peer);
    make_ready(&mut server, ch, &key_cid);
    let mut frames = Recorder::default();
    let local_cid = server.connection(ch).path(0).local_cid;

    let pkt = build_one_rtt(&key_cid, &local_cid, 42, false, b"application frames");
    let mut first = pkt.clone();
    let status = server.incoming_packet(&mut first, peer, None, 0, 1_000, &mut frames);
    assert!(status.accepted);
    assert_eq!(frames.count(Epoch::OneRtt), 1);

    // Replaying the same ciphertext is rejected without reaching the frame
    // decoder, but still demands an ack
    let mut second = pkt.clone();
    let status = server.incoming_packet(&mut second, peer, None, 0, 2_000, &mut frames);
    assert!(!status.accepted);
    assert_eq!(frames.count(Epoch::OneRtt), 1);
    assert!(server
        .connection(ch)
        .path(0)
        .ack_needed(PacketContext::Application));
}

#[test]
fn sack_is_monotone() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, key_cid) = server_with_connection(peer);
    make_ready(&mut server, ch, &key_cid);
    let mut frames = Recorder::default();
    let local_cid = server.connection(ch).path(0).local_cid;

    let mut last = 0;
    for pn in [1u64, 3, 2, 7, 5] {
        let mut pkt = build_one_rtt(&key_cid, &local_cid, pn, false, b"data");
        assert!(server
            .incoming_packet(&mut pkt, peer, None, 0, 1_000, &mut frames)
            .accepted);
        let end = server.connection(ch).paths[0].pkt_ctx[2].end_of_sack_range();
        assert!(end >= last);
        last = end;
    }
    assert_eq!(last, 7);
}

#[test]
fn stateless_reset_reception() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, _key_cid) = server_with_connection(peer);
    let secret = ResetToken::from([0xaa; 16]);
    server.connection_mut(ch).set_peer_reset_secret(0, secret);
    while server.connection_mut(ch).poll_event().is_some() {}
    let mut frames = Recorder::default();

    // 1-RTT-looking packet for an unknown CID, ending in the reset secret
    let mut pkt = vec![0x40];
    pkt.extend_from_slice(&[0xee; 8]);
    pkt.extend_from_slice(&[0x5a; 20]);
    pkt.extend_from_slice(&secret);
    let status = server.incoming_packet(&mut pkt, peer, None, 0, 0, &mut frames);
    assert!(!status.accepted);

    assert_eq!(server.connection(ch).state(), State::Disconnected);
    let mut resets = 0;
    while let Some(event) = server.connection_mut(ch).poll_event() {
        if event == Event::StatelessReset {
            resets += 1;
        }
    }
    assert_eq!(resets, 1);
}

#[test]
fn stateless_reset_transmission() {
    let reset_key = hmac_key(2);
    let mut server = server_endpoint(false);
    let mut frames = Recorder::default();
    let from = addr("203.0.113.3:1111");
    let dcid = ConnectionId::new(&[0x77; 8]);

    let mut pkt = vec![0x40];
    pkt.extend_from_slice(&dcid);
    pkt.extend_from_slice(&[0x11; 91]); // 100-byte datagram
    let status = server.incoming_packet(&mut pkt, from, None, 0, 0, &mut frames);
    assert!(!status.accepted);

    let t = server.poll_transmit().unwrap();
    let b = &t.contents;
    assert_matches!(b[0], 0x30 | 0x70);
    // At least 20 random bytes, under the inciting packet's size
    assert!(b.len() >= 1 + 20 + 16);
    assert!(b.len() < pkt.len());
    let expected = token::reset_token(&reset_key, &dcid);
    assert_eq!(&b[b.len() - 16..], &expected[..]);
}

#[test]
fn peer_address_migration() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, key_cid) = server_with_connection(peer);
    make_ready(&mut server, ch, &key_cid);
    let mut frames = Recorder::default();
    let local_cid = server.connection(ch).path(0).local_cid;

    let mut pkt = build_one_rtt(&key_cid, &local_cid, 1, false, b"before");
    assert!(server
        .incoming_packet(&mut pkt, peer, None, 0, 1_000, &mut frames)
        .accepted);
    assert_eq!(server.connection(ch).path(0).peer_addr(), peer);

    let migrated = addr("203.0.113.9:5555");
    let now = 50_000;
    let mut pkt = build_one_rtt(&key_cid, &local_cid, 2, false, b"after");
    assert!(server
        .incoming_packet(&mut pkt, migrated, None, 0, now, &mut frames)
        .accepted);

    let path = server.connection(ch).path(0);
    assert_eq!(path.peer_addr(), migrated);
    assert!(!path.challenge_verified());
    assert_ne!(path.challenge(), 0);
    assert_eq!(path.challenge_time(), now + crate::INITIAL_RETRANSMIT_TIMER);

    let mut changes = 0;
    while let Some(event) = server.connection_mut(ch).poll_event() {
        if let Event::PeerAddressChanged { path: 0, addr } = event {
            assert_eq!(addr, migrated);
            changes += 1;
        }
    }
    assert_eq!(changes, 1);
}

#[test]
fn spin_vec_saturates() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, key_cid) = server_with_connection(peer);
    make_ready(&mut server, ch, &key_cid);
    let mut frames = Recorder::default();
    let local_cid = server.connection(ch).path(0).local_cid;

    let mut last_vec = 0;
    for (pn, spin) in [(1, true), (2, false), (3, true), (4, false), (5, true)] {
        let mut pkt = build_one_rtt(&key_cid, &local_cid, pn, spin, b"spin");
        assert!(server
            .incoming_packet(&mut pkt, peer, None, 0, 1_000, &mut frames)
            .accepted);
        let vec = server.connection(ch).spin_vec();
        assert!(vec >= last_vec);
        last_vec = vec;
    }
    assert_eq!(last_vec, 3);
}

#[test]
fn coalesced_segments_processed_in_order() {
    let mut server = server_endpoint(false);
    let mut frames = Recorder::default();
    let peer = addr("198.51.100.9:2222");
    let dcid = ConnectionId::new(&[0x51; 8]);
    let scid = ConnectionId::new(&[0x52; 8]);

    let mut datagram = build_initial(&dcid, &scid, VERSION, &[], b"first", 0, 600);
    datagram.extend(build_initial(&dcid, &scid, VERSION, &[], b"second", 1, 600));
    assert_eq!(datagram.len(), 1200);

    let status = server.incoming_packet(&mut datagram, peer, None, 0, 0, &mut frames);
    assert!(status.accepted);
    assert_eq!(frames.count(Epoch::Initial), 2);
    assert!(frames.decoded[0].1.starts_with(b"first"));
    assert!(frames.decoded[1].1.starts_with(b"second"));

    let ch = server.first_handle().unwrap();
    assert_eq!(server.connection(ch).paths[0].pkt_ctx[0].end_of_sack_range(), 1);
}

#[test]
fn coalesced_segments_with_foreign_cid() {
    let mut server = server_endpoint(false);
    let mut frames = Recorder::default();
    let peer = addr("198.51.100.9:3333");
    let dcid_a = ConnectionId::new(&[0x61; 8]);
    let scid_a = ConnectionId::new(&[0x63; 8]);
    let dcid_b = ConnectionId::new(&[0x62; 8]);
    let scid_b = ConnectionId::new(&[0x64; 8]);

    // Coalescing across destination CIDs is permitted: the mismatch with
    // the first segment's CID is only trace-logged and the second segment
    // is processed normally
    let mut datagram = build_initial(&dcid_a, &scid_a, VERSION, &[], b"alpha", 0, 600);
    datagram.extend(build_initial(&dcid_b, &scid_b, VERSION, &[], b"bravo", 0, 600));

    let status = server.incoming_packet(&mut datagram, peer, None, 0, 0, &mut frames);
    assert!(status.accepted);
    assert_eq!(frames.count(Epoch::Initial), 2);
    assert!(frames.decoded[0].1.starts_with(b"alpha"));
    assert!(frames.decoded[1].1.starts_with(b"bravo"));
    // Each destination CID got its own context
    assert_eq!(server.connection_count(), 2);
}

#[test]
fn client_handles_retry() {
    let mut client = client_endpoint();
    let mut frames = Recorder::default();
    let server_addr = addr("192.0.2.77:443");
    let ch = client.connect(server_addr, TestSession::default(), 0).unwrap();
    assert_eq!(client.connection(ch).state(), State::ClientInitSent);

    let initial_cid = client.connection(ch).initial_cid;
    let local_cid = client.connection(ch).path(0).local_cid;
    let new_server_cid = ConnectionId::new(&[0x99; 8]);

    let mut pkt = vec![0xf0];
    pkt.extend_from_slice(&VERSION.to_be_bytes());
    pkt.push(local_cid.len() as u8);
    pkt.extend_from_slice(&local_cid);
    pkt.push(new_server_cid.len() as u8);
    pkt.extend_from_slice(&new_server_cid);
    pkt.push(0xa0 | initial_cid.len() as u8);
    pkt.extend_from_slice(&initial_cid);
    pkt.extend_from_slice(b"fresh-token");

    let status = client.incoming_packet(&mut pkt, server_addr, None, 0, 0, &mut frames);
    // A valid retry is not acknowledged
    assert!(!status.accepted);
    let conn = client.connection(ch);
    assert_eq!(conn.initial_cid, new_server_cid);
    assert_eq!(conn.retry_token.as_deref(), Some(&b"fresh-token"[..]));
}

#[test]
fn client_handles_version_negotiation() {
    let mut client = client_endpoint();
    let mut frames = Recorder::default();
    let server_addr = addr("192.0.2.77:443");
    let ch = client.connect(server_addr, TestSession::default(), 0).unwrap();
    let local_cid = client.connection(ch).path(0).local_cid;

    let mut pkt = vec![0xc5];
    pkt.extend_from_slice(&0u32.to_be_bytes());
    pkt.push(local_cid.len() as u8);
    pkt.extend_from_slice(&local_cid);
    pkt.push(0);
    // Offer an unknown version, then our second-choice version
    pkt.extend_from_slice(&0xdead_beefu32.to_be_bytes());
    pkt.extend_from_slice(&SUPPORTED_VERSIONS[1].version.to_be_bytes());

    let status = client.incoming_packet(&mut pkt, server_addr, None, 0, 0, &mut frames);
    assert!(status.accepted);
    let conn = client.connection(ch);
    assert_eq!(conn.version_index, 1);
    assert_eq!(conn.state(), State::ClientInitSent);
}

#[test]
fn fec_recovery_reinjects_lost_packets() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, key_cid) = server_with_connection(peer);
    make_ready(&mut server, ch, &key_cid);
    let mut frames = Recorder {
        parse_fec: true,
        ..Default::default()
    };
    let local_cid = server.connection(ch).path(0).local_cid;

    // A sender-side framework protects five packets whose payloads are an
    // SFPID frame followed by filler data
    let cfg = FecConfig {
        framework: FrameworkKind::Block,
        code: Arc::new(ReedSolomonCode::new(7, 5)),
    };
    let mut sender = FecState::new(&cfg).unwrap();
    let mut payloads = Vec::new();
    for i in 0..5u32 {
        let frame = sender.reserve_source_fpid().unwrap();
        assert_eq!(frame.source_fpid, i);
        let mut payload = vec![0u8; SourceFpidFrame::SIZE];
        frame.write(&mut payload).unwrap();
        payload.extend_from_slice(&vec![0x40 + i as u8; 55]);
        sender
            .finalize_and_protect_packet(10 + u64::from(i), &payload)
            .unwrap();
        payloads.push(payload);
    }
    let mut repairs = Vec::new();
    while let Some(f) = sender.poll_repair_frame() {
        repairs.push(f);
    }
    assert_eq!(repairs.len(), 2);

    // Only S0, S2, S4 arrive as packets
    for &i in &[0usize, 2, 4] {
        let mut pkt = build_one_rtt(&key_cid, &local_cid, 10 + i as u64, false, &payloads[i]);
        assert!(server
            .incoming_packet(&mut pkt, peer, None, 0, 1_000, &mut frames)
            .accepted);
    }
    assert_eq!(frames.count(Epoch::OneRtt), 3);

    // Both repair symbols arrive; the second completes the block and the
    // missing packets are decoded before the call returns
    for (j, repair) in repairs.iter().enumerate() {
        let mut body = vec![0u8; repair.size()];
        repair.write(&mut body).unwrap();
        let mut pkt = build_one_rtt(&key_cid, &local_cid, 20 + j as u64, false, &body);
        assert!(server
            .incoming_packet(&mut pkt, peer, None, 0, 1_000, &mut frames)
            .accepted);
    }

    let reinjected: Vec<&Vec<u8>> = frames
        .decoded
        .iter()
        .filter(|(e, p)| *e == Epoch::OneRtt && (p == &payloads[1] || p == &payloads[3]))
        .map(|(_, p)| p)
        .collect();
    assert_eq!(reinjected.len(), 2);

    let fec = server.connection(ch).fec();
    assert_eq!(fec.stats().symbols_recovered, 2);
    assert!(!fec.block_present(0));
}

#[test]
fn closing_connection_reads_only_closing_frames() {
    let peer = addr("198.51.100.7:4433");
    let (mut server, ch, key_cid) = server_with_connection(peer);
    make_ready(&mut server, ch, &key_cid);
    server.connection_mut(ch).set_state(State::Closing);
    let local_cid = server.connection(ch).path(0).local_cid;

    let mut frames = Recorder {
        closing_response: true,
        ..Default::default()
    };
    let mut pkt = build_one_rtt(&key_cid, &local_cid, 9, false, b"close");
    assert!(server
        .incoming_packet(&mut pkt, peer, None, 0, 0, &mut frames)
        .accepted);
    // The closing frame drains a server
    assert_eq!(server.connection(ch).state(), State::Draining);
    assert_eq!(frames.count(Epoch::OneRtt), 0);
}
