//! Traits for the cryptography consumed by the receive pipeline
//!
//! The pipeline abstracts over the actual TLS implementation: the handshake
//! driver lives behind [`Session`], and per-epoch packet protection behind
//! [`HeaderKey`]/[`PacketKey`]. This module also implements the two in-place
//! steps every protected segment goes through on arrival: header-protection
//! removal and AEAD decryption.

use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::State;
use crate::packet::{
    packet_number_64, PacketHeader, PacketType, KEY_PHASE_BIT, LONG_HEADER_FORM,
};
use crate::range_set::RangeSet;
use crate::shared::ConnectionId;
use crate::Side;

/// Cryptography interface based on *ring*
#[cfg(feature = "ring")]
pub mod ring;

/// A cryptographic session (commonly TLS), driven externally
///
/// The receive pipeline never interprets handshake bytes itself; it hands
/// control to the session after each decoded packet via `stream_process`,
/// which may install newly derived epoch keys and advance the
/// almost-ready/ready connection states the handshake owns.
pub trait Session: Sized {
    /// Type used to unmask protected header fields
    type HeaderKey: HeaderKey;
    /// Type used to protect packet payloads
    type PacketKey: PacketKey;
    /// Type used to key token and reset-token derivation
    type HmacKey: HmacKey;

    /// Derive the epoch-0 keys from the client's first destination CID
    fn initial_keys(dst_cid: &ConnectionId, side: Side) -> Keys<Self>;

    /// Create a session to drive the handshake of an incoming connection
    fn new_server_session() -> Self;

    /// Advance the handshake after newly decoded packets
    fn stream_process(&mut self, ctx: &mut HandshakeCtx<'_, Self>) -> Result<(), CryptoError>;

    /// Whether the handshake has completed
    fn is_handshake_complete(&self) -> bool;
}

/// Mutable view of the connection state a handshake driver may touch
pub struct HandshakeCtx<'a, S: Session> {
    pub side: Side,
    pub state: &'a mut State,
    pub crypto: &'a mut CryptoState<S>,
    pub transport_parameters_received: &'a mut bool,
}

/// Keys used to protect packet headers
pub trait HeaderKey {
    /// Produce the 5-byte protection mask for the given ciphertext sample
    fn mask(&self, sample: &[u8]) -> [u8; 5];
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// Keys used to protect packet payloads
pub trait PacketKey {
    /// Decrypt `payload` in place; `aad` is the packet header. Returns the
    /// plaintext length, which is strictly less than the input length.
    fn decrypt_in_place(
        &self,
        packet_number: u64,
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError>;
    /// Encrypt `payload_len` bytes of `buf` in place, appending the tag.
    /// Returns the protected length. `buf` must have `tag_len()` bytes of
    /// room past the payload.
    fn encrypt_in_place(&self, packet_number: u64, aad: &[u8], buf: &mut [u8], payload_len: usize)
        -> usize;
    /// The length of the authentication tag appended to packets
    fn tag_len(&self) -> usize;
}

/// A key for signing with HMAC-based algorithms
pub trait HmacKey: Sized {
    /// Type of the signatures created by `sign()`
    type Signature: AsRef<[u8]>;

    fn new(key: &[u8]) -> Result<Self, ConfigError>;
    fn sign(&self, data: &[u8]) -> Self::Signature;
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Protects packets this endpoint sends
    pub local: T,
    /// Unprotects packets the peer sends
    pub remote: T,
}

/// Packet protection state for one epoch
pub struct Keys<S: Session> {
    pub header: KeyPair<S::HeaderKey>,
    pub packet: KeyPair<S::PacketKey>,
}

/// Per-epoch crypto contexts of one connection
///
/// Slot `e` holds the keys for epoch `e`; a missing slot means the key
/// schedule has not reached (or has discarded) that epoch.
pub struct CryptoState<S: Session> {
    contexts: [Option<Keys<S>>; 4],
}

impl<S: Session> CryptoState<S> {
    /// Fresh state holding only the Initial keys for `dst_cid`
    pub fn initial(dst_cid: &ConnectionId, side: Side) -> Self {
        let mut state = Self {
            contexts: [None, None, None, None],
        };
        state.contexts[0] = Some(S::initial_keys(dst_cid, side));
        state
    }

    pub fn get(&self, epoch: usize) -> Option<&Keys<S>> {
        self.contexts[epoch].as_ref()
    }

    /// Install keys for an epoch; called by the handshake driver as secrets
    /// become available
    pub fn set(&mut self, epoch: usize, keys: Keys<S>) {
        self.contexts[epoch] = Some(keys);
    }

    pub fn discard(&mut self, epoch: usize) {
        self.contexts[epoch] = None;
    }

    /// Drop every context and re-derive Initial keys, as after a retry or a
    /// version change
    pub fn reset_initial(&mut self, dst_cid: &ConnectionId, side: Side) {
        self.contexts = [None, None, None, None];
        self.contexts[0] = Some(S::initial_keys(dst_cid, side));
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("cryptographic operation failed")]
pub struct CryptoError;

/// Remove header protection and decrypt one segment in place
///
/// On success the header's `pn`, `pn_mask`, `pn64`, refined 1-RTT type, and
/// plaintext `payload_length` are filled in, and the payload bytes starting
/// at `ph.offset` hold plaintext. Returns whether `pn64` was already present
/// in `sack`; the caller turns that into a duplicate disposition *after* the
/// AEAD check has passed.
///
/// `highest` is the highest packet number accepted so far in the packet's
/// context (`end_of_sack_range`).
pub(crate) fn decrypt_packet<S: Session>(
    bytes: &mut [u8],
    ph: &mut PacketHeader,
    keys: Option<&Keys<S>>,
    highest: u64,
    sack: &RangeSet,
) -> Result<bool, CryptoError> {
    let length = ph.offset + ph.payload_length;
    let keys = keys.ok_or(CryptoError)?;

    let hp = &keys.header.remote;
    let sample_offset = ph.pn_offset + 4;
    let sample_size = hp.sample_size();

    if sample_offset + sample_size > length {
        // Not enough ciphertext to sample; poison the packet number and let
        // the AEAD check reject the segment
        ph.pn = 0xFFFF_FFFF;
        ph.pn_mask = 0xFFFF_FFFF_0000_0000;
        ph.offset = ph.pn_offset;
    } else {
        let mask = hp.mask(&bytes[sample_offset..sample_offset + sample_size]);
        let first_mask = if bytes[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            0x0f
        } else {
            0x1f
        };
        bytes[0] ^= mask[0] & first_mask;
        let pn_len = usize::from(bytes[0] & 3) + 1;

        let mut pn_val: u32 = 0;
        ph.pn_mask = !0u64;
        for i in 1..=pn_len {
            bytes[ph.offset] ^= mask[i];
            pn_val = (pn_val << 8) + u32::from(bytes[ph.offset]);
            ph.offset += 1;
            ph.pn_mask <<= 8;
        }

        ph.pn = pn_val;
        ph.payload_length -= pn_len;
        // The key phase is protected; only now can 1-RTT packets be split by
        // phase
        if ph.ptype == PacketType::OneRttPhi0 && bytes[0] & KEY_PHASE_BIT != 0 {
            ph.ptype = PacketType::OneRttPhi1;
        }
    }

    ph.pn64 = packet_number_64(highest, ph.pn_mask, ph.pn);
    let already_received = sack.contains(ph.pn64);

    let (aad, rest) = bytes.split_at_mut(ph.offset);
    let decoded =
        keys.packet
            .remote
            .decrypt_in_place(ph.pn64, aad, &mut rest[..ph.payload_length])?;
    debug_assert!(decoded <= ph.payload_length);
    ph.payload_length = decoded;

    Ok(already_received)
}

/// Apply header protection to an already-encrypted segment
///
/// The packet-number length is read from the still-clear first byte.
pub(crate) fn apply_header_protection<H: HeaderKey>(hp: &H, bytes: &mut [u8], pn_offset: usize) {
    let sample_offset = pn_offset + 4;
    let mask = hp.mask(&bytes[sample_offset..sample_offset + hp.sample_size()]);
    let pn_len = usize::from(bytes[0] & 3) + 1;
    let first_mask = if bytes[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
        0x0f
    } else {
        0x1f
    };
    bytes[0] ^= mask[0] & first_mask;
    for i in 0..pn_len {
        bytes[pn_offset + i] ^= mask[1 + i];
    }
}
