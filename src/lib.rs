//! Protocol state machine for the receive path of a QUIC endpoint, extended
//! with an in-band forward error correction (FEC) sublayer.
//!
//! This crate performs no I/O. The caller feeds raw UDP datagrams into
//! [`Endpoint::incoming_packet`] together with the current time; the endpoint
//! parses coalesced segments, removes header protection, decrypts payloads in
//! place, recovers 64-bit packet numbers, deduplicates, and dispatches each
//! packet to its connection. Stateless responses (version negotiation,
//! stateless reset, retry) are queued and drained via
//! [`Endpoint::poll_transmit`]; connection-level observations are drained via
//! [`Connection::poll_event`].
//!
//! The FEC sublayer wraps outgoing protected packets into source symbols and
//! emits repair symbols through a pluggable erasure code. On the receive
//! side, repair frames surfaced by the external frame decoder feed a ring of
//! FEC blocks; when a block becomes decodable, the missing packets are
//! reconstructed and their payloads re-injected through the frame decoder
//! within the same processing step.
//!
//! TLS (key schedule and handshake), frame decoding, congestion control, and
//! sockets are external collaborators reached through the [`crypto::Session`]
//! and [`FrameHandler`] traits.

use std::ops;

mod coding;
pub use crate::coding::UnexpectedEnd;

mod range_set;
#[cfg(test)]
mod tests;
mod varint;

mod config;
pub use crate::config::{ConfigError, EndpointConfig, FecConfig, ServerConfig};

mod connection;
pub use crate::connection::{Connection, Path, PathId, State};

pub mod crypto;

mod endpoint;
pub use crate::endpoint::{ConnectError, ConnectionHandle, DatagramStatus, Endpoint};

pub mod fec;
pub use crate::fec::{FecError, FecState, FrameworkKind};

mod frame;
pub use crate::frame::{FrameHandler, RepairFrame, SourceFpidFrame, WriteError, FEC_TYPE, SOURCE_FPID_TYPE};

mod packet;
pub use crate::packet::{Epoch, HeaderError, PacketContext, PacketHeader, PacketType};

mod shared;
pub use crate::shared::{ConnectionId, Event, ResetToken, Transmit};

mod token;

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, TransportError};

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// How a supported version lays out its headers on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum HeaderEncoding {
    /// draft-29 long/short headers
    Draft29,
}

pub(crate) struct SupportedVersion {
    pub(crate) version: u32,
    pub(crate) encoding: HeaderEncoding,
}

/// Versions this endpoint accepts, in preference order. Version negotiation
/// responses list them all.
pub(crate) static SUPPORTED_VERSIONS: &[SupportedVersion] = &[
    SupportedVersion {
        version: 0xff00_001d,
        encoding: HeaderEncoding::Draft29,
    },
    SupportedVersion {
        version: 0xff00_001c,
        encoding: HeaderEncoding::Draft29,
    },
];

/// The most recent QUIC version implemented
pub const VERSION: u32 = 0xff00_001d;

pub(crate) fn version_index(version: u32) -> Option<usize> {
    SUPPORTED_VERSIONS.iter().position(|v| v.version == version)
}

//
// Useful internal constants
//

/// Connection IDs are 0..=20 bytes on the wire
pub(crate) const MAX_CID_SIZE: usize = 20;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
pub(crate) const RETRY_TOKEN_SIZE: usize = 16;
/// Smallest datagram a server accepts a client Initial in
pub(crate) const ENFORCED_INITIAL_MTU: usize = 1200;
/// One type byte, at least 20 random bytes, then the 16-byte reset token
pub(crate) const RESET_PACKET_MIN_SIZE: usize = 1 + 20 + RESET_TOKEN_SIZE;
/// Floor for the receive-rate sampling interval (µs)
pub(crate) const BANDWIDTH_TIME_INTERVAL_MIN: u64 = 1_000;
/// RTT assumed before any sample is taken (µs)
pub(crate) const INITIAL_RTT: u64 = 250_000;
pub(crate) const INITIAL_RETRANSMIT_TIMER: u64 = 250_000;
