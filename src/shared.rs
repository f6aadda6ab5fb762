use std::fmt;
use std::net::SocketAddr;

use rand::Rng;

use crate::connection::PathId;
use crate::packet::PacketType;
use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection, 0 to 20 bytes on the wire
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// Carried in the tail of a stateless reset packet so an endpoint that lost
/// all connection state can still tear the connection down at the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Default for ResetToken {
    fn default() -> Self {
        Self([0; RESET_TOKEN_SIZE])
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// An outgoing stateless packet queued by the endpoint
#[derive(Debug)]
pub struct Transmit {
    /// The socket address to send the datagram to
    pub destination: SocketAddr,
    /// The local address to send it from, when the caller provided one
    pub source: Option<SocketAddr>,
    /// Contents of the datagram
    pub contents: Vec<u8>,
}

/// Observations published by a connection, drained via
/// [`Connection::poll_event`](crate::Connection::poll_event)
///
/// This is the closed-variant replacement for the original design's
/// string-keyed observer hooks: the core publishes, callers (and tests)
/// subscribe by polling.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// The TLS handshake completed and the application may exchange data
    Ready,
    /// A stateless reset matching this connection's reset secret arrived
    StatelessReset,
    /// A valid packet arrived from an address that differs from the path's
    /// recorded peer address
    PeerAddressChanged { path: PathId, addr: SocketAddr },
    /// A segment header was parsed and attributed to this connection
    HeaderParsed {
        path: Option<PathId>,
        ptype: PacketType,
        pn64: u64,
        consumed: usize,
    },
    /// A datagram segment arrived for this connection
    PacketReceived { from: SocketAddr, len: usize },
    /// The peer's transport parameters were received and processed
    TransportParameters,
}
