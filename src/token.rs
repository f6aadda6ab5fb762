use std::net::SocketAddr;

use crate::crypto::HmacKey;
use crate::shared::{ConnectionId, ResetToken};
use crate::{RESET_TOKEN_SIZE, RETRY_TOKEN_SIZE};

/// Compute the retry token a client at `addr` must echo in its Initial
///
/// The token is a keyed hash of the peer's IP address bytes (4 for IPv4, 16
/// for IPv6) truncated to 16 bytes: stateless on the server, unforgeable
/// without the key, and bound to the address being validated.
pub(crate) fn retry_token<K: HmacKey>(key: &K, addr: &SocketAddr) -> [u8; RETRY_TOKEN_SIZE] {
    let signature = match addr {
        SocketAddr::V4(a) => key.sign(&a.ip().octets()),
        SocketAddr::V6(a) => key.sign(&a.ip().octets()),
    };
    let mut token = [0u8; RETRY_TOKEN_SIZE];
    token.copy_from_slice(&signature.as_ref()[..RETRY_TOKEN_SIZE]);
    token
}

/// Derive the stateless reset token for a connection ID
///
/// Deterministic in the CID so a rebooted endpoint can still produce the
/// token for connections it no longer remembers.
pub(crate) fn reset_token<K: HmacKey>(key: &K, id: &ConnectionId) -> ResetToken {
    let signature = key.sign(id);
    let mut bytes = [0u8; RESET_TOKEN_SIZE];
    bytes.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
    bytes.into()
}
