use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use thiserror::Error;

use crate::crypto::HmacKey;
use crate::fec::{ErasureCode, FrameworkKind, ReedSolomonCode};
use crate::MAX_CID_SIZE;

/// Global configuration for the endpoint, affecting all connections
pub struct EndpointConfig<K: HmacKey> {
    /// Length of connection IDs issued by the endpoint
    ///
    /// Also the length assumed when delimiting the destination CID of
    /// incoming short-header packets. 0 makes connections addressable only by
    /// peer address.
    pub local_cid_len: usize,

    /// Private key used to derive stateless reset tokens from connection IDs
    pub reset_key: Arc<K>,

    /// FEC framework configuration applied to every connection
    pub fec: FecConfig,
}

impl<K: HmacKey> EndpointConfig<K> {
    pub fn new(reset_key: K) -> Self {
        Self {
            local_cid_len: 8,
            reset_key: Arc::new(reset_key),
            fec: FecConfig::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.local_cid_len > MAX_CID_SIZE {
            return Err(ConfigError::IllegalValue("local_cid_len must be at most 20"));
        }
        Ok(())
    }
}

impl<K: HmacKey> Default for EndpointConfig<K> {
    fn default() -> Self {
        let mut key = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(K::new(&key).expect("fresh hmac key material"))
    }
}

/// Parameters governing incoming connections
pub struct ServerConfig<K: HmacKey> {
    /// Private key used to derive address validation tokens
    pub token_key: Arc<K>,

    /// Whether to require clients to prove ownership of an address before
    /// committing state, by answering the first Initial with a Retry
    pub check_token: bool,
}

impl<K: HmacKey> ServerConfig<K> {
    pub fn new(token_key: K) -> Self {
        Self {
            token_key: Arc::new(token_key),
            check_token: false,
        }
    }
}

impl<K: HmacKey> Default for ServerConfig<K> {
    fn default() -> Self {
        let mut key = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(K::new(&key).expect("fresh hmac key material"))
    }
}

/// Forward error correction configuration
///
/// The framework variant and the erasure code are fixed at construction;
/// there is no runtime scheme negotiation.
#[derive(Clone)]
pub struct FecConfig {
    /// Symbol bookkeeping scheme
    pub framework: FrameworkKind,
    /// Code used to produce and consume repair symbols
    pub code: Arc<dyn ErasureCode>,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            framework: FrameworkKind::Block,
            code: Arc::new(ReedSolomonCode::new(7, 5)),
        }
    }
}

impl fmt::Debug for FecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FecConfig")
            .field("framework", &self.framework)
            .field("code", &format_args!("({}, {})", self.code.n(), self.code.k()))
            .finish()
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
