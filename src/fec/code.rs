use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::fec::FecError;

/// Capability set an erasure code supplies to the FEC frameworks
///
/// `n`/`k` are the policy parameters governing how many repair symbols a
/// block may carry; the shard counts of an individual `encode` or
/// `reconstruct` call follow the block actually built, which may be shorter
/// than `k`.
///
/// Shards within one call share a single length. Codes are chosen at
/// construction time; there is no runtime negotiation.
pub trait ErasureCode: Send + Sync {
    /// Total symbol budget per block (source + repair)
    fn n(&self) -> usize;
    /// Source symbol budget per block
    fn k(&self) -> usize;

    /// Produce `repair_count` repair shards from the given source shards
    fn encode(&self, sources: &[Vec<u8>], repair_count: usize) -> Result<Vec<Vec<u8>>, FecError>;

    /// Fill in the missing shards in place
    ///
    /// `shards` holds `source_count` source slots followed by the repair
    /// slots; present shards are `Some`. Succeeds when at least
    /// `source_count` shards are present.
    fn reconstruct(
        &self,
        source_count: usize,
        shards: &mut [Option<Vec<u8>>],
    ) -> Result<(), FecError>;
}

/// Systematic Reed-Solomon over GF(2^8)
pub struct ReedSolomonCode {
    n: usize,
    k: usize,
}

impl ReedSolomonCode {
    pub fn new(n: usize, k: usize) -> Self {
        debug_assert!(k > 0 && n > k && n <= 255);
        Self { n, k }
    }
}

impl ErasureCode for ReedSolomonCode {
    fn n(&self) -> usize {
        self.n
    }

    fn k(&self) -> usize {
        self.k
    }

    fn encode(&self, sources: &[Vec<u8>], repair_count: usize) -> Result<Vec<Vec<u8>>, FecError> {
        let rs =
            ReedSolomon::new(sources.len(), repair_count).map_err(|_| FecError::CodeGeometry)?;
        let shard_len = sources.first().map_or(0, Vec::len);
        let mut shards = sources.to_vec();
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_len]).take(repair_count));
        rs.encode(&mut shards).map_err(|_| FecError::CodeFailure)?;
        Ok(shards.split_off(sources.len()))
    }

    fn reconstruct(
        &self,
        source_count: usize,
        shards: &mut [Option<Vec<u8>>],
    ) -> Result<(), FecError> {
        let parity = shards
            .len()
            .checked_sub(source_count)
            .ok_or(FecError::CodeGeometry)?;
        let rs = ReedSolomon::new(source_count, parity).map_err(|_| FecError::CodeGeometry)?;
        rs.reconstruct(shards).map_err(|_| FecError::CodeFailure)
    }
}

// Symbols vary in length but shards may not: each shard carries a 2-byte
// length prefix and zero padding out to the block's shard length, so
// reconstruction returns bit-exact symbol data.

pub(crate) fn shard_len_for<'a>(symbols: impl Iterator<Item = &'a [u8]>) -> usize {
    2 + symbols.map(<[u8]>::len).max().unwrap_or(0)
}

pub(crate) fn encode_shard(data: &[u8], shard_len: usize) -> Vec<u8> {
    debug_assert!(2 + data.len() <= shard_len);
    let mut shard = vec![0u8; shard_len];
    shard[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
    shard[2..2 + data.len()].copy_from_slice(data);
    shard
}

pub(crate) fn decode_shard(shard: &[u8]) -> Option<Vec<u8>> {
    if shard.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([shard[0], shard[1]]) as usize;
    if 2 + len > shard.len() {
        return None;
    }
    Some(shard[2..2 + len].to_vec())
}
