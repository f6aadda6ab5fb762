use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::fec::code::{encode_shard, shard_len_for};
use crate::fec::{ErasureCode, FecError, SourceSymbol, BLOCK_NUMBER_MASK};
use crate::frame::RepairFrame;

/// Sender framework of the block scheme
///
/// Source symbols accumulate into a fixed `(n, k)` block; when the block
/// holds `k` symbols (or is flushed early) its repair symbols are generated
/// and queued, and the 24-bit block number advances. The FPID packs the
/// block number in its high 24 bits and the in-block index in its low 8.
pub(crate) struct BlockSender {
    code: Arc<dyn ErasureCode>,
    block_number: u32,
    symbols: Vec<SourceSymbol>,
}

impl BlockSender {
    pub(crate) fn new(code: Arc<dyn ErasureCode>) -> Self {
        Self {
            code,
            block_number: 0,
            symbols: Vec::new(),
        }
    }

    /// FPID the next protected symbol will carry; monotone within the block
    pub(crate) fn source_fpid(&self) -> u32 {
        (self.block_number << 8) | self.symbols.len() as u32
    }

    /// Record a source symbol in the active block, assigning its FPID
    pub(crate) fn protect(
        &mut self,
        mut symbol: SourceSymbol,
        out: &mut VecDeque<RepairFrame>,
    ) -> Result<u32, FecError> {
        let fpid = self.source_fpid();
        symbol.source_fpid = fpid;
        self.symbols.push(symbol);
        if self.symbols.len() >= self.code.k() {
            self.close_block(out)?;
        }
        Ok(fpid)
    }

    /// Force emission of pending repair symbols, closing a partial block
    pub(crate) fn flush(&mut self, out: &mut VecDeque<RepairFrame>) -> Result<(), FecError> {
        if self.symbols.is_empty() {
            return Ok(());
        }
        self.close_block(out)
    }

    fn close_block(&mut self, out: &mut VecDeque<RepairFrame>) -> Result<(), FecError> {
        let css = self.symbols.len();
        let nrs = (self.code.n() - self.code.k()).min(css);
        let shard_len = shard_len_for(self.symbols.iter().map(|s| &s.data[..]));
        let sources: Vec<Vec<u8>> = self
            .symbols
            .iter()
            .map(|s| encode_shard(&s.data, shard_len))
            .collect();
        let repairs = self.code.encode(&sources, nrs)?;

        trace!(
            block = self.block_number,
            nss = css,
            nrs,
            "closing fec block"
        );
        for (j, shard) in repairs.into_iter().enumerate() {
            out.push_back(RepairFrame {
                repair_fpid: (self.block_number << 8) | j as u32,
                nss: css as u8,
                nrs: nrs as u8,
                data: shard.into(),
            });
        }
        self.block_number = (self.block_number + 1) & BLOCK_NUMBER_MASK;
        self.symbols.clear();
        Ok(())
    }
}
