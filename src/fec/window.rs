use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::fec::code::{encode_shard, shard_len_for};
use crate::fec::{ErasureCode, FecError, SourceSymbol, BLOCK_NUMBER_MASK, FEC_WINDOW_SIZE};
use crate::frame::RepairFrame;

/// Sender framework of the sliding-window scheme
///
/// Instead of fixed blocks, the sender keeps the window
/// `[smallest_in_transit, highest_in_transit]` of live symbols, at most
/// `FEC_WINDOW_SIZE` wide, in a ring indexed by FPID. Repair generation
/// selects every live symbol in the window whose slot still holds it (the
/// slot FPID check guards against reuse) and covers the selection with
/// `min(n - k, selected)` repair symbols.
pub(crate) struct WindowSender {
    code: Arc<dyn ErasureCode>,
    window: Vec<Option<SourceSymbol>>,
    smallest_in_transit: u32,
    highest_in_transit: u32,
    in_transit: bool,
}

impl WindowSender {
    pub(crate) fn new(code: Arc<dyn ErasureCode>) -> Self {
        Self {
            code,
            window: (0..FEC_WINDOW_SIZE).map(|_| None).collect(),
            smallest_in_transit: 0,
            highest_in_transit: 0,
            in_transit: false,
        }
    }

    /// FPID the next protected symbol will carry; monotone across the window
    pub(crate) fn source_fpid(&self) -> u32 {
        if self.in_transit {
            self.highest_in_transit + 1
        } else {
            self.smallest_in_transit
        }
    }

    pub(crate) fn protect(&mut self, mut symbol: SourceSymbol) -> Result<u32, FecError> {
        let fpid = self.source_fpid();
        symbol.source_fpid = fpid;
        let slot = fpid as usize % FEC_WINDOW_SIZE;
        if let Some(old) = self.window[slot].replace(symbol) {
            // The ring wrapped onto a still-live symbol; it falls out of the
            // window
            self.smallest_in_transit = self.smallest_in_transit.max(old.source_fpid + 1);
        }
        self.highest_in_transit = fpid;
        if !self.in_transit {
            self.smallest_in_transit = fpid;
            self.in_transit = true;
        }
        Ok(fpid)
    }

    /// Drop a delivered symbol from the window
    pub(crate) fn acknowledge(&mut self, sfpid: u32) {
        let slot = sfpid as usize % FEC_WINDOW_SIZE;
        if self.window[slot].as_ref().map(|s| s.source_fpid) == Some(sfpid) {
            self.window[slot] = None;
        }
        if sfpid == self.smallest_in_transit {
            // Advance past the contiguous acknowledged prefix
            while self.smallest_in_transit <= self.highest_in_transit {
                let slot = self.smallest_in_transit as usize % FEC_WINDOW_SIZE;
                match &self.window[slot] {
                    Some(s) if s.source_fpid == self.smallest_in_transit => break,
                    _ if self.smallest_in_transit == self.highest_in_transit => {
                        self.in_transit = false;
                        self.smallest_in_transit += 1;
                        self.highest_in_transit = self.smallest_in_transit;
                        return;
                    }
                    _ => self.smallest_in_transit += 1,
                }
            }
        }
    }

    /// Emit one group of repair symbols covering everything currently in
    /// flight
    ///
    /// A single selection walks the whole window; acknowledged or stale
    /// slots are skipped, never a group boundary, so the repair budget
    /// `min(n - k, selected)` covers any combination of losses among the
    /// selected symbols.
    pub(crate) fn flush(&mut self, out: &mut VecDeque<RepairFrame>) -> Result<(), FecError> {
        if !self.in_transit {
            return Ok(());
        }
        let floor = self.highest_in_transit
            - (FEC_WINDOW_SIZE as u32 - 1).min(self.highest_in_transit);
        let lo = self.smallest_in_transit.max(floor);

        let mut selected: Vec<&SourceSymbol> = Vec::new();
        for i in lo..=self.highest_in_transit {
            let slot = i as usize % FEC_WINDOW_SIZE;
            if let Some(s) = &self.window[slot] {
                if s.source_fpid == i {
                    selected.push(s);
                }
            }
        }
        if selected.is_empty() {
            return Ok(());
        }

        let css = selected.len();
        let nrs = (self.code.n() - self.code.k()).min(css);
        let base = selected[0].source_fpid & BLOCK_NUMBER_MASK;
        let shard_len = shard_len_for(selected.iter().map(|s| &s.data[..]));
        let sources: Vec<Vec<u8>> = selected
            .iter()
            .map(|s| encode_shard(&s.data, shard_len))
            .collect();
        let repairs = self.code.encode(&sources, nrs)?;
        trace!(base, nss = css, nrs, "emitting window repair symbols");
        for (j, shard) in repairs.into_iter().enumerate() {
            out.push_back(RepairFrame {
                repair_fpid: (base << 8) | j as u32,
                nss: css as u8,
                nrs: nrs as u8,
                data: shard.into(),
            });
        }
        Ok(())
    }
}
