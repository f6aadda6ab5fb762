//! In-band forward error correction
//!
//! Outgoing protected packets are wrapped into *source symbols*; an erasure
//! code turns groups of them into *repair symbols* carried in FEC frames.
//! On the receive side, symbols accumulate in a ring of FEC blocks; once a
//! block holds at least as many symbols as it has source symbols, the
//! missing packets are reconstructed and queued for re-injection through the
//! frame decoder.
//!
//! Two framework variants share the interface: the block scheme groups
//! symbols into fixed `(n, k)` blocks, the sliding-window scheme protects
//! whatever is currently in flight. The variant is selected at construction.

use std::collections::VecDeque;

use tinyvec::ArrayVec;
use tracing::{debug, trace};

use crate::config::FecConfig;
use crate::frame::{RepairFrame, SourceFpidFrame};
use thiserror::Error;

mod block;
mod code;
mod window;

pub use code::{ErasureCode, ReedSolomonCode};

use block::BlockSender;
use code::{decode_shard, encode_shard};
use window::WindowSender;

/// Capacity of the receive-side block ring
pub(crate) const MAX_FEC_BLOCKS: usize = 64;
/// Width of the sliding-window sender's symbol ring
pub(crate) const FEC_WINDOW_SIZE: usize = 64;
/// Cap on symbols materialized by one recovery pass
pub(crate) const MAX_RECOVERED_IN_ONE_ROW: usize = 5;
/// Recovered symbols at or below this size are not fed to the frame decoder
pub(crate) const MIN_DECODED_SYMBOL_TO_PARSE: usize = 50;
/// Block numbers are 24 bits on the wire
pub(crate) const BLOCK_NUMBER_MASK: u32 = 0x00ff_ffff;
/// Type tag heading every source symbol built from a packet
pub(crate) const PACKET_SYMBOL_TAG: u8 = 0x01;
/// Tag byte plus the 64-bit packet number
pub(crate) const SYMBOL_PREFIX: usize = 1 + 8;

/// Symbol bookkeeping scheme
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameworkKind {
    /// Fixed `(n, k)` blocks closed in send order
    Block,
    /// Window over everything currently in flight
    SlidingWindow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum FecError {
    #[error("erasure code rejected the block geometry")]
    CodeGeometry,
    #[error("erasure code failed")]
    CodeFailure,
    #[error("a source fpid frame is already reserved for this packet")]
    SfpidAlreadyReserved,
    #[error("fec and source fpid frames are mutually exclusive within a packet")]
    ExclusiveFrames,
    #[error("no source fpid frame reserved for this packet")]
    NoReservedSfpid,
}

/// One protected packet, wrapped for coding
///
/// `data` is the type tag, the packet number as 8 big-endian bytes, then the
/// packet payload.
#[derive(Debug, Clone)]
pub struct SourceSymbol {
    pub source_fpid: u32,
    pub data: Vec<u8>,
}

impl SourceSymbol {
    /// Wrap a protected packet's payload
    pub fn from_packet(source_fpid: u32, pn64: u64, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(SYMBOL_PREFIX + payload.len());
        data.push(PACKET_SYMBOL_TAG);
        data.extend_from_slice(&pn64.to_be_bytes());
        data.extend_from_slice(payload);
        Self { source_fpid, data }
    }
}

/// One repair shard produced by the erasure code
#[derive(Debug, Clone)]
pub struct RepairSymbol {
    pub repair_fpid: u32,
    pub data: Vec<u8>,
}

/// Receive-side reassembly unit
///
/// Decodable once the present source and repair symbols together reach
/// `total_source_symbols`. Slot `i` only ever holds the symbol whose
/// block-relative index is `i`.
#[derive(Debug)]
pub(crate) struct FecBlock {
    pub(crate) fec_block_number: u32,
    pub(crate) total_source_symbols: u8,
    pub(crate) current_source_symbols: u8,
    pub(crate) total_repair_symbols: u8,
    source_symbols: Vec<Option<SourceSymbol>>,
    repair_symbols: Vec<Option<RepairSymbol>>,
}

impl FecBlock {
    fn new(fec_block_number: u32) -> Self {
        Self {
            fec_block_number,
            total_source_symbols: 0,
            current_source_symbols: 0,
            total_repair_symbols: 0,
            source_symbols: Vec::new(),
            repair_symbols: Vec::new(),
        }
    }

    fn set_totals(&mut self, nss: u8, nrs: u8) {
        self.total_source_symbols = nss;
        self.total_repair_symbols = nrs;
        if self.source_symbols.len() < nss as usize {
            self.source_symbols.resize_with(nss as usize, || None);
        }
        if self.repair_symbols.len() < nrs as usize {
            self.repair_symbols.resize_with(nrs as usize, || None);
        }
    }

    fn insert_source(&mut self, index: usize, symbol: SourceSymbol) {
        if index > u8::MAX as usize {
            return;
        }
        if self.source_symbols.len() <= index {
            self.source_symbols.resize_with(index + 1, || None);
        }
        if self.source_symbols[index].is_none() {
            self.source_symbols[index] = Some(symbol);
            self.current_source_symbols += 1;
        }
    }

    fn insert_repair(&mut self, index: usize, symbol: RepairSymbol) {
        if index > u8::MAX as usize {
            return;
        }
        if self.repair_symbols.len() <= index {
            self.repair_symbols.resize_with(index + 1, || None);
        }
        if self.repair_symbols[index].is_none() {
            self.repair_symbols[index] = Some(symbol);
        }
    }

    fn present(&self) -> usize {
        self.current_source_symbols as usize + self.repair_symbols.iter().flatten().count()
    }

    fn decodable(&self) -> bool {
        self.total_source_symbols > 0 && self.present() >= self.total_source_symbols as usize
    }
}

/// A packet reconstructed by FEC recovery, ready for frame decoding
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecoveredPacket {
    pub pn64: u64,
    pub payload: Vec<u8>,
}

/// Counters exposed for diagnostics
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FecStats {
    /// Blocks dropped from the ring before they became decodable
    pub blocks_evicted: u64,
    /// Source symbols materialized by recovery
    pub symbols_recovered: u64,
}

enum SenderFramework {
    Block(BlockSender),
    Window(WindowSender),
}

struct ReceiverFramework {
    kind: FrameworkKind,
    code: std::sync::Arc<dyn ErasureCode>,
    blocks: Vec<Option<FecBlock>>,
    /// Recently received source symbols, sliding-window scheme only
    window: Vec<Option<SourceSymbol>>,
    oldest_block_number: u32,
}

/// Per-connection FEC state: one sender framework, one receiver framework,
/// and the bookkeeping of the packet currently being built
pub struct FecState {
    sender: SenderFramework,
    receiver: ReceiverFramework,
    /// Non-null only between FPID reservation and packet finalization
    current_sfpid_frame: Option<SourceFpidFrame>,
    current_packet_contains_fec_frame: bool,
    current_packet_contains_fpid_frame: bool,
    sfpid_reserved: bool,
    noted_source_fpid: Option<u32>,
    repair_out: VecDeque<RepairFrame>,
    recovered: VecDeque<RecoveredPacket>,
    stats: FecStats,
}

impl FecState {
    /// Create the sender and receiver frameworks together; fails as a unit
    pub fn new(config: &FecConfig) -> Result<Self, FecError> {
        let code = config.code.clone();
        if code.k() == 0 || code.n() <= code.k() {
            return Err(FecError::CodeGeometry);
        }
        let sender = match config.framework {
            FrameworkKind::Block => SenderFramework::Block(BlockSender::new(code.clone())),
            FrameworkKind::SlidingWindow => {
                SenderFramework::Window(WindowSender::new(code.clone()))
            }
        };
        Ok(Self {
            sender,
            receiver: ReceiverFramework {
                kind: config.framework,
                code,
                blocks: (0..MAX_FEC_BLOCKS).map(|_| None).collect(),
                window: (0..FEC_WINDOW_SIZE).map(|_| None).collect(),
                oldest_block_number: 0,
            },
            current_sfpid_frame: None,
            current_packet_contains_fec_frame: false,
            current_packet_contains_fpid_frame: false,
            sfpid_reserved: false,
            noted_source_fpid: None,
            repair_out: VecDeque::new(),
            recovered: VecDeque::new(),
            stats: FecStats::default(),
        })
    }

    //
    // Sender side
    //

    /// FPID the next protected packet will carry
    pub fn source_fpid(&self) -> u32 {
        match &self.sender {
            SenderFramework::Block(s) => s.source_fpid(),
            SenderFramework::Window(s) => s.source_fpid(),
        }
    }

    /// Reserve the SFPID frame for the packet being built
    ///
    /// At most one reservation may be outstanding, and a packet carrying a
    /// FEC frame may not also carry an SFPID frame.
    pub fn reserve_source_fpid(&mut self) -> Result<SourceFpidFrame, FecError> {
        if self.sfpid_reserved {
            return Err(FecError::SfpidAlreadyReserved);
        }
        if self.current_packet_contains_fec_frame {
            return Err(FecError::ExclusiveFrames);
        }
        let frame = SourceFpidFrame {
            source_fpid: self.source_fpid(),
        };
        self.sfpid_reserved = true;
        self.current_packet_contains_fpid_frame = true;
        self.current_sfpid_frame = Some(frame);
        Ok(frame)
    }

    /// Record that a repair frame was written into the packet being built
    pub fn note_repair_frame_written(&mut self) -> Result<(), FecError> {
        if self.current_packet_contains_fpid_frame {
            return Err(FecError::ExclusiveFrames);
        }
        self.current_packet_contains_fec_frame = true;
        Ok(())
    }

    /// Protect the finished packet as a source symbol
    ///
    /// Clears the reservation and the per-packet frame flags.
    pub fn finalize_and_protect_packet(
        &mut self,
        pn64: u64,
        payload: &[u8],
    ) -> Result<u32, FecError> {
        let frame = self
            .current_sfpid_frame
            .take()
            .ok_or(FecError::NoReservedSfpid)?;
        let symbol = SourceSymbol::from_packet(frame.source_fpid, pn64, payload);
        let fpid = match &mut self.sender {
            SenderFramework::Block(s) => s.protect(symbol, &mut self.repair_out)?,
            SenderFramework::Window(s) => s.protect(symbol)?,
        };
        debug_assert_eq!(fpid, frame.source_fpid);
        self.sfpid_reserved = false;
        self.current_packet_contains_fpid_frame = false;
        self.current_packet_contains_fec_frame = false;
        Ok(fpid)
    }

    /// Drop the bookkeeping of a packet that will not be sent
    pub fn abandon_packet(&mut self) {
        self.current_sfpid_frame = None;
        self.sfpid_reserved = false;
        self.current_packet_contains_fpid_frame = false;
        self.current_packet_contains_fec_frame = false;
    }

    /// Force emission of pending repair symbols
    pub fn flush_repair_symbols(&mut self) -> Result<(), FecError> {
        match &mut self.sender {
            SenderFramework::Block(s) => s.flush(&mut self.repair_out),
            SenderFramework::Window(s) => s.flush(&mut self.repair_out),
        }
    }

    /// Next repair frame awaiting transmission
    pub fn poll_repair_frame(&mut self) -> Option<RepairFrame> {
        self.repair_out.pop_front()
    }

    /// The peer acknowledged the packet protected as `sfpid`
    pub fn on_symbol_acked(&mut self, sfpid: u32) {
        if let SenderFramework::Window(s) = &mut self.sender {
            s.acknowledge(sfpid);
        }
    }

    //
    // Receive side
    //

    /// Called by the frame decoder when it parses an SFPID frame; the
    /// dispatcher picks the note up after the packet is fully decoded
    pub fn note_source_fpid(&mut self, sfpid: u32) {
        self.noted_source_fpid = Some(sfpid);
    }

    pub(crate) fn take_noted_source_fpid(&mut self) -> Option<u32> {
        self.noted_source_fpid.take()
    }

    /// Called by the frame decoder when it parses a FEC frame
    pub fn receive_repair_frame(&mut self, frame: &RepairFrame) {
        let symbol = RepairSymbol {
            repair_fpid: frame.repair_fpid,
            data: frame.data.to_vec(),
        };
        self.receiver.receive_repair_symbol(
            symbol,
            frame.nss,
            frame.nrs,
            &mut self.recovered,
            &mut self.stats,
        );
    }

    /// Place a received source symbol into its block or window
    pub fn receive_source_symbol(&mut self, symbol: SourceSymbol) {
        self.receiver
            .receive_source_symbol(symbol, &mut self.recovered, &mut self.stats);
    }

    /// Next packet materialized by recovery
    pub fn pop_recovered(&mut self) -> Option<RecoveredPacket> {
        self.recovered.pop_front()
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn block_present(&self, block_number: u32) -> bool {
        self.receiver.blocks[block_number as usize % MAX_FEC_BLOCKS]
            .as_ref()
            .map_or(false, |b| b.fec_block_number == block_number)
    }
}

impl ReceiverFramework {
    fn receive_repair_symbol(
        &mut self,
        symbol: RepairSymbol,
        nss: u8,
        nrs: u8,
        recovered: &mut VecDeque<RecoveredPacket>,
        stats: &mut FecStats,
    ) {
        let bn = symbol.repair_fpid >> 8;
        let index = (symbol.repair_fpid & 0xff) as usize;
        let kind = self.kind;
        let window = std::mem::take(&mut self.window);
        if let Some(block) = self.slot_for(bn, stats) {
            block.set_totals(nss, nrs);
            block.insert_repair(index, symbol);
            if kind == FrameworkKind::SlidingWindow {
                fill_from_window(block, &window);
            }
        }
        self.window = window;
        self.try_recover(bn, recovered, stats);
    }

    fn receive_source_symbol(
        &mut self,
        symbol: SourceSymbol,
        recovered: &mut VecDeque<RecoveredPacket>,
        stats: &mut FecStats,
    ) {
        match self.kind {
            FrameworkKind::Block => {
                let bn = symbol.source_fpid >> 8;
                let index = (symbol.source_fpid & 0xff) as usize;
                if let Some(block) = self.slot_for(bn, stats) {
                    block.insert_source(index, symbol);
                }
                self.try_recover(bn, recovered, stats);
            }
            FrameworkKind::SlidingWindow => {
                let sfpid = symbol.source_fpid;
                self.window[sfpid as usize % FEC_WINDOW_SIZE] = Some(symbol);
                // Hand the symbol to any block already waiting for it
                let mut touched: ArrayVec<[u32; MAX_FEC_BLOCKS]> = ArrayVec::new();
                let (window, blocks) = (&self.window, &mut self.blocks);
                for block in blocks.iter_mut().flatten() {
                    let rel = (sfpid & BLOCK_NUMBER_MASK)
                        .wrapping_sub(block.fec_block_number)
                        & BLOCK_NUMBER_MASK;
                    if (rel as usize) < block.total_source_symbols as usize {
                        fill_from_window(block, window);
                        touched.push(block.fec_block_number);
                    }
                }
                for bn in touched {
                    self.try_recover(bn, recovered, stats);
                }
            }
        }
    }

    /// Resolve the ring slot for `bn`, evicting an older block on collision
    fn slot_for(&mut self, bn: u32, stats: &mut FecStats) -> Option<&mut FecBlock> {
        if bn < self.oldest_block_number {
            return None;
        }
        let index = bn as usize % MAX_FEC_BLOCKS;
        let replace = match &self.blocks[index] {
            Some(b) if b.fec_block_number == bn => false,
            Some(b) if b.fec_block_number > bn => return None,
            Some(_) => true,
            None => true,
        };
        if replace {
            if let Some(old) = self.blocks[index].replace(FecBlock::new(bn)) {
                stats.blocks_evicted += 1;
                self.oldest_block_number = self.oldest_block_number.max(old.fec_block_number + 1);
                trace!(
                    evicted = old.fec_block_number,
                    incoming = bn,
                    "fec ring eviction"
                );
            }
        }
        self.blocks[index].as_mut()
    }

    fn try_recover(
        &mut self,
        bn: u32,
        recovered: &mut VecDeque<RecoveredPacket>,
        stats: &mut FecStats,
    ) {
        let index = bn as usize % MAX_FEC_BLOCKS;
        let ready = self.blocks[index]
            .as_ref()
            .map_or(false, |b| b.fec_block_number == bn && b.decodable());
        if !ready {
            return;
        }
        // Taking the block both frees the ring slot and guarantees a single
        // drop even if recovery fails
        let mut block = self.blocks[index].take().expect("slot checked above");
        self.oldest_block_number = self.oldest_block_number.max(bn + 1);
        if let Err(e) = recover_block(&*self.code, &mut block, recovered, stats) {
            debug!(block = bn, error = %e, "fec recovery failed");
        }
    }
}

/// Copy window symbols into the block slots they belong to
///
/// The sender assigns block indices in send order, which equals the FPID
/// offset from the block base whenever its selection had no interior gaps.
/// The offset is all a receiver can reconstruct: absent offsets are exactly
/// the symbols recovery is for, so they must keep their slots. A block whose
/// sender skipped acknowledged symbols mid-window reconstructs to data that
/// fails the symbol type-tag check and is dropped with the block.
fn fill_from_window(block: &mut FecBlock, window: &[Option<SourceSymbol>]) {
    for i in 0..block.total_source_symbols as usize {
        let expected = (block.fec_block_number + i as u32) & BLOCK_NUMBER_MASK;
        let slot = &window[expected as usize % FEC_WINDOW_SIZE];
        if let Some(symbol) = slot {
            if symbol.source_fpid & BLOCK_NUMBER_MASK == expected {
                block.insert_source(i, symbol.clone());
            }
        }
    }
}

/// Reconstruct the missing source symbols of a decodable block
///
/// At most `MAX_RECOVERED_IN_ONE_ROW` missing symbols are materialized per
/// pass; those longer than `MIN_DECODED_SYMBOL_TO_PARSE` are unwrapped into
/// `(pn64, payload)` and queued for frame decoding.
fn recover_block(
    code: &dyn ErasureCode,
    block: &mut FecBlock,
    recovered: &mut VecDeque<RecoveredPacket>,
    stats: &mut FecStats,
) -> Result<(), FecError> {
    let nss = block.total_source_symbols as usize;
    let nrs = block.total_repair_symbols as usize;

    let mut to_recover: ArrayVec<[u8; MAX_RECOVERED_IN_ONE_ROW]> = ArrayVec::new();
    for i in 0..nss {
        if to_recover.len() >= MAX_RECOVERED_IN_ONE_ROW {
            break;
        }
        if block.source_symbols.get(i).map_or(true, Option::is_none) {
            to_recover.push(i as u8);
        }
    }
    if to_recover.is_empty() {
        return Ok(());
    }

    // Every repair shard in a block shares one length
    let shard_len = block
        .repair_symbols
        .iter()
        .flatten()
        .map(|r| r.data.len())
        .next()
        .ok_or(FecError::CodeGeometry)?;

    let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(nss + nrs);
    for i in 0..nss {
        shards.push(
            block
                .source_symbols
                .get(i)
                .and_then(Option::as_ref)
                .filter(|s| 2 + s.data.len() <= shard_len)
                .map(|s| encode_shard(&s.data, shard_len)),
        );
    }
    for j in 0..nrs {
        shards.push(
            block
                .repair_symbols
                .get(j)
                .and_then(Option::as_ref)
                .filter(|r| r.data.len() == shard_len)
                .map(|r| r.data.clone()),
        );
    }

    code.reconstruct(nss, &mut shards)?;

    for &i in to_recover.iter() {
        let Some(data) = shards[i as usize].as_deref().and_then(decode_shard) else {
            continue;
        };
        stats.symbols_recovered += 1;
        if data.len() > MIN_DECODED_SYMBOL_TO_PARSE {
            if data[0] != PACKET_SYMBOL_TAG {
                // Sender and receiver disagreed about the block's symbol
                // placement; the reconstruction is not a packet
                debug!(index = i, "recovered symbol with an unknown type tag");
                continue;
            }
            let pn64 = u64::from_be_bytes(data[1..9].try_into().expect("prefix checked"));
            trace!(pn = pn64, len = data.len(), "recovered source symbol");
            recovered.push_back(RecoveredPacket {
                pn64,
                payload: data[SYMBOL_PREFIX..].to_vec(),
            });
        }
    }
    Ok(())
}
