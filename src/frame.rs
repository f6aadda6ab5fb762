//! FEC wire frames and the external frame-decoder seam
//!
//! The general QUIC frame grammar is decoded by an external collaborator
//! behind [`FrameHandler`]; only the two FEC frame types belong to this
//! crate. A decoder that encounters them parses the body with the types here
//! and feeds the result back through the [`FecState`] it was handed.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};
use crate::connection::PathId;
use crate::fec::FecState;
use crate::packet::Epoch;
use crate::transport_error::TransportError;
use crate::varint;

/// Frame type tagging a packet with its source FEC payload ID
pub const SOURCE_FPID_TYPE: u8 = 0x29;
/// Frame type carrying one repair symbol
pub const FEC_TYPE: u8 = 0x2a;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum WriteError {
    /// The writer had insufficient space for the frame
    #[error("insufficient buffer space for frame")]
    BufferTooSmall,
}

/// Announces that the enclosing packet is protected as source symbol
/// `source_fpid`
///
/// Wire layout: 1 type byte, then the SFPID as 4 big-endian bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SourceFpidFrame {
    pub source_fpid: u32,
}

impl SourceFpidFrame {
    /// Encoded size, type byte included
    pub const SIZE: usize = 5;

    pub fn write(&self, buf: &mut [u8]) -> Result<usize, WriteError> {
        if buf.len() < Self::SIZE {
            return Err(WriteError::BufferTooSmall);
        }
        buf[0] = SOURCE_FPID_TYPE;
        buf[1..5].copy_from_slice(&self.source_fpid.to_be_bytes());
        Ok(Self::SIZE)
    }

    /// Decode the frame body; the type byte has already been consumed by the
    /// frame dispatcher
    pub fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self {
            source_fpid: buf.get()?,
        })
    }
}

/// Carries one repair symbol together with the block geometry the receiver
/// needs to place it
///
/// Wire layout after the type byte: `repair_fpid` (u32), `nss` (u8), `nrs`
/// (u8), `data_length` (varint), `data`. A repair symbol is never split
/// across multiple FEC frames.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RepairFrame {
    pub repair_fpid: u32,
    /// Total source symbols expected in the block
    pub nss: u8,
    /// Total repair symbols produced for the block
    pub nrs: u8,
    pub data: Bytes,
}

impl RepairFrame {
    pub fn size(&self) -> usize {
        1 + 4 + 1 + 1 + varint::size(self.data.len() as u64).unwrap_or(8) + self.data.len()
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize, WriteError> {
        let needed = self.size();
        if buf.len() < needed {
            return Err(WriteError::BufferTooSmall);
        }
        let mut w = &mut buf[..];
        w.put_u8(FEC_TYPE);
        w.write(self.repair_fpid);
        w.put_u8(self.nss);
        w.put_u8(self.nrs);
        w.write_var(self.data.len() as u64);
        w.put_slice(&self.data);
        Ok(needed)
    }

    /// Decode the frame body; the type byte has already been consumed
    pub fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let repair_fpid = buf.get()?;
        let nss = buf.get()?;
        let nrs = buf.get()?;
        let len = buf.get_var()? as usize;
        if buf.remaining() < len {
            return Err(coding::UnexpectedEnd);
        }
        Ok(Self {
            repair_fpid,
            nss,
            nrs,
            data: buf.copy_to_bytes(len),
        })
    }
}

/// External frame decoder
///
/// Invoked with the plaintext of every accepted packet. Implementations own
/// the QUIC frame grammar; on encountering the FEC frame types they call
/// back into the provided [`FecState`]
/// ([`receive_repair_frame`](FecState::receive_repair_frame) /
/// [`note_source_fpid`](FecState::note_source_fpid)). Payloads reconstructed
/// by FEC recovery are fed through `decode_frames` again before the
/// dispatcher returns.
pub trait FrameHandler {
    fn decode_frames(
        &mut self,
        payload: &[u8],
        epoch: Epoch,
        now: u64,
        path: PathId,
        fec: &mut FecState,
    ) -> Result<(), TransportError>;

    /// Decode only closing-related frames; returns whether a closing frame
    /// was present
    fn decode_closing_frames(&mut self, payload: &[u8]) -> Result<bool, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_fpid_round_trip() {
        let frame = SourceFpidFrame {
            source_fpid: 0x0102_0304,
        };
        let mut buf = [0u8; 16];
        let n = frame.write(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf[0], SOURCE_FPID_TYPE);
        let mut r = &buf[1..n];
        assert_eq!(SourceFpidFrame::decode(&mut r).unwrap(), frame);
    }

    #[test]
    fn source_fpid_buffer_too_small() {
        let frame = SourceFpidFrame { source_fpid: 1 };
        let mut buf = [0u8; 4];
        assert_eq!(frame.write(&mut buf), Err(WriteError::BufferTooSmall));
    }

    #[test]
    fn repair_round_trip() {
        let frame = RepairFrame {
            repair_fpid: 0x0000_2a01,
            nss: 5,
            nrs: 2,
            data: Bytes::from_static(b"repair shard bytes"),
        };
        let mut buf = vec![0u8; frame.size()];
        let n = frame.write(&mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(buf[0], FEC_TYPE);
        let mut r = &buf[1..n];
        assert_eq!(RepairFrame::decode(&mut r).unwrap(), frame);
    }

    #[test]
    fn repair_truncated_data_fails() {
        let frame = RepairFrame {
            repair_fpid: 7,
            nss: 3,
            nrs: 1,
            data: Bytes::from_static(&[9; 32]),
        };
        let mut buf = vec![0u8; frame.size()];
        frame.write(&mut buf).unwrap();
        let mut r = &buf[1..buf.len() - 4];
        assert_eq!(RepairFrame::decode(&mut r), Err(coding::UnexpectedEnd));
    }
}
