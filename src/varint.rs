use bytes::{Buf, BufMut};
use thiserror::Error;

//  +------+--------+-------------+-----------------------+
//  | 2Bit | Length | Usable Bits | Range                 |
//  +------+--------+-------------+-----------------------+
//  | 00   | 1      | 6           | 0-63                  |
//  | 01   | 2      | 14          | 0-16383               |
//  | 10   | 4      | 30          | 0-1073741823          |
//  | 11   | 8      | 62          | 0-4611686018427387903 |
//  +------+--------+-------------+-----------------------+

pub const MAX_VALUE: u64 = 4_611_686_018_427_387_903;

/// Number of bytes the encoding of `x` occupies, or `None` if it exceeds 62
/// usable bits.
pub fn size(x: u64) -> Option<usize> {
    if x < 2u64.pow(6) {
        Some(1)
    } else if x < 2u64.pow(14) {
        Some(2)
    } else if x < 2u64.pow(30) {
        Some(4)
    } else if x <= MAX_VALUE {
        Some(8)
    } else {
        None
    }
}

pub fn read<R: Buf>(r: &mut R) -> Option<u64> {
    if !r.has_remaining() {
        return None;
    }

    let tag = r.chunk()[0] >> 6;
    match tag {
        0b00 => Some(u64::from(r.get_u8())),
        0b01 if r.remaining() >= 2 => Some(u64::from(r.get_u16()) & 0x3fff),
        0b10 if r.remaining() >= 4 => Some(u64::from(r.get_u32()) & 0x3fff_ffff),
        0b11 if r.remaining() >= 8 => Some(r.get_u64() & MAX_VALUE),
        _ => None,
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum WriteError {
    #[error("insufficient space to encode value")]
    InsufficientSpace,
    #[error("value too large for varint encoding")]
    OversizedValue,
}

pub fn write<W: BufMut>(x: u64, w: &mut W) -> Result<(), WriteError> {
    if x < 2u64.pow(6) {
        if w.remaining_mut() < 1 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u8(x as u8);
    } else if x < 2u64.pow(14) {
        if w.remaining_mut() < 2 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u16(0b01 << 14 | x as u16);
    } else if x < 2u64.pow(30) {
        if w.remaining_mut() < 4 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u32(0b10 << 30 | x as u32);
    } else if x <= MAX_VALUE {
        if w.remaining_mut() < 8 {
            return Err(WriteError::InsufficientSpace);
        }
        w.put_u64(0b11 << 62 | x);
    } else {
        return Err(WriteError::OversizedValue);
    }
    Ok(())
}
