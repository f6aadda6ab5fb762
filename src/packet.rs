use std::fmt;

use thiserror::Error;

use crate::shared::ConnectionId;
use crate::MAX_CID_SIZE;
use crate::{varint, version_index, HeaderEncoding, SUPPORTED_VERSIONS};

// Packet number protection makes full header decoding a two-step affair: the
// clear-text fields parsed here identify the connection and the crypto
// context, and only then can the protected first-byte bits and the packet
// number itself be unmasked (see `crypto::decrypt_packet`). The header
// therefore carries both clear-text offsets and the packet-number fields
// that decryption fills in.

/// Wire-level packet type, including the key-phase split of 1-RTT packets
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    VersionNegotiation,
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRttPhi0,
    OneRttPhi1,
    /// Unparseable or unsupported; carried so stateless responders can still
    /// inspect the clear-text fields
    Error,
}

impl PacketType {
    pub(crate) fn is_one_rtt(self) -> bool {
        matches!(self, PacketType::OneRttPhi0 | PacketType::OneRttPhi1)
    }
}

/// Packet number space a packet is tracked in
///
/// Each context owns its own SACK set and packet-number sequence.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PacketContext {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl PacketContext {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Key-schedule level
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl Epoch {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Parsed view of one wire segment
///
/// References nothing: offsets index into the caller's datagram buffer, which
/// stays under the caller's ownership for the duration of the segment.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub version: u32,
    /// Index into the supported-version table, `None` if unsupported
    pub version_index: Option<usize>,
    pub dest_cid: ConnectionId,
    pub srce_cid: ConnectionId,
    /// Bytes consumed by the header; advanced past the packet number once
    /// header protection is removed
    pub offset: usize,
    pub pn_offset: usize,
    pub token_offset: usize,
    pub token_length: usize,
    pub payload_length: usize,
    /// Truncated packet number as decoded from the wire
    pub pn: u32,
    pub pn_mask: u64,
    pub pn64: u64,
    pub epoch: Epoch,
    pub pc: PacketContext,
    pub has_spin_bit: bool,
    pub spin: bool,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum HeaderError {
    #[error("malformed header: {0}")]
    Malformed(&'static str),
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
pub(crate) const KEY_PHASE_BIT: u8 = 0x04;

impl PacketHeader {
    fn null(version: u32) -> Self {
        Self {
            ptype: PacketType::Error,
            version,
            version_index: None,
            dest_cid: ConnectionId::default(),
            srce_cid: ConnectionId::default(),
            offset: 0,
            pn_offset: 0,
            token_offset: 0,
            token_length: 0,
            payload_length: 0,
            pn: 0,
            pn_mask: 0,
            pn64: 0,
            epoch: Epoch::Initial,
            pc: PacketContext::Initial,
            has_spin_bit: false,
            spin: false,
        }
    }

    /// Parse the clear-text portion of one segment
    ///
    /// `short_cid_len` is the endpoint's configured local connection ID
    /// length, used to delimit the destination CID of short headers. A
    /// segment whose fixed bit is clear, whose version is unsupported, or
    /// whose length fields are inconsistent parses to `PacketType::Error`
    /// with enough clear-text preserved for the stateless responders; only
    /// outright length underruns fail.
    pub fn parse(bytes: &[u8], short_cid_len: usize) -> Result<Self, HeaderError> {
        let length = bytes.len();
        if length == 0 {
            return Err(HeaderError::Malformed("empty segment"));
        }

        let mut ph = Self::null(0);
        if bytes[0] & FIXED_BIT != FIXED_BIT {
            ph.offset = length;
            return Ok(ph);
        }

        if bytes[0] & LONG_HEADER_FORM == LONG_HEADER_FORM {
            Self::parse_long(bytes, ph)
        } else {
            Self::parse_short(bytes, ph, short_cid_len)
        }
    }

    fn parse_long(bytes: &[u8], mut ph: PacketHeader) -> Result<PacketHeader, HeaderError> {
        let length = bytes.len();
        if length < 7 {
            return Err(HeaderError::Malformed("truncated long header"));
        }

        ph.version = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let dcil = bytes[5] as usize;
        if 6 + dcil + 1 > length {
            return Err(HeaderError::Malformed("connection id longer than packet"));
        }
        ph.dest_cid = parse_cid(&bytes[6..], dcil)?;
        ph.offset = 6 + dcil;
        let scil = bytes[ph.offset] as usize;
        ph.offset += 1;
        if ph.offset + scil > length {
            return Err(HeaderError::Malformed("connection id longer than packet"));
        }
        ph.srce_cid = parse_cid(&bytes[ph.offset..], scil)?;
        ph.offset += scil;

        if ph.version == 0 {
            ph.ptype = PacketType::VersionNegotiation;
            ph.pc = PacketContext::Initial;
            ph.payload_length = length.saturating_sub(ph.offset);
            return Ok(ph);
        }

        ph.version_index = version_index(ph.version);
        if let Some(index) = ph.version_index {
            match SUPPORTED_VERSIONS[index].encoding {
                HeaderEncoding::Draft29 => match (bytes[0] >> 4) & 3 {
                    0x0 => {
                        // Initial packets carry a retry token between the
                        // header and the protected payload
                        ph.ptype = PacketType::Initial;
                        ph.pc = PacketContext::Initial;
                        ph.epoch = Epoch::Initial;
                        match read_varint(&bytes[ph.offset..]) {
                            Some((token_len, var_len))
                                if ph.offset + var_len + token_len as usize <= length =>
                            {
                                ph.token_length = token_len as usize;
                                ph.token_offset = ph.offset + var_len;
                                ph.offset += var_len + token_len as usize;
                            }
                            _ => {
                                ph.offset = length;
                                ph.ptype = PacketType::Error;
                                ph.pc = PacketContext::Initial;
                            }
                        }
                    }
                    0x1 => {
                        ph.ptype = PacketType::ZeroRtt;
                        ph.pc = PacketContext::Application;
                        ph.epoch = Epoch::ZeroRtt;
                    }
                    0x2 => {
                        ph.ptype = PacketType::Handshake;
                        ph.pc = PacketContext::Handshake;
                        ph.epoch = Epoch::Handshake;
                    }
                    0x3 => {
                        ph.ptype = PacketType::Retry;
                        ph.pc = PacketContext::Initial;
                        ph.epoch = Epoch::Initial;
                    }
                    _ => unreachable!(),
                },
            }
        }

        if ph.ptype == PacketType::Retry {
            // No length varint and no packet number in retry packets
            if length > ph.offset {
                ph.payload_length = length - ph.offset;
            } else {
                ph.payload_length = 0;
                ph.ptype = PacketType::Error;
            }
            return Ok(ph);
        }

        let parsed_length = if ph.offset < length {
            read_varint(&bytes[ph.offset..])
        } else {
            None
        };
        match parsed_length {
            Some((payload_length, var_len))
                if ph.version_index.is_some()
                    && ph.ptype != PacketType::Error
                    && ph.offset + var_len + payload_length as usize <= length =>
            {
                ph.payload_length = payload_length as usize;
                ph.offset += var_len;
                ph.pn_offset = ph.offset;
            }
            _ => {
                ph.ptype = PacketType::Error;
                ph.payload_length = length.saturating_sub(ph.offset);
            }
        }

        Ok(ph)
    }

    fn parse_short(
        bytes: &[u8],
        mut ph: PacketHeader,
        short_cid_len: usize,
    ) -> Result<PacketHeader, HeaderError> {
        let length = bytes.len();
        ph.pc = PacketContext::Application;

        if length < 1 + short_cid_len {
            ph.ptype = PacketType::Error;
            ph.offset = length;
            return Ok(ph);
        }

        ph.dest_cid = parse_cid(&bytes[1..], short_cid_len)?;
        ph.offset = 1 + short_cid_len;
        ph.epoch = Epoch::OneRtt;
        // Key phase and spin only become meaningful once a connection with a
        // supported version claims the segment; the dispatcher flips
        // `has_spin_bit` at that point.
        ph.ptype = PacketType::OneRttPhi0;
        ph.spin = bytes[0] & SPIN_BIT != 0;
        ph.pn_offset = ph.offset;
        ph.payload_length = length - ph.offset;
        Ok(ph)
    }

    /// Number of wire bytes this segment occupies in its datagram
    pub(crate) fn segment_length(&self) -> usize {
        self.offset + self.payload_length
    }
}

fn parse_cid(bytes: &[u8], len: usize) -> Result<ConnectionId, HeaderError> {
    if len > MAX_CID_SIZE {
        return Err(HeaderError::Malformed("illegal connection id length"));
    }
    if bytes.len() < len {
        return Err(HeaderError::Malformed("connection id longer than packet"));
    }
    Ok(ConnectionId::new(&bytes[..len]))
}

fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut buf = bytes;
    let before = buf.len();
    let x = varint::read(&mut buf)?;
    Some((x, before - buf.len()))
}

/// Reconstruct a 64-bit packet number from its truncated wire form
///
/// `mask` covers the bits that were not transmitted. Among the three
/// candidates (the expected high bits with the truncated value, and that
/// value one roll earlier or later), the reconstruction picks the one closest
/// to `highest + 1`; an exact tie resolves to the earlier roll only when the
/// truncated bits are non-zero.
pub(crate) fn packet_number_64(highest: u64, mask: u64, pn: u32) -> u64 {
    let expected = highest.wrapping_add(1);
    let not_mask_plus_one = (!mask).wrapping_add(1);
    let mut pn64 = (expected & mask) | u64::from(pn);

    if pn64 < expected {
        let delta1 = expected - pn64;
        let delta2 = not_mask_plus_one.wrapping_sub(delta1);
        if delta2 < delta1 {
            pn64 = pn64.wrapping_add(not_mask_plus_one);
        }
    } else {
        let delta1 = pn64 - expected;
        let delta2 = not_mask_plus_one.wrapping_sub(delta1);
        if delta2 <= delta1 && (pn64 & mask) > 0 {
            // Out of sequence packet from the previous roll
            pn64 = pn64.wrapping_sub(not_mask_plus_one);
        }
    }

    pn64
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::PacketType::*;
        f.write_str(match self {
            VersionNegotiation => "version negotiation",
            Initial => "initial",
            ZeroRtt => "0-rtt protected",
            Handshake => "handshake",
            Retry => "retry",
            OneRttPhi0 => "1-rtt phi0",
            OneRttPhi1 => "1-rtt phi1",
            Error => "error",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::BufMutExt;
    use crate::VERSION;

    fn long_header(first: u8, version: u32, dcid: &[u8], scid: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(first);
        buf.extend_from_slice(&version.to_be_bytes());
        buf.push(dcid.len() as u8);
        buf.extend_from_slice(dcid);
        buf.push(scid.len() as u8);
        buf.extend_from_slice(scid);
        buf
    }

    #[test]
    fn pn64_near_expected() {
        // Window of 16 bits transmitted
        let mask = 0xFFFF_FFFF_FFFF_0000;
        assert_eq!(packet_number_64(0xa7ff, mask, 0xa800), 0xa800);
        assert_eq!(packet_number_64(0xa800, mask, 0xa7ff), 0xa7ff);
        // Next roll
        assert_eq!(packet_number_64(0xffff, mask, 0x0001), 0x1_0001);
        // Previous roll
        assert_eq!(packet_number_64(0x1_0001, mask, 0xffff), 0xffff);
    }

    #[test]
    fn pn64_round_trip_within_window() {
        // decode(highest, mask, pn64 & !mask) == pn64 whenever pn64 is within
        // half a roll of highest + 1
        for shift in [8u32, 16, 24, 32] {
            let mask: u64 = (!0u64) << shift;
            let half = (!mask + 1) / 2;
            for highest in [0u64, 0xfe, 0xffff, 0x1_0000, 0xDEAD_BEEF] {
                let expected = highest + 1;
                let lo = expected.saturating_sub(half - 1);
                let hi = expected + half - 1;
                for pn64 in [lo, expected, expected + 7, hi] {
                    let truncated = (pn64 & !mask) as u32;
                    assert_eq!(
                        packet_number_64(highest, mask, truncated),
                        pn64,
                        "highest {:x} shift {} pn64 {:x}",
                        highest,
                        shift,
                        pn64
                    );
                }
            }
        }
    }

    #[test]
    fn pn64_tie_break() {
        let mask = 0xFFFF_FFFF_FFFF_FF00;
        // Candidate exactly half a roll above expected with masked bits set:
        // the previous roll wins
        assert_eq!(packet_number_64(0xff, mask, 0x80), 0x80);
        // Same distance, but stepping back would clear the masked bits:
        // the candidate stands
        assert_eq!(packet_number_64(0x1f, mask, 0xa0), 0xa0);
    }

    #[test]
    fn fixed_bit_clear_is_error() {
        let bytes = [0x00u8; 32];
        let ph = PacketHeader::parse(&bytes, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::Error);
        assert_eq!(ph.offset, bytes.len());
        assert_eq!(ph.payload_length, 0);
    }

    #[test]
    fn parse_initial() {
        let dcid = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let scid = [0x63, 0x62];
        let mut buf = long_header(0xc3, VERSION, &dcid, &scid);
        buf.write_var(0); // token length
        buf.write_var(32); // payload length
        buf.extend_from_slice(&[0u8; 36]);

        let ph = PacketHeader::parse(&buf, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::Initial);
        assert_eq!(ph.pc, PacketContext::Initial);
        assert_eq!(ph.epoch, Epoch::Initial);
        assert_eq!(&ph.dest_cid[..], &dcid[..]);
        assert_eq!(&ph.srce_cid[..], &scid[..]);
        assert_eq!(ph.token_length, 0);
        assert_eq!(ph.payload_length, 32);
        assert_eq!(ph.pn_offset, ph.offset);
        assert!(!ph.has_spin_bit);
    }

    #[test]
    fn parse_initial_with_token() {
        let mut buf = long_header(0xc0, VERSION, &[1; 8], &[2; 4]);
        buf.write_var(16);
        buf.extend_from_slice(&[0xaa; 16]);
        buf.write_var(8);
        buf.extend_from_slice(&[0u8; 8]);

        let ph = PacketHeader::parse(&buf, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::Initial);
        assert_eq!(ph.token_length, 16);
        assert_eq!(&buf[ph.token_offset..ph.token_offset + 16], &[0xaa; 16]);
    }

    #[test]
    fn parse_version_negotiation() {
        let mut buf = long_header(0xc0, 0, &[1, 2, 3, 4], &[9, 8]);
        buf.extend_from_slice(&VERSION.to_be_bytes());

        let ph = PacketHeader::parse(&buf, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::VersionNegotiation);
        assert_eq!(ph.pc, PacketContext::Initial);
        assert_eq!(ph.payload_length, 4);
    }

    #[test]
    fn unsupported_version_keeps_cids() {
        let mut buf = long_header(0xc0, 0xCAFE_BABE, &[0, 1, 2, 3], &[0x10, 0x11]);
        buf.write_var(8);
        buf.extend_from_slice(&[0u8; 8]);

        let ph = PacketHeader::parse(&buf, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::Error);
        assert_eq!(ph.version_index, None);
        assert_eq!(ph.version, 0xCAFE_BABE);
        assert_eq!(&ph.dest_cid[..], &[0, 1, 2, 3]);
        assert_eq!(&ph.srce_cid[..], &[0x10, 0x11]);
    }

    #[test]
    fn oversized_payload_length_is_error() {
        let mut buf = long_header(0xe0, VERSION, &[1; 8], &[]);
        buf.write_var(1000); // far past the end of the segment
        buf.extend_from_slice(&[0u8; 8]);

        let ph = PacketHeader::parse(&buf, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::Error);
    }

    #[test]
    fn parse_short() {
        let mut buf = vec![0x40 | SPIN_BIT];
        buf.extend_from_slice(&[7; 8]);
        buf.extend_from_slice(&[0u8; 24]);

        let ph = PacketHeader::parse(&buf, 8).unwrap();
        assert_eq!(ph.ptype, PacketType::OneRttPhi0);
        assert_eq!(ph.pc, PacketContext::Application);
        assert_eq!(ph.epoch, Epoch::OneRtt);
        assert_eq!(&ph.dest_cid[..], &[7; 8]);
        assert_eq!(ph.offset, 9);
        assert_eq!(ph.payload_length, 24);
        assert!(ph.spin);
    }

    #[test]
    fn underruns() {
        assert!(PacketHeader::parse(&[], 8).is_err());
        assert!(PacketHeader::parse(&[0xc0, 0, 0], 8).is_err());
        // Destination CID overruns the packet
        let buf = [0xc0, 0xff, 0, 0, 0x1d, 14, 0, 0];
        assert!(PacketHeader::parse(&buf, 8).is_err());
    }
}
