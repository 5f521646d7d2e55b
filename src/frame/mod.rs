//! Link-layer frame codec.
//!
//! Wire layout (all multi-byte fields little-endian): frame-control word
//! (2 bytes), sequence number (1 byte), destination address (0/2/8
//! bytes), source address (0/2/8 bytes), header-IE chain terminated by
//! the `HT2_IE` sentinel, payload, 2-byte trailing FCS (written by the
//! radio, not by this codec).

pub mod ie;

pub use ie::{Ie, IeIter, IE_TYPE_HT2, IE_TYPE_SYNC, IE_TYPE_TRESP};

use crate::addr::{Address, ShortAddress};
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

pub const MAX_PAYLOAD_LEN: usize = 118;
pub const MAX_IES: usize = 4;
pub const FCS_LEN: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    Beacon,
    Data,
    Ack,
    MultiPurpose,
    Fragment,
    Extended,
}

impl FrameType {
    fn to_bits(self) -> u8 {
        match self {
            FrameType::Beacon => 0,
            FrameType::Data => 1,
            FrameType::Ack => 2,
            FrameType::MultiPurpose => 3,
            FrameType::Fragment => 4,
            FrameType::Extended => 5,
        }
    }

    fn from_bits(b: u8) -> Option<Self> {
        Some(match b {
            0 => FrameType::Beacon,
            1 => FrameType::Data,
            2 => FrameType::Ack,
            3 => FrameType::MultiPurpose,
            4 => FrameType::Fragment,
            5 => FrameType::Extended,
            _ => return None,
        })
    }
}

/// A destination or source address field, sized per the frame's
/// addr-mode bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrField {
    None,
    Short(ShortAddress),
    Extended(Address),
}

impl AddrField {
    fn mode_bits(&self) -> u8 {
        match self {
            AddrField::None => 0b00,
            AddrField::Short(_) => 0b10,
            AddrField::Extended(_) => 0b11,
        }
    }

    fn from_mode(mode: u8) -> Result<AddrLen, DecodeError> {
        match mode {
            0b00 => Ok(AddrLen::None),
            0b10 => Ok(AddrLen::Short),
            0b11 => Ok(AddrLen::Extended),
            _ => Err(DecodeError::InvalidAddrMode),
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            AddrField::None => 0,
            AddrField::Short(_) => 2,
            AddrField::Extended(_) => 8,
        }
    }
}

enum AddrLen {
    None,
    Short,
    Extended,
}

impl AddrLen {
    fn byte_len(&self) -> usize {
        match self {
            AddrLen::None => 0,
            AddrLen::Short => 2,
            AddrLen::Extended => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    InvalidAddrMode,
    InvalidFrameType,
    TooLong,
}

/// A decoded/to-be-encoded link-layer frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub security_enabled: bool,
    pub frame_pending: bool,
    pub ack_request: bool,
    pub intra_pan: bool,
    pub frame_version: u8,
    pub seq: u8,
    pub dst_addr: AddrField,
    pub src_addr: AddrField,
    pub ies: Vec<Ie, MAX_IES>,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl Frame {
    pub fn init_as(frame_type: FrameType) -> Self {
        Frame {
            frame_type,
            security_enabled: false,
            frame_pending: false,
            ack_request: !matches!(frame_type, FrameType::Ack),
            intra_pan: true,
            frame_version: 1,
            seq: 0,
            dst_addr: AddrField::None,
            src_addr: AddrField::None,
            ies: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn set_sequence_number(&mut self, n: u8) {
        self.seq = n;
    }

    pub fn set_addresses(&mut self, dest: AddrField, src: AddrField) {
        self.dst_addr = dest;
        self.src_addr = src;
    }

    pub fn append_ie(&mut self, header_bit: bool, ie_type: u8, content: &[u8]) -> Result<(), DecodeError> {
        let ie = Ie::new(header_bit, ie_type, content).ok_or(DecodeError::TooLong)?;
        self.ies.push(ie).map_err(|_| DecodeError::TooLong)
    }

    pub fn payload_append(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        self.payload.extend_from_slice(bytes).map_err(|_| DecodeError::TooLong)
    }

    pub fn iter_ies(&self) -> core::slice::Iter<'_, Ie> {
        self.ies.iter()
    }

    fn frame_control(&self) -> u16 {
        let mut w: u16 = 0;
        w |= self.frame_type.to_bits() as u16;
        if self.security_enabled {
            w |= 1 << 3;
        }
        if self.frame_pending {
            w |= 1 << 4;
        }
        if self.ack_request {
            w |= 1 << 5;
        }
        if self.intra_pan {
            w |= 1 << 6;
        }
        w |= (self.dst_addr.mode_bits() as u16) << 10;
        w |= ((self.frame_version & 0b11) as u16) << 12;
        w |= (self.src_addr.mode_bits() as u16) << 14;
        w
    }

    /// Encodes the frame into `buf`. When `write_footer` is set, two
    /// placeholder bytes for the radio-computed FCS are appended. Returns
    /// the number of bytes written.
    pub fn encode(&self, buf: &mut [u8], write_footer: bool) -> Result<usize, DecodeError> {
        let mut off = 0usize;
        let fctrl = self.frame_control();
        let mut fctrl_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut fctrl_bytes, fctrl);
        put(buf, &mut off, &fctrl_bytes)?;
        put(buf, &mut off, &[self.seq])?;

        match self.dst_addr {
            AddrField::None => {}
            AddrField::Short(a) => put(buf, &mut off, &a.0)?,
            AddrField::Extended(a) => put(buf, &mut off, &a.0)?,
        }
        match self.src_addr {
            AddrField::None => {}
            AddrField::Short(a) => put(buf, &mut off, &a.0)?,
            AddrField::Extended(a) => put(buf, &mut off, &a.0)?,
        }

        for ie in self.ies.iter() {
            let rest = buf.get_mut(off..).ok_or(DecodeError::TooLong)?;
            let n = ie.encode(rest).ok_or(DecodeError::TooLong)?;
            off += n;
        }
        let rest = buf.get_mut(off..).ok_or(DecodeError::TooLong)?;
        let n = Ie::terminator().encode(rest).ok_or(DecodeError::TooLong)?;
        off += n;

        put(buf, &mut off, &self.payload)?;

        if write_footer {
            put(buf, &mut off, &[0u8; FCS_LEN])?;
        }

        Ok(off)
    }

    /// Parses a frame from `buf`. When `contains_footer` is set, the
    /// trailing 2-byte FCS is stripped before parsing the body. Parsing
    /// is tolerant of truncation: a header that cannot be fully read
    /// stops parsing and the frame is reported unusable.
    pub fn parse(buf: &[u8], contains_footer: bool) -> Result<Self, DecodeError> {
        let body = if contains_footer {
            buf.get(..buf.len().checked_sub(FCS_LEN).ok_or(DecodeError::Truncated)?)
                .ok_or(DecodeError::Truncated)?
        } else {
            buf
        };

        let mut off = 0usize;
        let fctrl = LittleEndian::read_u16(take(body, &mut off, 2)?);

        let frame_type = FrameType::from_bits((fctrl & 0b111) as u8).ok_or(DecodeError::InvalidFrameType)?;
        let security_enabled = fctrl & (1 << 3) != 0;
        let frame_pending = fctrl & (1 << 4) != 0;
        let ack_request = fctrl & (1 << 5) != 0;
        let intra_pan = fctrl & (1 << 6) != 0;
        let dst_mode = ((fctrl >> 10) & 0b11) as u8;
        let frame_version = ((fctrl >> 12) & 0b11) as u8;
        let src_mode = ((fctrl >> 14) & 0b11) as u8;

        let seq = take(body, &mut off, 1)?[0];

        let dst_addr = read_addr(body, &mut off, AddrField::from_mode(dst_mode)?)?;
        let src_addr = read_addr(body, &mut off, AddrField::from_mode(src_mode)?)?;

        let mut ies = Vec::new();
        loop {
            let (ie, n) = Ie::decode(&body[off..]).ok_or(DecodeError::Truncated)?;
            off += n;
            if ie.ie_type == IE_TYPE_HT2 {
                break;
            }
            ies.push(ie).map_err(|_| DecodeError::TooLong)?;
        }

        let mut payload = Vec::new();
        payload.extend_from_slice(&body[off..]).map_err(|_| DecodeError::TooLong)?;

        Ok(Frame {
            frame_type,
            security_enabled,
            frame_pending,
            ack_request,
            intra_pan,
            frame_version,
            seq,
            dst_addr,
            src_addr,
            ies,
            payload,
        })
    }
}

fn put(buf: &mut [u8], off: &mut usize, bytes: &[u8]) -> Result<(), DecodeError> {
    let end = *off + bytes.len();
    let dst = buf.get_mut(*off..end).ok_or(DecodeError::TooLong)?;
    dst.copy_from_slice(bytes);
    *off = end;
    Ok(())
}

fn take<'a>(buf: &'a [u8], off: &mut usize, n: usize) -> Result<&'a [u8], DecodeError> {
    let end = *off + n;
    let s = buf.get(*off..end).ok_or(DecodeError::Truncated)?;
    *off = end;
    Ok(s)
}

fn read_addr(buf: &[u8], off: &mut usize, len: AddrLen) -> Result<AddrField, DecodeError> {
    Ok(match len {
        AddrLen::None => AddrField::None,
        AddrLen::Short => {
            let b = take(buf, off, len.byte_len())?;
            AddrField::Short(ShortAddress([b[0], b[1]]))
        }
        AddrLen::Extended => {
            let b = take(buf, off, len.byte_len())?;
            let mut a = [0u8; 8];
            a.copy_from_slice(b);
            AddrField::Extended(Address(a))
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Frame {
        let mut f = Frame::init_as(FrameType::Data);
        f.set_sequence_number(42);
        f.set_addresses(
            AddrField::Extended(Address::from_u64(0xdead_beef_0000_0001)),
            AddrField::Extended(Address::from_u64(0x0000_0000_0000_0002)),
        );
        f.append_ie(true, IE_TYPE_SYNC, &7u64.to_le_bytes()).unwrap();
        f.payload_append(&[1, 2, 3, 4, 5]).unwrap();
        f
    }

    #[test]
    fn round_trip() {
        let f = sample();
        let mut buf = [0u8; 128];
        let n = f.encode(&mut buf, true).unwrap();
        let parsed = Frame::parse(&buf[..n], true).unwrap();
        assert_eq!(parsed, f);
    }

    #[test]
    fn short_addressing_round_trips() {
        let mut f = Frame::init_as(FrameType::Beacon);
        f.set_addresses(AddrField::Short(ShortAddress::BROADCAST), AddrField::None);
        let mut buf = [0u8; 32];
        let n = f.encode(&mut buf, false).unwrap();
        let parsed = Frame::parse(&buf[..n], false).unwrap();
        assert_eq!(parsed.dst_addr, AddrField::Short(ShortAddress::BROADCAST));
        assert_eq!(parsed.src_addr, AddrField::None);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let f = sample();
        let mut buf = [0u8; 128];
        let n = f.encode(&mut buf, true).unwrap();
        assert!(Frame::parse(&buf[..n - 3], true).is_err());
    }

    #[test]
    fn ack_defaults_no_ack_request() {
        let f = Frame::init_as(FrameType::Ack);
        assert!(!f.ack_request);
    }
}
