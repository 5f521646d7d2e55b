//! Fragment bitmap accounting and the compress/decompress step functions
//! that splice a fragment header into an IPHC-compressed datagram when it
//! doesn't fit a single frame.

use crate::frame::{AddrField, Frame};
use crate::sixlo::context::ContextTable;
use crate::sixlo::headers::{self, CompressError, Ipv6Header, IPV6_HEADER_LEN, MAX_DATAGRAM_LEN};
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

/// IANA protocol number for the IPv6 Fragment Header; used as the inline
/// next-header value in the IPHC header when a fragment header follows.
pub const NEXT_HEADER_FRAGMENT: u8 = 44;

/// Dispatch pattern (top 5 bits) for a spliced fragment header, disjoint
/// from the IPHC dispatch (`011xxxxx`) so a receiver can always tell a
/// continuation fragment from a datagram's first frame.
const FRAG_DISPATCH: u8 = 0b11100;

const BITMAP_BYTES: usize = (MAX_DATAGRAM_LEN + 7) / 8 / 8 + 1;

/// Tracks, for a datagram of length `L`, which of its `ceil(L/8)` 8-byte
/// chunks have been transmitted (tx side) or received (rx side).
#[derive(Clone)]
pub struct FragmentBitmap {
    bits: Vec<u8, BITMAP_BYTES>,
    num_bits: usize,
}

impl FragmentBitmap {
    pub fn new(datagram_len: usize) -> Self {
        let num_bits = (datagram_len + 7) / 8;
        let num_bytes = (num_bits + 7) / 8;
        let mut bits = Vec::new();
        for _ in 0..num_bytes {
            bits.push(0).ok();
        }
        FragmentBitmap { bits, num_bits }
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn capacity_bytes(&self) -> usize {
        self.num_bits * 8
    }

    pub fn is_set(&self, bit: usize) -> bool {
        if bit >= self.num_bits {
            return false;
        }
        self.bits[bit / 8] & (1 << (bit % 8)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        if bit < self.num_bits {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn set_range(&mut self, lo: usize, hi: usize) {
        for b in lo..hi {
            self.set(b);
        }
    }

    pub fn popcount(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn all_set(&self) -> bool {
        self.popcount() as usize == self.num_bits
    }

    pub fn first_unset_bit(&self) -> Option<usize> {
        (0..self.num_bits).find(|&b| !self.is_set(b))
    }
}

/// The spliced fragment header: `{next-header, offset (8-octet units),
/// last-fragment flag, 32-bit tag}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragHeader {
    pub last_fragment: bool,
    pub next_header: u8,
    pub offset_8: u16,
    pub tag: u32,
}

impl FragHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0] = (FRAG_DISPATCH << 3) | if self.last_fragment { 0x04 } else { 0 };
        b[1] = self.next_header;
        let off = self.offset_8 & 0x1fff;
        LittleEndian::write_u16(&mut b[2..4], off);
        LittleEndian::write_u32(&mut b[4..8], self.tag);
        b
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < Self::LEN {
            return None;
        }
        if buf[0] >> 3 != FRAG_DISPATCH {
            return None;
        }
        let last_fragment = buf[0] & 0x04 != 0;
        let next_header = buf[1];
        let offset_8 = LittleEndian::read_u16(&buf[2..4]) & 0x1fff;
        let tag = LittleEndian::read_u32(&buf[4..8]);
        Some((
            FragHeader {
                last_fragment,
                next_header,
                offset_8,
                tag,
            },
            Self::LEN,
        ))
    }
}

/// Compresses as much of `datagram` as fits into `frame`'s remaining
/// payload capacity, given the shared `bitmap` tracking which chunks have
/// already been sent. Returns the count of bytes newly represented by
/// this call.
pub fn compress(
    datagram: &[u8],
    link_src: AddrField,
    link_dst: AddrField,
    ctx: &ContextTable,
    bitmap: &mut FragmentBitmap,
    tag: u32,
    frame: &mut Frame,
) -> Result<usize, CompressError> {
    if datagram.len() > MAX_DATAGRAM_LEN {
        return Err(CompressError::DatagramTooLarge);
    }
    let tail_start = IPV6_HEADER_LEN;
    let next_header = datagram[6];
    let mut newly_set = 0u32;

    // Bit 4 (byte range [32,40)) is the last of the 5 bits covering the
    // 40-byte base header; set only once the header has been emitted.
    if !bitmap.is_set(4) {
        let hdr = Ipv6Header::from_bytes(datagram).ok_or(CompressError::Truncated)?;
        let base_encoded = headers::encode(&hdr, link_src, link_dst, ctx)?;
        let free_now = crate::frame::MAX_PAYLOAD_LEN - frame.payload.len();
        let remaining_after_header = datagram.len() - tail_start;
        let need_frag = remaining_after_header > free_now.saturating_sub(base_encoded.len());

        let encoded = if need_frag {
            let mut hdr2 = hdr;
            hdr2.next_header = NEXT_HEADER_FRAGMENT;
            headers::encode(&hdr2, link_src, link_dst, ctx)?
        } else {
            base_encoded
        };
        frame.payload_append(&encoded).map_err(|_| CompressError::Truncated)?;
        bitmap.set_range(0, tail_start / 8);
        newly_set += (tail_start / 8) as u32;

        if need_frag {
            newly_set += append_frag_and_data(frame, bitmap, datagram, tail_start, tail_start / 8, next_header, tag)?;
        } else {
            let rest = &datagram[tail_start..];
            frame.payload_append(rest).map_err(|_| CompressError::Truncated)?;
            let end_bit = bitmap.num_bits();
            bitmap.set_range(tail_start / 8, end_bit);
            newly_set += (end_bit - tail_start / 8) as u32;
        }
    } else {
        let start_bit = bitmap.first_unset_bit().ok_or(CompressError::Truncated)?;
        newly_set += append_frag_and_data(frame, bitmap, datagram, start_bit * 8, start_bit, next_header, tag)?;
    }

    let overestimate = if bitmap.all_set() {
        bitmap.capacity_bytes() - datagram.len()
    } else {
        0
    };
    Ok((newly_set as usize) * 8 - overestimate)
}

fn append_frag_and_data(
    frame: &mut Frame,
    bitmap: &mut FragmentBitmap,
    datagram: &[u8],
    start_byte: usize,
    start_bit: usize,
    next_header: u8,
    tag: u32,
) -> Result<u32, CompressError> {
    let free_now = crate::frame::MAX_PAYLOAD_LEN - frame.payload.len();
    if free_now <= FragHeader::LEN {
        return Err(CompressError::Truncated);
    }
    let max_chunks = (free_now - FragHeader::LEN) / 8;
    let chunks_remaining = (datagram.len() - start_byte + 7) / 8;
    let n = max_chunks.min(chunks_remaining);
    if n == 0 {
        return Err(CompressError::Truncated);
    }
    let last_fragment = n == chunks_remaining;
    let fh = FragHeader {
        last_fragment,
        next_header,
        offset_8: start_bit as u16,
        tag,
    };
    frame.payload_append(&fh.encode()).map_err(|_| CompressError::Truncated)?;
    let end = core::cmp::min(start_byte + n * 8, datagram.len());
    frame.payload_append(&datagram[start_byte..end]).map_err(|_| CompressError::Truncated)?;
    bitmap.set_range(start_bit, start_bit + n);
    Ok(n as u32)
}

/// Accumulates incoming fragments of a single datagram into a
/// reassembly buffer.
pub struct Reassembly {
    buf: Vec<u8, MAX_DATAGRAM_LEN>,
    bitmap: FragmentBitmap,
    known_total: Option<usize>,
}

impl Reassembly {
    pub fn new() -> Self {
        let mut buf = Vec::new();
        for _ in 0..MAX_DATAGRAM_LEN {
            buf.push(0).ok();
        }
        Reassembly {
            buf,
            bitmap: FragmentBitmap::new(MAX_DATAGRAM_LEN),
            known_total: None,
        }
    }

    fn reset(&mut self) {
        self.bitmap = FragmentBitmap::new(MAX_DATAGRAM_LEN);
        self.known_total = None;
    }

    /// Feeds one received frame's decompression payload through
    /// reassembly. Returns the completed datagram once every chunk has
    /// arrived.
    pub fn decompress(
        &mut self,
        payload: &[u8],
        link_src: AddrField,
        link_dst: AddrField,
        ctx: &ContextTable,
    ) -> Result<Option<Vec<u8, MAX_DATAGRAM_LEN>>, CompressError> {
        if payload.is_empty() {
            return Err(CompressError::MissingDispatch);
        }

        if payload[0] >> 5 == 0b011 {
            let (hdr, consumed) = headers::decode(payload, link_src, link_dst, ctx)?;
            let rest = &payload[consumed..];
            let mut hdr_bytes = hdr.to_bytes();

            if hdr.next_header == NEXT_HEADER_FRAGMENT {
                let (fh, n2) = FragHeader::decode(rest).ok_or(CompressError::Truncated)?;
                hdr_bytes[6] = fh.next_header;
                self.buf[0..IPV6_HEADER_LEN].copy_from_slice(&hdr_bytes);
                self.bitmap.set_range(0, IPV6_HEADER_LEN / 8);
                let data = &rest[n2..];
                let start = fh.offset_8 as usize * 8;
                self.place(start, data);
                if fh.last_fragment {
                    self.known_total = Some(start + data.len());
                }
            } else {
                self.buf[0..IPV6_HEADER_LEN].copy_from_slice(&hdr_bytes);
                self.bitmap.set_range(0, IPV6_HEADER_LEN / 8);
                self.place(IPV6_HEADER_LEN, rest);
                self.known_total = Some(IPV6_HEADER_LEN + rest.len());
            }
        } else if payload[0] >> 3 == FRAG_DISPATCH {
            let (fh, n) = FragHeader::decode(payload).ok_or(CompressError::Truncated)?;
            let data = &payload[n..];
            let start = fh.offset_8 as usize * 8;
            self.place(start, data);
            if fh.last_fragment {
                self.known_total = Some(start + data.len());
            }
        } else {
            return Err(CompressError::MissingDispatch);
        }

        if let Some(total) = self.known_total {
            let needed_bits = (total + 7) / 8;
            if (0..needed_bits).all(|b| self.bitmap.is_set(b)) {
                // `headers::decode` always reports payload_length as 0 since
                // it can't know the fragmentable tail's length; patch it in
                // now that reassembly has determined the true total.
                let payload_len = (total - IPV6_HEADER_LEN) as u16;
                self.buf[4..6].copy_from_slice(&payload_len.to_be_bytes());

                let mut out: Vec<u8, MAX_DATAGRAM_LEN> = Vec::new();
                out.extend_from_slice(&self.buf[0..total]).ok();
                self.reset();
                return Ok(Some(out));
            }
        }
        Ok(None)
    }

    fn place(&mut self, start: usize, data: &[u8]) {
        let end = core::cmp::min(start + data.len(), self.buf.len());
        self.buf[start..end].copy_from_slice(&data[..end - start]);
        let lo_bit = start / 8;
        let hi_bit = (end + 7) / 8;
        self.bitmap.set_range(lo_bit, hi_bit);
    }
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::FrameType;

    #[test]
    fn bitmap_accounting_matches_s2_shape() {
        // 200-byte datagram, 80 bytes free capacity per call.
        let datagram_len = 200;
        let mut bitmap = FragmentBitmap::new(datagram_len);
        assert_eq!(bitmap.num_bits(), 25);

        bitmap.set_range(0, 10);
        assert_eq!(bitmap.popcount(), 10);
        bitmap.set_range(10, 20);
        bitmap.set_range(20, 25);
        assert!(bitmap.all_set());
        assert_eq!(bitmap.popcount() as usize * 8 - (bitmap.capacity_bytes() - datagram_len), 200);
    }

    #[test]
    fn frag_header_round_trips() {
        let fh = FragHeader {
            last_fragment: true,
            next_header: 17,
            offset_8: 5,
            tag: 0xdead_beef,
        };
        let enc = fh.encode();
        let (dec, n) = FragHeader::decode(&enc).unwrap();
        assert_eq!(n, FragHeader::LEN);
        assert_eq!(dec, fh);
    }

    #[test]
    fn compress_decompress_round_trip_small() {
        let mut datagram = [0u8; 80];
        let hdr = Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 40,
            next_header: 17,
            hop_limit: 64,
            src: headers::V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            dst: headers::V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
        };
        datagram[0..40].copy_from_slice(&hdr.to_bytes());
        for (i, b) in datagram[40..80].iter_mut().enumerate() {
            *b = i as u8;
        }

        let ctx = ContextTable::new();
        let mut bitmap = FragmentBitmap::new(datagram.len());
        let mut frame = Frame::init_as(FrameType::Data);
        let n = compress(&datagram, AddrField::None, AddrField::None, &ctx, &mut bitmap, 1, &mut frame).unwrap();
        assert_eq!(n, 80);
        assert!(bitmap.all_set());

        let mut reassembly = Reassembly::new();
        let out = reassembly
            .decompress(&frame.payload, AddrField::None, AddrField::None, &ctx)
            .unwrap()
            .expect("single frame completes the datagram");
        assert_eq!(&out[..], &datagram[..]);
    }

    #[test]
    fn compress_decompress_round_trip_fragmented() {
        let mut datagram = [0u8; 200];
        let hdr = Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 160,
            next_header: 17,
            hop_limit: 64,
            src: headers::V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            dst: headers::V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
        };
        datagram[0..40].copy_from_slice(&hdr.to_bytes());
        for (i, b) in datagram[40..200].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let ctx = ContextTable::new();
        let mut bitmap = FragmentBitmap::new(datagram.len());
        let mut reassembly = Reassembly::new();
        let mut total = 0usize;
        let mut completed = None;

        for _ in 0..10 {
            if bitmap.all_set() {
                break;
            }
            // Pad the frame's payload to leave only a 60-byte budget for
            // the compressor, forcing several fragments.
            let mut limited = Frame::init_as(FrameType::Fragment);
            for _ in 0..(crate::frame::MAX_PAYLOAD_LEN - 60) {
                limited.payload.push(0xaa).ok();
            }
            let pre_len = limited.payload.len();
            let n = compress(&datagram, AddrField::None, AddrField::None, &ctx, &mut bitmap, 7, &mut limited).unwrap();
            total += n;
            let produced = &limited.payload[pre_len..];
            let out = reassembly
                .decompress(produced, AddrField::None, AddrField::None, &ctx)
                .unwrap();
            if let Some(d) = out {
                completed = Some(d);
            }
        }

        assert_eq!(total, 200);
        let completed = completed.expect("datagram should complete");
        assert_eq!(&completed[..], &datagram[..]);
    }
}
