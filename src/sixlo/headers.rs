//! IPv6 header compression (IPHC) per the 6LoWPAN-style dispatch used by
//! this stack. The bit layout mirrors draft-ietf-6lowpan-hc: dispatch
//! `011`, then TF/NH/HLIM in the first byte and CID/SAC/SAM/M/DAC/DAM in
//! the second.

use crate::addr::{Address, ShortAddress};
use crate::frame::AddrField;
use crate::sixlo::context::ContextTable;
use core::fmt;

pub const IPV6_HEADER_LEN: usize = 40;
pub const MAX_DATAGRAM_LEN: usize = 1280;

const DISPATCH_IPHC: u8 = 0b011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressError {
    MissingContext,
    MissingDispatch,
    NextHeaderCompressionUnsupported,
    DatagramTooLarge,
    Truncated,
}

/// A raw 16-byte IPv6 address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct V6Addr(pub [u8; 16]);

impl V6Addr {
    pub const UNSPECIFIED: V6Addr = V6Addr([0u8; 16]);

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] == 0xff
    }

    pub fn prefix64(&self) -> [u8; 8] {
        let mut p = [0u8; 8];
        p.copy_from_slice(&self.0[0..8]);
        p
    }

    pub fn iid64(&self) -> [u8; 8] {
        let mut p = [0u8; 8];
        p.copy_from_slice(&self.0[8..16]);
        p
    }

    pub fn from_prefix_and_iid(prefix: [u8; 8], iid: [u8; 8]) -> Self {
        let mut b = [0u8; 16];
        b[0..8].copy_from_slice(&prefix);
        b[8..16].copy_from_slice(&iid);
        V6Addr(b)
    }

    /// Derives a modified-EUI-64 interface identifier from an 8-byte
    /// extended link-layer address (universal/local bit inverted).
    pub fn iid_from_extended(addr: Address) -> [u8; 8] {
        let mut b = addr.0;
        b[0] ^= 0x02;
        b
    }

    /// Derives the RFC4944-style IID for a 2-byte short link-layer
    /// address: `0000:00ff:fe00:XXXX`.
    pub fn iid_from_short(addr: ShortAddress) -> [u8; 8] {
        [0, 0, 0, 0xff, 0xfe, 0, addr.0[0], addr.0[1]]
    }

    pub fn iid_from_link_addr(addr: AddrField) -> [u8; 8] {
        match addr {
            AddrField::Extended(a) => Self::iid_from_extended(a),
            AddrField::Short(a) => Self::iid_from_short(a),
            AddrField::None => [0u8; 8],
        }
    }
}

impl fmt::Debug for V6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V6Addr(")?;
        self.fmt_compact(f)?;
        write!(f, ")")
    }
}

impl fmt::Display for V6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_compact(f)
    }
}

impl V6Addr {
    fn fmt_compact(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..8 {
            if i != 0 {
                write!(f, ":")?;
            }
            let word = ((self.0[2 * i] as u16) << 8) | self.0[2 * i + 1] as u16;
            write!(f, "{:x}", word)?;
        }
        Ok(())
    }
}

/// The uncompressed 40-byte IPv6 base header.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: V6Addr,
    pub dst: V6Addr,
}

impl Ipv6Header {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < IPV6_HEADER_LEN {
            return None;
        }
        let word0 = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let traffic_class = ((word0 >> 20) & 0xff) as u8;
        let flow_label = word0 & 0x000f_ffff;
        let payload_length = u16::from_be_bytes([b[4], b[5]]);
        let next_header = b[6];
        let hop_limit = b[7];
        let mut src = [0u8; 16];
        src.copy_from_slice(&b[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&b[24..40]);
        Some(Ipv6Header {
            traffic_class,
            flow_label,
            payload_length,
            next_header,
            hop_limit,
            src: V6Addr(src),
            dst: V6Addr(dst),
        })
    }

    pub fn to_bytes(&self) -> [u8; IPV6_HEADER_LEN] {
        let mut b = [0u8; IPV6_HEADER_LEN];
        let word0: u32 = (6 << 28) | ((self.traffic_class as u32) << 20) | (self.flow_label & 0x000f_ffff);
        b[0..4].copy_from_slice(&word0.to_be_bytes());
        b[4..6].copy_from_slice(&self.payload_length.to_be_bytes());
        b[6] = self.next_header;
        b[7] = self.hop_limit;
        b[8..24].copy_from_slice(&self.src.0);
        b[24..40].copy_from_slice(&self.dst.0);
        b
    }

    fn ecn(&self) -> u8 {
        self.traffic_class & 0b11
    }

    fn dscp(&self) -> u8 {
        self.traffic_class >> 2
    }
}

/// Encodes the IPHC dispatch + compressed fields for `hdr` into `out`,
/// given the link-layer source/destination and the context table.
pub fn encode(
    hdr: &Ipv6Header,
    link_src: AddrField,
    link_dst: AddrField,
    ctx: &ContextTable,
) -> Result<heapless::Vec<u8, 48>, CompressError> {
    let mut out: heapless::Vec<u8, 48> = heapless::Vec::new();

    // TF: 00 = full (4B), 01 = FL only (3B), 10 = TC only (1B), 11 = elided.
    let tf: u8 = if hdr.flow_label == 0 && hdr.traffic_class == 0 {
        0b11
    } else if hdr.dscp() == 0 && hdr.flow_label != 0 {
        0b01
    } else if hdr.flow_label == 0 {
        0b10
    } else {
        0b00
    };

    // Next-header compression is not supported by this core.
    let nh: u8 = 0;

    let hlim: u8 = match hdr.hop_limit {
        1 => 0b01,
        64 => 0b10,
        255 => 0b11,
        _ => 0b00,
    };

    let byte0 = (DISPATCH_IPHC << 5) | (tf << 3) | (nh << 2) | hlim;
    out.push(byte0).map_err(|_| CompressError::Truncated)?;

    let src_prefix = hdr.src.prefix64();
    let src_ctx = ctx.find(&src_prefix);
    let sac = hdr.src.is_unspecified() || src_ctx.is_some();
    let (sam, src_inline): (u8, heapless::Vec<u8, 16>) = address_mode(hdr.src, sac, link_src, false)?;

    let dst_prefix = hdr.dst.prefix64();
    let m = hdr.dst.is_multicast();
    let dst_ctx = ctx.find(&dst_prefix);
    let dac = !m && dst_ctx.is_some();
    let (dam, dst_inline): (u8, heapless::Vec<u8, 16>) = if m {
        multicast_mode(hdr.dst)?
    } else {
        address_mode(hdr.dst, dac, link_dst, true)?
    };

    let cid = src_ctx.unwrap_or(0) != 0 || (dac && dst_ctx.unwrap_or(0) != 0);

    let byte1 =
        ((cid as u8) << 7) | ((sac as u8) << 6) | (sam << 4) | ((m as u8) << 3) | ((dac as u8) << 2) | dam;
    out.push(byte1).map_err(|_| CompressError::Truncated)?;

    if cid {
        let sci = src_ctx.unwrap_or(0) & 0xf;
        let dci = if dac { dst_ctx.unwrap_or(0) & 0xf } else { 0 };
        out.push((sci << 4) | dci).map_err(|_| CompressError::Truncated)?;
    }

    match tf {
        0b00 => {
            let word = ((hdr.ecn() as u32) << 30) | ((hdr.dscp() as u32) << 24) | (hdr.flow_label & 0x000f_ffff);
            out.extend_from_slice(&word.to_be_bytes()).map_err(|_| CompressError::Truncated)?;
        }
        0b01 => {
            let word = ((hdr.ecn() as u32) << 30) | (hdr.flow_label & 0x000f_ffff);
            let b = word.to_be_bytes();
            out.extend_from_slice(&b[0..3]).map_err(|_| CompressError::Truncated)?;
        }
        0b10 => {
            out.push(hdr.traffic_class).map_err(|_| CompressError::Truncated)?;
        }
        _ => {}
    }

    out.push(hdr.next_header).map_err(|_| CompressError::Truncated)?;
    out.push(hdr.hop_limit).map_err(|_| CompressError::Truncated)?;

    out.extend_from_slice(&src_inline).map_err(|_| CompressError::Truncated)?;
    out.extend_from_slice(&dst_inline).map_err(|_| CompressError::Truncated)?;

    Ok(out)
}

/// Stateless/stateful address-mode selection for a unicast address,
/// returning `(SAM/DAM bits, inline bytes)`.
fn address_mode(
    addr: V6Addr,
    stateful: bool,
    link: AddrField,
    is_dest: bool,
) -> Result<(u8, heapless::Vec<u8, 16>), CompressError> {
    let v: heapless::Vec<u8, 16> = heapless::Vec::new();
    if stateful && addr.is_unspecified() && !is_dest {
        return Ok((0b00, v));
    }
    let iid = addr.iid64();
    let link_iid = V6Addr::iid_from_link_addr(link);
    if iid == link_iid {
        return Ok((0b11, v));
    }
    let mut v: heapless::Vec<u8, 16> = heapless::Vec::new();
    // 16-bit form: upper 48 bits of IID are the well-known short-address padding.
    if iid[0..6] == [0, 0, 0, 0xff, 0xfe, 0] {
        v.extend_from_slice(&iid[6..8]).map_err(|_| CompressError::Truncated)?;
        return Ok((0b10, v));
    }
    v.extend_from_slice(&iid).map_err(|_| CompressError::Truncated)?;
    Ok((0b01, v))
}

fn multicast_mode(addr: V6Addr) -> Result<(u8, heapless::Vec<u8, 16>), CompressError> {
    let b = addr.0;
    let mut v: heapless::Vec<u8, 16> = heapless::Vec::new();
    if b[1] == 0x02 && b[2..15] == [0u8; 13] {
        v.push(b[15]).map_err(|_| CompressError::Truncated)?;
        return Ok((0b11, v));
    }
    if b[2..13] == [0u8; 11] {
        v.push(b[1]).map_err(|_| CompressError::Truncated)?;
        v.push(b[13]).map_err(|_| CompressError::Truncated)?;
        v.extend_from_slice(&b[14..16]).map_err(|_| CompressError::Truncated)?;
        return Ok((0b10, v));
    }
    if b[2..11] == [0u8; 9] {
        v.push(b[1]).map_err(|_| CompressError::Truncated)?;
        v.push(b[11]).map_err(|_| CompressError::Truncated)?;
        v.extend_from_slice(&b[12..16]).map_err(|_| CompressError::Truncated)?;
        return Ok((0b01, v));
    }
    v.extend_from_slice(&b).map_err(|_| CompressError::Truncated)?;
    Ok((0b00, v))
}

/// Decodes an IPHC header from `buf`, returning the reconstructed
/// header and the number of bytes consumed. `payload_length` on the
/// returned header is left at 0 — the caller fills it in once the
/// fragmentable tail is known.
pub fn decode(
    buf: &[u8],
    link_src: AddrField,
    link_dst: AddrField,
    ctx: &ContextTable,
) -> Result<(Ipv6Header, usize), CompressError> {
    if buf.len() < 2 {
        return Err(CompressError::Truncated);
    }
    if buf[0] >> 5 != DISPATCH_IPHC {
        return Err(CompressError::MissingDispatch);
    }
    let tf = (buf[0] >> 3) & 0b11;
    let nh = (buf[0] >> 2) & 0b1;
    let hlim_bits = buf[0] & 0b11;
    if nh != 0 {
        return Err(CompressError::NextHeaderCompressionUnsupported);
    }

    let cid = buf[1] & 0x80 != 0;
    let sac = buf[1] & 0x40 != 0;
    let sam = (buf[1] >> 4) & 0b11;
    let m = buf[1] & 0x08 != 0;
    let dac = buf[1] & 0x04 != 0;
    let dam = buf[1] & 0b11;

    let mut off = 2usize;
    let (sci, dci) = if cid {
        let b = *buf.get(off).ok_or(CompressError::Truncated)?;
        off += 1;
        (b >> 4, b & 0xf)
    } else {
        (0, 0)
    };

    let (ecn, dscp, flow_label, byte_used) = match tf {
        0b00 => {
            let w = buf.get(off..off + 4).ok_or(CompressError::Truncated)?;
            let v = u32::from_be_bytes([w[0], w[1], w[2], w[3]]);
            ((v >> 30) as u8, ((v >> 24) & 0x3f) as u8, v & 0x000f_ffff, 4)
        }
        0b01 => {
            let w = buf.get(off..off + 3).ok_or(CompressError::Truncated)?;
            let v = u32::from_be_bytes([w[0], w[1], w[2], 0]);
            ((v >> 30) as u8, 0, (v >> 8) & 0x000f_ffff, 3)
        }
        0b10 => {
            let b = *buf.get(off).ok_or(CompressError::Truncated)?;
            (b & 0b11, b >> 2, 0, 1)
        }
        _ => (0, 0, 0, 0),
    };
    off += byte_used;
    let traffic_class = (dscp << 2) | ecn;

    let next_header = *buf.get(off).ok_or(CompressError::Truncated)?;
    off += 1;
    let hop_limit = match hlim_bits {
        0b01 => 1,
        0b10 => 64,
        0b11 => 255,
        _ => {
            let b = *buf.get(off).ok_or(CompressError::Truncated)?;
            off += 1;
            b
        }
    };

    let src_prefix = if sac {
        if sam == 0b00 {
            [0u8; 8]
        } else {
            ctx.get(sci).ok_or(CompressError::MissingContext)?
        }
    } else {
        crate::sixlo::context::LINK_LOCAL_PREFIX
    };

    let (src, n) = reconstruct_addr(&buf[off..], sam, sac, src_prefix, link_src)?;
    off += n;

    let (dst, n) = if m {
        reconstruct_multicast(&buf[off..], dam)?
    } else {
        let dst_prefix = if dac {
            ctx.get(dci).ok_or(CompressError::MissingContext)?
        } else {
            crate::sixlo::context::LINK_LOCAL_PREFIX
        };
        reconstruct_addr(&buf[off..], dam, dac, dst_prefix, link_dst)?
    };
    off += n;

    Ok((
        Ipv6Header {
            traffic_class,
            flow_label,
            payload_length: 0,
            next_header,
            hop_limit,
            src,
            dst,
        },
        off,
    ))
}

fn reconstruct_addr(
    buf: &[u8],
    mode: u8,
    stateful: bool,
    prefix: [u8; 8],
    link: AddrField,
) -> Result<(V6Addr, usize), CompressError> {
    match mode {
        0b00 if stateful => Ok((V6Addr::UNSPECIFIED, 0)),
        0b00 => {
            let b = buf.get(0..16).ok_or(CompressError::Truncated)?;
            let mut a = [0u8; 16];
            a.copy_from_slice(b);
            Ok((V6Addr(a), 16))
        }
        0b01 => {
            let b = buf.get(0..8).ok_or(CompressError::Truncated)?;
            let mut iid = [0u8; 8];
            iid.copy_from_slice(b);
            Ok((V6Addr::from_prefix_and_iid(prefix, iid), 8))
        }
        0b10 => {
            let b = buf.get(0..2).ok_or(CompressError::Truncated)?;
            let iid = [0, 0, 0, 0xff, 0xfe, 0, b[0], b[1]];
            Ok((V6Addr::from_prefix_and_iid(prefix, iid), 2))
        }
        0b11 => {
            let iid = V6Addr::iid_from_link_addr(link);
            Ok((V6Addr::from_prefix_and_iid(prefix, iid), 0))
        }
        _ => unreachable!(),
    }
}

fn reconstruct_multicast(buf: &[u8], dam: u8) -> Result<(V6Addr, usize), CompressError> {
    let mut b = [0u8; 16];
    match dam {
        0b11 => {
            let x = *buf.first().ok_or(CompressError::Truncated)?;
            b[0] = 0xff;
            b[1] = 0x02;
            b[15] = x;
            Ok((V6Addr(b), 1))
        }
        0b10 => {
            let s = buf.get(0..4).ok_or(CompressError::Truncated)?;
            b[0] = 0xff;
            b[1] = s[0];
            b[13] = s[1];
            b[14] = s[2];
            b[15] = s[3];
            Ok((V6Addr(b), 4))
        }
        0b01 => {
            let s = buf.get(0..6).ok_or(CompressError::Truncated)?;
            b[0] = 0xff;
            b[1] = s[0];
            b[11] = s[1];
            b[12] = s[2];
            b[13] = s[3];
            b[14] = s[4];
            b[15] = s[5];
            Ok((V6Addr(b), 6))
        }
        0b00 => {
            let s = buf.get(0..16).ok_or(CompressError::Truncated)?;
            b.copy_from_slice(s);
            Ok((V6Addr(b), 16))
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Address;

    fn link_local(last: u8) -> V6Addr {
        let mut a = [0u8; 16];
        a[0] = 0xfe;
        a[1] = 0x80;
        a[15] = last;
        V6Addr(a)
    }

    fn address_with_iid(iid: [u8; 8]) -> Address {
        let mut a = iid;
        a[0] ^= 0x02;
        Address(a)
    }

    #[test]
    fn s1_dispatch_byte_matches_spec_example() {
        let hdr = Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 40,
            next_header: 17,
            hop_limit: 64,
            src: link_local(1),
            dst: link_local(2),
        };
        let ctx = ContextTable::new();
        let link_src = AddrField::Extended(address_with_iid(hdr.src.iid64()));
        let link_dst = AddrField::Extended(address_with_iid(hdr.dst.iid64()));

        let out = encode(&hdr, link_src, link_dst, &ctx).unwrap();
        assert_eq!(out[0], 0x7A);
    }

    #[test]
    fn round_trip_inline_addresses() {
        let hdr = Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 40,
            next_header: 17,
            hop_limit: 64,
            src: V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            dst: V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
        };
        let ctx = ContextTable::new();
        let out = encode(&hdr, AddrField::None, AddrField::None, &ctx).unwrap();
        let (decoded, n) = decode(&out, AddrField::None, AddrField::None, &ctx).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(decoded.src, hdr.src);
        assert_eq!(decoded.dst, hdr.dst);
        assert_eq!(decoded.next_header, hdr.next_header);
        assert_eq!(decoded.hop_limit, hdr.hop_limit);
    }

    #[test]
    fn multicast_short_form_round_trips() {
        let mut dst = [0u8; 16];
        dst[0] = 0xff;
        dst[1] = 0x02;
        dst[15] = 0x01;
        let hdr = Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 0,
            next_header: 58,
            hop_limit: 1,
            src: link_local(9),
            dst: V6Addr(dst),
        };
        let ctx = ContextTable::new();
        let link_src = AddrField::Extended(address_with_iid(hdr.src.iid64()));
        let out = encode(&hdr, link_src, AddrField::None, &ctx).unwrap();
        let (decoded, _) = decode(&out, link_src, AddrField::None, &ctx).unwrap();
        assert_eq!(decoded.dst, hdr.dst);
    }
}
