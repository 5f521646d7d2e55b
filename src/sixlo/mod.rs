//! IPv6 header compression and fragmentation, providing an IP-shaped
//! interface above the link layer: IPv6 addressing, header compression,
//! and datagram fragmentation/reassembly.

pub mod context;
pub mod frag;
pub mod headers;

pub use context::{ContextError, ContextTable};
pub use frag::{FragHeader, FragmentBitmap, Reassembly, NEXT_HEADER_FRAGMENT};
pub use headers::{CompressError, Ipv6Header, V6Addr, IPV6_HEADER_LEN, MAX_DATAGRAM_LEN};

use crate::frame::{AddrField, Frame};
use crate::log::{debug, error, trace};
use heapless::Vec;

/// Number of peers that may have a reassembly in progress at once. A
/// fixed array of slots, not a `Vec`, since `heapless::Vec` at this
/// version only offers `swap_remove`, not arbitrary-position removal.
const MAX_REASSEMBLY_PEERS: usize = 4;

#[derive(Clone, PartialEq, Debug)]
pub struct SixLoConfig {
    /// Starting fragmentation tag; bumped on every new outgoing datagram.
    pub start_tag: u32,
}

impl Default for SixLoConfig {
    fn default() -> Self {
        Self { start_tag: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SixLoError {
    Compress(CompressError),
    NoTxSlot,
    TxInProgress,
}

impl From<CompressError> for SixLoError {
    fn from(e: CompressError) -> Self {
        SixLoError::Compress(e)
    }
}

struct TxState {
    dst: AddrField,
    datagram: Vec<u8, MAX_DATAGRAM_LEN>,
    bitmap: FragmentBitmap,
    tag: u32,
}

/// Compression and fragmentation above the link layer. Owns the address
/// context table, the single outstanding transmit datagram (if any), and
/// a small table of in-progress reassemblies keyed by source address.
pub struct SixLo {
    cfg: SixLoConfig,
    ctx: ContextTable,
    next_tag: u32,
    tx: Option<TxState>,
    rx: [Option<(AddrField, Reassembly)>; MAX_REASSEMBLY_PEERS],
}

impl SixLo {
    pub fn new(cfg: SixLoConfig) -> Self {
        let next_tag = cfg.start_tag;
        SixLo {
            cfg,
            ctx: ContextTable::new(),
            next_tag,
            tx: None,
            rx: [None, None, None, None],
        }
    }

    pub fn set_context(&mut self, id: u8, prefix: [u8; 8]) -> Result<(), ContextError> {
        self.ctx.set(id, prefix)
    }

    pub fn remove_context(&mut self, id: u8) -> Result<(), ContextError> {
        self.ctx.remove(id)
    }

    /// Queues a datagram for transmission. Fails if a previous datagram
    /// hasn't finished draining yet.
    pub fn transmit(&mut self, dst: AddrField, hdr: &Ipv6Header, data: &[u8]) -> Result<(), SixLoError> {
        if self.tx.is_some() {
            return Err(SixLoError::TxInProgress);
        }
        let mut datagram: Vec<u8, MAX_DATAGRAM_LEN> = Vec::new();
        datagram.extend_from_slice(&hdr.to_bytes()).map_err(|_| CompressError::DatagramTooLarge)?;
        datagram.extend_from_slice(data).map_err(|_| CompressError::DatagramTooLarge)?;

        let bitmap = FragmentBitmap::new(datagram.len());
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        trace!("queued {} byte datagram for tx, tag {}", datagram.len(), tag);
        self.tx = Some(TxState { dst, datagram, bitmap, tag });
        Ok(())
    }

    /// True while a queued datagram is still being drained into frames.
    pub fn tx_pending(&self) -> bool {
        self.tx.is_some()
    }

    /// Fills as much of `frame`'s remaining payload as possible with the
    /// next chunk of the pending datagram, returning the destination the
    /// frame should be sent to once filled. Returns `None` if nothing was
    /// pending.
    pub fn poll_tx(&mut self, link_src: AddrField, frame: &mut Frame) -> Result<Option<AddrField>, SixLoError> {
        let state = match &mut self.tx {
            Some(s) => s,
            None => return Ok(None),
        };

        let n = frag::compress(
            &state.datagram,
            link_src,
            state.dst,
            &self.ctx,
            &mut state.bitmap,
            state.tag,
            frame,
        )?;
        debug!("compressed {} bytes into frame, {} total covered", n, state.bitmap.popcount() * 8);

        let dst = state.dst;
        if state.bitmap.all_set() {
            trace!("tx datagram tag {} fully drained", state.tag);
            self.tx = None;
        }
        Ok(Some(dst))
    }

    /// Feeds a received frame payload through decompression/reassembly,
    /// returning a completed datagram once all fragments from `src` have
    /// arrived.
    pub fn receive(
        &mut self,
        src: AddrField,
        link_dst: AddrField,
        payload: &[u8],
    ) -> Result<Option<Vec<u8, MAX_DATAGRAM_LEN>>, SixLoError> {
        let idx = match self.rx.iter().position(|slot| matches!(slot, Some((a, _)) if *a == src)) {
            Some(i) => i,
            None => {
                let free = self.rx.iter().position(|slot| slot.is_none()).unwrap_or_else(|| {
                    // Every slot busy: evict slot 0's stalled peer rather
                    // than let it starve everyone else.
                    0
                });
                self.rx[free] = Some((src, Reassembly::new()));
                free
            }
        };

        let (_, reassembly) = self.rx[idx].as_mut().expect("slot just populated");
        let result = reassembly.decompress(payload, src, link_dst, &self.ctx);
        match result {
            Ok(Some(datagram)) => {
                self.rx[idx] = None;
                Ok(Some(datagram))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                error!("reassembly from {:?} failed: {:?}", src, e);
                self.rx[idx] = None;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::FrameType;

    fn sample_header(len: u16) -> Ipv6Header {
        Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_length: len,
            next_header: 17,
            hop_limit: 64,
            src: V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            dst: V6Addr([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]),
        }
    }

    #[test]
    fn small_datagram_drains_in_one_frame() {
        let mut sixlo = SixLo::new(SixLoConfig::default());
        let data = [0xabu8; 32];
        let hdr = sample_header(32);
        sixlo.transmit(AddrField::None, &hdr, &data).unwrap();
        assert!(sixlo.tx_pending());

        let mut frame = Frame::init_as(FrameType::Data);
        let dst = sixlo.poll_tx(AddrField::None, &mut frame).unwrap();
        assert!(dst.is_some());
        assert!(!sixlo.tx_pending());

        let mut peer = SixLo::new(SixLoConfig::default());
        let out = peer.receive(AddrField::None, AddrField::None, &frame.payload).unwrap();
        let out = out.expect("single frame should complete reassembly");
        assert_eq!(out.len(), 40 + 32);
    }

    #[test]
    fn second_transmit_rejected_while_pending() {
        let mut sixlo = SixLo::new(SixLoConfig::default());
        let hdr = sample_header(500);
        let data = [0u8; 500];
        sixlo.transmit(AddrField::None, &hdr, &data).unwrap();
        assert_eq!(sixlo.transmit(AddrField::None, &hdr, &data), Err(SixLoError::TxInProgress));
    }
}
