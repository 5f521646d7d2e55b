//! `Node`: the single owned aggregate wiring the TSCH link layer, the
//! 6LoWPAN compression/fragmentation layer, and the location engine
//! together, `tick()`-driven by an external caller holding the one
//! instance — mirroring the teacher's top-level `Mac` shape.

use crate::addr::Address;
use crate::frame::{AddrField, Frame, FrameType};
use crate::location::beacon::{self, BeaconState};
use crate::location::geometry::{self, Vec3};
use crate::location::protocol::{self, BeaconFrame, LocationUpdate};
use crate::location::{LocConfig, LocationEngine};
use crate::log::warn;
use crate::mac::pool::FramePool;
use crate::mac::scheduler::LinkKind;
use crate::mac::tsch::{Tsch, TschConfig, TschEvent};
use crate::sixlo::{Ipv6Header, SixLo, SixLoConfig, SixLoError, MAX_DATAGRAM_LEN};
use heapless::Vec as HVec;
use rand_core::RngCore;

#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    pub tsch: TschConfig,
    pub sixlo: SixLoConfig,
    pub loc: LocConfig,
    /// Slotframe length location cells are scheduled against, used to
    /// derive `(dir, slot)` from the current ASN.
    pub loc_sf_length: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            tsch: TschConfig::default(),
            sixlo: SixLoConfig::default(),
            loc: LocConfig::default(),
            loc_sf_length: 32,
        }
    }
}

/// Observable counters, following the teacher's `MacStats` shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeStats {
    pub frame_drops: u32,
    pub collisions: u32,
    pub pool_exhausted: u32,
    pub compress_failures: u32,
    pub solver_skips: u32,
    pub sync_losses: u32,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Node {
    addr: Address,
    tsch: Tsch,
    sixlo: SixLo,
    loc: LocationEngine,
    beacon: BeaconState,
    inbox: FramePool,
    stats: NodeStats,
    loc_sf_length: u16,
    rx_clock_offset: f32,
}

impl Node {
    pub fn new(cfg: NodeConfig, addr: Address) -> Self {
        Node {
            addr,
            tsch: Tsch::new(cfg.tsch, addr),
            sixlo: SixLo::new(cfg.sixlo),
            loc: LocationEngine::new(cfg.loc),
            beacon: BeaconState::new(),
            inbox: FramePool::new(),
            stats: NodeStats::new(),
            loc_sf_length: cfg.loc_sf_length,
            rx_clock_offset: 0.0,
        }
    }

    pub fn beacon_index(&self) -> u8 {
        self.beacon.index
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn location(&self) -> Option<Vec3> {
        self.loc.position()
    }

    pub fn tsch(&self) -> &Tsch {
        &self.tsch
    }

    /// The root node of the mesh skips ranging and declares itself at
    /// the lattice origin, becoming the first prime beacon.
    pub fn start_root(&mut self) {
        self.loc.start_root();
    }

    pub fn start_locating(&mut self) {
        self.loc.start();
    }

    /// Queues an IPv6 datagram for transmission. Per the error-handling
    /// design, a rejection here (already one queued) is returned to the
    /// caller rather than silently dropped, since queuing is a
    /// synchronous, caller-visible operation unlike per-slot radio
    /// conditions.
    pub fn send(&mut self, dst: AddrField, hdr: &Ipv6Header, data: &[u8]) -> Result<(), SixLoError> {
        self.sixlo.transmit(dst, hdr, data)
    }

    /// Polls for a fully reassembled inbound datagram. Drains the
    /// receive inbox oldest-first; frames that don't complete a
    /// datagram on their own are absorbed into `sixlo`'s reassembly
    /// table and this returns `None` until the rest arrive.
    pub fn recv_callback(&mut self) -> Option<HVec<u8, MAX_DATAGRAM_LEN>> {
        while let Some(frame) = self.inbox.pop_oldest() {
            match self.sixlo.receive(frame.src_addr, frame.dst_addr, &frame.payload) {
                Ok(Some(datagram)) => return Some(datagram),
                Ok(None) => continue,
                Err(_) => {
                    self.stats.compress_failures += 1;
                    continue;
                }
            }
        }
        None
    }

    /// Services one scheduler slot: link-layer traffic, or a dedicated
    /// location cell, depending on what the scheduler says is active.
    /// No error crosses this boundary — transient radio conditions are
    /// folded into counters instead.
    pub fn tick<R: crate::radio_cap::RadioCap>(&mut self, radio: &mut R, rng: &mut impl RngCore) {
        self.loc.tick();

        let active_kind = self.tsch.peek_next_link();

        if active_kind == Some(LinkKind::Loc) {
            // `tick()` itself won't run since the location engine handles
            // this slot directly, but the ASN must still advance in lock
            // step with every other node's scheduler.
            let asn = self.tsch.scheduler_mut().tick().0;
            let (dir, slot) = geometry::dir_slot_from_asn(asn, self.loc_sf_length);
            match self.run_loc_cell(radio, dir, slot) {
                Ok(mut update) => {
                    if let Some(i) = update.this_offset {
                        if update.conflicts & (1 << i) != 0 {
                            self.beacon.backoff_fail();
                        } else {
                            self.beacon.backoff_success();
                        }
                    }
                    self.loc.on_cell(&mut update, self.rx_clock_offset);
                }
                Err(_) => self.stats.frame_drops += 1,
            }
            self.run_beacon_maintenance();
            return;
        }

        let mut candidate = None;
        if matches!(active_kind, Some(LinkKind::Tx) | Some(LinkKind::Shared)) && self.sixlo.tx_pending() {
            let mut frame = Frame::init_as(FrameType::Data);
            match self.sixlo.poll_tx(AddrField::Extended(self.addr), &mut frame) {
                Ok(Some(dst)) => {
                    frame.set_addresses(dst, AddrField::Extended(self.addr));
                    candidate = Some(frame);
                }
                Ok(None) => {}
                Err(_) => self.stats.compress_failures += 1,
            }
        }

        match self.tsch.tick(radio, rng, candidate.as_ref(), self.beacon.is_beacon()) {
            Ok(TschEvent::Received(frame)) => self.handle_received(frame),
            Ok(TschEvent::ScanTimedOut) => self.stats.sync_losses += 1,
            Ok(TschEvent::DistanceMeasured { peer, ticks }) => {
                let metres = crate::location::solvers::ticks_to_metres(ticks as i32, self.rx_clock_offset).abs();
                if let Some((_, record)) = self.loc.neighbors().iter().find(|(_, r)| r.addr == peer) {
                    self.loc.ranging_result(record.location, metres);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("tick: radio error folded into collision count");
                let _ = e;
                self.stats.collisions += 1;
            }
        }

        self.run_beacon_maintenance();
    }

    fn handle_received(&mut self, frame: Frame) {
        if frame.frame_type != FrameType::Data {
            return;
        }
        if self.inbox.len() >= crate::mac::pool::POOL_SIZE {
            self.stats.pool_exhausted += 1;
        }
        self.inbox.alloc(frame);
    }

    /// Re-evaluates this node's lattice index after every cell: claims or
    /// relinquishes a prime slot once positioned, or picks a join target
    /// while still searching.
    fn run_beacon_maintenance(&mut self) {
        if self.beacon.backoff > 1 {
            self.beacon.backoff -= 1;
            return;
        }
        match self.loc.position() {
            Some(pos) => {
                let ideal = geometry::quantize(pos);
                let ideal_index = geometry::index_from_point(ideal);
                let occupant_pos = self.loc.neighbors().get(ideal_index).map(|r| r.location);
                if let Some(new_index) = beacon::optimize_beacons(pos, self.loc.neighbors(), self.beacon.index, occupant_pos) {
                    self.beacon.force_index(new_index);
                }
            }
            None => {
                if let Some(index) = beacon::join_beacons(self.loc.neighbors()) {
                    self.beacon.force_index(index);
                }
            }
        }
    }

    /// Drives one six-offset location cell directly over the radio:
    /// this node's own assigned offset (if any) transmits a position
    /// beacon, every other offset listens, and arrival timestamps are
    /// folded into prime-relative adjacency as they come in.
    fn run_loc_cell<R: crate::radio_cap::RadioCap>(&mut self, radio: &mut R, dir: u8, slot: u8) -> Result<LocationUpdate, R::Error> {
        use crate::radio_cap::RadioTick;

        let this_offset = geometry::beacon_offset(self.beacon.index, dir, slot);
        let mut update = LocationUpdate::new(dir, slot, this_offset);

        let own_pos = self.loc.position().unwrap_or(Vec3::ZERO);

        for offset in 0..=6u8 {
            let at = RadioTick::new((offset as u64) * (protocol::LOC_GRID_LENGTH_US as u64) * crate::radio_cap::TICKS_PER_US);
            let is_final_retransmit = offset == 6;
            let transmits_here = this_offset == Some(offset) || (is_final_retransmit && this_offset == Some(0));

            if transmits_here {
                let mut heard = [protocol::HeardTuple::default(); 6];
                for (k, entry) in heard.iter_mut().enumerate() {
                    if let Some(seen) = update.new_neighbors[k] {
                        let tstamp = if update.adj(0, k) { update.tstamp(0, k) } else { 0 };
                        *entry = protocol::HeardTuple { addr: seen.addr, tstamp };
                    }
                }
                let bf = BeaconFrame {
                    class: 128,
                    dir,
                    slot,
                    offset,
                    pos: own_pos,
                    r: 0.0,
                    theta: 0.0,
                    neighborhood: 0,
                    heard,
                };
                let mut buf = [0u8; protocol::BEACON_FRAME_LEN];
                if let Some(n) = bf.encode(&mut buf) {
                    let mut outer = Frame::init_as(FrameType::Data);
                    outer.set_addresses(AddrField::None, AddrField::Extended(self.addr));
                    let _ = outer.payload_append(&buf[..n]);
                    let mut wire = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
                    let wn = outer.encode(&mut wire, false).unwrap_or(0);
                    radio.write_tx(&wire, 0, wn)?;
                    radio.write_tx_fctrl(0, wn)?;
                    radio.schedule_tx(at)?;
                    let _ = radio.wait_event(protocol::LOC_GRID_LENGTH_US)?;
                    self.beacon.mark_transmitted(slot, dir);
                }
            } else {
                radio.schedule_rx(at)?;
                radio.set_rx_timeout(protocol::LOC_GRID_LENGTH_US)?;
                let status = radio.wait_event(protocol::LOC_GRID_LENGTH_US)?;
                if status.is_rx_ok() {
                    let n = radio.read_rx_finfo()?;
                    let mut buf = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
                    let n = n.min(buf.len());
                    radio.read_rx(&mut buf, 0, n)?;
                    let rx_tick = radio.read_rx_timestamp()?;
                    if let Ok(outer) = Frame::parse(&buf[..n], true) {
                        if let Some(bf) = BeaconFrame::decode(&outer.payload) {
                            self.fold_loc_offset(&mut update, offset, &outer, &bf, rx_tick);
                        }
                    }
                } else {
                    self.stats.frame_drops += 1;
                }
            }
        }

        Ok(update)
    }

    fn fold_loc_offset(&mut self, update: &mut LocationUpdate, offset: u8, outer: &Frame, bf: &BeaconFrame, rx_tick: crate::radio_cap::RadioTick) {
        let addr = match outer.src_addr {
            AddrField::Extended(a) => a,
            _ => return,
        };

        if offset == 0 {
            update.new_neighbors[0] = Some(crate::location::SeenNeighbor {
                addr,
                pos: bf.pos,
                hyperspace: None,
                neighborhood: bf.neighborhood,
            });
            update.new_neighborhood |= 1;
        } else if offset < 6 {
            update.new_neighbors[offset as usize] = Some(crate::location::SeenNeighbor {
                addr,
                pos: bf.pos,
                hyperspace: None,
                neighborhood: bf.neighborhood,
            });
            update.new_neighborhood |= 1 << offset;
            update.set_adj(0, offset as usize);
            update.set_tstamp(0, offset as usize, rx_tick.raw() as i32);
        } else {
            update.new_neighborhood |= 1 << 6;
            // Every offset already heard from by this node (including its
            // own transmission slot) is adjacent to the final prime
            // re-transmit, not just this node's own row, so the TDOA
            // pseudorange path has timestamps to work with for any
            // listening node, not only the one that happened to transmit.
            for i in 1..=5usize {
                if update.adj(0, i) || update.this_offset == Some(i as u8) {
                    update.set_adj(i, 6);
                    update.set_tstamp(i, 6, rx_tick.raw() as i32);
                }
            }
        }

        // Fold the transmitter's own "heard" report into our conflict
        // bitmap: if it claims a different address at an offset than the
        // one we have on record for that offset, mark the offset as
        // contested so beacon backoff can react.
        for (k, tuple) in bf.heard.iter().enumerate() {
            if tuple.addr == Address::default() {
                continue;
            }
            if let Some(seen) = update.new_neighbors[k] {
                if seen.addr != tuple.addr {
                    update.conflicts |= 1 << k;
                }
            }
        }
    }

    /// Reports the measured round-trip distance to the prime beacon for
    /// an in-progress TOA ranging (`measuring-dist` state's
    /// `dist-measured` event).
    pub fn dist_measured_callback(&mut self, d0_metres: f32) {
        self.loc.dist_measured(d0_metres);
    }

    /// Schedules a single-sided two-way ranging exchange with `peer` on
    /// the next shared slot. Returns `false` if no shared link exists or
    /// its queue is already full; the resulting distance, if any, surfaces
    /// later through `tick()`'s `TschEvent::DistanceMeasured` handling.
    pub fn measure_distance(&mut self, peer: Address) -> bool {
        let mut frame = Frame::init_as(FrameType::Data);
        frame.set_addresses(AddrField::Extended(peer), AddrField::Extended(self.addr));
        self.tsch.queue_on_shared_link(frame)
    }
}
