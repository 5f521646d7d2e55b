//! Time-slotted channel-hopping (TSCH) link-layer engine.
//!
//! Drives one slot at a time: `Idle` kicks off a scan, `Scanning` listens
//! for a neighbor's beacon to adopt its ASN, `Synced` waits out a short
//! settle period, `Connected` services whichever link (tx/rx/shared/
//! advertising) the scheduler says is active this slot, and
//! `Disconnected` falls back to `Idle` to restart the cycle.
//!
//! Unicast traffic on a `Tx` or `Shared` link is ack'd: the receiver
//! turns an ack around after a fixed delay and reports that delay in a
//! `TRESP` IE, so the sender can recover a single-sided two-way-ranging
//! distance estimate from the same exchange that delivered the ack.
//! Broadcast traffic on a `Shared` link has no ack to wait for, so it is
//! flooded instead: re-queued onto the same link for a bounded number of
//! retries to raise the odds every neighbor eventually hears it.

pub mod bayes;

pub use bayes::ContentionEstimator;

use crate::addr::Address;
use crate::frame::{AddrField, Frame, FrameType, Ie};
use crate::log::{debug, info, trace, warn};
use crate::mac::scheduler::{Asn, Deferred, LinkKind, Scheduler};
use crate::radio_cap::{RadioCap, RadioStatus, RadioTick};
use rand_core::RngCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TschState {
    Idle,
    Scanning,
    Synced,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TschConfig {
    /// Number of slots to listen for a beacon before giving up. Counted
    /// in scheduler slots, not wall-clock time.
    pub scan_slot_duration: u32,
    pub slot_len_us: u32,
    pub max_scan_slots: u32,
    /// Settle period after adopting a neighbor's ASN, before trusting the
    /// schedule enough to transmit on it.
    pub synced_to_connected_slots: u32,
    /// Slots to stay quiet after winning a shared slot, giving other
    /// contenders a turn.
    pub cool_off_slots: u32,
    /// How long, in microseconds, a sender waits for an ack after an
    /// ack-requested unicast transmission.
    pub ack_wait_us: u32,
    /// Fixed delay, in radio ticks, between a received frame's rx
    /// timestamp and the ack's scheduled tx timestamp. Known to both
    /// sides, and echoed in the ack's `TRESP` IE for the sender's
    /// two-way-ranging computation.
    pub ack_turnaround_ticks: u32,
    /// Upper bound on how many times a broadcast frame is re-queued onto
    /// its shared link after a successful transmission.
    pub max_flood_retries: u8,
    /// Probability, each idle shared slot, that a beacon-eligible node
    /// transmits an advertisement instead of just listening.
    pub shared_adv_probability: f32,
}

impl Default for TschConfig {
    fn default() -> Self {
        TschConfig {
            scan_slot_duration: 1,
            slot_len_us: 10_000,
            max_scan_slots: 200,
            synced_to_connected_slots: 4,
            cool_off_slots: 3,
            ack_wait_us: 500,
            ack_turnaround_ticks: 1_000,
            max_flood_retries: 3,
            shared_adv_probability: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TschEvent {
    /// Nothing observable happened this slot.
    Silent,
    /// A frame was received and decoded.
    Received(Frame),
    /// A frame was transmitted with no ack expected (broadcast, or an
    /// advertising/beacon slot).
    Sent,
    /// A unicast transmission was ack'd, but the ack carried no usable
    /// ranging turnaround (or the round trip was too short to trust).
    Acked,
    /// A unicast transmission's ack window closed with nothing valid
    /// received.
    NotAcked,
    /// A unicast transmission was ack'd and the exchange yielded a
    /// single-sided two-way-ranging distance estimate, in radio ticks of
    /// flight time (not yet converted to metres — that needs the rx
    /// clock offset, which this layer doesn't track).
    DistanceMeasured { peer: Address, ticks: i64 },
    /// Synchronized to a neighbor's beacon.
    Synced(Asn),
    /// Gave up scanning without finding a neighbor.
    ScanTimedOut,
}

pub struct Tsch {
    state: TschState,
    cfg: TschConfig,
    scheduler: Scheduler,
    contention: ContentionEstimator,
    shared_backoff: Deferred,
    scan_timeout: Deferred,
    synced_slots_elapsed: u32,
    local_addr: Address,
    seq: u8,
    /// Last broadcast frame flooded onto a shared link, and how many
    /// re-queues it has left.
    flood_frame: Option<Frame>,
    flood_retries: u8,
}

impl Tsch {
    pub fn new(cfg: TschConfig, local_addr: Address) -> Self {
        Tsch {
            state: TschState::Idle,
            cfg,
            scheduler: Scheduler::new(),
            contention: ContentionEstimator::new(),
            shared_backoff: Deferred::new(),
            scan_timeout: Deferred::new(),
            synced_slots_elapsed: 0,
            local_addr,
            seq: 0,
            flood_frame: None,
            flood_retries: 0,
        }
    }

    pub fn state(&self) -> TschState {
        self.state
    }

    pub fn asn(&self) -> Asn {
        self.scheduler.asn()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// The link kind that the *next* `tick()` call will service, if the
    /// engine is connected. Lets a caller decide how to prepare for that
    /// slot (e.g. whether to pull a frame for it) before committing to
    /// `tick()`, which only advances the ASN internally once called.
    pub fn peek_next_link(&self) -> Option<LinkKind> {
        if self.state != TschState::Connected {
            return None;
        }
        self.scheduler.peek_link(1).map(|l| l.kind)
    }

    /// Queues `frame` on the first `Shared` link found in any registered
    /// slotframe, for transmission (and, if it's a unicast ack'd frame,
    /// ranging) the next time that link fires. Returns `false` if no
    /// shared link is registered or its queue is already full.
    pub fn queue_on_shared_link(&mut self, frame: Frame) -> bool {
        for link in self.scheduler.links_mut() {
            if link.kind == LinkKind::Shared {
                return link.queue_push(frame).is_ok();
            }
        }
        false
    }

    /// Services one slot. `want_to_send` supplies a frame this node would
    /// like to transmit if the active link permits it (a dedicated `Tx`
    /// link, an `Advertising` slot, or a won `Shared` contention).
    /// `beacon_eligible` marks this node as currently acting as a
    /// location beacon, letting it opportunistically advertise in an
    /// otherwise-idle shared slot.
    pub fn tick<R: RadioCap>(
        &mut self,
        radio: &mut R,
        rng: &mut impl RngCore,
        want_to_send: Option<&Frame>,
        beacon_eligible: bool,
    ) -> Result<TschEvent, R::Error> {
        match self.state {
            TschState::Idle => {
                self.scan_timeout.arm(self.cfg.max_scan_slots);
                self.state = TschState::Scanning;
                trace!("tsch: idle -> scanning");
                Ok(TschEvent::Silent)
            }
            TschState::Scanning => self.run_scan_slot(radio),
            TschState::Synced => {
                self.run_synced_slot();
                Ok(TschEvent::Silent)
            }
            TschState::Connected => {
                self.scheduler.tick();
                self.run_connected_slot(radio, rng, want_to_send, beacon_eligible)
            }
            TschState::Disconnected => {
                info!("tsch: disconnected, restarting scan cycle");
                self.state = TschState::Idle;
                Ok(TschEvent::Silent)
            }
        }
    }

    fn run_scan_slot<R: RadioCap>(&mut self, radio: &mut R) -> Result<TschEvent, R::Error> {
        radio.schedule_rx(RadioTick::new(0))?;
        radio.set_rx_timeout(self.cfg.scan_slot_duration * self.cfg.slot_len_us)?;
        let status = radio.wait_event(self.cfg.scan_slot_duration * self.cfg.slot_len_us)?;

        let timed_out = self.scan_timeout.tick();

        if status.is_rx_ok() {
            let n = radio.read_rx_finfo()?;
            let mut buf = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
            let n = n.min(buf.len());
            radio.read_rx(&mut buf, 0, n)?;

            if let Ok(frame) = Frame::parse(&buf[..n], true) {
                if let Some(asn) = frame.iter_ies().find_map(|ie| ie.sync_asn()) {
                    self.scheduler.sync(Asn(asn));
                    self.state = TschState::Synced;
                    self.synced_slots_elapsed = 0;
                    self.scan_timeout.cancel();
                    info!("tsch: synced to ASN {}", asn);
                    return Ok(TschEvent::Synced(Asn(asn)));
                }
            }
        }

        if timed_out {
            warn!("tsch: scan timed out after {} slots", self.cfg.max_scan_slots);
            self.state = TschState::Disconnected;
            return Ok(TschEvent::ScanTimedOut);
        }

        Ok(TschEvent::Silent)
    }

    fn run_synced_slot(&mut self) {
        self.scheduler.tick();
        self.synced_slots_elapsed += 1;
        if self.synced_slots_elapsed >= self.cfg.synced_to_connected_slots {
            debug!("tsch: synced -> connected");
            self.state = TschState::Connected;
        }
    }

    fn run_connected_slot<R: RadioCap>(
        &mut self,
        radio: &mut R,
        rng: &mut impl RngCore,
        want_to_send: Option<&Frame>,
        beacon_eligible: bool,
    ) -> Result<TschEvent, R::Error> {
        let kind = match self.scheduler.active_link() {
            Some(l) => l.kind,
            None => return Ok(TschEvent::Silent),
        };

        // A frame supplied this slot takes priority; otherwise fall back
        // to whatever is already queued on the active link (a prior
        // flood re-queue, or a frame handed to `queue_on_shared_link`).
        let queued = if want_to_send.is_none() && matches!(kind, LinkKind::Tx | LinkKind::Shared) {
            self.scheduler.active_link_mut().and_then(|l| l.queue_pop())
        } else {
            None
        };
        let frame = want_to_send.cloned().or(queued);

        match kind {
            LinkKind::Tx => match frame {
                Some(f) => self.transmit_and_await_ack(radio, &f),
                None => Ok(TschEvent::Silent),
            },
            LinkKind::Rx => self.receive_slot(radio),
            LinkKind::Advertising => {
                let beacon = self.build_beacon();
                self.radio_tx(radio, &beacon)?;
                self.seq = self.seq.wrapping_add(1);
                Ok(TschEvent::Sent)
            }
            LinkKind::Shared => self.run_shared_slot(radio, rng, frame, beacon_eligible),
            // Driven directly by the location engine, not the link layer.
            LinkKind::Loc => Ok(TschEvent::Silent),
        }
    }

    fn run_shared_slot<R: RadioCap>(
        &mut self,
        radio: &mut R,
        rng: &mut impl RngCore,
        frame: Option<Frame>,
        beacon_eligible: bool,
    ) -> Result<TschEvent, R::Error> {
        if self.shared_backoff.is_armed() {
            self.shared_backoff.tick();
            return Ok(TschEvent::Silent);
        }

        let frame = match frame {
            Some(f) => f,
            None => {
                if beacon_eligible {
                    let draw = (rng.next_u32() as f32) / (u32::MAX as f32);
                    if draw <= self.cfg.shared_adv_probability {
                        let beacon = self.build_beacon();
                        self.radio_tx(radio, &beacon)?;
                        self.seq = self.seq.wrapping_add(1);
                        return Ok(TschEvent::Sent);
                    }
                }
                return self.receive_slot(radio);
            }
        };

        let draw = (rng.next_u32() as f32) / (u32::MAX as f32);
        if draw > self.contention.access_probability() {
            // Lost the contention draw this slot; listen instead.
            return self.receive_slot(radio);
        }

        if Self::is_broadcast(frame.dst_addr) {
            self.radio_tx(radio, &frame)?;
            self.seq = self.seq.wrapping_add(1);
            self.contention.on_success();
            self.shared_backoff.arm(self.cfg.cool_off_slots);

            self.flood_retries = if self.flood_frame.as_ref() == Some(&frame) {
                self.flood_retries.saturating_sub(1)
            } else {
                self.flood_frame = Some(frame.clone());
                self.cfg.max_flood_retries.saturating_sub(1)
            };
            if self.flood_retries == 0 {
                self.flood_frame = None;
            } else if let Some(link) = self.scheduler.active_link_mut() {
                let _ = link.queue_push(frame);
            }
            return Ok(TschEvent::Sent);
        }

        match self.transmit_and_await_ack(radio, &frame) {
            Ok(event @ (TschEvent::Acked | TschEvent::DistanceMeasured { .. })) => {
                self.contention.on_success();
                self.shared_backoff.arm(self.cfg.cool_off_slots);
                Ok(event)
            }
            Ok(event @ TschEvent::NotAcked) => {
                self.contention.on_collision();
                Ok(event)
            }
            other => other,
        }
    }

    fn receive_slot<R: RadioCap>(&mut self, radio: &mut R) -> Result<TschEvent, R::Error> {
        radio.schedule_rx(RadioTick::new(0))?;
        let status = radio.wait_event(self.cfg.slot_len_us)?;

        if !status.is_rx_ok() {
            self.contention.on_hole();
            return Ok(TschEvent::Silent);
        }

        let n = radio.read_rx_finfo()?;
        let mut buf = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
        let n = n.min(buf.len());
        radio.read_rx(&mut buf, 0, n)?;
        let rx_tick = radio.read_rx_timestamp()?;

        let frame = match Frame::parse(&buf[..n], true) {
            Ok(frame) => frame,
            Err(_) => {
                self.contention.on_hole();
                return Ok(TschEvent::Silent);
            }
        };

        let addressed_to_us = matches!(frame.dst_addr, AddrField::Extended(a) if a == self.local_addr);
        if addressed_to_us && frame.ack_request && frame.frame_type != FrameType::Ack {
            if let AddrField::Extended(peer) = frame.src_addr {
                self.send_ack(radio, &frame, peer, rx_tick)?;
            }
        }

        Ok(TschEvent::Received(frame))
    }

    /// Turns an ack around exactly `ack_turnaround_ticks` after `rx_tick`,
    /// carrying that known delay in a `TRESP` IE so the original sender
    /// can back out the flight time from the round trip.
    fn send_ack<R: RadioCap>(&mut self, radio: &mut R, frame: &Frame, peer: Address, rx_tick: RadioTick) -> Result<(), R::Error> {
        let mut ack = Frame::init_as(FrameType::Ack);
        ack.set_sequence_number(frame.seq);
        ack.set_addresses(AddrField::Extended(peer), AddrField::Extended(self.local_addr));
        let _ = ack.ies.push(Ie::tresp(self.cfg.ack_turnaround_ticks));

        let mut buf = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
        let n = ack.encode(&mut buf, false).unwrap_or(0);
        radio.write_tx(&buf, 0, n)?;
        radio.write_tx_fctrl(0, n)?;
        let reply_at = rx_tick.wrapping_add(self.cfg.ack_turnaround_ticks as u64);
        radio.schedule_tx(reply_at)?;
        radio.wait_event(self.cfg.slot_len_us)?;
        Ok(())
    }

    /// Transmits `frame`; if it requests an ack, waits out `ack_wait_us`
    /// for a matching ack and, when the ack carries a `TRESP` turnaround
    /// long enough to trust, reports the single-sided two-way-ranging
    /// flight time.
    fn transmit_and_await_ack<R: RadioCap>(&mut self, radio: &mut R, frame: &Frame) -> Result<TschEvent, R::Error> {
        let peer = match frame.dst_addr {
            AddrField::Extended(a) => Some(a),
            _ => None,
        };

        let tx_tick = self.radio_tx(radio, frame)?;
        self.seq = self.seq.wrapping_add(1);

        let peer = match (frame.ack_request, peer) {
            (true, Some(p)) => p,
            _ => return Ok(TschEvent::Sent),
        };

        radio.schedule_rx(RadioTick::new(0))?;
        radio.set_rx_timeout(self.cfg.ack_wait_us)?;
        let status = radio.wait_event(self.cfg.ack_wait_us)?;
        if !status.is_rx_ok() {
            return Ok(TschEvent::NotAcked);
        }

        let n = radio.read_rx_finfo()?;
        let mut buf = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
        let n = n.min(buf.len());
        radio.read_rx(&mut buf, 0, n)?;
        let rx_tick = radio.read_rx_timestamp()?;

        let ack = match Frame::parse(&buf[..n], true) {
            Ok(f) => f,
            Err(_) => return Ok(TschEvent::NotAcked),
        };
        let from_peer = matches!(ack.src_addr, AddrField::Extended(a) if a == peer);
        if ack.frame_type != FrameType::Ack || ack.seq != frame.seq || !from_peer {
            return Ok(TschEvent::NotAcked);
        }

        let round_trip = rx_tick.diff(tx_tick);
        match ack.iter_ies().find_map(|ie| ie.tresp_duration()) {
            Some(turnaround) if round_trip > turnaround as i64 => {
                let flight_ticks = (round_trip - turnaround as i64) / 2;
                Ok(TschEvent::DistanceMeasured { peer, ticks: flight_ticks })
            }
            _ => Ok(TschEvent::Acked),
        }
    }

    fn radio_tx<R: RadioCap>(&mut self, radio: &mut R, frame: &Frame) -> Result<RadioTick, R::Error> {
        let mut buf = [0u8; crate::frame::MAX_PAYLOAD_LEN + 32];
        let n = frame.encode(&mut buf, false).unwrap_or(0);
        radio.write_tx(&buf, 0, n)?;
        radio.write_tx_fctrl(0, n)?;
        let tx_tick = radio.schedule_tx(RadioTick::new(0))?;
        radio.wait_event(self.cfg.slot_len_us)?;
        Ok(tx_tick)
    }

    fn is_broadcast(dst: AddrField) -> bool {
        match dst {
            AddrField::None => true,
            AddrField::Extended(a) => a.is_broadcast(),
            AddrField::Short(a) => a.is_broadcast(),
        }
    }

    fn build_beacon(&mut self) -> Frame {
        let mut f = Frame::init_as(FrameType::Beacon);
        f.set_sequence_number(self.seq);
        f.set_addresses(AddrField::None, AddrField::Extended(self.local_addr));
        let _ = f.ies.push(Ie::sync(self.scheduler.asn().0));
        f
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mac::scheduler::{Link, Slotframe};
    use crate::radio_cap::mock::{MockRadioCap, Transaction};
    use rand::rngs::mock::StepRng;

    #[test]
    fn scan_slot_adopts_beacon_asn() {
        let mut tsch = Tsch::new(TschConfig::default(), Address::from_u64(1));
        assert_eq!(tsch.state(), TschState::Idle);

        let mut rng = StepRng::new(0, 1);
        let mut radio = MockRadioCap::new();
        let event = tsch.tick(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(event, TschEvent::Silent);
        assert_eq!(tsch.state(), TschState::Scanning);

        let mut beacon = Frame::init_as(FrameType::Beacon);
        beacon.set_addresses(AddrField::None, AddrField::Extended(Address::from_u64(2)));
        beacon.append_ie(true, crate::frame::IE_TYPE_SYNC, &100u64.to_le_bytes()).unwrap();
        let mut buf = [0u8; 64];
        let n = beacon.encode(&mut buf, true).unwrap();

        let mut script_bytes: heapless::Vec<u8, 128> = heapless::Vec::new();
        script_bytes.extend_from_slice(&buf[..n]).unwrap();

        radio.expect(Transaction::ScheduleRx);
        radio.expect(Transaction::WaitEvent(RadioStatus::RX_COMPLETE_GOOD));
        radio.expect(Transaction::RxFinfo(n));
        radio.expect(Transaction::RxData(script_bytes));

        let event = tsch.tick(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(event, TschEvent::Synced(Asn(100)));
        assert_eq!(tsch.state(), TschState::Synced);
        assert_eq!(tsch.asn(), Asn(100));
        assert!(radio.done());
    }

    #[test]
    fn scan_gives_up_after_max_slots() {
        let cfg = TschConfig {
            max_scan_slots: 2,
            ..TschConfig::default()
        };
        let mut tsch = Tsch::new(cfg, Address::from_u64(1));
        let mut rng = StepRng::new(0, 1);
        let mut radio = MockRadioCap::new();
        tsch.tick(&mut radio, &mut rng, None, false).unwrap(); // idle -> scanning

        for _ in 0..2 {
            radio.expect(Transaction::ScheduleRx);
            radio.expect(Transaction::WaitEvent(RadioStatus::RX_FRAME_WAIT_TIMEOUT));
        }

        let e1 = tsch.tick(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(e1, TschEvent::Silent);
        let e2 = tsch.tick(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(e2, TschEvent::ScanTimedOut);
        assert_eq!(tsch.state(), TschState::Disconnected);
    }

    #[test]
    fn shared_slot_cool_off_counts_down() {
        let mut tsch = Tsch::new(TschConfig::default(), Address::from_u64(1));
        tsch.shared_backoff.arm(2);
        let mut rng = StepRng::new(0, 1);
        let mut radio = MockRadioCap::new();

        let ev = tsch.run_shared_slot(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(ev, TschEvent::Silent);
        assert!(tsch.shared_backoff.is_armed());

        let ev = tsch.run_shared_slot(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(ev, TschEvent::Silent);
        assert!(!tsch.shared_backoff.is_armed());
    }

    #[test]
    fn synced_settles_into_connected() {
        let cfg = TschConfig {
            synced_to_connected_slots: 2,
            ..TschConfig::default()
        };
        let mut tsch = Tsch::new(cfg, Address::from_u64(1));
        tsch.state = TschState::Synced;
        tsch.synced_slots_elapsed = 0;

        let mut radio = MockRadioCap::new();
        let mut rng = StepRng::new(0, 1);
        tsch.tick(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(tsch.state(), TschState::Synced);
        tsch.tick(&mut radio, &mut rng, None, false).unwrap();
        assert_eq!(tsch.state(), TschState::Connected);
    }

    #[test]
    fn unicast_ack_with_tresp_yields_distance() {
        let mut tsch = Tsch::new(TschConfig::default(), Address::from_u64(1));
        let mut rng = StepRng::new(0, 1);
        let mut radio = MockRadioCap::new();

        let mut frame = Frame::init_as(FrameType::Data);
        frame.set_sequence_number(5);
        frame.set_addresses(AddrField::Extended(Address::from_u64(2)), AddrField::Extended(Address::from_u64(1)));

        let mut ack = Frame::init_as(FrameType::Ack);
        ack.set_sequence_number(5);
        ack.set_addresses(AddrField::Extended(Address::from_u64(1)), AddrField::Extended(Address::from_u64(2)));
        ack.ies.push(Ie::tresp(1_000)).unwrap();
        let mut buf = [0u8; 64];
        let n = ack.encode(&mut buf, true).unwrap();
        let mut script_bytes: heapless::Vec<u8, 128> = heapless::Vec::new();
        script_bytes.extend_from_slice(&buf[..n]).unwrap();

        radio.expect(Transaction::ScheduleTx);
        radio.expect(Transaction::WaitEvent(RadioStatus::TX_COMPLETE));
        radio.expect(Transaction::ScheduleRx);
        radio.expect(Transaction::WaitEvent(RadioStatus::RX_COMPLETE_GOOD));
        radio.expect(Transaction::RxFinfo(n));
        radio.expect(Transaction::RxData(script_bytes));
        radio.expect(Transaction::RxTimestamp(RadioTick::new(5_000)));

        let event = tsch.transmit_and_await_ack(&mut radio, &frame).unwrap();
        match event {
            TschEvent::DistanceMeasured { peer, ticks } => {
                assert_eq!(peer, Address::from_u64(2));
                assert_eq!(ticks, 2_000); // (5000 - 1000) / 2
            }
            other => panic!("expected DistanceMeasured, got {:?}", other),
        }
    }

    #[test]
    fn unicast_missing_ack_reports_not_acked() {
        let mut tsch = Tsch::new(TschConfig::default(), Address::from_u64(1));
        let mut radio = MockRadioCap::new();

        let mut frame = Frame::init_as(FrameType::Data);
        frame.set_addresses(AddrField::Extended(Address::from_u64(2)), AddrField::Extended(Address::from_u64(1)));

        radio.expect(Transaction::ScheduleTx);
        radio.expect(Transaction::WaitEvent(RadioStatus::TX_COMPLETE));
        radio.expect(Transaction::ScheduleRx);
        radio.expect(Transaction::WaitEvent(RadioStatus::RX_FRAME_WAIT_TIMEOUT));

        let event = tsch.transmit_and_await_ack(&mut radio, &frame).unwrap();
        assert_eq!(event, TschEvent::NotAcked);
    }

    #[test]
    fn broadcast_is_requeued_for_flood_retries() {
        let cfg = TschConfig {
            max_flood_retries: 2,
            ..TschConfig::default()
        };
        let mut tsch = Tsch::new(cfg, Address::from_u64(1));
        let mut frame_sf = Slotframe::new(0, 4);
        frame_sf.add_link(Link::new(0, 0, LinkKind::Shared)).unwrap();
        tsch.scheduler.add_slotframe(frame_sf).unwrap();

        let mut frame = Frame::init_as(FrameType::Data);
        frame.set_addresses(AddrField::None, AddrField::Extended(Address::from_u64(1)));

        let mut rng = StepRng::new(0, 1);
        let mut radio = MockRadioCap::new();
        radio.expect(Transaction::ScheduleTx);
        radio.expect(Transaction::WaitEvent(RadioStatus::TX_COMPLETE));

        let event = tsch.run_shared_slot(&mut radio, &mut rng, Some(frame), false).unwrap();
        assert_eq!(event, TschEvent::Sent);
        assert_eq!(tsch.flood_retries, 1);
        assert!(!tsch.scheduler.active_link().unwrap().queue_is_empty());
    }
}
