//! Location-engine state machine: `init -> searching-nbrhood -> searching
//! -> measuring-dist -> joined`, driving the neighbor table and solvers
//! off each loc-slot cell's reduced timestamps.

use crate::location::geometry::{self, Vec3};
use crate::location::neighbor::NeighborTable;
use crate::location::protocol::LocationUpdate;
use crate::location::solvers::{self, SolveStatus};
use crate::mac::scheduler::Deferred;
use heapless::Vec as HVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocState {
    Init,
    SearchingNbrhood,
    Searching,
    MeasuringDist,
    Joined,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocConfig {
    /// Cells to spend in `searching-nbrhood` before giving up on a quick
    /// neighborhood-local fix and falling back to `searching`.
    pub search_nbrhood_count: u32,
    /// 30s at a 10ms slot.
    pub measure_dist_timeout_ticks: u32,
    /// 60s at a 10ms slot.
    pub update_timeout_ticks: u32,
    pub all_nbrhood_min: u8,
}

impl Default for LocConfig {
    fn default() -> Self {
        LocConfig {
            search_nbrhood_count: 4,
            measure_dist_timeout_ticks: 3_000,
            update_timeout_ticks: 6_000,
            all_nbrhood_min: 4,
        }
    }
}

/// Euler-step constants for the `Joined`-state spring refinement; chosen
/// to settle within a handful of cells without overshooting.
const SPRING_K: f32 = 0.2;
const LATTICE_PULL: f32 = 0.05;
const SPRING_DAMPING: f32 = 0.3;
const SPRING_DT: f32 = 0.05;

/// A pending TOA ranging request awaiting `dist_measured`: the prime
/// beacon's position plus the partial (pseudorange-only) distances to
/// up to 4 other beacons observed in the same cell, plus the lattice
/// indices of all participants for the coplanarity test.
struct PendingToa {
    prime_pos: Vec3,
    others: HVec<(Vec3, f32), 4>,
    indices: HVec<u8, 5>,
}

pub struct LocationEngine {
    state: LocState,
    cfg: LocConfig,
    cells_elapsed: u32,
    timeout: Deferred,
    position: Option<Vec3>,
    /// Current drift estimate for the `Joined`-state spring refinement.
    velocity: Vec3,
    neighbors: NeighborTable,
    pending_toa: Option<PendingToa>,
}

impl LocationEngine {
    pub fn new(cfg: LocConfig) -> Self {
        LocationEngine {
            state: LocState::Init,
            cfg,
            cells_elapsed: 0,
            timeout: Deferred::new(),
            position: None,
            velocity: Vec3::ZERO,
            neighbors: NeighborTable::new(),
            pending_toa: None,
        }
    }

    pub fn state(&self) -> LocState {
        self.state
    }

    pub fn position(&self) -> Option<Vec3> {
        self.position
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn start(&mut self) {
        self.state = LocState::SearchingNbrhood;
        self.cells_elapsed = 0;
    }

    /// The network's root node skips ranging entirely and declares
    /// itself located at the lattice origin.
    pub fn start_root(&mut self) {
        self.position = Some(Vec3::ZERO);
        self.state = LocState::Joined;
        self.timeout.arm(self.cfg.update_timeout_ticks);
    }

    pub fn stop(&mut self) {
        self.state = LocState::Init;
        self.position = None;
        self.velocity = Vec3::ZERO;
        self.neighbors.clear();
        self.pending_toa = None;
        self.timeout.cancel();
    }

    /// Advances any live timeout by one slot tick; fires `timeout` if it
    /// reaches zero.
    pub fn tick(&mut self) {
        if self.timeout.tick() {
            self.on_timeout();
        }
    }

    fn on_timeout(&mut self) {
        match self.state {
            LocState::MeasuringDist => {
                self.state = LocState::Searching;
                self.pending_toa = None;
            }
            LocState::Joined => {
                self.state = LocState::Searching;
                self.position = None;
            }
            _ => {}
        }
    }

    fn update_neighbors(&mut self, update: &LocationUpdate) {
        let table = &geometry::BEACON_ORDER[update.dir as usize % 8][update.slot as usize % 4];
        for (offset, slot_index) in table.iter().enumerate() {
            match update.new_neighbors[offset] {
                Some(seen) => self.neighbors.observe(*slot_index, seen.addr, seen.pos, seen.neighborhood, 128, seen.hyperspace),
                None => self.neighbors.miss(*slot_index),
            }
        }
    }

    /// Attempts a TDOA fix directly from one cell's reduced timestamps,
    /// with no active ranging required.
    fn attempt_tdoa(&self, update: &LocationUpdate, rx_clock_offset: f32) -> Option<Vec3> {
        let prime = update.new_neighbors[0]?;
        let pr = update.pseudoranges();
        let mut beacons: HVec<(Vec3, f32), 5> = HVec::new();
        for i in 1..=5usize {
            if let (Some(ticks), Some(nbr)) = (pr[i - 1], update.new_neighbors[i]) {
                let metres = solvers::ticks_to_metres(ticks, rx_clock_offset);
                let _ = beacons.push((nbr.pos, metres));
            }
        }
        if beacons.len() < 4 {
            return None;
        }
        match solvers::compute_tdoa(prime.pos, &beacons) {
            SolveStatus::Solved(x) => Some(x),
            _ => None,
        }
    }

    /// Incremental spring-relaxation nudge, used in `Joined` when a full
    /// TDOA re-solve isn't available this cell but at least one fresh
    /// pseudorange measurement is.
    fn attempt_springs(&mut self, update: &LocationUpdate, rx_clock_offset: f32) -> bool {
        let pos = match self.position {
            Some(p) => p,
            None => return false,
        };
        let pr = update.pseudoranges();
        let mut measurements: HVec<(Vec3, f32), 5> = HVec::new();
        for i in 1..=5usize {
            if let (Some(ticks), Some(nbr)) = (pr[i - 1], update.new_neighbors[i]) {
                let metres = solvers::tstamp_to_distance(ticks, rx_clock_offset);
                let _ = measurements.push((nbr.pos, metres));
            }
        }
        if measurements.is_empty() {
            return false;
        }
        let (new_pos, new_vel) = solvers::springs_step(pos, self.velocity, &measurements, SPRING_K, LATTICE_PULL, SPRING_DAMPING, SPRING_DT);
        if !new_pos.is_finite() {
            return false;
        }
        self.position = Some(new_pos);
        self.velocity = new_vel;
        true
    }

    /// Stages a TOA ranging request to the prime beacon from this cell's
    /// observed neighbors, to be completed once `dist_measured` reports
    /// the actual round-trip distance to the prime.
    fn stage_toa(&mut self, update: &LocationUpdate, rx_clock_offset: f32) -> bool {
        let prime = match update.new_neighbors[0] {
            Some(p) => p,
            None => return false,
        };
        let table = &geometry::BEACON_ORDER[update.dir as usize % 8][update.slot as usize % 4];
        let pr = update.pseudoranges();
        let mut others: HVec<(Vec3, f32), 4> = HVec::new();
        let mut indices: HVec<u8, 5> = HVec::new();
        let _ = indices.push(table[0]);
        for i in 1..=4usize {
            if let (Some(ticks), Some(nbr)) = (pr[i - 1], update.new_neighbors[i]) {
                let metres = solvers::ticks_to_metres(ticks, rx_clock_offset);
                let _ = others.push((nbr.pos, metres));
                let _ = indices.push(table[i]);
            }
        }
        if others.is_empty() {
            return false;
        }
        self.pending_toa = Some(PendingToa { prime_pos: prime.pos, others, indices });
        self.state = LocState::MeasuringDist;
        self.timeout.arm(self.cfg.measure_dist_timeout_ticks);
        true
    }

    /// Drives one loc-slot cell through `prepare_tstamps`, neighbor-table
    /// update, and a location attempt, then applies the resulting state
    /// transition.
    pub fn on_cell(&mut self, update: &mut LocationUpdate, rx_clock_offset: f32) {
        if self.state == LocState::Init {
            return;
        }
        update.prepare_tstamps();
        self.update_neighbors(update);

        match self.state {
            LocState::SearchingNbrhood => {
                if let Some(x) = self.attempt_tdoa(update, rx_clock_offset) {
                    self.position = Some(x);
                    self.state = LocState::Joined;
                    self.timeout.arm(self.cfg.update_timeout_ticks);
                    return;
                }
                self.cells_elapsed += 1;
                if self.cells_elapsed >= self.cfg.search_nbrhood_count {
                    self.state = LocState::Searching;
                }
            }
            LocState::Searching => {
                if let Some(x) = self.attempt_tdoa(update, rx_clock_offset) {
                    self.position = Some(x);
                    self.state = LocState::Joined;
                    self.timeout.arm(self.cfg.update_timeout_ticks);
                } else {
                    self.stage_toa(update, rx_clock_offset);
                }
            }
            LocState::Joined => {
                if let Some(x) = self.attempt_tdoa(update, rx_clock_offset) {
                    self.position = Some(x);
                    self.velocity = Vec3::ZERO;
                    self.timeout.arm(self.cfg.update_timeout_ticks);
                } else if self.attempt_springs(update, rx_clock_offset) {
                    self.timeout.arm(self.cfg.update_timeout_ticks);
                } else if update.new_neighborhood.count_ones() < self.cfg.all_nbrhood_min as u32 && !self.position.map(Vec3::is_finite).unwrap_or(false) {
                    self.state = LocState::SearchingNbrhood;
                    self.cells_elapsed = 0;
                }
            }
            LocState::MeasuringDist | LocState::Init => {}
        }
    }

    /// Event `cell-skip`: a loc slot was scheduled but went unheard
    /// entirely; counts toward the `searching-nbrhood` cell budget like
    /// any other cell.
    pub fn on_cell_skip(&mut self) {
        if self.state == LocState::SearchingNbrhood {
            self.cells_elapsed += 1;
            if self.cells_elapsed >= self.cfg.search_nbrhood_count {
                self.state = LocState::Searching;
            }
        }
    }

    /// Event `dist-measured`: an explicit TSCH shared-slot ranging to
    /// the prime beacon completed with round-trip distance `d0` metres.
    /// Converts the staged pseudoranges to full distances and dispatches
    /// to the solver matching how many beacons ended up measured: the
    /// two-point line/circle bootstrap, three-point (coplanar-gated)
    /// 3-sphere, or full TOA trilateration.
    pub fn dist_measured(&mut self, d0: f32) {
        let pending = match self.pending_toa.take() {
            Some(p) => p,
            None => return,
        };
        let mut positions: HVec<Vec3, 5> = HVec::new();
        let mut distances: HVec<f32, 5> = HVec::new();
        let _ = positions.push(pending.prime_pos);
        let _ = distances.push(d0);
        for (pos, pseudorange) in pending.others.iter() {
            let _ = positions.push(*pos);
            let _ = distances.push(d0 + pseudorange);
        }

        let status = match positions.len() {
            2 => {
                let up = Vec3::new(0.0, 0.0, 1.0);
                match pending.indices.first().copied().unwrap_or(geometry::UNASSIGNED_INDEX) {
                    4 => solvers::compute_1line(positions[0], positions[1], distances[0], distances[1], up),
                    9 | 13 => solvers::compute_2circle(positions[0], positions[1], distances[0], distances[1], up),
                    _ => SolveStatus::InsufficientBeacons,
                }
            }
            3 if geometry::all_coplanar(&pending.indices) => {
                let reference_vec = geometry::VECTORS[pending.indices[0] as usize];
                solvers::compute_3sphere(positions[0], positions[1], positions[2], distances[0], distances[1], distances[2], reference_vec)
            }
            _ => solvers::compute_toa(&positions, &distances),
        };

        match status {
            SolveStatus::Solved(x) => {
                self.position = Some(x);
                self.velocity = Vec3::ZERO;
                self.state = LocState::Joined;
                self.timeout.arm(self.cfg.update_timeout_ticks);
            }
            _ => {
                self.state = LocState::Searching;
            }
        }
    }

    /// Folds an ad hoc ranging result obtained outside the six-offset
    /// cell cadence (`Node::measure_distance`) into the current fix via
    /// one `springs_step` nudge, same as an unplanned extra pseudorange.
    pub fn ranging_result(&mut self, peer_pos: Vec3, distance_m: f32) {
        if self.state != LocState::Joined {
            return;
        }
        let pos = match self.position {
            Some(p) => p,
            None => return,
        };
        let measurements = [(peer_pos, distance_m)];
        let (new_pos, new_vel) = solvers::springs_step(pos, self.velocity, &measurements, SPRING_K, LATTICE_PULL, SPRING_DAMPING, SPRING_DT);
        if new_pos.is_finite() {
            self.position = Some(new_pos);
            self.velocity = new_vel;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Address;
    use crate::location::protocol::SeenNeighbor;

    fn seen(pos: Vec3) -> SeenNeighbor {
        SeenNeighbor { addr: Address::from_u64(1), pos, hyperspace: None, neighborhood: 0 }
    }

    #[test]
    fn start_root_joins_immediately() {
        let mut eng = LocationEngine::new(LocConfig::default());
        eng.start_root();
        assert_eq!(eng.state(), LocState::Joined);
        assert_eq!(eng.position(), Some(Vec3::ZERO));
    }

    #[test]
    fn stop_resets_to_init() {
        let mut eng = LocationEngine::new(LocConfig::default());
        eng.start_root();
        eng.stop();
        assert_eq!(eng.state(), LocState::Init);
        assert_eq!(eng.position(), None);
    }

    #[test]
    fn searching_nbrhood_falls_back_after_budget() {
        let mut cfg = LocConfig::default();
        cfg.search_nbrhood_count = 2;
        let mut eng = LocationEngine::new(cfg);
        eng.start();
        let mut u1 = LocationUpdate::new(0, 0, Some(0));
        eng.on_cell(&mut u1, 0.0);
        assert_eq!(eng.state(), LocState::SearchingNbrhood);
        let mut u2 = LocationUpdate::new(0, 0, Some(0));
        eng.on_cell(&mut u2, 0.0);
        assert_eq!(eng.state(), LocState::Searching);
    }

    #[test]
    fn measuring_dist_times_out_to_searching() {
        let mut cfg = LocConfig::default();
        cfg.measure_dist_timeout_ticks = 2;
        let mut eng = LocationEngine::new(cfg);
        eng.start();
        eng.state = LocState::Searching;
        let mut u = LocationUpdate::new(0, 0, Some(0));
        u.new_neighbors[0] = Some(seen(Vec3::new(0.0, 0.0, 0.0)));
        u.new_neighbors[1] = Some(seen(Vec3::new(5.0, 0.0, 0.0)));
        u.new_neighbors[2] = Some(seen(Vec3::new(5.0, 5.0, 0.0)));
        u.new_neighbors[3] = Some(seen(Vec3::new(2.5, 2.5, 5.0)));
        u.set_adj(1, 6);
        u.set_adj(0, 1);
        u.set_tstamp(1, 6, 100);
        u.set_tstamp(0, 1, 0);
        u.set_adj(2, 6);
        u.set_adj(0, 2);
        u.set_tstamp(2, 6, 50);
        u.set_tstamp(0, 2, 0);
        u.set_adj(3, 6);
        u.set_adj(0, 3);
        u.set_tstamp(3, 6, 75);
        u.set_tstamp(0, 3, 0);
        u.new_neighborhood |= 1 << 6; // final prime re-transmit heard, so prepare_tstamps keeps the data
        eng.on_cell(&mut u, 0.0);
        assert_eq!(eng.state(), LocState::MeasuringDist);
        eng.tick();
        eng.tick();
        assert_eq!(eng.state(), LocState::Searching);
    }

    #[test]
    fn joined_loses_fix_when_nbrhood_collapses() {
        let mut eng = LocationEngine::new(LocConfig::default());
        eng.start_root();
        eng.position = None; // simulate a fix that decayed to non-finite
        let mut u = LocationUpdate::new(0, 0, Some(0));
        u.new_neighborhood = 0b0;
        eng.on_cell(&mut u, 0.0);
        assert_eq!(eng.state(), LocState::SearchingNbrhood);
    }
}
