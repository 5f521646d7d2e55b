//! Beacon state machine: whether and where this node advertises itself
//! in the loc-slot lattice, plus the contention backoff that arbitrates
//! collisions between nodes claiming the same lattice index.

use crate::location::geometry::{self, Vec3, NUM_LATTICE_INDICES, UNASSIGNED_INDEX};
use crate::location::neighbor::NeighborTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeaconActivity {
    Silent,
    Joining,
    Joined,
    /// Forced index for testing, bypassing `optimize_beacons`/`join_beacons`.
    Forced,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeaconState {
    pub activity: BeaconActivity,
    /// 0..19, or `UNASSIGNED_INDEX` if not yet assigned.
    pub index: u8,
    /// 32 bits, one per (slot, dir) this node has transmitted in.
    pub tx_history: u32,
    pub backoff: u8,
    pub allow: bool,
}

impl BeaconState {
    pub fn new() -> Self {
        BeaconState {
            activity: BeaconActivity::Silent,
            index: UNASSIGNED_INDEX,
            tx_history: 0,
            backoff: 1,
            allow: true,
        }
    }

    pub fn force_index(&mut self, index: u8) {
        self.index = index;
        self.activity = BeaconActivity::Forced;
    }

    pub fn is_beacon(&self) -> bool {
        self.index != UNASSIGNED_INDEX && self.activity != BeaconActivity::Silent
    }

    fn tx_history_bit(slot: u8, dir: u8) -> u32 {
        1 << (((slot & 0x3) as u32) * 8 + (dir & 0x7) as u32)
    }

    pub fn mark_transmitted(&mut self, slot: u8, dir: u8) {
        self.tx_history |= Self::tx_history_bit(slot, dir);
    }

    pub fn has_transmitted(&self, slot: u8, dir: u8) -> bool {
        self.tx_history & Self::tx_history_bit(slot, dir) != 0
    }

    /// Linear increase on contention failure, multiplicative decrease on
    /// success, capped to `[1, 32]`.
    pub fn backoff_fail(&mut self) {
        self.backoff = (self.backoff + 1).min(32);
    }

    pub fn backoff_success(&mut self) {
        self.backoff = (self.backoff / 2).max(1);
    }
}

impl Default for BeaconState {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs only when this node's position is finite. Decides whether this
/// node should claim or relinquish a prime (index 0..3) beacon slot.
/// Returns the index to adopt, if any change is warranted.
pub fn optimize_beacons(
    own_pos: Vec3,
    neighbors: &NeighborTable,
    current_index: u8,
    current_occupant_pos: Option<Vec3>,
) -> Option<u8> {
    let ideal = geometry::quantize(own_pos);
    let ideal_index = geometry::index_from_point(ideal);

    if ideal_index >= 4 {
        return None; // not a prime-eligible position
    }

    if neighbors.local_count(ideal) < 3 {
        return None;
    }

    match current_occupant_pos {
        None => Some(ideal_index),
        Some(occupant) => {
            let ours = own_pos.distance(ideal);
            let theirs = occupant.distance(ideal);
            if theirs > 0.0 && ours < theirs * 0.75 {
                Some(ideal_index)
            } else {
                None
            }
        }
    }
    .filter(|&i| i != current_index)
}

/// Runs only when this node's position is unknown. Scores each candidate
/// lattice index by the sum, over known neighbors, of the dot product
/// between the neighbor's reported direction and this candidate's ideal
/// direction to that neighbor; returns the best-scoring index with no
/// 1-hop conflicts.
pub fn join_beacons(neighbors: &NeighborTable) -> Option<u8> {
    let mut best_index = None;
    let mut best_score = f32::MIN;

    for candidate in 0..NUM_LATTICE_INDICES as u8 {
        if neighbors.get(candidate).is_some() {
            continue; // conflicts with an already-occupied 1-hop slot
        }
        let mut score = 0f32;
        let mut saw_any = false;
        for (j, nbr) in neighbors.iter() {
            let ideal = geometry::relpos(candidate, j);
            if ideal == UNASSIGNED_INDEX {
                continue;
            }
            let ideal_vec = geometry::VECTORS[ideal as usize];
            let actual_vec = nbr.location;
            let norm = actual_vec.norm();
            if norm < 1e-6 {
                continue;
            }
            score += actual_vec.scale(1.0 / norm).dot(ideal_vec);
            saw_any = true;
        }
        if saw_any && score > best_score {
            best_score = score;
            best_index = Some(candidate);
        }
    }

    best_index
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::Address;

    #[test]
    fn backoff_caps_both_directions() {
        let mut b = BeaconState::new();
        for _ in 0..10 {
            b.backoff_fail();
        }
        assert_eq!(b.backoff, 11);
        for _ in 0..20 {
            b.backoff_fail();
        }
        assert_eq!(b.backoff, 32);
        for _ in 0..10 {
            b.backoff_success();
        }
        assert_eq!(b.backoff, 1);
    }

    #[test]
    fn tx_history_tracks_distinct_cells() {
        let mut b = BeaconState::new();
        assert!(!b.has_transmitted(1, 2));
        b.mark_transmitted(1, 2);
        assert!(b.has_transmitted(1, 2));
        assert!(!b.has_transmitted(1, 3));
    }

    #[test]
    fn optimize_beacons_takes_vacant_prime_slot() {
        let mut nbrs = NeighborTable::new();
        for i in 0..3u8 {
            nbrs.observe(i, Address::from_u64(i as u64), Vec3::ZERO, 0, 128, None);
        }
        let result = optimize_beacons(Vec3::new(0.01, 0.01, 0.0), &nbrs, UNASSIGNED_INDEX, None);
        assert!(result.is_some());
    }

    #[test]
    fn optimize_beacons_requires_closer_position_to_take_over() {
        let mut nbrs = NeighborTable::new();
        for i in 0..3u8 {
            nbrs.observe(i, Address::from_u64(i as u64), Vec3::ZERO, 0, 128, None);
        }
        let far_occupant = Vec3::new(0.0, 0.0, 0.01);
        let result = optimize_beacons(Vec3::new(0.5, 0.5, 0.0), &nbrs, 1, Some(far_occupant));
        assert_eq!(result, None);
    }
}
