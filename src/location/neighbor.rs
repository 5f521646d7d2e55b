//! Neighbor table: fixed-capacity array of recently-heard peers, indexed
//! by lattice position, aged out after consecutive missed appearances.
//!
//! Uses a fixed `[Option<NeighborRecord>; N]` array rather than
//! `heapless::Vec`, since removing a record at an arbitrary lattice
//! index isn't expressible with this version's `Vec` (it only offers
//! `swap_remove`, not arbitrary-position removal or `retain`) — the same
//! constraint documented in `sixlo::mod::SixLo`'s reassembly table.

use crate::addr::Address;
use crate::location::geometry::{self, Vec3, NUM_LATTICE_INDICES, UNASSIGNED_INDEX};

/// Consecutive missed appearances before a neighbor is dropped.
pub const NBR_DROP_MAX: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NeighborRecord {
    pub addr: Address,
    pub location: Vec3,
    /// 20-bit vector: which lattice indices this neighbor reports
    /// hearing.
    pub neighborhood: u32,
    /// Opaque, defaults to 128; this core never branches on its value.
    pub class: u8,
    pub hyperspace: Option<(f32, f32)>,
    drop_count: u8,
}

impl NeighborRecord {
    fn new(addr: Address, location: Vec3, neighborhood: u32, class: u8, hyperspace: Option<(f32, f32)>) -> Self {
        NeighborRecord {
            addr,
            location,
            neighborhood,
            class,
            hyperspace,
            drop_count: 0,
        }
    }
}

pub struct NeighborTable {
    slots: [Option<NeighborRecord>; NUM_LATTICE_INDICES],
}

impl NeighborTable {
    pub fn new() -> Self {
        NeighborTable {
            slots: [None; NUM_LATTICE_INDICES],
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; NUM_LATTICE_INDICES];
    }

    pub fn get(&self, lattice_index: u8) -> Option<&NeighborRecord> {
        self.slots.get(lattice_index as usize)?.as_ref()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &NeighborRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i as u8, r)))
    }

    /// Records a reception at `lattice_index`, refreshing the record and
    /// resetting its drop counter.
    pub fn observe(
        &mut self,
        lattice_index: u8,
        addr: Address,
        location: Vec3,
        neighborhood: u32,
        class: u8,
        hyperspace: Option<(f32, f32)>,
    ) {
        if lattice_index as usize >= NUM_LATTICE_INDICES {
            return;
        }
        self.slots[lattice_index as usize] = Some(NeighborRecord::new(addr, location, neighborhood, class, hyperspace));
    }

    /// Marks `lattice_index` as missed this cell, dropping it once
    /// `NBR_DROP_MAX` consecutive misses accrue.
    pub fn miss(&mut self, lattice_index: u8) {
        if lattice_index as usize >= NUM_LATTICE_INDICES {
            return;
        }
        if let Some(rec) = self.slots[lattice_index as usize].as_mut() {
            rec.drop_count += 1;
            if rec.drop_count >= NBR_DROP_MAX {
                self.slots[lattice_index as usize] = None;
            }
        }
    }

    /// Local-neighborhood membership: neighbors whose reported location
    /// lies within `sqrt(3) * LATTICE_R` of `own_quantized`.
    pub fn local_count(&self, own_quantized: Vec3) -> usize {
        let threshold = 3f32.sqrt() * geometry::LATTICE_R;
        self.iter()
            .filter(|(_, r)| r.location.distance(own_quantized) <= threshold)
            .count()
    }

    /// Whether fewer than half the known neighbors appear locally
    /// consistent — signals the caller should force a rejoin.
    pub fn mostly_inconsistent(&self, own_quantized: Vec3) -> bool {
        let total = self.count();
        if total == 0 {
            return false;
        }
        self.local_count(own_quantized) * 2 < total
    }
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn observe_then_miss_drops_after_threshold() {
        let mut t = NeighborTable::new();
        t.observe(3, Address::from_u64(1), Vec3::ZERO, 0, 128, None);
        assert_eq!(t.count(), 1);
        for _ in 0..NBR_DROP_MAX - 1 {
            t.miss(3);
            assert_eq!(t.count(), 1);
        }
        t.miss(3);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn observe_resets_drop_counter() {
        let mut t = NeighborTable::new();
        t.observe(5, Address::from_u64(1), Vec3::ZERO, 0, 128, None);
        t.miss(5);
        t.miss(5);
        t.miss(5);
        t.observe(5, Address::from_u64(1), Vec3::ZERO, 0, 128, None);
        for _ in 0..NBR_DROP_MAX - 1 {
            t.miss(5);
        }
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn local_count_respects_threshold() {
        let mut t = NeighborTable::new();
        t.observe(0, Address::from_u64(1), Vec3::new(1.0, 0.0, 0.0), 0, 128, None);
        t.observe(1, Address::from_u64(2), Vec3::new(100.0, 0.0, 0.0), 0, 128, None);
        assert_eq!(t.local_count(Vec3::ZERO), 1);
    }

    #[test]
    fn unassigned_index_is_never_a_valid_slot() {
        let mut t = NeighborTable::new();
        t.observe(UNASSIGNED_INDEX, Address::from_u64(9), Vec3::ZERO, 0, 128, None);
        assert_eq!(t.count(), 0);
    }
}
