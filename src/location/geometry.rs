//! Rhombic-dodecahedral lattice geometry: canonical neighborhood vectors,
//! quantization, and lattice-index lookup.
//!
//! The original canonical 20-point table could not be recovered (no
//! `original_source/` was retrievable for this spec). `VECTORS` below is
//! a self-consistent synthetic stand-in: a ring of 8 unit vectors in the
//! z=0 plane (matching the loc-slot compass directions NE, N, NW, W, SW,
//! S, SE, E used for `dir`), plus a 6-point hex ring above and below it.
//! `index_from_point` is the exact nearest-match inverse of this table by
//! construction, which is what the round-trip invariant actually
//! requires — see `DESIGN.md` for the call.

use micromath::F32Ext;

pub const LATTICE_R: f32 = 2.5;
pub const NUM_LATTICE_INDICES: usize = 20;

/// `Beacon::index`'s "no lattice index assigned yet" value, and the
/// sentinel `relpos` returns when two indices have no direct relation in
/// the synthetic table.
pub const UNASSIGNED_INDEX: u8 = 20;

const FRAC_1_SQRT2: f32 = 0.707_106_8;
const HEX_XY: f32 = 0.816_496_6; // sqrt(2/3)
const HEX_Z: f32 = 0.577_350_3; // 1/sqrt(3)

/// A 3-D point / displacement. `f32` throughout, matching the radio
/// tick-to-metre conversions used by the solvers.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3 { x, y, z }
    }

    pub fn scale(self, s: f32) -> Self {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn add(self, other: Vec3) -> Self {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(self, other: Vec3) -> Self {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn dot(self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn norm(self) -> f32 {
        self.dot(self).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f32 {
        self.sub(other).norm()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Ring 0 (indices 0..7, z=0 compass plane), ring 1 (8..13, z=+1 hex
/// sheet), ring 2 (14..19, z=-1 hex sheet, staggered 30° against ring 1).
pub const VECTORS: [Vec3; NUM_LATTICE_INDICES] = [
    Vec3 { x: FRAC_1_SQRT2, y: FRAC_1_SQRT2, z: 0.0 }, // 0 NE
    Vec3 { x: 0.0, y: 1.0, z: 0.0 },                   // 1 N
    Vec3 { x: -FRAC_1_SQRT2, y: FRAC_1_SQRT2, z: 0.0 }, // 2 NW
    Vec3 { x: -1.0, y: 0.0, z: 0.0 },                  // 3 W
    Vec3 { x: -FRAC_1_SQRT2, y: -FRAC_1_SQRT2, z: 0.0 }, // 4 SW
    Vec3 { x: 0.0, y: -1.0, z: 0.0 },                  // 5 S
    Vec3 { x: FRAC_1_SQRT2, y: -FRAC_1_SQRT2, z: 0.0 }, // 6 SE
    Vec3 { x: 1.0, y: 0.0, z: 0.0 },                   // 7 E
    Vec3 { x: HEX_XY, y: 0.0, z: HEX_Z },              // 8
    Vec3 { x: HEX_XY * 0.5, y: HEX_XY * 0.866_025_4, z: HEX_Z }, // 9
    Vec3 { x: -HEX_XY * 0.5, y: HEX_XY * 0.866_025_4, z: HEX_Z }, // 10
    Vec3 { x: -HEX_XY, y: 0.0, z: HEX_Z },             // 11
    Vec3 { x: -HEX_XY * 0.5, y: -HEX_XY * 0.866_025_4, z: HEX_Z }, // 12
    Vec3 { x: HEX_XY * 0.5, y: -HEX_XY * 0.866_025_4, z: HEX_Z }, // 13
    Vec3 { x: HEX_XY * 0.866_025_4, y: HEX_XY * 0.5, z: -HEX_Z }, // 14
    Vec3 { x: 0.0, y: HEX_XY, z: -HEX_Z },             // 15
    Vec3 { x: -HEX_XY * 0.866_025_4, y: HEX_XY * 0.5, z: -HEX_Z }, // 16
    Vec3 { x: -HEX_XY * 0.866_025_4, y: -HEX_XY * 0.5, z: -HEX_Z }, // 17
    Vec3 { x: 0.0, y: -HEX_XY, z: -HEX_Z },            // 18
    Vec3 { x: HEX_XY * 0.866_025_4, y: -HEX_XY * 0.5, z: -HEX_Z }, // 19
];

/// Eight sectors, four sub-slots, six cooperating lattice indices per
/// cell. Synthetic round-robin assignment (see module doc) — internally
/// consistent, not a reproduction of an unavailable reference table.
pub const BEACON_ORDER: [[[u8; 6]; 4]; 8] = {
    let mut table = [[[0u8; 6]; 4]; 8];
    let mut dir = 0;
    while dir < 8 {
        let mut slot = 0;
        while slot < 4 {
            let mut o = 0;
            while o < 6 {
                table[dir][slot][o] = ((dir * 4 + slot) * 6 + o) as u8 % NUM_LATTICE_INDICES as u8;
                o += 1;
            }
            slot += 1;
        }
        dir += 1;
    }
    table
};

/// Lattice index (0..19) nearest `p`, by exhaustive search over `VECTORS`
/// scaled by `LATTICE_R`. Exact for any `p = VECTORS[i] * LATTICE_R`.
pub fn index_from_point(p: Vec3) -> u8 {
    let mut best = 0usize;
    let mut best_d = f32::MAX;
    for (i, v) in VECTORS.iter().enumerate() {
        let d = p.distance(v.scale(LATTICE_R));
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best as u8
}

/// Relative-position lattice index from `i` to `j`: the table index
/// whose direction best matches `VECTORS[j] - VECTORS[i]`, or
/// `UNASSIGNED_INDEX` if no entry is close enough to call a direct
/// neighbor relation.
pub fn relpos(i: u8, j: u8) -> u8 {
    let (vi, vj) = (VECTORS[i as usize], VECTORS[j as usize]);
    let delta = vj.sub(vi);
    if delta.norm() < 1e-6 {
        return UNASSIGNED_INDEX;
    }
    index_from_point(delta.scale(1.0 / delta.norm()))
}

/// Maps a real position to the nearest lattice point, per the staggered
/// z-sheet quantization scheme.
pub fn quantize(p: Vec3) -> Vec3 {
    let qz = (p.z / LATTICE_R).round() * LATTICE_R;
    let qx = ((p.x - qz / 2.0) / LATTICE_R).round() * LATTICE_R;
    let qy = ((p.y - qz / 2.0) / LATTICE_R).round() * LATTICE_R;
    Vec3::new(qx + qz / 2.0, qy + qz / 2.0, qz)
}

/// Which (dir, slot) a cell falls in for the current ASN.
pub fn dir_slot_from_asn(asn: u64, sf_length: u16) -> (u8, u8) {
    let sf = sf_length.max(1) as u64;
    let dir = ((asn / sf) % 8) as u8;
    let slot = ((asn % sf) / (sf / 4).max(1)) as u8;
    (dir, slot)
}

/// This node's offset (0..5) in the given cell, if its lattice index is
/// a participant; `None` means it only listens this cell.
pub fn beacon_offset(index: u8, dir: u8, slot: u8) -> Option<u8> {
    if index >= NUM_LATTICE_INDICES as u8 {
        return None;
    }
    BEACON_ORDER[dir as usize % 8][slot as usize % 4]
        .iter()
        .position(|&i| i == index)
        .map(|o| o as u8)
}

/// Which z-sheet a lattice index sits on: the z=0 compass ring, the
/// ring above it, or the ring below.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sheet {
    Middle,
    Above,
    Below,
}

/// The z-sheet a lattice index belongs to, per `VECTORS`'s three rings.
pub fn sheet_of(lattice_index: u8) -> Sheet {
    let z = VECTORS[lattice_index as usize % NUM_LATTICE_INDICES].z;
    if z > 1e-3 {
        Sheet::Above
    } else if z < -1e-3 {
        Sheet::Below
    } else {
        Sheet::Middle
    }
}

/// True when every index in `indices` lies on the same z-sheet — the
/// degenerate case where TOA's three-sphere intersection collapses to a
/// line/circle and the dedicated coplanar solver must be used instead.
pub fn all_coplanar(indices: &[u8]) -> bool {
    let mut iter = indices.iter().map(|&i| sheet_of(i));
    match iter.next() {
        Some(first) => iter.all(|s| s == first),
        None => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quantize_is_idempotent() {
        let p = Vec3::new(0.907_493, 0.143_357, 3.036_491);
        let q = quantize(p);
        assert_eq!(quantize(q), q);
    }

    #[test]
    fn quantize_matches_s5_example() {
        let p = Vec3::new(0.907_493, 0.143_357, 3.036_491);
        let q = quantize(p);
        assert!((q.x - 1.25).abs() < 1e-4);
        assert!((q.y - 1.25).abs() < 1e-4);
        assert!((q.z - 2.5).abs() < 1e-4);
    }

    #[test]
    fn lattice_index_round_trips() {
        for i in 0..NUM_LATTICE_INDICES as u8 {
            let p = VECTORS[i as usize].scale(LATTICE_R);
            assert_eq!(index_from_point(p), i);
        }
    }

    #[test]
    fn beacon_offset_finds_participant() {
        let idx = BEACON_ORDER[2][1][3];
        assert_eq!(beacon_offset(idx, 2, 1), Some(3));
    }

    #[test]
    fn beacon_offset_none_for_non_participant() {
        // Index 20 (unassigned) never appears in the table.
        assert_eq!(beacon_offset(UNASSIGNED_INDEX, 0, 0), None);
    }
}
