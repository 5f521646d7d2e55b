//! Six-offset loc-slot cell protocol: the beacon wire frame and the
//! per-cell transient bookkeeping (timestamp matrix, adjacency, new
//! neighbors) that higher layers reduce into measurements.

use crate::addr::Address;
use crate::location::geometry::Vec3;
use byteorder::{ByteOrder, LittleEndian};

pub const BEACON_VERSION: u8 = 22;
pub const LOC_GRID_LENGTH_US: u32 = 800;

/// Upper-triangular indices for a 7x7 matrix (six loc offsets plus the
/// final re-transmit at offset 6), one index past the diagonal.
pub const NUM_TSTAMP_SLOTS: usize = 21;

/// `idx(i,j) = idx(j,i)`, covering `[0, 21)` exactly for `i < j` in
/// `[0, 7)`.
pub fn idx(i: usize, j: usize) -> usize {
    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
    lo + hi * (hi.saturating_sub(1)) / 2
}

/// A single reported `(address, arrival-timestamp)` pair inside a beacon
/// frame, one per offset 0..5 from the transmitter's perspective.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct HeardTuple {
    pub addr: Address,
    /// Arrival timestamp in radio ticks, signed, scaled by the
    /// transmitter's `1 - rx_clock_offset`.
    pub tstamp: i32,
}

/// The location beacon frame carried in a link frame's payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeaconFrame {
    pub class: u8,
    pub dir: u8,
    pub slot: u8,
    pub offset: u8,
    pub pos: Vec3,
    pub r: f32,
    pub theta: f32,
    pub neighborhood: u32,
    pub heard: [HeardTuple; 6],
}

pub const BEACON_FRAME_LEN: usize = 1 + 1 + 1 + 1 + 4 * 5 + 4 + 6 * (8 + 4);

impl BeaconFrame {
    fn pack_dso(dir: u8, slot: u8, offset: u8) -> u8 {
        (dir & 0x7) | ((slot & 0x3) << 3) | ((offset & 0x7) << 5)
    }

    fn unpack_dso(b: u8) -> (u8, u8, u8) {
        (b & 0x7, (b >> 3) & 0x3, (b >> 5) & 0x7)
    }

    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < BEACON_FRAME_LEN {
            return None;
        }
        let mut off = 0usize;
        buf[off] = BEACON_VERSION;
        off += 1;
        buf[off] = self.class;
        off += 1;
        buf[off] = Self::pack_dso(self.dir, self.slot, self.offset);
        off += 1;
        buf[off] = 0; // reserved
        off += 1;
        for v in [self.pos.x, self.pos.y, self.pos.z, self.r, self.theta] {
            LittleEndian::write_f32(&mut buf[off..off + 4], v);
            off += 4;
        }
        LittleEndian::write_u32(&mut buf[off..off + 4], self.neighborhood);
        off += 4;
        for tuple in self.heard.iter() {
            buf[off..off + 8].copy_from_slice(&tuple.addr.0);
            off += 8;
            LittleEndian::write_i32(&mut buf[off..off + 4], tuple.tstamp);
            off += 4;
        }
        Some(off)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < BEACON_FRAME_LEN || buf[0] != BEACON_VERSION {
            return None;
        }
        let mut off = 0usize;
        off += 1; // version
        let class = buf[off];
        off += 1;
        let (dir, slot, offset) = Self::unpack_dso(buf[off]);
        off += 1;
        off += 1; // reserved

        let mut floats = [0f32; 5];
        for f in floats.iter_mut() {
            *f = LittleEndian::read_f32(&buf[off..off + 4]);
            off += 4;
        }
        let neighborhood = LittleEndian::read_u32(&buf[off..off + 4]);
        off += 4;

        let mut heard = [HeardTuple::default(); 6];
        for tuple in heard.iter_mut() {
            let mut a = [0u8; 8];
            a.copy_from_slice(&buf[off..off + 8]);
            off += 8;
            let tstamp = LittleEndian::read_i32(&buf[off..off + 4]);
            off += 4;
            *tuple = HeardTuple {
                addr: Address(a),
                tstamp,
            };
        }

        Some(BeaconFrame {
            class,
            dir,
            slot,
            offset,
            pos: Vec3::new(floats[0], floats[1], floats[2]),
            r: floats[3],
            theta: floats[4],
            neighborhood,
            heard,
        })
    }
}

/// A neighbor observed during one cell, pending reduction into the
/// persistent neighbor table.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct SeenNeighbor {
    pub addr: Address,
    pub pos: Vec3,
    pub hyperspace: Option<(f32, f32)>,
    pub neighborhood: u32,
}

/// Per-cell transient state, stack-scoped to a single loc slot firing.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationUpdate {
    pub dir: u8,
    pub slot: u8,
    /// This node's own offset in the cell, if it is a participant.
    pub this_offset: Option<u8>,
    /// 6-bit conflict bitmap, one bit per offset 0..5.
    pub conflicts: u8,
    pub new_neighbors: [Option<SeenNeighbor>; 6],
    /// 7 bits: bits 0..5 per-offset "heard" flags, bit 6 = final prime
    /// re-transmit (offset 6) heard.
    pub new_neighborhood: u8,
    /// 21 bits, one per `idx(i,j)` timestamp slot.
    pub adjacency: u32,
    pub tstamps: [i32; NUM_TSTAMP_SLOTS],
}

impl LocationUpdate {
    pub fn new(dir: u8, slot: u8, this_offset: Option<u8>) -> Self {
        LocationUpdate {
            dir,
            slot,
            this_offset,
            conflicts: 0,
            new_neighbors: [None; 6],
            new_neighborhood: 0,
            adjacency: 0,
            tstamps: [0; NUM_TSTAMP_SLOTS],
        }
    }

    pub fn adj(&self, i: usize, j: usize) -> bool {
        self.adjacency & (1 << idx(i, j)) != 0
    }

    pub fn set_adj(&mut self, i: usize, j: usize) {
        self.adjacency |= 1 << idx(i, j);
    }

    pub fn clear_adj(&mut self, i: usize, j: usize) {
        self.adjacency &= !(1 << idx(i, j));
    }

    pub fn tstamp(&self, i: usize, j: usize) -> i32 {
        self.tstamps[idx(i, j)]
    }

    pub fn set_tstamp(&mut self, i: usize, j: usize, v: i32) {
        self.tstamps[idx(i, j)] = v;
    }

    pub fn final_prime_heard(&self) -> bool {
        self.new_neighborhood & (1 << 6) != 0
    }

    /// Reduces the raw per-offset timestamps into the distance/pseudorange
    /// form the solvers expect, per the spec's `prepare_tstamps` steps.
    /// Invalidates everything if the final prime re-transmit is missing
    /// while the prime's first frame was present.
    pub fn prepare_tstamps(&mut self) {
        let prime_seen = self.adj(0, 1) || self.adj(0, 2) || self.adj(0, 3) || self.adj(0, 4) || self.adj(0, 5);
        if prime_seen && !self.final_prime_heard() {
            self.adjacency = 0;
            return;
        }

        if let Some(i) = self.this_offset {
            let i = i as usize;
            if i != 0 {
                for j in 0..=6 {
                    if j != i && self.adj(i, j) {
                        let v = self.tstamp(i, j);
                        self.set_tstamp(0, i, v);
                    }
                }
            }
        }

        for j in 1..6 {
            if self.adj(0, j) {
                let v = self.tstamp(0, j) / 2;
                self.set_tstamp(0, j, v);
            }
        }

        for i in 1..6 {
            for j in (i + 1)..6 {
                if self.adj(i, j) && self.adj(0, j) && self.adj(0, i) {
                    let delta = self.tstamp(0, j) - self.tstamp(0, i);
                    let v = self.tstamp(i, j) + delta;
                    self.set_tstamp(i, j, v);
                }
            }
        }
    }

    /// Pseudoranges relative to the prime for the final column (offset
    /// 6), used by the non-beacon / TDOA path: `p_ik = t[i,k] - t[0,i]`.
    pub fn pseudoranges(&self) -> [Option<i32>; 5] {
        let mut out = [None; 5];
        for i in 1..=5usize {
            if self.adj(i, 6) && self.adj(0, i) {
                out[i - 1] = Some(self.tstamp(i, 6) - self.tstamp(0, i));
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idx_is_symmetric_and_bijective() {
        let mut seen = [false; NUM_TSTAMP_SLOTS];
        for i in 0..7 {
            for j in (i + 1)..7 {
                assert_eq!(idx(i, j), idx(j, i));
                let k = idx(i, j);
                assert!(k < NUM_TSTAMP_SLOTS);
                assert!(!seen[k], "index {} reused", k);
                seen[k] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn beacon_frame_round_trips() {
        let frame = BeaconFrame {
            class: 128,
            dir: 3,
            slot: 2,
            offset: 5,
            pos: Vec3::new(1.0, 2.0, 3.0),
            r: 4.0,
            theta: 0.5,
            neighborhood: 0xdead_beef,
            heard: [HeardTuple { addr: Address::from_u64(7), tstamp: -42 }; 6],
        };
        let mut buf = [0u8; BEACON_FRAME_LEN];
        let n = frame.encode(&mut buf).unwrap();
        let decoded = BeaconFrame::decode(&buf[..n]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn adjacency_bits_round_trip() {
        let mut u = LocationUpdate::new(0, 0, Some(0));
        u.set_adj(1, 4);
        assert!(u.adj(1, 4));
        assert!(u.adj(4, 1));
        u.clear_adj(4, 1);
        assert!(!u.adj(1, 4));
    }
}
