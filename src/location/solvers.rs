//! Position solvers. All distances here are already in metres — callers
//! convert radio-tick timestamps via `TIME_RES_SECONDS * SPEED_OF_LIGHT`
//! before calling in, keeping floating point isolated to this module and
//! `geometry`, per the spec's float-isolation design note.

use crate::location::geometry::{self, Vec3, LATTICE_R};
use micromath::F32Ext;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SolveStatus {
    Solved(Vec3),
    /// Not enough independent measurements to attempt a solve.
    InsufficientBeacons,
    /// Beacons coplanar and no reference lattice index available to
    /// disambiguate (3-sphere) or resolve (TOA).
    Coplanar,
    /// Result rejected — too implausible to trust (TDOA's distance
    /// check, or a non-finite intermediate).
    Inaccurate,
}

/// Signed tick-to-metres conversion — used for pseudoranges, which may be
/// negative.
pub fn ticks_to_metres(ticks: i32, rx_clock_offset: f32) -> f32 {
    (ticks as f32) * (1.0 - rx_clock_offset) * crate::radio_cap::TIME_RES_SECONDS * crate::radio_cap::SPEED_OF_LIGHT
}

pub fn tstamp_to_distance(ticks: i32, rx_clock_offset: f32) -> f32 {
    ticks_to_metres(ticks, rx_clock_offset).abs()
}

/// `r1 · (r2 × r3)`, the determinant of the 3x3 matrix whose rows are
/// `r1, r2, r3`.
fn det3(r1: Vec3, r2: Vec3, r3: Vec3) -> f32 {
    r1.dot(r2.cross(r3))
}

/// Solves `A x = rhs` for the 3x3 system whose rows are `rows`, via
/// Cramer's rule expressed with cross products (the same trick used for
/// triangulation in the teacher's sibling repos' solver code).
fn solve3(rows: [Vec3; 3], rhs: [f32; 3]) -> Option<Vec3> {
    let d = det3(rows[0], rows[1], rows[2]);
    if d.abs() < 1e-9 {
        return None;
    }
    let c12 = rows[1].cross(rows[2]);
    let c20 = rows[2].cross(rows[0]);
    let c01 = rows[0].cross(rows[1]);
    let num = c12.scale(rhs[0]).add(c20.scale(rhs[1])).add(c01.scale(rhs[2]));
    Some(num.scale(1.0 / d))
}

/// Over-determined TOA trilateration: `‖x - p_i‖ = d_i` for `i` in
/// `positions`, solved from pairwise differences against `positions[0]`
/// as reference. Requires >= 4 non-coplanar beacons.
pub fn compute_toa(positions: &[Vec3], distances: &[f32]) -> SolveStatus {
    let n = positions.len().min(distances.len());
    if n < 4 {
        return SolveStatus::InsufficientBeacons;
    }
    let p0 = positions[0];
    let d0 = distances[0];

    // Try successive triplets from the remaining beacons until a
    // non-coplanar (non-singular) one turns up.
    for i in 1..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let rows = [
                    p0.sub(positions[i]).scale(2.0),
                    p0.sub(positions[j]).scale(2.0),
                    p0.sub(positions[k]).scale(2.0),
                ];
                let rhs = [
                    distances[i].powi(2) - d0.powi(2) - positions[i].dot(positions[i]) + p0.dot(p0),
                    distances[j].powi(2) - d0.powi(2) - positions[j].dot(positions[j]) + p0.dot(p0),
                    distances[k].powi(2) - d0.powi(2) - positions[k].dot(positions[k]) + p0.dot(p0),
                ];
                if let Some(x) = solve3(rows, rhs) {
                    return if x.is_finite() {
                        SolveStatus::Solved(x)
                    } else {
                        SolveStatus::Inaccurate
                    };
                }
            }
        }
    }
    SolveStatus::Coplanar
}

/// TDOA solve from pseudoranges relative to a prime beacon `p0`.
/// Parametrizes `x = a + b * d0` using a non-coplanar triplet of the
/// pseudorange equations, substitutes into `‖x - p0‖² = d0²`, and solves
/// the resulting quadratic, keeping the positive root. Requires >= 4
/// pseudoranges. Rejects (returns `Inaccurate`) if the solution is
/// farther than `sqrt(3) * LATTICE_R` from every participating beacon.
pub fn compute_tdoa(p0: Vec3, beacons: &[(Vec3, f32)]) -> SolveStatus {
    if beacons.len() < 4 {
        return SolveStatus::InsufficientBeacons;
    }
    let n = beacons.len();

    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let (pi, pri) = beacons[i];
                let (pj, prj) = beacons[j];
                let (pk, prk) = beacons[k];
                let rows = [p0.sub(pi).scale(2.0), p0.sub(pj).scale(2.0), p0.sub(pk).scale(2.0)];
                let c = [
                    pri * pri - pi.dot(pi) + p0.dot(p0),
                    prj * prj - pj.dot(pj) + p0.dot(p0),
                    prk * prk - pk.dot(pk) + p0.dot(p0),
                ];
                let e = [2.0 * pri, 2.0 * prj, 2.0 * prk];

                let (a, b) = match (solve3(rows, c), solve3(rows, e)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };

                let u = a.sub(p0);
                let aq = b.dot(b) - 1.0;
                let bq = 2.0 * u.dot(b);
                let cq = u.dot(u);

                let d0 = if aq.abs() < 1e-9 {
                    if bq.abs() < 1e-9 {
                        continue;
                    }
                    -cq / bq
                } else {
                    let disc = bq * bq - 4.0 * aq * cq;
                    if disc < 0.0 {
                        continue;
                    }
                    let sq = disc.sqrt();
                    let r1 = (-bq + sq) / (2.0 * aq);
                    let r2 = (-bq - sq) / (2.0 * aq);
                    match (r1 > 0.0, r2 > 0.0) {
                        (true, true) => r1.min(r2),
                        (true, false) => r1,
                        (false, true) => r2,
                        (false, false) => continue,
                    }
                };

                let x = a.add(b.scale(d0));
                if !x.is_finite() {
                    continue;
                }

                let threshold = 3f32.sqrt() * LATTICE_R;
                let all_beacons_pos = core::iter::once(p0).chain(beacons.iter().map(|(p, _)| *p));
                let min_dist = all_beacons_pos.fold(f32::MAX, |acc, p| acc.min(x.distance(p)));
                if min_dist > threshold {
                    return SolveStatus::Inaccurate;
                }
                return SolveStatus::Solved(x);
            }
        }
    }
    SolveStatus::Coplanar
}

/// Analytic trilateration from exactly three spheres, used as the
/// coplanar fallback when the lattice index is known. Disambiguates the
/// two candidate intersection points using the sign of the triple
/// product against `reference_vec` (a known lattice direction from the
/// index the caller is solving around).
pub fn compute_3sphere(p0: Vec3, p1: Vec3, p2: Vec3, d0: f32, d1: f32, d2: f32, reference_vec: Vec3) -> SolveStatus {
    let ex = p1.sub(p0);
    let d = ex.norm();
    if d < 1e-6 {
        return SolveStatus::Coplanar;
    }
    let ex = ex.scale(1.0 / d);

    let i = ex.dot(p2.sub(p0));
    let temp = p2.sub(p0).sub(ex.scale(i));
    let ey_norm = temp.norm();
    if ey_norm < 1e-6 {
        return SolveStatus::Coplanar;
    }
    let ey = temp.scale(1.0 / ey_norm);
    let ez = ex.cross(ey);

    let j = ey.dot(p2.sub(p0));
    let x = (d0 * d0 - d1 * d1 + d * d) / (2.0 * d);
    let y = (d0 * d0 - d2 * d2 + i * i + j * j - 2.0 * i * x) / (2.0 * j);
    let z2 = d0 * d0 - x * x - y * y;
    if z2 < 0.0 {
        return SolveStatus::Inaccurate;
    }
    let z = z2.sqrt();

    let cand_a = p0.add(ex.scale(x)).add(ey.scale(y)).add(ez.scale(z));
    let cand_b = p0.add(ex.scale(x)).add(ey.scale(y)).add(ez.scale(-z));

    let score_a = cand_a.sub(p0).dot(reference_vec);
    let score_b = cand_b.sub(p0).dot(reference_vec);
    let chosen = if score_a >= score_b { cand_a } else { cand_b };

    if chosen.is_finite() {
        SolveStatus::Solved(chosen)
    } else {
        SolveStatus::Inaccurate
    }
}

/// Bootstrap solver for a node with exactly two known neighbors lying on
/// a common line (used at lattice index 4 when the root has few
/// neighbors): places the node at the one point on the perpendicular
/// bisector plane consistent with both distances, in the plane spanned
/// by the two neighbors and `up`.
pub fn compute_1line(p0: Vec3, p1: Vec3, d0: f32, d1: f32, up: Vec3) -> SolveStatus {
    let ex = p1.sub(p0);
    let d = ex.norm();
    if d < 1e-6 {
        return SolveStatus::Coplanar;
    }
    let ex = ex.scale(1.0 / d);
    let ey = {
        let raw = up.sub(ex.scale(up.dot(ex)));
        let n = raw.norm();
        if n < 1e-6 {
            return SolveStatus::Coplanar;
        }
        raw.scale(1.0 / n)
    };

    let x = (d0 * d0 - d1 * d1 + d * d) / (2.0 * d);
    let y2 = d0 * d0 - x * x;
    if y2 < 0.0 {
        return SolveStatus::Inaccurate;
    }
    let y = y2.sqrt();
    let p = p0.add(ex.scale(x)).add(ey.scale(y));
    if p.is_finite() {
        SolveStatus::Solved(p)
    } else {
        SolveStatus::Inaccurate
    }
}

/// Two-circle bootstrap fallback (lattice indices 9/13), identical
/// construction to `compute_1line` but named separately since the
/// caller selects it under different index-availability conditions.
pub fn compute_2circle(p0: Vec3, p1: Vec3, d0: f32, d1: f32, up: Vec3) -> SolveStatus {
    compute_1line(p0, p1, d0, d1, up)
}

/// Spring-relaxation refinement: nudges `pos`/`vel` one `LOC_DT` Euler
/// step toward consistency with `measurements` (beacon position,
/// measured distance), plus a small pull toward the nearest lattice
/// point and velocity damping.
pub fn springs_step(
    pos: Vec3,
    vel: Vec3,
    measurements: &[(Vec3, f32)],
    spring_k: f32,
    lattice_pull: f32,
    damping: f32,
    dt: f32,
) -> (Vec3, Vec3) {
    let mut force = Vec3::ZERO;
    for &(anchor, natural_len) in measurements {
        let delta = pos.sub(anchor);
        let dist = delta.norm();
        if dist < 1e-6 {
            continue;
        }
        let stretch = dist - natural_len;
        force = force.sub(delta.scale(1.0 / dist).scale(spring_k * stretch));
    }

    let nearest = geometry::quantize(pos);
    force = force.add(nearest.sub(pos).scale(lattice_pull));
    force = force.sub(vel.scale(damping));

    let new_vel = vel.add(force.scale(dt));
    let new_pos = pos.add(new_vel.scale(dt));
    (new_pos, new_vel)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toa_recovers_known_point_exactly() {
        let p0 = Vec3::new(0.0, 0.0, 0.0);
        let p1 = Vec3::new(5.0, 0.0, 0.0);
        let p2 = Vec3::new(5.0, 5.0, 0.0);
        let p3 = Vec3::new(2.5, 2.5, 5.0);
        let x = Vec3::new(1.0, 1.0, 1.0);
        let positions = [p0, p1, p2, p3];
        let distances: [f32; 4] = [
            x.distance(p0),
            x.distance(p1),
            x.distance(p2),
            x.distance(p3),
        ];
        match compute_toa(&positions, &distances) {
            SolveStatus::Solved(sol) => assert!(sol.distance(x) < 1e-3),
            other => panic!("expected solved, got {:?}", other),
        }
    }

    #[test]
    fn toa_needs_four_beacons() {
        let positions = [Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)];
        let distances = [1.0, 1.0];
        assert_eq!(compute_toa(&positions, &distances), SolveStatus::InsufficientBeacons);
    }

    #[test]
    fn tdoa_solves_s6_scenario() {
        let p0 = Vec3::new(0.0, 0.0, 0.0);
        let p1 = Vec3::new(5.0, 0.0, 0.0);
        let p2 = Vec3::new(5.0, 5.0, 0.0);
        let p3 = Vec3::new(0.0, 5.0, 0.0);
        let p4 = Vec3::new(2.5, 2.5, 5.0);
        let x = Vec3::new(2.5, 2.5, 0.0);

        let d0 = x.distance(p0);
        let beacons = [
            (p1, x.distance(p1) - d0),
            (p2, x.distance(p2) - d0),
            (p3, x.distance(p3) - d0),
            (p4, x.distance(p4) - d0),
        ];

        match compute_tdoa(p0, &beacons) {
            SolveStatus::Solved(sol) => assert!(sol.distance(x) < 1e-3, "got {:?}", sol),
            other => panic!("expected solved, got {:?}", other),
        }
    }

    #[test]
    fn tdoa_rejects_far_solution() {
        let p0 = Vec3::new(0.0, 0.0, 0.0);
        let p1 = Vec3::new(1.0, 0.0, 0.0);
        let p2 = Vec3::new(1.0, 1.0, 0.0);
        let p3 = Vec3::new(0.0, 1.0, 0.0);
        let p4 = Vec3::new(0.5, 0.5, 1.0);
        // A point far from this tiny local cluster.
        let x = Vec3::new(500.0, 500.0, 500.0);
        let d0 = x.distance(p0);
        let beacons = [
            (p1, x.distance(p1) - d0),
            (p2, x.distance(p2) - d0),
            (p3, x.distance(p3) - d0),
            (p4, x.distance(p4) - d0),
        ];
        assert_eq!(compute_tdoa(p0, &beacons), SolveStatus::Inaccurate);
    }

    #[test]
    fn springs_step_pulls_toward_anchor() {
        let pos = Vec3::new(2.0, 0.0, 0.0);
        let vel = Vec3::ZERO;
        let measurements = [(Vec3::ZERO, 1.0)];
        let (new_pos, _) = springs_step(pos, vel, &measurements, 1.0, 0.0, 0.1, 0.05);
        assert!(new_pos.x < pos.x);
    }
}
