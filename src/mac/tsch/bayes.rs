//! Bayesian contention estimator for shared (contended) slots.
//!
//! Tracks a scalar `v >= 1`; the access probability offered to a
//! transmission attempt in a shared slot is `1 / v`. A successful
//! transmission nudges `v` down (raising future access probability); an
//! observed collision nudges it up; an idle ("hole") slot nudges it down
//! more gently than a success, since a hole means nobody contended at
//! all. The scheme is stable (does not diverge) for arrival rates below
//! `1/e`.

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContentionEstimator {
    v: f32,
}

impl ContentionEstimator {
    pub fn new() -> Self {
        ContentionEstimator { v: 1.0 }
    }

    /// Current access probability for this shared slot, in `(0, 1]`.
    pub fn access_probability(&self) -> f32 {
        1.0 / self.v
    }

    pub fn on_success(&mut self) {
        self.v = (self.v - 1.0).max(1.0);
    }

    pub fn on_hole(&mut self) {
        let e = core::f32::consts::E;
        self.v = (self.v * (1.0 - 1.0 / (self.v * e))).max(1.0);
    }

    pub fn on_collision(&mut self) {
        let e = core::f32::consts::E;
        self.v *= 1.0 + 1.0 / (self.v * (e - 2.0));
    }
}

impl Default for ContentionEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_at_full_access_probability() {
        let c = ContentionEstimator::new();
        assert_eq!(c.access_probability(), 1.0);
    }

    #[test]
    fn collision_lowers_access_probability_monotonically() {
        let mut c = ContentionEstimator::new();
        let p0 = c.access_probability();
        c.on_collision();
        let p1 = c.access_probability();
        assert!(p1 < p0);
        c.on_collision();
        assert!(c.access_probability() < p1);
    }

    #[test]
    fn v_never_drops_below_one() {
        let mut c = ContentionEstimator::new();
        for _ in 0..100 {
            c.on_success();
            c.on_hole();
        }
        assert!(c.access_probability() <= 1.0);
        assert!(c.access_probability() >= 1.0 / 1.000_001);
    }

    #[test]
    fn recovers_after_sustained_success() {
        let mut c = ContentionEstimator::new();
        for _ in 0..5 {
            c.on_collision();
        }
        let congested = c.access_probability();
        for _ in 0..50 {
            c.on_success();
        }
        assert!(c.access_probability() > congested);
    }
}
