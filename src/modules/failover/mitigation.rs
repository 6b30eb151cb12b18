//! Brownout step controller (spec §4.H, Design Notes Open Question #2:
//! "the brownout step controller ... is declared but incompletely
//! implemented in source; the spec retains it as an optional gradual-shift
//! mechanism").
//!
//! Not wired automatically into every switch. Callers opt in explicitly via
//! [`FailoverOrchestrator::begin_brownout`] (see `DESIGN.md` resolution #2).

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct BrownoutController {
    pub from: String,
    pub to: String,
    pub max_step_pct: f64,
    pub step_secs: u64,
    pub shifted_pct: f64,
    pub last_step_at: DateTime<Utc>,
}

impl BrownoutController {
    pub fn new(from: String, to: String, max_step_pct: f64, step_secs: u64) -> Self {
        Self {
            from,
            to,
            max_step_pct,
            step_secs,
            shifted_pct: 0.0,
            last_step_at: Utc::now(),
        }
    }

    /// Advance one capped step if `step_secs` has elapsed since the last
    /// step. Returns the pct shifted this call, or `None` if not due yet or
    /// already complete.
    pub fn maybe_step(&mut self, now: DateTime<Utc>) -> Option<f64> {
        if self.shifted_pct >= 100.0 {
            return None;
        }
        if (now - self.last_step_at).num_seconds() < self.step_secs as i64 {
            return None;
        }
        let step = self.max_step_pct.min(100.0 - self.shifted_pct);
        self.shifted_pct += step;
        self.last_step_at = now;
        Some(step)
    }

    pub fn complete(&self) -> bool {
        self.shifted_pct >= 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brownout_caps_each_step() {
        let mut ctrl = BrownoutController::new("a".into(), "b".into(), 10.0, 30);
        let t0 = Utc::now();
        assert_eq!(ctrl.maybe_step(t0), None); // first call seeds last_step_at
        let t1 = t0 + chrono::Duration::seconds(31);
        assert_eq!(ctrl.maybe_step(t1), Some(10.0));
        assert_eq!(ctrl.shifted_pct, 10.0);
    }
}
