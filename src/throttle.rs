//! Progress throttle (C4, spec §4.2): decides whether a progress delta is
//! large enough to emit an `update` event.

/// Tracks the last *emitted* `current` value for one record and decides
/// whether a new `(current, total)` reading crosses `progress_interval`
/// percent since that emission.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    progress_interval: f64,
    prev_current: f64,
}

impl ProgressThrottle {
    /// `progress_interval` is a percentage (0-100). `0` means "emit on every
    /// byte-count change."
    pub fn new(progress_interval: f64) -> Self {
        Self {
            progress_interval,
            // The very first observation with total > 0 behaves as if the
            // previous percent were 0 (§4.2 edge case).
            prev_current: 0.0,
        }
    }

    /// Returns `true` iff an `update` event should be emitted for this
    /// `didWrite` callback, and records the new baseline when it does.
    pub fn observe(&mut self, current: f64, total: f64) -> bool {
        if total == 0.0 {
            return false;
        }

        if self.progress_interval == 0.0 {
            if current == self.prev_current {
                return false;
            }
            self.prev_current = current;
            return true;
        }

        let before_pct = (self.prev_current * 100.0 / total).floor();
        let curr_pct = (current * 100.0 / total).floor();
        if (curr_pct - before_pct).abs() >= self.progress_interval {
            self.prev_current = current;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_updates_when_total_is_zero() {
        let mut t = ProgressThrottle::new(1.0);
        assert!(!t.observe(10.0, 0.0));
    }

    #[test]
    fn first_update_emits_immediately_once_threshold_crossed() {
        let mut t = ProgressThrottle::new(1.0);
        // 1% of 1_000_000 is 10_000 bytes.
        assert!(!t.observe(5_000.0, 1_000_000.0));
        assert!(t.observe(10_000.0, 1_000_000.0));
    }

    #[test]
    fn subsequent_updates_require_crossing_interval_again() {
        let mut t = ProgressThrottle::new(10.0);
        assert!(t.observe(100_000.0, 1_000_000.0)); // 10%
        assert!(!t.observe(150_000.0, 1_000_000.0)); // 15%, delta 5 < 10
        assert!(t.observe(200_000.0, 1_000_000.0)); // 20%, delta 10
    }

    #[test]
    fn zero_interval_emits_on_every_change() {
        let mut t = ProgressThrottle::new(0.0);
        assert!(t.observe(1.0, 100.0));
        assert!(t.observe(2.0, 100.0));
        assert!(!t.observe(2.0, 100.0));
        assert!(t.observe(3.0, 100.0));
    }

    /// P5: consecutive emitted updates always differ by at least
    /// `progress_interval` percentage points.
    #[test]
    fn emitted_updates_satisfy_minimum_delta_property() {
        let mut t = ProgressThrottle::new(7.0);
        let mut last_emitted_pct: Option<f64> = None;
        for current in (0..=1_000_000u64).step_by(997) {
            let current = current as f64;
            if t.observe(current, 1_000_000.0) {
                let pct = (current * 100.0 / 1_000_000.0).floor();
                if let Some(prev) = last_emitted_pct {
                    assert!((pct - prev).abs() >= 7.0);
                }
                last_emitted_pct = Some(pct);
            }
        }
    }
}
