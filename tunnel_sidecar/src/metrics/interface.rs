/// Turns raw cumulative interface readings into a lifetime counter.
///
/// The first reading becomes the baseline. A reading below the previous one
/// means the interface was recreated and its counters restarted at zero; the
/// total accumulated so far is carried over so the result never goes back.
#[derive(Debug, Clone, Default)]
pub struct ByteCounterTracker {
    baseline: Option<u64>,
    last_raw: u64,
    carried: u64,
    total: u64,
}

impl ByteCounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a reading and return how much the counter grew.
    pub fn observe(&mut self, raw: u64) -> u64 {
        let Some(baseline) = self.baseline else {
            self.baseline = Some(raw);
            self.last_raw = raw;
            return 0;
        };

        if raw < self.last_raw {
            // Counters restarted; everything before is already in `total`
            self.carried = self.total;
            self.baseline = Some(0);
            self.last_raw = raw;
            return self.apply(self.carried.saturating_add(raw));
        }

        self.last_raw = raw;
        self.apply(self.carried.saturating_add(raw - baseline))
    }

    fn apply(&mut self, candidate: u64) -> u64 {
        if candidate <= self.total {
            return 0;
        }
        let delta = candidate - self.total;
        self.total = candidate;
        delta
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reading_is_baseline() {
        let mut tracker = ByteCounterTracker::new();
        assert_eq!(tracker.observe(5000), 0);
        assert_eq!(tracker.observe(5600), 600);
        assert_eq!(tracker.total(), 600);
    }

    #[test]
    fn test_reset_carries_total() {
        let mut tracker = ByteCounterTracker::new();
        tracker.observe(1000);
        tracker.observe(3000);
        assert_eq!(tracker.total(), 2000);

        // Interface recreated
        assert_eq!(tracker.observe(100), 100);
        assert_eq!(tracker.total(), 2100);
        assert_eq!(tracker.observe(400), 300);
        assert_eq!(tracker.total(), 2400);
    }

    #[test]
    fn test_repeated_reading_adds_nothing() {
        let mut tracker = ByteCounterTracker::new();
        tracker.observe(10);
        tracker.observe(20);
        assert_eq!(tracker.observe(20), 0);
        assert_eq!(tracker.total(), 10);
    }
}
