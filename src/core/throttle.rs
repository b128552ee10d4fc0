//! Accumulated-time throttle driven by caller supplied frame times.

use std::time::Duration;

/// Fires once enough elapsed time has accumulated, keeping the remainder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    interval: Duration,
    accumulated: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            accumulated: Duration::ZERO,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Add `elapsed` and report whether the interval was reached
    pub fn tick(&mut self, elapsed: Duration) -> bool {
        self.accumulated += elapsed;
        if self.accumulated < self.interval {
            return false;
        }
        let interval = self.interval.as_nanos();
        self.accumulated = if interval == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.accumulated.as_nanos() % interval) as u64)
        };
        true
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_accumulates() {
        let mut throttle = Throttle::from_millis(300);
        assert!(!throttle.tick(Duration::from_millis(100)));
        assert!(!throttle.tick(Duration::from_millis(150)));
        assert!(throttle.tick(Duration::from_millis(100)));
        // 50ms carried over
        assert!(!throttle.tick(Duration::from_millis(200)));
        assert!(throttle.tick(Duration::from_millis(50)));
    }

    #[test]
    fn test_zero_interval_always_fires() {
        let mut throttle = Throttle::new(Duration::ZERO);
        assert!(throttle.tick(Duration::ZERO));
        assert!(throttle.tick(Duration::from_millis(1)));
    }
}
