//! Progress throttling for running transfers

use std::time::{Duration, Instant};

/// Default minimum spacing between two progress updates
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Default byte delta that forces an update regardless of elapsed time
pub const DEFAULT_PROGRESS_BYTE_DELTA: u64 = 256 * 1024;

/// Limits how often byte counters are published to observers
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_interval: Duration,
    min_bytes: u64,
    last_emit: Option<Instant>,
    last_bytes: u64,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL, DEFAULT_PROGRESS_BYTE_DELTA)
    }
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration, min_bytes: u64) -> Self {
        Self {
            min_interval,
            min_bytes,
            last_emit: None,
            last_bytes: 0,
        }
    }

    /// Whether `bytes` should be published now. Records the emission when true.
    pub fn should_emit(&mut self, bytes: u64) -> bool {
        let delta = bytes.saturating_sub(self.last_bytes);
        if delta == 0 {
            return false;
        }

        let due = match self.last_emit {
            None => true,
            Some(at) => at.elapsed() >= self.min_interval || delta >= self.min_bytes,
        };

        if due {
            self.last_emit = Some(Instant::now());
            self.last_bytes = bytes;
        }
        due
    }

    /// Bytes reported by the last emission
    pub fn last_reported(&self) -> u64 {
        self.last_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_by_bytes() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(3600), 100);
        assert!(throttle.should_emit(10)); // first update always goes out
        assert!(!throttle.should_emit(50));
        assert!(!throttle.should_emit(109));
        assert!(throttle.should_emit(110));
        assert_eq!(throttle.last_reported(), 110);
        assert!(!throttle.should_emit(110));
    }

    #[test]
    fn test_throttle_by_interval() {
        let mut throttle = ProgressThrottle::new(Duration::ZERO, u64::MAX);
        assert!(throttle.should_emit(1));
        assert!(throttle.should_emit(2));
        assert!(!throttle.should_emit(2));
    }
}
