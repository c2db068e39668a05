//! Reconnect backoff schedule

use std::time::Duration;

/// Default reconnect delays in milliseconds
pub const DEFAULT_BACKOFF_MS: [u64; 9] = [100, 200, 500, 1000, 1000, 2000, 2000, 5000, 5000];

/// Outcome of asking the schedule for the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Try again after the delay
    After(Duration),
    /// Schedule used up; the peer is considered gone
    Exhausted,
    /// Retries were turned off
    Disabled,
}

/// Walks a fixed list of delays, one per consecutive failure
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    position: usize,
    disabled: bool,
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, position: 0, disabled: false }
    }

    pub fn from_millis(schedule: &[u64]) -> Self {
        Self::new(schedule.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    pub fn default_schedule() -> Vec<Duration> {
        DEFAULT_BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }

    /// Delay before the next attempt
    pub fn next(&mut self) -> Retry {
        if self.disabled {
            return Retry::Disabled;
        }
        match self.schedule.get(self.position) {
            Some(delay) => {
                self.position += 1;
                Retry::After(*delay)
            }
            None => Retry::Exhausted,
        }
    }

    /// Start over after a successful connect
    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> usize {
        self.position
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::default_schedule())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_then_exhausted() {
        let mut backoff = Backoff::from_millis(&[10, 20]);
        assert_eq!(backoff.next(), Retry::After(Duration::from_millis(10)));
        assert_eq!(backoff.next(), Retry::After(Duration::from_millis(20)));
        assert_eq!(backoff.next(), Retry::Exhausted);
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::default();
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Retry::After(Duration::from_millis(100)));
    }

    #[test]
    fn test_disabled() {
        let mut backoff = Backoff::default();
        backoff.disable();
        assert!(backoff.is_disabled());
        assert_eq!(backoff.next(), Retry::Disabled);
        backoff.reset();
        assert_eq!(backoff.next(), Retry::Disabled);
    }

    #[test]
    fn test_empty_schedule_exhausts_immediately() {
        let mut backoff = Backoff::new(Vec::new());
        assert_eq!(backoff.next(), Retry::Exhausted);
    }
}
