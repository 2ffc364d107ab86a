use std::cmp::min;
use std::time::Duration;

/// Growing wait intervals for retrying an operation, e.g. inserting into a full send window
pub struct ExponentialBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    factor_eighths: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(5), 16)
    }
}

impl ExponentialBackoff {
    /// `factor_eighths` is the growth factor in eighths, i.e. 16 doubles the interval
    pub fn new(initial: Duration, max: Duration, factor_eighths: u32) -> ExponentialBackoff {
        assert!(factor_eighths >= 8);

        ExponentialBackoff {
            current: initial,
            initial,
            max,
            factor_eighths,
        }
    }

    /// returns the interval to wait now and grows the interval for the next call
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current;
        self.current = min(self.current * self.factor_eighths / 8, self.max);
        result
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
