use std::time::Duration;
use tokio::time::Instant;

/// Millisecond timestamps relative to a fixed start, so they fit into atomics. Based on tokio's
///  clock to allow pausing and advancing time in tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

impl Clock {
    pub fn new() -> Clock {
        Clock { start: Instant::now() }
    }

    pub fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_since(&self, millis: u64) -> Duration {
        Duration::from_millis(self.now_millis().saturating_sub(millis))
    }
}
