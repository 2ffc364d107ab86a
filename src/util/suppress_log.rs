use crate::node_addr::NodeAddr;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Rate limits repetitive warnings per peer, e.g. about messages from non-members
pub struct SuppressLog {
    suppress_time: Duration,
    last_logged: Mutex<FxHashMap<NodeAddr, Instant>>,
}

impl SuppressLog {
    pub fn new(suppress_time: Duration) -> SuppressLog {
        SuppressLog {
            suppress_time,
            last_logged: Mutex::new(FxHashMap::default()),
        }
    }

    /// returns `true` if a warning about `addr` should be logged now
    pub fn should_log(&self, addr: &NodeAddr) -> bool {
        if self.suppress_time.is_zero() {
            return true;
        }

        let now = Instant::now();
        let mut last_logged = self.last_logged.lock().unwrap_or_else(|e| e.into_inner());
        match last_logged.get(addr) {
            Some(&t) if now.duration_since(t) < self.suppress_time => false,
            _ => {
                last_logged.insert(*addr, now);
                true
            }
        }
    }

    pub fn remove_expired(&self) {
        let now = Instant::now();
        self.last_logged.lock().unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| now.duration_since(*t) < self.suppress_time);
    }
}
