use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Keys with the time they were added, expiring after a fixed timeout. Used to rate limit
///  requests per peer and to age out connections to peers that are not members.
pub struct ExpiryCache<K> {
    timeout: Duration,
    entries: Mutex<FxHashMap<K, Instant>>,
}

impl<K: Hash + Eq + Clone> ExpiryCache<K> {
    pub fn new(timeout: Duration) -> ExpiryCache<K> {
        ExpiryCache {
            timeout,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Adds the key unless it is present and not expired. Returns `true` if it was (re)added.
    pub fn add_if_absent_or_expired(&self, key: K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&key) {
            Some(&added) if now.duration_since(added) < self.timeout => false,
            _ => {
                entries.insert(key, now);
                true
            }
        }
    }

    /// adds the key unless it is present, keeping the original time
    pub fn add_if_absent(&self, key: K) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert_with(Instant::now);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    pub fn retain(&self, mut f: impl FnMut(&K) -> bool) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| f(k));
    }

    /// removes expired keys, returning them
    pub fn take_expired(&self) -> Vec<K> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
            .retain(|k, added| {
                if now.duration_since(*added) >= self.timeout {
                    expired.push(k.clone());
                    false
                }
                else {
                    true
                }
            });
        expired
    }

    pub fn remove_expired(&self) {
        self.take_expired();
    }
}
