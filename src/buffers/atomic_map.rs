use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A copy-on-write map for tables that are read on every message but change rarely, e.g. the
///  per-peer connection tables.
///
/// Readers grab an `Arc` snapshot and never wait for writers beyond the pointer copy. Writers are
///  serialized and mutate in place if no snapshot is outstanding, otherwise they copy.
pub struct AtomicMap<K, V> {
    map: RwLock<Arc<FxHashMap<K, V>>>,
}
impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Sync + Send, V: Clone + Sync + Send> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        self.map.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.read().unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K, V>) -> R) -> R {
        let mut guard = self.map.write().unwrap_or_else(|e| e.into_inner());
        f(Arc::make_mut(&mut guard))
    }

    /// Returns the value for `key`, inserting the result of `f` if there is none. Concurrent
    ///  callers for the same key all get the same value, and `f` is called at most once per insert.
    pub fn get_or_insert_with(&self, key: &K, f: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(key) {
            return v;
        }
        self.update(|m| m.entry(key.clone()).or_insert_with(f).clone())
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|m| m.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        if !self.contains_key(key) {
            return None;
        }
        self.update(|m| m.remove(key))
    }

    /// removes the value only if it still matches `pred`, guarding against removing a value that
    ///  was replaced concurrently
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        self.update(|m| {
            match m.get(key) {
                Some(v) if pred(v) => m.remove(key),
                _ => None,
            }
        })
    }

    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) {
        self.update(|m| m.retain(f));
    }

    pub fn clear(&self) -> Vec<(K, V)> {
        self.update(|m| m.drain().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
    }

    #[test]
    fn test_snapshot_is_isolated_from_updates() {
        let map = AtomicMap::<u32, u32>::new();
        map.insert(1, 1);
        let snapshot = map.snapshot();
        map.insert(2, 2);
        map.remove(&1);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&1), Some(&1));
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get(&2), Some(2));
    }

    #[test]
    fn test_remove_if() {
        let map = AtomicMap::<u32, u32>::new();
        map.insert(1, 10);
        assert_eq!(map.remove_if(&1, |v| *v == 11), None);
        assert_eq!(map.remove_if(&1, |v| *v == 10), Some(10));
        assert!(map.is_empty());
    }

    #[test]
    fn test_get_or_insert_with_concurrent() {
        let map = Arc::new(AtomicMap::<u32, Arc<u32>>::new());
        let num_created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8).map(|i| {
            let map = map.clone();
            let num_created = num_created.clone();
            thread::spawn(move || {
                let v = map.get_or_insert_with(&5, || {
                    num_created.fetch_add(1, Ordering::AcqRel);
                    Arc::new(i)
                });
                *v
            })
        }).collect();

        let values: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(num_created.load(Ordering::Acquire), 1);
        assert!(values.iter().all(|v| *v == values[0]));
    }

    #[test]
    fn test_concurrent_updates() {
        let map = Arc::new(AtomicMap::<u32, u32>::new());
        let handles: Vec<_> = (0..4).map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    map.insert(t * 1000 + i, i);
                }
            })
        }).collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 4000);
    }
}
