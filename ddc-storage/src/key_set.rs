//! Mutex-guarded set of keys, used to track in-flight puts.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe set with an atomic test-and-set.
#[derive(Debug)]
pub struct ThreadSafeKeySet<K = String> {
    keys: Mutex<HashSet<K>>,
}

impl<K> Default for ThreadSafeKeySet<K> {
    fn default() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
        }
    }
}

impl<K: Eq + Hash> ThreadSafeKeySet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    // The set holds no invariant a panicking holder could break.
    fn lock(&self) -> MutexGuard<'_, HashSet<K>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: K) {
        self.lock().insert(key);
    }

    /// Insert `key` unless it is already present. Returns false if present.
    pub fn add_if_absent(&self, key: K) -> bool {
        self.lock().insert(key)
    }

    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().remove(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_if_absent() {
        let set: ThreadSafeKeySet = ThreadSafeKeySet::new();
        assert!(set.add_if_absent("a".to_string()));
        assert!(!set.add_if_absent("a".to_string()));
        assert!(set.contains("a"));
        assert_eq!(set.len(), 1);
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let set: ThreadSafeKeySet<u64> = ThreadSafeKeySet::new();
        set.add(1);
        set.add(1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_single_winner_across_threads() {
        let set: Arc<ThreadSafeKeySet> = Arc::new(ThreadSafeKeySet::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let set = Arc::clone(&set);
                thread::spawn(move || set.add_if_absent("contended".to_string()))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
