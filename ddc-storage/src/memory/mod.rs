//! Bounded in-memory cache backend.
//!
//! Entries are kept until removed; the budget bounds total size rather than
//! evicting by recency. Once a put would exceed the budget the cache is
//! marked over-budget and rejects further puts until a remove clears the
//! mark.
//!
//! # Locking
//!
//! A reader/writer lock guards the key map and size counters, and each entry
//! carries its own reader/writer lock around its bytes. Writers link a new
//! entry while holding its write lock and publish the bytes after releasing
//! the map lock. Readers clone the entry handle under the map read lock and
//! copy the bytes out under the entry lock only.

mod snapshot;

pub use snapshot::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use ddc_core::{DdcResult, MemoryCacheConfig, PutStatus, SpeedClass};

use crate::backend::CacheBackend;
use crate::stats::{UsageStats, UsageStatsNode};

/// Fixed per-entry bookkeeping charged against the budget.
pub const ENTRY_OVERHEAD: u64 = 16;

/// Snapshot header (magic, version) plus footer (length, SHA-256).
pub const SNAPSHOT_OVERHEAD: u64 = 4 + 4 + 8 + 32;

struct CacheValue {
    /// Number of snapshot loads since the entry was last read.
    age: AtomicU32,
    size: u64,
    data: RwLock<Bytes>,
}

impl CacheValue {
    fn new(age: u32, size: u64) -> Arc<Self> {
        Arc::new(Self {
            age: AtomicU32::new(age),
            size,
            data: RwLock::new(Bytes::new()),
        })
    }

    fn read(&self) -> Bytes {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct MemoryState {
    items: HashMap<String, Arc<CacheValue>>,
    current_size: u64,
    max_size_exceeded: bool,
}

pub struct MemoryCacheBackend {
    name: String,
    config: MemoryCacheConfig,
    speed_class: SpeedClass,
    state: RwLock<MemoryState>,
    disabled: AtomicBool,
    stats: UsageStats,
}

impl std::fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBackend")
            .field("name", &self.name)
            .field("entries", &self.len())
            .field("current_size", &self.current_size())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl MemoryCacheBackend {
    pub fn new(name: impl Into<String>, config: MemoryCacheConfig) -> DdcResult<Self> {
        config.validate()?;
        Ok(Self::unchecked(name.into(), config))
    }

    /// Unbounded cache with default settings.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::unchecked(name.into(), MemoryCacheConfig::default())
    }

    fn unchecked(name: String, config: MemoryCacheConfig) -> Self {
        Self {
            name,
            config,
            speed_class: SpeedClass::Local,
            state: RwLock::new(MemoryState {
                items: HashMap::new(),
                current_size: SNAPSHOT_OVERHEAD,
                max_size_exceeded: false,
            }),
            disabled: AtomicBool::new(false),
            stats: UsageStats::new(),
        }
    }

    /// Report a different speed class, for tests of tier ordering.
    pub fn with_speed_class(mut self, speed_class: SpeedClass) -> Self {
        self.speed_class = speed_class;
        self
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes charged against the budget for one entry.
    pub fn serialized_size(key: &str, data: &[u8]) -> u64 {
        key.len() as u64 + data.len() as u64 + ENTRY_OVERHEAD
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.read_state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes charged against the budget, including snapshot overhead.
    pub fn current_size(&self) -> u64 {
        self.read_state().current_size
    }

    pub fn is_over_budget(&self) -> bool {
        self.read_state().max_size_exceeded
    }

    // ========================================================================
    // SYNCHRONOUS OPERATIONS
    // ========================================================================

    pub fn probe(&self, key: &str) -> bool {
        if self.is_disabled() {
            return false;
        }
        self.read_state().items.contains_key(key)
    }

    pub fn fetch(&self, key: &str) -> Option<Bytes> {
        if self.is_disabled() {
            return None;
        }
        let value = {
            let state = self.read_state();
            Arc::clone(state.items.get(key)?)
        };
        value.age.store(0, Ordering::Relaxed);
        Some(value.read())
    }

    pub fn store(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        self.insert(key, data, force_overwrite, 0)
    }

    fn insert(&self, key: &str, data: Bytes, force_overwrite: bool, age: u32) -> PutStatus {
        let size = Self::serialized_size(key, &data);
        let value = CacheValue::new(age, size);
        let mut slot = value.data.write().unwrap_or_else(|e| e.into_inner());
        {
            let mut state = self.write_state();
            if self.is_disabled() || state.max_size_exceeded {
                return PutStatus::NotCached;
            }

            let replaced = match state.items.get(key) {
                Some(_) if !force_overwrite => return PutStatus::Cached,
                Some(existing) => existing.size,
                None => 0,
            };

            let new_size = state.current_size - replaced + size;
            if let Some(max) = self.config.max_cache_size_bytes {
                if new_size > max {
                    state.max_size_exceeded = true;
                    tracing::debug!(
                        cache = %self.name,
                        key,
                        size,
                        current_size = state.current_size,
                        max_size = max,
                        "Memory cache budget exceeded"
                    );
                    return PutStatus::NotCached;
                }
            }

            state.current_size = new_size;
            state.items.insert(key.to_string(), Arc::clone(&value));
        }
        *slot = data;
        PutStatus::Cached
    }

    /// Remove `key`. Skipped when `transient` is set or the cache is disabled.
    pub fn evict(&self, key: &str, transient: bool) -> bool {
        if transient || self.is_disabled() {
            return false;
        }
        let mut state = self.write_state();
        let removed = state.items.remove(key);
        if let Some(value) = &removed {
            state.current_size -= value.size;
            state.max_size_exceeded = false;
        }
        removed.is_some()
    }

    /// Evict everything and stop accepting puts. One-way; only honoured when
    /// `allow_disable` is configured.
    pub fn disable(&self) -> bool {
        if !self.config.allow_disable {
            return false;
        }
        if self.disabled.swap(true, Ordering::AcqRel) {
            return true;
        }
        let mut state = self.write_state();
        let evicted = state.items.len();
        state.items.clear();
        state.current_size = SNAPSHOT_OVERHEAD;
        state.max_size_exceeded = false;
        tracing::info!(cache = %self.name, evicted, "Memory cache disabled");
        true
    }

    /// Entries as `(key, age, data)`, sorted by key.
    fn entries(&self) -> Vec<(String, u32, Bytes)> {
        let values: Vec<(String, Arc<CacheValue>)> = {
            let state = self.read_state();
            state
                .items
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };
        let mut entries: Vec<_> = values
            .into_iter()
            .map(|(k, v)| (k, v.age.load(Ordering::Relaxed), v.read()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        !self.is_disabled()
    }

    fn speed_class(&self) -> SpeedClass {
        self.speed_class
    }

    async fn exists(&self, key: &str) -> bool {
        let found = self.probe(key);
        tracing::trace!(cache = %self.name, key, found, "Memory cache exists");
        found
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        let data = self.fetch(key);
        self.stats.record_get(data.as_ref().map(|d| d.len()));
        tracing::trace!(cache = %self.name, key, hit = data.is_some(), "Memory cache get");
        data
    }

    async fn put(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        let len = data.len();
        let status = self.store(key, data, force_overwrite);
        self.stats.record_put(status, len);
        tracing::trace!(cache = %self.name, key, status = ?status, "Memory cache put");
        status
    }

    async fn remove(&self, key: &str, transient: bool) {
        if self.evict(key, transient) {
            self.stats.record_remove();
        }
    }

    fn usage_stats(&self) -> UsageStatsNode {
        UsageStatsNode::leaf(self.name.clone(), "memory", self.stats.snapshot())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(max: u64) -> MemoryCacheBackend {
        MemoryCacheBackend::new("Test", MemoryCacheConfig::new().with_max_size(max))
            .expect("valid config")
    }

    fn budget_for(entries: &[(&str, usize)]) -> u64 {
        SNAPSHOT_OVERHEAD
            + entries
                .iter()
                .map(|(k, len)| k.len() as u64 + *len as u64 + ENTRY_OVERHEAD)
                .sum::<u64>()
    }

    #[test]
    fn test_store_and_fetch() {
        let cache = MemoryCacheBackend::unbounded("Test");
        assert_eq!(cache.store("k", Bytes::from_static(b"v"), false), PutStatus::Cached);
        assert!(cache.probe("k"));
        assert_eq!(cache.fetch("k").as_deref(), Some(&b"v"[..]));
        assert!(cache.fetch("missing").is_none());
    }

    #[test]
    fn test_idempotent_put_keeps_first_value() {
        let cache = MemoryCacheBackend::unbounded("Test");
        cache.store("k", Bytes::from_static(b"first"), false);
        let size = cache.current_size();

        assert_eq!(cache.store("k", Bytes::from_static(b"second"), false), PutStatus::Cached);
        assert_eq!(cache.current_size(), size);
        assert_eq!(cache.fetch("k").as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn test_force_overwrite_replaces_and_reaccounts() {
        let cache = MemoryCacheBackend::unbounded("Test");
        cache.store("k", Bytes::from_static(b"abc"), false);
        assert_eq!(cache.store("k", Bytes::from_static(b"abcdef"), true), PutStatus::Cached);
        assert_eq!(cache.fetch("k").as_deref(), Some(&b"abcdef"[..]));
        assert_eq!(cache.current_size(), budget_for(&[("k", 6)]));
    }

    #[test]
    fn test_budget_boundary() {
        let cache = bounded(budget_for(&[("a", 4), ("b", 4)]));
        assert_eq!(cache.store("a", Bytes::from_static(b"1234"), false), PutStatus::Cached);
        assert_eq!(cache.store("b", Bytes::from_static(b"1234"), false), PutStatus::Cached);

        assert_eq!(cache.store("c", Bytes::from_static(b"x"), false), PutStatus::NotCached);
        assert!(!cache.probe("c"));
        assert!(cache.is_over_budget());

        // Marked over budget: even a tiny put is rejected until a remove.
        assert_eq!(cache.store("d", Bytes::new(), false), PutStatus::NotCached);
        assert!(cache.evict("a", false));
        assert!(!cache.is_over_budget());
        assert_eq!(cache.store("d", Bytes::new(), false), PutStatus::Cached);
    }

    #[test]
    fn test_removing_absent_key_keeps_budget_latch() {
        let cache = bounded(budget_for(&[("a", 4)]));
        cache.store("a", Bytes::from_static(b"1234"), false);
        assert_eq!(cache.store("b", Bytes::from_static(b"1234"), false), PutStatus::NotCached);
        assert!(cache.is_over_budget());

        assert!(!cache.evict("b", false));
        assert!(cache.is_over_budget());
        assert_eq!(cache.store("c", Bytes::new(), false), PutStatus::NotCached);
    }

    #[test]
    fn test_transient_remove_is_ignored() {
        let cache = MemoryCacheBackend::unbounded("Test");
        cache.store("k", Bytes::from_static(b"v"), false);
        assert!(!cache.evict("k", true));
        assert!(cache.probe("k"));
        assert!(cache.evict("k", false));
        assert!(!cache.probe("k"));
        assert_eq!(cache.current_size(), SNAPSHOT_OVERHEAD);
    }

    #[test]
    fn test_disable_requires_allow_disable() {
        let cache = MemoryCacheBackend::unbounded("Test");
        cache.store("k", Bytes::from_static(b"v"), false);
        assert!(!cache.disable());
        assert!(cache.probe("k"));
    }

    #[tokio::test]
    async fn test_disable_evicts_and_rejects() {
        let cache = MemoryCacheBackend::new(
            "Test",
            MemoryCacheConfig::new().with_allow_disable(true),
        )
        .expect("valid config");
        cache.store("k", Bytes::from_static(b"v"), false);

        assert!(cache.disable());
        assert!(cache.disable());
        assert!(!cache.is_writable());
        assert!(!cache.exists("k").await);
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.put("k", Bytes::from_static(b"v"), false).await, PutStatus::NotCached);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stats_reported() {
        let cache = MemoryCacheBackend::unbounded("Boot");
        cache.put("k", Bytes::from_static(b"v"), false).await;
        cache.get("k").await;
        cache.get("missing").await;
        let node = cache.usage_stats();
        assert_eq!(node.name, "Boot");
        assert_eq!(node.kind, "memory");
        assert_eq!(node.stats.hits, 1);
        assert_eq!(node.stats.misses, 1);
        assert_eq!(node.stats.puts_cached, 1);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(MemoryCacheBackend::unbounded("Test"));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("key-{}", i % 10);
                        cache.store(&key, Bytes::from(vec![t as u8; 8]), false);
                        if let Some(data) = cache.fetch(&key) {
                            assert_eq!(data.len(), 8);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(cache.len(), 10);
        assert_eq!(
            cache.current_size(),
            SNAPSHOT_OVERHEAD + 10 * ("key-0".len() as u64 + 8 + ENTRY_OVERHEAD)
        );
    }
}
