//! DDC Test Utilities
//!
//! Shared test infrastructure for the DDC workspace:
//! - A scriptable in-memory backend with call counters and a put gate
//! - Completion collectors for structured requests
//! - Proptest generators for keys, payloads and records
//! - Fixtures for common records

pub use ddc_core::{
    CacheBucket, CacheKey, CachePolicy, CacheRecord, ChunkRequest, ChunkResponse,
    CompletionStatus, ContentHash, GetRequest, GetResponse, PutRequest, PutResponse, PutStatus,
    SpeedClass, ValueId,
};
pub use ddc_storage::{CacheBackend, UsageStats, UsageStatsNode};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

// ============================================================================
// TEST BACKEND
// ============================================================================

/// Scriptable backend that stores values in a map and counts calls.
///
/// Puts can be held at a gate with [`TestBackend::hold_puts`], made to fail
/// a fixed number of times, or forced to report a status.
pub struct TestBackend {
    name: String,
    writable: bool,
    speed_class: SpeedClass,
    backfills: bool,
    store: Mutex<HashMap<String, Bytes>>,
    forced_status: Mutex<Option<PutStatus>>,
    failing_puts: AtomicU32,
    put_gate: watch::Sender<bool>,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
    exists_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    active_puts: AtomicUsize,
    max_active_puts: AtomicUsize,
    stats: UsageStats,
}

impl TestBackend {
    pub fn new(name: impl Into<String>) -> Self {
        let (put_gate, _) = watch::channel(true);
        Self {
            name: name.into(),
            writable: true,
            speed_class: SpeedClass::Local,
            backfills: true,
            store: Mutex::new(HashMap::new()),
            forced_status: Mutex::new(None),
            failing_puts: AtomicU32::new(0),
            put_gate,
            put_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            exists_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            active_puts: AtomicUsize::new(0),
            max_active_puts: AtomicUsize::new(0),
            stats: UsageStats::new(),
        }
    }

    pub fn with_speed_class(mut self, speed_class: SpeedClass) -> Self {
        self.speed_class = speed_class;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn without_backfill(mut self) -> Self {
        self.backfills = false;
        self
    }

    pub fn with_entry(self, key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(key, data);
        self
    }

    /// The next `count` puts report `NotCached` without storing.
    pub fn failing_puts(self, count: u32) -> Self {
        self.failing_puts.store(count, Ordering::SeqCst);
        self
    }

    /// Every put reports `status`; only `Cached` stores the value.
    pub fn set_put_status(&self, status: Option<PutStatus>) {
        *self.forced_status.lock().unwrap() = status;
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Insert directly, bypassing the put path and its counters.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.store.lock().unwrap().insert(key.into(), data.into());
    }

    pub fn stored(&self, key: &str) -> Option<Bytes> {
        self.store.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block puts until [`TestBackend::release_puts`].
    pub fn hold_puts(&self) {
        self.put_gate.send_replace(false);
    }

    pub fn release_puts(&self) {
        self.put_gate.send_replace(true);
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Puts currently past the gate and not yet returned.
    pub fn active_puts(&self) -> usize {
        self.active_puts.load(Ordering::SeqCst)
    }

    pub fn max_active_puts(&self) -> usize {
        self.max_active_puts.load(Ordering::SeqCst)
    }

    fn put_status(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return PutStatus::NotCached;
        }
        let forced = *self.forced_status.lock().unwrap();
        match forced {
            Some(status) if status != PutStatus::Cached => status,
            _ => {
                let mut store = self.store.lock().unwrap();
                if force_overwrite || !store.contains_key(key) {
                    store.insert(key.to_string(), data);
                }
                PutStatus::Cached
            }
        }
    }
}

#[async_trait]
impl CacheBackend for TestBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn speed_class(&self) -> SpeedClass {
        self.speed_class
    }

    fn backfills_lower_levels(&self) -> bool {
        self.backfills
    }

    async fn exists(&self, key: &str) -> bool {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.contains(key)
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.stored(key);
        self.stats.record_get(data.as_ref().map(|d| d.len()));
        data
    }

    async fn put(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if !self.writable {
            return PutStatus::NotCached;
        }

        let mut gate = self.put_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let active = self.active_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_puts.fetch_max(active, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let bytes = data.len();
        let status = self.put_status(key, data, force_overwrite);
        self.active_puts.fetch_sub(1, Ordering::SeqCst);
        self.stats.record_put(status, bytes);
        status
    }

    async fn remove(&self, key: &str, _transient: bool) {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if !self.writable {
            return;
        }
        if self.store.lock().unwrap().remove(key).is_some() {
            self.stats.record_remove();
        }
    }

    fn usage_stats(&self) -> UsageStatsNode {
        UsageStatsNode::leaf(self.name.clone(), "test", self.stats.snapshot())
    }
}

// ============================================================================
// COMPLETION COLLECTORS
// ============================================================================

/// Collects structured completions for later assertions.
pub struct Collector<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone + Send + 'static> Collector<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> Arc<dyn Fn(T) + Send + Sync> {
        let items = Arc::clone(&self.items);
        Arc::new(move |item: T| items.lock().unwrap().push(item))
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for Collector<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common records and keys.

    use super::*;

    pub fn bucket(name: &str) -> CacheBucket {
        CacheBucket::new(name).unwrap()
    }

    /// Key in `bucket` addressed by the hash of `content`.
    pub fn key(bucket_name: &str, content: &str) -> CacheKey {
        CacheKey::for_content(bucket(bucket_name), content.as_bytes())
    }

    /// Record with an inline value, one attachment and a meta field.
    pub fn record(bucket_name: &str, content: &str) -> CacheRecord {
        CacheRecord::builder(key(bucket_name, content))
            .meta_field("source", content)
            .value(Bytes::copy_from_slice(content.as_bytes()))
            .attachment(
                ValueId::from_name("derived"),
                Bytes::from(format!("{content}-derived")),
            )
            .build()
            .unwrap()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for DDC types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_bucket() -> impl Strategy<Value = CacheBucket> {
        "[A-Za-z][A-Za-z0-9_]{0,15}".prop_map(|name| CacheBucket::new(name).unwrap())
    }

    pub fn arb_content_hash() -> impl Strategy<Value = ContentHash> {
        any::<[u8; 32]>().prop_map(ContentHash::from_bytes)
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (arb_bucket(), arb_content_hash()).prop_map(|(bucket, hash)| CacheKey::new(bucket, hash))
    }

    pub fn arb_payload() -> impl Strategy<Value = Bytes> {
        prop::collection::vec(any::<u8>(), 0..512).prop_map(Bytes::from)
    }

    pub fn arb_value_id() -> impl Strategy<Value = ValueId> {
        any::<[u8; 12]>()
            .prop_filter("null id is reserved", |bytes| bytes.iter().any(|b| *b != 0))
            .prop_map(ValueId::from_bytes)
    }

    pub fn arb_record() -> impl Strategy<Value = CacheRecord> {
        (
            arb_cache_key(),
            prop::option::of(arb_payload()),
            prop::collection::btree_map(arb_value_id(), arb_payload(), 0..4),
            "[a-z]{0,12}",
        )
            .prop_map(|(key, value, attachments, label)| {
                let mut builder = CacheRecord::builder(key).meta_field("label", label);
                if let Some(value) = value {
                    builder = builder.value(value);
                }
                for (id, data) in attachments {
                    builder = builder.attachment(id, data);
                }
                builder.build().unwrap()
            })
    }
}
