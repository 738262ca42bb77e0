//! Write-behind wrapper.
//!
//! [`AsyncPutBackend`] accepts a put, returns `Executing` immediately and
//! writes to the inner backend on a background task. At most one put per
//! key is in flight; overlapping puts are coalesced. With
//! `cache_in_flight_puts` the data is kept in a memory shadow while the
//! write is in flight so concurrent readers see it.
//!
//! Re-putting a key whose shadow copy is still present is treated as a
//! duplicate: callers must only ever put identical data under one key.

mod request;

pub use request::AsyncRequest;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ddc_core::{
    AsyncPutConfig, ChunkRequest, DdcResult, GetRequest, Locality, PutRequest, PutStatus,
    SpeedClass,
};

use crate::backend::{CacheBackend, OnChunkComplete, OnGetComplete, OnPutComplete};
use crate::key_set::ThreadSafeKeySet;
use crate::memory::MemoryCacheBackend;
use crate::runtime::{CacheRuntime, RequestOwner};
use crate::stats::{UsageStats, UsageStatsNode};
use request::AsyncOperation;

pub struct AsyncPutBackend {
    name: String,
    inner: Arc<dyn CacheBackend>,
    shadow: Option<Arc<MemoryCacheBackend>>,
    in_flight: Arc<ThreadSafeKeySet>,
    runtime: Arc<CacheRuntime>,
    config: AsyncPutConfig,
    stats: Arc<UsageStats>,
}

impl AsyncPutBackend {
    pub fn new(
        inner: Arc<dyn CacheBackend>,
        runtime: Arc<CacheRuntime>,
        config: AsyncPutConfig,
    ) -> DdcResult<Self> {
        config.validate()?;
        let name = format!("AsyncPut({})", inner.name());
        let shadow = if config.cache_in_flight_puts {
            let shadow = MemoryCacheBackend::new(
                format!("{} InFlight", inner.name()),
                config.shadow_config(),
            )?;
            Some(Arc::new(shadow))
        } else {
            None
        };
        Ok(Self {
            name,
            inner,
            shadow,
            in_flight: Arc::new(ThreadSafeKeySet::new()),
            runtime,
            config,
            stats: Arc::new(UsageStats::new()),
        })
    }

    pub fn inner(&self) -> &Arc<dyn CacheBackend> {
        &self.inner
    }

    pub fn shadow(&self) -> Option<&Arc<MemoryCacheBackend>> {
        self.shadow.as_ref()
    }

    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    /// Inline when the owner blocks or there is nobody to hand work to.
    fn runs_inline(&self, owner: &RequestOwner) -> bool {
        owner.is_blocking() || !self.runtime.has_workers()
    }
}

#[async_trait]
impl CacheBackend for AsyncPutBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn speed_class(&self) -> SpeedClass {
        self.inner.speed_class()
    }

    fn backfills_lower_levels(&self) -> bool {
        self.inner.backfills_lower_levels()
    }

    fn locality(&self) -> Locality {
        self.inner.locality()
    }

    async fn exists(&self, key: &str) -> bool {
        if self.shadow.as_ref().is_some_and(|s| s.probe(key)) {
            return true;
        }
        self.inner.exists(key).await
    }

    async fn exists_batch(&self, keys: &[String]) -> Vec<bool> {
        let mut result = vec![false; keys.len()];
        let mut remaining = Vec::new();
        let mut remaining_keys = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            if self.shadow.as_ref().is_some_and(|s| s.probe(key)) {
                result[index] = true;
            } else {
                remaining.push(index);
                remaining_keys.push(key.clone());
            }
        }
        if !remaining_keys.is_empty() {
            let found = self.inner.exists_batch(&remaining_keys).await;
            for (index, hit) in remaining.into_iter().zip(found) {
                result[index] = hit;
            }
        }
        result
    }

    async fn try_to_prefetch(&self, keys: &[String]) -> bool {
        self.inner.try_to_prefetch(keys).await
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(data) = self.shadow.as_ref().and_then(|s| s.fetch(key)) {
            tracing::trace!(backend = %self.name, key, "Hit in-flight shadow");
            self.stats.record_get(Some(data.len()));
            return Some(data);
        }
        let data = self.inner.get(key).await;
        self.stats.record_get(data.as_ref().map(|d| d.len()));
        data
    }

    async fn put(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        if !self.inner.is_writable() {
            self.stats.record_put(PutStatus::NotCached, data.len());
            return PutStatus::NotCached;
        }

        if !self.in_flight.add_if_absent(key.to_string()) {
            tracing::trace!(backend = %self.name, key, "Put already in flight, coalesced");
            self.stats.record_put(PutStatus::Executing, data.len());
            return PutStatus::Executing;
        }

        if let Some(shadow) = &self.shadow {
            if shadow.probe(key) {
                // Kept after an earlier failed write; identical data assumed.
                self.in_flight.remove(key);
                self.stats.record_put(PutStatus::Executing, data.len());
                return PutStatus::Executing;
            }
            shadow.store(key, data.clone(), force_overwrite);
        }

        self.stats.record_put(PutStatus::Executing, data.len());
        let task = InFlightPut {
            key: key.to_string(),
            data,
            force_overwrite,
            inner: Arc::clone(&self.inner),
            shadow: self.shadow.clone(),
            in_flight: Arc::clone(&self.in_flight),
            runtime: Arc::clone(&self.runtime),
            max_retries: self.config.max_put_retries,
            retry_delay: self.config.retry_delay(),
        };
        self.runtime.spawn_tracked(task.run());
        PutStatus::Executing
    }

    async fn remove(&self, key: &str, transient: bool) {
        if !self.inner.is_writable() {
            return;
        }
        while self.in_flight.contains(key) {
            tokio::task::yield_now().await;
        }
        if let Some(shadow) = &self.shadow {
            shadow.evict(key, false);
        }
        self.inner.remove(key, transient).await;
        self.stats.record_remove();
    }

    fn usage_stats(&self) -> UsageStatsNode {
        let node = UsageStatsNode::leaf(self.name.clone(), "async_put", self.stats.snapshot())
            .with_child(self.inner.usage_stats());
        match &self.shadow {
            Some(shadow) => node.with_child(shadow.usage_stats()),
            None => node,
        }
    }

    async fn put_records(
        &self,
        requests: Vec<PutRequest>,
        owner: &RequestOwner,
        on_complete: OnPutComplete,
    ) {
        if self.runs_inline(owner) {
            return self.inner.put_records(requests, owner, on_complete).await;
        }
        AsyncRequest::launch(
            Arc::clone(&self.inner),
            Arc::clone(&self.runtime),
            owner,
            AsyncOperation::Put {
                requests,
                on_complete,
            },
        );
    }

    async fn get_records(
        &self,
        requests: Vec<GetRequest>,
        owner: &RequestOwner,
        on_complete: OnGetComplete,
    ) {
        if self.runs_inline(owner) {
            return self.inner.get_records(requests, owner, on_complete).await;
        }
        AsyncRequest::launch(
            Arc::clone(&self.inner),
            Arc::clone(&self.runtime),
            owner,
            AsyncOperation::Get {
                requests,
                on_complete,
            },
        );
    }

    async fn get_chunks(
        &self,
        requests: Vec<ChunkRequest>,
        owner: &RequestOwner,
        on_complete: OnChunkComplete,
    ) {
        if self.runs_inline(owner) {
            return self.inner.get_chunks(requests, owner, on_complete).await;
        }
        AsyncRequest::launch(
            Arc::clone(&self.inner),
            Arc::clone(&self.runtime),
            owner,
            AsyncOperation::Chunks {
                requests,
                on_complete,
            },
        );
    }
}

// ============================================================================
// WRITE-BEHIND TASK
// ============================================================================

/// State of one write-behind put, owned by its task.
struct InFlightPut {
    key: String,
    data: Bytes,
    force_overwrite: bool,
    inner: Arc<dyn CacheBackend>,
    shadow: Option<Arc<MemoryCacheBackend>>,
    in_flight: Arc<ThreadSafeKeySet>,
    runtime: Arc<CacheRuntime>,
    max_retries: u32,
    retry_delay: Duration,
}

impl InFlightPut {
    async fn run(self) {
        if self.runtime.is_shutting_down() && self.inner.speed_class() != SpeedClass::Local {
            tracing::debug!(
                backend = self.inner.name(),
                key = %self.key,
                "Shutting down, abandoning write-behind put"
            );
            self.finish(true);
            return;
        }

        let mut status = self
            .inner
            .put(&self.key, self.data.clone(), self.force_overwrite)
            .await;
        let mut retries = 0;
        while !status.is_terminal() && retries < self.max_retries {
            retries += 1;
            tokio::time::sleep(self.retry_delay).await;
            status = self
                .inner
                .put(&self.key, self.data.clone(), self.force_overwrite)
                .await;
        }

        let drop_shadow = match status {
            PutStatus::Cached | PutStatus::Skipped => true,
            PutStatus::Executing => {
                tracing::debug!(
                    backend = self.inner.name(),
                    key = %self.key,
                    retries,
                    "Inner backend took ownership of write-behind put"
                );
                true
            }
            PutStatus::NotCached => {
                tracing::warn!(
                    backend = self.inner.name(),
                    key = %self.key,
                    bytes = self.data.len(),
                    retries,
                    "Write-behind put failed, keeping in-flight copy"
                );
                false
            }
        };
        self.finish(drop_shadow);
    }

    /// Evict before releasing the key; a waiting remove must not find a
    /// stale shadow copy.
    fn finish(&self, drop_shadow: bool) {
        if drop_shadow {
            if let Some(shadow) = &self.shadow {
                shadow.evict(&self.key, false);
            }
        }
        self.in_flight.remove(self.key.as_str());
    }
}
