//! Multi-tier cache hierarchy.
//!
//! Tiers are held fastest first and each one is wrapped exactly once in an
//! [`AsyncPutBackend`]. A hit fills the faster tiers that missed
//! (forward-fill) and, when the winning tier allows it, copies the data into
//! slower fast-class tiers (backfill). All fills go through the async
//! wrappers so they never hold up the caller.
//!
//! The tier list lives behind an async reader/writer lock: lookups hold the
//! read side across the whole scan and `add_tier` / `insert_tier` /
//! `remove_tier` take the write side. Flags derived from the tier list are
//! recomputed under the write lock and mirrored into atomics for the
//! synchronous accessors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use ddc_core::{
    AsyncPutConfig, CacheRecord, ChunkRequest, ChunkResponse, CompletionStatus, ConfigError,
    DdcResult, GetRequest, GetResponse, Locality, Priority, PutRequest, PutResponse, PutStatus,
    SpeedClass,
};
use tokio::sync::RwLock;

use crate::async_put::AsyncPutBackend;
use crate::backend::{CacheBackend, OnChunkComplete, OnGetComplete, OnPutComplete};
use crate::runtime::{CacheRuntime, RequestOwner};
use crate::stats::{UsageStats, UsageStatsNode};

bitflags! {
    /// Capabilities of the current tier list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HierarchyFlags: u32 {
        const WRITABLE = 1 << 0;
        const HAS_LOCAL = 1 << 1;
        const HAS_REMOTE = 1 << 2;
        const MULTIPLE_LOCAL = 1 << 3;
        const MULTIPLE_REMOTE = 1 << 4;
        const WRITABLE_LOCAL = 1 << 5;
        const WRITABLE_REMOTE = 1 << 6;
        const HAS_SLOW = 1 << 7;
        const FAST_WRITABLE = 1 << 8;
    }
}

struct Tier {
    backend: Arc<dyn CacheBackend>,
    async_put: Arc<AsyncPutBackend>,
}

impl Tier {
    fn is_writable(&self) -> bool {
        self.backend.is_writable()
    }

    fn is_fast_writable(&self) -> bool {
        self.backend.is_writable() && self.backend.speed_class().is_fast()
    }

    /// Read-only and never backfilled: the source of truth for its keys.
    fn is_terminal_source(&self) -> bool {
        !self.backend.is_writable() && !self.backend.backfills_lower_levels()
    }
}

fn compute_flags(tiers: &[Tier]) -> (HierarchyFlags, SpeedClass) {
    let mut flags = HierarchyFlags::empty();
    let mut local_count = 0;
    let mut remote_count = 0;
    let mut fastest: Option<SpeedClass> = None;

    for tier in tiers {
        let locality = tier.backend.locality();
        let speed = tier.backend.speed_class();
        let writable = tier.backend.is_writable();

        if locality.includes_local() {
            local_count += 1;
            flags |= HierarchyFlags::HAS_LOCAL;
        }
        if locality.includes_remote() {
            remote_count += 1;
            flags |= HierarchyFlags::HAS_REMOTE;
        }
        if writable {
            flags |= HierarchyFlags::WRITABLE;
            if locality.includes_local() {
                flags |= HierarchyFlags::WRITABLE_LOCAL;
            }
            if locality.includes_remote() {
                flags |= HierarchyFlags::WRITABLE_REMOTE;
            }
            if speed.is_fast() {
                flags |= HierarchyFlags::FAST_WRITABLE;
            }
        }
        if speed == SpeedClass::Slow {
            flags |= HierarchyFlags::HAS_SLOW;
        }
        fastest = Some(fastest.map_or(speed, |f| f.min(speed)));
    }
    flags.set(HierarchyFlags::MULTIPLE_LOCAL, local_count > 1);
    flags.set(HierarchyFlags::MULTIPLE_REMOTE, remote_count > 1);
    (flags, fastest.unwrap_or_default())
}

pub struct HierarchicalBackend {
    name: String,
    tiers: RwLock<Vec<Tier>>,
    flags: AtomicU32,
    speed_class: AtomicU8,
    runtime: Arc<CacheRuntime>,
    async_config: AsyncPutConfig,
    /// Owner for fill and backfill requests.
    background: RequestOwner,
    stats: UsageStats,
}

impl HierarchicalBackend {
    pub fn new(
        name: impl Into<String>,
        backends: Vec<Arc<dyn CacheBackend>>,
        runtime: Arc<CacheRuntime>,
        async_config: AsyncPutConfig,
    ) -> DdcResult<Self> {
        async_config.validate()?;
        let mut tiers = Vec::with_capacity(backends.len());
        for backend in backends {
            tiers.push(Self::make_tier(backend, &runtime, &async_config)?);
        }
        let (flags, speed) = compute_flags(&tiers);
        let hierarchy = Self {
            name: name.into(),
            tiers: RwLock::new(tiers),
            flags: AtomicU32::new(flags.bits()),
            speed_class: AtomicU8::new(speed.as_u8()),
            runtime,
            async_config,
            background: RequestOwner::new(Priority::Low),
            stats: UsageStats::new(),
        };
        tracing::debug!(
            hierarchy = %hierarchy.name,
            flags = ?flags,
            "Cache hierarchy created"
        );
        Ok(hierarchy)
    }

    fn make_tier(
        backend: Arc<dyn CacheBackend>,
        runtime: &Arc<CacheRuntime>,
        config: &AsyncPutConfig,
    ) -> DdcResult<Tier> {
        let async_put = AsyncPutBackend::new(Arc::clone(&backend), Arc::clone(runtime), config.clone())?;
        Ok(Tier {
            backend,
            async_put: Arc::new(async_put),
        })
    }

    fn store_flags(&self, tiers: &[Tier]) {
        let (flags, speed) = compute_flags(tiers);
        self.flags.store(flags.bits(), Ordering::Release);
        self.speed_class.store(speed.as_u8(), Ordering::Release);
    }

    pub fn flags(&self) -> HierarchyFlags {
        HierarchyFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    /// Owner used for fill and backfill requests.
    pub fn background_owner(&self) -> &RequestOwner {
        &self.background
    }

    // ========================================================================
    // TIER MANAGEMENT
    // ========================================================================

    /// Append a tier as the slowest.
    pub async fn add_tier(&self, backend: Arc<dyn CacheBackend>) -> DdcResult<()> {
        let tier = Self::make_tier(backend, &self.runtime, &self.async_config)?;
        let mut tiers = self.tiers.write().await;
        tracing::info!(hierarchy = %self.name, tier = tier.backend.name(), "Tier added");
        tiers.push(tier);
        self.store_flags(&tiers);
        Ok(())
    }

    /// Insert a tier at `index` (0 is fastest).
    pub async fn insert_tier(&self, index: usize, backend: Arc<dyn CacheBackend>) -> DdcResult<()> {
        let tier = Self::make_tier(backend, &self.runtime, &self.async_config)?;
        let mut tiers = self.tiers.write().await;
        if index > tiers.len() {
            return Err(ConfigError::InvalidValue {
                field: "index".to_string(),
                value: index.to_string(),
                reason: format!("hierarchy has {} tiers", tiers.len()),
            }
            .into());
        }
        tracing::info!(hierarchy = %self.name, tier = tier.backend.name(), index, "Tier inserted");
        tiers.insert(index, tier);
        self.store_flags(&tiers);
        Ok(())
    }

    /// Remove the first tier named `name`. Returns false if none matched.
    pub async fn remove_tier(&self, name: &str) -> bool {
        let mut tiers = self.tiers.write().await;
        let Some(index) = tiers.iter().position(|t| t.backend.name() == name) else {
            return false;
        };
        tiers.remove(index);
        self.store_flags(&tiers);
        tracing::info!(hierarchy = %self.name, tier = name, "Tier removed");
        true
    }

    pub async fn tier_names(&self) -> Vec<String> {
        self.tiers
            .read()
            .await
            .iter()
            .map(|t| t.backend.name().to_string())
            .collect()
    }

    pub async fn tier_count(&self) -> usize {
        self.tiers.read().await.len()
    }

    /// The write-behind wrapper of the tier named `name`.
    pub async fn tier_async_put(&self, name: &str) -> Option<Arc<AsyncPutBackend>> {
        self.tiers
            .read()
            .await
            .iter()
            .find(|t| t.backend.name() == name)
            .map(|t| Arc::clone(&t.async_put))
    }
}

#[async_trait]
impl CacheBackend for HierarchicalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.flags().contains(HierarchyFlags::WRITABLE)
    }

    fn speed_class(&self) -> SpeedClass {
        SpeedClass::from_u8(self.speed_class.load(Ordering::Acquire))
    }

    fn locality(&self) -> Locality {
        let flags = self.flags();
        match (
            flags.contains(HierarchyFlags::HAS_LOCAL),
            flags.contains(HierarchyFlags::HAS_REMOTE),
        ) {
            (true, true) => Locality::Mixed,
            (false, true) => Locality::Remote,
            _ => Locality::Local,
        }
    }

    async fn exists(&self, key: &str) -> bool {
        let tiers = self.tiers.read().await;
        for tier in tiers.iter() {
            if tier.async_put.exists(key).await {
                return true;
            }
        }
        false
    }

    async fn exists_batch(&self, keys: &[String]) -> Vec<bool> {
        let mut result = vec![false; keys.len()];
        let mut remaining: Vec<usize> = (0..keys.len()).collect();
        let tiers = self.tiers.read().await;
        for tier in tiers.iter() {
            if remaining.is_empty() {
                break;
            }
            let batch: Vec<String> = remaining.iter().map(|&i| keys[i].clone()).collect();
            let found = tier.async_put.exists_batch(&batch).await;
            let mut still_missing = Vec::with_capacity(remaining.len());
            for (index, hit) in remaining.into_iter().zip(found) {
                if hit {
                    result[index] = true;
                } else {
                    still_missing.push(index);
                }
            }
            remaining = still_missing;
        }
        result
    }

    async fn try_to_prefetch(&self, keys: &[String]) -> bool {
        let missing = {
            let tiers = self.tiers.read().await;
            let mut missing = Vec::new();
            for key in keys {
                let mut in_fast_tier = false;
                for tier in tiers.iter().filter(|t| t.is_fast_writable()) {
                    if tier.async_put.exists(key).await {
                        in_fast_tier = true;
                        break;
                    }
                }
                if !in_fast_tier {
                    missing.push(key.clone());
                }
            }
            missing
        };
        if missing.is_empty() {
            return true;
        }

        let flags = self.flags();
        if !flags.contains(HierarchyFlags::HAS_SLOW | HierarchyFlags::FAST_WRITABLE) {
            return false;
        }
        tracing::debug!(hierarchy = %self.name, keys = missing.len(), "Prefetching into fast tiers");
        let mut all_available = true;
        for key in &missing {
            if self.get(key).await.is_none() {
                all_available = false;
            }
        }
        all_available
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        let tiers = self.tiers.read().await;
        for (index, tier) in tiers.iter().enumerate() {
            let Some(data) = tier.async_put.get(key).await else {
                continue;
            };

            if self.is_writable() {
                for earlier in tiers[..index].iter().filter(|t| t.is_writable()) {
                    tracing::debug!(
                        key,
                        from = tier.backend.name(),
                        to = earlier.backend.name(),
                        "Forward-filling cache tier"
                    );
                    earlier.async_put.put(key, data.clone(), false).await;
                }
            }

            if tier.backend.backfills_lower_levels() {
                for later in &tiers[index + 1..] {
                    if later.is_terminal_source() && later.backend.exists(key).await {
                        break;
                    }
                    if later.is_fast_writable() {
                        tracing::debug!(
                            key,
                            from = tier.backend.name(),
                            to = later.backend.name(),
                            "Backfilling cache tier"
                        );
                        later.async_put.put(key, data.clone(), false).await;
                    }
                }
            }

            self.stats.record_get(Some(data.len()));
            return Some(data);
        }
        self.stats.record_get(None);
        None
    }

    async fn put(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        if !self.is_writable() {
            self.stats.record_put(PutStatus::NotCached, data.len());
            return PutStatus::NotCached;
        }
        let tiers = self.tiers.read().await;
        let mut status = PutStatus::NotCached;
        let mut synchronous_put_done = false;
        for tier in tiers.iter() {
            if tier.is_terminal_source() && tier.backend.exists(key).await {
                break;
            }
            if !tier.is_writable() {
                continue;
            }
            if synchronous_put_done {
                tier.async_put.put(key, data.clone(), force_overwrite).await;
            } else {
                status = tier.backend.put(key, data.clone(), force_overwrite).await;
                synchronous_put_done = true;
            }
        }
        self.stats.record_put(status, data.len());
        status
    }

    async fn remove(&self, key: &str, transient: bool) {
        if !self.is_writable() {
            return;
        }
        let tiers = self.tiers.read().await;
        for tier in tiers.iter() {
            tier.async_put.remove(key, transient).await;
        }
        self.stats.record_remove();
    }

    fn usage_stats(&self) -> UsageStatsNode {
        let mut node =
            UsageStatsNode::leaf(self.name.clone(), "hierarchical", self.stats.snapshot());
        // Skipped while a tier change holds the write lock.
        if let Ok(tiers) = self.tiers.try_read() {
            for tier in tiers.iter() {
                node = node.with_child(tier.async_put.usage_stats());
            }
        }
        node
    }

    async fn put_records(
        &self,
        requests: Vec<PutRequest>,
        _owner: &RequestOwner,
        on_complete: OnPutComplete,
    ) {
        let statuses: Arc<Mutex<Vec<Option<CompletionStatus>>>> =
            Arc::new(Mutex::new(vec![None; requests.len()]));
        let mut stored = vec![false; requests.len()];
        let mut sealed = vec![false; requests.len()];
        let blocking = RequestOwner::blocking();

        {
            let tiers = self.tiers.read().await;
            for tier in tiers.iter() {
                if tier.is_terminal_source() {
                    for (index, request) in requests.iter().enumerate() {
                        if !sealed[index] && tier.backend.exists(&request.key().legacy_key()).await
                        {
                            sealed[index] = true;
                        }
                    }
                }
                if !tier.is_writable() {
                    continue;
                }
                let locality = tier.backend.locality();
                let mut sync_batch = Vec::new();
                let mut async_batch = Vec::new();
                for (index, request) in requests.iter().enumerate() {
                    if sealed[index] || !request.policy.allows_store(locality) {
                        continue;
                    }
                    let remapped = request.clone().with_user_data(index as u64);
                    if stored[index] {
                        async_batch.push(remapped);
                    } else {
                        stored[index] = true;
                        sync_batch.push(remapped);
                    }
                }

                if !sync_batch.is_empty() {
                    let statuses = Arc::clone(&statuses);
                    let record: OnPutComplete = Arc::new(move |response: PutResponse| {
                        let mut statuses = statuses.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(slot) = statuses.get_mut(response.user_data as usize) {
                            *slot = Some(response.status);
                        }
                    });
                    tier.backend.put_records(sync_batch, &blocking, record).await;
                }
                if !async_batch.is_empty() {
                    tier.async_put
                        .put_records(async_batch, &self.background, Arc::new(|_: PutResponse| {}))
                        .await;
                }
            }
        }

        let statuses = std::mem::take(&mut *statuses.lock().unwrap_or_else(|e| e.into_inner()));
        for (request, status) in requests.iter().zip(statuses) {
            let status = status.unwrap_or(CompletionStatus::Error);
            self.stats.record_put(
                if status.is_ok() {
                    PutStatus::Cached
                } else {
                    PutStatus::NotCached
                },
                request.record.payload_size() as usize,
            );
            on_complete(request.make_response(status));
        }
    }

    async fn get_records(
        &self,
        requests: Vec<GetRequest>,
        _owner: &RequestOwner,
        on_complete: OnGetComplete,
    ) {
        let found: Arc<Mutex<Vec<Option<(CacheRecord, usize)>>>> =
            Arc::new(Mutex::new(vec![None; requests.len()]));
        let blocking = RequestOwner::blocking();

        let tiers = self.tiers.read().await;
        let mut remaining: Vec<usize> = (0..requests.len()).collect();
        for (tier_index, tier) in tiers.iter().enumerate() {
            if remaining.is_empty() {
                break;
            }
            let locality = tier.backend.locality();
            let batch: Vec<GetRequest> = remaining
                .iter()
                .filter(|&&i| requests[i].policy.allows_query(locality))
                .map(|&i| requests[i].clone().with_user_data(i as u64))
                .collect();
            if batch.is_empty() {
                continue;
            }

            let sink = Arc::clone(&found);
            let record_hit: OnGetComplete = Arc::new(move |response: GetResponse| {
                if !response.status.is_ok() {
                    return;
                }
                if let Some(record) = response.record {
                    let mut found = sink.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(slot) = found.get_mut(response.user_data as usize) {
                        *slot = Some((record, tier_index));
                    }
                }
            });
            tier.backend.get_records(batch, &blocking, record_hit).await;

            let found = found.lock().unwrap_or_else(|e| e.into_inner());
            remaining.retain(|&i| found[i].is_none());
        }

        let found = std::mem::take(&mut *found.lock().unwrap_or_else(|e| e.into_inner()));

        // Forward-fill every faster tier first, then backfill.
        let mut fills: BTreeMap<usize, Vec<PutRequest>> = BTreeMap::new();
        let mut backfills: BTreeMap<usize, Vec<PutRequest>> = BTreeMap::new();
        for (index, hit) in found.iter().enumerate() {
            let Some((record, winner)) = hit else {
                continue;
            };
            let request = &requests[index];
            let fill = || {
                PutRequest::new(request.name.clone(), record.clone()).with_policy(request.policy)
            };

            if self.is_writable() {
                for (tier_index, earlier) in tiers[..*winner].iter().enumerate() {
                    if earlier.is_writable()
                        && request.policy.allows_store(earlier.backend.locality())
                    {
                        fills.entry(tier_index).or_default().push(fill());
                    }
                }
            }

            if tiers[*winner].backend.backfills_lower_levels() {
                let legacy_key = record.key().legacy_key();
                for (offset, later) in tiers[*winner + 1..].iter().enumerate() {
                    if later.is_terminal_source() && later.backend.exists(&legacy_key).await {
                        break;
                    }
                    if later.is_fast_writable()
                        && request.policy.allows_store(later.backend.locality())
                    {
                        backfills
                            .entry(*winner + 1 + offset)
                            .or_default()
                            .push(fill());
                    }
                }
            }
        }
        for (tier_index, batch) in fills.into_iter().chain(backfills) {
            tracing::debug!(
                hierarchy = %self.name,
                tier = tiers[tier_index].backend.name(),
                records = batch.len(),
                "Filling cache tier with records"
            );
            tiers[tier_index]
                .async_put
                .put_records(batch, &self.background, Arc::new(|_: PutResponse| {}))
                .await;
        }
        drop(tiers);

        for (request, hit) in requests.iter().zip(found) {
            let response = match hit {
                Some((record, _)) => {
                    self.stats.record_get(Some(record.payload_size() as usize));
                    request.make_response(Some(record), CompletionStatus::Ok)
                }
                None => {
                    self.stats.record_get(None);
                    request.make_response(None, CompletionStatus::Error)
                }
            };
            on_complete(response);
        }
    }

    async fn get_chunks(
        &self,
        requests: Vec<ChunkRequest>,
        _owner: &RequestOwner,
        on_complete: OnChunkComplete,
    ) {
        let found: Arc<Mutex<Vec<Option<ChunkResponse>>>> =
            Arc::new(Mutex::new(vec![None; requests.len()]));
        let blocking = RequestOwner::blocking();

        {
            let tiers = self.tiers.read().await;
            let mut remaining: Vec<usize> = (0..requests.len()).collect();
            for tier in tiers.iter() {
                if remaining.is_empty() {
                    break;
                }
                let locality = tier.backend.locality();
                let batch: Vec<ChunkRequest> = remaining
                    .iter()
                    .filter(|&&i| requests[i].policy.allows_query(locality))
                    .map(|&i| requests[i].clone().with_user_data(i as u64))
                    .collect();
                if batch.is_empty() {
                    continue;
                }

                let sink = Arc::clone(&found);
                let record_hit: OnChunkComplete = Arc::new(move |response: ChunkResponse| {
                    if !response.status.is_ok() {
                        return;
                    }
                    let mut found = sink.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(slot) = found.get_mut(response.user_data as usize) {
                        *slot = Some(response);
                    }
                });
                tier.backend.get_chunks(batch, &blocking, record_hit).await;

                let found = found.lock().unwrap_or_else(|e| e.into_inner());
                remaining.retain(|&i| found[i].is_none());
            }
        }

        let found = std::mem::take(&mut *found.lock().unwrap_or_else(|e| e.into_inner()));
        for (request, hit) in requests.iter().zip(found) {
            let response = match hit {
                Some(mut response) => {
                    response.user_data = request.user_data;
                    response.name = request.name.clone();
                    response
                }
                None => request.make_response(None, CompletionStatus::Error),
            };
            on_complete(response);
        }
    }
}
