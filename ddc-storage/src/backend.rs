//! The cache backend trait.
//!
//! Every tier, the write-behind wrapper and the hierarchy implement
//! [`CacheBackend`], so hierarchies nest and wrappers stack. Cache-path
//! failures are never errors: lookups miss and puts report a [`PutStatus`].
//!
//! # Structured requests
//!
//! `put_records`, `get_records` and `get_chunks` have default
//! implementations that store each record as a package blob under its
//! legacy key through the byte interface. Leaf backends only implement the
//! byte interface; composites override the structured methods to fan out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ddc_core::{
    CacheKey, CacheRecord, ChunkRequest, ChunkResponse, CompletionStatus, GetRequest,
    GetResponse, Locality, PutRequest, PutResponse, PutStatus, SpeedClass,
};

use crate::runtime::RequestOwner;
use crate::stats::UsageStatsNode;

/// Completion callback for structured puts. Fires exactly once per item.
pub type OnPutComplete = Arc<dyn Fn(PutResponse) + Send + Sync>;

/// Completion callback for structured gets. Fires exactly once per item.
pub type OnGetComplete = Arc<dyn Fn(GetResponse) + Send + Sync>;

/// Completion callback for chunk reads. Fires exactly once per item.
pub type OnChunkComplete = Arc<dyn Fn(ChunkResponse) + Send + Sync>;

/// A cache tier or a composite of tiers.
///
/// Backends have a fixed identity (name, writability, speed class) for
/// their whole lifetime, except that a memory cache may be disabled.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_writable(&self) -> bool;

    fn speed_class(&self) -> SpeedClass;

    /// Whether a hit here may be copied into slower tiers.
    fn backfills_lower_levels(&self) -> bool {
        true
    }

    fn locality(&self) -> Locality {
        Locality::from_speed_class(self.speed_class())
    }

    async fn exists(&self, key: &str) -> bool;

    async fn exists_batch(&self, keys: &[String]) -> Vec<bool> {
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            result.push(self.exists(key).await);
        }
        result
    }

    /// Pull `keys` into fast tiers. Returns true if every key is available.
    async fn try_to_prefetch(&self, _keys: &[String]) -> bool {
        false
    }

    async fn get(&self, key: &str) -> Option<Bytes>;

    async fn put(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus;

    /// `transient` removals only target persistent tiers.
    async fn remove(&self, key: &str, transient: bool);

    fn usage_stats(&self) -> UsageStatsNode;

    async fn put_records(
        &self,
        requests: Vec<PutRequest>,
        _owner: &RequestOwner,
        on_complete: OnPutComplete,
    ) {
        put_records_as_packages(self, requests, on_complete).await
    }

    async fn get_records(
        &self,
        requests: Vec<GetRequest>,
        _owner: &RequestOwner,
        on_complete: OnGetComplete,
    ) {
        get_records_as_packages(self, requests, on_complete).await
    }

    async fn get_chunks(
        &self,
        requests: Vec<ChunkRequest>,
        _owner: &RequestOwner,
        on_complete: OnChunkComplete,
    ) {
        get_chunks_as_packages(self, requests, on_complete).await
    }
}

// ============================================================================
// PACKAGE ADAPTERS
// ============================================================================

pub(crate) async fn put_records_as_packages<B: CacheBackend + ?Sized>(
    backend: &B,
    requests: Vec<PutRequest>,
    on_complete: OnPutComplete,
) {
    for request in requests {
        if !backend.is_writable() || !request.policy.allows_store(backend.locality()) {
            on_complete(request.make_response(CompletionStatus::Error));
            continue;
        }
        let status = match request.record.to_package() {
            Ok(package) => {
                let key = request.key().legacy_key();
                backend.put(&key, package, false).await
            }
            Err(e) => {
                tracing::warn!(
                    backend = backend.name(),
                    name = %request.name,
                    error = %e,
                    "Failed to encode cache record"
                );
                PutStatus::NotCached
            }
        };
        on_complete(request.make_response(status.into()));
    }
}

async fn fetch_record<B: CacheBackend + ?Sized>(backend: &B, key: &CacheKey) -> Option<CacheRecord> {
    let package = backend.get(&key.legacy_key()).await?;
    match CacheRecord::from_package(&package) {
        Ok(record) if record.key() == key => Some(record),
        Ok(record) => {
            tracing::warn!(
                backend = backend.name(),
                expected = %key,
                found = %record.key(),
                "Cache record stored under the wrong key"
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                backend = backend.name(),
                key = %key,
                error = %e,
                "Corrupt cache record package"
            );
            None
        }
    }
}

pub(crate) async fn get_records_as_packages<B: CacheBackend + ?Sized>(
    backend: &B,
    requests: Vec<GetRequest>,
    on_complete: OnGetComplete,
) {
    for request in requests {
        if !request.policy.allows_query(backend.locality()) {
            on_complete(request.make_response(None, CompletionStatus::Error));
            continue;
        }
        let response = match fetch_record(backend, &request.key).await {
            Some(record) => request.make_response(Some(record), CompletionStatus::Ok),
            None => request.make_response(None, CompletionStatus::Error),
        };
        on_complete(response);
    }
}

pub(crate) async fn get_chunks_as_packages<B: CacheBackend + ?Sized>(
    backend: &B,
    requests: Vec<ChunkRequest>,
    on_complete: OnChunkComplete,
) {
    // Chunk requests for the same record usually arrive together.
    let mut records: HashMap<CacheKey, Option<CacheRecord>> = HashMap::new();
    for request in requests {
        if !request.policy.allows_query(backend.locality()) {
            on_complete(request.make_response(None, CompletionStatus::Error));
            continue;
        }
        if !records.contains_key(&request.key) {
            let record = fetch_record(backend, &request.key).await;
            records.insert(request.key.clone(), record);
        }
        let chunk = records
            .get(&request.key)
            .and_then(|r| r.as_ref())
            .and_then(|r| r.value_by_id(request.id))
            .and_then(|value| slice_chunk(value, request.raw_offset, request.raw_size));
        let response = match chunk {
            Some(data) => request.make_response(Some(data), CompletionStatus::Ok),
            None => request.make_response(None, CompletionStatus::Error),
        };
        on_complete(response);
    }
}

/// `raw_size == u64::MAX` reads to the end. An offset past the end is a miss.
pub(crate) fn slice_chunk(value: &Bytes, raw_offset: u64, raw_size: u64) -> Option<Bytes> {
    let len = value.len() as u64;
    if raw_offset > len {
        return None;
    }
    let end = raw_offset.saturating_add(raw_size).min(len);
    Some(value.slice(raw_offset as usize..end as usize))
}
