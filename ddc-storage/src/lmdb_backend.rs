//! LMDB-backed persistent cache tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep raw cache values in a
//! memory-mapped key-value store under their legacy string keys. Structured
//! records reach it as package blobs through the default structured
//! adapters, so `invalidate_bucket` can drop a whole bucket by key prefix.
//!
//! LMDB failures never escape the cache path: they are logged and reported
//! as misses or `NotCached`.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use ddc_core::{BackendError, DdcError, PutStatus, SpeedClass};
use heed::types::Bytes as RawBytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::backend::CacheBackend;
use crate::stats::{UsageStats, UsageStatsNode};

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for DdcError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Transaction(reason) => DdcError::Backend(BackendError::Transaction {
                name: "lmdb".to_string(),
                reason,
            }),
            other => DdcError::Backend(BackendError::Open {
                name: "lmdb".to_string(),
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

pub struct LmdbCacheBackend {
    name: String,
    env: Env,
    db: Database<RawBytes, RawBytes>,
    read_only: bool,
    stats: UsageStats,
}

impl LmdbCacheBackend {
    /// Open (or create) an LMDB cache in `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    /// * `read_only` - Reject puts and removes
    pub fn open<P: AsRef<Path>>(
        name: impl Into<String>,
        path: P,
        max_size_mb: usize,
        read_only: bool,
    ) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<RawBytes, RawBytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        let name = name.into();
        tracing::info!(
            cache = %name,
            path = %path.as_ref().display(),
            max_size_mb,
            read_only,
            "LMDB cache opened"
        );
        Ok(Self {
            name,
            env,
            db,
            read_only,
            stats: UsageStats::new(),
        })
    }

    fn read(&self, key: &str) -> Result<Option<Bytes>, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let value = self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)?;
        Ok(value.map(Bytes::copy_from_slice))
    }

    fn contains(&self, key: &str) -> Result<bool, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        Ok(self.db.get(&rtxn, key.as_bytes()).map_err(txn_error)?.is_some())
    }

    /// Returns false without writing when the key exists and `force` is off.
    fn write(&self, key: &str, data: &[u8], force_overwrite: bool) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        if !force_overwrite && self.db.get(&wtxn, key.as_bytes()).map_err(txn_error)?.is_some() {
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), data)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let deleted = self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    /// Iterate over keys matching a prefix and collect them.
    fn collect_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_error)? {
            match result {
                Ok((key, _)) if key.starts_with(prefix) => keys.push(key.to_vec()),
                Ok(_) => {}
                Err(_) => continue,
            }
        }
        Ok(keys)
    }

    /// Delete every entry in `bucket`. Returns the number of entries deleted.
    pub fn invalidate_bucket(&self, bucket: &str) -> Result<u64, LmdbCacheError> {
        let prefix = format!("{}/", bucket);
        let keys = self.collect_keys_with_prefix(prefix.as_bytes())?;

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key).unwrap_or(false) {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_error)?;

        tracing::info!(cache = %self.name, bucket, deleted, "LMDB bucket invalidated");
        Ok(deleted)
    }

    pub fn entry_count(&self) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        self.db.len(&rtxn).map_err(txn_error)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        !self.read_only
    }

    fn speed_class(&self) -> SpeedClass {
        SpeedClass::Local
    }

    async fn exists(&self, key: &str) -> bool {
        match self.contains(key) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(cache = %self.name, key, error = %e, "LMDB exists failed");
                false
            }
        }
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        let data = match self.read(key) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(cache = %self.name, key, error = %e, "LMDB get failed");
                None
            }
        };
        self.stats.record_get(data.as_ref().map(|d| d.len()));
        data
    }

    async fn put(&self, key: &str, data: Bytes, force_overwrite: bool) -> PutStatus {
        if self.read_only {
            return PutStatus::NotCached;
        }
        let status = match self.write(key, &data, force_overwrite) {
            Ok(_) => PutStatus::Cached,
            Err(e) => {
                tracing::warn!(cache = %self.name, key, error = %e, "LMDB put failed");
                PutStatus::NotCached
            }
        };
        self.stats.record_put(status, data.len());
        status
    }

    async fn remove(&self, key: &str, _transient: bool) {
        if self.read_only {
            return;
        }
        match self.delete(key) {
            Ok(true) => self.stats.record_remove(),
            Ok(false) => {}
            Err(e) => tracing::warn!(cache = %self.name, key, error = %e, "LMDB remove failed"),
        }
    }

    fn usage_stats(&self) -> UsageStatsNode {
        UsageStatsNode::leaf(self.name.clone(), "lmdb", self.stats.snapshot())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, read_only: bool) -> LmdbCacheBackend {
        LmdbCacheBackend::open("Local", dir.path(), 16, read_only).expect("open lmdb")
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, false);

        assert!(!cache.exists("Meshes/abc").await);
        assert_eq!(
            cache.put("Meshes/abc", Bytes::from_static(b"payload"), false).await,
            PutStatus::Cached
        );
        assert!(cache.exists("Meshes/abc").await);
        assert_eq!(cache.get("Meshes/abc").await.as_deref(), Some(&b"payload"[..]));

        cache.remove("Meshes/abc", true).await;
        assert!(cache.get("Meshes/abc").await.is_none());

        let stats = cache.usage_stats().stats;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.removes, 1);
    }

    #[tokio::test]
    async fn test_existing_value_kept_without_force() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, false);
        cache.put("k", Bytes::from_static(b"first"), false).await;
        assert_eq!(
            cache.put("k", Bytes::from_static(b"second"), false).await,
            PutStatus::Cached
        );
        assert_eq!(cache.get("k").await.as_deref(), Some(&b"first"[..]));

        cache.put("k", Bytes::from_static(b"third"), true).await;
        assert_eq!(cache.get("k").await.as_deref(), Some(&b"third"[..]));
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let cache = open(&dir, false);
            cache.put("k", Bytes::from_static(b"durable"), false).await;
        }
        let reopened = open(&dir, true);
        assert_eq!(reopened.get("k").await.as_deref(), Some(&b"durable"[..]));
        assert!(!reopened.is_writable());
        assert_eq!(
            reopened.put("other", Bytes::from_static(b"x"), false).await,
            PutStatus::NotCached
        );
    }

    #[tokio::test]
    async fn test_invalidate_bucket() {
        let dir = TempDir::new().expect("tempdir");
        let cache = open(&dir, false);
        cache.put("Meshes/1", Bytes::from_static(b"a"), false).await;
        cache.put("Meshes/2", Bytes::from_static(b"b"), false).await;
        cache.put("MeshesOld/1", Bytes::from_static(b"c"), false).await;
        cache.put("Textures/1", Bytes::from_static(b"d"), false).await;

        assert_eq!(cache.invalidate_bucket("Meshes").expect("invalidate"), 2);
        assert!(!cache.exists("Meshes/1").await);
        assert!(cache.exists("MeshesOld/1").await);
        assert!(cache.exists("Textures/1").await);
        assert_eq!(cache.entry_count().expect("count"), 2);
    }

    #[test]
    fn test_error_conversion() {
        let err: DdcError = LmdbCacheError::Transaction("boom".to_string()).into();
        assert!(matches!(err, DdcError::Backend(BackendError::Transaction { .. })));
        let err: DdcError = LmdbCacheError::EnvOpen("nope".to_string()).into();
        assert!(matches!(err, DdcError::Backend(BackendError::Open { .. })));
    }
}
