//! DDC Storage - Cache Backends
//!
//! Leaf tiers (bounded memory, LMDB), the write-behind wrapper, the
//! multi-tier hierarchy and the backend graph built from configuration.
//! Types shared across crates live in ddc-core.

pub mod async_put;
pub mod backend;
pub mod graph;
pub mod hierarchical;
pub mod key_set;
pub mod lmdb_backend;
pub mod memory;
pub mod runtime;
pub mod stats;

pub use async_put::{AsyncPutBackend, AsyncRequest};
pub use backend::{CacheBackend, OnChunkComplete, OnGetComplete, OnPutComplete};
pub use graph::{CacheGraph, GraphConfig, NodeConfig, NodeKind};
pub use hierarchical::{HierarchicalBackend, HierarchyFlags};
pub use key_set::ThreadSafeKeySet;
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory::{MemoryCacheBackend, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use runtime::{CacheRuntime, QueuedWork, Request, RequestOwner, WorkQueue};
pub use stats::{StatsSnapshot, UsageStats, UsageStatsNode};

// Re-export core types for downstream crates
pub use ddc_core;
