//! DDC Core - Keys, Records and Statuses
//!
//! Plain data types shared by every backend in the hierarchy. No I/O and
//! no async code lives here.

pub mod config;
pub mod enums;
pub mod error;
pub mod key;
pub mod policy;
pub mod record;
pub mod request;

pub use config::{
    AsyncPutConfig, MemoryCacheConfig, RuntimeConfig, DEFAULT_MAX_ENTRY_AGE,
    DEFAULT_MAX_PUT_RETRIES, DEFAULT_RETRY_DELAY_MS, DEFAULT_WORKER_COUNT,
};
pub use enums::{CompletionStatus, Locality, Priority, PutStatus, SpeedClass};
pub use error::{
    BackendError, ConfigError, DdcError, DdcResult, KeyError, RecordError, SnapshotError,
};
pub use key::{CacheBucket, CacheKey, ContentHash, ValueId};
pub use policy::CachePolicy;
pub use record::{CacheRecord, CacheRecordBuilder};
pub use request::{
    ChunkRequest, ChunkResponse, GetRequest, GetResponse, PutRequest, PutResponse,
};
