//! Structured request and response types.
//!
//! Every request carries an opaque `user_data` value that is echoed in its
//! response. Composite backends overwrite it with an index while fanning
//! out and restore the caller's value before completing.

use bytes::Bytes;

use crate::enums::CompletionStatus;
use crate::key::{CacheKey, ValueId};
use crate::policy::CachePolicy;
use crate::record::CacheRecord;

/// Store a record.
#[derive(Debug, Clone)]
pub struct PutRequest {
    /// Human readable name for logging.
    pub name: String,
    pub record: CacheRecord,
    pub policy: CachePolicy,
    pub user_data: u64,
}

impl PutRequest {
    pub fn new(name: impl Into<String>, record: CacheRecord) -> Self {
        Self {
            name: name.into(),
            record,
            policy: CachePolicy::DEFAULT,
            user_data: 0,
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn key(&self) -> &CacheKey {
        self.record.key()
    }

    pub fn make_response(&self, status: CompletionStatus) -> PutResponse {
        PutResponse {
            name: self.name.clone(),
            key: self.record.key().clone(),
            status,
            user_data: self.user_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutResponse {
    pub name: String,
    pub key: CacheKey,
    pub status: CompletionStatus,
    pub user_data: u64,
}

/// Fetch a record.
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub name: String,
    pub key: CacheKey,
    pub policy: CachePolicy,
    pub user_data: u64,
}

impl GetRequest {
    pub fn new(name: impl Into<String>, key: CacheKey) -> Self {
        Self {
            name: name.into(),
            key,
            policy: CachePolicy::DEFAULT,
            user_data: 0,
        }
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn make_response(&self, record: Option<CacheRecord>, status: CompletionStatus) -> GetResponse {
        GetResponse {
            name: self.name.clone(),
            key: self.key.clone(),
            record,
            status,
            user_data: self.user_data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub name: String,
    pub key: CacheKey,
    pub record: Option<CacheRecord>,
    pub status: CompletionStatus,
    pub user_data: u64,
}

/// Fetch a slice of one value of a record.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub name: String,
    pub key: CacheKey,
    /// `ValueId::NULL` addresses the inline value.
    pub id: ValueId,
    pub raw_offset: u64,
    /// `u64::MAX` reads to the end of the value.
    pub raw_size: u64,
    pub policy: CachePolicy,
    pub user_data: u64,
}

impl ChunkRequest {
    pub fn new(name: impl Into<String>, key: CacheKey, id: ValueId) -> Self {
        Self {
            name: name.into(),
            key,
            id,
            raw_offset: 0,
            raw_size: u64::MAX,
            policy: CachePolicy::DEFAULT,
            user_data: 0,
        }
    }

    pub fn with_range(mut self, raw_offset: u64, raw_size: u64) -> Self {
        self.raw_offset = raw_offset;
        self.raw_size = raw_size;
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn make_response(&self, raw_data: Option<Bytes>, status: CompletionStatus) -> ChunkResponse {
        ChunkResponse {
            name: self.name.clone(),
            key: self.key.clone(),
            id: self.id,
            raw_offset: self.raw_offset,
            raw_size: raw_data.as_ref().map_or(0, |d| d.len() as u64),
            raw_data,
            status,
            user_data: self.user_data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkResponse {
    pub name: String,
    pub key: CacheKey,
    pub id: ValueId,
    pub raw_offset: u64,
    /// Number of bytes actually returned.
    pub raw_size: u64,
    pub raw_data: Option<Bytes>,
    pub status: CompletionStatus,
    pub user_data: u64,
}
