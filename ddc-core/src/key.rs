//! Content-addressed cache keys.
//!
//! A [`CacheKey`] names a bucket (a namespace, usually one per artifact type)
//! and a 32-byte content hash. The textual form `"<bucket>/<64 hex chars>"`
//! is also the lookup key when a structured record goes through the legacy
//! byte interface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// Maximum length of a bucket name.
pub const MAX_BUCKET_LEN: usize = 63;

// ============================================================================
// BUCKET
// ============================================================================

/// Namespace of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheBucket(String);

impl CacheBucket {
    /// Validate and wrap a bucket name.
    pub fn new(name: impl Into<String>) -> Result<Self, KeyError> {
        let name = name.into();
        if name.is_empty() {
            return Err(KeyError::InvalidBucket {
                name,
                reason: "must not be empty".to_string(),
            });
        }
        if name.len() > MAX_BUCKET_LEN {
            return Err(KeyError::InvalidBucket {
                reason: format!("longer than {} characters", MAX_BUCKET_LEN),
                name,
            });
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(KeyError::InvalidBucket {
                reason: format!("invalid character '{}'", c),
                name,
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheBucket {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheBucket> for String {
    fn from(bucket: CacheBucket) -> Self {
        bucket.0
    }
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// SHA-256 digest identifying the content of a cached artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary content.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, KeyError> {
        let decoded = hex::decode(value).map_err(|e| KeyError::InvalidHash {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| KeyError::InvalidHash {
            value: value.to_string(),
            reason: "expected 32 bytes".to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// Structured cache key: bucket plus content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub bucket: CacheBucket,
    pub hash: ContentHash,
}

impl CacheKey {
    pub fn new(bucket: CacheBucket, hash: ContentHash) -> Self {
        Self { bucket, hash }
    }

    /// Key for `content` in `bucket`.
    pub fn for_content(bucket: CacheBucket, content: &[u8]) -> Self {
        Self::new(bucket, ContentHash::of(content))
    }

    /// Flat string form used by the legacy byte interface.
    pub fn legacy_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.hash)
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bucket, hash) = s.split_once('/').ok_or_else(|| KeyError::Malformed {
            value: s.to_string(),
        })?;
        Ok(Self {
            bucket: CacheBucket::new(bucket)?,
            hash: ContentHash::from_hex(hash)?,
        })
    }
}

// ============================================================================
// VALUE ID
// ============================================================================

/// 12-byte identifier of an attachment within a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId([u8; 12]);

impl ValueId {
    /// Addresses the record's inline value.
    pub const NULL: Self = Self([0u8; 12]);

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Stable id derived from an attachment name.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; 12];
        id.copy_from_slice(&digest[..12]);
        Self(id)
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 12]
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(name: &str) -> CacheBucket {
        CacheBucket::new(name).expect("valid bucket")
    }

    #[test]
    fn test_bucket_validation() {
        assert!(CacheBucket::new("ShaderCode_v2").is_ok());
        assert!(CacheBucket::new("").is_err());
        assert!(CacheBucket::new("has space").is_err());
        assert!(CacheBucket::new("a/b").is_err());
        assert!(CacheBucket::new("x".repeat(MAX_BUCKET_LEN)).is_ok());
        assert!(CacheBucket::new("x".repeat(MAX_BUCKET_LEN + 1)).is_err());
    }

    #[test]
    fn test_legacy_key_format() {
        let key = CacheKey::new(bucket("Textures"), ContentHash::ZERO);
        let legacy = key.legacy_key();
        assert!(legacy.starts_with("Textures/"));
        assert_eq!(legacy.len(), "Textures/".len() + 64);
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        assert_eq!(ContentHash::of(b"abc"), ContentHash::of(b"abc"));
        assert_ne!(ContentHash::of(b"abc"), ContentHash::of(b"abd"));
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(matches!(
            "no-separator".parse::<CacheKey>(),
            Err(KeyError::Malformed { .. })
        ));
        assert!(matches!(
            "Bucket/abcd".parse::<CacheKey>(),
            Err(KeyError::InvalidHash { .. })
        ));
        assert!(matches!(
            format!("bad bucket/{}", ContentHash::ZERO).parse::<CacheKey>(),
            Err(KeyError::InvalidBucket { .. })
        ));
    }

    #[test]
    fn test_value_id_from_name() {
        let a = ValueId::from_name("Mesh");
        assert_eq!(a, ValueId::from_name("Mesh"));
        assert_ne!(a, ValueId::from_name("Materials"));
        assert!(!a.is_null());
        assert!(ValueId::NULL.is_null());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn bucket_strategy() -> impl Strategy<Value = CacheBucket> {
        "[A-Za-z0-9_]{1,63}".prop_map(|s| CacheBucket::new(s).expect("strategy yields valid names"))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: the legacy key parses back to the same key.
        #[test]
        fn prop_legacy_key_roundtrip(bucket in bucket_strategy(), bytes in any::<[u8; 32]>()) {
            let key = CacheKey::new(bucket, ContentHash::from_bytes(bytes));
            let parsed: CacheKey = key.legacy_key().parse().expect("legacy key parses");
            prop_assert_eq!(key, parsed);
        }

        /// Property: distinct keys never share a legacy key.
        #[test]
        fn prop_legacy_key_injective(
            b1 in bucket_strategy(),
            b2 in bucket_strategy(),
            h1 in any::<[u8; 32]>(),
            h2 in any::<[u8; 32]>(),
        ) {
            let k1 = CacheKey::new(b1, ContentHash::from_bytes(h1));
            let k2 = CacheKey::new(b2, ContentHash::from_bytes(h2));
            if k1 == k2 {
                prop_assert_eq!(k1.legacy_key(), k2.legacy_key());
            } else {
                prop_assert_ne!(k1.legacy_key(), k2.legacy_key());
            }
        }
    }
}
