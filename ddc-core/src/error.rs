//! Error types for DDC operations
//!
//! Cache-path failures never surface here: gets miss and puts return a
//! `PutStatus`. These enums cover everything around the cache path
//! (key parsing, record decoding, snapshots, configuration, opening
//! backends).

use thiserror::Error;

/// Key and bucket parsing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid bucket name '{name}': {reason}")]
    InvalidBucket { name: String, reason: String },

    #[error("Invalid content hash '{value}': {reason}")]
    InvalidHash { value: String, reason: String },

    #[error("Malformed cache key '{value}': expected <bucket>/<hex hash>")]
    Malformed { value: String },
}

/// Record package encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record package truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Bad record package magic: {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Unsupported record package version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("Invalid record metadata: {reason}")]
    InvalidMeta { reason: String },

    #[error("Duplicate attachment id {id}")]
    DuplicateAttachment { id: String },

    #[error("Invalid key in record package: {0}")]
    Key(#[from] KeyError),
}

/// Memory cache snapshot errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed for {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Bad snapshot magic in {path}: {found:#010x}")]
    BadMagic { path: String, found: u32 },

    #[error("Unsupported snapshot version {version} in {path}")]
    UnsupportedVersion { path: String, version: u32 },

    #[error("Snapshot {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Snapshot checksum mismatch in {path}")]
    ChecksumMismatch { path: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown backend node: {name}")]
    UnknownNode { name: String },

    #[error("Duplicate backend node: {name}")]
    DuplicateNode { name: String },

    #[error("Cycle detected in backend graph: {path:?}")]
    CycleDetected { path: Vec<String> },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Backend construction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to open backend {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("Transaction failed in {name}: {reason}")]
    Transaction { name: String, reason: String },

    #[error("No async runtime available: {reason}")]
    RuntimeUnavailable { reason: String },
}

/// Master error type for all DDC errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DdcError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type alias for DDC operations.
pub type DdcResult<T> = Result<T, DdcError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_display_invalid_bucket() {
        let err = KeyError::InvalidBucket {
            name: "bad bucket".to_string(),
            reason: "contains a space".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("bad bucket"));
        assert!(msg.contains("contains a space"));
    }

    #[test]
    fn test_record_error_display_truncated() {
        let err = RecordError::Truncated {
            offset: 12,
            needed: 32,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("truncated"));
        assert!(msg.contains("12"));
        assert!(msg.contains("32"));
    }

    #[test]
    fn test_snapshot_error_display_bad_magic() {
        let err = SnapshotError::BadMagic {
            path: "/tmp/boot.ddc".to_string(),
            found: 0xDEADBEEF,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/tmp/boot.ddc"));
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_config_error_display_cycle() {
        let err = ConfigError::CycleDetected {
            path: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Cycle"));
        assert!(msg.contains("\"B\""));
    }

    #[test]
    fn test_ddc_error_from_variants() {
        let key = DdcError::from(KeyError::Malformed {
            value: "x".to_string(),
        });
        assert!(matches!(key, DdcError::Key(_)));

        let record = DdcError::from(RecordError::UnsupportedVersion { version: 9 });
        assert!(matches!(record, DdcError::Record(_)));

        let snapshot = DdcError::from(SnapshotError::ChecksumMismatch {
            path: "p".to_string(),
        });
        assert!(matches!(snapshot, DdcError::Snapshot(_)));

        let config = DdcError::from(ConfigError::UnknownNode {
            name: "Nope".to_string(),
        });
        assert!(matches!(config, DdcError::Config(_)));

        let backend = DdcError::from(BackendError::RuntimeUnavailable {
            reason: "none".to_string(),
        });
        assert!(matches!(backend, DdcError::Backend(_)));
    }
}
