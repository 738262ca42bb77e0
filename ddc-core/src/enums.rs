//! Status and classification enums shared by every backend.

use serde::{Deserialize, Serialize};

/// Result of a put attempt against a backend.
///
/// `Executing` is not a promise of eventual success: the write was accepted
/// and will complete (or fail) in the background, and the caller receives no
/// further synchronous signal about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PutStatus {
    /// The attempt failed or the target is not writable.
    NotCached,
    /// Accepted; completes asynchronously.
    Executing,
    /// Durably stored and synchronously confirmed.
    Cached,
    /// The backend declined to cache this item. Not an error.
    Skipped,
}

impl PutStatus {
    /// Returns true for outcomes that need no retry (`Cached` or `Skipped`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cached | Self::Skipped)
    }

    /// Returns true if the backend accepted the data in some form.
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::NotCached)
    }
}

/// Coarse latency class of a backend.
///
/// Ordered fastest first: `Local < Fast < Slow`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SpeedClass {
    /// In-process or local disk.
    #[default]
    Local,
    /// Shared cache on a fast network.
    Fast,
    /// Remote service.
    Slow,
}

impl SpeedClass {
    /// Local or Fast. Only fast tiers receive backfill.
    pub fn is_fast(self) -> bool {
        self <= Self::Fast
    }

    /// Encode as a single byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Fast => 1,
            Self::Slow => 2,
        }
    }

    /// Decode from a single byte; unknown values map to `Slow`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Local,
            1 => Self::Fast,
            _ => Self::Slow,
        }
    }
}

/// Whether a backend lives on this machine or behind a network hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    Local,
    Remote,
    /// A composite holding both local and remote tiers.
    Mixed,
}

impl Locality {
    /// Default locality for a speed class.
    pub fn from_speed_class(speed: SpeedClass) -> Self {
        match speed {
            SpeedClass::Local => Self::Local,
            SpeedClass::Fast | SpeedClass::Slow => Self::Remote,
        }
    }

    pub fn includes_local(self) -> bool {
        matches!(self, Self::Local | Self::Mixed)
    }

    pub fn includes_remote(self) -> bool {
        matches!(self, Self::Remote | Self::Mixed)
    }
}

/// Scheduling priority of queued cache work.
///
/// `Blocking` is special: the work runs inline on the caller's task and is
/// never queued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Blocking,
}

impl Priority {
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Blocking)
    }
}

/// Per-item outcome of a structured request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionStatus {
    Ok,
    Error,
    Canceled,
}

impl CompletionStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<PutStatus> for CompletionStatus {
    fn from(status: PutStatus) -> Self {
        if status.is_accepted() {
            Self::Ok
        } else {
            Self::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_class_ordering() {
        assert!(SpeedClass::Local < SpeedClass::Fast);
        assert!(SpeedClass::Fast < SpeedClass::Slow);
        assert!(SpeedClass::Local.is_fast());
        assert!(SpeedClass::Fast.is_fast());
        assert!(!SpeedClass::Slow.is_fast());
    }

    #[test]
    fn test_speed_class_byte_encoding() {
        for speed in [SpeedClass::Local, SpeedClass::Fast, SpeedClass::Slow] {
            assert_eq!(SpeedClass::from_u8(speed.as_u8()), speed);
        }
        assert_eq!(SpeedClass::from_u8(200), SpeedClass::Slow);
    }

    #[test]
    fn test_put_status_classification() {
        assert!(PutStatus::Cached.is_terminal());
        assert!(PutStatus::Skipped.is_terminal());
        assert!(!PutStatus::Executing.is_terminal());
        assert!(!PutStatus::NotCached.is_terminal());

        assert!(PutStatus::Executing.is_accepted());
        assert!(!PutStatus::NotCached.is_accepted());
    }

    #[test]
    fn test_completion_from_put_status() {
        assert_eq!(CompletionStatus::from(PutStatus::Cached), CompletionStatus::Ok);
        assert_eq!(CompletionStatus::from(PutStatus::Skipped), CompletionStatus::Ok);
        assert_eq!(
            CompletionStatus::from(PutStatus::NotCached),
            CompletionStatus::Error
        );
    }

    #[test]
    fn test_locality_from_speed_class() {
        assert_eq!(Locality::from_speed_class(SpeedClass::Local), Locality::Local);
        assert_eq!(Locality::from_speed_class(SpeedClass::Fast), Locality::Remote);
        assert!(Locality::Mixed.includes_local());
        assert!(Locality::Mixed.includes_remote());
        assert!(!Locality::Remote.includes_local());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Lowest < Priority::Normal);
        assert!(Priority::Highest < Priority::Blocking);
        assert!(Priority::Blocking.is_blocking());
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
