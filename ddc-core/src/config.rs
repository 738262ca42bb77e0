//! Configuration for cache backends and the shared runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DdcResult};

/// Default number of retries for a failed write-behind put.
pub const DEFAULT_MAX_PUT_RETRIES: u32 = 1;

/// Default delay before retrying a write-behind put.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 10;

/// Default cap on the write-behind shadow cache. `None` is unbounded.
pub const DEFAULT_SHADOW_MAX_SIZE_BYTES: Option<u64> = None;

/// Snapshot entries older than this many loads are dropped.
pub const DEFAULT_MAX_ENTRY_AGE: u32 = 3;

/// Default number of work queue workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

// ============================================================================
// MEMORY CACHE
// ============================================================================

/// Configuration for a bounded memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Total size budget. `None` means unbounded.
    pub max_cache_size_bytes: Option<u64>,
    /// Whether `disable()` is honoured.
    pub allow_disable: bool,
    /// Snapshot entries older than this are dropped on load.
    pub max_entry_age: u32,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: None,
            allow_disable: false,
            max_entry_age: DEFAULT_MAX_ENTRY_AGE,
        }
    }
}

impl MemoryCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_cache_size_bytes = Some(bytes);
        self
    }

    pub fn with_allow_disable(mut self, allow: bool) -> Self {
        self.allow_disable = allow;
        self
    }

    pub fn with_max_entry_age(mut self, age: u32) -> Self {
        self.max_entry_age = age;
        self
    }

    pub fn validate(&self) -> DdcResult<()> {
        if self.max_cache_size_bytes == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_cache_size_bytes".to_string(),
                value: "0".to_string(),
                reason: "budget must be greater than 0, omit it for unbounded".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// ASYNC PUT
// ============================================================================

/// Configuration for a write-behind wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncPutConfig {
    /// Keep an in-memory shadow copy while a put is in flight.
    pub cache_in_flight_puts: bool,
    pub max_put_retries: u32,
    pub retry_delay_ms: u64,
    pub shadow_max_size_bytes: Option<u64>,
}

impl Default for AsyncPutConfig {
    fn default() -> Self {
        Self {
            cache_in_flight_puts: true,
            max_put_retries: DEFAULT_MAX_PUT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            shadow_max_size_bytes: DEFAULT_SHADOW_MAX_SIZE_BYTES,
        }
    }
}

impl AsyncPutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_in_flight_puts(mut self, enabled: bool) -> Self {
        self.cache_in_flight_puts = enabled;
        self
    }

    pub fn with_max_put_retries(mut self, retries: u32) -> Self {
        self.max_put_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_shadow_max_size(mut self, bytes: u64) -> Self {
        self.shadow_max_size_bytes = Some(bytes);
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Configuration of the in-flight shadow cache.
    pub fn shadow_config(&self) -> MemoryCacheConfig {
        MemoryCacheConfig {
            max_cache_size_bytes: self.shadow_max_size_bytes,
            allow_disable: false,
            max_entry_age: DEFAULT_MAX_ENTRY_AGE,
        }
    }

    pub fn validate(&self) -> DdcResult<()> {
        if self.max_put_retries > 16 {
            return Err(ConfigError::InvalidValue {
                field: "max_put_retries".to_string(),
                value: self.max_put_retries.to_string(),
                reason: "max_put_retries must be at most 16".to_string(),
            }
            .into());
        }
        if self.shadow_max_size_bytes == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "shadow_max_size_bytes".to_string(),
                value: "0".to_string(),
                reason: "shadow budget must be greater than 0".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Configuration for the shared cache runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Work queue workers. Zero runs every structured request inline.
    pub worker_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment (`DDC_WORKER_COUNT`).
    pub fn from_env() -> Self {
        let worker_count = std::env::var("DDC_WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WORKER_COUNT);

        Self { worker_count }
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn validate(&self) -> DdcResult<()> {
        if self.worker_count > 256 {
            return Err(ConfigError::InvalidValue {
                field: "worker_count".to_string(),
                value: self.worker_count.to_string(),
                reason: "worker_count must be at most 256".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DdcError;

    #[test]
    fn test_async_put_defaults() {
        let config = AsyncPutConfig::default();
        assert!(config.cache_in_flight_puts);
        assert_eq!(config.max_put_retries, 1);
        assert_eq!(config.retry_delay(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = AsyncPutConfig::new()
            .with_cache_in_flight_puts(false)
            .with_max_put_retries(3)
            .with_retry_delay(Duration::from_millis(25))
            .with_shadow_max_size(1024);
        assert!(!config.cache_in_flight_puts);
        assert_eq!(config.retry_delay_ms, 25);
        assert_eq!(config.shadow_config().max_cache_size_bytes, Some(1024));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = MemoryCacheConfig::new()
            .with_max_size(0)
            .validate()
            .expect_err("zero budget");
        assert!(matches!(err, DdcError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_too_many_retries_rejected() {
        assert!(AsyncPutConfig::new().with_max_put_retries(17).validate().is_err());
    }

    #[test]
    fn test_memory_config_from_toml_fragment() {
        let config: MemoryCacheConfig =
            toml::from_str("max_cache_size_bytes = 4096\nallow_disable = true")
                .expect("parse");
        assert_eq!(config.max_cache_size_bytes, Some(4096));
        assert!(config.allow_disable);
        assert_eq!(config.max_entry_age, DEFAULT_MAX_ENTRY_AGE);
    }

    #[test]
    fn test_runtime_config_from_env_defaults() {
        // Unset in the test environment
        let config = RuntimeConfig::from_env();
        assert!(config.worker_count <= 256);
        assert!(RuntimeConfig::default().validate().is_ok());
    }
}
