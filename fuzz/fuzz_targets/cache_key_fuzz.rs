//! Fuzz test for parsing `bucket/hash` cache keys.
//!
//! Run with: cargo +nightly fuzz run cache_key_fuzz -- -max_total_time=60

#![no_main]

use ddc_core::CacheKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(key) = input.parse::<CacheKey>() {
            // Display is the canonical form and parses back to the same key.
            let canonical = key.to_string();
            assert_eq!(canonical.parse::<CacheKey>().ok(), Some(key.clone()));
            assert_eq!(key.legacy_key(), canonical);
        }
    }
});
