//! Fuzz test for cache record package decoding.
//!
//! Packages come back from every tier, including remote ones, so decoding
//! must reject arbitrary bytes with an error rather than panic or allocate
//! without bound.
//!
//! Run with: cargo +nightly fuzz run record_package_fuzz -- -max_total_time=60

#![no_main]

use bytes::Bytes;
use ddc_core::CacheRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let package = Bytes::copy_from_slice(data);
    if let Ok(record) = CacheRecord::from_package(&package) {
        // Anything that decodes must encode back to a decodable package
        // describing the same record.
        let encoded = record.to_package().expect("decoded record re-encodes");
        let decoded = CacheRecord::from_package(&encoded).expect("re-encoded package decodes");
        assert_eq!(decoded, record);
    }
});
