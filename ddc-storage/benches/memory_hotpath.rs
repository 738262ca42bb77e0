use bytes::Bytes;
use ddc_core::{CacheRecord, CacheKey, CacheBucket, MemoryCacheConfig};
use ddc_storage::MemoryCacheBackend;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn bench_keys(count: usize) -> Vec<String> {
    let bucket = CacheBucket::new("Bench").expect("bucket");
    (0..count)
        .map(|i| CacheKey::for_content(bucket.clone(), &i.to_le_bytes()).legacy_key())
        .collect()
}

fn bench_memory_cache(c: &mut Criterion) {
    let keys = bench_keys(1_024);
    let payload = Bytes::from(vec![7u8; 4 * 1024]);

    let cache = MemoryCacheBackend::new("Bench", MemoryCacheConfig::default()).expect("cache");
    for key in &keys {
        cache.store(key, payload.clone(), false);
    }

    c.bench_function("memory/fetch_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            black_box(cache.fetch(black_box(key)));
        });
    });

    c.bench_function("memory/probe_miss", |b| {
        b.iter(|| black_box(cache.probe(black_box("Bench/missing"))));
    });

    c.bench_function("memory/store_overwrite", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            black_box(cache.store(key, payload.clone(), true));
        });
    });

    // Budget of a quarter of the keys: most stores are rejected.
    let bounded = MemoryCacheBackend::new(
        "Bounded",
        MemoryCacheConfig::default().with_max_size(256 * 4 * 1024),
    )
    .expect("cache");
    c.bench_function("memory/store_over_budget", |b| {
        let mut i = 0;
        b.iter(|| {
            let key = &keys[i % keys.len()];
            i += 1;
            black_box(bounded.store(key, payload.clone(), false));
        });
    });
}

fn bench_record_package(c: &mut Criterion) {
    let bucket = CacheBucket::new("Bench").expect("bucket");
    let record = CacheRecord::builder(CacheKey::for_content(bucket, b"record"))
        .meta_field("lod", 0)
        .value(Bytes::from(vec![1u8; 16 * 1024]))
        .build()
        .expect("record");

    c.bench_function("record/to_package", |b| {
        b.iter(|| black_box(record.to_package().expect("package")));
    });

    let package = record.to_package().expect("package");
    c.bench_function("record/from_package", |b| {
        b.iter(|| black_box(CacheRecord::from_package(black_box(&package)).expect("decode")));
    });
}

criterion_group!(benches, bench_memory_cache, bench_record_package);
criterion_main!(benches);
