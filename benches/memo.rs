//! Memoization hot-path benchmarks.
//!
//! Run with: `cargo bench --bench memo`
//!
//! Measures key derivation, value-cache hits (derive + lookup + deep copy),
//! resource-cache hits, and a skewed workload over a bounded LRU cache.

use std::hint::black_box;
use std::time::Instant;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use memokit::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const OPS: u64 = 10_000;
const KEYS: u64 = 1_024;

// ============================================================================
// Key derivation
// ============================================================================

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_key");
    group.throughput(Throughput::Elements(1));

    let deriver = KeyDeriver::new();
    let identity = FunctionIdentity::versioned("bench", "1");

    group.bench_function("u64", |b| {
        b.iter(|| deriver.derive_input(&identity, black_box(&(42u64,))))
    });

    let lender = "acme-lending".to_string();
    let rows: Vec<(u32, String)> = (0..64).map(|i| (i, format!("row-{i}"))).collect();
    group.bench_function("string_and_rows", |b| {
        b.iter(|| deriver.derive_input(&identity, black_box(&(lender.clone(), rows.clone()))))
    });

    group.finish();
}

// ============================================================================
// Hit latency
// ============================================================================

fn bench_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("hit_ns");
    group.throughput(Throughput::Elements(OPS));

    for len in [1usize, 64, 1_024] {
        let values = CacheBuilder::value("values")
            .build_infallible(move |x: &(u64,)| vec![x.0; len])
            .unwrap();
        for k in 0..KEYS {
            values.call(&(k,)).unwrap();
        }
        group.bench_with_input(BenchmarkId::new("value_copy", len), &len, |b, _| {
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    for i in 0..OPS {
                        black_box(values.call(&(i % KEYS,)).unwrap());
                    }
                }
                start.elapsed()
            })
        });
    }

    let resources = CacheBuilder::resource("resources")
        .build_infallible(|x: &(u64,)| vec![x.0; 1_024])
        .unwrap();
    for k in 0..KEYS {
        resources.call(&(k,)).unwrap();
    }
    group.bench_function("resource_arc", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                for i in 0..OPS {
                    black_box(resources.call(&(i % KEYS,)).unwrap());
                }
            }
            start.elapsed()
        })
    });

    group.finish();
}

// ============================================================================
// Skewed workload over a bounded cache
// ============================================================================

fn bench_skewed(c: &mut Criterion) {
    let mut group = c.benchmark_group("skewed_lru");
    group.throughput(Throughput::Elements(OPS));

    for capacity in [64usize, 512] {
        let cache = CacheBuilder::value("skewed")
            .config(CacheConfig::default().max_entries(capacity))
            .build_infallible(|x: &(u64,)| x.0.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, _| {
            b.iter_custom(|iters| {
                let mut rng = StdRng::seed_from_u64(7);
                let start = Instant::now();
                for _ in 0..iters {
                    for _ in 0..OPS {
                        // Squaring a uniform sample skews toward small keys.
                        let u: f64 = rng.random();
                        let key = (u * u * KEYS as f64) as u64;
                        black_box(cache.call(&(key,)).unwrap());
                    }
                }
                start.elapsed()
            })
        });
        println!("capacity {capacity}: hit ratio {:.3}", cache.metrics().hit_ratio().unwrap_or(0.0));
    }

    group.finish();
}

criterion_group!(benches, bench_key_derivation, bench_hits, bench_skewed);
criterion_main!(benches);
