//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Every listed key goes through key derivation and the diff buffer, so
//! these two dominate CPU time on large buckets.

use carpark_bucket_diff::diff::key_deriver::{derive_destination_key, raw_source_key};
use carpark_bucket_diff::diff::{DedupScope, DiffBuffer, Page};
use carpark_bucket_diff::store::ObjectMeta;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use sha2::{Digest, Sha256};

fn source_keys(count: u32) -> Vec<String> {
    (0..count)
        .map(|n| {
            let digest: [u8; 32] = Sha256::digest(n.to_be_bytes()).into();
            raw_source_key(&format!("raw/root/user-{}", n % 16), &digest)
        })
        .collect()
}

/// Benchmark derive_destination_key - one call per listed CAR
fn bench_derive_destination_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_destination_key");
    group.throughput(Throughput::Elements(1));

    let key = source_keys(1).remove(0);
    group.bench_function("raw_car", |b| {
        b.iter(|| derive_destination_key(black_box(&key)))
    });

    group.bench_function("rejected_namespace", |b| {
        b.iter(|| derive_destination_key(black_box("complete/abc.car")))
    });

    group.finish();
}

/// Benchmark DiffBuffer::push_page - filter, derive, dedup and batch one page
fn bench_push_page(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_page");

    for page_size in [100u32, 1000] {
        let keys = source_keys(page_size);
        let page = Page {
            seq: 0,
            start_cursor: None,
            objects: keys
                .into_iter()
                .map(|key| ObjectMeta {
                    key,
                    size_bytes: 1024,
                    etag: None,
                })
                .collect(),
            next_cursor: None,
        };
        group.throughput(Throughput::Elements(page_size as u64));

        group.bench_function(format!("page_{}", page_size), |b| {
            b.iter_batched(
                || (DiffBuffer::new(256, DedupScope::Run, None), page.clone()),
                |(mut buffer, page)| {
                    buffer.push_page(page).unwrap();
                    while let Some(batch) = buffer.pop_batch() {
                        black_box(batch);
                    }
                    buffer
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_derive_destination_key, bench_push_page);
criterion_main!(benches);
