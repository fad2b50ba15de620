//! Benchmarks for the per-step costs of the harness.
//!
//! Every generated step hashes the model's working state (plus every open
//! reader) and every commit snapshots the whole store, so these dominate a
//! long differential run.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench hashing              # run all benchmarks
//! cargo bench --bench hashing -- digest    # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kvoracle::canonical::encode_store;
use kvoracle::encoding::encode_to_vec;
use kvoracle::{Bucket, ReferenceModel, Store, store_digest};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Random bytes of length `0..=max`, with zeros over-represented.
fn random_bytes(rng: &mut StdRng, max: usize) -> Vec<u8> {
    let len = rng.random_range(0..=max);
    (0..len)
        .map(|_| {
            if rng.random_bool(0.2) {
                0
            } else {
                rng.random()
            }
        })
        .collect()
}

/// A store of `buckets` buckets holding `keys_per_bucket` entries each,
/// sized like the generator's inputs.
fn random_store(buckets: usize, keys_per_bucket: usize) -> Store {
    let mut rng = StdRng::seed_from_u64(0x6b76_6f72);
    let mut store = Store::new();
    while store.len() < buckets {
        let mut kvs = Bucket::new();
        for _ in 0..keys_per_bucket {
            kvs.insert(random_bytes(&mut rng, 46), random_bytes(&mut rng, 64));
        }
        store.insert(random_bytes(&mut rng, 45), kvs);
    }
    store
}

const SHAPES: [(usize, usize); 4] = [(1, 16), (4, 64), (8, 255), (16, 1024)];

// ------------------------------------------------------------------------------------------------
// Benchmarks
// ------------------------------------------------------------------------------------------------

/// **Scenario:** digest of a whole store, as sent with every `ensure-hash`.
fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");
    for (buckets, keys) in SHAPES {
        let store = random_store(buckets, keys);
        let bytes = encode_store(&store).len() as u64;
        group.throughput(Throughput::Bytes(bytes));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{buckets}x{keys}")),
            &store,
            |b, store| b.iter(|| store_digest(black_box(store))),
        );
    }
    group.finish();
}

/// **Scenario:** canonical byte stream without hashing.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonical_encode");
    for (buckets, keys) in SHAPES {
        let store = random_store(buckets, keys);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{buckets}x{keys}")),
            &store,
            |b, store| b.iter(|| encode_store(black_box(store))),
        );
    }
    group.finish();
}

/// **Scenario:** commit on the model followed by a reader snapshot.
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_snapshot");
    for (buckets, keys) in SHAPES {
        let mut model = ReferenceModel::new();
        for (name, kvs) in random_store(buckets, keys) {
            model.create_bucket(&name);
            for (k, v) in kvs {
                model.put(&name, &k, &v).expect("bucket exists");
            }
        }
        group.bench_function(BenchmarkId::from_parameter(format!("{buckets}x{keys}")), |b| {
            b.iter(|| {
                let mut m = model.clone();
                m.commit(false);
                m.create_reader();
                black_box(m.reader_digests())
            })
        });
    }
    group.finish();
}

/// **Scenario:** loopback commit record encoding.
fn bench_commit_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_record");
    for (buckets, keys) in SHAPES {
        let store = random_store(buckets, keys);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{buckets}x{keys}")),
            &store,
            |b, store| b.iter(|| encode_to_vec(black_box(store)).expect("encode")),
        );
    }
    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(
    benches,
    bench_digest,
    bench_encode,
    bench_snapshot,
    bench_commit_record,
);

criterion_main!(benches);
