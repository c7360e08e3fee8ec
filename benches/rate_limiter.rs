// Rate limiter hot-path benchmarks (Criterion)
//
// Key metrics measured:
// - Single-key check-and-increment latency
// - Lookup cost as the number of configured credentials grows
// - Contended checks across threads on one key and on many keys
//
// Usage:
//   cargo bench --bench rate_limiter

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use keygate::clock::{ManualClock, SharedClock};
use keygate::credentials::{CredentialConfig, CredentialKind, CredentialStore};
use keygate::rate_limit::{LimiterSettings, RateLimiter};
use std::hint::black_box;
use std::sync::Arc;

fn setup(credentials: usize) -> (Arc<RateLimiter>, Vec<String>) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::at_unix(1_700_000_040));
    let store = Arc::new(CredentialStore::in_memory(
        CredentialConfig::default(),
        clock.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(
        LimiterSettings::default(),
        store.clone(),
        clock,
    ));

    let ids = runtime.block_on(async {
        let mut ids = Vec::with_capacity(credentials);
        for i in 0..credentials {
            let key = store
                .issue(&format!("user-{}", i), CredentialKind::ApiKey, None)
                .await
                .unwrap();
            ids.push(key.id);
        }
        ids
    });
    for id in &ids {
        // Large limit so the bench measures admits, not denials
        limiter.upsert_config(id, "/predict", u32::MAX, 3600).unwrap();
    }
    (limiter, ids)
}

fn bench_single_key(c: &mut Criterion) {
    let (limiter, ids) = setup(1);
    c.bench_function("check_and_admit_single_key", |b| {
        b.iter(|| black_box(limiter.check_and_admit(&ids[0], "/predict").unwrap()));
    });
}

fn bench_many_credentials(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_and_admit_by_population");
    for population in [10, 1_000, 10_000] {
        let (limiter, ids) = setup(population);
        group.bench_with_input(
            BenchmarkId::from_parameter(population),
            &population,
            |b, _| {
                let mut i = 0;
                b.iter(|| {
                    i = (i + 1) % ids.len();
                    black_box(limiter.check_and_admit(&ids[i], "/predict").unwrap())
                });
            },
        );
    }
    group.finish();
}

fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_and_admit_contention");
    let threads = 4;
    let per_thread = 1_000;

    let (limiter, ids) = setup(threads);
    group.bench_function("same_key", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for _ in 0..threads {
                    let limiter = &limiter;
                    let id = &ids[0];
                    scope.spawn(move || {
                        for _ in 0..per_thread {
                            black_box(limiter.check_and_admit(id, "/predict").unwrap());
                        }
                    });
                }
            });
        });
    });

    group.bench_function("distinct_keys", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for id in &ids {
                    let limiter = &limiter;
                    scope.spawn(move || {
                        for _ in 0..per_thread {
                            black_box(limiter.check_and_admit(id, "/predict").unwrap());
                        }
                    });
                }
            });
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_single_key,
    bench_many_credentials,
    bench_contention
);
criterion_main!(benches);
