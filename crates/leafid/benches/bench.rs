use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use leafid::{
    IdGenerator, MemoryRepo, SegmentConfig, SegmentIdGenerator, SnowflakeGenerator, SystemClock,
    TimeSource,
};
use std::{sync::Arc, thread::scope, time::Instant};
use tokio::runtime::Builder;

struct FixedMockTime {
    millis: i64,
}

impl TimeSource for FixedMockTime {
    fn current_millis(&self) -> i64 {
        self.millis
    }
}

// Number of IDs generated per benchmark iteration (per-thread for
// multi-threaded).
const TOTAL_IDS: usize = 4096;

/// Snowflake hot path. A fixed clock never advances, so each iteration gets a
/// fresh generator and stays below the 4096 ids one millisecond can hold.
fn bench_snowflake(c: &mut Criterion) {
    let mut group = c.benchmark_group("snowflake");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("system_clock/elems/{TOTAL_IDS}"), |b| {
        let generator = SnowflakeGenerator::new(0, || 1, SystemClock).unwrap();
        b.iter(|| {
            for _ in 0..TOTAL_IDS {
                black_box(generator.next_id().unwrap());
            }
        });
    });

    group.bench_function(format!("fixed_clock/elems/{}", TOTAL_IDS / 2), |b| {
        b.iter_custom(|iters| {
            let mut elapsed = core::time::Duration::ZERO;
            for iter in 0..iters {
                let generator = SnowflakeGenerator::new(
                    0,
                    || 1,
                    FixedMockTime {
                        millis: 1_700_000_000_000 + iter as i64,
                    },
                )
                .unwrap();
                let start = Instant::now();
                for _ in 0..TOTAL_IDS / 2 {
                    black_box(generator.next_id().unwrap());
                }
                elapsed += start.elapsed();
            }
            elapsed
        });
    });

    group.finish();
}

fn bench_snowflake_threads(c: &mut Criterion) {
    for threads in [2, 4, 8] {
        let mut group = c.benchmark_group(format!("snowflake/threads/{threads}"));
        group.throughput(Throughput::Elements((TOTAL_IDS * threads) as u64));

        group.bench_function(format!("elems/{}", TOTAL_IDS * threads), |b| {
            let generator = Arc::new(SnowflakeGenerator::new(0, || 1, SystemClock).unwrap());
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    scope(|s| {
                        for _ in 0..threads {
                            let generator = Arc::clone(&generator);
                            s.spawn(move || {
                                for _ in 0..TOTAL_IDS {
                                    black_box(generator.next_id().unwrap());
                                }
                            });
                        }
                    });
                }
                start.elapsed()
            });
        });

        group.finish();
    }
}

/// Segment hot path with a large step so refills are rare.
fn bench_segment(c: &mut Criterion) {
    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepo::new());
    repo.insert("bench", 0, 1_000_000);
    let generator = SegmentIdGenerator::new(repo, SegmentConfig::new(dir.path()));
    rt.block_on(generator.init()).unwrap();

    let mut group = c.benchmark_group("segment");
    group.throughput(Throughput::Elements(TOTAL_IDS as u64));

    group.bench_function(format!("elems/{TOTAL_IDS}"), |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let generator = generator.clone();
            async move {
                let start = Instant::now();
                for _ in 0..iters {
                    for _ in 0..TOTAL_IDS {
                        black_box(generator.generate("bench").await.unwrap());
                    }
                }
                start.elapsed()
            }
        });
    });

    group.finish();
    rt.block_on(generator.shutdown());
}

criterion_group!(
    benches,
    bench_snowflake,
    bench_snowflake_threads,
    bench_segment
);
criterion_main!(benches);
