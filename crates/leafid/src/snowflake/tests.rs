use core::time::Duration;
use std::{collections::HashSet, sync::Arc};

use portable_atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use super::*;
use crate::{Error, IdGenerator, LEAF_EPOCH, SystemClock, TimeSource};

const EPOCH: i64 = 1_000_000;
const START: i64 = 2_000_000;

/// A clock under test control. Sleeping advances it unless frozen.
struct ScriptedClock {
    now: AtomicI64,
    frozen: AtomicBool,
    sleeps: AtomicUsize,
}

impl ScriptedClock {
    fn at(now: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
            frozen: AtomicBool::new(false),
            sleeps: AtomicUsize::new(0),
        })
    }

    fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl TimeSource for ScriptedClock {
    fn current_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, dur: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        if !self.frozen.load(Ordering::SeqCst) {
            self.now
                .fetch_add(dur.as_millis() as i64, Ordering::SeqCst);
        }
    }
}

/// Advances one millisecond every `reads_per_tick` reads.
struct TickingClock {
    reads: AtomicI64,
    reads_per_tick: i64,
}

impl TimeSource for TickingClock {
    fn current_millis(&self) -> i64 {
        START + self.reads.fetch_add(1, Ordering::Relaxed) / self.reads_per_tick
    }
}

fn generator(clock: &Arc<ScriptedClock>, worker_id: i64) -> SnowflakeGenerator<Arc<ScriptedClock>> {
    SnowflakeGenerator::new(EPOCH, || worker_id, Arc::clone(clock)).unwrap()
}

#[test]
fn packs_timestamp_worker_and_sequence() {
    let clock = ScriptedClock::at(START);
    let generator = generator(&clock, 7);

    let first = generator.next_id().unwrap();
    let (timestamp, worker_id, sequence) = generator.decompose(first);
    assert_eq!(timestamp, START);
    assert_eq!(worker_id, 7);
    assert!(sequence < 100);
    assert_eq!(first >> 22, START - EPOCH);

    let second = generator.next_id().unwrap();
    assert_eq!(second, first + 1);
    assert!(first > 0);
}

#[test]
fn new_millisecond_reseeds_sequence() {
    let clock = ScriptedClock::at(START);
    let generator = generator(&clock, 1);
    for _ in 0..500 {
        generator.next_id().unwrap();
    }

    clock.set(START + 1);
    let (timestamp, _, sequence) = generator.decompose(generator.next_id().unwrap());
    assert_eq!(timestamp, START + 1);
    assert!(sequence < 100);
}

#[test]
fn rejects_out_of_range_worker_ids() {
    for worker_id in [-1, MAX_WORKER_ID + 1, i64::MAX] {
        let result = SnowflakeGenerator::new(EPOCH, || worker_id, SystemClock);
        assert!(matches!(
            result,
            Err(Error::InvalidWorkerId { worker_id: w, max: 1023 }) if w == worker_id
        ));
    }
    assert!(SnowflakeGenerator::new(EPOCH, || 0, SystemClock).is_ok());
    assert!(SnowflakeGenerator::new(EPOCH, || MAX_WORKER_ID, SystemClock).is_ok());
}

#[test]
fn misconfigured_epoch_falls_back_to_default() {
    let default = LEAF_EPOCH.as_millis() as i64;

    for epoch in [0, -5, i64::MAX] {
        let generator = SnowflakeGenerator::new(epoch, || 1, SystemClock).unwrap();
        assert_eq!(generator.epoch(), default);
    }
    let generator = SnowflakeGenerator::new(EPOCH, || 1, SystemClock).unwrap();
    assert_eq!(generator.epoch(), EPOCH);
}

#[test]
fn ids_increase_with_non_decreasing_clock() {
    let clock = TickingClock {
        reads: AtomicI64::new(0),
        reads_per_tick: 5_000,
    };
    let generator = SnowflakeGenerator::new(EPOCH, || 3, clock).unwrap();

    let mut previous = (i64::MIN, i64::MIN);
    for _ in 0..50_000 {
        let (timestamp, worker_id, sequence) = generator.decompose(generator.next_id().unwrap());
        assert_eq!(worker_id, 3);
        assert!((timestamp, sequence) > previous);
        previous = (timestamp, sequence);
    }
}

#[test]
fn short_rollback_sleeps_once_then_succeeds() {
    let clock = ScriptedClock::at(START);
    let generator = generator(&clock, 1);
    generator.next_id().unwrap();

    clock.set(START - 3);
    let id = generator.next_id().unwrap();
    assert_eq!(clock.sleeps(), 1);
    assert_eq!(generator.decompose(id).0, START + 3);
}

#[test]
fn short_rollback_that_persists_is_transient_error() {
    let clock = ScriptedClock::at(START);
    let generator = generator(&clock, 1);
    generator.next_id().unwrap();

    clock.freeze();
    clock.set(START - 3);
    let err = generator.next_id().unwrap_err();
    assert_eq!(err, Error::ClockSkew { offset_ms: 3 });
    assert_eq!(err.code(), -1);

    clock.set(START);
    assert!(generator.next_id().is_ok());
}

#[test]
fn severe_rollback_halts_until_rebuilt() {
    let clock = ScriptedClock::at(START);
    let generator = generator(&clock, 1);
    generator.next_id().unwrap();

    clock.set(START - 50);
    let err = generator.next_id().unwrap_err();
    assert_eq!(err, Error::SevereClockSkew { offset_ms: 50 });
    assert_eq!(err.code(), -2);
    assert_eq!(clock.sleeps(), 0);

    clock.set(START + 1_000);
    for _ in 0..3 {
        assert_eq!(
            generator.next_id(),
            Err(Error::SevereClockSkew { offset_ms: 50 })
        );
    }

    let rebuilt = self::generator(&clock, 1);
    assert!(rebuilt.next_id().is_ok());
}

#[test]
fn concurrent_callers_get_unique_ids() {
    let generator = SnowflakeGenerator::new(0, || 9, SystemClock).unwrap();

    let ids: Vec<Vec<i64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    (0..10_000)
                        .map(|_| generator.next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for id in ids.into_iter().flatten() {
        assert!(id > 0);
        assert!(seen.insert(id), "duplicate id {id}");
    }
    assert_eq!(seen.len(), 40_000);
}

#[tokio::test]
async fn generate_ignores_the_key() {
    let clock = ScriptedClock::at(START);
    let generator = generator(&clock, 5);
    generator.init().await.unwrap();

    let a = generator.generate("order").await.unwrap();
    let b = generator.generate("anything").await.unwrap();
    assert_eq!(b, a + 1);

    generator.shutdown().await;
}
