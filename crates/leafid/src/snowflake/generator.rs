use core::time::Duration;

use async_trait::async_trait;
use portable_atomic::{AtomicI64, Ordering};
use rand::Rng;

use crate::{Error, IdGenerator, LEAF_EPOCH, Result, TimeSource, snowflake::SpinLock};

pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
/// Largest assignable worker id (`1023`).
pub const MAX_WORKER_ID: i64 = (1 << WORKER_ID_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = WORKER_ID_BITS + SEQUENCE_BITS;

/// Backward jumps shorter than this are waited out once; longer ones halt
/// the generator.
pub const MAX_BACKWARD_MS: i64 = 5;

/// Exclusive upper bound of the random sequence a new millisecond starts at.
const SEQUENCE_SEED_BOUND: i64 = 100;

/// A Snowflake generator producing 63-bit ids: 41 bits of milliseconds since
/// the epoch, 10 bits of worker id and 12 bits of sequence.
///
/// Each millisecond's sequence starts at a random value below 100 so that a
/// restart replaying a millisecond is unlikely to reuse the same ids.
///
/// Backward clock jumps shorter than [`MAX_BACKWARD_MS`] are slept out once
/// and otherwise reported as [`Error::ClockSkew`]. Longer jumps halt the
/// generator: every later call fails with [`Error::SevereClockSkew`], even
/// after the clock recovers, until the generator is rebuilt.
///
/// All state is guarded by a single spin lock held only for the O(1) body of
/// [`SnowflakeGenerator::next_id`]. The sleep for a short rollback (at most
/// 8 ms) happens while the lock is held.
#[derive(Debug)]
pub struct SnowflakeGenerator<T>
where
    T: TimeSource,
{
    epoch: i64,
    worker_id: i64,
    lock: SpinLock,
    sequence: AtomicI64,
    last_timestamp: AtomicI64,
    /// Offset of the rollback that halted the generator, `0` while healthy.
    halted: AtomicI64,
    time: T,
}

impl<T> SnowflakeGenerator<T>
where
    T: TimeSource,
{
    /// Creates a generator for the worker id returned by `worker_id`.
    ///
    /// An `epoch_ms` that is not positive or lies in the future falls back to
    /// [`LEAF_EPOCH`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWorkerId`] if the worker id is outside
    /// `[0, MAX_WORKER_ID]`.
    ///
    /// # Example
    ///
    /// ```
    /// use leafid::{Error, SnowflakeGenerator, SystemClock};
    ///
    /// assert!(SnowflakeGenerator::new(0, || 1023, SystemClock).is_ok());
    /// assert!(matches!(
    ///     SnowflakeGenerator::new(0, || 1024, SystemClock),
    ///     Err(Error::InvalidWorkerId { .. })
    /// ));
    /// ```
    pub fn new(epoch_ms: i64, worker_id: impl FnOnce() -> i64, time: T) -> Result<Self> {
        let now = time.current_millis();
        let epoch = if epoch_ms <= 0 || epoch_ms > now {
            let fallback = LEAF_EPOCH.as_millis() as i64;
            if epoch_ms != 0 {
                tracing::warn!(epoch_ms, fallback, "invalid epoch, using default");
            }
            fallback
        } else {
            epoch_ms
        };

        let worker_id = worker_id();
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(Error::InvalidWorkerId {
                worker_id,
                max: MAX_WORKER_ID,
            });
        }
        tracing::info!(worker_id, epoch, "snowflake generator ready");

        Ok(Self {
            epoch,
            worker_id,
            lock: SpinLock::new(),
            sequence: AtomicI64::new(0),
            last_timestamp: AtomicI64::new(0),
            halted: AtomicI64::new(0),
            time,
        })
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Generates the next id.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockSkew`] if the clock is still behind after the retry
    ///   sleep. No state changes; the next call may succeed.
    /// - [`Error::SevereClockSkew`] if the clock jumped back by
    ///   [`MAX_BACKWARD_MS`] or more, now or on any earlier call.
    pub fn next_id(&self) -> Result<i64> {
        let _guard = self.lock.lock();

        let halted = self.halted.load(Ordering::Relaxed);
        if halted != 0 {
            return Err(Error::SevereClockSkew { offset_ms: halted });
        }

        let last = self.last_timestamp.load(Ordering::Relaxed);
        let mut now = self.time.current_millis();
        if now < last {
            let offset = last - now;
            if offset >= MAX_BACKWARD_MS {
                tracing::error!(offset_ms = offset, "clock moved backwards, halting generator");
                self.halted.store(offset, Ordering::Relaxed);
                return Err(Error::SevereClockSkew { offset_ms: offset });
            }
            self.time.sleep(Duration::from_millis((offset * 2) as u64));
            now = self.time.current_millis();
            if now < last {
                return Err(Error::ClockSkew {
                    offset_ms: last - now,
                });
            }
        }

        let sequence = if now == last {
            let next = (self.sequence.load(Ordering::Relaxed) + 1) & SEQUENCE_MASK;
            if next == 0 {
                now = self.wait_next_millis(last);
                random_sequence()
            } else {
                next
            }
        } else {
            random_sequence()
        };

        self.sequence.store(sequence, Ordering::Relaxed);
        self.last_timestamp.store(now, Ordering::Relaxed);
        Ok(((now - self.epoch) << TIMESTAMP_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | sequence)
    }

    /// Splits an id into `(timestamp_ms, worker_id, sequence)`, with the
    /// timestamp in milliseconds since the Unix epoch.
    pub fn decompose(&self, id: i64) -> (i64, i64, i64) {
        (
            (id >> TIMESTAMP_SHIFT) + self.epoch,
            (id >> WORKER_ID_SHIFT) & MAX_WORKER_ID,
            id & SEQUENCE_MASK,
        )
    }

    fn wait_next_millis(&self, last: i64) -> i64 {
        loop {
            let now = self.time.current_millis();
            if now > last {
                return now;
            }
            core::hint::spin_loop();
        }
    }
}

fn random_sequence() -> i64 {
    rand::rng().random_range(0..SEQUENCE_SEED_BOUND)
}

#[async_trait]
impl<T> IdGenerator for SnowflakeGenerator<T>
where
    T: TimeSource + 'static,
{
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn generate(&self, _key: &str) -> Result<i64> {
        self.next_id()
    }

    async fn shutdown(&self) {}
}
