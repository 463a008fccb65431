use core::time::Duration;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    Error, Repo, Result, TimeSource,
    segment::{
        range::Segment,
        snapshot::{BufferSnapshot, SegmentSnapshot, SnapshotStore},
    },
};

/// Upper bound for the adaptive step.
pub const MAX_STEP: i64 = 1_000_000;

/// Target time between two refills of the same buffer.
pub const SEGMENT_DURATION: Duration = Duration::from_secs(15 * 60);

/// Yields spent waiting for an in-flight refill before backing off.
const SPIN_LIMIT: usize = 10_000;
/// The single sleep taken once [`SPIN_LIMIT`] is exhausted.
const SPIN_BACKOFF: Duration = Duration::from_millis(10);
/// Poll interval used by [`SegmentBuffer::store`] while a refill finishes.
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Computes the step for the next refill from the time since the last one.
///
/// A refill sooner than [`SEGMENT_DURATION`] doubles the step (up to
/// [`MAX_STEP`]); one later than twice that halves it (down to `min_step`);
/// anything in between keeps it.
pub fn next_step(step: i64, min_step: i64, elapsed_secs: i64) -> i64 {
    let window = SEGMENT_DURATION.as_secs() as i64;
    if elapsed_secs < window {
        if step < MAX_STEP {
            step.saturating_mul(2).min(MAX_STEP)
        } else {
            step
        }
    } else if elapsed_secs > window * 2 {
        (step / 2).max(min_step)
    } else {
        step
    }
}

/// Two segments and which of them is serving.
#[derive(Debug, Default)]
struct Slots {
    pos: usize,
    segments: [Segment; 2],
}

impl Slots {
    fn active(&self) -> &Segment {
        &self.segments[self.pos]
    }

    fn standby_pos(&self) -> usize {
        (self.pos + 1) % 2
    }

    fn standby(&self) -> &Segment {
        &self.segments[self.standby_pos()]
    }

    fn switch(&mut self) {
        self.pos = self.standby_pos();
    }
}

#[derive(Debug, Default)]
struct StepState {
    step: i64,
    min_step: i64,
    /// Unix seconds of the last successful refill, `0` before the first.
    last_refill_at: i64,
}

/// Double-buffered id allocation for a single key.
///
/// The active segment serves ids under a shared lock. Once 90% of it is
/// consumed, one caller wins the `standby_loading` flag and spawns a refill of
/// the standby segment from the [`Repo`]. When the active segment runs dry,
/// the first caller to take the exclusive lock swaps in the standby.
///
/// The refill flag is independent of the lock so the trigger check never
/// blocks on a refill.
pub struct SegmentBuffer {
    key: String,
    repo: Arc<dyn Repo>,
    clock: Arc<dyn TimeSource>,
    snapshots: SnapshotStore,
    slots: RwLock<Slots>,
    steps: Mutex<StepState>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    standby_ready: AtomicBool,
    standby_loading: AtomicBool,
    stopped: AtomicBool,
}

impl core::fmt::Debug for SegmentBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentBuffer")
            .field("key", &self.key)
            .field("slots", &*self.slots.read())
            .field("steps", &*self.steps.lock())
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .field("standby_ready", &self.standby_ready.load(Ordering::Acquire))
            .field("standby_loading", &self.standby_loading.load(Ordering::Acquire))
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl SegmentBuffer {
    /// Creates the buffer for `key`, restoring a snapshot if one exists and
    /// otherwise loading the first range from the repo.
    ///
    /// A failed bootstrap is logged and leaves the buffer uninitialized; the
    /// first [`SegmentBuffer::next_id`] retries it.
    pub async fn new(
        key: impl Into<String>,
        repo: Arc<dyn Repo>,
        clock: Arc<dyn TimeSource>,
        snapshots: SnapshotStore,
    ) -> Arc<Self> {
        let buffer = Arc::new(Self {
            key: key.into(),
            repo,
            clock,
            snapshots,
            slots: RwLock::new(Slots::default()),
            steps: Mutex::new(StepState::default()),
            init_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            standby_ready: AtomicBool::new(false),
            standby_loading: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        match buffer.restore() {
            Ok(true) => {
                tracing::info!(key = %buffer.key, "load segment buf from file success");
                return buffer;
            }
            Ok(false) => {
                tracing::debug!(key = %buffer.key, "no snapshot, loading from repo");
            }
            Err(e) => {
                tracing::warn!(key = %buffer.key, error = %e, "load segment buf from file failed, loading from repo");
            }
        }

        match buffer.update_segment(0).await {
            Ok(()) => {
                buffer.initialized.store(true, Ordering::Release);
                tracing::info!(key = %buffer.key, "load segment buf from repo success");
            }
            Err(e) => {
                tracing::warn!(key = %buffer.key, error = %e, "initial segment load failed");
            }
        }
        buffer
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The step the next refill starts from.
    pub fn step(&self) -> i64 {
        self.steps.lock().step
    }

    /// The floor of the adaptive step.
    pub fn min_step(&self) -> i64 {
        self.steps.lock().min_step
    }

    /// Returns the next id for this key.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] once [`SegmentBuffer::store`] has started.
    /// - [`Error::Exhausted`] when neither segment can serve an id.
    /// - The repo's error if the buffer was never initialized and the
    ///   bootstrap fails again.
    pub async fn next_id(self: &Arc<Self>) -> Result<i64> {
        if !self.initialized.load(Ordering::Acquire) {
            let _guard = self.init_lock.lock().await;
            if !self.initialized.load(Ordering::Acquire) {
                let active = self.slots.read().pos;
                self.update_segment(active).await?;
                self.initialized.store(true, Ordering::Release);
            }
        }
        self.id_from_segments().await
    }

    async fn id_from_segments(self: &Arc<Self>) -> Result<i64> {
        {
            let slots = self.slots.read();
            if self.stopped.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let active = slots.active();
            // Prefetch once 90% of the active range is gone.
            if active.idle() * 10 <= active.step()
                && !self.standby_ready.load(Ordering::Acquire)
                && self
                    .standby_loading
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tokio::spawn(Arc::clone(self).load_standby());
            }
            let id = active.incr();
            if active.valid(id) {
                return Ok(id);
            }
        }

        self.wait_for_standby().await;

        let mut slots = self.slots.write();
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        // Someone may have switched while we waited.
        let active = slots.active();
        let id = active.incr();
        if active.valid(id) {
            return Ok(id);
        }

        if !self.standby_ready.load(Ordering::Acquire) {
            return Err(Error::Exhausted {
                key: self.key.clone(),
                reason: "both two segments not ready",
            });
        }

        slots.switch();
        self.standby_ready.store(false, Ordering::Release);
        self.dump(&slots);

        let active = slots.active();
        let id = active.incr();
        if active.valid(id) {
            Ok(id)
        } else {
            Err(Error::Exhausted {
                key: self.key.clone(),
                reason: "new segment exhausted",
            })
        }
    }

    /// Best-effort wait for an in-flight refill: a bounded run of yields, then
    /// one short sleep. The caller re-checks state afterwards either way.
    async fn wait_for_standby(&self) {
        let mut spins = 0;
        while self.standby_loading.load(Ordering::Acquire) {
            spins += 1;
            if spins > SPIN_LIMIT {
                tokio::time::sleep(SPIN_BACKOFF).await;
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Refills the standby segment. The caller owns the `standby_loading`
    /// flag, which is released here whatever the outcome.
    async fn load_standby(self: Arc<Self>) {
        if !self.standby_ready.load(Ordering::Acquire) {
            let target = self.slots.read().standby_pos();
            match self.update_segment(target).await {
                Ok(()) => self.standby_ready.store(true, Ordering::Release),
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "failed to load next segment");
                }
            }
        }
        self.standby_loading.store(false, Ordering::Release);
    }

    /// Allocates a new range from the repo into slot `target`.
    ///
    /// The first load adopts the row's configured step as both the current
    /// step and its floor; later loads size the request with [`next_step`].
    /// On failure nothing is modified.
    pub(crate) async fn update_segment(&self, target: usize) -> Result<()> {
        let planned = {
            let steps = self.steps.lock();
            if !self.initialized.load(Ordering::Acquire) || steps.last_refill_at == 0 {
                None
            } else {
                let elapsed = self.clock.current_secs() - steps.last_refill_at;
                Some(next_step(steps.step, steps.min_step, elapsed))
            }
        };

        let (allocation, step) = match planned {
            None => {
                let allocation = self.repo.bump_max_id(&self.key).await?;
                (allocation, allocation.step)
            }
            Some(step) => (self.repo.bump_max_id_by(&self.key, step).await?, step),
        };

        {
            let mut steps = self.steps.lock();
            steps.min_step = steps.min_step.max(allocation.step);
            steps.step = step;
            steps.last_refill_at = self.clock.current_secs();
        }

        let slots = self.slots.read();
        slots.segments[target].reset(allocation.max_id, step);
        self.dump(&slots);
        Ok(())
    }

    fn dump(&self, slots: &Slots) {
        let active = slots.active();
        let standby = slots.standby();
        tracing::trace!(
            key = %self.key,
            pos = slots.pos,
            active.max = active.max(),
            active.step = active.step(),
            active.cursor = active.cursor(),
            standby.max = standby.max(),
            standby.step = standby.step(),
            standby.cursor = standby.cursor(),
            "segment buf state"
        );
    }

    /// Restores the snapshot for this key, if any, consuming the file so it
    /// can only be replayed once.
    fn restore(&self) -> Result<bool> {
        let Some(snapshot) = self.snapshots.load(&self.key)? else {
            return Ok(false);
        };
        if snapshot.key != self.key {
            return Err(Error::snapshot(format!(
                "snapshot belongs to `{}`",
                snapshot.key
            )));
        }
        if snapshot.pos > 1 {
            return Err(Error::snapshot(format!("invalid pos {}", snapshot.pos)));
        }

        {
            let mut slots = self.slots.write();
            slots.pos = snapshot.pos;
            for (segment, saved) in slots.segments.iter().zip(snapshot.segs.iter()) {
                segment.restore(saved.max, saved.step, saved.value);
            }
            let mut steps = self.steps.lock();
            steps.min_step = snapshot.min_step;
            steps.step = snapshot.step.clamp(snapshot.min_step, MAX_STEP.max(snapshot.min_step));
            steps.last_refill_at = self.clock.current_secs();

            self.standby_ready
                .store(slots.standby().idle() > 0, Ordering::Release);
            self.dump(&slots);
        }
        self.initialized.store(true, Ordering::Release);

        if let Err(e) = self.snapshots.remove(&self.key) {
            tracing::warn!(key = %self.key, error = %e, "failed to remove consumed snapshot");
        }
        Ok(true)
    }

    /// Stops the buffer and writes its snapshot.
    ///
    /// New [`SegmentBuffer::next_id`] calls fail with [`Error::Closed`] from
    /// here on. An in-flight refill is waited for (without a timeout) so the
    /// snapshot includes it.
    pub async fn store(&self) {
        self.stopped.store(true, Ordering::Release);
        // Wait out readers that passed the stopped check before the flag
        // flipped; any refill they start is visible below.
        drop(self.slots.write());

        while self.standby_loading.load(Ordering::Acquire) {
            tokio::time::sleep(STORE_POLL_INTERVAL).await;
        }

        if !self.initialized.load(Ordering::Acquire) {
            tracing::info!(key = %self.key, "segment buf not init, skipping store");
            return;
        }

        let snapshot = self.snapshot();
        match self.snapshots.save(&snapshot) {
            Ok(path) => {
                tracing::info!(key = %self.key, path = %path.display(), "segment buf store success");
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "segment buf store failed");
            }
        }
    }

    /// Captures the current state. Takes the exclusive lock so no id is in
    /// flight while the cursors are read.
    pub fn snapshot(&self) -> BufferSnapshot {
        let slots = self.slots.write();
        let steps = self.steps.lock();
        let capture = |segment: &Segment| SegmentSnapshot {
            max: segment.max(),
            step: segment.step(),
            value: segment.cursor(),
        };
        BufferSnapshot {
            key: self.key.clone(),
            step: steps.step,
            min_step: steps.min_step,
            pos: slots.pos,
            segs: [capture(&slots.segments[0]), capture(&slots.segments[1])],
        }
    }

    #[cfg(test)]
    pub(crate) fn standby_pos(&self) -> usize {
        self.slots.read().standby_pos()
    }

    #[cfg(test)]
    pub(crate) fn is_standby_ready(&self) -> bool {
        self.standby_ready.load(Ordering::Acquire)
    }
}
