use portable_atomic::{AtomicBool, Ordering};

/// Spins before falling back to yielding the thread.
const SPINS_BEFORE_YIELD: u32 = 64;

/// A busy-wait lock around a critical section too short to justify parking.
///
/// Waiters spin on a relaxed load (so contended waiters do not hammer the
/// cache line with CAS attempts) and yield the thread after a few rounds.
#[derive(Debug, Default)]
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

/// Releases the [`SpinLock`] on drop.
#[must_use]
pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        let mut spins = 0;
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    core::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[test]
    fn guards_a_non_atomic_read_modify_write() {
        let lock = SpinLock::new();
        let counter = AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        let _guard = lock.lock();
                        // Split load and store: only correct under the lock.
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::Relaxed), 80_000);
    }

    #[test]
    fn released_on_drop() {
        let lock = SpinLock::new();
        drop(lock.lock());
        let _again = lock.lock();
    }
}
