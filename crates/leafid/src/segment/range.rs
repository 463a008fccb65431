use portable_atomic::{AtomicI64, Ordering};

/// A numeric range `[max - step, max)` with a live cursor.
///
/// Every field is atomic so a segment can be reset through a shared
/// reference, but [`Segment::reset`] must only ever target the segment that is
/// not serving: a reset racing [`Segment::incr`] can hand out an id twice.
#[derive(Debug, Default)]
pub(crate) struct Segment {
    max: AtomicI64,
    step: AtomicI64,
    cursor: AtomicI64,
}

impl Segment {
    /// Loads a fresh range ending at `max` and rewinds the cursor to its start.
    pub(crate) fn reset(&self, max: i64, step: i64) {
        self.restore(max, step, max - step);
    }

    /// Loads a range with an explicit cursor, as captured in a snapshot.
    pub(crate) fn restore(&self, max: i64, step: i64, cursor: i64) {
        self.max.store(max, Ordering::Release);
        self.step.store(step, Ordering::Release);
        self.cursor.store(cursor, Ordering::Release);
    }

    /// Takes the value under the cursor and advances it by one.
    ///
    /// The result is not bounds checked; callers validate it with
    /// [`Segment::valid`].
    #[inline]
    pub(crate) fn incr(&self) -> i64 {
        self.cursor.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn valid(&self, value: i64) -> bool {
        value < self.max.load(Ordering::Acquire)
    }

    /// Ids left in the range. Approximate while other callers are taking ids,
    /// and negative once callers have raced past the end.
    #[inline]
    pub(crate) fn idle(&self) -> i64 {
        self.max.load(Ordering::Acquire) - self.cursor.load(Ordering::Acquire)
    }

    pub(crate) fn max(&self) -> i64 {
        self.max.load(Ordering::Acquire)
    }

    pub(crate) fn step(&self) -> i64 {
        self.step.load(Ordering::Acquire)
    }

    pub(crate) fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_starts_at_range_floor() {
        let segment = Segment::default();
        segment.reset(1000, 1000);

        assert_eq!(segment.cursor(), 0);
        assert_eq!(segment.idle(), 1000);
        assert_eq!(segment.incr(), 0);
        assert_eq!(segment.incr(), 1);
        assert_eq!(segment.idle(), 998);
    }

    #[test]
    fn values_past_max_are_invalid() {
        let segment = Segment::default();
        segment.reset(12, 2);

        let first = segment.incr();
        let second = segment.incr();
        let third = segment.incr();
        assert_eq!((first, second, third), (10, 11, 12));
        assert!(segment.valid(first));
        assert!(segment.valid(second));
        assert!(!segment.valid(third));
        assert_eq!(segment.idle(), -1);
    }

    #[test]
    fn empty_segment_has_no_capacity() {
        let segment = Segment::default();
        assert_eq!(segment.idle(), 0);
        assert!(!segment.valid(segment.incr()));
    }
}
