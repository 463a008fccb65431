use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default Snowflake epoch: Saturday, October 24, 2020 03:11:11 UTC
pub const LEAF_EPOCH: Duration = Duration::from_millis(1_603_509_071_000);

/// A wall-clock time source.
///
/// Both generators read time through this trait so tests can move the clock
/// backwards, freeze it, or advance it on sleep.
///
/// # Example
///
/// ```
/// use leafid::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> i64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// assert_eq!(FixedTime.current_secs(), 1);
/// ```
pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn current_millis(&self) -> i64;

    /// Seconds since the Unix epoch.
    fn current_secs(&self) -> i64 {
        self.current_millis() / 1000
    }

    /// Blocks the calling thread for `dur`.
    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// The system wall clock.
///
/// Unlike a monotonic clock this can move backwards (NTP corrections, manual
/// changes), which is exactly what the Snowflake generator needs to observe.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn current_millis(&self) -> i64 {
        (**self).current_millis()
    }

    fn current_secs(&self) -> i64 {
        (**self).current_secs()
    }

    fn sleep(&self, dur: Duration) {
        (**self).sleep(dur);
    }
}
