//! Error types shared by every generator in this crate.
//!
//! Recoverable failures (backing store, snapshot I/O, heartbeats) are logged
//! where they happen and only surface to the caller that triggered them.
//! Clock and exhaustion failures are returned as the generation result.

/// A result type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors `leafid` can produce.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The generator or buffer is shutting down and refuses new work.
    #[error("server closed")]
    Closed,

    /// No segment buffer exists for the requested key.
    #[error("not support key: {key}")]
    UnsupportedKey { key: String },

    /// Neither segment of a buffer can serve an id.
    ///
    /// Either the standby refill has not completed (the backing store is slow
    /// or unavailable) or the freshly activated segment was already empty.
    #[error("segments exhausted, buf: {key} ({reason})")]
    Exhausted { key: String, reason: &'static str },

    /// The backing store failed to list keys or allocate a range.
    #[error("backing store error: {context}")]
    BackingStore { context: String },

    /// The clock moved backwards by less than the tolerance but had not
    /// caught up after the retry sleep.
    #[error("clock moved backwards by {offset_ms}ms")]
    ClockSkew { offset_ms: i64 },

    /// The clock moved backwards beyond the tolerance. The Snowflake generator
    /// refuses every further call until it is rebuilt.
    #[error("clock moved backwards by {offset_ms}ms, generator halted")]
    SevereClockSkew { offset_ms: i64 },

    /// The coordination service could not assign or refresh a worker id.
    #[error("coordination error: {context}")]
    Coordination { context: String },

    /// The worker node was last written by a clock ahead of ours.
    #[error("clock rollback: node timestamp {recorded_ms} is ahead of now {now_ms}")]
    ClockRollback { recorded_ms: i64, now_ms: i64 },

    /// A worker id outside `[0, max]`.
    #[error("invalid worker id {worker_id}, must be within [0, {max}]")]
    InvalidWorkerId { worker_id: i64, max: i64 },

    /// Reading or writing a local snapshot or cache file failed.
    #[error("snapshot error: {context}")]
    Snapshot { context: String },
}

impl Error {
    /// The id reported to HTTP callers alongside the error message.
    ///
    /// A severe clock skew is reported as `-2` so clients can tell a halted
    /// generator apart from transient failures (`-1`).
    pub const fn code(&self) -> i64 {
        match self {
            Self::SevereClockSkew { .. } => -2,
            _ => -1,
        }
    }

    pub(crate) fn coordination(context: impl Into<String>) -> Self {
        Self::Coordination {
            context: context.into(),
        }
    }

    pub(crate) fn snapshot(context: impl Into<String>) -> Self {
        Self::Snapshot {
            context: context.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::snapshot(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::snapshot(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::BackingStore {
            context: err.to_string(),
        }
    }
}
