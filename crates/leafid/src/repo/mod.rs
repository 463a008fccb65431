//! The backing store that hands out id ranges.
//!
//! Each allocation key is one row holding the highest id reserved so far
//! (`max_id`) and the configured reservation size (`step`). Bumping `max_id`
//! is the only cross-process synchronization point of the segment strategy,
//! so both bump operations must be atomic per key.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;

use crate::Result;

pub use memory::*;
#[cfg(feature = "postgres")]
pub use postgres::*;

/// The outcome of a bump: the new `max_id` and the row's configured step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub max_id: i64,
    pub step: i64,
}

/// Atomic range allocation over a shared table.
#[async_trait]
pub trait Repo: Send + Sync {
    /// Lists every known allocation key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackingStore`](crate::Error::BackingStore) if the store
    /// cannot be reached.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Bumps `max_id` for `key` by the row's configured step.
    ///
    /// Used for the first load of a buffer, which adopts the returned step as
    /// its floor.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the store fails.
    async fn bump_max_id(&self, key: &str) -> Result<Allocation>;

    /// Bumps `max_id` for `key` by an explicit `step`.
    ///
    /// The returned [`Allocation::step`] is still the row's configured step,
    /// not `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the store fails.
    async fn bump_max_id_by(&self, key: &str, step: i64) -> Result<Allocation>;
}
