use async_trait::async_trait;

use crate::Result;

/// A strategy for turning a business key into a unique id.
///
/// A process selects one implementation at startup and keeps it for its whole
/// lifetime, usually behind an `Arc<dyn IdGenerator>`.
#[async_trait]
pub trait IdGenerator: Send + Sync {
    /// Prepares the generator and starts its background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial state cannot be loaded.
    async fn init(&self) -> Result<()>;

    /// Produces the next id for `key`.
    ///
    /// Generators that do not partition by key ignore it.
    ///
    /// # Errors
    ///
    /// Returns an error if the generator is closed, the key is unknown, or no
    /// id can be produced right now.
    async fn generate(&self, key: &str) -> Result<i64>;

    /// Stops background tasks and persists whatever must survive a restart.
    async fn shutdown(&self);
}
