use async_trait::async_trait;

use crate::Result;

/// How a node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CreateMode {
    Persistent,
    /// Persistent, with a ten-digit, per-parent counter appended to the name.
    PersistentSequential,
    /// Removed when the creating session ends.
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub const fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }

    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }
}

/// Node metadata relevant to versioned writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    /// Incremented by every successful [`Coordinator::set`].
    pub version: i32,
}

/// The operations worker-id assignment needs from a ZooKeeper-like
/// coordination service.
///
/// Paths are absolute and `/`-separated. Every failure is reported as
/// [`Error::Coordination`](crate::Error::Coordination).
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Adds credentials to the session.
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Names (not paths) of the direct children of `path`.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Creates a node and returns its actual path, which differs from `path`
    /// for sequential modes. The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    /// Replaces the node's data if its version still equals `version`
    /// (`-1` matches any version).
    async fn set(&self, path: &str, data: &[u8], version: i32) -> Result<Stat>;
}
