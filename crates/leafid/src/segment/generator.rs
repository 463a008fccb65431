use core::time::Duration;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    Error, IdGenerator, Repo, Result, SystemClock, TimeSource,
    segment::{SegmentBuffer, SnapshotStore},
};

/// How often the key set is compared against the backing store by default.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Settings for a [`SegmentIdGenerator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Directory holding one snapshot file per key.
    pub cache_dir: PathBuf,
    pub resync_interval: Duration,
}

impl SegmentConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }
}

struct Inner {
    repo: Arc<dyn Repo>,
    clock: Arc<dyn TimeSource>,
    snapshots: SnapshotStore,
    resync_interval: Duration,
    buffers: RwLock<HashMap<String, Arc<SegmentBuffer>>>,
    shutdown: CancellationToken,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

/// Routes each key to its own [`SegmentBuffer`] and keeps the set of buffers
/// in line with the keys present in the backing store.
///
/// Cloning is cheap; clones share the same buffers.
#[derive(Clone)]
pub struct SegmentIdGenerator {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for SegmentIdGenerator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegmentIdGenerator")
            .field("cache_dir", &self.inner.snapshots.dir())
            .field("resync_interval", &self.inner.resync_interval)
            .field("keys", &self.keys())
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl SegmentIdGenerator {
    pub fn new(repo: Arc<dyn Repo>, config: SegmentConfig) -> Self {
        Self::with_clock(repo, config, Arc::new(SystemClock))
    }

    /// Like [`SegmentIdGenerator::new`] with an explicit clock for refill
    /// timing.
    pub fn with_clock(
        repo: Arc<dyn Repo>,
        config: SegmentConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                clock,
                snapshots: SnapshotStore::new(config.cache_dir),
                resync_interval: config.resync_interval,
                buffers: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                resync_task: Mutex::new(None),
            }),
        }
    }

    /// The keys currently served, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.inner.buffers.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// The buffer serving `key`, if any.
    pub fn buffer(&self, key: &str) -> Option<Arc<SegmentBuffer>> {
        self.inner.buffers.read().get(key).cloned()
    }

    /// Brings the buffer map in line with the backing store's key list.
    ///
    /// New keys get a buffer (restored from its snapshot or bootstrapped from
    /// the repo); keys that vanished are dropped without being stored.
    ///
    /// # Errors
    ///
    /// Returns the repo's error if the key list cannot be fetched. The map is
    /// left untouched in that case.
    pub async fn resync(&self) -> Result<()> {
        let keys = self.inner.repo.list_keys().await?;

        let missing: Vec<String> = {
            let buffers = self.inner.buffers.read();
            keys.iter()
                .filter(|key| !buffers.contains_key(*key))
                .cloned()
                .collect()
        };
        for key in missing {
            let buffer = SegmentBuffer::new(
                key.clone(),
                Arc::clone(&self.inner.repo),
                Arc::clone(&self.inner.clock),
                self.inner.snapshots.clone(),
            )
            .await;
            tracing::info!(key = %key, "tracking new key");
            self.inner.buffers.write().entry(key).or_insert(buffer);
        }

        let live: HashSet<&str> = keys.iter().map(String::as_str).collect();
        self.inner.buffers.write().retain(|key, _| {
            let keep = live.contains(key.as_str());
            if !keep {
                tracing::info!(key = %key, "key removed from backing store");
            }
            keep
        });
        Ok(())
    }

    async fn store_all(&self) {
        let buffers: Vec<_> = self.inner.buffers.read().values().cloned().collect();
        for buffer in buffers {
            buffer.store().await;
        }
    }

    async fn resync_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and init already resynced.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => {
                    self.store_all().await;
                    tracing::info!("segment generator stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.resync().await {
                        tracing::warn!(error = %e, "periodic key resync failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl IdGenerator for SegmentIdGenerator {
    async fn init(&self) -> Result<()> {
        self.resync().await?;
        let handle = tokio::spawn(self.clone().resync_loop());
        if let Some(previous) = self.inner.resync_task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(keys = self.inner.buffers.read().len(), "segment generator initialized");
        Ok(())
    }

    async fn generate(&self, key: &str) -> Result<i64> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let buffer = self.buffer(key).ok_or_else(|| Error::UnsupportedKey {
            key: key.to_string(),
        })?;
        buffer.next_id().await
    }

    /// Signals the resync loop, which stores every buffer before exiting, and
    /// waits for it.
    async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.resync_task.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "resync task ended abnormally");
                }
            }
            None => self.store_all().await,
        }
    }
}
