use core::time::Duration;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    Error, Result, SystemClock, TimeSource,
    snowflake::MAX_WORKER_ID,
    worker::{Coordinator, CreateMode, Endpoint, local_ip},
};

/// How often a registered worker rewrites its node.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

const CACHE_KEY: &str = "workerID";

/// Settings for [`WorkerIdCoordinator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerIdConfig {
    /// Service name, used to namespace both the node path and the cache file.
    pub leaf_name: String,
    /// Advertised address. Detected with [`local_ip`] when unset.
    pub ip: Option<String>,
    pub port: u16,
    /// `(user, password)` for digest authentication.
    pub auth: Option<(String, String)>,
    /// Root of the worker-id cache.
    pub cache_dir: PathBuf,
    /// Create the worker node as ephemeral-sequential rather than
    /// persistent-sequential. Persistent nodes let a restarted process on the
    /// same address reclaim its worker id after its session is gone.
    pub ephemeral: bool,
    pub heartbeat_interval: Duration,
}

impl WorkerIdConfig {
    pub fn new(leaf_name: impl Into<String>, port: u16) -> Self {
        Self {
            leaf_name: leaf_name.into(),
            ip: None,
            port,
            auth: None,
            cache_dir: std::env::temp_dir(),
            ephemeral: true,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// `/snowflake/<name>/forever`
    pub fn forever_path(&self) -> String {
        format!("/snowflake/{}/forever", self.leaf_name)
    }

    /// `<cache_dir>/<name>/leafconf/<port>/workerID.properties`
    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir
            .join(&self.leaf_name)
            .join("leafconf")
            .join(self.port.to_string())
            .join("workerID.properties")
    }
}

/// Reads the worker id cached by an earlier registration.
///
/// # Errors
///
/// Returns [`Error::Snapshot`] if the file exists but cannot be read or holds
/// no `workerID=<n>` line.
pub fn read_cached_worker_id(path: &Path) -> Result<Option<i64>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == CACHE_KEY)
        .and_then(|(_, value)| value.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| {
            Error::snapshot(format!("no worker id in `{}`", path.display()))
        })
}

fn write_cached_worker_id(path: &Path, worker_id: i64) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, format!("{CACHE_KEY}={worker_id}"))?;
    Ok(())
}

/// The sequence number a coordination service appended to `name`.
fn parse_sequence(name: &str) -> Result<i64> {
    name.rsplit_once('-')
        .and_then(|(_, seq)| seq.parse().ok())
        .ok_or_else(|| Error::coordination(format!("malformed worker node `{name}`")))
}

/// A worker id and, unless it came from the cache, the heartbeat keeping its
/// node fresh.
///
/// Dropping the registration stops the heartbeat; [`WorkerRegistration::stop`]
/// also waits for it.
#[derive(Debug)]
pub struct WorkerRegistration {
    worker_id: i64,
    node_path: Option<String>,
    shutdown: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl WorkerRegistration {
    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// The node backing this id, `None` when it was read from the cache.
    pub fn node_path(&self) -> Option<&str> {
        self.node_path.as_deref()
    }

    pub fn is_cached(&self) -> bool {
        self.node_path.is_none()
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.heartbeat.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Assigns this process a Snowflake worker id through a [`Coordinator`].
///
/// Workers are children of [`WorkerIdConfig::forever_path`] named
/// `<ip>:<port>-<sequence>`, and the sequence is the worker id. A process
/// whose address already has a node reuses it, unless that node was written
/// by a clock ahead of ours. A fresh address gets a new sequential node.
///
/// When the coordination service cannot be reached the id cached on disk by
/// the last successful registration is used instead.
pub struct WorkerIdCoordinator {
    coordinator: Arc<dyn Coordinator>,
    clock: Arc<dyn TimeSource>,
    config: WorkerIdConfig,
    ip: String,
}

impl core::fmt::Debug for WorkerIdCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerIdCoordinator")
            .field("config", &self.config)
            .field("ip", &self.ip)
            .finish_non_exhaustive()
    }
}

impl WorkerIdCoordinator {
    pub fn new(coordinator: Arc<dyn Coordinator>, config: WorkerIdConfig) -> Self {
        Self::with_clock(coordinator, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        coordinator: Arc<dyn Coordinator>,
        config: WorkerIdConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let ip = config
            .ip
            .clone()
            .unwrap_or_else(|| local_ip().to_string());
        Self {
            coordinator,
            clock,
            config,
            ip,
        }
    }

    /// `<ip>:<port>`, the prefix of this process's node name.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.config.port)
    }

    fn endpoint(&self, timestamp: i64) -> Endpoint {
        Endpoint {
            ip: self.ip.clone(),
            port: self.config.port.to_string(),
            timestamp,
        }
    }

    /// Resolves the worker id and starts the heartbeat.
    ///
    /// # Errors
    ///
    /// - [`Error::ClockRollback`] if this address's node carries a timestamp
    ///   ahead of the local clock.
    /// - [`Error::InvalidWorkerId`] if the assigned sequence exceeds
    ///   [`MAX_WORKER_ID`].
    /// - [`Error::Coordination`] if the service is unreachable and no cached
    ///   id exists.
    pub async fn register(&self) -> Result<WorkerRegistration> {
        match self.register_with_service().await {
            Err(Error::Coordination { context }) => {
                let cache = self.config.cache_file();
                match read_cached_worker_id(&cache) {
                    Ok(Some(worker_id)) => {
                        tracing::warn!(
                            error = %context,
                            worker_id,
                            path = %cache.display(),
                            "coordination unavailable, using cached worker id"
                        );
                        Ok(WorkerRegistration {
                            worker_id,
                            node_path: None,
                            shutdown: CancellationToken::new(),
                            heartbeat: None,
                        })
                    }
                    Ok(None) => Err(Error::Coordination { context }),
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable worker id cache");
                        Err(Error::Coordination { context })
                    }
                }
            }
            result => result,
        }
    }

    async fn register_with_service(&self) -> Result<WorkerRegistration> {
        if let Some((user, password)) = &self.config.auth {
            self.coordinator
                .add_auth("digest", format!("{user}:{password}").as_bytes())
                .await?;
        }

        let forever = self.config.forever_path();
        self.ensure_path(&forever).await?;

        let listen = self.listen_address();
        let existing = self
            .coordinator
            .children(&forever)
            .await?
            .into_iter()
            .find(|name| name.rsplit_once('-').is_some_and(|(addr, _)| addr == listen));

        let (worker_id, node_path) = match existing {
            Some(name) => {
                let worker_id = parse_sequence(&name)?;
                let node_path = format!("{forever}/{name}");
                let (data, _) = self.coordinator.get(&node_path).await?;
                let recorded = Endpoint::decode(&data)?.timestamp;
                let now = self.clock.current_millis();
                if recorded > now {
                    return Err(Error::ClockRollback {
                        recorded_ms: recorded,
                        now_ms: now,
                    });
                }
                tracing::info!(worker_id, node = %node_path, "reusing worker node for this endpoint");
                (worker_id, node_path)
            }
            None => {
                let mode = if self.config.ephemeral {
                    CreateMode::EphemeralSequential
                } else {
                    CreateMode::PersistentSequential
                };
                let data = self.endpoint(self.clock.current_millis()).encode()?;
                let node_path = self
                    .coordinator
                    .create(&format!("{forever}/{listen}-"), &data, mode)
                    .await?;
                let name = node_path.rsplit('/').next().unwrap_or(&node_path);
                let worker_id = parse_sequence(name)?;
                tracing::info!(worker_id, node = %node_path, "created worker node");
                (worker_id, node_path)
            }
        };

        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(Error::InvalidWorkerId {
                worker_id,
                max: MAX_WORKER_ID,
            });
        }

        let cache = self.config.cache_file();
        if let Err(e) = write_cached_worker_id(&cache, worker_id) {
            tracing::warn!(error = %e, path = %cache.display(), "failed to cache worker id");
        }

        let shutdown = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.clock),
            node_path.clone(),
            self.endpoint(0),
            self.config.heartbeat_interval,
            shutdown.clone(),
        ));

        Ok(WorkerRegistration {
            worker_id,
            node_path: Some(node_path),
            shutdown,
            heartbeat: Some(heartbeat),
        })
    }

    /// Creates every missing ancestor of `path`, and `path` itself.
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.coordinator.exists(&current).await?.is_some() {
                continue;
            }
            if let Err(e) = self
                .coordinator
                .create(&current, &[], CreateMode::Persistent)
                .await
            {
                // Lost a race with another process creating the same node.
                if self.coordinator.exists(&current).await?.is_none() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Rewrites the node's payload with a fresh timestamp every `interval`.
///
/// Failures are logged and retried on the next tick. A tick whose clock reads
/// earlier than the last upload is skipped.
async fn heartbeat(
    coordinator: Arc<dyn Coordinator>,
    clock: Arc<dyn TimeSource>,
    node_path: String,
    mut endpoint: Endpoint,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_upload = clock.current_millis();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!(node = %node_path, "heartbeat stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let now = clock.current_millis();
        if now < last_upload {
            tracing::warn!(node = %node_path, now, last_upload, "clock behind last heartbeat, skipping");
            continue;
        }
        endpoint.timestamp = now;

        let data = match endpoint.encode() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(node = %node_path, error = %e, "failed to encode heartbeat");
                continue;
            }
        };
        let version = match coordinator.get(&node_path).await {
            Ok((_, stat)) => stat.version,
            Err(e) => {
                tracing::warn!(node = %node_path, error = %e, "failed to read worker node");
                continue;
            }
        };
        match coordinator.set(&node_path, &data, version).await {
            Ok(_) => last_upload = now,
            Err(e) => {
                tracing::warn!(node = %node_path, error = %e, "failed to upload heartbeat");
            }
        }
    }
}
