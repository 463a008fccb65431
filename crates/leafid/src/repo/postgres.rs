use async_trait::async_trait;
use portable_atomic::{AtomicUsize, Ordering};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::{Allocation, Error, Repo, Result};

const SELECT_KEYS: &str = "SELECT biz_tag FROM leaf_alloc";
const BUMP_BY_CONFIGURED_STEP: &str =
    "UPDATE leaf_alloc SET max_id = max_id + step, update_time = now() WHERE biz_tag = $1";
const BUMP_BY_STEP: &str =
    "UPDATE leaf_alloc SET max_id = max_id + $1, update_time = now() WHERE biz_tag = $2";
const SELECT_ALLOCATION: &str = "SELECT max_id, step FROM leaf_alloc WHERE biz_tag = $1";

/// A [`Repo`] over the `leaf_alloc` table in PostgreSQL.
///
/// Several data sources may be configured; calls are spread across them
/// round-robin. Each bump runs its `UPDATE` and `SELECT` inside a single
/// transaction, so the row lock taken by the update serializes concurrent
/// processes bumping the same key.
#[derive(Debug)]
pub struct PgRepo {
    pools: Vec<PgPool>,
    next_pool: AtomicUsize,
}

impl PgRepo {
    /// Connects to every data source, keeping the ones that succeed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackingStore`] if no data source could be reached.
    pub async fn connect(data_sources: &[String], max_connections: u32) -> Result<Self> {
        let mut pools = Vec::with_capacity(data_sources.len());
        for (idx, url) in data_sources.iter().enumerate() {
            match PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
            {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    tracing::warn!(data_source = idx, error = %e, "open db failed");
                }
            }
        }
        if pools.is_empty() {
            return Err(Error::BackingStore {
                context: "no valid db".to_string(),
            });
        }
        tracing::info!(pools = pools.len(), "connected to backing store");
        Ok(Self {
            pools,
            next_pool: AtomicUsize::new(0),
        })
    }

    /// Creates the `leaf_alloc` table on the first data source if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails to apply.
    pub async fn run_migrations(&self) -> Result<()> {
        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
        MIGRATOR
            .run(&self.pools[0])
            .await
            .map_err(|e| Error::BackingStore {
                context: e.to_string(),
            })
    }

    fn pool(&self) -> &PgPool {
        let idx = self.next_pool.fetch_add(1, Ordering::Relaxed) % self.pools.len();
        &self.pools[idx]
    }

    async fn bump(&self, key: &str, step: Option<i64>) -> Result<Allocation> {
        let mut tx = self.pool().begin().await?;

        let updated = match step {
            None => sqlx::query(BUMP_BY_CONFIGURED_STEP)
                .bind(key)
                .execute(&mut *tx)
                .await?,
            Some(step) => sqlx::query(BUMP_BY_STEP)
                .bind(step)
                .bind(key)
                .execute(&mut *tx)
                .await?,
        };
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::UnsupportedKey {
                key: key.to_string(),
            });
        }

        let (max_id, step): (i64, i64) = sqlx::query_as(SELECT_ALLOCATION)
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Allocation { max_id, step })
    }
}

#[async_trait]
impl Repo for PgRepo {
    async fn list_keys(&self) -> Result<Vec<String>> {
        let keys: Vec<(String,)> = sqlx::query_as(SELECT_KEYS)
            .fetch_all(self.pool())
            .await?;
        Ok(keys
            .into_iter()
            .map(|(key,)| key)
            .filter(|key| !key.is_empty())
            .collect())
    }

    async fn bump_max_id(&self, key: &str) -> Result<Allocation> {
        self.bump(key, None).await
    }

    async fn bump_max_id_by(&self, key: &str, step: i64) -> Result<Allocation> {
        self.bump(key, Some(step)).await
    }
}
