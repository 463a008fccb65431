use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{Allocation, Error, Repo, Result};

#[derive(Clone, Copy, Debug)]
struct Row {
    max_id: i64,
    step: i64,
}

/// An in-process [`Repo`].
///
/// Every bump runs under one mutex, so any number of generators sharing the
/// same `MemoryRepo` observe disjoint ranges, the same guarantee a database
/// transaction gives processes sharing a table.
///
/// The store can be switched off with [`MemoryRepo::set_available`] to
/// simulate an outage.
#[derive(Debug)]
pub struct MemoryRepo {
    rows: Mutex<BTreeMap<String, Row>>,
    available: AtomicBool,
    bumps: AtomicU64,
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            bumps: AtomicU64::new(0),
        }
    }

    /// Inserts or replaces the row for `key`.
    pub fn insert(&self, key: impl Into<String>, max_id: i64, step: i64) {
        self.rows.lock().insert(key.into(), Row { max_id, step });
    }

    /// Removes the row for `key`, returning whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.rows.lock().remove(key).is_some()
    }

    /// The current `max_id` stored for `key`.
    pub fn max_id(&self, key: &str) -> Option<i64> {
        self.rows.lock().get(key).map(|row| row.max_id)
    }

    /// Toggles availability. While unavailable every call fails with
    /// [`Error::BackingStore`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of successful bumps served so far.
    pub fn bumps(&self) -> u64 {
        self.bumps.load(Ordering::Acquire)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::BackingStore {
                context: "memory repo unavailable".to_string(),
            })
        }
    }

    fn bump(&self, key: &str, step: Option<i64>) -> Result<Allocation> {
        self.ensure_available()?;
        let mut rows = self.rows.lock();
        let row = rows.get_mut(key).ok_or_else(|| Error::UnsupportedKey {
            key: key.to_string(),
        })?;
        row.max_id += step.unwrap_or(row.step);
        self.bumps.fetch_add(1, Ordering::AcqRel);
        Ok(Allocation {
            max_id: row.max_id,
            step: row.step,
        })
    }
}

#[async_trait]
impl Repo for MemoryRepo {
    async fn list_keys(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self.rows.lock().keys().cloned().collect())
    }

    async fn bump_max_id(&self, key: &str) -> Result<Allocation> {
        self.bump(key, None)
    }

    async fn bump_max_id_by(&self, key: &str, step: i64) -> Result<Allocation> {
        self.bump(key, Some(step))
    }
}
