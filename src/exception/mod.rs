//! Temporary exceptions granted from chat.
//!
//! The [`ExceptionStore`] holds the security-group ids that operators have
//! approved. It is the only state shared between the listener (which adds
//! ids) and the scheduler (which clears them all on the reset trigger).
//!
//! Storage is delegated to a [`ListStore`]: an ordered, append-only list
//! under one fixed key. Two backends ship with the crate:
//!
//! - [`MemoryListStore`]: process-local, lost on restart
//! - [`sqlite::SqliteListStore`]: SQLite file that survives restarts
//!
//! Ids are appended without deduplication, so `add("g1")` twice lists
//! `["g1", "g1"]`. Membership checks go through an [`ExceptionSnapshot`].

pub mod sqlite;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Result, SgGuardError};

/// Key under which exception ids are stored.
pub const EXCEPTION_KEY: &str = "allowed_sg";

/// Trait for list-like key/value backends.
///
/// Implementations must be `Send + Sync` for use across async tasks, and each
/// operation must be atomic with respect to the others.
#[async_trait::async_trait]
pub trait ListStore: Send + Sync {
    /// Append `value` to the list at `key`.
    async fn push(&self, key: &str, value: &str) -> Result<()>;
    /// Return the whole list at `key` in insertion order.
    async fn range(&self, key: &str) -> Result<Vec<String>>;
    /// Remove the list at `key`.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// In-process list store.
#[derive(Default)]
pub struct MemoryListStore {
    lists: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ListStore for MemoryListStore {
    async fn push(&self, key: &str, value: &str) -> Result<()> {
        self.lists
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.lists.lock().await.get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lists.lock().await.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Ids read once at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionSnapshot {
    ids: Vec<String>,
    index: HashSet<String>,
}

impl ExceptionSnapshot {
    pub fn new(ids: Vec<String>) -> Self {
        let index = ids.iter().cloned().collect();
        Self { ids, index }
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.index.contains(group_id)
    }

    /// Ids in insertion order (duplicates included).
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Shared store of temporarily exempted security-group ids.
#[derive(Clone)]
pub struct ExceptionStore {
    backend: Arc<dyn ListStore>,
}

impl ExceptionStore {
    pub fn new(backend: Arc<dyn ListStore>) -> Self {
        Self { backend }
    }

    /// Store backed by a fresh [`MemoryListStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryListStore::new()))
    }

    /// Grant an exception for `group_id`.
    pub async fn add(&self, group_id: &str) -> Result<()> {
        self.backend
            .push(EXCEPTION_KEY, group_id)
            .await
            .map_err(into_store_error)?;
        info!("Temporary exception granted for {}", group_id);
        Ok(())
    }

    /// All granted ids in insertion order.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.backend
            .range(EXCEPTION_KEY)
            .await
            .map_err(into_store_error)
    }

    /// Drop every exception at once.
    pub async fn clear(&self) -> Result<()> {
        self.backend
            .delete(EXCEPTION_KEY)
            .await
            .map_err(into_store_error)?;
        info!("Temporary exceptions cleared ({})", self.backend.name());
        Ok(())
    }

    /// Read the list once for use as a run's membership snapshot.
    pub async fn snapshot(&self) -> Result<ExceptionSnapshot> {
        Ok(ExceptionSnapshot::new(self.list().await?))
    }
}

fn into_store_error(err: SgGuardError) -> SgGuardError {
    match err {
        SgGuardError::ExceptionStore(_) => err,
        other => SgGuardError::ExceptionStore(other.to_string()),
    }
}
