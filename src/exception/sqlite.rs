//! SQLite-backed [`ListStore`].
//!
//! Lists are rows of the `list_entries` table keyed by list name; insertion
//! order is the autoincrement id. The database is accessed through an
//! [`r2d2`] connection pool ([`DbPool`]) and every call runs on the blocking
//! thread pool so async tasks are never stalled by disk I/O.

use std::path::Path;

use rusqlite::Connection;

use super::ListStore;
use crate::error::{Result, SgGuardError};

/// SQLite connection pool type alias (r2d2 + r2d2-sqlite).
pub type DbPool = r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>;

/// Open a connection pool for the given database file path.
///
/// Creates the database and `list_entries` table if they don't exist.
pub fn open_pool(path: &Path) -> Result<DbPool> {
    let manager = r2d2_sqlite::SqliteConnectionManager::file(path);
    build_pool(manager, 4)
}

/// Open an in-memory connection pool (for testing).
///
/// Limited to one connection: every in-memory connection is its own database.
pub fn open_memory_pool() -> Result<DbPool> {
    let manager = r2d2_sqlite::SqliteConnectionManager::memory();
    build_pool(manager, 1)
}

fn build_pool(manager: r2d2_sqlite::SqliteConnectionManager, size: u32) -> Result<DbPool> {
    let pool = r2d2::Pool::builder()
        .max_size(size)
        .build(manager)
        .map_err(|e| SgGuardError::ExceptionStore(e.to_string()))?;
    let conn = pool
        .get()
        .map_err(|e| SgGuardError::ExceptionStore(e.to_string()))?;
    init_db(&conn)?;
    Ok(pool)
}

/// Create the `list_entries` table if it doesn't exist.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS list_entries (
            id    INTEGER PRIMARY KEY AUTOINCREMENT,
            key   TEXT NOT NULL,
            value TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_list_entries_key ON list_entries(key);",
    )?;
    Ok(())
}

fn push_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO list_entries (key, value) VALUES (?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

fn range_values(conn: &Connection, key: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT value FROM list_entries WHERE key = ?1 ORDER BY id ASC")?;
    let rows = stmt.query_map(rusqlite::params![key], |row| row.get(0))?;

    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn delete_key(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM list_entries WHERE key = ?1",
        rusqlite::params![key],
    )?;
    Ok(())
}

/// [`ListStore`] persisted in SQLite.
#[derive(Clone)]
pub struct SqliteListStore {
    pool: DbPool,
}

impl SqliteListStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| SgGuardError::ExceptionStore(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| SgGuardError::ExceptionStore(e.to_string()))?
    }
}

#[async_trait::async_trait]
impl ListStore for SqliteListStore {
    async fn push(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| push_value(conn, &key, &value))
            .await
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| range_values(conn, &key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| delete_key(conn, &key)).await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
