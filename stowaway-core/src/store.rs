//! Embedded SQLite store backing the cache and the mutation queue.
//!
//! The store owns two independent tables:
//! - `cache`: key/value snapshots (`key` primary key)
//! - `queue`: mutation log (`id` primary key, indexed on `status` and `created_at`)
//!
//! A store that fails to open is not an error for the caller. It comes back in
//! the *unavailable* state, in which every façade operation degrades to a
//! neutral result.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

/// Handle to the local database.
///
/// Cloning is cheap: clones share the same connection pool. Construct one at
/// process start, pass it to [`Cache`](crate::Cache),
/// [`MutationQueue`](crate::MutationQueue) and
/// [`SyncEngine`](crate::SyncEngine), and [`close`](Self::close) it at shutdown.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: Option<SqlitePool>,
}

impl LocalStore {
    /// Opens (creating if missing) the database at `path`.
    ///
    /// Never fails: if the database cannot be initialized the error is logged
    /// and an unavailable store is returned.
    pub async fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_open(path).await {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Local store unavailable, continuing without persistence"
                );
                Self::unavailable()
            }
        }
    }

    /// Opens the database at `path`, returning the underlying error on failure.
    pub async fn try_open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Opens a private in-memory database. Contents vanish when the store is dropped.
    pub async fn open_in_memory() -> Self {
        match Self::try_open_in_memory().await {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(error = %e, "In-memory store unavailable");
                Self::unavailable()
            }
        }
    }

    /// Fallible variant of [`open_in_memory`](Self::open_in_memory).
    pub async fn try_open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every in-memory connection is its own database, so pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Returns a store that is permanently unavailable.
    pub fn unavailable() -> Self {
        Self { pool: None }
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool: Some(pool) })
    }

    /// Returns true if operations against this store can reach the database.
    pub fn is_available(&self) -> bool {
        self.pool().is_ok()
    }

    /// Closes the connection pool. The store is unavailable afterwards.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    pub(crate) fn pool(&self) -> Result<&SqlitePool, StoreError> {
        match &self.pool {
            Some(pool) if !pool.is_closed() => Ok(pool),
            _ => Err(StoreError::Unavailable),
        }
    }
}

/// Logs a failed façade operation that is about to degrade to a neutral result.
pub(crate) fn log_degraded(op: &'static str, key: &str, err: &StoreError) {
    if err.is_unavailable() {
        tracing::debug!(op, key, "Local store unavailable, skipping");
    } else {
        tracing::warn!(op, key, error = %err, "Local store operation failed");
    }
}

/// Current time in the store's timestamp resolution.
pub(crate) fn now() -> DateTime<Utc> {
    micros_to_datetime(Utc::now().timestamp_micros())
}

pub(crate) fn datetime_to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn object_names(store: &LocalStore, kind: &str) -> Vec<String> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = ? AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%' ORDER BY name",
        )
        .bind(kind)
        .fetch_all(store.pool().unwrap())
        .await
        .unwrap();
        rows.into_iter().map(|r| r.0).collect()
    }

    #[tokio::test]
    async fn test_open_creates_tables_and_indexes() {
        let temp_dir = tempdir().unwrap();
        let store = LocalStore::open(temp_dir.path().join("local.db")).await;
        assert!(store.is_available());

        let tables = object_names(&store, "table").await;
        assert!(tables.contains(&"cache".to_string()));
        assert!(tables.contains(&"queue".to_string()));

        let indexes = object_names(&store, "index").await;
        assert!(indexes.contains(&"idx_queue_status".to_string()));
        assert!(indexes.contains(&"idx_queue_created_at".to_string()));
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("data").join("local.db");

        let store = LocalStore::open(&path).await;
        assert!(store.is_available());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("local.db");

        let first = LocalStore::try_open(&path).await.unwrap();
        first.close().await;

        let second = LocalStore::try_open(&path).await.unwrap();
        assert!(second.is_available());
    }

    #[tokio::test]
    async fn test_open_failure_degrades_to_unavailable() {
        let temp_dir = tempdir().unwrap();
        // A regular file where a directory is expected
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let path = blocker.join("local.db");
        assert!(LocalStore::try_open(&path).await.is_err());

        let store = LocalStore::open(&path).await;
        assert!(!store.is_available());
    }

    #[tokio::test]
    async fn test_close_makes_store_unavailable() {
        let store = LocalStore::open_in_memory().await;
        assert!(store.is_available());

        store.close().await;
        assert!(!store.is_available());
        assert!(matches!(store.pool(), Err(StoreError::Unavailable)));
    }

    #[test]
    fn test_micros_roundtrip() {
        let at = now();
        assert_eq!(micros_to_datetime(datetime_to_micros(at)), at);
    }
}
