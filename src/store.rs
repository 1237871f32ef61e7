// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed store shared by both protocol generations.
//!
//! One database holds four tables:
//!
//! | Table | Written by | Read by |
//! |-------|------------|---------|
//! | `serials` | external write path ([`SqliteStore::append`]) | NRTM3 sessions, NRTM4 generators |
//! | `version_info` | NRTM4 generators | generators, notification, NRTM3 `-q version` |
//! | `published_file` | NRTM4 generators (same transaction as `version_info`) | notification, publishers |
//! | `generation_lock` | [`crate::nrtm4::SqliteLockManager`] | same |
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended by several processes. Writes that are safe to repeat go through
//! [`execute_with_retry`], which backs off exponentially up to
//! `SQLITE_RETRY_MAX_ATTEMPTS`.
//!
//! ## Read Consistency
//!
//! Each [`ChangeLog`] call is answered by a single SELECT, which SQLite runs
//! against one snapshot of the database. Readers never block writers in WAL
//! mode.

use crate::changelog::{BoxFuture, ChangeLog, Operation, SerialEntry, SerialId, SerialRange};
use crate::config::StoreConfig;
use crate::error::{NrtmError, Result};
use crate::nrtm4::{NrtmVersionInfo, VersionRepository};
use crate::source::Source;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS serials (
        source TEXT NOT NULL,
        serial_id INTEGER NOT NULL,
        operation TEXT NOT NULL,
        object_type TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        payload TEXT,
        committed_at INTEGER NOT NULL,
        PRIMARY KEY (source, serial_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS version_info (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        version INTEGER NOT NULL,
        type TEXT NOT NULL,
        last_serial_id INTEGER NOT NULL,
        session_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (source, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS published_file (
        version_id INTEGER PRIMARY KEY REFERENCES version_info(id),
        name TEXT NOT NULL UNIQUE,
        hash TEXT NOT NULL,
        payload TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_lock (
        name TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
];

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

type SerialRow = (i64, String, String, String, Option<String>, i64);

fn entry_from_row(row: SerialRow) -> Result<SerialEntry> {
    let (serial_id, operation, object_type, primary_key, payload, committed_at) = row;
    let operation = Operation::from_str(&operation).map_err(|e| {
        NrtmError::Internal(format!("serial {} has corrupt operation: {}", serial_id, e))
    })?;
    Ok(SerialEntry {
        serial_id,
        operation,
        object_type,
        primary_key,
        payload,
        committed_at,
    })
}

/// Persistent store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Path to database file
    path: String,
}

impl SqliteStore {
    /// Open (or create) a file-backed store at the given path with defaults.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig::at_path(path)).await
    }

    /// Open a private in-memory store (tests, tooling).
    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    /// Open the store described by `config` and create missing tables.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path_str = config.sqlite_path.clone();
        info!(path = %path_str, "Initializing NRTM store");

        let url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let journal_mode = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| NrtmError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
        if config.is_in_memory() {
            // The database disappears with its connection
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        debug!(path = %path_str, "NRTM store schema ready");

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record a committed change and return it with its assigned serial.
    ///
    /// This is the hand-off point for the external write path. The serial is
    /// assigned as `max + 1` for the source inside a single statement, so
    /// concurrent appenders never share a serial.
    pub async fn append(
        &self,
        source: &Source,
        operation: Operation,
        object_type: &str,
        primary_key: &str,
        payload: Option<&str>,
    ) -> Result<SerialEntry> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let (serial_id,): (i64,) = execute_with_retry("serial_append", || async {
            sqlx::query_as(
                r#"
                INSERT INTO serials (source, serial_id, operation, object_type, primary_key, payload, committed_at)
                SELECT ?, COALESCE(MAX(serial_id), 0) + 1, ?, ?, ?, ?, ?
                FROM serials WHERE source = ?
                RETURNING serial_id
                "#,
            )
            .bind(source.as_str())
            .bind(operation.as_str())
            .bind(object_type)
            .bind(primary_key)
            .bind(payload)
            .bind(now)
            .bind(source.as_str())
            .fetch_one(pool)
            .await
        })
        .await?;

        debug!(
            source = %source,
            serial_id,
            operation = %operation,
            object_type,
            primary_key,
            "Appended serial entry"
        );

        Ok(SerialEntry {
            serial_id,
            operation,
            object_type: object_type.to_string(),
            primary_key: primary_key.to_string(),
            payload: payload.map(str::to_string),
            committed_at: now,
        })
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("NRTM store closed");
    }
}

impl ChangeLog for SqliteStore {
    fn entries_since(&self, source: &Source, after: SerialId) -> BoxFuture<'_, Vec<SerialEntry>> {
        let source = source.as_str().to_string();
        Box::pin(async move {
            let rows: Vec<SerialRow> = sqlx::query_as(
                r#"
                SELECT serial_id, operation, object_type, primary_key, payload, committed_at
                FROM serials
                WHERE source = ? AND serial_id > ?
                ORDER BY serial_id ASC
                "#,
            )
            .bind(&source)
            .bind(after)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(entry_from_row).collect()
        })
    }

    fn read_batch(
        &self,
        source: &Source,
        after: SerialId,
        max: usize,
    ) -> BoxFuture<'_, Vec<SerialEntry>> {
        let source = source.as_str().to_string();
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        Box::pin(async move {
            let rows: Vec<SerialRow> = sqlx::query_as(
                r#"
                SELECT serial_id, operation, object_type, primary_key, payload, committed_at
                FROM serials
                WHERE source = ? AND serial_id > ?
                ORDER BY serial_id ASC
                LIMIT ?
                "#,
            )
            .bind(&source)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(entry_from_row).collect()
        })
    }

    fn serial_range(&self, source: &Source) -> BoxFuture<'_, Option<SerialRange>> {
        let source = source.as_str().to_string();
        Box::pin(async move {
            let (first, last): (Option<i64>, Option<i64>) = sqlx::query_as(
                "SELECT MIN(serial_id), MAX(serial_id) FROM serials WHERE source = ?",
            )
            .bind(&source)
            .fetch_one(&self.pool)
            .await?;

            Ok(match (first, last) {
                (Some(first), Some(last)) => Some(SerialRange { first, last }),
                _ => None,
            })
        })
    }

    fn latest_version(&self, source: &Source) -> BoxFuture<'_, Option<NrtmVersionInfo>> {
        let source = source.clone();
        Box::pin(async move {
            VersionRepository::new(self.pool.clone())
                .find_last_version(&source)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ripe() -> Source {
        Source::new("RIPE")
    }

    #[tokio::test]
    async fn test_store_append_assigns_monotonic_serials() {
        let store = SqliteStore::in_memory().await.unwrap();

        let first = store
            .append(&ripe(), Operation::Add, "inetnum", "10.0.0.0 - 10.0.0.255", Some("inetnum: 10.0.0.0"))
            .await
            .unwrap();
        let second = store
            .append(&ripe(), Operation::Delete, "inetnum", "10.0.0.0 - 10.0.0.255", None)
            .await
            .unwrap();

        assert_eq!(first.serial_id, 1);
        assert_eq!(second.serial_id, 2);
        assert_eq!(second.operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_store_serials_are_per_source() {
        let store = SqliteStore::in_memory().await.unwrap();
        let nonauth = Source::new("RIPE-NONAUTH");

        store.append(&ripe(), Operation::Add, "mntner", "A-MNT", Some("mntner: A-MNT")).await.unwrap();
        store.append(&ripe(), Operation::Add, "mntner", "B-MNT", Some("mntner: B-MNT")).await.unwrap();
        let other = store
            .append(&nonauth, Operation::Add, "route", "10.0.0.0/8AS1", Some("route: 10.0.0.0/8"))
            .await
            .unwrap();

        assert_eq!(other.serial_id, 1);
        assert_eq!(store.latest_serial_id(&ripe()).await.unwrap(), Some(2));
        assert_eq!(store.latest_serial_id(&nonauth).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_entries_since_is_exclusive_and_ordered() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..5 {
            let key = format!("AS{}", i);
            store.append(&ripe(), Operation::Add, "aut-num", &key, Some("aut-num: x")).await.unwrap();
        }

        let entries = store.entries_since(&ripe(), 2).await.unwrap();
        let serials: Vec<_> = entries.iter().map(|e| e.serial_id).collect();
        assert_eq!(serials, vec![3, 4, 5]);
        assert_eq!(entries[0].primary_key, "AS2");
    }

    #[tokio::test]
    async fn test_read_batch_respects_limit() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 0..10 {
            let key = format!("AS{}", i);
            store.append(&ripe(), Operation::Add, "aut-num", &key, Some("aut-num: x")).await.unwrap();
        }

        let batch = store.read_batch(&ripe(), 4, 3).await.unwrap();
        let serials: Vec<_> = batch.iter().map(|e| e.serial_id).collect();
        assert_eq!(serials, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_serial_range_empty_and_populated() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.serial_range(&ripe()).await.unwrap(), None);
        assert_eq!(store.latest_serial_id(&ripe()).await.unwrap(), None);

        store.append(&ripe(), Operation::Add, "mntner", "A-MNT", Some("mntner: A-MNT")).await.unwrap();
        store.append(&ripe(), Operation::Update, "mntner", "A-MNT", Some("mntner: A-MNT")).await.unwrap();

        assert_eq!(
            store.serial_range(&ripe()).await.unwrap(),
            Some(SerialRange { first: 1, last: 2 })
        );
    }

    #[tokio::test]
    async fn test_latest_version_without_chain() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.latest_version(&ripe()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_persistence() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_persist.db");

        {
            let store = SqliteStore::new(&db_path).await.unwrap();
            store.append(&ripe(), Operation::Add, "mntner", "A-MNT", Some("mntner: A-MNT")).await.unwrap();
            store.close().await;
        }

        {
            let store = SqliteStore::new(&db_path).await.unwrap();
            let entries = store.entries_since(&ripe(), 0).await.unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].payload.as_deref(), Some("mntner: A-MNT"));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_store_path() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_path.db");

        let store = SqliteStore::new(&db_path).await.unwrap();
        assert!(store.path().contains("test_path.db"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_is_sqlite_busy_error_pool_timed_out() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
