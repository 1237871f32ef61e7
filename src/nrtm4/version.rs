// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Version chain per source.
//!
//! ```text
//! snapshot(1) ──▶ delta(2) ──▶ delta(3) ──▶ ... ──▶ delta(N)
//! ```
//!
//! Rows are only ever inserted. `UNIQUE(source, version)` rejects a second
//! row for the same number, so even a generator that bypassed the lock could
//! not fork the chain.

use super::model::{NrtmDocumentType, NrtmVersionInfo};
use crate::changelog::SerialId;
use crate::error::{NrtmError, Result};
use crate::source::Source;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::debug;

type VersionRow = (i64, String, i64, String, i64, String, i64);

const SELECT_COLUMNS: &str =
    "SELECT id, source, version, type, last_serial_id, session_id, created_at FROM version_info";

fn from_row(row: VersionRow) -> Result<NrtmVersionInfo> {
    let (id, source, version, kind, last_serial_id, session_id, created_at) = row;
    let kind = NrtmDocumentType::from_str(&kind)
        .map_err(|e| NrtmError::Internal(format!("version row {} is corrupt: {}", id, e)))?;
    Ok(NrtmVersionInfo {
        id,
        source: Source::new(source),
        version,
        kind,
        last_serial_id,
        session_id,
        created_at,
    })
}

#[derive(Clone)]
pub struct VersionRepository {
    pool: SqlitePool,
}

impl VersionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Latest version of the source's chain, `None` before the snapshot.
    pub async fn find_last_version(&self, source: &Source) -> Result<Option<NrtmVersionInfo>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "{} WHERE source = ? ORDER BY version DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(from_row).transpose()
    }

    /// All versions of one chain, ascending.
    pub async fn list_versions(
        &self,
        source: &Source,
        session_id: &str,
    ) -> Result<Vec<NrtmVersionInfo>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "{} WHERE source = ? AND session_id = ? ORDER BY version ASC",
            SELECT_COLUMNS
        ))
        .bind(source.as_str())
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(from_row).collect()
    }

    /// Append version `previous + 1` in its own transaction.
    ///
    /// The row is committed before this returns.
    pub async fn increment_and_save(
        &self,
        previous: &NrtmVersionInfo,
        last_serial_id: SerialId,
    ) -> Result<NrtmVersionInfo> {
        let mut tx = self.pool.begin().await?;
        let next = Self::insert_next(&mut tx, previous, last_serial_id).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Append version `previous + 1` on the caller's connection.
    ///
    /// Used inside the generator's transaction so the version row and its
    /// file commit together.
    pub async fn insert_next(
        conn: &mut SqliteConnection,
        previous: &NrtmVersionInfo,
        last_serial_id: SerialId,
    ) -> Result<NrtmVersionInfo> {
        if last_serial_id < previous.last_serial_id {
            return Err(NrtmError::Internal(format!(
                "last serial {} is behind version {} of {} (last serial {})",
                last_serial_id, previous.version, previous.source, previous.last_serial_id
            )));
        }

        Self::insert(
            conn,
            &previous.source,
            previous.version + 1,
            NrtmDocumentType::Delta,
            last_serial_id,
            &previous.session_id,
        )
        .await
    }

    /// Start a chain: version 1, a snapshot.
    pub async fn save_snapshot_version(
        conn: &mut SqliteConnection,
        source: &Source,
        session_id: &str,
        last_serial_id: SerialId,
    ) -> Result<NrtmVersionInfo> {
        Self::insert(
            conn,
            source,
            1,
            NrtmDocumentType::Snapshot,
            last_serial_id,
            session_id,
        )
        .await
    }

    async fn insert(
        conn: &mut SqliteConnection,
        source: &Source,
        version: i64,
        kind: NrtmDocumentType,
        last_serial_id: SerialId,
        session_id: &str,
    ) -> Result<NrtmVersionInfo> {
        let created_at = chrono::Utc::now().timestamp_millis();

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO version_info (source, version, type, last_serial_id, session_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(source.as_str())
        .bind(version)
        .bind(kind.as_str())
        .bind(last_serial_id)
        .bind(session_id)
        .bind(created_at)
        .fetch_one(&mut *conn)
        .await?;

        debug!(source = %source, version, kind = %kind, last_serial_id, "Inserted version");

        Ok(NrtmVersionInfo {
            id,
            source: source.clone(),
            version,
            kind,
            last_serial_id,
            session_id: session_id.to_string(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn ripe() -> Source {
        Source::new("RIPE")
    }

    async fn with_snapshot(store: &SqliteStore, last_serial_id: SerialId) -> NrtmVersionInfo {
        let mut conn = store.pool().acquire().await.unwrap();
        VersionRepository::save_snapshot_version(&mut conn, &ripe(), "session-a", last_serial_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_version_before_snapshot() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = VersionRepository::new(store.pool().clone());
        assert!(repo.find_last_version(&ripe()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_and_save() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = VersionRepository::new(store.pool().clone());
        let snapshot = with_snapshot(&store, 10).await;
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.kind, NrtmDocumentType::Snapshot);

        let next = repo.increment_and_save(&snapshot, 15).await.unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.kind, NrtmDocumentType::Delta);
        assert_eq!(next.session_id, "session-a");
        assert_eq!(next.last_serial_id, 15);

        let last = repo.find_last_version(&ripe()).await.unwrap().unwrap();
        assert_eq!(last, next);
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = VersionRepository::new(store.pool().clone());
        let snapshot = with_snapshot(&store, 10).await;

        repo.increment_and_save(&snapshot, 11).await.unwrap();
        let err = repo.increment_and_save(&snapshot, 12).await.unwrap_err();
        assert!(matches!(err, NrtmError::Store(_)));

        let last = repo.find_last_version(&ripe()).await.unwrap().unwrap();
        assert_eq!(last.version, 2);
        assert_eq!(last.last_serial_id, 11);
    }

    #[tokio::test]
    async fn test_last_serial_cannot_go_backwards() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = VersionRepository::new(store.pool().clone());
        let snapshot = with_snapshot(&store, 10).await;

        let err = repo.increment_and_save(&snapshot, 9).await.unwrap_err();
        assert!(matches!(err, NrtmError::Internal(_)));
    }

    #[tokio::test]
    async fn test_list_versions_in_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = VersionRepository::new(store.pool().clone());
        let mut last = with_snapshot(&store, 0).await;
        for serial in [3, 5, 9] {
            last = repo.increment_and_save(&last, serial).await.unwrap();
        }

        let versions = repo.list_versions(&ripe(), "session-a").await.unwrap();
        let numbers: Vec<_> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(repo.list_versions(&ripe(), "other").await.unwrap().is_empty());
    }
}
