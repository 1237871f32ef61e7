// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Published NRTM4 documents, keyed by file name.

use super::model::NrtmDocumentType;
use crate::error::{NrtmError, Result};
use crate::source::Source;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::str::FromStr;

/// A stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub version_id: i64,
    pub name: String,
    pub hash: String,
    pub payload: String,
}

/// Name and hash of a stored document, with its place in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub version: i64,
    pub kind: NrtmDocumentType,
    pub file_name: String,
    pub hash: String,
}

#[derive(Clone)]
pub struct PublishedFileRepository {
    pool: SqlitePool,
}

impl PublishedFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a document for a version on the caller's connection.
    ///
    /// File names are unique; a clash fails the caller's transaction.
    pub async fn save(
        conn: &mut SqliteConnection,
        version_id: i64,
        name: &str,
        hash: &str,
        payload: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO published_file (version_id, name, hash, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(version_id)
        .bind(name)
        .bind(hash)
        .bind(payload)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<PublishedFile>> {
        let row: Option<(i64, String, String, String)> = sqlx::query_as(
            "SELECT version_id, name, hash, payload FROM published_file WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(version_id, name, hash, payload)| PublishedFile {
            version_id,
            name,
            hash,
            payload,
        }))
    }

    /// References for every document of one chain, ascending by version.
    pub async fn list_references(
        &self,
        source: &Source,
        session_id: &str,
    ) -> Result<Vec<FileReference>> {
        let rows: Vec<(i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT v.version, v.type, f.name, f.hash
            FROM version_info v
            JOIN published_file f ON f.version_id = v.id
            WHERE v.source = ? AND v.session_id = ?
            ORDER BY v.version ASC
            "#,
        )
        .bind(source.as_str())
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(version, kind, file_name, hash)| {
                let kind = NrtmDocumentType::from_str(&kind)
                    .map_err(|e| NrtmError::Internal(format!("version {} is corrupt: {}", version, e)))?;
                Ok(FileReference {
                    version,
                    kind,
                    file_name,
                    hash,
                })
            })
            .collect()
    }
}
