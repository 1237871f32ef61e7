// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Update notification: the index mirrors poll to discover new files.
//!
//! Lists the snapshot and every delta of the source's current session with
//! their hashes, ordered by version.

use super::files::{FileReference, PublishedFileRepository};
use super::model::{NrtmDocumentType, NRTM_VERSION};
use super::version::VersionRepository;
use crate::error::{NrtmError, Result};
use crate::source::Source;
use crate::store::SqliteStore;
use serde::Serialize;

/// One published file as listed in the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEntry {
    pub version: i64,
    pub file_name: String,
    pub hash: String,
}

impl From<FileReference> for NotificationEntry {
    fn from(file: FileReference) -> Self {
        Self {
            version: file.version,
            file_name: file.file_name,
            hash: file.hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateNotification {
    pub nrtm_version: u32,
    pub source: Source,
    pub session_id: String,
    /// Latest version of the chain
    pub version: i64,
    pub snapshot: NotificationEntry,
    pub deltas: Vec<NotificationEntry>,
}

impl UpdateNotification {
    /// Build the notification for the source's current session.
    ///
    /// `None` before the first snapshot.
    pub async fn build(store: &SqliteStore, source: &Source) -> Result<Option<Self>> {
        let versions = VersionRepository::new(store.pool().clone());
        let Some(latest) = versions.find_last_version(source).await? else {
            return Ok(None);
        };

        let files = PublishedFileRepository::new(store.pool().clone())
            .list_references(source, &latest.session_id)
            .await?;

        let mut snapshot = None;
        let mut deltas = Vec::with_capacity(files.len().saturating_sub(1));
        for file in files {
            match file.kind {
                NrtmDocumentType::Snapshot => snapshot = Some(NotificationEntry::from(file)),
                NrtmDocumentType::Delta => deltas.push(NotificationEntry::from(file)),
            }
        }

        let snapshot = snapshot.ok_or_else(|| {
            NrtmError::Internal(format!(
                "session {} of {} has no snapshot file",
                latest.session_id, source
            ))
        })?;

        Ok(Some(Self {
            nrtm_version: NRTM_VERSION,
            source: source.clone(),
            session_id: latest.session_id,
            version: latest.version,
            snapshot,
            deltas,
        }))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
