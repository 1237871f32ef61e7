// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM4 version metadata and publishable documents.
//!
//! # Document Layout
//!
//! ```json
//! {
//!   "nrtm_version": 4,
//!   "type": "delta",
//!   "source": "RIPE",
//!   "version": 7,
//!   "last_serial_id": 1234,
//!   "session_id": "6f0c...",
//!   "created_at": 1767225600000,
//!   "changes": [
//!     { "operation": "ADD", "object_type": "mntner", "primary_key": "A-MNT", "payload": "..." },
//!     { "operation": "DELETE", "object_type": "mntner", "primary_key": "B-MNT" }
//!   ]
//! }
//! ```
//!
//! Snapshots carry `objects` instead of `changes`. Field order is fixed by
//! the struct definitions, so the same input always serializes to the same
//! bytes and therefore the same hash.

use crate::changelog::{Operation, SerialId};
use crate::error::Result;
use crate::source::Source;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Protocol generation written into every document.
pub const NRTM_VERSION: u32 = 4;

/// Kind of versioned document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NrtmDocumentType {
    Snapshot,
    Delta,
}

impl NrtmDocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NrtmDocumentType::Snapshot => "snapshot",
            NrtmDocumentType::Delta => "delta",
        }
    }
}

impl fmt::Display for NrtmDocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NrtmDocumentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(NrtmDocumentType::Snapshot),
            "delta" => Ok(NrtmDocumentType::Delta),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

/// One published version of a source's chain. Never updated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NrtmVersionInfo {
    /// Store row id
    pub id: i64,
    pub source: Source,
    /// 1 for the snapshot, then +1 per delta
    pub version: i64,
    pub kind: NrtmDocumentType,
    /// Highest serial folded into this version
    pub last_serial_id: SerialId,
    /// Identifies the chain; set when the snapshot is created
    pub session_id: String,
    /// Epoch millis
    pub created_at: i64,
}

/// A change as published in a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaChange {
    pub operation: Operation,
    pub object_type: String,
    pub primary_key: String,
    /// Absent for deletes
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<String>,
}

/// An object as published in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotObject {
    pub object_type: String,
    pub primary_key: String,
    pub payload: String,
}

#[derive(Serialize)]
struct Document<'a, T: Serialize> {
    nrtm_version: u32,
    #[serde(rename = "type")]
    kind: NrtmDocumentType,
    source: &'a Source,
    version: i64,
    last_serial_id: SerialId,
    session_id: &'a str,
    created_at: i64,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct DeltaBody<'a> {
    changes: &'a [DeltaChange],
}

#[derive(Serialize)]
struct SnapshotBody<'a> {
    objects: &'a [SnapshotObject],
}

fn to_document_json<T: Serialize>(info: &NrtmVersionInfo, body: T) -> Result<String> {
    let document = Document {
        nrtm_version: NRTM_VERSION,
        kind: info.kind,
        source: &info.source,
        version: info.version,
        last_serial_id: info.last_serial_id,
        session_id: &info.session_id,
        created_at: info.created_at,
        body,
    };
    Ok(serde_json::to_string(&document)?)
}

/// File name a version is published under:
/// `nrtm-<kind>.<version>.<source>.<session-prefix>.json`.
pub fn file_name(info: &NrtmVersionInfo) -> String {
    let session_prefix: String = info
        .session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!(
        "nrtm-{}.{}.{}.{}.json",
        info.kind,
        info.version,
        info.source,
        session_prefix
    )
}

/// Lowercase hex SHA-256 of a serialized document.
pub fn sha256_hex(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// A delta document. `file_name` and `sha256hex` are set once it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishableDeltaFile {
    pub version_info: NrtmVersionInfo,
    pub changes: Vec<DeltaChange>,
    pub file_name: Option<String>,
    pub sha256hex: Option<String>,
}

impl PublishableDeltaFile {
    pub fn new(version_info: NrtmVersionInfo, changes: Vec<DeltaChange>) -> Self {
        Self {
            version_info,
            changes,
            file_name: None,
            sha256hex: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        to_document_json(
            &self.version_info,
            DeltaBody {
                changes: &self.changes,
            },
        )
    }
}

/// A snapshot document. `file_name` and `sha256hex` are set once it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishableSnapshotFile {
    pub version_info: NrtmVersionInfo,
    pub objects: Vec<SnapshotObject>,
    pub file_name: Option<String>,
    pub sha256hex: Option<String>,
}

impl PublishableSnapshotFile {
    pub fn new(version_info: NrtmVersionInfo, objects: Vec<SnapshotObject>) -> Self {
        Self {
            version_info,
            objects,
            file_name: None,
            sha256hex: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        to_document_json(
            &self.version_info,
            SnapshotBody {
                objects: &self.objects,
            },
        )
    }
}
