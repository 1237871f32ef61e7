// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Serial change log: the read side of committed registry changes.
//!
//! Every committed change gets a serial id that strictly increases per
//! source. Both protocol generations read from here: NRTM3 sessions stream
//! ranges of entries, NRTM4 generation folds unseen entries into the next
//! delta. Nothing in this crate writes existing entries.
//!
//! The [`ChangeLog`] trait is the seam to the store. [`crate::store::SqliteStore`]
//! is the production implementation; tests plug in in-memory logs.
//!
//! # Read Consistency
//!
//! Implementations answer each call from a single consistent view: an entry
//! is never visible before an entry with a smaller serial id of the same
//! source, and results are always in ascending serial order.

use crate::error::Result;
use crate::nrtm4::NrtmVersionInfo;
use crate::source::Source;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Serial number of a committed change.
pub type SerialId = i64;

/// Cursor position before any serial, including serial 0.
pub const BEFORE_FIRST_SERIAL: SerialId = -1;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Kind of committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Add,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ADD" => Ok(Operation::Add),
            "UPDATE" => Ok(Operation::Update),
            "DEL" | "DELETE" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// One committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialEntry {
    pub serial_id: SerialId,
    pub operation: Operation,
    /// RPSL object class, e.g. `inetnum`
    pub object_type: String,
    pub primary_key: String,
    /// Object text. `None` when the object's state could not be resolved.
    pub payload: Option<String>,
    /// Commit timestamp (epoch millis)
    pub committed_at: i64,
}

/// Inclusive range of serials currently available for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialRange {
    pub first: SerialId,
    pub last: SerialId,
}

impl SerialRange {
    pub fn contains(&self, serial: SerialId) -> bool {
        serial >= self.first && serial <= self.last
    }
}

/// Read-only access to the per-source change log.
pub trait ChangeLog: Send + Sync + 'static {
    /// All entries with `serial_id > after`, ascending.
    fn entries_since(&self, source: &Source, after: SerialId) -> BoxFuture<'_, Vec<SerialEntry>>;

    /// At most `max` entries with `serial_id > after`, ascending.
    ///
    /// Used by streaming readers that page through large ranges. The default
    /// implementation truncates [`entries_since`](Self::entries_since).
    fn read_batch(
        &self,
        source: &Source,
        after: SerialId,
        max: usize,
    ) -> BoxFuture<'_, Vec<SerialEntry>> {
        let source = source.clone();
        Box::pin(async move {
            let mut entries = self.entries_since(&source, after).await?;
            entries.truncate(max);
            Ok(entries)
        })
    }

    /// First and last available serial, `None` if the log is empty.
    fn serial_range(&self, source: &Source) -> BoxFuture<'_, Option<SerialRange>>;

    /// Highest committed serial, `None` if the log is empty.
    fn latest_serial_id(&self, source: &Source) -> BoxFuture<'_, Option<SerialId>> {
        let source = source.clone();
        Box::pin(async move { Ok(self.serial_range(&source).await?.map(|r| r.last)) })
    }

    /// Latest published NRTM4 version for the source, if any.
    ///
    /// Default: no version chain is known.
    fn latest_version(&self, _source: &Source) -> BoxFuture<'_, Option<NrtmVersionInfo>> {
        Box::pin(async { Ok(None) })
    }
}
