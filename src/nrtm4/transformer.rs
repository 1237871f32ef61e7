// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log entries to publishable records.
//!
//! ```text
//! SerialEntry ──┬──▶ excluded type? ──▶ dropped
//!               ├──▶ ADD/UPDATE without payload? ──▶ dropped
//!               └──▶ DeltaChange (order preserved)
//!
//! SerialEntry* ──▶ BTreeMap<(type, key), payload> (latest wins, DELETE removes)
//!              ──▶ SnapshotObject* sorted by (type, key)
//! ```
//!
//! Dropping is silent: callers only see a shorter output.

use super::model::{DeltaChange, SnapshotObject};
use crate::changelog::SerialEntry;
use crate::config::Nrtm4Config;
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

/// Object types never published by default (personal data).
pub const DEFAULT_EXCLUDED_OBJECT_TYPES: &[&str] = &["person", "role"];

#[derive(Debug, Clone)]
pub struct DeltaTransformer {
    /// Lowercased object types that are never published
    excluded: HashSet<String>,
}

impl Default for DeltaTransformer {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_OBJECT_TYPES.iter().copied())
    }
}

impl DeltaTransformer {
    pub fn new<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            excluded: excluded
                .into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &Nrtm4Config) -> Self {
        Self::new(&config.excluded_object_types)
    }

    pub fn is_publishable(&self, object_type: &str) -> bool {
        !self.excluded.contains(&object_type.to_ascii_lowercase())
    }

    /// Map entries to delta changes, preserving order. Each entry yields at
    /// most one change.
    pub fn to_delta_changes(&self, entries: &[SerialEntry]) -> Vec<DeltaChange> {
        entries
            .iter()
            .filter_map(|entry| self.to_delta_change(entry))
            .collect()
    }

    fn to_delta_change(&self, entry: &SerialEntry) -> Option<DeltaChange> {
        if !self.is_publishable(&entry.object_type) {
            trace!(serial_id = entry.serial_id, object_type = %entry.object_type, "Skipping excluded object type");
            return None;
        }

        let payload = if entry.operation.is_delete() {
            None
        } else {
            match &entry.payload {
                Some(payload) => Some(payload.clone()),
                None => {
                    trace!(serial_id = entry.serial_id, primary_key = %entry.primary_key, "Skipping unresolvable object");
                    return None;
                }
            }
        };

        Some(DeltaChange {
            operation: entry.operation,
            object_type: entry.object_type.clone(),
            primary_key: entry.primary_key.clone(),
            payload,
        })
    }

    /// Fold a full change history into the current set of publishable
    /// objects, sorted by object type then primary key.
    pub fn to_snapshot_objects(&self, entries: &[SerialEntry]) -> Vec<SnapshotObject> {
        let mut state: BTreeMap<(String, String), String> = BTreeMap::new();

        for entry in entries {
            if !self.is_publishable(&entry.object_type) {
                continue;
            }
            let key = (entry.object_type.clone(), entry.primary_key.clone());
            if entry.operation.is_delete() {
                state.remove(&key);
            } else if let Some(payload) = &entry.payload {
                state.insert(key, payload.clone());
            }
        }

        state
            .into_iter()
            .map(|((object_type, primary_key), payload)| SnapshotObject {
                object_type,
                primary_key,
                payload,
            })
            .collect()
    }
}
