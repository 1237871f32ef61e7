// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot and delta generation.
//!
//! # Delta Pipeline
//!
//! ```text
//! lock ──▶ last version ──▶ entries since ──▶ transform ──┬──▶ nothing to publish: Ok(None)
//!                 │                                        │
//!            none: NoSnapshot                              ▼
//!                                      ┌──────────── transaction ────────────┐
//!                                      │ version n+1 ─▶ JSON ─▶ SHA-256 ─▶ file │
//!                                      └───────────────── commit ─────────────┘
//!                                                          │
//! unlock (every path) ◀────────────────────────────────────┘
//! ```
//!
//! The version row and its file are written in one transaction: a failure
//! anywhere before commit leaves the chain exactly as it was.
//!
//! `last_serial_id` of a new delta is the highest serial fetched, including
//! entries the transformer dropped, so no entry is considered twice.

use super::files::PublishedFileRepository;
use super::lock::{acquire_with_wait, generation_lock_name, LockLease, LockManager, SqliteLockManager};
use super::model::{file_name, sha256_hex, PublishableDeltaFile, PublishableSnapshotFile};
use super::transformer::DeltaTransformer;
use super::version::VersionRepository;
use crate::changelog::{ChangeLog, BEFORE_FIRST_SERIAL};
use crate::config::Nrtm4Config;
use crate::error::{NrtmError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::source::Source;
use crate::store::SqliteStore;
use sqlx::sqlite::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lock behaviour for generators.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub lock_ttl: Duration,
    pub lock_wait_timeout: Duration,
    pub retry: RetryConfig,
}

impl GenerationSettings {
    pub fn from_config(config: &Nrtm4Config) -> Self {
        Self {
            lock_ttl: config.lock.ttl(),
            lock_wait_timeout: config.lock.wait_timeout_duration(),
            retry: RetryConfig::lock_wait(),
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self::from_config(&Nrtm4Config::default())
    }
}

/// Everything both generators need.
#[derive(Clone)]
struct Pipeline {
    pool: SqlitePool,
    log: Arc<dyn ChangeLog>,
    versions: VersionRepository,
    transformer: DeltaTransformer,
    locks: Arc<dyn LockManager>,
    settings: GenerationSettings,
}

impl Pipeline {
    fn new(store: &SqliteStore, transformer: DeltaTransformer) -> Self {
        let pool = store.pool().clone();
        Self {
            versions: VersionRepository::new(pool.clone()),
            log: Arc::new(store.clone()),
            locks: SqliteLockManager::shared(pool.clone()),
            pool,
            transformer,
            settings: GenerationSettings::default(),
        }
    }

    /// Run `work` under the source's generation lock, releasing it on every path.
    async fn locked<T, F, Fut>(&self, source: &Source, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = acquire_with_wait(
            self.locks.as_ref(),
            &generation_lock_name(source),
            self.settings.lock_ttl,
            self.settings.lock_wait_timeout,
            &self.settings.retry,
        )
        .await?;

        let result = work().await;
        self.release(&lease).await;
        result
    }

    async fn release(&self, lease: &LockLease) {
        if let Err(e) = self.locks.release(lease).await {
            // The lease expires on its own
            warn!(lock = %lease.name, error = %e, "Failed to release generation lock");
        }
    }
}

/// Produces delta files for sources that already have a snapshot.
#[derive(Clone)]
pub struct DeltaFileGenerator {
    pipeline: Pipeline,
}

impl DeltaFileGenerator {
    pub fn new(store: &SqliteStore, transformer: DeltaTransformer) -> Self {
        Self {
            pipeline: Pipeline::new(store, transformer),
        }
    }

    /// Read entries from another change log than the store's own.
    pub fn with_change_log(mut self, log: Arc<dyn ChangeLog>) -> Self {
        self.pipeline.log = log;
        self
    }

    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.pipeline.locks = locks;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.pipeline.settings = settings;
        self
    }

    /// Publish the changes since the last version as version `last + 1`.
    ///
    /// Returns `Ok(None)` when there is nothing new, or nothing publishable.
    /// Fails with [`NrtmError::NoSnapshot`] if the chain was never started.
    pub async fn create_delta(&self, source: &Source) -> Result<Option<PublishableDeltaFile>> {
        self.pipeline
            .locked(source, || self.create_delta_locked(source))
            .await
    }

    async fn create_delta_locked(&self, source: &Source) -> Result<Option<PublishableDeltaFile>> {
        let started = Instant::now();
        let p = &self.pipeline;

        let last = p
            .versions
            .find_last_version(source)
            .await?
            .ok_or_else(|| NrtmError::no_snapshot(source.as_str()))?;

        let entries = p.log.entries_since(source, last.last_serial_id).await?;
        let Some(last_entry) = entries.last() else {
            info!(source = %source, version = last.version, "No changes found, delta generation skipped");
            metrics::record_delta_skipped(source.as_str(), "no_changes");
            return Ok(None);
        };
        let last_serial_id = last_entry.serial_id;

        let changes = p.transformer.to_delta_changes(&entries);
        if changes.is_empty() {
            info!(
                source = %source,
                entries = entries.len(),
                "Changes found but all were filtered, delta generation skipped"
            );
            metrics::record_delta_skipped(source.as_str(), "all_filtered");
            return Ok(None);
        }

        let mut tx = p.pool.begin().await?;

        let next = VersionRepository::insert_next(&mut tx, &last, last_serial_id).await?;
        let mut delta = PublishableDeltaFile::new(next, changes);
        let payload = delta.to_json()?;
        let name = file_name(&delta.version_info);
        let hash = sha256_hex(&payload);
        PublishedFileRepository::save(&mut tx, delta.version_info.id, &name, &hash, &payload).await?;

        tx.commit().await?;

        info!(
            source = %source,
            version = delta.version_info.version,
            last_serial_id,
            changes = delta.changes.len(),
            skipped = entries.len() - delta.changes.len(),
            file = %name,
            "Delta published"
        );
        metrics::record_delta_generated(
            source.as_str(),
            delta.version_info.version,
            delta.changes.len(),
            started.elapsed(),
        );

        delta.file_name = Some(name);
        delta.sha256hex = Some(hash);
        Ok(Some(delta))
    }
}

/// Starts a version chain from the folded state of the change log.
#[derive(Clone)]
pub struct SnapshotFileGenerator {
    pipeline: Pipeline,
}

impl SnapshotFileGenerator {
    pub fn new(store: &SqliteStore, transformer: DeltaTransformer) -> Self {
        Self {
            pipeline: Pipeline::new(store, transformer),
        }
    }

    pub fn with_change_log(mut self, log: Arc<dyn ChangeLog>) -> Self {
        self.pipeline.log = log;
        self
    }

    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.pipeline.locks = locks;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.pipeline.settings = settings;
        self
    }

    /// Publish version 1 with a new session id.
    ///
    /// Fails with [`NrtmError::SnapshotExists`] if the source already has a
    /// chain.
    pub async fn create_snapshot(&self, source: &Source) -> Result<PublishableSnapshotFile> {
        self.pipeline
            .locked(source, || self.create_snapshot_locked(source))
            .await
    }

    async fn create_snapshot_locked(&self, source: &Source) -> Result<PublishableSnapshotFile> {
        let started = Instant::now();
        let p = &self.pipeline;

        if let Some(existing) = p.versions.find_last_version(source).await? {
            return Err(NrtmError::SnapshotExists {
                source_name: source.to_string(),
                version: existing.version,
            });
        }

        let entries = p.log.entries_since(source, BEFORE_FIRST_SERIAL).await?;
        let last_serial_id = entries.last().map_or(BEFORE_FIRST_SERIAL, |e| e.serial_id);
        let objects = p.transformer.to_snapshot_objects(&entries);
        let session_id = uuid::Uuid::new_v4().to_string();

        debug!(source = %source, entries = entries.len(), objects = objects.len(), "Folded change log");

        let mut tx = p.pool.begin().await?;

        let first =
            VersionRepository::save_snapshot_version(&mut tx, source, &session_id, last_serial_id)
                .await?;
        let mut snapshot = PublishableSnapshotFile::new(first, objects);
        let payload = snapshot.to_json()?;
        let name = file_name(&snapshot.version_info);
        let hash = sha256_hex(&payload);
        PublishedFileRepository::save(&mut tx, snapshot.version_info.id, &name, &hash, &payload)
            .await?;

        tx.commit().await?;

        info!(
            source = %source,
            session_id = %session_id,
            last_serial_id,
            objects = snapshot.objects.len(),
            file = %name,
            "Snapshot published"
        );
        metrics::record_snapshot_generated(source.as_str(), snapshot.objects.len(), started.elapsed());

        snapshot.file_name = Some(name);
        snapshot.sha256hex = Some(hash);
        Ok(snapshot)
    }
}
