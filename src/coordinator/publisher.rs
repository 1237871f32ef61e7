// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic NRTM4 publisher.
//!
//! One task per source. Every interval it asks the [`DeltaFileGenerator`]
//! for a new delta. Generation is serialised by the store-backed lock, so
//! several engine processes can run publishers for the same source.
//!
//! # Failure Handling
//!
//! | Error | Action |
//! |-------|--------|
//! | `NoSnapshot` | Halt until a snapshot shows up in the store |
//! | retryable (`LockContended`, ...) | Try again next tick |
//! | anything else | Log, count, try again next tick |
//!
//! A halted publisher only checks the version chain on each tick. Once any
//! process sharing the store has published the snapshot, generation resumes.
//!
//! With `bootstrap_snapshot` set, a source without a chain gets its snapshot
//! on the first tick instead of halting.

use super::types::PublisherStatus;
use crate::error::NrtmError;
use crate::metrics;
use crate::nrtm4::{DeltaFileGenerator, SnapshotFileGenerator, VersionRepository};
use crate::source::Source;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Published { version: i64 },
    NothingNew,
    Halted,
    Failed,
}

pub(crate) struct Publisher {
    pub source: Source,
    pub deltas: DeltaFileGenerator,
    pub snapshots: SnapshotFileGenerator,
    pub versions: VersionRepository,
    pub interval: Duration,
    pub bootstrap_snapshot: bool,
    pub status: Arc<PublisherStatus>,
}

impl Publisher {
    /// Run until shutdown is signaled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("nrtm4_publisher", source = %self.source);

        async move {
            // Mark initial shutdown value as seen so changed() only fires on actual changes
            let _ = shutdown_rx.borrow_and_update();

            info!(
                interval_secs = self.interval.as_secs(),
                bootstrap_snapshot = self.bootstrap_snapshot,
                "Starting NRTM4 publisher"
            );

            if self.bootstrap_snapshot {
                self.bootstrap().await;
            }

            let mut timer = tokio::time::interval(self.interval);
            // Skip missed ticks instead of bursting to catch up
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping publisher");
                            break;
                        }
                        continue;
                    }

                    _ = timer.tick() => {}
                }

                self.tick().await;
            }

            info!("NRTM4 publisher stopped");
        }
        .instrument(span)
        .await
    }

    async fn bootstrap(&self) {
        match self.snapshots.create_snapshot(&self.source).await {
            Ok(snapshot) => {
                info!(
                    session_id = %snapshot.version_info.session_id,
                    objects = snapshot.objects.len(),
                    "Bootstrapped initial snapshot"
                );
                self.status.record_success(Some(snapshot.version_info.version));
            }
            Err(NrtmError::SnapshotExists { version, .. }) => {
                debug!(version, "Version chain already exists, no bootstrap needed");
            }
            Err(e) => {
                warn!(error = %e, "Snapshot bootstrap failed, delta generation will halt");
                metrics::record_generation_failure(self.source.as_str(), e.kind());
            }
        }
    }

    /// Check whether a halted publisher can resume.
    async fn snapshot_published(&self) -> bool {
        match self.versions.find_last_version(&self.source).await {
            Ok(Some(last)) => {
                info!(version = last.version, "Snapshot found, resuming delta generation");
                self.status.resume();
                true
            }
            Ok(None) => {
                debug!("Publisher halted, waiting for a snapshot");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not read version chain while halted");
                false
            }
        }
    }

    /// Run one generation attempt.
    pub(crate) async fn tick(&self) -> TickOutcome {
        if self.status.is_halted() && !self.snapshot_published().await {
            return TickOutcome::Halted;
        }

        match self.deltas.create_delta(&self.source).await {
            Ok(Some(delta)) => {
                let version = delta.version_info.version;
                self.status.record_success(Some(version));
                TickOutcome::Published { version }
            }
            Ok(None) => {
                self.status.record_success(None);
                TickOutcome::NothingNew
            }
            Err(e @ NrtmError::NoSnapshot { .. }) => {
                error!(error = %e, "No initial snapshot, halting delta generation");
                metrics::record_generation_failure(self.source.as_str(), e.kind());
                self.status.halt();
                TickOutcome::Halted
            }
            Err(e) => {
                let failures = self.status.record_failure();
                metrics::record_generation_failure(self.source.as_str(), e.kind());
                if e.is_retryable() {
                    warn!(error = %e, failures, "Delta generation failed, retrying next tick");
                } else {
                    error!(error = %e, failures, "Delta generation failed");
                }
                TickOutcome::Failed
            }
        }
    }
}
