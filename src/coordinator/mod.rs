// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The shared store via [`crate::store::SqliteStore`]
//! - NRTM3 streaming via [`crate::nrtm3::Nrtm3Server`]
//! - NRTM4 publication via one [`publisher`] task per source
//!
//! # Architecture
//!
//! The coordinator manages the full serving lifecycle:
//! 1. Opens the SQLite store (change log, version chain, files, locks)
//! 2. Binds the NRTM3 listener and spawns its accept loop
//! 3. Spawns a periodic delta publisher per configured source
//! 4. Handles graceful shutdown: `%END` to keepalive clients, publishers
//!    finish their current run, store checkpointed and closed

mod publisher;
mod types;

pub use types::{EngineState, HealthCheck, PublisherStatus, SourceHealth};

use crate::changelog::ChangeLog;
use crate::config::NrtmConfig;
use crate::error::{NrtmError, Result};
use crate::metrics;
use crate::nrtm3::Nrtm3Server;
use crate::nrtm4::{
    DeltaFileGenerator, DeltaTransformer, GenerationSettings, PublishableSnapshotFile,
    SnapshotFileGenerator, VersionRepository,
};
use crate::source::Source;
use crate::store::SqliteStore;
use futures::future::join_all;
use publisher::Publisher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Time given to background tasks after shutdown is signalled.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The NRTM engine.
///
/// Serves NRTM3 mirror clients from the change log and publishes NRTM4
/// snapshot/delta files for every configured source.
pub struct NrtmEngine {
    /// Configuration
    config: NrtmConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shared store, open while the engine runs
    store: RwLock<Option<SqliteStore>>,

    /// Change log override; defaults to the store itself
    change_log: Option<Arc<dyn ChangeLog>>,

    /// Address the NRTM3 listener bound to
    nrtm3_addr: RwLock<Option<SocketAddr>>,

    /// Publisher bookkeeping per source
    publishers: RwLock<Vec<(Source, Arc<PublisherStatus>)>>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,

    drain_timeout: Duration,
}

impl NrtmEngine {
    /// Create a new engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to open the store and begin serving.
    pub fn new(config: NrtmConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            state_tx,
            state_rx,
            store: RwLock::new(None),
            change_log: None,
            nrtm3_addr: RwLock::new(None),
            publishers: RwLock::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Serve and publish from another change log than the store's own.
    ///
    /// Versions, files and locks still live in the store.
    pub fn with_change_log(mut self, log: Arc<dyn ChangeLog>) -> Self {
        self.change_log = Some(log);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn config(&self) -> &NrtmConfig {
        &self.config
    }

    /// The open store, `None` unless running.
    pub async fn store(&self) -> Option<SqliteStore> {
        self.store.read().await.clone()
    }

    /// Address of the NRTM3 listener, `None` unless running with NRTM3 enabled.
    pub async fn nrtm3_addr(&self) -> Option<SocketAddr> {
        *self.nrtm3_addr.read().await
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state.as_str());
    }

    /// Start the engine.
    ///
    /// 1. Validates config
    /// 2. Opens the store (SQLite)
    /// 3. Binds the NRTM3 listener and spawns its accept loop (if enabled)
    /// 4. Spawns one NRTM4 publisher per source (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(NrtmError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        self.config.validate()?;

        info!(
            source = %self.config.sources.name,
            non_auth_source = ?self.config.sources.non_auth_name,
            nrtm3 = self.config.nrtm3.enabled,
            nrtm4 = self.config.nrtm4.enabled,
            "Starting NRTM engine"
        );
        self.set_state(EngineState::Starting);

        let store = match SqliteStore::open(&self.config.store).await {
            Ok(store) => store,
            Err(e) => {
                error!(error = %e, "Failed to open store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        info!(path = %store.path(), "Store initialized");

        let log: Arc<dyn ChangeLog> = match &self.change_log {
            Some(log) => Arc::clone(log),
            None => Arc::new(store.clone()),
        };

        if self.config.nrtm3.enabled {
            if let Err(e) = self.spawn_nrtm3_server(Arc::clone(&log)).await {
                error!(error = %e, "Failed to start NRTM3 server");
                store.close().await;
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        }

        if self.config.nrtm4.enabled {
            self.spawn_publishers(&store, &log).await;
        }

        *self.store.write().await = Some(store);

        self.set_state(EngineState::Running);
        info!(
            nrtm3_addr = ?self.nrtm3_addr().await,
            publishers = self.publishers.read().await.len(),
            "NRTM engine running"
        );

        Ok(())
    }

    /// Bind the listener and spawn the accept loop.
    async fn spawn_nrtm3_server(&self, log: Arc<dyn ChangeLog>) -> Result<()> {
        let server = Nrtm3Server::bind(
            &self.config.nrtm3,
            log,
            self.config.sources.context(),
            self.shutdown_rx.clone(),
        )
        .await?;
        let addr = server.local_addr()?;
        *self.nrtm3_addr.write().await = Some(addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "NRTM3 server stopped with error");
            }
        });

        info!(%addr, "Spawned NRTM3 server");
        self.handles.write().await.push(handle);
        Ok(())
    }

    fn generators(
        &self,
        store: &SqliteStore,
        log: &Arc<dyn ChangeLog>,
    ) -> (DeltaFileGenerator, SnapshotFileGenerator) {
        let transformer = DeltaTransformer::from_config(&self.config.nrtm4);
        let settings = GenerationSettings::from_config(&self.config.nrtm4);
        let deltas = DeltaFileGenerator::new(store, transformer.clone())
            .with_change_log(Arc::clone(log))
            .with_settings(settings.clone());
        let snapshots = SnapshotFileGenerator::new(store, transformer)
            .with_change_log(Arc::clone(log))
            .with_settings(settings);
        (deltas, snapshots)
    }

    /// Spawn one publisher per configured source.
    async fn spawn_publishers(&self, store: &SqliteStore, log: &Arc<dyn ChangeLog>) {
        let (deltas, snapshots) = self.generators(store, log);
        let mut handles = self.handles.write().await;
        let mut publishers = self.publishers.write().await;

        for source in self.config.sources.all() {
            let status = Arc::new(PublisherStatus::default());
            let publisher = Publisher {
                source: source.clone(),
                deltas: deltas.clone(),
                snapshots: snapshots.clone(),
                versions: VersionRepository::new(store.pool().clone()),
                interval: self.config.nrtm4.interval(),
                bootstrap_snapshot: self.config.nrtm4.bootstrap_snapshot,
                status: Arc::clone(&status),
            };

            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(publisher.run(shutdown_rx)));
            publishers.push((source.clone(), status));
            info!(source = %source, "Spawned NRTM4 publisher");
        }
    }

    /// Publish the initial snapshot for a source and resume its publisher.
    ///
    /// Fails with [`NrtmError::SnapshotExists`] if the source already has a
    /// version chain.
    pub async fn publish_snapshot(&self, source: &Source) -> Result<PublishableSnapshotFile> {
        if !self.is_running() {
            return Err(NrtmError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }
        let store = self.store().await.ok_or(NrtmError::Shutdown)?;
        let log: Arc<dyn ChangeLog> = match &self.change_log {
            Some(log) => Arc::clone(log),
            None => Arc::new(store.clone()),
        };

        let (_, snapshots) = self.generators(&store, &log);
        let snapshot = snapshots.create_snapshot(source).await?;

        if let Some((_, status)) = self.publishers.read().await.iter().find(|(s, _)| s == source) {
            if status.is_halted() {
                info!(source = %source, "Resuming halted publisher");
            }
            status.resume();
        }
        Ok(snapshot)
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Reads the change log tail and the latest version of every source from
    /// the local store; no network I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = state == EngineState::Running;
        let store = self.store().await;
        let publishers = self.publishers.read().await.clone();

        let sources = join_all(self.config.sources.all().into_iter().map(|source| {
            let status = publishers
                .iter()
                .find(|(s, _)| *s == source)
                .map(|(_, status)| Arc::clone(status));
            let store = store.as_ref();

            async move {
                let (last_serial_id, nrtm4_version) = match store {
                    Some(store) => source_positions(store, self.change_log.as_ref(), &source).await,
                    None => (None, None),
                };

                SourceHealth {
                    source,
                    last_serial_id,
                    nrtm4_version,
                    publisher_halted: status.as_ref().is_some_and(|s| s.is_halted()),
                    consecutive_failures: status.as_ref().map_or(0, |s| s.consecutive_failures()),
                }
            }
        }))
        .await;

        let healthy = ready && sources.iter().all(|s| !s.publisher_halted);

        HealthCheck {
            state,
            ready,
            healthy,
            nrtm3_addr: self.nrtm3_addr().await,
            sources,
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the NRTM3 server, its sessions and all publishers to stop
    /// 2. Wait for tasks to finish (with timeout)
    /// 3. Checkpoint and close the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down NRTM engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(self.drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        *self.nrtm3_addr.write().await = None;

        // Includes WAL checkpoint
        if let Some(store) = self.store.write().await.take() {
            store.close().await;
        }

        self.set_state(EngineState::Stopped);
        info!("NRTM engine stopped");
    }
}

/// Change log tail and latest NRTM4 version; lookup failures read as unknown.
async fn source_positions(
    store: &SqliteStore,
    change_log: Option<&Arc<dyn ChangeLog>>,
    source: &Source,
) -> (Option<i64>, Option<i64>) {
    let tail = match change_log {
        Some(log) => log.latest_serial_id(source).await,
        None => store.latest_serial_id(source).await,
    };
    let last_serial_id = tail.unwrap_or_else(|e| {
        warn!(source = %source, error = %e, "Health check could not read change log");
        None
    });

    let version = VersionRepository::new(store.pool().clone())
        .find_last_version(source)
        .await
        .unwrap_or_else(|e| {
            warn!(source = %source, error = %e, "Health check could not read version chain");
            None
        });

    (last_serial_id, version.map(|v| v.version))
}
