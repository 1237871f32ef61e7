//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (store open, listener bound)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(store or bind failure)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `NrtmEngine::new()`. Nothing opened.
//! - **Starting**: `start()` called, opening the store and binding the listener.
//! - **Running**: NRTM3 sessions accepted, NRTM4 publishers ticking.
//! - **ShuttingDown**: `shutdown()` called. Sessions and publishers draining.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Startup failed. Check logs; the engine cannot be restarted.

use crate::changelog::SerialId;
use crate::source::Source;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

/// State of the NRTM engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::NrtmEngine::start) to begin serving.
    Created,

    /// Opening the store and binding the NRTM3 listener.
    Starting,

    /// Serving NRTM3 clients and publishing NRTM4 files.
    Running,

    /// Shutting down gracefully.
    ///
    /// Keepalive sessions are sent `%END`, publishers finish their current run.
    ShuttingDown,

    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start.
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "Created",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::ShuttingDown => "ShuttingDown",
            EngineState::Stopped => "Stopped",
            EngineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source publisher bookkeeping, shared between the publisher task and
/// health checks.
#[derive(Debug, Default)]
pub struct PublisherStatus {
    halted: AtomicBool,
    consecutive_failures: AtomicU32,
    /// 0 until something was published by this process
    last_published_version: AtomicI64,
}

impl PublisherStatus {
    /// Stop generating until [`resume`](Self::resume) is called.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn record_success(&self, published_version: Option<i64>) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Some(version) = published_version {
            self.last_published_version.store(version, Ordering::Relaxed);
        }
    }

    /// Returns the new consecutive failure count.
    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_published_version(&self) -> Option<i64> {
        match self.last_published_version.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }
}

/// Health of one configured source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHealth {
    pub source: Source,
    /// Tail of the change log
    pub last_serial_id: Option<SerialId>,
    /// Latest NRTM4 version in the store
    pub nrtm4_version: Option<i64>,
    /// Publisher stopped generating (no snapshot yet)
    pub publisher_halted: bool,
    pub consecutive_failures: u32,
}

/// Snapshot of engine health for monitoring endpoints.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Engine is running and accepting sessions
    pub ready: bool,
    /// Ready, and no publisher is halted
    pub healthy: bool,
    /// Bound NRTM3 address, if the server is enabled
    pub nrtm3_addr: Option<SocketAddr>,
    pub sources: Vec<SourceHealth>,
}
