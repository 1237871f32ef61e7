// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the NRTM engine.
//!
//! Errors are categorized by where they originate (store, protocol parsing,
//! generation preconditions, sockets) and carry enough context to be logged
//! without extra wrapping.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | No | SQLite errors (needs operator attention) |
//! | `Query` | No | Malformed or rejected NRTM3 request |
//! | `NoSnapshot` | No | Delta requested before the initial snapshot |
//! | `SnapshotExists` | No | Snapshot requested on an existing version chain |
//! | `LockContended` | Yes | Another generator holds the source lock |
//! | `Serialization` | No | NRTM4 document could not be encoded |
//! | `Io` | Yes | Client socket failure |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Invariant violation |
//!
//! # Retry Behavior
//!
//! Use [`NrtmError::is_retryable()`] to decide whether a scheduled job should
//! simply try again on its next tick. `NoSnapshot` is deliberately not
//! retryable: it means the snapshot step was never run for the source.

use crate::nrtm3::QueryError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, NrtmError>;

/// Errors that can occur while serving or publishing NRTM data.
#[derive(Error, Debug)]
pub enum NrtmError {
    /// SQLite error in the change log, version chain or file store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// NRTM3 request rejected during parsing or execution.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// No snapshot exists yet for the source, so no delta can follow it.
    ///
    /// Not retryable - the initial snapshot has to be created first.
    #[error("Cannot create a delta for {source_name} without an initial snapshot")]
    NoSnapshot { source_name: String },

    /// A snapshot was requested but the source already has a version chain.
    #[error("Version chain for {source_name} already exists (version {version})")]
    SnapshotExists { source_name: String, version: i64 },

    /// The generation lock for a source is held by someone else.
    ///
    /// Retryable - the holder releases the lock when its commit finishes,
    /// or the lease expires.
    #[error("Lock {name} is held by another generator")]
    LockContended { name: String },

    /// NRTM4 document serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket error while talking to an NRTM3 client.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NrtmError {
    /// Create a `NoSnapshot` error for a source.
    pub fn no_snapshot(source: impl Into<String>) -> Self {
        Self::NoSnapshot {
            source_name: source.into(),
        }
    }

    /// Create a `LockContended` error for a lock name.
    pub fn lock_contended(name: impl Into<String>) -> Self {
        Self::LockContended { name: name.into() }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockContended { .. } => true,
            Self::Io(_) => true,
            Self::Store(_) => false, // Local DB issues need attention
            Self::Query(_) => false,
            Self::NoSnapshot { .. } => false,
            Self::SnapshotExists { .. } => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Query(_) => "query",
            Self::NoSnapshot { .. } => "no_snapshot",
            Self::SnapshotExists { .. } => "snapshot_exists",
            Self::LockContended { .. } => "lock_contended",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
