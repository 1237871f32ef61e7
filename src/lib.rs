// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # NRTM Engine
//!
//! Near-real-time mirroring for a routing registry: streams committed changes
//! to NRTM3 mirror clients and publishes NRTM4 snapshot/delta files.
//!
//! ## Architecture
//!
//! Both protocols read the same serial change log but never share mutable
//! state:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               nrtm-engine                                 │
//! │                                                                           │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────────────────────┐  │
//! │  │ Nrtm3Server  │───►│ Session      │───►│ Query::parse + stream range │  │
//! │  │ (TCP accept) │    │ (per client) │    │ (+ keepalive Subscription)  │  │
//! │  └──────────────┘    └──────────────┘    └─────────────────────────────┘  │
//! │                              │                                            │
//! │                              ▼                                            │
//! │                    ┌────────────────────┐                                 │
//! │                    │ ChangeLog (SQLite) │                                 │
//! │                    └────────────────────┘                                 │
//! │                              ▲                                            │
//! │                              │                                            │
//! │  ┌──────────────┐    ┌───────────────────┐    ┌────────────────────────┐  │
//! │  │ Publisher    │───►│ DeltaFileGenerator│───►│ version_info +         │  │
//! │  │ (per source) │    │ (under lease lock)│    │ published_file (1 tx)  │  │
//! │  └──────────────┘    └───────────────────┘    └────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nrtm_engine::{NrtmConfig, NrtmEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = NrtmConfig::for_testing("RIPE");
//!
//!     let mut engine = NrtmEngine::new(config);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod changelog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod nrtm3;
pub mod nrtm4;
pub mod resilience;
pub mod source;
pub mod store;

// Re-exports for convenience
pub use changelog::{
    ChangeLog, Operation, SerialEntry, SerialId, SerialRange, BEFORE_FIRST_SERIAL,
};
pub use config::{LockConfig, Nrtm3Config, Nrtm4Config, NrtmConfig, SourceConfig, StoreConfig};
pub use coordinator::{EngineState, HealthCheck, NrtmEngine, SourceHealth};
pub use error::{NrtmError, Result};
pub use nrtm3::{Nrtm3Server, Query, QueryError};
pub use nrtm4::{
    DeltaFileGenerator, DeltaTransformer, PublishableDeltaFile, PublishableSnapshotFile,
    SnapshotFileGenerator, UpdateNotification,
};
pub use source::{Source, SourceContext};
pub use store::SqliteStore;
