//! Configuration for the NRTM engine.
//!
//! Configuration is passed to [`NrtmEngine::new()`](crate::NrtmEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//! Loading it from property files is the embedding daemon's job.
//!
//! # Quick Start
//!
//! ```rust
//! use nrtm_engine::config::NrtmConfig;
//!
//! let mut config = NrtmConfig::for_testing("TEST");
//! config.nrtm3.bind_addr = "127.0.0.1:4444".into();
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! NrtmConfig
//! ├── sources: SourceConfig      # Authoritative + optional non-auth source
//! ├── store: StoreConfig         # SQLite database shared by both protocols
//! ├── nrtm3: Nrtm3Config         # Streaming mirror server
//! └── nrtm4: Nrtm4Config         # Snapshot/delta publication
//!     └── lock: LockConfig       # Per-source generation lock
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! sources:
//!   name: "RIPE"
//!   non_auth_name: "RIPE-NONAUTH"
//!
//! store:
//!   sqlite_path: "/var/lib/nrtm/nrtm.db"
//!
//! nrtm3:
//!   bind_addr: "0.0.0.0:4444"
//!   idle_timeout: "30s"
//!
//! nrtm4:
//!   interval_sec: 60
//!   excluded_object_types: ["person", "role"]
//! ```

use crate::source::{Source, SourceContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `NrtmEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NrtmConfig {
    /// Sources served and published by this engine.
    #[serde(default)]
    pub sources: SourceConfig,

    /// SQLite store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// NRTM3 streaming server settings.
    #[serde(default)]
    pub nrtm3: Nrtm3Config,

    /// NRTM4 publication settings.
    #[serde(default)]
    pub nrtm4: Nrtm4Config,
}

impl NrtmConfig {
    /// Create a minimal config for testing: in-memory store, ephemeral port,
    /// short poll intervals.
    pub fn for_testing(source: &str) -> Self {
        Self {
            sources: SourceConfig {
                name: source.to_string(),
                non_auth_name: None,
            },
            store: StoreConfig::in_memory(),
            nrtm3: Nrtm3Config {
                bind_addr: "127.0.0.1:0".to_string(),
                keepalive_poll_interval: "50ms".to_string(),
                ..Default::default()
            },
            nrtm4: Nrtm4Config {
                interval_sec: 1,
                ..Default::default()
            },
        }
    }

    /// Check the config for values the engine cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.sources.name.trim().is_empty() {
            return Err(crate::error::NrtmError::Config(
                "sources.name must not be empty".to_string(),
            ));
        }
        if let Some(non_auth) = &self.sources.non_auth_name {
            if non_auth.eq_ignore_ascii_case(&self.sources.name) {
                return Err(crate::error::NrtmError::Config(
                    "sources.non_auth_name must differ from sources.name".to_string(),
                ));
            }
        }
        if self.nrtm3.max_sessions == 0 {
            return Err(crate::error::NrtmError::Config(
                "nrtm3.max_sessions must be at least 1".to_string(),
            ));
        }
        if self.nrtm3.batch_size == 0 {
            return Err(crate::error::NrtmError::Config(
                "nrtm3.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry sources handled by this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Authoritative source name (e.g. "RIPE").
    pub name: String,

    /// Non-authoritative counterpart (e.g. "RIPE-NONAUTH").
    #[serde(default)]
    pub non_auth_name: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "TEST".to_string(),
            non_auth_name: None,
        }
    }
}

impl SourceConfig {
    /// Source context handed to NRTM3 sessions.
    pub fn context(&self) -> SourceContext {
        let ctx = SourceContext::new(self.name.as_str());
        match &self.non_auth_name {
            Some(non_auth) => ctx.with_non_authoritative(non_auth.as_str()),
            None => ctx,
        }
    }

    /// Every configured source, authoritative first.
    pub fn all(&self) -> Vec<Source> {
        self.context().servable().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "nrtm.db".to_string(),
            wal_mode: true,
            max_connections: 8,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    ///
    /// An in-memory SQLite database lives inside a single connection, so the
    /// pool is pinned to one connection.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    /// Store config for a database file at `path`.
    pub fn at_path(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Nrtm3Config: streaming server
// ═══════════════════════════════════════════════════════════════════════════════

/// NRTM3 server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nrtm3Config {
    /// Whether the streaming server is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum concurrent client sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Close a session that sends no request for this long (e.g. "30s").
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    /// How often keepalive sessions look for new serials (e.g. "1s").
    #[serde(default = "default_keepalive_poll_interval")]
    pub keepalive_poll_interval: String,

    /// Entries read from the change log per page while streaming.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_bind_addr() -> String {
    "0.0.0.0:4444".to_string()
}

fn default_max_sessions() -> usize {
    64
}

fn default_idle_timeout() -> String {
    "30s".to_string()
}

fn default_keepalive_poll_interval() -> String {
    "1s".to_string()
}

fn default_batch_size() -> usize {
    500
}

impl Default for Nrtm3Config {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
            max_sessions: 64,
            idle_timeout: "30s".to_string(),
            keepalive_poll_interval: "1s".to_string(),
            batch_size: 500,
        }
    }
}

impl Nrtm3Config {
    /// Parse the idle_timeout string to a Duration.
    pub fn idle_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the keepalive_poll_interval string to a Duration.
    pub fn keepalive_poll_duration(&self) -> Duration {
        humantime::parse_duration(&self.keepalive_poll_interval).unwrap_or(Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Nrtm4Config: publication
// ═══════════════════════════════════════════════════════════════════════════════

/// NRTM4 publication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nrtm4Config {
    /// Whether the periodic delta publisher runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to generate deltas (in seconds).
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,

    /// Object types never published (matched case-insensitively).
    #[serde(default = "default_excluded_object_types")]
    pub excluded_object_types: Vec<String>,

    /// Create the initial snapshot automatically when a source has none.
    ///
    /// Off by default: a missing snapshot is an operator concern.
    #[serde(default = "default_false")]
    pub bootstrap_snapshot: bool,

    /// Generation lock settings.
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_interval_sec() -> u64 {
    60
}

fn default_excluded_object_types() -> Vec<String> {
    vec!["person".to_string(), "role".to_string()]
}

impl Default for Nrtm4Config {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            excluded_object_types: default_excluded_object_types(),
            bootstrap_snapshot: false,
            lock: LockConfig::default(),
        }
    }
}

impl Nrtm4Config {
    /// Get the interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec.max(1))
    }
}

/// Per-source generation lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease length in seconds. A crashed holder's lock is taken over after this.
    #[serde(default = "default_lock_ttl_sec")]
    pub ttl_sec: u64,

    /// How long a generator waits for a held lock before giving up (e.g. "30s").
    #[serde(default = "default_lock_wait_timeout")]
    pub wait_timeout: String,
}

fn default_lock_ttl_sec() -> u64 {
    300 // 5 minutes
}

fn default_lock_wait_timeout() -> String {
    "30s".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 300,
            wait_timeout: "30s".to_string(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_sec)
    }

    /// Parse the wait_timeout string to a Duration.
    pub fn wait_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.wait_timeout).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
