// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM version 3: line-oriented streaming mirror protocol.
//!
//! ```text
//! Client                          Server
//!   │  -k -g RIPE:3:100-LAST        │
//!   │ ─────────────────────────────▶│  Query::parse
//!   │  %START Version: 3 RIPE ...   │
//!   │ ◀─────────────────────────────│  stream [100, tail]
//!   │  ADD 101 / DEL 102 ...        │
//!   │ ◀─────────────────────────────│  Subscription (keepalive)
//!   │  %END RIPE                    │
//!   │ ◀─────────────────────────────│  on shutdown
//! ```

mod error;
mod query;
pub mod server;
pub mod session;
mod subscription;

pub use error::{LegacyCode, ProtocolError, QueryError};
pub use query::{
    InfoOption, Query, QueryMode, SerialEnd, LAST_SERIAL_SENTINEL, SUPPORTED_PROTOCOL_VERSION,
};
pub use server::Nrtm3Server;
pub use session::{Session, SessionEnd, SessionSettings};
pub use subscription::Subscription;
