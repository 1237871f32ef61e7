// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM version 4: versioned snapshot and delta files.
//!
//! Each source has one chain per session: a snapshot at version 1, then one
//! delta per generation run that found publishable changes. Documents are
//! stored next to their version rows and listed by the
//! [`UpdateNotification`].

mod files;
mod generator;
mod lock;
mod model;
mod notification;
mod transformer;
mod version;

pub use files::{FileReference, PublishedFile, PublishedFileRepository};
pub use generator::{DeltaFileGenerator, GenerationSettings, SnapshotFileGenerator};
pub use lock::{acquire_with_wait, generation_lock_name, LockLease, LockManager, SqliteLockManager};
pub use model::{
    file_name, sha256_hex, DeltaChange, NrtmDocumentType, NrtmVersionInfo, PublishableDeltaFile,
    PublishableSnapshotFile, SnapshotObject, NRTM_VERSION,
};
pub use notification::{NotificationEntry, UpdateNotification};
pub use transformer::{DeltaTransformer, DEFAULT_EXCLUDED_OBJECT_TYPES};
pub use version::VersionRepository;
