//! In-memory ChangeLog for testing.
//!
//! Keeps entries per source in a Vec, counts reads, and can be switched to
//! fail every call to exercise error paths.

use nrtm_engine::changelog::{BoxFuture, ChangeLog, Operation, SerialEntry, SerialId, SerialRange};
use nrtm_engine::{NrtmError, Source};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Mock implementation of ChangeLog backed by a map of vectors.
///
/// # Example
/// ```rust,ignore
/// let log = MemoryChangeLog::new();
/// log.push(&source, Operation::Add, "mntner", "A-MNT", Some("mntner: A-MNT")).await;
///
/// // Use in tests...
///
/// assert_eq!(log.read_count(), 1);
/// ```
#[derive(Default)]
pub struct MemoryChangeLog {
    entries: RwLock<HashMap<Source, Vec<SerialEntry>>>,
    fail_reads: AtomicBool,
    reads: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with the next serial for the source.
    pub async fn push(
        &self,
        source: &Source,
        operation: Operation,
        object_type: &str,
        primary_key: &str,
        payload: Option<&str>,
    ) -> SerialId {
        let mut entries = self.entries.write().await;
        let log = entries.entry(source.clone()).or_default();
        let serial_id = log.last().map_or(1, |e| e.serial_id + 1);
        log.push(SerialEntry {
            serial_id,
            operation,
            object_type: object_type.to_string(),
            primary_key: primary_key.to_string(),
            payload: payload.map(str::to_string),
            committed_at: chrono::Utc::now().timestamp_millis(),
        });
        serial_id
    }

    /// Append an entry with an explicit serial (gaps allowed).
    pub async fn push_at(&self, source: &Source, serial_id: SerialId, primary_key: &str) {
        let mut entries = self.entries.write().await;
        entries.entry(source.clone()).or_default().push(SerialEntry {
            serial_id,
            operation: Operation::Add,
            object_type: "mntner".to_string(),
            primary_key: primary_key.to_string(),
            payload: Some(format!("mntner: {}", primary_key)),
            committed_at: 0,
        });
    }

    /// Drop entries below `first` (simulates log trimming).
    pub async fn trim_before(&self, source: &Source, first: SerialId) {
        if let Some(log) = self.entries.write().await.get_mut(source) {
            log.retain(|e| e.serial_id >= first);
        }
    }

    /// Make every subsequent read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of read calls served (including failed ones).
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn begin_read(&self) -> nrtm_engine::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(NrtmError::Internal("simulated change log failure".to_string()));
        }
        Ok(())
    }
}

impl ChangeLog for MemoryChangeLog {
    fn entries_since(&self, source: &Source, after: SerialId) -> BoxFuture<'_, Vec<SerialEntry>> {
        let source = source.clone();
        Box::pin(async move {
            self.begin_read()?;
            let entries = self.entries.read().await;
            Ok(entries
                .get(&source)
                .map(|log| log.iter().filter(|e| e.serial_id > after).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn serial_range(&self, source: &Source) -> BoxFuture<'_, Option<SerialRange>> {
        let source = source.clone();
        Box::pin(async move {
            self.begin_read()?;
            let entries = self.entries.read().await;
            Ok(entries.get(&source).and_then(|log| {
                Some(SerialRange {
                    first: log.first()?.serial_id,
                    last: log.last()?.serial_id,
                })
            }))
        })
    }
}
