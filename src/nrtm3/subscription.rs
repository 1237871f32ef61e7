// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cancellable subscription over the change log.
//!
//! A keepalive session hands its position to a [`Subscription`] once the
//! initial range has been streamed. The subscription polls the log for
//! entries past its cursor and yields them in batches, strictly in serial
//! order.
//!
//! # Cancel Safety
//!
//! [`Subscription::next_batch`] only advances the cursor in the same poll
//! that returns the batch, so dropping the future (e.g. losing a
//! `tokio::select!` race against client EOF) never loses or repeats an
//! entry.

use crate::changelog::{ChangeLog, SerialEntry, SerialId};
use crate::error::Result;
use crate::source::Source;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

pub struct Subscription {
    log: Arc<dyn ChangeLog>,
    source: Source,
    cursor: SerialId,
    poll_interval: Duration,
    batch_size: usize,
    cancel: watch::Receiver<bool>,
}

impl Subscription {
    /// Subscribe to entries of `source` with serial greater than `after`.
    ///
    /// The subscription ends when `cancel` becomes `true` or its sender is
    /// dropped.
    pub fn new(
        log: Arc<dyn ChangeLog>,
        source: Source,
        after: SerialId,
        poll_interval: Duration,
        batch_size: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            log,
            source,
            cursor: after,
            poll_interval,
            batch_size: batch_size.max(1),
            cancel,
        }
    }

    /// Highest serial handed out so far.
    pub fn cursor(&self) -> SerialId {
        self.cursor
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait for the next non-empty batch.
    ///
    /// Returns `Ok(None)` once cancelled. Log read errors are returned as-is
    /// and leave the cursor untouched.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<SerialEntry>>> {
        loop {
            if self.is_cancelled() {
                return Ok(None);
            }

            let batch = self
                .log
                .read_batch(&self.source, self.cursor, self.batch_size)
                .await?;

            if let Some(last) = batch.last() {
                trace!(
                    source = %self.source,
                    from = self.cursor + 1,
                    to = last.serial_id,
                    "Subscription batch"
                );
                self.cursor = last.serial_id;
                return Ok(Some(batch));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}
