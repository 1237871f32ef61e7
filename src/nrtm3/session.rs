// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One NRTM3 client session.
//!
//! A session reads request lines, answers each one, and decides whether the
//! connection stays open:
//!
//! | Request outcome | Session |
//! |-----------------|---------|
//! | rejected (`ERROR:...`) | keeps reading requests |
//! | `-q SOURCES` / `-q VERSION` | closed after the response |
//! | `-g` | closed after `%END` |
//! | `-k -g` | stays open, pushing new entries until EOF or shutdown |
//!
//! Idle sessions (no request within `idle_timeout`) are closed.
//!
//! # Mirror Framing
//!
//! ```text
//! %START Version: 3 RIPE 10-12
//!
//! ADD 10
//!
//! <object text>
//!
//! DEL 11
//!
//! <object text>
//!
//! %END RIPE
//! ```
//!
//! UPDATE entries are sent as `ADD`, which mirrors apply as a replace.

use super::error::{ProtocolError, QueryError};
use super::query::{InfoOption, Query};
use super::subscription::Subscription;
use crate::changelog::{ChangeLog, SerialEntry, SerialId, SerialRange};
use crate::config::Nrtm3Config;
use crate::error::Result;
use crate::metrics;
use crate::source::{Source, SourceContext};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Header line written before any info query response.
pub const SERVER_VERSION_LINE: &str = "% nrtm-server-3";

/// Tunables for a session, usually taken from [`Nrtm3Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub keepalive_poll_interval: Duration,
    pub batch_size: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Nrtm3Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout_duration(),
            keepalive_poll_interval: config.keepalive_poll_duration(),
            batch_size: config.batch_size.max(1),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Nrtm3Config::default())
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Info or one-shot mirror response sent.
    Completed,
    /// Client closed its side.
    ClientClosed,
    /// No request within the idle timeout.
    IdleTimeout,
    /// Engine shutdown observed.
    Cancelled,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Completed => "completed",
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::IdleTimeout => "idle_timeout",
            SessionEnd::Cancelled => "cancelled",
        }
    }
}

/// What to do after answering a request.
enum Next {
    ReadAnother,
    End(SessionEnd),
}

pub struct Session {
    log: Arc<dyn ChangeLog>,
    context: SourceContext,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
    peer: String,
}

impl Session {
    pub fn new(
        log: Arc<dyn ChangeLog>,
        context: SourceContext,
        settings: SessionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            log,
            context,
            settings,
            shutdown,
            peer: "unknown".to_string(),
        }
    }

    /// Label used in logs (usually the client address).
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Serve requests on `stream` until the session ends.
    ///
    /// Socket and change log failures end the session with an error; the
    /// client is expected to reconnect and resume from its last serial.
    pub async fn run<S>(self, stream: S) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let span = tracing::info_span!("nrtm3_session", peer = %self.peer);
        self.run_inner(stream).instrument(span).await
    }

    async fn run_inner<S>(mut self, stream: S) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let started = Instant::now();
        let (reader, writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut writer = BufWriter::new(writer);

        debug!("Session opened");

        let result = loop {
            let line = tokio::select! {
                read = tokio::time::timeout(self.settings.idle_timeout, lines.next_line()) => {
                    match read {
                        Err(_) => {
                            debug!(idle_timeout = ?self.settings.idle_timeout, "Session idle, closing");
                            break Ok(SessionEnd::IdleTimeout);
                        }
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) => break Ok(SessionEnd::ClientClosed),
                        Ok(Err(e)) => break Err(e.into()),
                    }
                }
                _ = self.shutdown.changed() => break Ok(SessionEnd::Cancelled),
            };

            match self.handle_request(&line, &mut lines, &mut writer).await {
                Ok(Next::ReadAnother) => continue,
                Ok(Next::End(end)) => break Ok(end),
                Err(e) => break Err(e),
            }
        };

        let _ = writer.shutdown().await;

        match &result {
            Ok(end) => {
                debug!(reason = end.as_str(), "Session closed");
                metrics::record_session_closed(end.as_str(), started.elapsed());
            }
            Err(e) => {
                warn!(error = %e, "Session terminated");
                metrics::record_session_closed("error", started.elapsed());
            }
        }

        result
    }

    async fn handle_request<R, W>(
        &mut self,
        line: &str,
        lines: &mut tokio::io::Lines<R>,
        writer: &mut W,
    ) -> Result<Next>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let query = match Query::parse(&self.context, line) {
            Ok(query) => query,
            Err(e) => {
                debug!(request = line, error = %e, "Rejected request");
                metrics::record_query("invalid", "error");
                write_error(writer, &e).await?;
                return Ok(Next::ReadAnother);
            }
        };

        debug!(request = line, kind = query.kind(), source = %query.source, "Request accepted");

        match query.info_option {
            Some(InfoOption::Sources) => {
                self.write_sources(writer).await?;
                metrics::record_query("sources", "ok");
                Ok(Next::End(SessionEnd::Completed))
            }
            Some(InfoOption::Version) => {
                self.write_version(writer).await?;
                metrics::record_query("version", "ok");
                Ok(Next::End(SessionEnd::Completed))
            }
            None => self.mirror(&query, lines, writer).await,
        }
    }

    async fn write_sources<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut out = String::new();
        for source in self.context.servable() {
            let (first, last) = range_or_zero(self.log.serial_range(source).await?);
            out.push_str(&format!("{}:3:X:{}-{}\n", source, first, last));
        }
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn write_version<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut out = format!("{}\n", SERVER_VERSION_LINE);
        for source in self.context.servable() {
            let (first, last) = range_or_zero(self.log.serial_range(source).await?);
            out.push_str(&format!("% {} serials {}-{}\n", source, first, last));
            if let Some(version) = self.log.latest_version(source).await? {
                out.push_str(&format!(
                    "% {} nrtm4 version {} session {} last-serial {}\n",
                    source, version.version, version.session_id, version.last_serial_id
                ));
            }
        }
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn mirror<R, W>(
        &mut self,
        query: &Query,
        lines: &mut tokio::io::Lines<R>,
        writer: &mut W,
    ) -> Result<Next>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let source = &query.source;
        let available = self.log.serial_range(source).await?;

        let end = match check_range(query, available) {
            Ok(end) => end,
            Err(e) => {
                debug!(source = %source, error = %e, "Mirror range rejected");
                metrics::record_query("mirror", "error");
                write_error(writer, &QueryError::from(e)).await?;
                return Ok(Next::ReadAnother);
            }
        };

        info!(
            source = %source,
            begin = query.serial_begin,
            end,
            keepalive = query.keepalive,
            "Mirror stream started"
        );
        metrics::record_query("mirror", "ok");

        writer
            .write_all(format!("%START Version: 3 {} {}-{}\n\n", source, query.serial_begin, end).as_bytes())
            .await?;

        let streamed = self
            .stream_range(source, query.serial_begin - 1, end, writer)
            .await?;
        writer.flush().await?;
        metrics::record_entries_streamed(source.as_str(), streamed);

        if !query.keepalive {
            write_end(writer, source).await?;
            return Ok(Next::End(SessionEnd::Completed));
        }

        self.keepalive(source, end, lines, writer).await.map(Next::End)
    }

    /// Stream entries in `(after, end]`, paging through the log.
    async fn stream_range<W: AsyncWrite + Unpin>(
        &self,
        source: &Source,
        after: SerialId,
        end: SerialId,
        writer: &mut W,
    ) -> Result<usize> {
        let mut cursor = after;
        let mut streamed = 0;

        while cursor < end {
            let batch = self
                .log
                .read_batch(source, cursor, self.settings.batch_size)
                .await?;
            let full = batch.len() >= self.settings.batch_size;

            for entry in batch.iter().take_while(|e| e.serial_id <= end) {
                write_entry(writer, entry).await?;
                cursor = entry.serial_id;
                streamed += 1;
            }

            if !full || batch.last().map_or(true, |e| e.serial_id > end) {
                break;
            }
        }

        Ok(streamed)
    }

    async fn keepalive<R, W>(
        &mut self,
        source: &Source,
        after: SerialId,
        lines: &mut tokio::io::Lines<R>,
        writer: &mut W,
    ) -> Result<SessionEnd>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut subscription = Subscription::new(
            Arc::clone(&self.log),
            source.clone(),
            after,
            self.settings.keepalive_poll_interval,
            self.settings.batch_size,
            self.shutdown.clone(),
        );

        debug!(source = %source, after, "Keepalive subscription started");

        loop {
            tokio::select! {
                batch = subscription.next_batch() => {
                    match batch? {
                        Some(entries) => {
                            for entry in &entries {
                                write_entry(writer, entry).await?;
                            }
                            writer.flush().await?;
                            metrics::record_entries_streamed(source.as_str(), entries.len());
                        }
                        None => {
                            write_end(writer, source).await?;
                            info!(source = %source, cursor = subscription.cursor(), "Keepalive cancelled");
                            return Ok(SessionEnd::Cancelled);
                        }
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(_)) => {
                            // Requests are not accepted on a keepalive stream
                        }
                        Ok(None) | Err(_) => {
                            info!(source = %source, cursor = subscription.cursor(), "Keepalive client disconnected");
                            return Ok(SessionEnd::ClientClosed);
                        }
                    }
                }
            }
        }
    }
}

/// Validate a mirror range against the serials currently available and
/// return the concrete end serial.
fn check_range(
    query: &Query,
    available: Option<SerialRange>,
) -> std::result::Result<SerialId, ProtocolError> {
    let Some(range) = available else {
        return Err(ProtocolError::InvalidRange { first: 0, last: 0 });
    };
    let end = query.serial_end.resolve(range.last);
    if !range.contains(query.serial_begin) || end > range.last {
        return Err(ProtocolError::InvalidRange {
            first: range.first,
            last: range.last,
        });
    }
    Ok(end)
}

fn range_or_zero(range: Option<SerialRange>) -> (SerialId, SerialId) {
    range.map_or((0, 0), |r| (r.first, r.last))
}

async fn write_error<W: AsyncWrite + Unpin>(writer: &mut W, err: &QueryError) -> Result<()> {
    metrics::record_protocol_error(err.code().as_u16());
    writer
        .write_all(format!("{}\n\n", err.wire_response()).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

async fn write_entry<W: AsyncWrite + Unpin>(writer: &mut W, entry: &SerialEntry) -> Result<()> {
    let verb = if entry.operation.is_delete() { "DEL" } else { "ADD" };
    let mut frame = format!("{} {}\n\n", verb, entry.serial_id);
    if let Some(payload) = entry.payload.as_deref() {
        frame.push_str(payload.trim_end_matches('\n'));
        frame.push_str("\n\n");
    }
    writer.write_all(frame.as_bytes()).await?;
    Ok(())
}

async fn write_end<W: AsyncWrite + Unpin>(writer: &mut W, source: &Source) -> Result<()> {
    writer
        .write_all(format!("%END {}\n", source).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}
