// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NRTM3 TCP listener.
//!
//! One task per connection, bounded by a [`Bulkhead`]. Connections that
//! arrive while every slot is taken are closed immediately.
//!
//! # Graceful Shutdown
//!
//! When the shutdown signal flips:
//! 1. The accept loop stops.
//! 2. Each session observes the same signal; keepalive streams write `%END`.
//! 3. Sessions get `drain_timeout` to finish, then are aborted.

use super::session::{Session, SessionSettings};
use crate::changelog::ChangeLog;
use crate::config::Nrtm3Config;
use crate::error::{NrtmError, Result};
use crate::metrics;
use crate::resilience::Bulkhead;
use crate::source::SourceContext;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Time given to open sessions after shutdown is signalled.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Nrtm3Server {
    listener: TcpListener,
    log: Arc<dyn ChangeLog>,
    context: SourceContext,
    settings: SessionSettings,
    bulkhead: Arc<Bulkhead>,
    shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl Nrtm3Server {
    /// Bind the listener described by `config`.
    pub async fn bind(
        config: &Nrtm3Config,
        log: Arc<dyn ChangeLog>,
        context: SourceContext,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let addr: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|e| NrtmError::Config(format!("Invalid NRTM3 bind address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            log,
            context,
            settings: SessionSettings::from_config(config),
            bulkhead: Arc::new(Bulkhead::new(config.max_sessions.max(1))),
            shutdown,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown, then drain open sessions.
    pub async fn run(mut self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, max_sessions = self.bulkhead.max_concurrent(), "NRTM3 server listening");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let Some(permit) = self.bulkhead.try_acquire() else {
                        warn!(%peer, max_sessions = self.bulkhead.max_concurrent(), "Session limit reached, refusing connection");
                        metrics::record_session_rejected();
                        drop(stream);
                        continue;
                    };

                    let session = Session::new(
                        Arc::clone(&self.log),
                        self.context.clone(),
                        self.settings.clone(),
                        self.shutdown.clone(),
                    )
                    .with_peer(peer.to_string());
                    let bulkhead = Arc::clone(&self.bulkhead);

                    metrics::set_active_sessions(active(&bulkhead));
                    sessions.spawn(async move {
                        let result = session.run(stream).await;
                        drop(permit);
                        metrics::set_active_sessions(active(&bulkhead));
                        result
                    });
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task panicked");
                    }
                }
                _ = self.shutdown.changed() => {
                    info!("NRTM3 server shutting down");
                    break;
                }
            }
        }

        drop(self.listener);
        drain(&mut sessions, self.drain_timeout).await;
        info!("NRTM3 server stopped");
        Ok(())
    }
}

fn active(bulkhead: &Bulkhead) -> usize {
    bulkhead.max_concurrent() - bulkhead.available()
}

async fn drain(sessions: &mut JoinSet<Result<super::session::SessionEnd>>, timeout: Duration) {
    if sessions.is_empty() {
        return;
    }

    debug!(open = sessions.len(), "Draining NRTM3 sessions");
    let drained = tokio::time::timeout(timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(open = sessions.len(), "Sessions did not finish in time, aborting");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::Operation;
    use crate::source::Source;
    use crate::store::SqliteStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(max_sessions: usize) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<Result<()>>) {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .append(&Source::new("RIPE"), Operation::Add, "mntner", "A-MNT", Some("mntner: A-MNT"))
            .await
            .unwrap();

        let mut config = Nrtm3Config::default();
        config.bind_addr = "127.0.0.1:0".to_string();
        config.max_sessions = max_sessions;

        let (tx, rx) = watch::channel(false);
        let server = Nrtm3Server::bind(&config, Arc::new(store), SourceContext::new("RIPE"), rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        (addr, tx, tokio::spawn(server.run()))
    }

    #[tokio::test]
    async fn test_server_answers_info_query() {
        let (addr, tx, handle) = start(4).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"-q sources\n").await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "RIPE:3:X:1-1\n\n");

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_refuses_over_limit() {
        let (addr, tx, handle) = start(1).await;

        // Hold the only slot with a keepalive session
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"-k -g RIPE:3:1-LAST\n").await.unwrap();
        let mut buf = [0u8; 16];
        first.read_exact(&mut buf).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), second.read_to_end(&mut out)).await;
        assert!(read.is_ok(), "refused connection should be closed");
        assert!(out.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // Keepalive session ends with %END on shutdown
        let mut rest = String::new();
        first.read_to_string(&mut rest).await.unwrap();
        assert!(rest.ends_with("%END RIPE\n"));
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let mut config = Nrtm3Config::default();
        config.bind_addr = "not-an-address".to_string();
        let (_tx, rx) = watch::channel(false);
        let store = SqliteStore::in_memory().await.unwrap();

        let result = Nrtm3Server::bind(&config, Arc::new(store), SourceContext::new("RIPE"), rx).await;
        assert!(matches!(result, Err(NrtmError::Config(_))));
    }
}
