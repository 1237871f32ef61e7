//! Store seeding, generator settings and a minimal NRTM3 client.

use nrtm_engine::changelog::{ChangeLog, Operation};
use nrtm_engine::config::Nrtm3Config;
use nrtm_engine::nrtm4::GenerationSettings;
use nrtm_engine::resilience::RetryConfig;
use nrtm_engine::{Nrtm3Server, Source, SourceContext, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[allow(dead_code)]
pub fn ripe() -> Source {
    Source::new("RIPE")
}

/// Append `count` maintainer objects `MNT-1..=MNT-count`.
#[allow(dead_code)]
pub async fn seed_maintainers(store: &SqliteStore, source: &Source, count: usize) {
    for i in 1..=count {
        let key = format!("MNT-{}", i);
        store
            .append(source, Operation::Add, "mntner", &key, Some(&format!("mntner: {}\nsource: {}", key, source)))
            .await
            .expect("append failed");
    }
}

/// Short lock waits so contention shows up quickly.
#[allow(dead_code)]
pub fn fast_settings() -> GenerationSettings {
    GenerationSettings {
        lock_ttl: Duration::from_secs(60),
        lock_wait_timeout: Duration::from_millis(100),
        retry: RetryConfig::testing(),
    }
}

/// Running NRTM3 server bound to an ephemeral port.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<nrtm_engine::Result<()>>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start(log: Arc<dyn ChangeLog>, context: SourceContext) -> Self {
        Self::start_with(log, context, Nrtm3Config::default()).await
    }

    pub async fn start_with(
        log: Arc<dyn ChangeLog>,
        context: SourceContext,
        mut config: Nrtm3Config,
    ) -> Self {
        config.bind_addr = "127.0.0.1:0".to_string();
        config.keepalive_poll_interval = "20ms".to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Nrtm3Server::bind(&config, log, context, shutdown_rx)
            .await
            .expect("bind failed")
            .with_drain_timeout(Duration::from_secs(2));
        let addr = server.local_addr().expect("no local addr");
        let handle = tokio::spawn(server.run());
        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    /// Signal shutdown and wait for the accept loop to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed");
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Send one request and read the response until the server closes.
#[allow(dead_code)]
pub async fn request(addr: SocketAddr, line: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .expect("write failed");

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("response not finished")
        .expect("read failed");
    response
}

/// Line-oriented client for sessions that stay open.
#[allow(dead_code)]
pub struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

#[allow(dead_code)]
impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("write failed");
    }

    /// Read lines until one equals `until` (inclusive). Fails after 5s.
    pub async fn read_until(&mut self, until: &str) -> Vec<String> {
        let mut lines = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut line = String::new();
                let n = self.reader.read_line(&mut line).await.expect("read failed");
                assert!(n > 0, "connection closed before {:?}; got {:?}", until, lines);
                let line = line.trim_end_matches('\n').to_string();
                let done = line == until;
                lines.push(line);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for line");
        lines
    }

    /// Read whatever remains until the server closes.
    pub async fn read_to_end(&mut self) -> String {
        let mut rest = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_to_string(&mut rest))
            .await
            .expect("server did not close")
            .expect("read failed");
        rest
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
