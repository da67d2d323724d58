//! Run counters and the `/metrics` endpoint
//!
//! `PipelineMetrics` is a set of atomic counters shared between the
//! pipeline and the HTTP server. The server answers `GET /metrics` with a
//! JSON snapshot and everything else with `404 not found`.

use crate::diff::DiffStats;
use bytes::BytesMut;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// TigerStyle: Explicit limits with _MAX suffix
const REQUEST_HEAD_MAX: usize = 8 * 1024;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pages: AtomicU64,
    objects_listed: AtomicU64,
    skipped_non_car: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    entries_emitted: AtomicU64,
    shards_written: AtomicU64,
    manifest_bytes: AtomicU64,
    keys_checked: AtomicU64,
    keys_missing: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pages: u64,
    pub objects_listed: u64,
    pub skipped_non_car: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub entries_emitted: u64,
    pub shards_written: u64,
    pub manifest_bytes: u64,
    pub keys_checked: u64,
    pub keys_missing: u64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mirror the diff stream's running totals
    pub fn observe_diff(&self, stats: &DiffStats) {
        self.pages.store(stats.pages, Ordering::Relaxed);
        self.objects_listed.store(stats.objects_seen, Ordering::Relaxed);
        self.skipped_non_car
            .store(stats.skipped_non_car, Ordering::Relaxed);
        self.rejected.store(stats.rejected, Ordering::Relaxed);
        self.duplicates.store(stats.duplicates, Ordering::Relaxed);
        self.entries_emitted.store(stats.emitted, Ordering::Relaxed);
    }

    pub fn record_shard(&self) {
        self.shards_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest(&self, bytes: u64) {
        self.manifest_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn record_check(&self, missing: bool) {
        self.keys_checked.fetch_add(1, Ordering::Relaxed);
        if missing {
            self.keys_missing.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages: self.pages.load(Ordering::Relaxed),
            objects_listed: self.objects_listed.load(Ordering::Relaxed),
            skipped_non_car: self.skipped_non_car.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            entries_emitted: self.entries_emitted.load(Ordering::Relaxed),
            shards_written: self.shards_written.load(Ordering::Relaxed),
            manifest_bytes: self.manifest_bytes.load(Ordering::Relaxed),
            keys_checked: self.keys_checked.load(Ordering::Relaxed),
            keys_missing: self.keys_missing.load(Ordering::Relaxed),
        }
    }
}

/// Minimal HTTP server for `/metrics`
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Arc<PipelineMetrics>,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr, metrics: Arc<PipelineMetrics>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(MetricsServer { listener, metrics })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the returned task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Ok(addr) = self.listener.local_addr() {
                info!("Metrics server listening on {}", addr);
            }
            loop {
                match self.listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let metrics = Arc::clone(&self.metrics);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, metrics).await {
                                debug!("Metrics connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        })
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    metrics: Arc<PipelineMetrics>,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(1024);
    let mut read_buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&read_buf[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= REQUEST_HEAD_MAX {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buffer);
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();

    let (status, content_type, body) = if method == "GET" && path == "/metrics" {
        let body = serde_json::to_string(&metrics.snapshot())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        ("200 OK", "application/json", body)
    } else {
        ("404 Not Found", "text/plain", "not found".to_string())
    };

    let response = format!(
        "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
