use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::metrics::Metrics;
use crate::upstream::UpstreamForwarder;

#[derive(Debug, Clone)]
pub struct UpstreamTcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_message_size: usize,
    pub pool_max_conns: usize,
    pub pool_idle_timeout: Duration,
    /// Zero disables the in-flight cap.
    pub max_inflight: usize,
}

impl Default for UpstreamTcpConfig {
    fn default() -> Self {
        Self {
            host: "1.1.1.1".to_string(),
            port: 53,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            max_message_size: 65535,
            pool_max_conns: 4,
            pool_idle_timeout: Duration::from_secs(30),
            max_inflight: 0,
        }
    }
}

struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

/// TCP forwarder with a small connection pool. Connections are reused only
/// after a clean exchange; any error or idle expiry closes them.
pub struct TcpUpstreamForwarder {
    config: UpstreamTcpConfig,
    metrics: Arc<Metrics>,
    pool: Mutex<Vec<PooledConnection>>,
    inflight: Option<Arc<Semaphore>>,
    closed: Mutex<bool>,
}

impl TcpUpstreamForwarder {
    pub fn new(config: UpstreamTcpConfig, metrics: Arc<Metrics>) -> Self {
        let inflight = if config.max_inflight > 0 {
            Some(Arc::new(Semaphore::new(config.max_inflight)))
        } else {
            None
        };
        Self {
            config,
            metrics,
            pool: Mutex::new(Vec::new()),
            inflight,
            closed: Mutex::new(false),
        }
    }

    fn acquire_from_pool(&self) -> Option<TcpStream> {
        if self.config.pool_max_conns == 0 || *self.closed.lock() {
            return None;
        }
        let now = Instant::now();
        let mut pool = self.pool.lock();
        while let Some(conn) = pool.pop() {
            if self.config.pool_idle_timeout.is_zero()
                || now.duration_since(conn.last_used) > self.config.pool_idle_timeout
            {
                // Dropping the stream closes it.
                continue;
            }
            return Some(conn.stream);
        }
        None
    }

    fn release_to_pool(&self, stream: TcpStream) {
        if self.config.pool_max_conns == 0 || *self.closed.lock() {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() >= self.config.pool_max_conns {
            return;
        }
        pool.push(PooledConnection {
            stream,
            last_used: Instant::now(),
        });
    }

    async fn connect(&self) -> Option<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port);
        match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => {
                debug!("TCP upstream connect failed: {}", e);
                self.metrics.inc("upstream_tcp_errors_total");
                None
            }
            Err(_) => {
                debug!("TCP upstream connect timed out");
                self.metrics.inc("upstream_tcp_errors_total");
                None
            }
        }
    }

    /// Length-prefixed exchange on one connection. `Err` means the
    /// connection must not be reused.
    async fn exchange(&self, stream: &mut TcpStream, wire: &[u8]) -> Result<Option<Bytes>, ()> {
        let mut framed = Vec::with_capacity(wire.len() + 2);
        framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        framed.extend_from_slice(wire);
        stream.write_all(&framed).await.map_err(|_| ())?;

        let mut length_buf = [0u8; 2];
        timeout(self.config.read_timeout, stream.read_exact(&mut length_buf))
            .await
            .map_err(|_| ())?
            .map_err(|_| ())?;

        let message_length = u16::from_be_bytes(length_buf) as usize;
        if self.config.max_message_size > 0 && message_length > self.config.max_message_size {
            self.metrics.inc("dropped_total");
            return Err(());
        }

        let mut message = vec![0u8; message_length];
        timeout(self.config.read_timeout, stream.read_exact(&mut message))
            .await
            .map_err(|_| ())?
            .map_err(|_| ())?;

        Ok(Some(Bytes::from(message)))
    }
}

#[async_trait]
impl UpstreamForwarder for TcpUpstreamForwarder {
    async fn query(&self, wire: Bytes, _request_id: &str) -> Option<Bytes> {
        let _permit = match &self.inflight {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.metrics.inc("dropped_total");
                    return None;
                }
            },
            None => None,
        };

        self.metrics.inc("upstream_requests_total");

        let mut stream = match self.acquire_from_pool() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        match self.exchange(&mut stream, &wire).await {
            Ok(response) => {
                self.release_to_pool(stream);
                response
            }
            Err(()) => {
                self.metrics.inc("upstream_tcp_errors_total");
                None
            }
        }
    }

    async fn close(&self) {
        *self.closed.lock() = true;
        self.pool.lock().clear();
    }
}
