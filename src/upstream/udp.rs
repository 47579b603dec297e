use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::metrics::Metrics;
use crate::upstream::UpstreamForwarder;

#[derive(Debug, Clone)]
pub struct UpstreamUdpConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    /// Cap on concurrent blocking socket operations.
    pub max_workers: usize,
}

impl Default for UpstreamUdpConfig {
    fn default() -> Self {
        Self {
            host: "1.1.1.1".to_string(),
            port: 53,
            timeout: Duration::from_secs(2),
            max_workers: 32,
        }
    }
}

/// Classic UDP forwarder. Each query runs a blocking socket exchange on the
/// blocking pool, bounded by a worker semaphore.
pub struct UdpUpstreamForwarder {
    config: UpstreamUdpConfig,
    metrics: Arc<Metrics>,
    workers: Arc<Semaphore>,
}

impl UdpUpstreamForwarder {
    pub fn new(config: UpstreamUdpConfig, metrics: Arc<Metrics>) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            metrics,
            workers,
        }
    }

    fn query_blocking(
        config: &UpstreamUdpConfig,
        metrics: &Metrics,
        wire: &[u8],
    ) -> Option<Bytes> {
        let exchange = || -> std::io::Result<Bytes> {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_read_timeout(Some(config.timeout))?;
            socket.send_to(wire, (config.host.as_str(), config.port))?;
            let mut buf = vec![0u8; 4096];
            let (read, _) = socket.recv_from(&mut buf)?;
            buf.truncate(read);
            Ok(Bytes::from(buf))
        };
        match exchange() {
            Ok(data) => Some(data),
            Err(e) => {
                debug!("UDP upstream exchange failed: {}", e);
                metrics.inc("upstream_udp_errors_total");
                None
            }
        }
    }
}

#[async_trait]
impl UpstreamForwarder for UdpUpstreamForwarder {
    async fn query(&self, wire: Bytes, _request_id: &str) -> Option<Bytes> {
        self.metrics.inc("upstream_requests_total");

        let Ok(_permit) = Arc::clone(&self.workers).acquire_owned().await else {
            return None;
        };

        let config = self.config.clone();
        let metrics = Arc::clone(&self.metrics);
        tokio::task::spawn_blocking(move || Self::query_blocking(&config, &metrics, &wire))
            .await
            .ok()
            .flatten()
    }
}
