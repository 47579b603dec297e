use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Semaphore, broadcast, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dns::DNSPacket;
use crate::error::{BifrostError, Result};
use crate::handler::DnsHandler;
use crate::metrics::Metrics;

/// Listener-facing slice of the configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub max_udp_payload: usize,
    pub max_message_size: usize,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ListenerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.listen_host.clone(),
            port: config.listen_port,
            max_udp_payload: config.max_udp_payload,
            max_message_size: config.max_message_size,
            read_timeout: config.tcp_read_timeout,
            idle_timeout: config.tcp_idle_timeout,
        }
    }
}

/// Run the UDP listener. `ready_tx` reports the bound address once the
/// socket is live. The in-flight semaphore is shared with the TCP listener:
/// when no permit is available the datagram is dropped without invoking the
/// handler, so saturation stays distinct from upstream failure.
pub async fn run_udp_server(
    config: ListenerConfig,
    handler: Arc<DnsHandler>,
    metrics: Arc<Metrics>,
    query_semaphore: Arc<Semaphore>,
    mut shutdown_rx: broadcast::Receiver<()>,
    ready_tx: Option<oneshot::Sender<SocketAddr>>,
) -> Result<()> {
    let sock = Arc::new(UdpSocket::bind((config.host.as_str(), config.port)).await?);
    let local_addr = sock.local_addr()?;
    info!("UDP DNS server listening on {}", local_addr);
    if let Some(ready_tx) = ready_tx {
        let _ = ready_tx.send(local_addr);
    }

    let mut buf = vec![0u8; 65535];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("UDP server shutdown complete");
                break;
            }

            result = sock.recv_from(&mut buf) => {
                let (read_bytes, src_addr) = result?;

                let permit = match Arc::clone(&query_semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        metrics.inc("dropped_total");
                        warn!("Max in-flight queries reached, dropping datagram from {}", src_addr);
                        continue;
                    }
                };

                let query_data = buf[..read_bytes].to_vec();
                let handler = Arc::clone(&handler);
                let metrics = Arc::clone(&metrics);
                let sock = Arc::clone(&sock);
                let max_udp_payload = config.max_udp_payload;

                tokio::spawn(async move {
                    let _permit = permit;

                    let request = match DNSPacket::parse(&query_data) {
                        Ok(request) => request,
                        Err(e) => {
                            metrics.inc("malformed_total");
                            debug!("Malformed UDP packet from {}: {}", src_addr, e);
                            return;
                        }
                    };

                    let response = handler.handle(&request, src_addr).await;
                    let Some(response) = fit_udp_response(response, max_udp_payload, &metrics) else {
                        return;
                    };

                    if let Err(e) = sock.send_to(&response, src_addr).await {
                        warn!("Failed to send UDP response to {}: {}", src_addr, e);
                    }
                });
            }
        }
    }

    Ok(())
}

/// Truncate-or-drop policy for UDP responses: payloads within the limit go
/// out verbatim; oversized ones are re-packed with TC set and all record
/// sections cleared; anything still oversized is dropped.
fn fit_udp_response(
    response: Vec<u8>,
    max_udp_payload: usize,
    metrics: &Metrics,
) -> Option<Vec<u8>> {
    if response.len() <= max_udp_payload {
        return Some(response);
    }

    debug!(
        "Response too large for UDP ({}>{} bytes), truncating",
        response.len(),
        max_udp_payload
    );

    let truncated = DNSPacket::parse(&response)
        .map(|packet| packet.truncated())
        .and_then(|packet| packet.serialize());

    match truncated {
        Ok(wire) if wire.len() <= max_udp_payload => Some(wire),
        _ => {
            metrics.inc("dropped_total");
            None
        }
    }
}

/// Run the TCP listener: length-prefixed framing, per-message size cap,
/// sequential handling per connection so responses keep request order.
pub async fn run_tcp_server(
    config: ListenerConfig,
    handler: Arc<DnsHandler>,
    metrics: Arc<Metrics>,
    query_semaphore: Arc<Semaphore>,
    mut shutdown_rx: broadcast::Receiver<()>,
    ready_tx: Option<oneshot::Sender<SocketAddr>>,
) -> Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!("TCP DNS server listening on {}", local_addr);
    if let Some(ready_tx) = ready_tx {
        let _ = ready_tx.send(local_addr);
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TCP server shutdown complete");
                break;
            }

            result = listener.accept() => {
                let (stream, src_addr) = result?;
                let config = config.clone();
                let handler = Arc::clone(&handler);
                let metrics = Arc::clone(&metrics);
                let query_semaphore = Arc::clone(&query_semaphore);

                tokio::spawn(async move {
                    if let Err(e) = handle_tcp_connection(
                        stream,
                        src_addr,
                        &config,
                        handler,
                        metrics,
                        query_semaphore,
                    )
                    .await
                    {
                        debug!("TCP connection error from {}: {}", src_addr, e);
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_tcp_connection(
    mut stream: TcpStream,
    src_addr: SocketAddr,
    config: &ListenerConfig,
    handler: Arc<DnsHandler>,
    metrics: Arc<Metrics>,
    query_semaphore: Arc<Semaphore>,
) -> Result<()> {
    let mut length_buf = [0u8; 2];

    loop {
        // Waiting for the next message is bounded by the idle timeout.
        match timeout(config.idle_timeout, stream.read_exact(&mut length_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("TCP connection closed by client {}", src_addr);
                break;
            }
            Ok(Err(e)) => return Err(BifrostError::from(e)),
            Err(_) => {
                debug!("TCP connection from {} idle, closing", src_addr);
                break;
            }
        }

        let message_length = u16::from_be_bytes(length_buf) as usize;
        if config.max_message_size > 0 && message_length > config.max_message_size {
            metrics.inc("dropped_total");
            warn!(
                "TCP message from {} exceeds max size ({}>{}), closing",
                src_addr, message_length, config.max_message_size
            );
            break;
        }

        let mut message_buf = vec![0u8; message_length];
        match timeout(config.read_timeout, stream.read_exact(&mut message_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(BifrostError::from(e)),
            Err(_) => {
                debug!("TCP read from {} timed out, closing", src_addr);
                break;
            }
        }

        let _permit = match Arc::clone(&query_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics.inc("dropped_total");
                warn!("Max in-flight queries reached, dropping TCP message from {}", src_addr);
                continue;
            }
        };

        let request = match DNSPacket::parse(&message_buf) {
            Ok(request) => request,
            Err(e) => {
                metrics.inc("malformed_total");
                debug!("Malformed TCP message from {}: {}", src_addr, e);
                continue;
            }
        };

        let response = handler.handle(&request, src_addr).await;
        stream
            .write_all(&(response.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(&response).await?;
        stream.flush().await?;
    }

    Ok(())
}
