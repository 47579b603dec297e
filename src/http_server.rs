use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::sync::{broadcast, oneshot};
use tracing::info;

use crate::cache::DnsCache;
use crate::error::Result;
use crate::metrics::Metrics;

struct AppState {
    metrics: Arc<Metrics>,
    cache: Arc<DnsCache>,
}

/// Metrics and health endpoints. `GET /metrics` renders one `name value`
/// line per counter, sorted by name, with cache occupancy gauges merged in.
pub struct HttpServer {
    metrics: Arc<Metrics>,
    cache: Arc<DnsCache>,
    host: String,
    port: u16,
}

impl HttpServer {
    pub fn new(metrics: Arc<Metrics>, cache: Arc<DnsCache>, host: String, port: u16) -> Self {
        Self {
            metrics,
            cache,
            host,
            port,
        }
    }

    pub async fn run(
        self,
        mut shutdown_rx: broadcast::Receiver<()>,
        ready_tx: Option<oneshot::Sender<SocketAddr>>,
    ) -> Result<()> {
        let state = Arc::new(AppState {
            metrics: self.metrics,
            cache: self.cache,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .fallback(not_found_handler)
            .with_state(state);

        let listener =
            tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("HTTP metrics server listening on {}", local_addr);
        if let Some(ready_tx) = ready_tx {
            let _ = ready_tx.send(local_addr);
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        info!("HTTP metrics server shutdown complete");
        Ok(())
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut counters = state.metrics.snapshot();

    let cache_stats = state.cache.stats_snapshot();
    counters.insert("cache_entries".to_string(), cache_stats.entries_total as u64);
    counters.insert(
        "cache_entries_fresh".to_string(),
        cache_stats.fresh_total as u64,
    );
    counters.insert(
        "cache_entries_expired".to_string(),
        cache_stats.expired_total as u64,
    );
    counters.insert(
        "cache_entries_stale_servable".to_string(),
        cache_stats.stale_servable_total as u64,
    );
    counters.insert(
        "cache_entries_negative".to_string(),
        cache_stats.negative_total as u64,
    );
    counters.insert("evictions_total".to_string(), cache_stats.evictions_total);

    let mut body = String::new();
    for (name, value) in counters {
        let _ = writeln!(body, "{} {}", name, value);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn healthz_handler() -> Response {
    (StatusCode::OK, "ok").into_response()
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}
