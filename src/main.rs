use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{Semaphore, broadcast, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bifrost::cache::{CacheTuning, DnsCache};
use bifrost::config::{Cli, Config, UpstreamTransport, build_config};
use bifrost::error::Result;
use bifrost::handler::{DnsHandler, HandlerConfig};
use bifrost::http_server::HttpServer;
use bifrost::metrics::{Metrics, format_stats, periodic_stats_reporter};
use bifrost::refresh::{RefreshConfig, RefreshEngine};
use bifrost::resolver::UpstreamResolver;
use bifrost::server::{ListenerConfig, run_tcp_server, run_udp_server};
use bifrost::upstream::{
    RelayUpstreamForwarder, TcpUpstreamForwarder, UdpUpstreamForwarder, UpstreamForwarder,
    UpstreamTcpConfig, UpstreamUdpConfig, relay::run_relay_startup_check,
};
use bifrost::warmup::enqueue_warmup_file;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "bifrost=debug" } else { "bifrost=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_upstream(config: &Config, metrics: &Arc<Metrics>) -> Result<Arc<dyn UpstreamForwarder>> {
    let upstream: Arc<dyn UpstreamForwarder> = match config.upstream_transport {
        UpstreamTransport::Udp => Arc::new(UdpUpstreamForwarder::new(
            UpstreamUdpConfig {
                host: config.upstream_host.clone(),
                port: config.upstream_port,
                timeout: config.upstream_timeout,
                max_workers: config.udp_max_workers,
            },
            Arc::clone(metrics),
        )),
        UpstreamTransport::Tcp => Arc::new(TcpUpstreamForwarder::new(
            UpstreamTcpConfig {
                host: config.upstream_host.clone(),
                port: config.upstream_port,
                connect_timeout: config.upstream_timeout,
                read_timeout: config.upstream_timeout,
                max_message_size: config.max_message_size,
                pool_max_conns: config.tcp_pool_max_conns,
                pool_idle_timeout: config.tcp_pool_idle_timeout,
                max_inflight: 0,
            },
            Arc::clone(metrics),
        )),
        UpstreamTransport::Relay => {
            let relay = config
                .relay
                .clone()
                .expect("validated: relay config present for relay transport");
            Arc::new(RelayUpstreamForwarder::new(
                relay,
                Arc::clone(metrics),
                config.upstream_timeout,
            )?)
        }
    };
    Ok(upstream)
}

async fn run(config: Config) -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(DnsCache::new(
        CacheTuning {
            serve_stale_max: config.serve_stale_max,
            negative_ttl: config.negative_ttl,
            max_entries: config.cache_max_entries,
        },
        Arc::clone(&metrics),
    ));
    let upstream = build_upstream(&config, &metrics)?;
    let resolver = Arc::new(UpstreamResolver::new(
        Arc::clone(&upstream),
        Arc::clone(&cache),
        Arc::clone(&metrics),
    ));
    let refresh = Arc::new(RefreshEngine::new(
        Arc::clone(&cache),
        Arc::clone(&resolver),
        Arc::clone(&metrics),
        RefreshConfig {
            enabled: config.refresh_enabled,
            ahead: config.refresh_ahead,
            popularity_threshold: config.refresh_popularity_threshold,
            popularity_decay: config.refresh_popularity_decay,
            tick: config.refresh_tick,
            batch_size: config.refresh_batch_size,
            concurrency: config.refresh_concurrency,
            queue_max: config.refresh_queue_max,
        },
    ));
    let handler = Arc::new(DnsHandler::new(
        Arc::clone(&cache),
        Arc::clone(&resolver),
        Arc::clone(&refresh),
        Arc::clone(&metrics),
        HandlerConfig {
            upstream_timeout: config.upstream_timeout,
            refresh_watch_timeout: Duration::from_secs(5),
        },
    ));

    let query_semaphore = Arc::new(Semaphore::new(config.max_inflight));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let listener_config = ListenerConfig::from_config(&config);

    let (udp_ready_tx, udp_ready_rx) = oneshot::channel();
    let udp_task = tokio::spawn(run_udp_server(
        listener_config.clone(),
        Arc::clone(&handler),
        Arc::clone(&metrics),
        Arc::clone(&query_semaphore),
        shutdown_tx.subscribe(),
        Some(udp_ready_tx),
    ));

    let (tcp_ready_tx, tcp_ready_rx) = oneshot::channel();
    let tcp_task = tokio::spawn(run_tcp_server(
        listener_config,
        Arc::clone(&handler),
        Arc::clone(&metrics),
        Arc::clone(&query_semaphore),
        shutdown_tx.subscribe(),
        Some(tcp_ready_tx),
    ));

    let mut http_task = None;
    if config.metrics_port > 0 {
        let (http_ready_tx, http_ready_rx) = oneshot::channel();
        let http_server = HttpServer::new(
            Arc::clone(&metrics),
            Arc::clone(&cache),
            config.metrics_host.clone(),
            config.metrics_port,
        );
        http_task = Some(tokio::spawn(
            http_server.run(shutdown_tx.subscribe(), Some(http_ready_tx)),
        ));
        if http_ready_rx.await.is_err() {
            error!("HTTP metrics server failed to start");
        }
    }

    if udp_ready_rx.await.is_err() {
        error!("UDP server failed to start");
        return Err(bifrost::error::BifrostError::Shutdown);
    }
    if tcp_ready_rx.await.is_err() {
        error!("TCP server failed to start");
        return Err(bifrost::error::BifrostError::Shutdown);
    }

    let refresh_tasks = refresh.start(&shutdown_tx);

    if config.refresh_enabled && config.refresh_warmup_enabled {
        if let Some(path) = &config.refresh_warmup_file {
            match enqueue_warmup_file(
                std::path::Path::new(path),
                &refresh,
                config.refresh_warmup_limit,
                &metrics,
            ) {
                Ok(summary) => info!(
                    "Warmup complete: {} loaded, {} invalid, {} enqueued",
                    summary.loaded, summary.invalid, summary.enqueued
                ),
                Err(e) => warn!("Warmup file {} unreadable: {}", path, e),
            }
        }
    }

    let reporter_task = tokio::spawn(periodic_stats_reporter(
        Arc::clone(&metrics),
        STATS_REPORT_INTERVAL,
        shutdown_tx.subscribe(),
    ));

    // SIGHUP clears the cache; SIGINT/SIGTERM shut down.
    #[cfg(unix)]
    {
        let cache = Arc::clone(&cache);
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                cache.clear();
                info!("Cache cleared (SIGHUP)");
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("Shutting down...");
    let _ = shutdown_tx.send(());

    for task in refresh_tasks {
        let _ = task.await;
    }
    let _ = reporter_task.await;
    if let Ok(result) = udp_task.await {
        if let Err(e) = result {
            warn!("UDP server exited with error: {}", e);
        }
    }
    if let Ok(result) = tcp_task.await {
        if let Err(e) = result {
            warn!("TCP server exited with error: {}", e);
        }
    }
    if let Some(task) = http_task {
        let _ = task.await;
    }

    upstream.close().await;

    let snapshot = metrics.snapshot();
    if snapshot.values().any(|v| *v != 0) {
        info!("{}", format_stats(&snapshot));
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match build_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    init_logging(config.verbose);

    if config.upstream_transport == UpstreamTransport::Relay {
        if let Some(relay) = &config.relay {
            if let Err(e) = run_relay_startup_check(relay, config.upstream_timeout).await {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = run(config).await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}
