use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::ConfigError;
use crate::upstream::relay::{RelayConfig, RelayLimits, StartupCheckMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpstreamTransport {
    Udp,
    Tcp,
    Relay,
}

#[derive(Debug, Parser)]
#[command(name = "bifrost", about = "Resilient recursive DNS caching proxy")]
pub struct Cli {
    // Listener options
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_host: String,
    #[arg(long, default_value_t = 5353)]
    pub listen_port: u16,
    #[arg(long, default_value_t = 256)]
    pub max_inflight: usize,
    #[arg(long, default_value = "127.0.0.1")]
    pub metrics_host: String,
    /// 0 disables the metrics endpoint.
    #[arg(long, default_value_t = 0)]
    pub metrics_port: u16,

    // Upstream
    #[arg(long, value_enum, default_value = "udp")]
    pub upstream_transport: UpstreamTransport,
    #[arg(long, default_value = "1.1.1.1")]
    pub upstream_host: String,
    #[arg(long, default_value_t = 53)]
    pub upstream_port: u16,
    /// Seconds per upstream query.
    #[arg(long, default_value_t = 2.0)]
    pub upstream_timeout: f64,
    #[arg(long, default_value_t = 4)]
    pub tcp_pool_max_conns: usize,
    #[arg(long, default_value_t = 30.0)]
    pub tcp_pool_idle_timeout: f64,
    #[arg(long, default_value_t = 32)]
    pub udp_max_workers: usize,

    // Relay upstream
    #[arg(long)]
    pub relay_base_url: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub relay_api_version: u32,
    #[arg(long)]
    pub relay_auth_token: Option<String>,
    #[arg(long, default_value = "require")]
    pub relay_startup_check: String,
    #[arg(long, default_value_t = 32)]
    pub relay_max_items: u64,
    #[arg(long, default_value_t = 65536)]
    pub relay_max_request_bytes: u64,
    #[arg(long, default_value_t = 4096)]
    pub relay_per_item_max_wire_bytes: u64,
    #[arg(long, default_value_t = 262144)]
    pub relay_max_response_bytes: u64,

    // Cache tuning
    /// Max seconds to serve stale cache entries if upstream fails.
    #[arg(long, default_value_t = 300)]
    pub serve_stale_max: u64,
    /// TTL (seconds) for negative cache entries without an SOA MINIMUM.
    #[arg(long, default_value_t = 60)]
    pub negative_ttl: u64,
    /// 0 disables eviction.
    #[arg(long, default_value_t = 0)]
    pub cache_max_entries: usize,

    // Background refresh
    #[arg(long, default_value_t = false)]
    pub refresh_enabled: bool,
    #[arg(long, default_value_t = 30)]
    pub refresh_ahead_seconds: u64,
    #[arg(long, default_value_t = 5)]
    pub refresh_popularity_threshold: u32,
    /// 0 disables the recency predicate.
    #[arg(long, default_value_t = 0)]
    pub refresh_popularity_decay_seconds: u64,
    #[arg(long, default_value_t = 500)]
    pub refresh_tick_ms: u64,
    #[arg(long, default_value_t = 50)]
    pub refresh_batch_size: usize,
    #[arg(long, default_value_t = 5)]
    pub refresh_concurrency: usize,
    #[arg(long, default_value_t = 1024)]
    pub refresh_queue_max: usize,
    #[arg(long, default_value_t = false)]
    pub refresh_warmup_enabled: bool,
    #[arg(long)]
    pub refresh_warmup_file: Option<String>,
    #[arg(long, default_value_t = 200)]
    pub refresh_warmup_limit: usize,

    // Logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub max_inflight: usize,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub upstream_transport: UpstreamTransport,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_timeout: Duration,
    pub serve_stale_max: Duration,
    pub negative_ttl: Duration,
    pub cache_max_entries: usize,
    pub tcp_pool_max_conns: usize,
    pub tcp_pool_idle_timeout: Duration,
    pub udp_max_workers: usize,
    /// UDP responses above this are truncated (TC) or dropped.
    pub max_udp_payload: usize,
    /// TCP messages above this are dropped.
    pub max_message_size: usize,
    /// Per-read deadline on TCP listener sockets.
    pub tcp_read_timeout: Duration,
    /// How long an idle TCP client connection is kept open.
    pub tcp_idle_timeout: Duration,
    pub relay: Option<RelayConfig>,
    pub refresh_enabled: bool,
    pub refresh_ahead: Duration,
    pub refresh_popularity_threshold: u32,
    pub refresh_popularity_decay: Duration,
    pub refresh_tick: Duration,
    pub refresh_batch_size: usize,
    pub refresh_concurrency: usize,
    pub refresh_queue_max: usize,
    pub refresh_warmup_enabled: bool,
    pub refresh_warmup_file: Option<String>,
    pub refresh_warmup_limit: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 5353,
            max_inflight: 256,
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 0,
            upstream_transport: UpstreamTransport::Udp,
            upstream_host: "1.1.1.1".to_string(),
            upstream_port: 53,
            upstream_timeout: Duration::from_secs(2),
            serve_stale_max: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(60),
            cache_max_entries: 0,
            tcp_pool_max_conns: 4,
            tcp_pool_idle_timeout: Duration::from_secs(30),
            udp_max_workers: 32,
            max_udp_payload: 1232,
            max_message_size: 65535,
            tcp_read_timeout: Duration::from_secs(5),
            tcp_idle_timeout: Duration::from_secs(30),
            relay: None,
            refresh_enabled: false,
            refresh_ahead: Duration::from_secs(30),
            refresh_popularity_threshold: 5,
            refresh_popularity_decay: Duration::ZERO,
            refresh_tick: Duration::from_millis(500),
            refresh_batch_size: 50,
            refresh_concurrency: 5,
            refresh_queue_max: 1024,
            refresh_warmup_enabled: false,
            refresh_warmup_file: None,
            refresh_warmup_limit: 200,
            verbose: false,
        }
    }
}

pub fn build_config(cli: Cli) -> Result<Config, ConfigError> {
    let startup_check: StartupCheckMode = cli
        .relay_startup_check
        .parse()
        .map_err(ConfigError::InvalidRelay)?;

    let relay = cli.relay_base_url.as_ref().map(|base_url| RelayConfig {
        base_url: base_url.clone(),
        api_version: cli.relay_api_version,
        auth_token: cli.relay_auth_token.clone(),
        startup_check,
        limits: RelayLimits {
            max_items: cli.relay_max_items,
            max_request_bytes: cli.relay_max_request_bytes,
            per_item_max_wire_bytes: cli.relay_per_item_max_wire_bytes,
            max_response_bytes: cli.relay_max_response_bytes,
        },
    });

    Ok(Config {
        listen_host: cli.listen_host,
        listen_port: cli.listen_port,
        max_inflight: cli.max_inflight,
        metrics_host: cli.metrics_host,
        metrics_port: cli.metrics_port,
        upstream_transport: cli.upstream_transport,
        upstream_host: cli.upstream_host,
        upstream_port: cli.upstream_port,
        upstream_timeout: Duration::from_secs_f64(cli.upstream_timeout.max(0.0)),
        serve_stale_max: Duration::from_secs(cli.serve_stale_max),
        negative_ttl: Duration::from_secs(cli.negative_ttl),
        cache_max_entries: cli.cache_max_entries,
        tcp_pool_max_conns: cli.tcp_pool_max_conns,
        tcp_pool_idle_timeout: Duration::from_secs_f64(cli.tcp_pool_idle_timeout.max(0.0)),
        udp_max_workers: cli.udp_max_workers,
        relay,
        refresh_enabled: cli.refresh_enabled,
        refresh_ahead: Duration::from_secs(cli.refresh_ahead_seconds),
        refresh_popularity_threshold: cli.refresh_popularity_threshold,
        refresh_popularity_decay: Duration::from_secs(cli.refresh_popularity_decay_seconds),
        refresh_tick: Duration::from_millis(cli.refresh_tick_ms),
        refresh_batch_size: cli.refresh_batch_size,
        refresh_concurrency: cli.refresh_concurrency,
        refresh_queue_max: cli.refresh_queue_max,
        refresh_warmup_enabled: cli.refresh_warmup_enabled,
        refresh_warmup_file: cli.refresh_warmup_file,
        refresh_warmup_limit: cli.refresh_warmup_limit,
        verbose: cli.verbose,
        ..Config::default()
    })
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_host.trim().is_empty() {
            return Err(ConfigError::InvalidListenAddress(
                "listen host must be non-empty".to_string(),
            ));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidListenAddress(
                "listen port must be between 1 and 65535".to_string(),
            ));
        }
        if self.metrics_host.trim().is_empty() {
            return Err(ConfigError::InvalidMetricsAddress(
                "metrics host must be non-empty".to_string(),
            ));
        }
        if self.upstream_host.trim().is_empty() {
            return Err(ConfigError::InvalidUpstream(
                "upstream host must be non-empty".to_string(),
            ));
        }
        if self.upstream_port == 0 {
            return Err(ConfigError::InvalidUpstream(
                "upstream port must be between 1 and 65535".to_string(),
            ));
        }
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "upstream timeout must be > 0".to_string(),
            ));
        }
        if self.max_inflight < 1 {
            return Err(ConfigError::InvalidListener(
                "max inflight must be >= 1".to_string(),
            ));
        }
        if self.udp_max_workers < 1 {
            return Err(ConfigError::InvalidUpstream(
                "udp max workers must be >= 1".to_string(),
            ));
        }
        if self.tcp_pool_idle_timeout.is_zero() {
            return Err(ConfigError::InvalidUpstream(
                "tcp pool idle timeout must be > 0".to_string(),
            ));
        }
        if self.refresh_tick.is_zero() {
            return Err(ConfigError::InvalidRefresh(
                "refresh tick must be > 0".to_string(),
            ));
        }
        if self.refresh_batch_size == 0 {
            return Err(ConfigError::InvalidRefresh(
                "refresh batch size must be > 0".to_string(),
            ));
        }
        if self.refresh_warmup_enabled && self.refresh_warmup_file.is_none() {
            return Err(ConfigError::InvalidRefresh(
                "warmup file is required when warmup is enabled".to_string(),
            ));
        }
        if self.refresh_warmup_enabled && self.refresh_warmup_limit == 0 {
            return Err(ConfigError::InvalidRefresh(
                "warmup limit must be > 0 when warmup is enabled".to_string(),
            ));
        }

        if let Some(relay) = &self.relay {
            RelayConfig::validate_base_url(&relay.base_url).map_err(ConfigError::InvalidRelay)?;
            relay.limits.validate().map_err(ConfigError::InvalidRelay)?;
            if relay.api_version < 1 {
                return Err(ConfigError::InvalidRelay(
                    "relay API version must be >= 1".to_string(),
                ));
            }
        }
        if self.upstream_transport == UpstreamTransport::Relay && self.relay.is_none() {
            return Err(ConfigError::InvalidRelay(
                "relay base URL is required for the relay transport".to_string(),
            ));
        }

        Ok(())
    }
}
