use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BifrostError;
use crate::metrics::Metrics;
use crate::upstream::UpstreamForwarder;

pub const RELAY_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayLimits {
    pub max_items: u64,
    pub max_request_bytes: u64,
    pub per_item_max_wire_bytes: u64,
    pub max_response_bytes: u64,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_items: 32,
            max_request_bytes: 65536,
            per_item_max_wire_bytes: 4096,
            max_response_bytes: 262144,
        }
    }
}

impl RelayLimits {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("max_items", self.max_items),
            ("max_request_bytes", self.max_request_bytes),
            ("per_item_max_wire_bytes", self.per_item_max_wire_bytes),
            ("max_response_bytes", self.max_response_bytes),
        ] {
            if value == 0 {
                return Err(format!("{} must be > 0", name));
            }
        }
        Ok(())
    }

    /// Every client-side limit must fit inside what the relay advertises.
    pub fn check_compatible(&self, relay: &RelayLimits) -> Result<(), String> {
        let mut mismatches = Vec::new();
        for (name, client, advertised) in [
            ("max_items", self.max_items, relay.max_items),
            (
                "max_request_bytes",
                self.max_request_bytes,
                relay.max_request_bytes,
            ),
            (
                "per_item_max_wire_bytes",
                self.per_item_max_wire_bytes,
                relay.per_item_max_wire_bytes,
            ),
            (
                "max_response_bytes",
                self.max_response_bytes,
                relay.max_response_bytes,
            ),
        ] {
            if client > advertised {
                mismatches.push(format!("{} (client={}, relay={})", name, client, advertised));
            }
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(format!("relay limits incompatible: {}", mismatches.join(", ")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupCheckMode {
    Require,
    Warn,
    Off,
}

impl FromStr for StartupCheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "require" => Ok(StartupCheckMode::Require),
            "warn" => Ok(StartupCheckMode::Warn),
            "off" => Ok(StartupCheckMode::Off),
            other => Err(format!(
                "relay startup check must be 'require', 'warn', or 'off', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub base_url: String,
    pub api_version: u32,
    pub auth_token: Option<String>,
    pub startup_check: StartupCheckMode,
    pub limits: RelayLimits,
}

impl RelayConfig {
    pub fn info_url(&self) -> String {
        format!("{}/v{}/info", self.base_url.trim_end_matches('/'), self.api_version)
    }

    pub fn dns_url(&self) -> String {
        format!("{}/v{}/dns", self.base_url.trim_end_matches('/'), self.api_version)
    }

    pub fn validate_base_url(base_url: &str) -> Result<(), String> {
        if base_url.trim().is_empty() {
            return Err("relay base URL must be non-empty".to_string());
        }
        if base_url.trim() != base_url {
            return Err("relay base URL must not include surrounding whitespace".to_string());
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err("relay base URL must start with http:// or https://".to_string());
        }
        if base_url.contains('?') || base_url.contains('#') {
            return Err("relay base URL must not include a querystring or fragment".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayDnsItemRequest {
    pub id: String,
    pub q: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayDnsRequest {
    pub v: u32,
    pub id: String,
    pub items: Vec<RelayDnsItemRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayDnsItemResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default)]
    pub a: Option<String>,
    #[serde(default)]
    pub err: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayDnsResponse {
    pub v: u32,
    pub id: String,
    pub items: Vec<RelayDnsItemResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub v: u32,
    pub limits: RelayLimits,
    #[serde(default)]
    pub auth_required: bool,
}

/// HTTP batch relay upstream: DNS wire payloads travel base64-encoded inside
/// a JSON envelope, gzip-negotiated. Each `query` is a single-item batch.
pub struct RelayUpstreamForwarder {
    config: RelayConfig,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
}

impl RelayUpstreamForwarder {
    pub fn new(
        config: RelayConfig,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Result<Self, BifrostError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| BifrostError::RelayStartup(format!("relay client build failed: {}", e)))?;
        Ok(Self {
            config,
            metrics,
            client,
        })
    }

    fn protocol_error(&self, what: &str) -> Option<Bytes> {
        self.metrics.inc("upstream_relay_protocol_errors_total");
        warn!("Relay protocol error: {}", what);
        None
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl UpstreamForwarder for RelayUpstreamForwarder {
    async fn query(&self, wire: Bytes, request_id: &str) -> Option<Bytes> {
        let limits = &self.config.limits;
        if wire.len() as u64 > limits.per_item_max_wire_bytes {
            self.metrics.inc("dropped_total");
            self.metrics.inc("dropped_oversize_total");
            return None;
        }

        let payload = RelayDnsRequest {
            v: RELAY_PROTOCOL_VERSION,
            id: request_id.to_string(),
            items: vec![RelayDnsItemRequest {
                id: "0".to_string(),
                q: BASE64.encode(&wire),
            }],
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Relay request encode failed: {}", e);
                return None;
            }
        };
        if body.len() as u64 > limits.max_request_bytes {
            self.metrics.inc("dropped_total");
            self.metrics.inc("dropped_oversize_total");
            return None;
        }

        self.metrics.inc("upstream_requests_total");
        self.metrics.inc("upstream_relay_requests_total");

        let request = self
            .apply_auth(self.client.post(self.config.dns_url()))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .body(body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                self.metrics.inc("upstream_relay_timeouts_total");
                debug!("Relay request timed out");
                return None;
            }
            Err(e) => {
                self.metrics.inc("upstream_relay_client_errors_total");
                debug!("Relay request failed: {}", e);
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            if status.is_client_error() {
                self.metrics.inc("upstream_relay_http_4xx_total");
            } else if status.is_server_error() {
                self.metrics.inc("upstream_relay_http_5xx_total");
            } else {
                self.metrics.inc("upstream_relay_protocol_errors_total");
            }
            return None;
        }

        let raw = match response.bytes().await {
            Ok(raw) => raw,
            Err(e) => {
                self.metrics.inc("upstream_relay_client_errors_total");
                debug!("Relay response read failed: {}", e);
                return None;
            }
        };
        if raw.len() as u64 > limits.max_response_bytes {
            return self.protocol_error("response exceeds max_response_bytes");
        }

        let parsed: RelayDnsResponse = match serde_json::from_slice(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return self.protocol_error(&format!("invalid JSON: {}", e)),
        };
        if parsed.v != RELAY_PROTOCOL_VERSION {
            return self.protocol_error("version mismatch");
        }

        let item = match parsed.items.iter().find(|item| item.id == "0") {
            Some(item) => item,
            None => return self.protocol_error("missing item"),
        };

        if !item.ok {
            debug!(
                "Relay item error: {}",
                item.err.as_deref().unwrap_or("unknown")
            );
            return None;
        }

        let Some(answer_b64) = item.a.as_deref() else {
            return self.protocol_error("ok item missing payload");
        };
        match BASE64.decode(answer_b64) {
            Ok(answer) => Some(Bytes::from(answer)),
            Err(_) => self.protocol_error("payload invalid base64"),
        }
    }
}

/// Fetch `/info` and verify version and limit compatibility.
pub async fn check_relay_startup(
    config: &RelayConfig,
    timeout: Duration,
) -> Result<(), BifrostError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .gzip(true)
        .build()
        .map_err(|e| BifrostError::RelayStartup(format!("relay client build failed: {}", e)))?;

    let mut request = client
        .get(config.info_url())
        .header(reqwest::header::ACCEPT, "application/json");
    if let Some(token) = &config.auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            BifrostError::RelayStartup("relay /info timeout or unreachable".to_string())
        } else {
            BifrostError::RelayStartup(format!("relay /info request failed: {}", e))
        }
    })?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(BifrostError::RelayStartup(
            "relay auth failed: missing or invalid Authorization token".to_string(),
        ));
    }
    if status != reqwest::StatusCode::OK {
        return Err(BifrostError::RelayStartup(format!(
            "relay /info returned HTTP {}",
            status.as_u16()
        )));
    }

    let raw = response
        .bytes()
        .await
        .map_err(|e| BifrostError::RelayStartup(format!("relay /info read failed: {}", e)))?;
    if raw.len() as u64 > config.limits.max_response_bytes {
        return Err(BifrostError::RelayStartup(format!(
            "relay /info response exceeds max_response_bytes (client={} bytes)",
            config.limits.max_response_bytes
        )));
    }

    let info: RelayInfo = serde_json::from_slice(&raw)
        .map_err(|e| BifrostError::RelayStartup(format!("relay /info invalid JSON: {}", e)))?;

    if info.v != config.api_version {
        return Err(BifrostError::RelayStartup(format!(
            "relay API version mismatch (client={}, relay={})",
            config.api_version, info.v
        )));
    }

    info.limits
        .validate()
        .map_err(BifrostError::RelayStartup)?;
    config
        .limits
        .check_compatible(&info.limits)
        .map_err(BifrostError::RelayStartup)?;

    Ok(())
}

/// Startup-check policy: `require` fails startup, `warn` logs and
/// continues, `off` skips the probe entirely.
pub async fn run_relay_startup_check(
    config: &RelayConfig,
    timeout: Duration,
) -> Result<(), BifrostError> {
    match config.startup_check {
        StartupCheckMode::Off => Ok(()),
        StartupCheckMode::Warn => {
            if let Err(e) = check_relay_startup(config, timeout).await {
                warn!("Relay startup check failed: {}", e);
            }
            Ok(())
        }
        StartupCheckMode::Require => check_relay_startup(config, timeout).await,
    }
}
