mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, routing::{get, post}};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use bifrost::dns::DNSPacket;
use bifrost::dns::enums::DNSResourceType;
use bifrost::metrics::Metrics;
use bifrost::upstream::relay::{
    RELAY_PROTOCOL_VERSION, RelayConfig, RelayDnsItemResponse, RelayDnsRequest, RelayDnsResponse,
    RelayInfo, RelayLimits, RelayUpstreamForwarder, StartupCheckMode, check_relay_startup,
};
use bifrost::upstream::UpstreamForwarder;

use common::{a_response, make_query};

#[derive(Clone)]
struct FakeRelayState {
    info: RelayInfo,
}

async fn fake_info(State(state): State<Arc<FakeRelayState>>) -> Json<RelayInfo> {
    Json(RelayInfo {
        v: state.info.v,
        limits: state.info.limits,
        auth_required: state.info.auth_required,
    })
}

async fn fake_dns(
    Json(request): Json<RelayDnsRequest>,
) -> Result<Json<RelayDnsResponse>, StatusCode> {
    let mut items = Vec::new();
    for item in &request.items {
        let wire = BASE64
            .decode(&item.q)
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        match a_response(&wire, [7, 7, 7, 7], 60) {
            Some(answer) => items.push(RelayDnsItemResponse {
                id: item.id.clone(),
                ok: true,
                a: Some(BASE64.encode(answer)),
                err: None,
            }),
            None => items.push(RelayDnsItemResponse {
                id: item.id.clone(),
                ok: false,
                a: None,
                err: Some("unresolvable".to_string()),
            }),
        }
    }
    Ok(Json(RelayDnsResponse {
        v: request.v,
        id: request.id.clone(),
        items,
    }))
}

async fn spawn_fake_relay(info: RelayInfo) -> SocketAddr {
    let state = Arc::new(FakeRelayState { info });
    let app = Router::new()
        .route("/v1/info", get(fake_info))
        .route("/v1/dns", post(fake_dns))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn relay_config(addr: SocketAddr, limits: RelayLimits) -> RelayConfig {
    RelayConfig {
        base_url: format!("http://{}", addr),
        api_version: 1,
        auth_token: None,
        startup_check: StartupCheckMode::Require,
        limits,
    }
}

fn default_info() -> RelayInfo {
    RelayInfo {
        v: RELAY_PROTOCOL_VERSION,
        limits: RelayLimits::default(),
        auth_required: false,
    }
}

#[test]
fn limits_reject_zero_values() {
    let limits = RelayLimits {
        max_items: 0,
        ..RelayLimits::default()
    };
    assert!(limits.validate().unwrap_err().contains("max_items"));
    assert!(RelayLimits::default().validate().is_ok());
}

#[test]
fn limit_compatibility_reports_every_mismatch() {
    let client = RelayLimits::default();
    let relay = RelayLimits {
        max_items: 16,
        max_request_bytes: 1024,
        ..RelayLimits::default()
    };
    let err = client.check_compatible(&relay).unwrap_err();
    assert!(err.contains("max_items (client=32, relay=16)"));
    assert!(err.contains("max_request_bytes"));
    assert!(!err.contains("per_item_max_wire_bytes"));

    assert!(client.check_compatible(&RelayLimits::default()).is_ok());
}

#[test]
fn base_url_validation() {
    assert!(RelayConfig::validate_base_url("http://relay.example.com").is_ok());
    assert!(RelayConfig::validate_base_url("https://relay.example.com/base").is_ok());
    assert!(RelayConfig::validate_base_url("").is_err());
    assert!(RelayConfig::validate_base_url(" http://x.example.com").is_err());
    assert!(RelayConfig::validate_base_url("ftp://x.example.com").is_err());
    assert!(RelayConfig::validate_base_url("http://x.example.com/?q=1").is_err());
}

#[test]
fn startup_check_mode_parsing() {
    assert_eq!("require".parse::<StartupCheckMode>().unwrap(), StartupCheckMode::Require);
    assert_eq!("warn".parse::<StartupCheckMode>().unwrap(), StartupCheckMode::Warn);
    assert_eq!("off".parse::<StartupCheckMode>().unwrap(), StartupCheckMode::Off);
    assert!("sometimes".parse::<StartupCheckMode>().is_err());
}

#[test]
fn url_builders_strip_trailing_slash() {
    let config = RelayConfig {
        base_url: "http://relay.example.com/base/".to_string(),
        api_version: 2,
        auth_token: None,
        startup_check: StartupCheckMode::Off,
        limits: RelayLimits::default(),
    };
    assert_eq!(config.info_url(), "http://relay.example.com/base/v2/info");
    assert_eq!(config.dns_url(), "http://relay.example.com/base/v2/dns");
}

#[tokio::test]
async fn oversized_query_is_dropped_client_side() {
    let metrics = Arc::new(Metrics::new());
    let limits = RelayLimits {
        per_item_max_wire_bytes: 8,
        ..RelayLimits::default()
    };
    let config = relay_config("127.0.0.1:9".parse().unwrap(), limits);
    let forwarder = RelayUpstreamForwarder::new(config, Arc::clone(&metrics), Duration::from_secs(1)).unwrap();

    let wire = Bytes::from(vec![0u8; 64]);
    assert!(forwarder.query(wire, "req-1").await.is_none());
    assert_eq!(metrics.get("dropped_total"), 1);
    assert_eq!(metrics.get("dropped_oversize_total"), 1);
    // Never reached the wire.
    assert_eq!(metrics.get("upstream_requests_total"), 0);
}

#[tokio::test]
async fn query_round_trips_through_the_relay() {
    let addr = spawn_fake_relay(default_info()).await;
    let metrics = Arc::new(Metrics::new());
    let config = relay_config(addr, RelayLimits::default());
    let forwarder =
        RelayUpstreamForwarder::new(config, Arc::clone(&metrics), Duration::from_secs(2)).unwrap();

    let query = make_query("relay.example.com", DNSResourceType::A, 0x2222)
        .serialize()
        .unwrap();
    let response = forwarder
        .query(Bytes::from(query), "req-42")
        .await
        .expect("relay answered");

    let parsed = DNSPacket::parse(&response).unwrap();
    assert_eq!(parsed.header.id, 0x2222);
    assert_eq!(parsed.answers[0].rdata, vec![7, 7, 7, 7]);
    assert_eq!(metrics.get("upstream_requests_total"), 1);
    assert_eq!(metrics.get("upstream_relay_requests_total"), 1);
}

#[tokio::test]
async fn startup_check_accepts_compatible_relay() {
    let addr = spawn_fake_relay(default_info()).await;
    let config = relay_config(addr, RelayLimits::default());
    assert!(check_relay_startup(&config, Duration::from_secs(2)).await.is_ok());
}

#[tokio::test]
async fn startup_check_rejects_version_mismatch() {
    let addr = spawn_fake_relay(RelayInfo {
        v: 9,
        ..default_info()
    })
    .await;
    let config = relay_config(addr, RelayLimits::default());
    let err = check_relay_startup(&config, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("version mismatch"));
}

#[tokio::test]
async fn startup_check_rejects_smaller_relay_limits() {
    let addr = spawn_fake_relay(RelayInfo {
        limits: RelayLimits {
            max_items: 4,
            ..RelayLimits::default()
        },
        ..default_info()
    })
    .await;
    let config = relay_config(addr, RelayLimits::default());
    let err = check_relay_startup(&config, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("incompatible"));
}

#[tokio::test]
async fn startup_check_reports_unreachable_relay() {
    let config = relay_config("127.0.0.1:1".parse().unwrap(), RelayLimits::default());
    assert!(check_relay_startup(&config, Duration::from_millis(300)).await.is_err());
}

#[test]
fn response_envelope_parses_from_json() {
    let json = r#"{"v":1,"id":"batch-1","items":[{"id":"0","ok":true,"a":"AAAA"},{"id":"1","ok":false,"err":"boom"}]}"#;
    let parsed: RelayDnsResponse = serde_json::from_str(json).unwrap();
    assert_eq!(parsed.v, 1);
    assert_eq!(parsed.items.len(), 2);
    assert!(parsed.items[0].ok);
    assert_eq!(parsed.items[0].a.as_deref(), Some("AAAA"));
    assert!(!parsed.items[1].ok);
    assert_eq!(parsed.items[1].err.as_deref(), Some("boom"));
}
