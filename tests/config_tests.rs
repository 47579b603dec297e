use clap::Parser;

use bifrost::config::{Cli, Config, UpstreamTransport, build_config};

fn config_from(args: &[&str]) -> Result<Config, String> {
    let mut argv = vec!["bifrost"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).map_err(|e| e.to_string())?;
    let config = build_config(cli).map_err(|e| e.to_string())?;
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

#[test]
fn defaults_validate() {
    let config = config_from(&[]).unwrap();
    assert_eq!(config.listen_port, 5353);
    assert_eq!(config.max_inflight, 256);
    assert_eq!(config.upstream_transport, UpstreamTransport::Udp);
    assert_eq!(config.metrics_port, 0);
    assert!(!config.refresh_enabled);
}

#[test]
fn listen_port_zero_is_rejected() {
    let err = config_from(&["--listen-port", "0"]).unwrap_err();
    assert!(err.contains("listen port"));
}

#[test]
fn upstream_timeout_must_be_positive() {
    let err = config_from(&["--upstream-timeout", "0"]).unwrap_err();
    assert!(err.contains("timeout"));
}

#[test]
fn refresh_tick_must_be_positive() {
    let err = config_from(&["--refresh-tick-ms", "0"]).unwrap_err();
    assert!(err.contains("refresh tick"));
}

#[test]
fn refresh_batch_size_must_be_positive() {
    let err = config_from(&["--refresh-batch-size", "0"]).unwrap_err();
    assert!(err.contains("batch size"));
}

#[test]
fn max_inflight_must_be_positive() {
    let err = config_from(&["--max-inflight", "0"]).unwrap_err();
    assert!(err.contains("max inflight"));
}

#[test]
fn warmup_requires_a_file() {
    let err = config_from(&["--refresh-enabled", "--refresh-warmup-enabled"]).unwrap_err();
    assert!(err.contains("warmup file"));
}

#[test]
fn relay_transport_requires_base_url() {
    let err = config_from(&["--upstream-transport", "relay"]).unwrap_err();
    assert!(err.contains("relay base URL"));
}

#[test]
fn relay_base_url_is_validated() {
    let err = config_from(&[
        "--upstream-transport",
        "relay",
        "--relay-base-url",
        "ftp://bad.example.com",
    ])
    .unwrap_err();
    assert!(err.contains("http://"));
}

#[test]
fn relay_startup_check_mode_is_validated() {
    let err = config_from(&["--relay-startup-check", "sometimes"]).unwrap_err();
    assert!(err.contains("startup check"));
}

#[test]
fn relay_limits_must_be_positive() {
    let err = config_from(&[
        "--upstream-transport",
        "relay",
        "--relay-base-url",
        "http://relay.example.com",
        "--relay-max-items",
        "0",
    ])
    .unwrap_err();
    assert!(err.contains("max_items"));
}

#[test]
fn relay_config_is_carried_through() {
    let config = config_from(&[
        "--upstream-transport",
        "relay",
        "--relay-base-url",
        "http://relay.example.com",
        "--relay-auth-token",
        "sekrit",
        "--relay-startup-check",
        "warn",
        "--relay-max-items",
        "8",
    ])
    .unwrap();
    let relay = config.relay.unwrap();
    assert_eq!(relay.base_url, "http://relay.example.com");
    assert_eq!(relay.auth_token.as_deref(), Some("sekrit"));
    assert_eq!(relay.limits.max_items, 8);
}

#[test]
fn durations_convert_from_flag_units() {
    let config = config_from(&[
        "--upstream-timeout",
        "1.5",
        "--refresh-tick-ms",
        "250",
        "--serve-stale-max",
        "120",
    ])
    .unwrap();
    assert_eq!(config.upstream_timeout.as_millis(), 1500);
    assert_eq!(config.refresh_tick.as_millis(), 250);
    assert_eq!(config.serve_stale_max.as_secs(), 120);
}
