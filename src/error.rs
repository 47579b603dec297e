use std::sync::Arc;
use thiserror::Error;

use crate::dns::ParseError;

pub type Result<T> = std::result::Result<T, BifrostError>;

/// Configuration validation errors, one variant per flag family.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),
    #[error("Invalid metrics address: {0}")]
    InvalidMetricsAddress(String),
    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("Invalid cache setting: {0}")]
    InvalidCache(String),
    #[error("Invalid refresh setting: {0}")]
    InvalidRefresh(String),
    #[error("Invalid relay setting: {0}")]
    InvalidRelay(String),
    #[error("Invalid listener setting: {0}")]
    InvalidListener(String),
}

/// Unified error type for the bifrost DNS proxy.
#[derive(Debug, Clone, Error)]
pub enum BifrostError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Operation timed out")]
    Timeout,
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Relay startup check failed: {0}")]
    RelayStartup(String),
    #[error("Server is shutting down")]
    Shutdown,
}

impl From<std::io::Error> for BifrostError {
    fn from(err: std::io::Error) -> Self {
        BifrostError::Io(Arc::new(err))
    }
}
