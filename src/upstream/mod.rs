pub mod relay;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;

pub use relay::{RelayConfig, RelayLimits, RelayUpstreamForwarder, StartupCheckMode};
pub use tcp::{TcpUpstreamForwarder, UpstreamTcpConfig};
pub use udp::{UdpUpstreamForwarder, UpstreamUdpConfig};

/// Contract every upstream transport satisfies. `None` means upstream
/// failure: timeout, network error, or protocol violation. The caller owns
/// failure policy; forwarders only account transport-specific errors.
#[async_trait]
pub trait UpstreamForwarder: Send + Sync {
    async fn query(&self, wire: Bytes, request_id: &str) -> Option<Bytes>;

    /// Release pooled resources. Default is a no-op.
    async fn close(&self) {}
}
