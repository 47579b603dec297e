use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::{CacheKey, DnsCache};
use crate::dns::{DNSPacket, enums::ResponseCode, packet::set_wire_txid};
use crate::metrics::Metrics;
use crate::refresh::{RefreshEngine, RefreshReason};
use crate::resolver::UpstreamResolver;

#[derive(Debug, Clone, Copy)]
pub struct HandlerConfig {
    /// How long a miss waits on its upstream flight before falling back.
    pub upstream_timeout: Duration,
    /// Watchdog deadline for stale-serve refresh kicks; log-only.
    pub refresh_watch_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(2),
            refresh_watch_timeout: Duration::from_secs(5),
        }
    }
}

/// Request handler: fresh hit, stale hit with revalidation, deduplicated
/// miss, serve-stale fallback, SERVFAIL. Nothing past this boundary fails.
pub struct DnsHandler {
    cache: Arc<DnsCache>,
    resolver: Arc<UpstreamResolver>,
    refresh: Arc<RefreshEngine>,
    metrics: Arc<Metrics>,
    config: HandlerConfig,
}

impl DnsHandler {
    pub fn new(
        cache: Arc<DnsCache>,
        resolver: Arc<UpstreamResolver>,
        refresh: Arc<RefreshEngine>,
        metrics: Arc<Metrics>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            cache,
            resolver,
            refresh,
            metrics,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    /// Resolve one parsed request into response wire. Every outbound
    /// response carries the inbound transaction ID, cached wire included.
    pub async fn handle(&self, request: &DNSPacket, client_addr: SocketAddr) -> Vec<u8> {
        self.metrics.inc("queries_total");

        let Some(question) = request.questions.first() else {
            debug!(
                "Query id={} from {} has no question, returning FORMERR",
                request.header.id, client_addr
            );
            return pack_reply(request, ResponseCode::FormErr);
        };

        let key = CacheKey::from_question(question);

        if let Some(fresh) = self.cache.get_fresh(&key) {
            self.metrics.inc("cache_hit_fresh_total");
            debug!("CACHE HIT (fresh) {} {:?}", key.domain, key.record_type);
            return respond_with(fresh, request.header.id);
        }

        if let Some(stale) = self.cache.get_stale(&key) {
            self.metrics.inc("cache_hit_stale_total");
            debug!(
                "CACHE HIT (stale) {} {:?} (refresh scheduled)",
                key.domain, key.record_type
            );
            self.revalidate(&key);
            return respond_with(stale, request.header.id);
        }

        self.metrics.inc("cache_miss_total");
        let request_wire = match request.serialize() {
            Ok(wire) => Bytes::from(wire),
            Err(e) => {
                warn!("Failed to re-pack query for upstream: {}", e);
                return pack_reply(request, ResponseCode::ServFail);
            }
        };

        let (flight, leader) = self.resolver.resolve(&key, request_wire);
        if leader {
            debug!("CACHE MISS (leader) {} {:?}", key.domain, key.record_type);
        } else {
            debug!("CACHE MISS (join) {} {:?}", key.domain, key.record_type);
        }

        let upstream_result = match timeout(self.config.upstream_timeout, flight).await {
            Ok(result) => result,
            Err(_) => {
                warn!("UPSTREAM TIMEOUT {} {:?}", key.domain, key.record_type);
                None
            }
        };

        if let Some(wire) = upstream_result {
            return respond_with(wire, request.header.id);
        }

        // A concurrent refresher may have repopulated the stale window while
        // this miss was failing.
        if let Some(stale) = self.cache.get_stale(&key) {
            self.metrics.inc("cache_hit_stale_total");
            warn!("SERVE STALE (late) {} {:?}", key.domain, key.record_type);
            self.revalidate(&key);
            return respond_with(stale, request.header.id);
        }

        pack_reply(request, ResponseCode::ServFail)
    }

    /// SWR: queue a backstop refresh and kick an immediate single-flight
    /// revalidation watched by a log-only watchdog.
    fn revalidate(&self, key: &CacheKey) {
        if self.refresh.config().enabled {
            self.refresh.enqueue(key.clone(), RefreshReason::StaleServed);
        }

        let (task, leader) = self.resolver.refresh(key);
        if !leader {
            return;
        }
        self.metrics.inc("swr_refresh_triggered_total");
        debug!("REFRESH START {} {:?}", key.domain, key.record_type);

        let watch_timeout = self.config.refresh_watch_timeout;
        let domain = key.domain.clone();
        let record_type = key.record_type;
        tokio::spawn(async move {
            // The shared flight is driven by its own task; timing out here
            // drops only this observer.
            match timeout(watch_timeout, task).await {
                Ok(Some(_)) => debug!("REFRESH OK {} {:?} (updated cache)", domain, record_type),
                Ok(None) => warn!("REFRESH FAIL {} {:?}", domain, record_type),
                Err(_) => warn!("REFRESH TIMEOUT {} {:?}", domain, record_type),
            }
        });
    }
}

fn respond_with(wire: Bytes, request_id: u16) -> Vec<u8> {
    let mut response = wire.to_vec();
    set_wire_txid(&mut response, request_id);
    response
}

fn pack_reply(request: &DNSPacket, rcode: ResponseCode) -> Vec<u8> {
    let reply = DNSPacket::reply_with_rcode(request, rcode);
    match reply.serialize() {
        Ok(wire) => wire,
        Err(e) => {
            // Sections came from a packet we parsed, so this is unreachable
            // in practice; fall back to a bare header.
            warn!("Failed to serialize {:?} reply: {}", rcode, e);
            let mut header = vec![0u8; 12];
            set_wire_txid(&mut header, request.header.id);
            header[2] = 0x80;
            header[3] = rcode.to_u8();
            header
        }
    }
}
