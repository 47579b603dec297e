use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, DnsCache};
use crate::dns::DNSPacket;
use crate::metrics::Metrics;
use crate::singleflight::{FlightFuture, SingleFlight};
use crate::upstream::UpstreamForwarder;

/// Single-flight keyspaces. Foreground resolves and queue-driven refreshes
/// share `Resolve` so they coalesce; the stale-serve kick uses `Refresh` so
/// it can never race a foreground miss for the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FlightKey {
    Resolve(CacheKey),
    Refresh(CacheKey),
}

/// Owns the upstream transport and the cache-fill path. Both the handler and
/// the refresh engine resolve through here, deduplicated per key.
pub struct UpstreamResolver {
    upstream: Arc<dyn UpstreamForwarder>,
    cache: Arc<DnsCache>,
    metrics: Arc<Metrics>,
    singleflight: SingleFlight<FlightKey, Option<Bytes>>,
}

impl UpstreamResolver {
    pub fn new(
        upstream: Arc<dyn UpstreamForwarder>,
        cache: Arc<DnsCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let singleflight = SingleFlight::new(Arc::clone(&metrics));
        Self {
            upstream,
            cache,
            metrics,
            singleflight,
        }
    }

    /// Foreground resolve for a cache miss, forwarding the client's own
    /// query bytes. Coalesces with any concurrent resolve for the same key.
    pub fn resolve(&self, key: &CacheKey, request_wire: Bytes) -> (FlightFuture<Option<Bytes>>, bool) {
        let flight_key = FlightKey::Resolve(key.clone());
        self.singleflight.get_or_create(flight_key, || {
            Self::query_and_store(
                Arc::clone(&self.upstream),
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
                key.clone(),
                request_wire,
            )
        })
    }

    /// Queue-driven refresh: builds a fresh query but resolves under the
    /// plain cache key so a coincident foreground miss joins this work.
    pub fn resolve_for_refresh(&self, key: &CacheKey) -> (FlightFuture<Option<Bytes>>, bool) {
        let wire = self.build_refresh_query(key);
        let flight_key = FlightKey::Resolve(key.clone());
        self.singleflight.get_or_create(flight_key, || {
            Self::query_refresh(
                Arc::clone(&self.upstream),
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
                key.clone(),
                wire,
            )
        })
    }

    /// Stale-serve kick, deduplicated in its own keyspace.
    pub fn refresh(&self, key: &CacheKey) -> (FlightFuture<Option<Bytes>>, bool) {
        let wire = self.build_refresh_query(key);
        let flight_key = FlightKey::Refresh(key.clone());
        self.singleflight.get_or_create(flight_key, || {
            Self::query_refresh(
                Arc::clone(&self.upstream),
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
                key.clone(),
                wire,
            )
        })
    }

    fn build_refresh_query(&self, key: &CacheKey) -> Option<Bytes> {
        let id = rand::rng().random::<u16>();
        let query = DNSPacket::new_query(id, &key.domain, key.record_type, key.record_class);
        match query.serialize() {
            Ok(wire) => Some(Bytes::from(wire)),
            Err(e) => {
                warn!("Failed to build refresh query for {}: {}", key.domain, e);
                None
            }
        }
    }

    async fn query_refresh(
        upstream: Arc<dyn UpstreamForwarder>,
        cache: Arc<DnsCache>,
        metrics: Arc<Metrics>,
        key: CacheKey,
        wire: Option<Bytes>,
    ) -> Option<Bytes> {
        let wire = wire?;
        Self::query_and_store(upstream, cache, metrics, key, wire).await
    }

    /// The one place that talks to upstream: query, parse, cache fill.
    /// Returns the raw response wire on success.
    async fn query_and_store(
        upstream: Arc<dyn UpstreamForwarder>,
        cache: Arc<DnsCache>,
        metrics: Arc<Metrics>,
        key: CacheKey,
        wire: Bytes,
    ) -> Option<Bytes> {
        let request_id = Uuid::new_v4().to_string();
        let Some(response_wire) = upstream.query(wire, &request_id).await else {
            metrics.inc("upstream_fail_total");
            warn!("UPSTREAM FAIL {} {:?}", key.domain, key.record_type);
            return None;
        };

        let response = match DNSPacket::parse(&response_wire) {
            Ok(parsed) => parsed,
            Err(e) => {
                metrics.inc("upstream_fail_total");
                warn!(
                    "UPSTREAM PARSE FAIL {} {:?}: {}",
                    key.domain, key.record_type, e
                );
                return None;
            }
        };

        cache.put(key.clone(), &response, response_wire.clone());
        debug!("UPSTREAM OK {} {:?} (cached)", key.domain, key.record_type);
        Some(response_wire)
    }
}
