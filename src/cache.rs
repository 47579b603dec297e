use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::dns::{
    DNSPacket,
    enums::{DNSResourceClass, DNSResourceType},
    question::DNSQuestion,
};
use crate::metrics::Metrics;

/// Hit counters saturate here instead of wrapping.
pub const HIT_SATURATION: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub domain: String,
    pub record_type: DNSResourceType,
    pub record_class: DNSResourceClass,
    /// Pre-computed hash for faster lookups
    hash: u64,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl CacheKey {
    pub fn new(
        domain: &str,
        record_type: DNSResourceType,
        record_class: DNSResourceClass,
    ) -> Self {
        // DNS names are case-insensitive; the trailing dot is presentation
        // syntax only.
        let normalized_domain = domain.trim_end_matches('.').to_lowercase();

        let mut hasher = DefaultHasher::new();
        normalized_domain.hash(&mut hasher);
        record_type.hash(&mut hasher);
        record_class.hash(&mut hasher);
        let hash = hasher.finish();

        Self {
            domain: normalized_domain,
            record_type,
            record_class,
            hash,
        }
    }

    pub fn from_question(question: &DNSQuestion) -> Self {
        Self::new(&question.domain(), question.qtype, question.qclass)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Full packed response as received from upstream; never mutated.
    pub response_wire: Bytes,
    pub expires_at: Instant,
    pub stale_until: Instant,
    pub rcode: u8,
    /// Saturating hit counter, capped at [`HIT_SATURATION`].
    pub hits: u32,
    /// Time of the most recent serve; `None` if never hit.
    pub last_hit_mono: Option<Instant>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now <= self.expires_at
    }

    pub fn is_stale_servable(&self, now: Instant) -> bool {
        self.expires_at < now && now <= self.stale_until
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheTuning {
    /// If upstream fails, how long expired answers may still be served.
    pub serve_stale_max: Duration,
    /// TTL for negative entries carrying no SOA MINIMUM.
    pub negative_ttl: Duration,
    /// Entry cap; 0 disables eviction.
    pub max_entries: usize,
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            serve_stale_max: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(60),
            max_entries: 0,
        }
    }
}

/// On-demand counts over the current store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub entries_total: usize,
    pub fresh_total: usize,
    pub expired_total: usize,
    pub stale_servable_total: usize,
    pub negative_total: usize,
    pub evictions_total: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    store: FxHashMap<CacheKey, CacheEntry>,
    /// LRU order: front is oldest, back is most recently used.
    order: Vec<CacheKey>,
    evictions: u64,
}

/// In-memory DNS cache keyed by `(qname, qtype, qclass)`, storing full wire
/// responses with a freshness deadline and a serve-stale window.
#[derive(Debug)]
pub struct DnsCache {
    tuning: CacheTuning,
    metrics: Arc<Metrics>,
    inner: Mutex<CacheInner>,
}

impl DnsCache {
    pub fn new(tuning: CacheTuning, metrics: Arc<Metrics>) -> Self {
        Self {
            tuning,
            metrics,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Serveable-as-fresh lookup. Hits update accounting and LRU position.
    pub fn get_fresh(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner.store.get(key)?;
        if !entry.is_fresh(now) {
            return None;
        }
        trace!("Fresh cache hit for {}", key.domain);
        self.record_hit(&mut inner, key, now)
    }

    /// Serveable-as-stale lookup. Same hit accounting as `get_fresh`.
    pub fn get_stale(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner.store.get(key)?;
        if !entry.is_stale_servable(now) {
            return None;
        }
        trace!("Stale cache hit for {}", key.domain);
        self.record_hit(&mut inner, key, now)
    }

    /// Read without hit accounting or LRU movement.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().store.get(key).cloned()
    }

    /// Store an upstream response. `response` is the parsed form of `wire`;
    /// the wire bytes are kept verbatim.
    pub fn put(&self, key: CacheKey, response: &DNSPacket, wire: Bytes) {
        let now = Instant::now();
        let ttl = self.compute_ttl(response);
        let expires_at = now + ttl;
        let stale_until = expires_at + self.tuning.serve_stale_max;

        debug!(
            "Caching response for {} (ttl: {}s, rcode: {})",
            key.domain,
            ttl.as_secs(),
            response.header.rcode
        );

        let entry = CacheEntry {
            response_wire: wire,
            expires_at,
            stale_until,
            rcode: response.header.rcode,
            hits: 0,
            last_hit_mono: None,
        };
        self.insert(key, entry);
    }

    /// Insert a pre-built entry. Exposed so tests and tooling can fabricate
    /// expiry states directly.
    pub fn insert_entry(&self, key: CacheKey, entry: CacheEntry) {
        self.insert(key, entry);
    }

    /// Shallow copy of all entries, for the refresh scanner. No hit
    /// accounting.
    pub fn entries_snapshot(&self) -> Vec<(CacheKey, CacheEntry)> {
        let inner = self.inner.lock();
        inner
            .store
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut snapshot = CacheStatsSnapshot {
            entries_total: inner.store.len(),
            evictions_total: inner.evictions,
            ..Default::default()
        };
        for entry in inner.store.values() {
            if entry.is_fresh(now) {
                snapshot.fresh_total += 1;
            } else if entry.is_stale_servable(now) {
                snapshot.stale_servable_total += 1;
            } else {
                snapshot.expired_total += 1;
            }
            if entry.rcode != 0 {
                snapshot.negative_total += 1;
            }
        }
        snapshot
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.store.len();
        inner.store.clear();
        inner.order.clear();
        self.metrics.set("cache_entries", 0);
        self.metrics.inc("cache_clears_total");
        debug!("Cleared {} cache entries", count);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: CacheKey, entry: CacheEntry) {
        let mut inner = self.inner.lock();
        inner.store.insert(key.clone(), entry);
        inner.order.retain(|k| k != &key);
        inner.order.push(key);
        self.evict_over_capacity(&mut inner);
        self.metrics.set("cache_entries", inner.store.len() as u64);
    }

    fn record_hit(&self, inner: &mut CacheInner, key: &CacheKey, now: Instant) -> Option<Bytes> {
        let entry = inner.store.get_mut(key)?;
        entry.hits = entry.hits.saturating_add(1).min(HIT_SATURATION);
        entry.last_hit_mono = Some(now);
        if entry.rcode != 0 {
            self.metrics.inc("negative_cache_hit_total");
        }
        let wire = entry.response_wire.clone();
        inner.order.retain(|k| k != key);
        inner.order.push(key.clone());
        Some(wire)
    }

    /// TTL policy: minimum answer TTL for positive responses, SOA MINIMUM
    /// from the authority section for negative/NODATA, configured negative
    /// TTL as the last resort.
    fn compute_ttl(&self, response: &DNSPacket) -> Duration {
        if response.header.rcode == 0 {
            if let Some(min_ttl) = response.min_answer_ttl() {
                return Duration::from_secs(min_ttl as u64);
            }
        }
        if let Some(minimum) = response.authority_soa_minimum() {
            return Duration::from_secs(minimum as u64);
        }
        self.tuning.negative_ttl
    }

    /// Two-pass eviction: drop unserveable entries oldest-first, then fall
    /// back to strict LRU.
    fn evict_over_capacity(&self, inner: &mut CacheInner) {
        if self.tuning.max_entries == 0 || inner.store.len() <= self.tuning.max_entries {
            return;
        }

        let now = Instant::now();
        let mut index = 0;
        while inner.store.len() > self.tuning.max_entries && index < inner.order.len() {
            let key = inner.order[index].clone();
            let unserveable = inner
                .store
                .get(&key)
                .map(|e| now > e.stale_until)
                .unwrap_or(true);
            if unserveable {
                inner.order.remove(index);
                inner.store.remove(&key);
                inner.evictions += 1;
                self.metrics.inc("evictions_total");
                debug!("Evicted unserveable cache entry for {}", key.domain);
            } else {
                index += 1;
            }
        }

        while inner.store.len() > self.tuning.max_entries && !inner.order.is_empty() {
            let key = inner.order.remove(0);
            inner.store.remove(&key);
            inner.evictions += 1;
            self.metrics.inc("evictions_total");
            debug!("Evicted LRU cache entry for {}", key.domain);
        }
    }
}
