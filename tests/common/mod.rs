#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use bifrost::cache::{CacheEntry, CacheKey, CacheTuning, DnsCache};
use bifrost::dns::{
    DNSPacket, DNSResource,
    enums::{DNSResourceClass, DNSResourceType},
};
use bifrost::handler::{DnsHandler, HandlerConfig};
use bifrost::metrics::Metrics;
use bifrost::refresh::{RefreshConfig, RefreshEngine};
use bifrost::resolver::UpstreamResolver;
use bifrost::upstream::UpstreamForwarder;

pub type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Scripted upstream: answers each query with the next responder, `None`
/// once the script runs out.
pub struct FakeUpstream {
    calls: AtomicUsize,
    responders: Mutex<VecDeque<Responder>>,
}

impl FakeUpstream {
    pub fn new(responders: Vec<Responder>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            responders: Mutex::new(responders.into_iter().collect()),
        })
    }

    pub fn always(responder: Responder) -> Arc<AlwaysUpstream> {
        Arc::new(AlwaysUpstream {
            calls: AtomicUsize::new(0),
            responder,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamForwarder for FakeUpstream {
    async fn query(&self, wire: Bytes, _request_id: &str) -> Option<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responder = self.responders.lock().pop_front()?;
        responder(&wire).map(Bytes::from)
    }
}

/// Same responder for every query.
pub struct AlwaysUpstream {
    calls: AtomicUsize,
    responder: Responder,
}

impl AlwaysUpstream {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamForwarder for AlwaysUpstream {
    async fn query(&self, wire: Bytes, _request_id: &str) -> Option<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(&wire).map(Bytes::from)
    }
}

/// Upstream that parks every query until released, then answers with the
/// given responder.
pub struct BlockingUpstream {
    calls: AtomicUsize,
    started_tx: watch::Sender<usize>,
    release_tx: watch::Sender<bool>,
    responder: Responder,
}

impl BlockingUpstream {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            started_tx: watch::Sender::new(0),
            release_tx: watch::Sender::new(false),
            responder,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self) {
        let mut rx = self.started_tx.subscribe();
        while *rx.borrow() == 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn release(&self) {
        self.release_tx.send_replace(true);
    }
}

#[async_trait]
impl UpstreamForwarder for BlockingUpstream {
    async fn query(&self, wire: Bytes, _request_id: &str) -> Option<Bytes> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.started_tx.send_replace(calls);
        let mut rx = self.release_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        (self.responder)(&wire).map(Bytes::from)
    }
}

pub fn make_query(qname: &str, qtype: DNSResourceType, id: u16) -> DNSPacket {
    DNSPacket::new_query(id, qname, qtype, DNSResourceClass::IN)
}

/// Reply to a query wire with a single A record.
pub fn a_response(query_wire: &[u8], ip: [u8; 4], ttl: u32) -> Option<Vec<u8>> {
    let query = DNSPacket::parse(query_wire).ok()?;
    let question = query.questions.first()?;
    let mut reply = DNSPacket {
        header: query.header.clone(),
        questions: query.questions.clone(),
        answers: Vec::new(),
        authorities: Vec::new(),
        resources: Vec::new(),
    };
    reply.header.qr = true;
    reply.header.ra = true;
    reply.answers.push(DNSResource {
        labels: question.labels.clone(),
        rtype: DNSResourceType::A,
        rclass: question.qclass,
        ttl,
        rdlength: 4,
        rdata: ip.to_vec(),
    });
    reply.serialize().ok()
}

pub fn a_responder(ip: [u8; 4], ttl: u32) -> Responder {
    Box::new(move |wire| a_response(wire, ip, ttl))
}

pub fn fail_responder() -> Responder {
    Box::new(|_| None)
}

pub fn soa_rdata(minimum: u32) -> Vec<u8> {
    let mut rdata = Vec::new();
    rdata.extend_from_slice(b"\x02ns\x07example\x03com\x00");
    rdata.extend_from_slice(b"\x05admin\x07example\x03com\x00");
    rdata.extend_from_slice(&2024010101u32.to_be_bytes());
    rdata.extend_from_slice(&3600u32.to_be_bytes());
    rdata.extend_from_slice(&1800u32.to_be_bytes());
    rdata.extend_from_slice(&604800u32.to_be_bytes());
    rdata.extend_from_slice(&minimum.to_be_bytes());
    rdata
}

/// NXDOMAIN reply with an SOA authority record carrying `minimum`.
pub fn nxdomain_response(query_wire: &[u8], minimum: u32) -> Option<Vec<u8>> {
    let query = DNSPacket::parse(query_wire).ok()?;
    let mut reply = DNSPacket {
        header: query.header.clone(),
        questions: query.questions.clone(),
        answers: Vec::new(),
        authorities: Vec::new(),
        resources: Vec::new(),
    };
    reply.header.qr = true;
    reply.header.ra = true;
    reply.header.rcode = 3;
    let rdata = soa_rdata(minimum);
    reply.authorities.push(DNSResource {
        labels: vec!["example".to_string(), "com".to_string()],
        rtype: DNSResourceType::SOA,
        rclass: DNSResourceClass::IN,
        ttl: 600,
        rdlength: rdata.len() as u16,
        rdata,
    });
    reply.serialize().ok()
}

pub fn cache_key(qname: &str, qtype: DNSResourceType) -> CacheKey {
    CacheKey::new(qname, qtype, DNSResourceClass::IN)
}

/// Pre-built entry with explicit expiry offsets relative to now. Negative
/// offsets land in the past.
pub fn entry_with_offsets(
    wire: Vec<u8>,
    expires_in: i64,
    stale_for: u64,
    rcode: u8,
    hits: u32,
) -> CacheEntry {
    let now = Instant::now();
    let expires_at = if expires_in >= 0 {
        now + Duration::from_secs(expires_in as u64)
    } else {
        now - Duration::from_secs((-expires_in) as u64)
    };
    CacheEntry {
        response_wire: Bytes::from(wire),
        expires_at,
        stale_until: expires_at + Duration::from_secs(stale_for),
        rcode,
        hits,
        last_hit_mono: None,
    }
}

pub struct Harness {
    pub metrics: Arc<Metrics>,
    pub cache: Arc<DnsCache>,
    pub resolver: Arc<UpstreamResolver>,
    pub refresh: Arc<RefreshEngine>,
    pub handler: Arc<DnsHandler>,
}

pub fn harness(upstream: Arc<dyn UpstreamForwarder>) -> Harness {
    harness_with(upstream, CacheTuning::default(), RefreshConfig::default(), None)
}

pub fn harness_with(
    upstream: Arc<dyn UpstreamForwarder>,
    tuning: CacheTuning,
    refresh_config: RefreshConfig,
    upstream_timeout: Option<Duration>,
) -> Harness {
    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(DnsCache::new(tuning, Arc::clone(&metrics)));
    let resolver = Arc::new(UpstreamResolver::new(
        upstream,
        Arc::clone(&cache),
        Arc::clone(&metrics),
    ));
    let refresh = Arc::new(RefreshEngine::new(
        Arc::clone(&cache),
        Arc::clone(&resolver),
        Arc::clone(&metrics),
        refresh_config,
    ));
    let handler = Arc::new(DnsHandler::new(
        Arc::clone(&cache),
        Arc::clone(&resolver),
        Arc::clone(&refresh),
        Arc::clone(&metrics),
        HandlerConfig {
            upstream_timeout: upstream_timeout.unwrap_or(Duration::from_secs(2)),
            refresh_watch_timeout: Duration::from_secs(5),
        },
    ));
    Harness {
        metrics,
        cache,
        resolver,
        refresh,
        handler,
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
