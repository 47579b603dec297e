mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bifrost::dns::DNSPacket;
use bifrost::dns::enums::DNSResourceType;
use bifrost::metrics::Metrics;
use bifrost::singleflight::SingleFlight;

use common::{BlockingUpstream, a_responder, harness, wait_until};

#[tokio::test]
async fn followers_share_the_leader_flight() {
    let metrics = Arc::new(Metrics::new());
    let sf: SingleFlight<&'static str, u64> = SingleFlight::new(Arc::clone(&metrics));
    let invocations = Arc::new(AtomicUsize::new(0));

    // Both calls happen before any await, so the first flight cannot have
    // completed when the second caller arrives.
    let (fut1, leader1) = sf.get_or_create("key", {
        let invocations = Arc::clone(&invocations);
        move || async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            42u64
        }
    });
    let (fut2, leader2) = sf.get_or_create("key", {
        let invocations = Arc::clone(&invocations);
        move || async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            42u64
        }
    });

    assert!(leader1);
    assert!(!leader2);
    assert_eq!(metrics.get("singleflight_dedup_total"), 1);

    assert_eq!(fut1.await, 42);
    assert_eq!(fut2.await, 42);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn registry_entry_is_removed_after_completion() {
    let metrics = Arc::new(Metrics::new());
    let sf: SingleFlight<&'static str, u64> = SingleFlight::new(metrics);

    let (fut, leader) = sf.get_or_create("done", || async { 7u64 });
    assert!(leader);
    assert_eq!(fut.await, 7);

    assert!(
        wait_until(|| sf.registered_len() == 0, Duration::from_millis(500)).await,
        "completed flight should be cleaned up"
    );

    // A new call after completion starts fresh work.
    let (fut2, leader2) = sf.get_or_create("done", || async { 8u64 });
    assert!(leader2);
    assert_eq!(fut2.await, 8);
}

#[tokio::test]
async fn dropping_a_follower_does_not_cancel_the_work() {
    let metrics = Arc::new(Metrics::new());
    let sf: SingleFlight<&'static str, u64> = SingleFlight::new(metrics);
    let done = Arc::new(AtomicUsize::new(0));

    let (fut, _) = sf.get_or_create("shielded", {
        let done = Arc::clone(&done);
        move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            done.fetch_add(1, Ordering::SeqCst);
            9u64
        }
    });

    // The watchdog pattern: time out on our copy of the future.
    assert!(
        tokio::time::timeout(Duration::from_millis(5), fut)
            .await
            .is_err()
    );

    // The detached driver still completes the work.
    let done = Arc::clone(&done);
    assert!(wait_until(|| done.load(Ordering::SeqCst) == 1, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn concurrent_misses_invoke_upstream_once() {
    let upstream = BlockingUpstream::new(a_responder([3, 3, 3, 3], 60));
    let h = harness(upstream.clone());

    let addr = "127.0.0.1:9999".parse().unwrap();
    let handler1 = h.handler.clone();
    let handler2 = h.handler.clone();
    let req1 = common::make_query("dedup.example.com", DNSResourceType::A, 0x0001);
    let req2 = common::make_query("dedup.example.com", DNSResourceType::A, 0x0002);

    let join1 = tokio::spawn(async move { handler1.handle(&req1, addr).await });
    let join2 = tokio::spawn(async move { handler2.handle(&req2, addr).await });

    upstream.wait_started().await;
    upstream.release();

    let resp1 = join1.await.unwrap();
    let resp2 = join2.await.unwrap();

    assert_eq!(upstream.calls(), 1);
    assert_eq!(h.metrics.get("singleflight_dedup_total"), 1);
    assert_eq!(DNSPacket::parse(&resp1).unwrap().header.id, 0x0001);
    assert_eq!(DNSPacket::parse(&resp2).unwrap().header.id, 0x0002);
    assert_eq!(
        DNSPacket::parse(&resp1).unwrap().answers[0].rdata,
        vec![3, 3, 3, 3]
    );

    // Both requests were misses against an empty cache.
    assert_eq!(h.metrics.get("cache_miss_total"), 2);

    // A later request is served from cache with no further upstream call.
    let req3 = common::make_query("dedup.example.com", DNSResourceType::A, 0x0003);
    let _ = h.handler.handle(&req3, addr).await;
    assert_eq!(upstream.calls(), 1);
    assert_eq!(h.metrics.get("cache_hit_fresh_total"), 1);
}
