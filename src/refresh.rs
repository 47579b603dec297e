use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, DnsCache};
use crate::metrics::Metrics;
use crate::resolver::UpstreamResolver;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshReason {
    StaleServed,
    Tick,
    Warmup,
}

impl RefreshReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshReason::StaleServed => "stale_served",
            RefreshReason::Tick => "tick",
            RefreshReason::Warmup => "warmup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
    QueueFull,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub enabled: bool,
    /// Lookahead window before expiry.
    pub ahead: Duration,
    /// Minimum hit count for an entry to qualify.
    pub popularity_threshold: u32,
    /// Zero disables the recency predicate.
    pub popularity_decay: Duration,
    pub tick: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Zero means unbounded.
    pub queue_max: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ahead: Duration::from_secs(30),
            popularity_threshold: 5,
            popularity_decay: Duration::ZERO,
            tick: Duration::from_millis(500),
            batch_size: 50,
            concurrency: 5,
            queue_max: 1024,
        }
    }
}

#[derive(Default)]
struct RefreshState {
    queue: VecDeque<(CacheKey, RefreshReason)>,
    /// Mirrors the queue; with `inflight` it prevents double-scheduling.
    queued: FxHashSet<CacheKey>,
    inflight: FxHashSet<CacheKey>,
}

/// Proactive re-resolution of popular entries nearing expiry: one scanner
/// task feeding a bounded FIFO drained by a worker pool.
pub struct RefreshEngine {
    cache: Arc<DnsCache>,
    resolver: Arc<UpstreamResolver>,
    metrics: Arc<Metrics>,
    config: RefreshConfig,
    state: Mutex<RefreshState>,
    notify: Notify,
}

impl RefreshEngine {
    pub fn new(
        cache: Arc<DnsCache>,
        resolver: Arc<UpstreamResolver>,
        metrics: Arc<Metrics>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            cache,
            resolver,
            metrics,
            config,
            state: Mutex::new(RefreshState::default()),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Spawn the scanner and worker tasks. Returns their handles; they exit
    /// on the shutdown channel.
    pub fn start(self: &Arc<Self>, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            return Vec::new();
        }

        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);
        tasks.push(tokio::spawn(
            Arc::clone(self).run_scanner(shutdown_tx.subscribe()),
        ));
        for worker_id in 0..self.config.concurrency {
            tasks.push(tokio::spawn(
                Arc::clone(self).run_worker(worker_id, shutdown_tx.subscribe()),
            ));
        }
        info!(
            "Refresh engine started ({} workers, tick {}ms)",
            self.config.concurrency,
            self.config.tick.as_millis()
        );
        tasks
    }

    /// Best-effort enqueue with duplicate and overflow accounting.
    pub fn enqueue(&self, key: CacheKey, reason: RefreshReason) -> bool {
        self.enqueue_inner(key, reason) == EnqueueOutcome::Enqueued
    }

    fn enqueue_inner(&self, key: CacheKey, reason: RefreshReason) -> EnqueueOutcome {
        let mut state = self.state.lock();
        if state.queued.contains(&key) || state.inflight.contains(&key) {
            self.metrics
                .inc("cache_refresh_dropped_total{reason=duplicate}");
            return EnqueueOutcome::Duplicate;
        }
        if self.config.queue_max > 0 && state.queue.len() >= self.config.queue_max {
            self.metrics
                .inc("cache_refresh_dropped_total{reason=queue_full}");
            return EnqueueOutcome::QueueFull;
        }
        state.queued.insert(key.clone());
        state.queue.push_back((key, reason));
        drop(state);
        self.metrics.inc("cache_refresh_enqueued_total");
        self.notify.notify_one();
        EnqueueOutcome::Enqueued
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// The hybrid gate: not yet expired, within the lookahead window,
    /// popular, and (when decay is configured) recently touched.
    pub fn gate_holds(&self, entry: &CacheEntry, now: Instant) -> bool {
        let Some(until_expiry) = entry.expires_at.checked_duration_since(now) else {
            return false;
        };
        if until_expiry > self.config.ahead {
            return false;
        }
        if entry.hits < self.config.popularity_threshold {
            return false;
        }
        if !self.config.popularity_decay.is_zero() {
            match entry.last_hit_mono {
                Some(last_hit) => {
                    if now.duration_since(last_hit) > self.config.popularity_decay {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// One scan over the cache snapshot, bounded by batch size and queue
    /// capacity.
    pub fn scan_tick(&self) {
        let now = Instant::now();
        let mut enqueued = 0usize;
        for (key, entry) in self.cache.entries_snapshot() {
            if !self.gate_holds(&entry, now) {
                continue;
            }
            match self.enqueue_inner(key, RefreshReason::Tick) {
                EnqueueOutcome::Enqueued => {
                    enqueued += 1;
                    if enqueued >= self.config.batch_size {
                        break;
                    }
                }
                EnqueueOutcome::Duplicate => {}
                EnqueueOutcome::QueueFull => break,
            }
        }
        if enqueued > 0 {
            debug!("Refresh scan enqueued {} entries", enqueued);
        }
    }

    async fn run_scanner(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.config.tick) => self.scan_tick(),
            }
        }
        debug!("Refresh scanner stopped");
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let (key, reason) = tokio::select! {
                _ = shutdown_rx.recv() => break,
                item = self.pop() => item,
            };

            self.metrics.inc("cache_refresh_started_total");

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    // Cancellation path still releases the key.
                    self.finish(&key);
                    break;
                }
                outcome = self.process(&key, reason) => {
                    self.finish(&key);
                    self.metrics.inc(match outcome {
                        RefreshOutcome::Success => {
                            "cache_refresh_completed_total{result=success}"
                        }
                        RefreshOutcome::Fail => "cache_refresh_completed_total{result=fail}",
                        RefreshOutcome::Skipped => {
                            "cache_refresh_completed_total{result=skipped}"
                        }
                    });
                }
            }
        }
        debug!("Refresh worker {} stopped", worker_id);
    }

    /// Pop the next item, moving its key from `queued` to `inflight` under
    /// one lock.
    async fn pop(&self) -> (CacheKey, RefreshReason) {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some((key, reason)) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.inflight.insert(key.clone());
                    return (key, reason);
                }
            }
            notified.await;
        }
    }

    fn finish(&self, key: &CacheKey) {
        self.state.lock().inflight.remove(key);
    }

    async fn process(&self, key: &CacheKey, reason: RefreshReason) -> RefreshOutcome {
        // Warmup targets are usually absent from the cache, so the gate does
        // not apply; scan and stale-serve items are re-checked against
        // current entry state.
        if reason != RefreshReason::Warmup {
            let now = Instant::now();
            let gate_holds = self
                .cache
                .peek(key)
                .map(|entry| self.gate_holds(&entry, now))
                .unwrap_or(false);
            if !gate_holds {
                debug!(
                    "Refresh skipped for {} (reason {})",
                    key.domain,
                    reason.as_str()
                );
                return RefreshOutcome::Skipped;
            }
        }

        debug!("Refreshing {} (reason {})", key.domain, reason.as_str());
        let (task, _leader) = self.resolver.resolve_for_refresh(key);
        match task.await {
            Some(_) => RefreshOutcome::Success,
            None => {
                warn!("Refresh failed for {} {:?}", key.domain, key.record_type);
                RefreshOutcome::Fail
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Success,
    Fail,
    Skipped,
}
