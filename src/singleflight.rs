use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::metrics::Metrics;

pub type FlightFuture<T> = Shared<BoxFuture<'static, T>>;

/// Deduplicate concurrent work per key. The first caller becomes leader and
/// registers the task; later callers share the same future. The leader's work
/// is driven by a detached task, so no caller dropping or timing out its copy
/// of the future can cancel it. The registry entry is removed exactly once,
/// when the work completes.
pub struct SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    metrics: Arc<Metrics>,
    tasks: Arc<Mutex<FxHashMap<K, FlightFuture<T>>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            tasks: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Returns the shared future for `key` and whether this caller is the
    /// leader. `factory` is only invoked when a new task is registered, and
    /// never while the registry lock is held.
    pub fn get_or_create<F, Fut>(&self, key: K, factory: F) -> (FlightFuture<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if let Some(existing) = self.live_task(&key) {
            self.metrics.inc("singleflight_dedup_total");
            return (existing, false);
        }

        let candidate: FlightFuture<T> = factory().boxed().shared();

        {
            let mut tasks = self.tasks.lock();
            // A racing leader may have registered while the factory ran.
            if let Some(existing) = tasks.get(&key) {
                if existing.peek().is_none() {
                    self.metrics.inc("singleflight_dedup_total");
                    return (existing.clone(), false);
                }
            }
            tasks.insert(key.clone(), candidate.clone());
        }

        let registry = Arc::clone(&self.tasks);
        let driver = candidate.clone();
        let registered = candidate.clone();
        tokio::spawn(async move {
            let _ = driver.await;
            let mut tasks = registry.lock();
            // A replacement registered after completion must survive this
            // cleanup.
            if let Some(current) = tasks.get(&key) {
                if FlightFuture::ptr_eq(current, &registered) {
                    tasks.remove(&key);
                }
            }
        });

        (candidate, true)
    }

    fn live_task(&self, key: &K) -> Option<FlightFuture<T>> {
        let tasks = self.tasks.lock();
        let existing = tasks.get(key)?;
        // A completed task whose cleanup has not run yet does not count as
        // live; the caller should start fresh work.
        if existing.peek().is_some() {
            return None;
        }
        Some(existing.clone())
    }

    /// Number of registered in-flight tasks (observability and tests).
    pub fn registered_len(&self) -> usize {
        self.tasks.lock().len()
    }
}
