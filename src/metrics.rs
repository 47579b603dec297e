use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;

/// Fields included in the periodic STATS log line, in display order.
const STATS_FIELDS: &[(&str, &str)] = &[
    ("queries", "queries_total"),
    ("hit_fresh", "cache_hit_fresh_total"),
    ("hit_stale", "cache_hit_stale_total"),
    ("miss", "cache_miss_total"),
    ("negative_hit", "negative_cache_hit_total"),
    ("upstream_req", "upstream_requests_total"),
    ("upstream_fail", "upstream_fail_total"),
    ("refresh", "swr_refresh_triggered_total"),
    ("dedup", "singleflight_dedup_total"),
    ("dropped", "dropped_total"),
];

/// Counter map keyed by opaque metric names. Label-shaped suffixes such as
/// `cache_refresh_dropped_total{reason=duplicate}` are plain map keys; the
/// `/metrics` exposition renders one `name value` line per key, sorted.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: DashMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    pub fn inc(&self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &str, by: u64) {
        *self.counters.entry(key.to_string()).or_insert(0) += by;
    }

    /// Gauge-style overwrite, used for `cache_entries`.
    pub fn set(&self, key: &str, value: u64) {
        self.counters.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Text exposition: `<counter_name> <value>\n`, sorted by name.
    pub fn render_text(&self) -> String {
        let mut body = String::new();
        for (name, value) in self.snapshot() {
            let _ = writeln!(body, "{} {}", name, value);
        }
        body
    }
}

pub fn format_stats(snapshot: &BTreeMap<String, u64>) -> String {
    let parts: Vec<String> = STATS_FIELDS
        .iter()
        .map(|(label, key)| format!("{}={}", label, snapshot.get(*key).copied().unwrap_or(0)))
        .collect();
    format!("STATS {}", parts.join(" "))
}

/// Log a STATS line every `interval` while any counter is nonzero.
pub async fn periodic_stats_reporter(
    metrics: Arc<Metrics>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {
                let snapshot = metrics.snapshot();
                if snapshot.values().any(|v| *v != 0) {
                    info!("{}", format_stats(&snapshot));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_text_is_sorted() {
        let metrics = Metrics::new();
        metrics.inc("queries_total");
        metrics.add("cache_hit_fresh_total", 3);
        metrics.inc("cache_refresh_dropped_total{reason=duplicate}");

        let body = metrics.render_text();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(
            lines,
            vec![
                "cache_hit_fresh_total 3",
                "cache_refresh_dropped_total{reason=duplicate} 1",
                "queries_total 1",
            ]
        );
    }

    #[test]
    fn format_stats_defaults_missing_to_zero() {
        let metrics = Metrics::new();
        metrics.add("queries_total", 7);
        let line = format_stats(&metrics.snapshot());
        assert!(line.starts_with("STATS queries=7 hit_fresh=0"));
        assert!(line.contains("dropped=0"));
    }
}
