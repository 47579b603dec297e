use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::CacheKey;
use crate::dns::enums::{DNSResourceClass, DNSResourceType};
use crate::metrics::Metrics;
use crate::refresh::{RefreshEngine, RefreshReason};

/// One valid `qname qtype` line; class is always IN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupItem {
    pub qname: String,
    pub qtype: DNSResourceType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupSummary {
    pub loaded: usize,
    pub invalid: usize,
    pub enqueued: usize,
}

/// Parse warmup text: one `qname qtype` per line, `#` comments and blank
/// lines skipped, qtype by name or number. Returns the valid items and the
/// count of malformed lines.
pub fn parse_warmup_source(text: &str) -> (Vec<WarmupItem>, usize) {
    let mut items = Vec::new();
    let mut invalid = 0;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 2 {
            invalid += 1;
            continue;
        }
        let qname = parts[0].trim().trim_end_matches('.').to_lowercase();
        if qname.is_empty() {
            invalid += 1;
            continue;
        }
        let Ok(qtype) = DNSResourceType::from_str(parts[1]) else {
            invalid += 1;
            continue;
        };
        items.push(WarmupItem { qname, qtype });
    }

    (items, invalid)
}

/// Enqueue the first `limit` valid items from a warmup file through the
/// refresh queue's normal duplicate/overflow accounting.
pub fn enqueue_warmup_file(
    path: &Path,
    engine: &Arc<RefreshEngine>,
    limit: usize,
    metrics: &Arc<Metrics>,
) -> std::io::Result<WarmupSummary> {
    let text = std::fs::read_to_string(path)?;
    let (items, invalid) = parse_warmup_source(&text);
    let loaded = if limit > 0 { items.len().min(limit) } else { 0 };

    metrics.add("cache_refresh_warmup_loaded_total", loaded as u64);
    metrics.add("cache_refresh_warmup_invalid_lines_total", invalid as u64);

    let mut enqueued = 0;
    for item in items.into_iter().take(loaded) {
        let key = CacheKey::new(&item.qname, item.qtype, DNSResourceClass::IN);
        if engine.enqueue(key, RefreshReason::Warmup) {
            enqueued += 1;
        }
    }

    if invalid > 0 {
        warn!("Warmup file had {} invalid lines", invalid);
    }
    info!(
        "Warmup loaded {} items from {} ({} enqueued)",
        loaded,
        path.display(),
        enqueued
    );

    Ok(WarmupSummary {
        loaded,
        invalid,
        enqueued,
    })
}
