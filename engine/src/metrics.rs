//! Per-component counters and latency quantiles. Each component owns its
//! metrics and callers read a consistent snapshot; there is no global
//! mutable state beyond these counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Latency reservoir
// ---------------------------------------------------------------------------

const RESERVOIR_CAP: usize = 512;

/// Bounded ring of recent latency samples, good enough for p50/p95/p99 over
/// the live window.
#[derive(Debug)]
pub struct LatencyReservoir {
    samples: Vec<u64>,
    next: usize,
    filled: bool,
}

impl LatencyReservoir {
    pub fn new() -> Self {
        LatencyReservoir { samples: Vec::with_capacity(RESERVOIR_CAP), next: 0, filled: false }
    }

    pub fn record(&mut self, millis: u64) {
        if self.samples.len() < RESERVOIR_CAP {
            self.samples.push(millis);
        } else {
            self.samples[self.next] = millis;
            self.filled = true;
        }
        self.next = (self.next + 1) % RESERVOIR_CAP;
    }

    /// Quantile over the current window; 0 when empty.
    pub fn quantile(&self, q: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn mean(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }
}

impl Default for LatencyReservoir {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Per-layer metrics
// ---------------------------------------------------------------------------

/// L1 search-pool counters.
#[derive(Debug, Default)]
pub struct SearchMetrics {
    pub searches: AtomicU64,
    pub timeouts: AtomicU64,
    pub fallbacks: AtomicU64,
    pub errors: AtomicU64,
    pub cancellations: AtomicU64,
    latency: Mutex<LatencyReservoir>,
}

impl SearchMetrics {
    pub fn record_search(&self, millis: u64) {
        self.searches.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut r) = self.latency.lock() {
            r.record(millis);
        }
    }

    fn quantiles(&self) -> Quantiles {
        Quantiles::from_reservoir(&self.latency)
    }
}

/// L2 parse counters.
#[derive(Debug, Default)]
pub struct ParseMetrics {
    pub parses: AtomicU64,
    pub errors: AtomicU64,
    pub budget_exhaustions: AtomicU64,
    latency: Mutex<LatencyReservoir>,
}

impl ParseMetrics {
    pub fn record_parse(&self, millis: u64) {
        self.parses.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut r) = self.latency.lock() {
            r.record(millis);
        }
    }

    fn quantiles(&self) -> Quantiles {
        Quantiles::from_reservoir(&self.latency)
    }
}

/// Result-cache counters. Entry count is a gauge the cache reports itself.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub insertions: AtomicU64,
    pub invalidations: AtomicU64,
    pub expirations: AtomicU64,
}

/// L4-style storage counters, live only when explore augmentation is
/// configured.
#[derive(Debug, Default)]
pub struct StorageMetrics {
    pub augment_events: AtomicU64,
}

/// All engine metrics, one instance per engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub layer1: SearchMetrics,
    pub layer2: ParseMetrics,
    pub cache: CacheMetrics,
    pub storage: StorageMetrics,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Quantiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub mean: u64,
    pub count: usize,
}

impl Quantiles {
    fn from_reservoir(lock: &Mutex<LatencyReservoir>) -> Self {
        match lock.lock() {
            Ok(r) => Quantiles {
                p50: r.quantile(0.50),
                p95: r.quantile(0.95),
                p99: r.quantile(0.99),
                mean: r.mean(),
                count: r.count(),
            },
            Err(_) => Quantiles::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Layer1Snapshot {
    pub searches: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub errors: u64,
    pub cancellations: u64,
    pub latency: Quantiles,
}

#[derive(Debug, Clone, Serialize)]
pub struct Layer2Snapshot {
    pub parses: u64,
    pub errors: u64,
    #[serde(rename = "budgetExhaustions")]
    pub budget_exhaustions: u64,
    pub latency: Quantiles,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub layer1: Layer1Snapshot,
    pub layer2: Layer2Snapshot,
    pub cache: CacheSnapshot,
    #[serde(rename = "augmentEvents", skip_serializing_if = "Option::is_none")]
    pub augment_events: Option<u64>,
}

impl EngineMetrics {
    /// Consistent-enough snapshot: counters are read relaxed; they only ever
    /// increase.
    pub fn snapshot(&self, cache_entries: usize, storage_configured: bool) -> MetricsSnapshot {
        MetricsSnapshot {
            layer1: Layer1Snapshot {
                searches: self.layer1.searches.load(Ordering::Relaxed),
                timeouts: self.layer1.timeouts.load(Ordering::Relaxed),
                fallbacks: self.layer1.fallbacks.load(Ordering::Relaxed),
                errors: self.layer1.errors.load(Ordering::Relaxed),
                cancellations: self.layer1.cancellations.load(Ordering::Relaxed),
                latency: self.layer1.quantiles(),
            },
            layer2: Layer2Snapshot {
                parses: self.layer2.parses.load(Ordering::Relaxed),
                errors: self.layer2.errors.load(Ordering::Relaxed),
                budget_exhaustions: self.layer2.budget_exhaustions.load(Ordering::Relaxed),
                latency: self.layer2.quantiles(),
            },
            cache: CacheSnapshot {
                hits: self.cache.hits.load(Ordering::Relaxed),
                misses: self.cache.misses.load(Ordering::Relaxed),
                insertions: self.cache.insertions.load(Ordering::Relaxed),
                invalidations: self.cache.invalidations.load(Ordering::Relaxed),
                expirations: self.cache.expirations.load(Ordering::Relaxed),
                entries: cache_entries,
            },
            augment_events: storage_configured
                .then(|| self.storage.augment_events.load(Ordering::Relaxed)),
        }
    }
}

// ---------------------------------------------------------------------------
// Prometheus text exposition
// ---------------------------------------------------------------------------

fn push_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
}

impl MetricsSnapshot {
    /// Render the snapshot as Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        push_counter(&mut out, "symscope_layer1_searches_total", "L1 searches executed", self.layer1.searches);
        push_counter(&mut out, "symscope_layer1_timeouts_total", "L1 budget expiries", self.layer1.timeouts);
        push_counter(
            &mut out,
            "symscope_layer1_fallbacks_total",
            "L1 in-process scanner fallbacks",
            self.layer1.fallbacks,
        );
        push_counter(&mut out, "symscope_layer1_errors_total", "L1 job failures", self.layer1.errors);
        push_counter(&mut out, "symscope_layer2_parses_total", "L2 files parsed", self.layer2.parses);
        push_counter(&mut out, "symscope_layer2_errors_total", "L2 parse failures", self.layer2.errors);
        push_counter(&mut out, "symscope_cache_hits_total", "result cache hits", self.cache.hits);
        push_counter(&mut out, "symscope_cache_misses_total", "result cache misses", self.cache.misses);
        push_counter(
            &mut out,
            "symscope_cache_invalidations_total",
            "per-file cache invalidations",
            self.cache.invalidations,
        );
        out.push_str(&format!(
            "# HELP symscope_cache_entries live cache entries\n# TYPE symscope_cache_entries gauge\nsymscope_cache_entries {}\n",
            self.cache.entries
        ));
        for (q, v) in
            [("0.5", self.layer1.latency.p50), ("0.95", self.layer1.latency.p95), ("0.99", self.layer1.latency.p99)]
        {
            out.push_str(&format!(
                "symscope_layer1_latency_ms{{quantile=\"{q}\"}} {v}\n"
            ));
        }
        for (q, v) in
            [("0.5", self.layer2.latency.p50), ("0.95", self.layer2.latency.p95), ("0.99", self.layer2.latency.p99)]
        {
            out.push_str(&format!(
                "symscope_layer2_latency_ms{{quantile=\"{q}\"}} {v}\n"
            ));
        }
        if let Some(events) = self.augment_events {
            push_counter(
                &mut out,
                "symscope_storage_augment_events_total",
                "explore augmentation events",
                events,
            );
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservoir_quantiles() {
        let mut r = LatencyReservoir::new();
        for i in 1..=100 {
            r.record(i);
        }
        assert_eq!(r.quantile(0.5), 50);
        assert_eq!(r.quantile(0.95), 95);
        assert_eq!(r.quantile(0.99), 99);
        assert_eq!(r.count(), 100);
    }

    #[test]
    fn test_reservoir_wraps() {
        let mut r = LatencyReservoir::new();
        for i in 0..(RESERVOIR_CAP as u64 + 10) {
            r.record(i);
        }
        assert_eq!(r.count(), RESERVOIR_CAP);
    }

    #[test]
    fn test_empty_reservoir() {
        let r = LatencyReservoir::new();
        assert_eq!(r.quantile(0.99), 0);
        assert_eq!(r.mean(), 0);
    }

    #[test]
    fn test_snapshot_and_prometheus() {
        let m = EngineMetrics::default();
        m.layer1.record_search(12);
        m.layer1.timeouts.fetch_add(1, Ordering::Relaxed);
        m.cache.hits.fetch_add(3, Ordering::Relaxed);
        m.layer2.record_parse(4);

        let snap = m.snapshot(7, false);
        assert_eq!(snap.layer1.searches, 1);
        assert_eq!(snap.layer1.timeouts, 1);
        assert_eq!(snap.cache.hits, 3);
        assert_eq!(snap.cache.entries, 7);
        assert!(snap.augment_events.is_none());

        let text = snap.render_prometheus();
        assert!(text.contains("symscope_layer1_searches_total 1"));
        assert!(text.contains("symscope_cache_entries 7"));
        assert!(text.contains("symscope_layer2_latency_ms{quantile=\"0.95\"}"));
        assert!(!text.contains("augment_events"));

        let snap = m.snapshot(7, true);
        assert_eq!(snap.augment_events, Some(0));
    }
}
