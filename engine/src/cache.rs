//! Result cache keyed by request fingerprints.
//!
//! TTLs derive from result quality: exact results live longest, empty
//! results expire fast, and confidence/size multipliers stretch or shrink
//! the base. Invalidation is driven by a structured per-file key index, so
//! editing a file drops exactly the results that were computed from it.

use crate::metrics::EngineMetrics;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use symscope_core::types::{Definition, FileUri, MatchSource, Reference};

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityClass {
    Exact,
    Fuzzy,
    Mixed,
    Empty,
}

/// Quality summary of a result set, input to the TTL policy.
#[derive(Debug, Clone, Copy)]
pub struct ResultQuality {
    pub class: QualityClass,
    pub avg_confidence: f64,
    pub count: usize,
}

impl ResultQuality {
    fn from_parts(sources: impl Iterator<Item = MatchSource>, confidences: &[f64]) -> Self {
        let mut any_exact = false;
        let mut any_inexact = false;
        let mut count = 0;
        for s in sources {
            count += 1;
            match s {
                MatchSource::Exact => any_exact = true,
                _ => any_inexact = true,
            }
        }
        let class = match (count, any_exact, any_inexact) {
            (0, _, _) => QualityClass::Empty,
            (_, true, false) => QualityClass::Exact,
            (_, false, true) => QualityClass::Fuzzy,
            _ => QualityClass::Mixed,
        };
        let avg_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };
        ResultQuality { class, avg_confidence, count }
    }

    pub fn of_definitions(defs: &[Definition]) -> Self {
        let confidences: Vec<f64> = defs.iter().map(|d| d.confidence).collect();
        Self::from_parts(defs.iter().map(|d| d.source), &confidences)
    }

    pub fn of_references(refs: &[Reference]) -> Self {
        let confidences: Vec<f64> = refs.iter().map(|r| r.confidence).collect();
        Self::from_parts(refs.iter().map(|r| r.source), &confidences)
    }
}

// ---------------------------------------------------------------------------
// Payload and entries
// ---------------------------------------------------------------------------

/// What the cache stores per fingerprint.
#[derive(Debug, Clone)]
pub enum CachedPayload {
    Definitions(Vec<Definition>),
    References(Vec<Reference>),
}

impl CachedPayload {
    fn quality(&self) -> ResultQuality {
        match self {
            CachedPayload::Definitions(d) => ResultQuality::of_definitions(d),
            CachedPayload::References(r) => ResultQuality::of_references(r),
        }
    }

    /// URIs that contributed to this payload, for the file index.
    fn touched_files(&self) -> Vec<String> {
        let mut uris: Vec<String> = match self {
            CachedPayload::Definitions(d) => {
                d.iter().map(|x| x.uri.as_str().to_string()).collect()
            }
            CachedPayload::References(r) => {
                r.iter().map(|x| x.uri.as_str().to_string()).collect()
            }
        };
        uris.sort();
        uris.dedup();
        uris
    }
}

struct CacheEntry {
    payload: CachedPayload,
    created_at: Instant,
    ttl: Duration,
    files: Vec<String>,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct ResultCache {
    enabled: bool,
    min_ttl: Duration,
    max_ttl: Duration,
    entries: DashMap<u64, CacheEntry>,
    file_index: DashMap<String, HashSet<u64>>,
    metrics: Arc<EngineMetrics>,
}

impl ResultCache {
    pub fn new(
        enabled: bool,
        min_ttl_secs: u64,
        max_ttl_secs: u64,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        ResultCache {
            enabled,
            min_ttl: Duration::from_secs(min_ttl_secs),
            max_ttl: Duration::from_secs(max_ttl_secs),
            entries: DashMap::new(),
            file_index: DashMap::new(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a fingerprint. Expired entries are dropped on read.
    pub fn get(&self, key: u64) -> Option<CachedPayload> {
        if !self.enabled {
            return None;
        }
        let expired = match self.entries.get(&key) {
            Some(entry) => {
                if entry.created_at.elapsed() <= entry.ttl {
                    self.metrics.cache.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(&key);
            self.metrics.cache.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.cache.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a payload under its fingerprint with a quality-derived TTL.
    pub fn insert(&self, key: u64, payload: CachedPayload) {
        if !self.enabled {
            return;
        }
        let ttl = self.ttl_for(payload.quality());
        let files = payload.touched_files();
        for uri in &files {
            self.file_index.entry(uri.clone()).or_default().insert(key);
        }
        self.entries.insert(key, CacheEntry { payload, created_at: Instant::now(), ttl, files });
        self.metrics.cache.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// TTL policy. Base by class — exact 1800 s, fuzzy 300 s, mixed 600 s,
    /// empty 60 s. Non-empty results are scaled by confidence (×2 above
    /// 0.9, ×0.5 below 0.3) and by size (×1.5 at ≥10 results, ×0.7 at ≤2),
    /// then clamped. Empty results keep their flat base so a fast retry
    /// window stays predictable.
    pub fn ttl_for(&self, quality: ResultQuality) -> Duration {
        let base_secs: f64 = match quality.class {
            QualityClass::Exact => 1800.0,
            QualityClass::Fuzzy => 300.0,
            QualityClass::Mixed => 600.0,
            QualityClass::Empty => {
                return Duration::from_secs(60).clamp(self.min_ttl, self.max_ttl);
            }
        };
        let mut secs = base_secs;
        if quality.avg_confidence > 0.9 {
            secs *= 2.0;
        } else if quality.avg_confidence < 0.3 {
            secs *= 0.5;
        }
        if quality.count >= 10 {
            secs *= 1.5;
        } else if quality.count <= 2 {
            secs *= 0.7;
        }
        Duration::from_secs_f64(secs).clamp(self.min_ttl, self.max_ttl)
    }

    /// Drop every cached result that was computed from `uri`. Idempotent and
    /// safe under concurrent reads — a reader holding a stale payload clone
    /// simply finishes with it.
    pub fn invalidate_file(&self, uri: &FileUri) {
        let Some((_, keys)) = self.file_index.remove(uri.as_str()) else {
            return;
        };
        let mut removed = 0u64;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                removed += 1;
                // Drop this key from the other files' index sets too.
                for other in entry.files {
                    if other != uri.as_str() {
                        if let Some(mut set) = self.file_index.get_mut(&other) {
                            set.remove(&key);
                        }
                    }
                }
            }
        }
        if removed > 0 {
            self.metrics.cache.invalidations.fetch_add(removed, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.file_index.clear();
    }

    #[cfg(test)]
    fn insert_with_ttl(&self, key: u64, payload: CachedPayload, ttl: Duration) {
        let files = payload.touched_files();
        for uri in &files {
            self.file_index.entry(uri.clone()).or_default().insert(key);
        }
        self.entries.insert(key, CacheEntry { payload, created_at: Instant::now(), ttl, files });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use symscope_core::types::{DefinitionKind, Layer, Range};

    fn def(uri: &str, source: MatchSource, confidence: f64) -> Definition {
        Definition {
            uri: FileUri::parse(uri),
            range: Range::token(0, 0, 3),
            kind: DefinitionKind::Function,
            name: "foo".into(),
            source,
            confidence,
            layer: Layer::Layer1,
            ast_validated: false,
            metadata: None,
        }
    }

    fn cache() -> ResultCache {
        ResultCache::new(true, 30, 3600, Arc::new(EngineMetrics::default()))
    }

    fn defs(n: usize, source: MatchSource, confidence: f64) -> Vec<Definition> {
        (0..n).map(|i| def(&format!("/w/f{i}.rs"), source, confidence)).collect()
    }

    #[test]
    fn test_quality_classes() {
        assert_eq!(ResultQuality::of_definitions(&[]).class, QualityClass::Empty);
        assert_eq!(
            ResultQuality::of_definitions(&defs(3, MatchSource::Exact, 0.8)).class,
            QualityClass::Exact
        );
        assert_eq!(
            ResultQuality::of_definitions(&defs(3, MatchSource::Fuzzy, 0.8)).class,
            QualityClass::Fuzzy
        );
        let mut mixed = defs(2, MatchSource::Exact, 0.8);
        mixed.extend(defs(1, MatchSource::Fuzzy, 0.8));
        assert_eq!(ResultQuality::of_definitions(&mixed).class, QualityClass::Mixed);
    }

    #[test]
    fn test_ttl_policy_table() {
        let c = cache();
        // 5 exact results at mid confidence: flat base
        let q = ResultQuality { class: QualityClass::Exact, avg_confidence: 0.8, count: 5 };
        assert_eq!(c.ttl_for(q), Duration::from_secs(1800));

        // High confidence doubles, then the ceiling clamps
        let q = ResultQuality { class: QualityClass::Exact, avg_confidence: 0.95, count: 5 };
        assert_eq!(c.ttl_for(q), Duration::from_secs(3600));

        // Fuzzy base with small-result shrink: 300 * 0.7 = 210
        let q = ResultQuality { class: QualityClass::Fuzzy, avg_confidence: 0.5, count: 2 };
        assert_eq!(c.ttl_for(q), Duration::from_secs(210));

        // Low confidence halves mixed: 600 * 0.5 * 1.5 (12 results) = 450
        let q = ResultQuality { class: QualityClass::Mixed, avg_confidence: 0.2, count: 12 };
        assert_eq!(c.ttl_for(q), Duration::from_secs(450));

        // Empty stays at its flat 60 s
        let q = ResultQuality { class: QualityClass::Empty, avg_confidence: 0.0, count: 0 };
        assert_eq!(c.ttl_for(q), Duration::from_secs(60));

        // Floor clamp: fuzzy, low confidence, tiny set = 300*0.5*0.7 = 105
        let q = ResultQuality { class: QualityClass::Fuzzy, avg_confidence: 0.1, count: 1 };
        assert_eq!(c.ttl_for(q), Duration::from_secs(105));
    }

    #[test]
    fn test_ttl_always_within_bounds() {
        let c = cache();
        for class in [QualityClass::Exact, QualityClass::Fuzzy, QualityClass::Mixed, QualityClass::Empty] {
            for conf in [0.0, 0.2, 0.5, 0.95] {
                for count in [0usize, 1, 5, 20] {
                    let ttl = c.ttl_for(ResultQuality { class, avg_confidence: conf, count });
                    assert!(ttl >= Duration::from_secs(30) && ttl <= Duration::from_secs(3600));
                }
            }
        }
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let c = cache();
        let payload = CachedPayload::Definitions(defs(2, MatchSource::Exact, 0.9));
        c.insert(42, payload);
        match c.get(42) {
            Some(CachedPayload::Definitions(d)) => assert_eq!(d.len(), 2),
            _ => panic!("expected cached definitions"),
        }
        assert!(c.get(43).is_none());
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let c = ResultCache::new(false, 30, 3600, Arc::new(EngineMetrics::default()));
        c.insert(1, CachedPayload::Definitions(defs(1, MatchSource::Exact, 0.9)));
        assert!(c.get(1).is_none());
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_expired_entry_dropped_on_read() {
        let c = cache();
        c.insert_with_ttl(
            7,
            CachedPayload::Definitions(defs(1, MatchSource::Exact, 0.9)),
            Duration::ZERO,
        );
        assert!(c.get(7).is_none());
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_invalidate_file_is_targeted_and_idempotent() {
        let c = cache();
        c.insert(1, CachedPayload::Definitions(vec![def("/w/a.rs", MatchSource::Exact, 0.9)]));
        c.insert(2, CachedPayload::Definitions(vec![def("/w/b.rs", MatchSource::Exact, 0.9)]));
        c.insert(
            3,
            CachedPayload::Definitions(vec![
                def("/w/a.rs", MatchSource::Exact, 0.9),
                def("/w/b.rs", MatchSource::Exact, 0.9),
            ]),
        );

        let a = FileUri::parse("/w/a.rs");
        c.invalidate_file(&a);
        assert!(c.get(1).is_none());
        assert!(c.get(3).is_none(), "multi-file entries touching a.rs must go");
        assert!(c.get(2).is_some(), "unrelated entries survive");

        // Second invalidation is a no-op
        c.invalidate_file(&a);
        assert!(c.get(2).is_some());
    }

    #[test]
    fn test_references_payload() {
        let c = cache();
        let r = Reference {
            uri: FileUri::parse("/w/a.rs"),
            range: Range::token(1, 2, 3),
            kind: symscope_core::types::ReferenceKind::Call,
            name: "foo".into(),
            source: MatchSource::Exact,
            confidence: 0.9,
            layer: Layer::Layer2,
            ast_validated: true,
            metadata: None,
        };
        c.insert(9, CachedPayload::References(vec![r]));
        assert!(matches!(c.get(9), Some(CachedPayload::References(v)) if v.len() == 1));
    }
}
