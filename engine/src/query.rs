//! Query orchestration: the L1 strategy race, fuzzy fallback, token
//! normalization, narrowing and collapse, the L2 escalation gate, merge,
//! dedup, and final ordering.
//!
//! Layer failures never abort a request — each strategy error is counted
//! and absorbed, and a layer timeout reads as an empty layer result.

use crate::ast::{self, AstLayer, AstLayerOutput};
use crate::cache::{CachedPayload, ResultCache};
use crate::config::{EngineConfig, EscalationPolicy};
use crate::discovery::Discovery;
use crate::error::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::pool::SearchPool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use symscope_core::token;
use symscope_core::types::{
    Definition, EnhancedMatches, FileUri, Layer, ListOptions, MatchBucket, MatchSource,
    PerformanceMap, Position, QueryResponse, Range, Reference, ReferenceKind, SearchOptions,
    StreamingResult,
};
use symscope_core::QueryRequest;
use tokio::task::JoinSet;
use tracing::debug;

/// Collapse triggers: more distinct tokens than this, or more total hits
/// than [`COLLAPSE_MAX_HITS`], reads as ambiguous.
const COLLAPSE_MAX_TOKENS: usize = 3;
const COLLAPSE_MAX_HITS: usize = 50;

/// The ambiguity gate only fires on result sets small enough to interpret.
const AMBIGUITY_WINDOW: usize = 50;

/// Identifiers shorter than this get prefix narrowing and a smaller L2
/// candidate cap.
const SHORT_SEED_LEN: usize = 6;

/// Minimum identifier length for the subsequence fuzzy fallback.
const FUZZY_FALLBACK_MIN_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Normalized hits
// ---------------------------------------------------------------------------

/// A normalized L1 hit: 0-based location with the expanded word token.
#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub file: PathBuf,
    pub line: u32,
    pub character: u32,
    pub token: String,
    pub text: String,
    pub source: MatchSource,
    pub layer: Layer,
    pub confidence: f64,
}

impl Hit {
    fn uri(&self) -> FileUri {
        FileUri::from_path(&self.file)
    }

    fn range(&self) -> Range {
        Range::token(self.line, self.character, self.token.chars().count() as u32)
    }

    fn to_definition(&self) -> Definition {
        Definition {
            uri: self.uri(),
            range: self.range(),
            kind: token::infer_definition_kind(&self.text, &self.token),
            name: self.token.clone(),
            source: self.source,
            confidence: self.confidence,
            layer: self.layer,
            ast_validated: false,
            metadata: None,
        }
    }

    fn to_reference(&self) -> Reference {
        Reference {
            uri: self.uri(),
            range: self.range(),
            kind: infer_reference_kind(&self.text, &self.token, self.character as usize),
            name: self.token.clone(),
            source: self.source,
            confidence: self.confidence,
            layer: self.layer,
            ast_validated: false,
            metadata: None,
        }
    }
}

/// Usage-kind inference from the matched line's shape.
fn infer_reference_kind(line: &str, tok: &str, col: usize) -> ReferenceKind {
    let trimmed = line.trim_start();
    if trimmed.starts_with("import")
        || trimmed.starts_with("use ")
        || trimmed.starts_with("from ")
        || trimmed.starts_with("require")
    {
        return ReferenceKind::Import;
    }
    let after = col + tok.len();
    let rest = line.get(after..).unwrap_or("").trim_start();
    if rest.starts_with('(') {
        return ReferenceKind::Call;
    }
    if rest.starts_with('=') && !rest.starts_with("==") && !rest.starts_with("=>") {
        return ReferenceKind::Write;
    }
    ReferenceKind::Usage
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    pool: SearchPool,
    discovery: Discovery,
    ast: AstLayer,
    cache: Arc<ResultCache>,
    metrics: Arc<EngineMetrics>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        pool: SearchPool,
        discovery: Discovery,
        ast: AstLayer,
        cache: Arc<ResultCache>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Orchestrator { config, pool, discovery, ast, cache, metrics }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    // -- findDefinition -----------------------------------------------------

    pub async fn find_definition(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<Vec<Definition>>> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        let key = request.fingerprint();
        if let Some(CachedPayload::Definitions(cached)) = self.cache.get(key) {
            return Ok(respond(cached, PerformanceMap::zero(), true));
        }

        let total_start = Instant::now();
        let mut perf = PerformanceMap::zero();

        // L1 race plus fuzzy fallback.
        let l1_start = Instant::now();
        let mut matches = self.run_l1_race(&request.identifier).await;
        if matches.is_empty() && request.identifier.len() >= FUZZY_FALLBACK_MIN_LEN {
            self.fuzzy_fallback(&request.identifier, &mut matches).await;
        }
        perf.layer1 = l1_start.elapsed().as_millis() as u64;

        // Normalize, narrow, collapse.
        let mut hits = self.normalize(&matches, &request.identifier);
        hits = apply_prefix_narrowing(hits, &request.identifier);
        let ambiguous = collapse_pending(&hits);
        if ambiguous || request.precise {
            hits = dominant_token_collapse(hits, &request.identifier);
        }

        // Escalate to L2 when warranted.
        let mut l2_output = AstLayerOutput::default();
        if self.should_escalate(&hits, &request.identifier, request.precise, false) {
            let l2_start = Instant::now();
            l2_output = self.run_l2(&hits, &request.identifier, request.precise).await;
            perf.layer2 = l2_start.elapsed().as_millis() as u64;
        }

        // Merge, restrict, dedup, order.
        let candidates = distinct_tokens(&hits);
        let ast_defs = ast::validated_definitions(&l2_output, &request.identifier, &candidates);
        let mut defs = merge_definitions(&hits, ast_defs);
        if request.ast_only || request.precise {
            defs = restrict_to_validated(defs);
        }
        defs = dedup_definitions(defs);
        sort_entries(&mut defs, |d| (d.confidence, d.source, d.uri.clone(), d.range.start));
        defs.truncate(request.max_results);

        perf.total = total_start.elapsed().as_millis() as u64;
        debug!(
            identifier = request.identifier.as_str(),
            results = defs.len(),
            layer1_ms = perf.layer1,
            layer2_ms = perf.layer2,
            "findDefinition"
        );
        self.cache.insert(key, CachedPayload::Definitions(defs.clone()));
        Ok(respond(defs, perf, false))
    }

    // -- findReferences -----------------------------------------------------

    pub async fn find_references(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<Vec<Reference>>> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        let key = request.fingerprint();
        if let Some(CachedPayload::References(cached)) = self.cache.get(key) {
            return Ok(respond(cached, PerformanceMap::zero(), true));
        }

        let total_start = Instant::now();
        let mut perf = PerformanceMap::zero();

        let l1_start = Instant::now();
        let mut matches = self.run_l1_race(&request.identifier).await;
        if matches.is_empty() && request.identifier.len() >= FUZZY_FALLBACK_MIN_LEN {
            self.fuzzy_fallback(&request.identifier, &mut matches).await;
        }
        perf.layer1 = l1_start.elapsed().as_millis() as u64;

        let mut hits = self.normalize(&matches, &request.identifier);
        if !request.include_declaration {
            hits.retain(|h| !is_declaration_site(h, &request.identifier));
        }
        let ambiguous = collapse_pending(&hits);
        if ambiguous || request.precise {
            hits = dominant_token_collapse(hits, &request.identifier);
        }

        // References escalate on emptiness or ambiguity as well.
        let mut l2_output = AstLayerOutput::default();
        if self.should_escalate(
            &hits,
            &request.identifier,
            request.precise,
            hits.is_empty() || ambiguous,
        ) {
            let l2_start = Instant::now();
            l2_output = self.run_l2(&hits, &request.identifier, request.precise).await;
            perf.layer2 = l2_start.elapsed().as_millis() as u64;
        }

        let mut refs = merge_references(&hits, &l2_output);
        if request.ast_only || request.precise {
            refs = restrict_refs_to_validated(refs);
        }
        refs = dedup_references(refs);
        sort_entries(&mut refs, |r| (r.confidence, r.source, r.uri.clone(), r.range.start));
        refs.truncate(request.max_results);

        perf.total = total_start.elapsed().as_millis() as u64;
        debug!(
            identifier = request.identifier.as_str(),
            results = refs.len(),
            layer1_ms = perf.layer1,
            layer2_ms = perf.layer2,
            "findReferences"
        );
        self.cache.insert(key, CachedPayload::References(refs.clone()));
        Ok(respond(refs, perf, false))
    }

    // -- L1 race ------------------------------------------------------------

    /// Race the three content strategies against file discovery under the
    /// shared race budget. The first non-empty content strategy wins and
    /// cancels its siblings; discovery gets the post-race grace window to
    /// contribute its file set.
    pub(crate) async fn run_l1_race(&self, identifier: &str) -> EnhancedMatches {
        let start = Instant::now();
        let mut matches = EnhancedMatches::default();
        if identifier.is_empty() {
            return matches;
        }

        let layer1 = &self.config.layer1;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(layer1.race_budget_ms);
        let job_timeout = layer1.timeout_ms.min(layer1.race_budget_ms);
        let tool = if self.pool.has_external_engine() { "rg" } else { "scanner" };

        let strategies: [(MatchBucket, &str, String); 3] = [
            (MatchBucket::Exact, "exact", token::exact_pattern(identifier)),
            (MatchBucket::Fuzzy, "prefix", token::prefix_pattern(identifier)),
            (MatchBucket::Fuzzy, "suffix", token::suffix_pattern(identifier)),
        ];

        let discovery_job = self.discovery.discover_cancellable(
            identifier,
            job_timeout,
            self.config.layer2.max_candidate_files * 4,
        );
        let discovery_token = discovery_job.token();

        let mut set = JoinSet::new();
        let mut tokens = Vec::with_capacity(strategies.len());
        for (bucket, name, pattern) in strategies {
            let mut opts = SearchOptions::new(pattern, &self.config.workspace_root);
            opts.timeout_ms = job_timeout;
            opts.max_results = layer1.grep.max_results;
            opts.case_insensitive = true;
            let job = self.pool.search_cancellable(opts);
            tokens.push(job.token());
            set.spawn(async move { (bucket, name, job.join().await) });
        }

        // First non-empty strategy wins; per-strategy errors are absorbed.
        let mut winner: Option<(MatchBucket, &str, Vec<StreamingResult>)> = None;
        while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, set.join_next()).await {
            match joined {
                Ok((bucket, name, Ok(results))) if !results.is_empty() => {
                    winner = Some((bucket, name, results));
                    break;
                }
                Ok((_, _, Ok(_))) => continue,
                Ok((_, name, Err(e))) => {
                    if e.is_recoverable() {
                        debug!(strategy = name, error = %e, "L1 strategy absorbed");
                    } else {
                        self.metrics.layer1.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    continue;
                }
                Err(_) => continue,
            }
        }
        for t in &tokens {
            t.cancel();
        }
        set.abort_all();

        if let Some((bucket, name, results)) = winner {
            matches.record_tool(tool);
            matches.record_tool(name);
            matches.absorb(bucket, results);
        }

        // Post-race grace: merge discovery's candidate files if it lands in
        // time, otherwise cancel it and discard whatever arrives later.
        let grace = Duration::from_millis(layer1.grace_ms);
        match tokio::time::timeout(grace, discovery_job.join()).await {
            Ok(Ok(files)) => {
                if !files.is_empty() {
                    matches.record_tool("discovery");
                }
                for f in files {
                    matches.files.insert(f);
                }
            }
            Ok(Err(_)) => {}
            Err(_) => discovery_token.cancel(),
        }

        matches.search_time_ms = start.elapsed().as_millis() as u64;
        matches.confidence = match (!matches.exact.is_empty(), !matches.fuzzy.is_empty()) {
            (true, _) => 0.9,
            (false, true) => 0.6,
            _ => 0.0,
        };
        matches
    }

    /// Subsequence retry under the extended timeout, tagged `async-layer1`.
    async fn fuzzy_fallback(&self, identifier: &str, matches: &mut EnhancedMatches) {
        let mut opts = SearchOptions::new(
            token::subsequence_pattern(identifier),
            &self.config.workspace_root,
        );
        opts.timeout_ms = self.config.layer1.fuzzy_fallback_timeout_ms;
        opts.max_results = self.config.layer1.grep.max_results;
        opts.case_insensitive = true;
        match self.pool.search(&opts).await {
            Ok(results) if !results.is_empty() => {
                self.metrics.layer1.fallbacks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                matches.record_tool("subsequence");
                matches.absorb(MatchBucket::Conceptual, results);
                matches.confidence = matches.confidence.max(0.4);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "fuzzy fallback absorbed"),
        }
    }

    // -- normalization ------------------------------------------------------

    /// Token-expand every raw match and convert 1-based engine columns to
    /// 0-based. Fuzzy/conceptual hits keep their expansion even when the
    /// token does not literally contain the seed.
    fn normalize(&self, matches: &EnhancedMatches, identifier: &str) -> Vec<Hit> {
        let mut hits = Vec::with_capacity(matches.total());
        let buckets = [
            (MatchSource::Exact, Layer::Layer1, &matches.exact),
            (MatchSource::Fuzzy, Layer::Layer1, &matches.fuzzy),
            (MatchSource::Conceptual, Layer::AsyncLayer1, &matches.conceptual),
        ];
        for (source, layer, bucket) in buckets {
            for raw in bucket.iter() {
                if let Some(hit) = normalize_one(raw, identifier, source, layer) {
                    hits.push(hit);
                }
            }
        }
        hits
    }

    // -- escalation ---------------------------------------------------------

    fn should_escalate(
        &self,
        hits: &[Hit],
        identifier: &str,
        precise: bool,
        extra_trigger: bool,
    ) -> bool {
        if !self.ast.is_enabled() {
            return false;
        }
        match self.config.escalation.policy {
            EscalationPolicy::Never => false,
            EscalationPolicy::Always => true,
            EscalationPolicy::Auto => {
                if precise || extra_trigger {
                    return true;
                }
                let esc = &self.config.escalation;
                let top = hits.iter().map(|h| h.confidence).fold(0.0_f64, f64::max);
                if top < esc.l1_confidence_threshold {
                    return true;
                }
                let files: BTreeSet<&PathBuf> = hits.iter().map(|h| &h.file).collect();
                if hits.len() <= AMBIGUITY_WINDOW && files.len() > esc.l1_ambiguity_max_files {
                    return true;
                }
                if esc.l1_require_filename_match {
                    let id_lower = identifier.to_lowercase();
                    let any_basename = hits.iter().any(|h| {
                        h.file
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.to_lowercase().contains(&id_lower))
                            .unwrap_or(false)
                    });
                    if !any_basename {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Select candidate files and run the AST layer under its budget.
    async fn run_l2(&self, hits: &[Hit], identifier: &str, precise: bool) -> AstLayerOutput {
        let files = self.select_candidate_files(hits, identifier).await;
        if files.is_empty() {
            return AstLayerOutput::default();
        }
        let budget = self.config.layer2_budget(identifier, precise);
        self.ast.process(&files, identifier, budget).await
    }

    /// Up to N candidate files (≤10 default, ≤8 for short seeds), filename
    /// matches first, then by hit density. Falls back to a discovery sweep
    /// when L1 produced no files at all.
    async fn select_candidate_files(&self, hits: &[Hit], identifier: &str) -> BTreeSet<PathBuf> {
        let cap = if identifier.len() < SHORT_SEED_LEN {
            self.config.layer2.max_candidate_files.min(8)
        } else {
            self.config.layer2.max_candidate_files
        };

        let mut by_file: HashMap<&PathBuf, usize> = HashMap::new();
        for h in hits {
            *by_file.entry(&h.file).or_insert(0) += 1;
        }
        let id_lower = identifier.to_lowercase();
        let mut scored: Vec<(&PathBuf, bool, usize)> = by_file
            .into_iter()
            .map(|(file, count)| {
                let name_match = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.to_lowercase().contains(&id_lower))
                    .unwrap_or(false);
                (file, name_match, count)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(b.0)));

        let mut files: BTreeSet<PathBuf> =
            scored.into_iter().take(cap).map(|(f, _, _)| f.clone()).collect();

        if files.is_empty() {
            let mut opts = ListOptions::new(&self.config.workspace_root);
            opts.includes = vec![format!("**/*{identifier}*")];
            opts.timeout_ms = self.config.layer1.grep.default_timeout_ms;
            opts.max_files = cap;
            if let Ok(found) = self.discovery.list(&opts).await {
                files.extend(found);
            }
        }
        files
    }
}

// ---------------------------------------------------------------------------
// Pure pipeline steps
// ---------------------------------------------------------------------------

fn normalize_one(
    raw: &StreamingResult,
    identifier: &str,
    source: MatchSource,
    layer: Layer,
) -> Option<Hit> {
    if raw.line == 0 {
        return None;
    }
    let line0 = (raw.line - 1) as u32;
    let col0 = raw.column.unwrap_or(1).saturating_sub(1) as usize;

    let (start, tok) = match token::expand_token(&raw.text, col0) {
        Some((s, e)) => {
            let expanded = &raw.text[s..e];
            if expanded.to_lowercase().contains(&identifier.to_lowercase()) {
                (s, expanded.to_string())
            } else if let Some((ns, nt)) =
                token::nearest_token_containing(&raw.text, col0, identifier)
            {
                (ns, nt.to_string())
            } else if let Some((ns, nt)) =
                token::nearest_token_subsequence(&raw.text, col0, identifier)
            {
                // Typo seeds land on the token that carries them.
                (ns, nt.to_string())
            } else {
                (s, expanded.to_string())
            }
        }
        None => {
            let (ns, nt) = token::nearest_token_containing(&raw.text, col0, identifier)?;
            (ns, nt.to_string())
        }
    };

    // L1 scoring: base 0.5 plus boundary/case/filename bonuses.
    let mut confidence: f64 = 0.5;
    if tok == identifier {
        confidence += 0.25;
    }
    if raw.text.contains(identifier) {
        confidence += 0.05;
    }
    if raw
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_lowercase().contains(&identifier.to_lowercase()))
        .unwrap_or(false)
    {
        confidence += 0.05;
    }

    Some(Hit {
        file: raw.file.clone(),
        line: line0,
        character: start as u32,
        token: tok,
        text: raw.text.clone(),
        source,
        layer,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

/// Short seeds: apply a prefix filter when it keeps at least one hit while
/// actually shrinking the set.
fn apply_prefix_narrowing(hits: Vec<Hit>, identifier: &str) -> Vec<Hit> {
    if identifier.len() >= SHORT_SEED_LEN || hits.is_empty() {
        return hits;
    }
    let id_lower = identifier.to_lowercase();
    let narrowed: Vec<Hit> =
        hits.iter().filter(|h| h.token.to_lowercase().starts_with(&id_lower)).cloned().collect();
    if !narrowed.is_empty() && narrowed.len() < hits.len() {
        narrowed
    } else {
        hits
    }
}

fn distinct_tokens(hits: &[Hit]) -> Vec<String> {
    let set: BTreeSet<String> = hits.iter().map(|h| h.token.clone()).collect();
    set.into_iter().collect()
}

/// Does the hit set look ambiguous enough to collapse?
fn collapse_pending(hits: &[Hit]) -> bool {
    let tokens: BTreeSet<String> = hits.iter().map(|h| h.token.to_lowercase()).collect();
    tokens.len() > COLLAPSE_MAX_TOKENS || hits.len() > COLLAPSE_MAX_HITS
}

/// Keep only hits carrying the most frequent token. Ties prefer the seed
/// itself, then the lexicographically first token.
fn dominant_token_collapse(hits: Vec<Hit>, identifier: &str) -> Vec<Hit> {
    if hits.is_empty() {
        return hits;
    }
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for h in &hits {
        *counts.entry(h.token.to_lowercase()).or_insert(0) += 1;
    }
    let id_lower = identifier.to_lowercase();
    let dominant = counts
        .iter()
        .max_by(|(ta, ca), (tb, cb)| {
            ca.cmp(cb)
                .then_with(|| (ta.as_str() == id_lower).cmp(&(tb.as_str() == id_lower)))
                .then_with(|| tb.cmp(ta))
        })
        .map(|(t, _)| t.clone())
        .unwrap_or_default();
    hits.into_iter().filter(|h| h.token.to_lowercase() == dominant).collect()
}

/// A reference hit sitting on its own declaration line. Only explicit
/// declaring keywords count — call-shaped lines (`Foo();`) stay references.
fn is_declaration_site(hit: &Hit, identifier: &str) -> bool {
    if !hit.token.eq_ignore_ascii_case(identifier) {
        return false;
    }
    matches!(
        token::infer_definition_kind(&hit.text, &hit.token),
        symscope_core::types::DefinitionKind::Function
            | symscope_core::types::DefinitionKind::Class
            | symscope_core::types::DefinitionKind::Interface
            | symscope_core::types::DefinitionKind::Type
    )
}

/// Merge keyed by `(uri, line, character)`. L2 entries win their key,
/// boosting confidence over the L1 version; unmatched L2 entries append.
fn merge_definitions(hits: &[Hit], ast_defs: Vec<Definition>) -> Vec<Definition> {
    let mut merged: BTreeMap<(FileUri, u32, u32), Definition> = BTreeMap::new();
    for hit in hits {
        let def = hit.to_definition();
        let key = (def.uri.clone(), def.range.start.line, def.range.start.character);
        merged.entry(key).or_insert(def);
    }
    for ast_def in ast_defs {
        let key =
            (ast_def.uri.clone(), ast_def.range.start.line, ast_def.range.start.character);
        match merged.get_mut(&key) {
            Some(existing) => {
                let boosted = (existing.confidence + 0.15).max(ast_def.confidence).min(1.0);
                let source = existing.source;
                *existing = Definition { confidence: boosted, source, ..ast_def };
            }
            None => {
                merged.insert(key, ast_def);
            }
        }
    }
    merged.into_values().collect()
}

/// Validate each L1 reference against L2 nodes; fall back to the raw entry
/// when no node on the line admits it.
fn merge_references(hits: &[Hit], l2: &AstLayerOutput) -> Vec<Reference> {
    let mut refs: Vec<Reference> = Vec::with_capacity(hits.len());
    for hit in hits {
        match ast::validate_reference(l2, &hit.file, hit.line, hit.character, &hit.token) {
            Some(mut validated) => {
                validated.source = hit.source;
                refs.push(validated);
            }
            None => refs.push(hit.to_reference()),
        }
    }
    refs
}

fn restrict_to_validated(defs: Vec<Definition>) -> Vec<Definition> {
    let validated: Vec<Definition> = defs.iter().filter(|d| d.ast_validated).cloned().collect();
    if !validated.is_empty() {
        return validated;
    }
    // No AST confirmation anywhere: fall back to the single best L1 entry.
    defs.into_iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
        .into_iter()
        .collect()
}

fn restrict_refs_to_validated(refs: Vec<Reference>) -> Vec<Reference> {
    let validated: Vec<Reference> = refs.iter().filter(|r| r.ast_validated).cloned().collect();
    if !validated.is_empty() {
        return validated;
    }
    refs.into_iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
        .into_iter()
        .collect()
}

/// Dedup by `(uri, line, lowercased name)` keeping the AST-validated entry
/// with the highest confidence.
fn dedup_definitions(defs: Vec<Definition>) -> Vec<Definition> {
    let mut groups: BTreeMap<(FileUri, u32, String), Definition> = BTreeMap::new();
    for def in defs {
        let key = (def.uri.clone(), def.range.start.line, def.name.to_lowercase());
        match groups.get_mut(&key) {
            Some(existing) => {
                let replace = (def.ast_validated, def.confidence)
                    > (existing.ast_validated, existing.confidence);
                if replace {
                    *existing = def;
                }
            }
            None => {
                groups.insert(key, def);
            }
        }
    }
    groups.into_values().collect()
}

fn dedup_references(refs: Vec<Reference>) -> Vec<Reference> {
    let mut groups: BTreeMap<(FileUri, u32, String), Reference> = BTreeMap::new();
    for r in refs {
        let key = (r.uri.clone(), r.range.start.line, r.name.to_lowercase());
        match groups.get_mut(&key) {
            Some(existing) => {
                if (r.ast_validated, r.confidence) > (existing.ast_validated, existing.confidence) {
                    *existing = r;
                }
            }
            None => {
                groups.insert(key, r);
            }
        }
    }
    groups.into_values().collect()
}

/// Final ordering: confidence desc, source priority desc, then location.
fn sort_entries<T, F>(entries: &mut [T], key: F)
where
    F: Fn(&T) -> (f64, MatchSource, FileUri, Position),
{
    entries.sort_by(|a, b| {
        let (ca, sa, ua, pa) = key(a);
        let (cb, sb, ub, pb) = key(b);
        cb.partial_cmp(&ca)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| sb.priority().cmp(&sa.priority()))
            .then_with(|| ua.cmp(&ub))
            .then_with(|| pa.cmp(&pb))
    });
}

// ---------------------------------------------------------------------------
// Response assembly
// ---------------------------------------------------------------------------

pub(crate) fn respond<T>(data: T, performance: PerformanceMap, cache_hit: bool) -> QueryResponse<T> {
    QueryResponse {
        data,
        performance,
        request_id: uuid::Uuid::new_v4().to_string(),
        cache_hit,
        timestamp: now_ms(),
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
