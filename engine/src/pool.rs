//! L1 regex search pool.
//!
//! Runs line-oriented regex searches over a directory tree with a strict
//! per-call wall-clock budget and in-flight cancellation. Prefers an
//! external `rg` binary spawned with structured argv (never a shell); falls
//! back to an in-process scanner built on `ignore` + `regex` when the
//! binary is missing or refuses to spawn. Jobs queue on a semaphore sized
//! from host concurrency.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use symscope_core::types::{ListOptions, SearchOptions, StreamingResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

/// Base confidence attached to raw L1 matches before orchestrator scoring.
const BASE_CONFIDENCE: f64 = 0.5;

/// Confidence attached to context rows, which carry no match of their own.
const CONTEXT_CONFIDENCE: f64 = 0.3;

/// Channel depth for streamed results; the consumer polling the receiver is
/// the backpressure.
const STREAM_DEPTH: usize = 256;

/// Files larger than this are skipped by the in-process scanner.
const SCANNER_MAX_FILE: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Explicit cancel handle for an in-flight search. Cancelling is idempotent;
/// results that arrive after cancel are discarded by the job, not the
/// caller.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelToken { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned search job plus its cancel handle.
pub struct CancellableSearch {
    handle: tokio::task::JoinHandle<EngineResult<Vec<StreamingResult>>>,
    cancel: CancelToken,
}

impl CancellableSearch {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Await the job. A cancelled job resolves to an empty list.
    pub async fn join(self) -> EngineResult<Vec<StreamingResult>> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Internal(format!("search job panicked: {e}"))),
        }
    }
}

/// A spawned file-listing job plus its cancel handle.
pub struct CancellableList {
    handle: tokio::task::JoinHandle<EngineResult<Vec<PathBuf>>>,
    cancel: CancelToken,
}

impl CancellableList {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> EngineResult<Vec<PathBuf>> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Internal(format!("list job panicked: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Shared search pool. Cheap to clone; all clones share the job queue.
#[derive(Clone)]
pub struct SearchPool {
    jobs: Arc<Semaphore>,
    external: Option<Arc<PathBuf>>,
    default_excludes: Arc<Vec<String>>,
    metrics: Arc<EngineMetrics>,
}

impl SearchPool {
    pub fn new(config: &EngineConfig, metrics: Arc<EngineMetrics>) -> Self {
        let external = detect_external_engine();
        match &external {
            Some(path) => debug!(engine = %path.display(), "Using external search engine"),
            None => debug!("No external search engine found, using in-process scanner"),
        }
        SearchPool {
            jobs: Arc::new(Semaphore::new(config.pool_size())),
            external: external.map(Arc::new),
            default_excludes: Arc::new(config.layer1.grep.exclude_patterns.clone()),
            metrics,
        }
    }

    /// Pool with the external engine disabled, for tests and degraded hosts.
    pub fn in_process_only(config: &EngineConfig, metrics: Arc<EngineMetrics>) -> Self {
        let mut pool = Self::new(config, metrics);
        pool.external = None;
        pool
    }

    pub fn has_external_engine(&self) -> bool {
        self.external.is_some()
    }

    /// Blocking-style search: run one job to completion and collect results.
    pub async fn search(&self, opts: &SearchOptions) -> EngineResult<Vec<StreamingResult>> {
        let token = CancelToken::new();
        self.run_collect(opts.clone(), token).await
    }

    /// Spawn a search that can be cancelled mid-flight.
    pub fn search_cancellable(&self, opts: SearchOptions) -> CancellableSearch {
        let token = CancelToken::new();
        let pool = self.clone();
        let job_token = token.clone();
        let handle = tokio::spawn(async move { pool.run_collect(opts, job_token).await });
        CancellableSearch { handle, cancel: token }
    }

    /// Streaming search: results are delivered as they arrive. Dropping the
    /// receiver or cancelling the token stops the job.
    pub fn search_stream(
        &self,
        opts: SearchOptions,
    ) -> (mpsc::Receiver<StreamingResult>, CancelToken) {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let token = CancelToken::new();
        let pool = self.clone();
        let job_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.run_job(&opts, job_token, tx).await {
                if !matches!(e, EngineError::LayerTimeout { .. }) {
                    debug!(error = %e, "streaming search ended with error");
                }
            }
        });
        (rx, token)
    }

    /// List candidate files under include/exclude globs and max-depth.
    pub async fn list_files(&self, opts: &ListOptions) -> EngineResult<Vec<PathBuf>> {
        let token = CancelToken::new();
        self.run_list(opts.clone(), token).await
    }

    pub fn list_files_cancellable(&self, opts: ListOptions) -> CancellableList {
        let token = CancelToken::new();
        let pool = self.clone();
        let job_token = token.clone();
        let handle = tokio::spawn(async move { pool.run_list(opts, job_token).await });
        CancellableList { handle, cancel: token }
    }

    // -- job execution ------------------------------------------------------

    async fn run_collect(
        &self,
        opts: SearchOptions,
        token: CancelToken,
    ) -> EngineResult<Vec<StreamingResult>> {
        let (tx, mut rx) = mpsc::channel(STREAM_DEPTH);
        let pool = self.clone();
        let job_token = token.clone();
        let job_opts = opts.clone();
        let job = tokio::spawn(async move { pool.run_job(&job_opts, job_token, tx).await });

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        let outcome = match job.await {
            Ok(outcome) => outcome,
            Err(e) => return Err(EngineError::Internal(format!("search job panicked: {e}"))),
        };
        if token.is_cancelled() {
            // In-flight results received after cancel are discarded.
            self.metrics.layer1.cancellations.fetch_add(1, Ordering::Relaxed);
            return Ok(Vec::new());
        }
        outcome?;
        Ok(results)
    }

    /// One pool job: queue on the semaphore, run the engine, stream results.
    async fn run_job(
        &self,
        opts: &SearchOptions,
        token: CancelToken,
        tx: mpsc::Sender<StreamingResult>,
    ) -> EngineResult<()> {
        opts.validate().map_err(EngineError::InvalidRequest)?;
        let _permit = self
            .jobs
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("search pool closed".into()))?;

        let start = Instant::now();
        let excludes = self.merged_excludes(opts);
        let outcome = match &self.external {
            Some(rg) => {
                match run_external(rg, opts, &excludes, &token, &tx).await {
                    Err(EngineError::LayerError { message, .. }) => {
                        // Engine missing or fork refused: fall back in-process.
                        warn!(error = %message, "external engine failed, falling back to scanner");
                        self.metrics.layer1.fallbacks.fetch_add(1, Ordering::Relaxed);
                        run_scanner(opts, &excludes, &token, &tx).await
                    }
                    other => other,
                }
            }
            None => run_scanner(opts, &excludes, &token, &tx).await,
        };

        self.metrics.layer1.record_search(start.elapsed().as_millis() as u64);
        match &outcome {
            Err(EngineError::LayerTimeout { .. }) => {
                self.metrics.layer1.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.metrics.layer1.errors.fetch_add(1, Ordering::Relaxed);
            }
            Ok(()) => {}
        }
        outcome
    }

    async fn run_list(&self, opts: ListOptions, token: CancelToken) -> EngineResult<Vec<PathBuf>> {
        let _permit = self
            .jobs
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("search pool closed".into()))?;

        let deadline = Instant::now() + Duration::from_millis(opts.timeout_ms.max(1));
        let cancelled = flag_for(&token);
        let excludes: Vec<String> = {
            let mut all = self.default_excludes.as_ref().clone();
            all.extend(opts.excludes.iter().cloned());
            all
        };

        let list = tokio::task::spawn_blocking(move || list_blocking(&opts, &excludes, &cancelled, deadline))
            .await
            .map_err(|e| EngineError::Internal(format!("list job panicked: {e}")))?;
        if token.is_cancelled() {
            return Ok(Vec::new());
        }
        list
    }

    fn merged_excludes(&self, opts: &SearchOptions) -> Vec<String> {
        let mut all = self.default_excludes.as_ref().clone();
        all.extend(opts.exclude_paths.iter().cloned());
        all
    }
}

/// Mirror a cancel token into an `AtomicBool` the blocking scanner can poll.
fn flag_for(token: &CancelToken) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let mut rx = token.subscribe();
    let watched = Arc::clone(&flag);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                watched.store(true, Ordering::Release);
                break;
            }
        }
    });
    flag
}

// ---------------------------------------------------------------------------
// External engine
// ---------------------------------------------------------------------------

/// Find an `rg` binary on PATH.
fn detect_external_engine() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join("rg")).find(|c| c.is_file())
}

/// Map a logical file type to the engine's `--type` vocabulary.
fn file_type_flag(file_type: &str) -> Option<&'static str> {
    match file_type {
        "js" => Some("js"),
        "ts" => Some("ts"),
        "py" => Some("py"),
        "rs" | "rust" => Some("rust"),
        "go" => Some("go"),
        "java" => Some("java"),
        _ => None,
    }
}

/// Extensions behind each logical file type, for the in-process scanner.
fn file_type_extensions(file_type: &str) -> &'static [&'static str] {
    match file_type {
        "js" => &["js", "jsx", "mjs", "cjs"],
        "ts" => &["ts", "tsx"],
        "py" => &["py", "pyi"],
        "rs" | "rust" => &["rs"],
        "go" => &["go"],
        "java" => &["java"],
        _ => &[],
    }
}

async fn run_external(
    rg: &Path,
    opts: &SearchOptions,
    excludes: &[String],
    token: &CancelToken,
    tx: &mpsc::Sender<StreamingResult>,
) -> EngineResult<()> {
    let mut cmd = Command::new(rg);
    cmd.arg("--line-number")
        .arg("--column")
        .arg("--no-heading")
        .arg("--with-filename")
        .arg("--color")
        .arg("never");
    if opts.case_insensitive {
        cmd.arg("--ignore-case");
    }
    if !opts.use_regex {
        cmd.arg("--fixed-strings");
    }
    if opts.multiline {
        cmd.arg("--multiline").arg("--multiline-dotall");
    }
    if let Some(n) = opts.context {
        cmd.arg("--context").arg(n.to_string());
    }
    if let Some(n) = opts.before_context {
        cmd.arg("--before-context").arg(n.to_string());
    }
    if let Some(n) = opts.after_context {
        cmd.arg("--after-context").arg(n.to_string());
    }
    if let Some(n) = opts.max_depth {
        cmd.arg("--max-depth").arg(n.to_string());
    }
    if let Some(t) = opts.file_type.as_deref().and_then(file_type_flag) {
        cmd.args(["--type", t]);
    }
    for pattern in excludes {
        cmd.arg("--glob").arg(format!("!**/{pattern}/**"));
    }
    cmd.arg("--max-count").arg(opts.max_results.to_string());
    cmd.arg("--regexp").arg(&opts.pattern);
    cmd.arg("--").arg(&opts.path);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::layer_error("layer1", format!("spawn failed: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::layer_error("layer1", "no stdout handle"))?;
    let mut lines = BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(opts.timeout_ms);
    let mut cancel_rx = token.subscribe();
    let mut cancel_open = true;
    let wants_context = opts.wants_context();
    let mut emitted = 0usize;

    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel_rx.borrow() => {
                        let _ = child.start_kill();
                        return Ok(());
                    }
                    Ok(()) => {}
                    // All cancel handles dropped: nobody can cancel anymore.
                    Err(_) => cancel_open = false,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.start_kill();
                return Err(EngineError::LayerTimeout { layer: "layer1", budget_ms: opts.timeout_ms });
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if let Some(result) = parse_engine_line(&raw) {
                            if tx.send(result).await.is_err() {
                                // Consumer gone: stop the engine.
                                let _ = child.start_kill();
                                return Ok(());
                            }
                            // Only matches count toward the result cap.
                            emitted += 1;
                            if emitted >= opts.max_results {
                                let _ = child.start_kill();
                                break;
                            }
                        } else if wants_context {
                            if let Some(ctx) = parse_context_line(&raw) {
                                if tx.send(ctx).await.is_err() {
                                    let _ = child.start_kill();
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = child.start_kill();
                        return Err(EngineError::layer_error("layer1", format!("read failed: {e}")));
                    }
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| EngineError::layer_error("layer1", format!("wait failed: {e}")))?;
    match status.code() {
        // 0 = matches, 1 = clean no-match, killed = we stopped it ourselves.
        Some(0) | Some(1) | None => Ok(()),
        Some(code) if emitted > 0 => {
            // Partial output followed by a nonzero exit still counts.
            debug!(code, "engine exited nonzero after emitting results");
            Ok(())
        }
        Some(code) => Err(EngineError::layer_error("layer1", format!("engine exit code {code}"))),
    }
}

/// Parse one `path:line:col:text` engine row. Returns `None` for malformed
/// rows (summaries, group separators, context rows).
fn parse_engine_line(raw: &str) -> Option<StreamingResult> {
    let mut parts = raw.splitn(4, ':');
    let file = parts.next()?;
    let line: u64 = parts.next()?.parse().ok()?;
    let column: u64 = parts.next()?.parse().ok()?;
    let text = parts.next()?;
    if file.is_empty() || line == 0 || column == 0 {
        return None;
    }
    Some(StreamingResult {
        file: PathBuf::from(file),
        line,
        column: Some(column),
        text: text.trim_end().to_string(),
        matched: None,
        confidence: BASE_CONFIDENCE,
    })
}

/// Parse a `path-line-text` context row (the engine separates context from
/// matches with dashes and omits the column). Best-effort: paths containing
/// a dash cannot be split unambiguously and are dropped.
fn parse_context_line(raw: &str) -> Option<StreamingResult> {
    let mut parts = raw.splitn(3, '-');
    let file = parts.next()?;
    let line: u64 = parts.next()?.parse().ok()?;
    let text = parts.next()?;
    if file.is_empty() || line == 0 {
        return None;
    }
    Some(StreamingResult {
        file: PathBuf::from(file),
        line,
        column: None,
        text: text.trim_end().to_string(),
        matched: None,
        confidence: CONTEXT_CONFIDENCE,
    })
}

// ---------------------------------------------------------------------------
// In-process scanner
// ---------------------------------------------------------------------------

/// Compile the exclude list into a directory-name matcher. Patterns with a
/// `*` go through globset; plain names compare directly.
struct ExcludeSet {
    names: Vec<String>,
    globs: Option<globset::GlobSet>,
}

impl ExcludeSet {
    fn build(patterns: &[String]) -> Self {
        let mut names = Vec::new();
        let mut builder = globset::GlobSetBuilder::new();
        let mut any_glob = false;
        for p in patterns {
            if p.contains('*') {
                if let Ok(glob) = globset::Glob::new(p) {
                    builder.add(glob);
                    any_glob = true;
                }
            } else {
                names.push(p.clone());
            }
        }
        let globs = if any_glob { builder.build().ok() } else { None };
        ExcludeSet { names, globs }
    }

    fn matches(&self, dir_name: &str) -> bool {
        if self.names.iter().any(|n| n.as_str() == dir_name) {
            return true;
        }
        self.globs.as_ref().map(|g| g.is_match(dir_name)).unwrap_or(false)
    }
}

async fn run_scanner(
    opts: &SearchOptions,
    excludes: &[String],
    token: &CancelToken,
    tx: &mpsc::Sender<StreamingResult>,
) -> EngineResult<()> {
    let deadline = Instant::now() + Duration::from_millis(opts.timeout_ms);
    let cancelled = flag_for(token);
    let opts = opts.clone();
    let excludes = excludes.to_vec();
    let tx = tx.clone();

    tokio::task::spawn_blocking(move || scan_blocking(&opts, &excludes, &cancelled, deadline, &tx))
        .await
        .map_err(|e| EngineError::Internal(format!("scanner panicked: {e}")))?
}

fn scan_blocking(
    opts: &SearchOptions,
    excludes: &[String],
    cancelled: &AtomicBool,
    deadline: Instant,
    tx: &mpsc::Sender<StreamingResult>,
) -> EngineResult<()> {
    let pattern = if opts.use_regex { opts.pattern.clone() } else { regex::escape(&opts.pattern) };
    let re = regex::RegexBuilder::new(&pattern)
        .case_insensitive(opts.case_insensitive)
        .multi_line(opts.multiline)
        .dot_matches_new_line(opts.multiline)
        .build()
        .map_err(|e| EngineError::layer_error("layer1", format!("bad pattern: {e}")))?;

    let exclude_set = ExcludeSet::build(excludes);
    let type_exts = opts.file_type.as_deref().map(file_type_extensions);

    let mut builder = ignore::WalkBuilder::new(&opts.path);
    if let Some(depth) = opts.max_depth {
        builder.max_depth(Some(depth));
    }
    let walker = builder
        .filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false) && exclude_set.matches(&name))
        })
        .build();

    let mut emitted = 0usize;
    for entry in walker {
        if cancelled.load(Ordering::Acquire) {
            return Ok(());
        }
        if Instant::now() > deadline {
            return Err(EngineError::LayerTimeout { layer: "layer1", budget_ms: opts.timeout_ms });
        }
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(exts) = type_exts {
            let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or("");
            if !exts.is_empty() && !exts.contains(&ext) {
                continue;
            }
        }
        if entry.metadata().map(|m| m.len() > SCANNER_MAX_FILE).unwrap_or(true) {
            continue;
        }
        let content = match std::fs::read_to_string(entry.path()) {
            Ok(c) => c,
            Err(_) => continue, // binary or unreadable
        };
        let done = if opts.multiline {
            scan_content_multiline(opts, &re, entry.path(), &content, tx, &mut emitted)?
        } else {
            scan_content_lines(opts, &re, entry.path(), &content, tx, &mut emitted)?
        };
        if done {
            return Ok(());
        }
    }
    Ok(())
}

/// Line-oriented matching with optional before/after context rows. Context
/// rows do not count toward the result cap. Returns `true` when the cap is
/// reached or the consumer is gone.
fn scan_content_lines(
    opts: &SearchOptions,
    re: &regex::Regex,
    path: &Path,
    content: &str,
    tx: &mpsc::Sender<StreamingResult>,
    emitted: &mut usize,
) -> EngineResult<bool> {
    let (before_ctx, after_ctx) = opts.context_window();
    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        let Some(m) = re.find(line) else { continue };

        for ci in idx.saturating_sub(before_ctx)..idx {
            if tx.blocking_send(context_row(path, ci, lines[ci])).is_err() {
                return Ok(true);
            }
        }
        let result = StreamingResult {
            file: path.to_path_buf(),
            line: idx as u64 + 1,
            column: Some(m.start() as u64 + 1),
            text: line.trim_end().to_string(),
            matched: Some(m.as_str().to_string()),
            confidence: BASE_CONFIDENCE,
        };
        if tx.blocking_send(result).is_err() {
            return Ok(true);
        }
        for ci in idx + 1..lines.len().min(idx + 1 + after_ctx) {
            if tx.blocking_send(context_row(path, ci, lines[ci])).is_err() {
                return Ok(true);
            }
        }

        *emitted += 1;
        if *emitted >= opts.max_results {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whole-content matching for multiline+dotall patterns. Each match is
/// reported at the line and column where it starts.
fn scan_content_multiline(
    opts: &SearchOptions,
    re: &regex::Regex,
    path: &Path,
    content: &str,
    tx: &mpsc::Sender<StreamingResult>,
    emitted: &mut usize,
) -> EngineResult<bool> {
    // Byte offset of each line start, for offset → (line, column) mapping.
    let mut starts = vec![0usize];
    starts.extend(content.match_indices('\n').map(|(i, _)| i + 1));

    for m in re.find_iter(content) {
        let line_idx = match starts.binary_search(&m.start()) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_end = starts.get(line_idx + 1).map(|e| e - 1).unwrap_or(content.len());
        let text = content[starts[line_idx]..line_end].trim_end();

        let result = StreamingResult {
            file: path.to_path_buf(),
            line: line_idx as u64 + 1,
            column: Some((m.start() - starts[line_idx]) as u64 + 1),
            text: text.to_string(),
            matched: Some(m.as_str().to_string()),
            confidence: BASE_CONFIDENCE,
        };
        if tx.blocking_send(result).is_err() {
            return Ok(true);
        }
        *emitted += 1;
        if *emitted >= opts.max_results {
            return Ok(true);
        }
    }
    Ok(false)
}

fn context_row(path: &Path, line_idx: usize, text: &str) -> StreamingResult {
    StreamingResult {
        file: path.to_path_buf(),
        line: line_idx as u64 + 1,
        column: None,
        text: text.trim_end().to_string(),
        matched: None,
        confidence: CONTEXT_CONFIDENCE,
    }
}

fn list_blocking(
    opts: &ListOptions,
    excludes: &[String],
    cancelled: &AtomicBool,
    deadline: Instant,
) -> EngineResult<Vec<PathBuf>> {
    let exclude_set = ExcludeSet::build(excludes);
    let includes = if opts.includes.is_empty() {
        None
    } else {
        let mut builder = globset::GlobSetBuilder::new();
        for g in &opts.includes {
            if let Ok(glob) = globset::Glob::new(g) {
                builder.add(glob);
            }
        }
        builder.build().ok()
    };

    let mut walker = ignore::WalkBuilder::new(&opts.path);
    if let Some(depth) = opts.max_depth {
        walker.max_depth(Some(depth));
    }
    let walker = walker
        .filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false) && exclude_set.matches(&name))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        if cancelled.load(Ordering::Acquire) || Instant::now() > deadline {
            break; // listing is best-effort under budget
        }
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if let Some(set) = &includes {
            let rel = path.strip_prefix(&opts.path).unwrap_or(path);
            if !set.is_match(rel) && !set.is_match(path) {
                continue;
            }
        }
        files.push(path.to_path_buf());
        if files.len() >= opts.max_files {
            break;
        }
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::fs;

    fn fixture_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        fs::write(
            dir.path().join("src/a.ts"),
            "export class TestClass {\n  run(): void {}\n}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("src/b.ts"),
            "import { TestClass } from './a';\nconst t = new TestClass();\n",
        )
        .unwrap();
        fs::write(dir.path().join("node_modules/dep/c.ts"), "export class TestClass {}\n").unwrap();
        dir
    }

    fn pool() -> SearchPool {
        SearchPool::in_process_only(&EngineConfig::default(), Arc::new(EngineMetrics::default()))
    }

    #[test]
    fn test_parse_engine_line() {
        let r = parse_engine_line("/tmp/a.ts:3:5:  const x = 1;").unwrap();
        assert_eq!(r.file, PathBuf::from("/tmp/a.ts"));
        assert_eq!(r.line, 3);
        assert_eq!(r.column, Some(5));
        assert_eq!(r.text, "  const x = 1;");

        assert!(parse_engine_line("garbage").is_none());
        assert!(parse_engine_line("/tmp/a.ts:notaline:5:x").is_none());
        assert!(parse_engine_line("").is_none());
    }

    #[test]
    fn test_exclude_set_globs() {
        let set = ExcludeSet::build(&[
            "node_modules".to_string(),
            "test-output-*".to_string(),
        ]);
        assert!(set.matches("node_modules"));
        assert!(set.matches("test-output-2024"));
        assert!(!set.matches("src"));
    }

    #[test]
    fn test_file_type_tables() {
        assert_eq!(file_type_flag("ts"), Some("ts"));
        assert_eq!(file_type_flag("rust"), Some("rust"));
        assert_eq!(file_type_flag("exotic"), None);
        assert!(file_type_extensions("js").contains(&"jsx"));
    }

    #[tokio::test]
    async fn test_scanner_finds_matches_and_skips_excludes() {
        let dir = fixture_tree();
        let opts = SearchOptions::new(r"\bTestClass\b", dir.path());
        let results = pool().search(&opts).await.unwrap();
        assert_eq!(results.iter().filter(|r| r.file.ends_with("src/a.ts")).count(), 1);
        assert!(results.iter().all(|r| !r.file.to_string_lossy().contains("node_modules")));
        // 1-based line/column
        let hit = results.iter().find(|r| r.file.ends_with("src/a.ts")).unwrap();
        assert_eq!(hit.line, 1);
        assert_eq!(hit.column, Some(14));
    }

    #[tokio::test]
    async fn test_search_respects_max_results() {
        let dir = fixture_tree();
        let mut opts = SearchOptions::new("TestClass", dir.path());
        opts.max_results = 1;
        let results = pool().search(&opts).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_results() {
        let dir = fixture_tree();
        let opts = SearchOptions::new("TestClass", dir.path());
        let job = pool().search_cancellable(opts);
        job.cancel();
        job.cancel(); // idempotent
        let results = job.join().await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_layer_error() {
        let dir = fixture_tree();
        let opts = SearchOptions::new("[unclosed", dir.path());
        let err = pool().search(&opts).await.unwrap_err();
        assert_eq!(err.code(), "LayerError");
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_zero_budget_times_out() {
        let dir = fixture_tree();
        let mut opts = SearchOptions::new("TestClass", dir.path());
        opts.timeout_ms = 1;
        // With an already-elapsed deadline the scanner reports a timeout
        // unless it wins the race outright; both outcomes are legal, an
        // error other than timeout is not.
        match pool().search(&opts).await {
            Ok(_) => {}
            Err(e) => assert_eq!(e.code(), "LayerTimeout"),
        }
    }

    #[tokio::test]
    async fn test_list_files_depth_and_includes() {
        let dir = fixture_tree();
        let mut opts = ListOptions::new(dir.path());
        opts.includes = vec!["**/*.ts".to_string()];
        opts.max_files = 10;
        let files = pool().list_files(&opts).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "ts"));

        opts.max_depth = Some(1);
        let files = pool().list_files(&opts).await.unwrap();
        assert!(files.is_empty(), "depth 1 sees only the root dir entries");
    }

    #[tokio::test]
    async fn test_stream_delivers_incrementally() {
        let dir = fixture_tree();
        let opts = SearchOptions::new("TestClass", dir.path());
        let (mut rx, _token) = pool().search_stream(opts);
        let mut count = 0;
        while let Some(r) = rx.recv().await {
            assert!(r.line >= 1);
            count += 1;
        }
        assert!(count >= 2);
    }

    #[test]
    fn test_parse_context_line() {
        let r = parse_context_line("/tmp/a.ts-2-  run(): void {}").unwrap();
        assert_eq!(r.file, PathBuf::from("/tmp/a.ts"));
        assert_eq!(r.line, 2);
        assert_eq!(r.column, None);
        assert_eq!(r.matched, None);
        assert!(r.confidence < BASE_CONFIDENCE);

        assert!(parse_context_line("--").is_none());
        assert!(parse_context_line("/tmp/a.ts:3:5:match row").is_none());
    }

    #[tokio::test]
    async fn test_scanner_emits_context_rows() {
        let dir = fixture_tree();
        let mut opts = SearchOptions::new(r"\bTestClass\b", dir.path());
        opts.context = Some(1);
        let results = pool().search(&opts).await.unwrap();

        let a_hits: Vec<_> = results.iter().filter(|r| r.file.ends_with("src/a.ts")).collect();
        // The line-1 match in a.ts pulls in line 2 as after-context
        assert!(a_hits.iter().any(|r| r.matched.is_some() && r.line == 1));
        let ctx = a_hits.iter().find(|r| r.matched.is_none()).expect("context row");
        assert_eq!(ctx.line, 2);
        assert_eq!(ctx.column, None);
    }

    #[tokio::test]
    async fn test_scanner_multiline_matches_across_lines() {
        let dir = fixture_tree();
        let mut opts = SearchOptions::new(r"export class TestClass \{.*run", dir.path());
        opts.multiline = true;
        let results = pool().search(&opts).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].line, 1);
        assert_eq!(results[0].column, Some(1));
        assert!(results[0].matched.as_deref().unwrap().contains('\n'));

        // The same pattern cannot match line-by-line
        opts.multiline = false;
        let results = pool().search(&opts).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_scanner_honors_max_depth() {
        let dir = fixture_tree();
        let mut opts = SearchOptions::new("TestClass", dir.path());
        // Depth 1 sees only files directly under the root; src/ is deeper
        opts.max_depth = Some(1);
        let results = pool().search(&opts).await.unwrap();
        assert!(results.is_empty());

        opts.max_depth = Some(2);
        let results = pool().search(&opts).await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn test_file_type_filter_in_scanner() {
        let dir = fixture_tree();
        fs::write(dir.path().join("src/not_code.py"), "TestClass = 1\n").unwrap();
        let mut opts = SearchOptions::new("TestClass", dir.path());
        opts.file_type = Some("py".to_string());
        let results = pool().search(&opts).await.unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.file.extension().unwrap() == "py"));
    }
}
