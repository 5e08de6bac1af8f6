//! Budget-bounded candidate-file discovery over the pool's listing mode.
//!
//! Used by the orchestrator when content search is slow or empty, and by the
//! symbol-map builder to seed its candidate set.

use crate::error::EngineResult;
use crate::pool::{CancellableList, SearchPool};
use std::path::{Path, PathBuf};
use symscope_core::types::ListOptions;

/// Include globs tried for an identifier, most specific first. Capped at
/// six per request.
const MAX_INCLUDE_GLOBS: usize = 6;

/// Extra directories discovery skips beyond the pool defaults.
const EXTENDED_EXCLUDES: &[&str] = &["__pycache__", ".cache", "vendor", ".idea", ".vscode"];

#[derive(Clone)]
pub struct Discovery {
    pool: SearchPool,
    root: PathBuf,
}

impl Discovery {
    pub fn new(pool: SearchPool, root: &Path) -> Self {
        Discovery { pool, root: root.to_path_buf() }
    }

    /// Build the listing options for an identifier-driven discovery pass.
    pub fn options_for(&self, identifier: &str, timeout_ms: u64, max_files: usize) -> ListOptions {
        let mut opts = ListOptions::new(&self.root);
        opts.timeout_ms = timeout_ms;
        opts.max_files = max_files;
        opts.excludes = EXTENDED_EXCLUDES.iter().map(|s| s.to_string()).collect();
        opts.includes = identifier_globs(identifier);
        opts
    }

    /// Cancellable listing of files whose names look related to the
    /// identifier.
    pub fn discover_cancellable(
        &self,
        identifier: &str,
        timeout_ms: u64,
        max_files: usize,
    ) -> CancellableList {
        self.pool.list_files_cancellable(self.options_for(identifier, timeout_ms, max_files))
    }

    /// One-shot listing with explicit options.
    pub async fn list(&self, opts: &ListOptions) -> EngineResult<Vec<PathBuf>> {
        self.pool.list_files(opts).await
    }

    /// Broad source-file sweep used as the symbol-map fallback seed.
    pub async fn list_source_files(&self, max_files: usize, timeout_ms: u64) -> EngineResult<Vec<PathBuf>> {
        let mut opts = ListOptions::new(&self.root);
        opts.timeout_ms = timeout_ms;
        opts.max_files = max_files;
        opts.includes = vec!["**/*.{rs,ts,tsx,js,jsx,py,go,java}".to_string()];
        self.pool.list_files(&opts).await
    }
}

/// Globs matching files likely to declare `identifier`: the name itself in
/// a few casings, then by-extension sweeps.
fn identifier_globs(identifier: &str) -> Vec<String> {
    if identifier.is_empty() {
        return vec!["**/*".to_string()];
    }
    let lower = identifier.to_lowercase();
    let snake = to_snake_case(identifier);
    let mut globs = vec![
        format!("**/{identifier}.*"),
        format!("**/{lower}.*"),
        format!("**/*{identifier}*.*"),
    ];
    if snake != lower {
        globs.push(format!("**/{snake}.*"));
        globs.push(format!("**/*{snake}*.*"));
    }
    globs.push("**/*.{rs,ts,tsx,js,jsx,py,go,java}".to_string());
    globs.truncate(MAX_INCLUDE_GLOBS);
    globs
}

fn to_snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
