//! Engine configuration. Defaults are compiled in; a `.symscope.toml` at
//! the workspace root overrides fields; environment variables override the
//! file. Loading never fails — malformed files log a warning and fall back
//! to defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Directory names every L1 search excludes unless told otherwise.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    "dist",
    ".git",
    "coverage",
    "build",
    "out",
    "tmp",
    "target",
    "venv",
    ".venv",
    "test-output-*",
];

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// L1 search-pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Layer1Config {
    /// Per-job wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// Budget for the whole L1 strategy race.
    pub race_budget_ms: u64,
    /// Post-race grace window in which the losing arm may still merge.
    pub grace_ms: u64,
    /// Extended timeout ceiling for the subsequence fuzzy fallback.
    pub fuzzy_fallback_timeout_ms: u64,
    pub grep: GrepConfig,
}

impl Default for Layer1Config {
    fn default() -> Self {
        Layer1Config {
            timeout_ms: 1000,
            race_budget_ms: 1200,
            grace_ms: 120,
            fuzzy_fallback_timeout_ms: 5000,
            grep: GrepConfig::default(),
        }
    }
}

/// Settings for individual grep jobs inside the pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrepConfig {
    pub default_timeout_ms: u64,
    pub max_results: usize,
    /// Cap on concurrent search jobs. Zero means derive from host cores.
    pub max_processes: usize,
    pub exclude_patterns: Vec<String>,
}

impl Default for GrepConfig {
    fn default() -> Self {
        GrepConfig {
            default_timeout_ms: 1000,
            max_results: 200,
            max_processes: 0,
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// L2 AST settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Layer2Config {
    pub enabled: bool,
    /// Per-file parse budget in milliseconds.
    pub parse_timeout_ms: u64,
    /// Whole-layer budget in milliseconds.
    pub budget_ms: u64,
    /// Boosted budget for short seeds or precise requests.
    pub boosted_budget_ms: u64,
    pub max_candidate_files: usize,
    /// Files above this size are never parsed.
    pub max_file_size: u64,
}

impl Default for Layer2Config {
    fn default() -> Self {
        Layer2Config {
            enabled: true,
            parse_timeout_ms: 50,
            budget_ms: 75,
            boosted_budget_ms: 200,
            max_candidate_files: 10,
            max_file_size: 512 * 1024,
        }
    }
}

/// When the orchestrator hands L1 results to L2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EscalationPolicy {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub policy: EscalationPolicy,
    /// Escalate when the top L1 confidence falls below this.
    pub l1_confidence_threshold: f64,
    /// Escalate when hits spread over more than this many files (among ≤50
    /// results).
    pub l1_ambiguity_max_files: usize,
    /// Escalate when no hit's basename contains the identifier.
    pub l1_require_filename_match: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        EscalationConfig {
            policy: EscalationPolicy::Auto,
            l1_confidence_threshold: 0.75,
            l1_ambiguity_max_files: 5,
            l1_require_filename_match: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL clamp floor in seconds.
    pub min_ttl_secs: u64,
    /// TTL clamp ceiling in seconds.
    pub max_ttl_secs: u64,
    /// Identifiers warmed in the background at initialize time.
    pub warm_identifiers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            min_ttl_secs: 30,
            max_ttl_secs: 3600,
            warm_identifiers: vec![
                "main".to_string(),
                "init".to_string(),
                "config".to_string(),
                "handler".to_string(),
            ],
        }
    }
}

/// Latency targets surfaced through metrics.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PerfTargets {
    pub p95_target_ms: u64,
    pub p99_target_ms: u64,
}

impl Default for PerfTargets {
    fn default() -> Self {
        PerfTargets { p95_target_ms: 200, p99_target_ms: 1500 }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Absolute workspace root all relative paths anchor to.
    pub workspace_root: PathBuf,
    pub layer1: Layer1Config,
    pub layer2: Layer2Config,
    pub escalation: EscalationConfig,
    pub cache: CacheConfig,
    pub perf: PerfTargets,
    /// Feed explore results into an external augmentation store when set.
    pub explore_augment: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workspace_root: PathBuf::from("."),
            layer1: Layer1Config::default(),
            layer2: Layer2Config::default(),
            escalation: EscalationConfig::default(),
            cache: CacheConfig::default(),
            perf: PerfTargets::default(),
            explore_augment: false,
        }
    }
}

impl EngineConfig {
    /// Defaults anchored at `root`, then `.symscope.toml` overrides, then
    /// environment overrides.
    pub fn load(root: &Path) -> Self {
        let mut config = Self::default();
        config.workspace_root = root.to_path_buf();

        let file = root.join(".symscope.toml");
        if let Ok(raw) = std::fs::read_to_string(&file) {
            match toml::from_str::<EngineConfig>(&raw) {
                Ok(mut parsed) => {
                    parsed.workspace_root = root.to_path_buf();
                    config = parsed;
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Ignoring malformed .symscope.toml");
                }
            }
        }

        config.apply_env();
        config
    }

    /// Apply the observable environment variables on top of the current
    /// values. `WORKSPACE_ROOT` wins over `ONTOLOGY_WORKSPACE` when both are
    /// set.
    pub fn apply_env(&mut self) {
        if let Some(root) = env_path("WORKSPACE_ROOT").or_else(|| env_path("ONTOLOGY_WORKSPACE")) {
            self.workspace_root = root;
        }
        if let Some(ms) = env_u64("ENHANCED_GREP_DEFAULT_TIMEOUT_MS") {
            self.layer1.grep.default_timeout_ms = ms;
        }
        if let Some(n) = env_u64("ENHANCED_GREP_MAX_PROCESSES") {
            self.layer1.grep.max_processes = n as usize;
        }
        if std::env::var("L4_AUGMENT_EXPLORE").map(|v| v == "1" || v == "true").unwrap_or(false) {
            self.explore_augment = true;
        }
        if let Some(ms) = env_u64("PERF_P95_TARGET_MS") {
            self.perf.p95_target_ms = ms;
        }
        if let Some(ms) = env_u64("PERF_P99_TARGET_MS") {
            self.perf.p99_target_ms = ms;
        }
    }

    /// Concurrency for the search pool: configured cap, or host cores.
    pub fn pool_size(&self) -> usize {
        if self.layer1.grep.max_processes > 0 {
            self.layer1.grep.max_processes
        } else {
            std::thread::available_parallelism().map_or(4, |n| n.get())
        }
    }

    /// L2 budget for a request: boosted for short seeds and precise mode.
    pub fn layer2_budget(&self, identifier: &str, precise: bool) -> Duration {
        let ms = if precise {
            self.layer2.boosted_budget_ms
        } else if identifier.len() < 6 {
            // Short seeds produce noisier L1 output; give the validator room.
            (self.layer2.budget_ms * 2).min(self.layer2.boosted_budget_ms)
        } else {
            self.layer2.budget_ms
        };
        Duration::from_millis(ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let c = EngineConfig::default();
        assert_eq!(c.layer1.timeout_ms, 1000);
        assert_eq!(c.layer1.race_budget_ms, 1200);
        assert_eq!(c.layer1.grace_ms, 120);
        assert_eq!(c.layer2.budget_ms, 75);
        assert_eq!(c.layer2.max_candidate_files, 10);
        assert!((c.escalation.l1_confidence_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(c.escalation.l1_ambiguity_max_files, 5);
        assert_eq!(c.cache.min_ttl_secs, 30);
        assert_eq!(c.cache.max_ttl_secs, 3600);
        assert!(c.layer1.grep.exclude_patterns.iter().any(|p| p == "node_modules"));
    }

    #[test]
    fn test_partial_toml_override() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [layer2]
            budget_ms = 120
            enabled = false

            [escalation]
            policy = "always"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.layer2.budget_ms, 120);
        assert!(!parsed.layer2.enabled);
        assert_eq!(parsed.escalation.policy, EscalationPolicy::Always);
        // Untouched sections keep their defaults
        assert_eq!(parsed.layer1.timeout_ms, 1000);
    }

    #[test]
    fn test_layer2_budget_boosts() {
        let c = EngineConfig::default();
        assert_eq!(c.layer2_budget("longIdentifier", false), Duration::from_millis(75));
        assert_eq!(c.layer2_budget("ab", false), Duration::from_millis(150));
        assert_eq!(c.layer2_budget("longIdentifier", true), Duration::from_millis(200));
    }

    #[test]
    fn test_pool_size_cap() {
        let mut c = EngineConfig::default();
        c.layer1.grep.max_processes = 3;
        assert_eq!(c.pool_size(), 3);
        c.layer1.grep.max_processes = 0;
        assert!(c.pool_size() >= 1);
    }
}
