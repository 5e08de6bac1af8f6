use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File URIs
// ---------------------------------------------------------------------------

/// Sentinel URI for requests that carry no usable file context.
pub const GLOBAL_URI: &str = "workspace://global";

/// Canonical `file://<absolute-path>` string, or the `workspace://global`
/// sentinel when no path is known. Conversions are total — malformed input
/// degrades to the sentinel, never panics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileUri(String);

impl FileUri {
    /// The `workspace://global` sentinel.
    pub fn global() -> Self {
        FileUri(GLOBAL_URI.to_string())
    }

    /// Build from an absolute filesystem path. Relative or empty paths map
    /// to the sentinel; use [`FileUri::from_path_in`] when a workspace root
    /// is available to anchor relative paths.
    pub fn from_path(path: &Path) -> Self {
        if path.as_os_str().is_empty() || !path.is_absolute() {
            return Self::global();
        }
        FileUri(format!("file://{}", path.display()))
    }

    /// Build from a path, anchoring relative paths against `root`.
    pub fn from_path_in(root: &Path, path: &Path) -> Self {
        if path.as_os_str().is_empty() {
            return Self::global();
        }
        if path.is_absolute() {
            Self::from_path(path)
        } else {
            Self::from_path(&root.join(path))
        }
    }

    /// Parse a URI string. Accepts `file://` URIs and the sentinel verbatim;
    /// bare absolute paths are promoted to `file://` URIs; everything else
    /// (including the empty string) maps to the sentinel.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self::global();
        }
        if s == GLOBAL_URI || s.starts_with("file://") {
            return FileUri(s.to_string());
        }
        if s.starts_with('/') {
            return FileUri(format!("file://{s}"));
        }
        Self::global()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_URI
    }

    /// The filesystem path behind this URI, if any.
    pub fn to_path(&self) -> Option<PathBuf> {
        self.0.strip_prefix("file://").map(PathBuf::from)
    }

    /// Basename of the underlying path, or `""` for the sentinel.
    pub fn basename(&self) -> &str {
        self.0
            .strip_prefix("file://")
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or("")
    }
}

impl fmt::Display for FileUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Positions and ranges
// ---------------------------------------------------------------------------

/// Zero-based line/character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Position { line, character }
    }
}

/// Half-open `[start, end)` range on the character axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Range { start, end }
    }

    /// Range covering a token of `len` characters on a single line.
    pub fn token(line: u32, character: u32, len: u32) -> Self {
        Range {
            start: Position::new(line, character),
            end: Position::new(line, character + len),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos >= self.start && pos < self.end
    }
}

// ---------------------------------------------------------------------------
// Symbol classification enums
// ---------------------------------------------------------------------------

/// What kind of declaration a definition points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Variable,
    Property,
    Import,
    Export,
    Module,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::Function => "function",
            DefinitionKind::Method => "method",
            DefinitionKind::Class => "class",
            DefinitionKind::Interface => "interface",
            DefinitionKind::Type => "type",
            DefinitionKind::Variable => "variable",
            DefinitionKind::Property => "property",
            DefinitionKind::Import => "import",
            DefinitionKind::Export => "export",
            DefinitionKind::Module => "module",
        }
    }

    /// Declaration-ish kinds get a scoring bonus in the AST layer.
    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            DefinitionKind::Function
                | DefinitionKind::Method
                | DefinitionKind::Class
                | DefinitionKind::Interface
                | DefinitionKind::Type
        )
    }
}

/// How a reference uses the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Read,
    Write,
    Call,
    Import,
    Usage,
}

/// Which search strategy produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Exact,
    Fuzzy,
    Conceptual,
    Pattern,
}

impl MatchSource {
    /// Ordering weight for the final sort: exact beats pattern beats fuzzy
    /// beats conceptual.
    pub fn priority(&self) -> u8 {
        match self {
            MatchSource::Exact => 3,
            MatchSource::Pattern => 2,
            MatchSource::Fuzzy => 1,
            MatchSource::Conceptual => 0,
        }
    }
}

/// Which pipeline layer emitted the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    #[serde(rename = "layer1")]
    Layer1,
    #[serde(rename = "layer2")]
    Layer2,
    #[serde(rename = "async-layer1")]
    AsyncLayer1,
}

// ---------------------------------------------------------------------------
// Definitions and references
// ---------------------------------------------------------------------------

/// A resolved definition site. Immutable after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub uri: FileUri,
    pub range: Range,
    pub kind: DefinitionKind,
    pub name: String,
    pub source: MatchSource,
    pub confidence: f64,
    pub layer: Layer,
    #[serde(rename = "astValidated")]
    pub ast_validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// A resolved reference site. Same shape as [`Definition`] with usage kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub uri: FileUri,
    pub range: Range,
    pub kind: ReferenceKind,
    pub name: String,
    pub source: MatchSource,
    pub confidence: f64,
    pub layer: Layer,
    #[serde(rename = "astValidated")]
    pub ast_validated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// L1 search plumbing
// ---------------------------------------------------------------------------

/// Options for a single L1 content search job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub pattern: String,
    pub path: PathBuf,
    #[serde(rename = "maxResults")]
    pub max_results: usize,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "caseInsensitive")]
    pub case_insensitive: bool,
    #[serde(rename = "fileType", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(rename = "excludePaths", default)]
    pub exclude_paths: Vec<String>,
    #[serde(rename = "useRegex", default = "default_true")]
    pub use_regex: bool,
    #[serde(default)]
    pub streaming: bool,
    /// Multiline + dotall matching: patterns may span lines and `.` matches
    /// newlines.
    #[serde(default)]
    pub multiline: bool,
    #[serde(rename = "beforeContext", skip_serializing_if = "Option::is_none")]
    pub before_context: Option<usize>,
    #[serde(rename = "afterContext", skip_serializing_if = "Option::is_none")]
    pub after_context: Option<usize>,
    /// Symmetric context window; overridden per side by the before/after
    /// fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<usize>,
    #[serde(rename = "maxDepth", skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl SearchOptions {
    pub fn new(pattern: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        SearchOptions {
            pattern: pattern.into(),
            path: path.into(),
            max_results: 200,
            timeout_ms: 1000,
            case_insensitive: false,
            file_type: None,
            exclude_paths: Vec::new(),
            use_regex: true,
            streaming: false,
            multiline: false,
            before_context: None,
            after_context: None,
            context: None,
            max_depth: None,
        }
    }

    /// Effective `(before, after)` context line counts.
    pub fn context_window(&self) -> (usize, usize) {
        let before = self.before_context.or(self.context).unwrap_or(0);
        let after = self.after_context.or(self.context).unwrap_or(0);
        (before, after)
    }

    pub fn wants_context(&self) -> bool {
        let (before, after) = self.context_window();
        before > 0 || after > 0
    }

    /// `timeoutMs > 0` and `maxResults > 0` are hard invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.pattern.is_empty() {
            return Err("search pattern is empty".into());
        }
        if self.timeout_ms == 0 {
            return Err("timeoutMs must be positive".into());
        }
        if self.max_results == 0 {
            return Err("maxResults must be positive".into());
        }
        Ok(())
    }
}

/// Options for L1 file listing / discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub path: PathBuf,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(rename = "maxDepth", skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "maxFiles")]
    pub max_files: usize,
}

impl ListOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ListOptions {
            path: path.into(),
            includes: Vec::new(),
            excludes: Vec::new(),
            max_depth: None,
            timeout_ms: 1000,
            max_files: 500,
        }
    }
}

/// One streamed line match from the search engine. Line and column are
/// 1-based as reported by the engine; the orchestrator converts to 0-based
/// during normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingResult {
    pub file: PathBuf,
    pub line: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u64>,
    pub text: String,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
    pub confidence: f64,
}

/// Intra-L1 aggregate: matches bucketed by strategy plus the touched file
/// set, ready for L2 candidate selection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnhancedMatches {
    pub exact: Vec<StreamingResult>,
    pub fuzzy: Vec<StreamingResult>,
    pub conceptual: Vec<StreamingResult>,
    pub files: BTreeSet<PathBuf>,
    #[serde(rename = "searchTime")]
    pub search_time_ms: u64,
    #[serde(rename = "toolsUsed")]
    pub tools_used: Vec<String>,
    pub confidence: f64,
}

impl EnhancedMatches {
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.fuzzy.is_empty() && self.conceptual.is_empty()
    }

    pub fn total(&self) -> usize {
        self.exact.len() + self.fuzzy.len() + self.conceptual.len()
    }

    pub fn record_tool(&mut self, tool: &str) {
        if !self.tools_used.iter().any(|t| t == tool) {
            self.tools_used.push(tool.to_string());
        }
    }

    /// Absorb results into a strategy bucket, tracking touched files.
    pub fn absorb(&mut self, bucket: MatchBucket, results: Vec<StreamingResult>) {
        for r in results {
            self.files.insert(r.file.clone());
            match bucket {
                MatchBucket::Exact => self.exact.push(r),
                MatchBucket::Fuzzy => self.fuzzy.push(r),
                MatchBucket::Conceptual => self.conceptual.push(r),
            }
        }
    }

    /// All results in bucket priority order (exact first).
    pub fn all(&self) -> impl Iterator<Item = &StreamingResult> {
        self.exact.iter().chain(self.fuzzy.iter()).chain(self.conceptual.iter())
    }
}

/// Which [`EnhancedMatches`] bucket a strategy feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBucket {
    Exact,
    Fuzzy,
    Conceptual,
}

// ---------------------------------------------------------------------------
// Workspace edits
// ---------------------------------------------------------------------------

/// A single text replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

/// Per-file edit lists keyed by URI. Edits within a file are kept pairwise
/// non-overlapping; duplicate `(line, character)` starts are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEdit {
    pub changes: BTreeMap<FileUri, Vec<TextEdit>>,
}

impl WorkspaceEdit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edit, dropping duplicates that start at an already-recorded
    /// `(line, character)` in the same file.
    pub fn push(&mut self, uri: FileUri, edit: TextEdit) -> bool {
        let edits = self.changes.entry(uri).or_default();
        if edits.iter().any(|e| e.range.start == edit.range.start) {
            return false;
        }
        edits.push(edit);
        true
    }

    /// Sort each file's edits by start position. Call once after building.
    pub fn normalize(&mut self) {
        for edits in self.changes.values_mut() {
            edits.sort_by_key(|e| e.range.start);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.values().all(|v| v.is_empty())
    }

    pub fn total_edits(&self) -> usize {
        self.changes.values().map(|v| v.len()).sum()
    }

    /// Verify the per-file non-overlap invariant. Assumes [`Self::normalize`]
    /// has run.
    pub fn edits_disjoint(&self) -> bool {
        for edits in self.changes.values() {
            for pair in edits.windows(2) {
                if pair[1].range.start < pair[0].range.end {
                    return false;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Symbol maps
// ---------------------------------------------------------------------------

/// One located entry inside a [`SymbolMap`] list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub uri: FileUri,
    pub range: Range,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Everything known about one identifier over a bounded candidate set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolMap {
    pub identifier: String,
    pub files: BTreeSet<String>,
    pub declarations: Vec<SymbolEntry>,
    pub references: Vec<SymbolEntry>,
    pub imports: Vec<SymbolEntry>,
    pub exports: Vec<SymbolEntry>,
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// Wall-clock milliseconds spent per layer. Layers 3–5 are reserved keys
/// that always report zero in this engine; adapters rely on the full shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceMap {
    pub layer1: u64,
    pub layer2: u64,
    pub layer3: u64,
    pub layer4: u64,
    pub layer5: u64,
    pub total: u64,
}

impl PerformanceMap {
    /// All-zero map, used for cache hits.
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Envelope carried by every operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse<T> {
    pub data: T,
    pub performance: PerformanceMap,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "cacheHit")]
    pub cache_hit: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Result of `prepare_rename`: the token range and a placeholder string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareRenameResult {
    pub range: Range,
    pub placeholder: String,
}

/// Per-arm timing for `explore_codebase`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExplorePerformance {
    pub definitions: u64,
    pub references: u64,
    pub total: u64,
}

/// Combined definition + reference view for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreResult {
    pub symbol: String,
    #[serde(rename = "contextUri")]
    pub context_uri: FileUri,
    pub definitions: Vec<Definition>,
    pub references: Vec<Reference>,
    pub performance: ExplorePerformance,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_uri_total_conversions() {
        assert!(FileUri::parse("").is_global());
        assert!(FileUri::parse("not-a-path").is_global());
        assert!(FileUri::from_path(Path::new("")).is_global());
        assert!(FileUri::from_path(Path::new("relative/x.rs")).is_global());

        let uri = FileUri::from_path(Path::new("/tmp/a.rs"));
        assert_eq!(uri.as_str(), "file:///tmp/a.rs");
        assert_eq!(uri.to_path(), Some(PathBuf::from("/tmp/a.rs")));
        assert_eq!(uri.basename(), "a.rs");

        // Bare absolute paths are promoted
        assert_eq!(FileUri::parse("/tmp/a.rs").as_str(), "file:///tmp/a.rs");
        // The sentinel round-trips
        assert_eq!(FileUri::parse(GLOBAL_URI).as_str(), GLOBAL_URI);
    }

    #[test]
    fn test_file_uri_anchors_relative_paths() {
        let uri = FileUri::from_path_in(Path::new("/work"), Path::new("src/a.ts"));
        assert_eq!(uri.as_str(), "file:///work/src/a.ts");
    }

    #[test]
    fn test_range_token_and_contains() {
        let r = Range::token(4, 10, 5);
        assert!(r.is_valid());
        assert!(r.contains(Position::new(4, 10)));
        assert!(r.contains(Position::new(4, 14)));
        assert!(!r.contains(Position::new(4, 15)));
        assert!(!r.contains(Position::new(5, 10)));
    }

    #[test]
    fn test_workspace_edit_dedup_and_disjoint() {
        let uri = FileUri::parse("/tmp/a.rs");
        let mut edit = WorkspaceEdit::new();
        assert!(edit.push(
            uri.clone(),
            TextEdit { range: Range::token(1, 4, 3), new_text: "xyz".into() }
        ));
        // Same start position is dropped
        assert!(!edit.push(
            uri.clone(),
            TextEdit { range: Range::token(1, 4, 3), new_text: "xyz".into() }
        ));
        assert!(edit.push(
            uri.clone(),
            TextEdit { range: Range::token(1, 0, 3), new_text: "xyz".into() }
        ));
        edit.normalize();
        assert_eq!(edit.total_edits(), 2);
        assert!(edit.edits_disjoint());
        assert_eq!(edit.changes[&uri][0].range.start.character, 0);
    }

    #[test]
    fn test_workspace_edit_detects_overlap() {
        let uri = FileUri::parse("/tmp/a.rs");
        let mut edit = WorkspaceEdit::new();
        edit.push(uri.clone(), TextEdit { range: Range::token(1, 0, 5), new_text: "x".into() });
        edit.push(uri, TextEdit { range: Range::token(1, 3, 5), new_text: "x".into() });
        edit.normalize();
        assert!(!edit.edits_disjoint());
    }

    #[test]
    fn test_enhanced_matches_absorb() {
        let mut m = EnhancedMatches::default();
        m.absorb(
            MatchBucket::Exact,
            vec![StreamingResult {
                file: PathBuf::from("/tmp/a.rs"),
                line: 3,
                column: Some(5),
                text: "fn foo()".into(),
                matched: Some("foo".into()),
                confidence: 0.5,
            }],
        );
        m.record_tool("rg");
        m.record_tool("rg");
        assert_eq!(m.total(), 1);
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.tools_used, vec!["rg".to_string()]);
        assert!(!m.is_empty());
    }

    #[test]
    fn test_wire_names() {
        let def = Definition {
            uri: FileUri::parse("/tmp/a.rs"),
            range: Range::token(0, 0, 3),
            kind: DefinitionKind::Class,
            name: "Foo".into(),
            source: MatchSource::Exact,
            confidence: 0.9,
            layer: Layer::AsyncLayer1,
            ast_validated: true,
            metadata: None,
        };
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["kind"], "class");
        assert_eq!(json["source"], "exact");
        assert_eq!(json["layer"], "async-layer1");
        assert_eq!(json["astValidated"], true);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_search_options_invariants() {
        let mut opts = SearchOptions::new("foo", "/tmp");
        assert!(opts.validate().is_ok());
        opts.timeout_ms = 0;
        assert!(opts.validate().is_err());
        opts.timeout_ms = 100;
        opts.max_results = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_search_options_context_window() {
        let mut opts = SearchOptions::new("foo", "/tmp");
        assert_eq!(opts.context_window(), (0, 0));
        assert!(!opts.wants_context());

        opts.context = Some(2);
        assert_eq!(opts.context_window(), (2, 2));

        // Per-side fields override the symmetric window
        opts.before_context = Some(1);
        assert_eq!(opts.context_window(), (1, 2));
        opts.after_context = Some(0);
        assert_eq!(opts.context_window(), (1, 0));
        assert!(opts.wants_context());
    }

    #[test]
    fn test_source_priority_ordering() {
        assert!(MatchSource::Exact.priority() > MatchSource::Pattern.priority());
        assert!(MatchSource::Pattern.priority() > MatchSource::Fuzzy.priority());
        assert!(MatchSource::Fuzzy.priority() > MatchSource::Conceptual.priority());
    }
}
