//! L2 AST layer.
//!
//! Parses a bounded candidate file set with an `AstProvider` capability and
//! yields typed nodes (declarations, identifiers, calls) plus import/export
//! relationships. The default provider is tree-sitter over the six
//! languages the L1 file-type map knows; it is feature-gated behind
//! `treesitter` so the engine builds with any external provider.
//!
//! Conventions: node ids are `path:line:col` with 1-based line/column (the
//! L1 engine's reporting basis); `Range`s are 0-based (the output basis).

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use symscope_core::types::{
    Definition, DefinitionKind, FileUri, Layer, MatchSource, Range, Reference, ReferenceKind,
};
use tracing::debug;

/// A reference candidate is admitted when an identifier/call node on its
/// line covers the column or starts within this many columns of it.
const REFERENCE_COLUMN_SLACK: u32 = 3;

// ---------------------------------------------------------------------------
// Node model
// ---------------------------------------------------------------------------

/// Typed node vocabulary, language-neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    FunctionDeclaration,
    MethodDefinition,
    ArrowFunction,
    ClassDeclaration,
    InterfaceDeclaration,
    TypeAliasDeclaration,
    VariableDeclaration,
    Identifier,
    CallExpression,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::FunctionDeclaration => "function_declaration",
            NodeType::MethodDefinition => "method_definition",
            NodeType::ArrowFunction => "arrow_function",
            NodeType::ClassDeclaration => "class_declaration",
            NodeType::InterfaceDeclaration => "interface_declaration",
            NodeType::TypeAliasDeclaration => "type_alias_declaration",
            NodeType::VariableDeclaration => "variable_declaration",
            NodeType::Identifier => "identifier",
            NodeType::CallExpression => "call_expression",
        }
    }

    pub fn is_declaration(&self) -> bool {
        !matches!(self, NodeType::Identifier | NodeType::CallExpression)
    }

    pub fn definition_kind(&self) -> DefinitionKind {
        match self {
            NodeType::FunctionDeclaration | NodeType::ArrowFunction => DefinitionKind::Function,
            NodeType::MethodDefinition => DefinitionKind::Method,
            NodeType::ClassDeclaration => DefinitionKind::Class,
            NodeType::InterfaceDeclaration => DefinitionKind::Interface,
            NodeType::TypeAliasDeclaration => DefinitionKind::Type,
            NodeType::VariableDeclaration => DefinitionKind::Variable,
            NodeType::Identifier | NodeType::CallExpression => DefinitionKind::Variable,
        }
    }
}

/// Extra structure attached to a node.
#[derive(Debug, Clone, Default)]
pub struct AstNodeMetadata {
    pub function_name: Option<String>,
    pub class_name: Option<String>,
    pub exports: Vec<String>,
}

/// One typed node with its location.
#[derive(Debug, Clone)]
pub struct AstNode {
    /// `path:line:col`, 1-based.
    pub id: String,
    pub node_type: NodeType,
    pub file: PathBuf,
    /// 0-based token range.
    pub range: Range,
    pub name: Option<String>,
    pub text: Option<String>,
    pub metadata: AstNodeMetadata,
}

impl AstNode {
    pub fn new(node_type: NodeType, file: &Path, range: Range) -> Self {
        AstNode {
            id: format!(
                "{}:{}:{}",
                file.display(),
                range.start.line + 1,
                range.start.character + 1
            ),
            node_type,
            file: file.to_path_buf(),
            range,
            name: None,
            text: None,
            metadata: AstNodeMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Imports,
    Exports,
}

/// A cross-node relationship, located at `path:line` (1-based).
#[derive(Debug, Clone)]
pub struct AstRelationship {
    pub kind: RelationKind,
    pub name: String,
    pub location: String,
}

impl AstRelationship {
    /// Split `path:line` back into its parts.
    pub fn split_location(&self) -> Option<(&str, u64)> {
        let (path, line) = self.location.rsplit_once(':')?;
        line.parse().ok().map(|l| (path, l))
    }
}

/// What one L2 pass produced. Possibly partial under budget exhaustion.
#[derive(Debug, Clone, Default)]
pub struct AstLayerOutput {
    pub nodes: Vec<AstNode>,
    pub relationships: Vec<AstRelationship>,
    pub parsed_files: usize,
    pub budget_exhausted: bool,
}

// ---------------------------------------------------------------------------
// Provider capability
// ---------------------------------------------------------------------------

/// External parsing capability. Implementations must respect the deadline
/// and return whatever they gathered when it passes.
pub trait AstProvider: Send + Sync {
    fn process(&self, files: &BTreeSet<PathBuf>, seed: &str, deadline: Instant) -> AstLayerOutput;
}

/// Provider that parses nothing. Used when the `treesitter` feature is off
/// or layer 2 is disabled.
pub struct NullProvider;

impl AstProvider for NullProvider {
    fn process(&self, _files: &BTreeSet<PathBuf>, _seed: &str, _deadline: Instant) -> AstLayerOutput {
        AstLayerOutput::default()
    }
}

// ---------------------------------------------------------------------------
// Layer wrapper
// ---------------------------------------------------------------------------

/// Engine-facing L2 wrapper: budget enforcement around the provider.
#[derive(Clone)]
pub struct AstLayer {
    provider: Arc<dyn AstProvider>,
    enabled: bool,
    metrics: Arc<EngineMetrics>,
}

impl AstLayer {
    pub fn new(provider: Arc<dyn AstProvider>, enabled: bool, metrics: Arc<EngineMetrics>) -> Self {
        AstLayer { provider, enabled, metrics }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run the provider over `files` under `budget`. A zero budget, a
    /// disabled layer, or a blown deadline all resolve to an empty output,
    /// never an error.
    pub async fn process(
        &self,
        files: &BTreeSet<PathBuf>,
        seed: &str,
        budget: Duration,
    ) -> AstLayerOutput {
        if !self.enabled || budget.is_zero() || files.is_empty() {
            return AstLayerOutput::default();
        }
        let deadline = Instant::now() + budget;
        let provider = Arc::clone(&self.provider);
        let files = files.clone();
        let seed = seed.to_string();
        let metrics = Arc::clone(&self.metrics);

        let work = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let output = provider.process(&files, &seed, deadline);
            metrics.layer2.record_parse(start.elapsed().as_millis() as u64);
            output
        });

        // The blocking task cannot be aborted; the provider polls the
        // deadline itself. The outer timeout only bounds how long we wait.
        match tokio::time::timeout(budget + Duration::from_millis(25), work).await {
            Ok(Ok(output)) => {
                if output.budget_exhausted {
                    self.metrics
                        .layer2
                        .budget_exhaustions
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                output
            }
            Ok(Err(e)) => {
                self.metrics.layer2.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(error = %EngineError::Internal(e.to_string()), "L2 provider panicked");
                AstLayerOutput::default()
            }
            Err(_) => {
                self.metrics
                    .layer2
                    .budget_exhaustions
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                AstLayerOutput::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation rules
// ---------------------------------------------------------------------------

/// Case-insensitive equality with a case-sensitive preference flag.
fn name_matches(name: &str, query: &str) -> Option<bool> {
    if name == query {
        Some(true)
    } else if name.eq_ignore_ascii_case(query) {
        Some(false)
    } else {
        None
    }
}

/// Admit declaration nodes whose captured name matches the query identifier
/// (case-insensitive, case-sensitive tie-break) or one of the seeded
/// candidate names. Returns scored, AST-validated definitions.
pub fn validated_definitions(
    output: &AstLayerOutput,
    identifier: &str,
    candidates: &[String],
) -> Vec<Definition> {
    let mut defs = Vec::new();
    for node in &output.nodes {
        if !node.node_type.is_declaration() {
            continue;
        }
        let Some(name) = node.name.as_deref() else { continue };
        let exact_case = match name_matches(name, identifier) {
            Some(exact) => exact,
            None => {
                if !candidates.iter().any(|c| name.eq_ignore_ascii_case(c)) {
                    continue;
                }
                false
            }
        };

        let kind = node.node_type.definition_kind();
        let mut confidence: f64 = 0.8;
        if exact_case {
            confidence += 0.1;
        }
        if kind.is_declaration() {
            confidence += 0.05;
        }
        defs.push(Definition {
            uri: FileUri::from_path(&node.file),
            range: node.range,
            kind,
            name: name.to_string(),
            source: MatchSource::Exact,
            confidence: confidence.min(1.0),
            layer: Layer::Layer2,
            ast_validated: true,
            metadata: None,
        });
    }
    // Case-sensitive matches first, then position, for deterministic output.
    defs.sort_by(|a, b| {
        (b.name == identifier)
            .cmp(&(a.name == identifier))
            .then_with(|| a.uri.cmp(&b.uri))
            .then_with(|| a.range.start.cmp(&b.range.start))
    });
    defs
}

/// Admit the identifier/call node on `line` (0-based) covering `col` or
/// within the column slack, with token equal to `name`. Returns the
/// validated reference.
pub fn validate_reference(
    output: &AstLayerOutput,
    file: &Path,
    line: u32,
    col: u32,
    name: &str,
) -> Option<Reference> {
    let mut best: Option<(&AstNode, u32)> = None;
    for node in &output.nodes {
        if node.node_type.is_declaration() || node.file != file || node.range.start.line != line {
            continue;
        }
        let token_matches = node.name.as_deref().map(|n| n == name).unwrap_or(false);
        if !token_matches {
            continue;
        }
        let distance = if node.range.contains(symscope_core::types::Position::new(line, col)) {
            0
        } else {
            let start = node.range.start.character;
            let end = node.range.end.character;
            if col < start { start - col } else { col.saturating_sub(end) + 1 }
        };
        if distance > REFERENCE_COLUMN_SLACK {
            continue;
        }
        if best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((node, distance));
        }
    }

    best.map(|(node, distance)| {
        let kind = match node.node_type {
            NodeType::CallExpression => ReferenceKind::Call,
            _ => ReferenceKind::Usage,
        };
        let mut confidence: f64 = 0.7;
        if matches!(node.node_type, NodeType::CallExpression | NodeType::Identifier) {
            confidence += 0.1;
        }
        if distance == 0 {
            confidence += 0.1;
        } else {
            confidence += 0.05 / distance as f64;
        }
        Reference {
            uri: FileUri::from_path(&node.file),
            range: node.range,
            kind,
            name: name.to_string(),
            source: MatchSource::Exact,
            confidence: confidence.min(1.0),
            layer: Layer::Layer2,
            ast_validated: true,
            metadata: None,
        }
    })
}

// ---------------------------------------------------------------------------
// tree-sitter provider
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
pub use provider::TreeSitterProvider;

#[cfg(feature = "treesitter")]
mod provider {
    use super::*;
    use rayon::prelude::*;
    use symscope_core::types::Position;
    use tree_sitter::{Language, Node, Parser};

    /// tree-sitter implementation of the [`AstProvider`] capability.
    pub struct TreeSitterProvider {
        max_file_size: u64,
        parse_timeout_ms: u64,
    }

    impl TreeSitterProvider {
        pub fn new(max_file_size: u64, parse_timeout_ms: u64) -> Self {
            TreeSitterProvider { max_file_size, parse_timeout_ms }
        }
    }

    impl AstProvider for TreeSitterProvider {
        fn process(
            &self,
            files: &BTreeSet<PathBuf>,
            seed: &str,
            deadline: Instant,
        ) -> AstLayerOutput {
            let start = Instant::now();
            let outputs: Vec<Option<FileOutput>> = files
                .par_iter()
                .map(|file| {
                    if Instant::now() > deadline {
                        return None;
                    }
                    parse_one(file, seed, self.max_file_size, self.parse_timeout_ms)
                })
                .collect();

            let mut result = AstLayerOutput::default();
            let requested = files.len();
            for file_output in outputs.into_iter().flatten() {
                result.parsed_files += 1;
                result.nodes.extend(file_output.nodes);
                result.relationships.extend(file_output.relationships);
            }
            result.budget_exhausted = result.parsed_files < requested && Instant::now() > deadline;
            debug!(
                files = result.parsed_files,
                nodes = result.nodes.len(),
                time_ms = start.elapsed().as_millis() as u64,
                "L2 parse pass"
            );
            result
        }
    }

    struct FileOutput {
        nodes: Vec<AstNode>,
        relationships: Vec<AstRelationship>,
    }

    fn language_for_ext(ext: &str) -> Option<Language> {
        match ext {
            "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
            "ts" | "tsx" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
            "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
            "go" => Some(tree_sitter_go::LANGUAGE.into()),
            "java" => Some(tree_sitter_java::LANGUAGE.into()),
            _ => None,
        }
    }

    /// Map a grammar node kind to the language-neutral vocabulary.
    fn classify_declaration(kind: &str) -> Option<NodeType> {
        match kind {
            // Rust
            "function_item" => Some(NodeType::FunctionDeclaration),
            "struct_item" | "enum_item" => Some(NodeType::ClassDeclaration),
            "trait_item" => Some(NodeType::InterfaceDeclaration),
            "type_item" => Some(NodeType::TypeAliasDeclaration),
            "const_item" | "static_item" => Some(NodeType::VariableDeclaration),

            // JS / TS / Go / Java
            "function_declaration" => Some(NodeType::FunctionDeclaration),
            "class_declaration" => Some(NodeType::ClassDeclaration),
            "interface_declaration" => Some(NodeType::InterfaceDeclaration),
            "type_alias_declaration" => Some(NodeType::TypeAliasDeclaration),
            "method_definition" => Some(NodeType::MethodDefinition),
            "method_declaration" => Some(NodeType::MethodDefinition),

            // Python
            "function_definition" => Some(NodeType::FunctionDeclaration),
            "class_definition" => Some(NodeType::ClassDeclaration),

            // Go
            "type_spec" => Some(NodeType::TypeAliasDeclaration),

            // Java
            "enum_declaration" => Some(NodeType::ClassDeclaration),

            _ => None,
        }
    }

    fn node_range(node: &Node) -> Range {
        Range::new(
            Position::new(node.start_position().row as u32, node.start_position().column as u32),
            Position::new(node.end_position().row as u32, node.end_position().column as u32),
        )
    }

    /// Token-sized range for a name node on a single line.
    fn name_range(node: &Node) -> Range {
        node_range(node)
    }

    fn node_name(node: &Node, source: &[u8]) -> Option<String> {
        for field in ["name", "declarator"] {
            if let Some(mut inner) = node.child_by_field_name(field) {
                // variable_declarator in JS/TS nests the identifier one level
                if let Some(deeper) = inner.child_by_field_name("name") {
                    inner = deeper;
                }
                if let Ok(text) = inner.utf8_text(source) {
                    let name = text.trim();
                    if !name.is_empty() {
                        return Some(name.to_string());
                    }
                }
            }
        }
        None
    }

    /// Name node for declarations, so ranges point at the identifier token
    /// rather than the whole item body.
    fn name_node<'a>(node: &Node<'a>) -> Option<Node<'a>> {
        if let Some(inner) = node.child_by_field_name("name") {
            return Some(inner);
        }
        if let Some(decl) = node.child_by_field_name("declarator") {
            if let Some(inner) = decl.child_by_field_name("name") {
                return Some(inner);
            }
            return Some(decl);
        }
        None
    }

    fn is_exported(node: &Node, source: &[u8]) -> bool {
        // JS/TS: wrapped in an export_statement
        if node.parent().map(|p| p.kind() == "export_statement").unwrap_or(false) {
            return true;
        }
        // Rust: leading visibility modifier
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() == "visibility_modifier" {
                return child.utf8_text(source).map(|t| t.starts_with("pub")).unwrap_or(false);
            }
        }
        false
    }

    fn parse_one(
        file: &Path,
        seed: &str,
        max_file_size: u64,
        parse_timeout_ms: u64,
    ) -> Option<FileOutput> {
        let ext = file.extension().and_then(|e| e.to_str())?;
        let lang = language_for_ext(ext)?;
        if std::fs::metadata(file).map(|m| m.len() > max_file_size).unwrap_or(true) {
            return None;
        }
        let content = std::fs::read_to_string(file).ok()?;

        let mut parser = Parser::new();
        parser.set_language(&lang).ok()?;
        if parse_timeout_ms > 0 {
            parser.set_timeout_micros(parse_timeout_ms * 1000);
        }
        let tree = parser.parse(&content, None)?;
        let source = content.as_bytes();

        let mut out = FileOutput { nodes: Vec::new(), relationships: Vec::new() };
        walk(&tree.root_node(), source, file, seed, None, &mut out);
        Some(out)
    }

    fn walk(
        node: &Node,
        source: &[u8],
        file: &Path,
        seed: &str,
        enclosing_class: Option<&str>,
        out: &mut FileOutput,
    ) {
        let kind = node.kind();

        if let Some(mut node_type) = classify_declaration(kind) {
            let name = node_name(node, source);
            // Functions nested under a class body read as methods.
            if node_type == NodeType::FunctionDeclaration && enclosing_class.is_some() {
                node_type = NodeType::MethodDefinition;
            }
            let range = name_node(node).map(|n| name_range(&n)).unwrap_or_else(|| node_range(node));
            let mut ast = AstNode::new(node_type, file, range);
            ast.name = name.clone();
            ast.text = first_line(node, source);
            if matches!(node_type, NodeType::MethodDefinition) {
                ast.metadata.class_name = enclosing_class.map(|c| c.to_string());
            }
            ast.metadata.function_name = match node_type {
                NodeType::FunctionDeclaration | NodeType::MethodDefinition => name.clone(),
                _ => None,
            };
            if is_exported(node, source) {
                if let Some(n) = &name {
                    ast.metadata.exports.push(n.clone());
                    out.relationships.push(AstRelationship {
                        kind: RelationKind::Exports,
                        name: n.clone(),
                        location: format!("{}:{}", file.display(), range.start.line + 1),
                    });
                }
            }
            out.nodes.push(ast);

            let class_scope = if matches!(
                node_type,
                NodeType::ClassDeclaration | NodeType::InterfaceDeclaration
            ) {
                name
            } else {
                None
            };
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                walk(&child, source, file, seed, class_scope.as_deref().or(enclosing_class), out);
            }
            return;
        }

        match kind {
            // JS/TS declarators: arrow functions surface under their
            // declarator's name, anything else is a variable declaration.
            "variable_declarator" => {
                if let Some(name) = node_name(node, source) {
                    let is_arrow = node
                        .child_by_field_name("value")
                        .map(|v| v.kind() == "arrow_function")
                        .unwrap_or(false);
                    let node_type =
                        if is_arrow { NodeType::ArrowFunction } else { NodeType::VariableDeclaration };
                    let range =
                        name_node(node).map(|n| name_range(&n)).unwrap_or_else(|| node_range(node));
                    let mut ast = AstNode::new(node_type, file, range);
                    if is_arrow {
                        ast.metadata.function_name = Some(name.clone());
                    }
                    ast.name = Some(name);
                    ast.text = first_line(node, source);
                    out.nodes.push(ast);
                }
            }
            "identifier" | "type_identifier" | "field_identifier" | "property_identifier" => {
                if let Ok(text) = node.utf8_text(source) {
                    if text.eq_ignore_ascii_case(seed) {
                        let in_call = node
                            .parent()
                            .map(|p| {
                                matches!(p.kind(), "call_expression" | "call" | "method_invocation")
                                    && p.child_by_field_name("function")
                                        .map(|f| f.id() == node.id())
                                        .unwrap_or(true)
                            })
                            .unwrap_or(false);
                        let node_type =
                            if in_call { NodeType::CallExpression } else { NodeType::Identifier };
                        let mut ast = AstNode::new(node_type, file, node_range(node));
                        ast.name = Some(text.to_string());
                        out.nodes.push(ast);
                    }
                }
            }
            "import_statement" | "import_from_statement" | "use_declaration"
            | "import_declaration" | "import_spec" => {
                if let Ok(text) = node.utf8_text(source) {
                    if token_mentions(text, seed) {
                        out.relationships.push(AstRelationship {
                            kind: RelationKind::Imports,
                            name: seed.to_string(),
                            location: format!(
                                "{}:{}",
                                file.display(),
                                node.start_position().row + 1
                            ),
                        });
                    }
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(&child, source, file, seed, enclosing_class, out);
        }
    }

    fn first_line(node: &Node, source: &[u8]) -> Option<String> {
        node.utf8_text(source).ok().and_then(|t| t.lines().next()).map(|l| l.trim().to_string())
    }

    /// Word-boundary mention of `seed` inside `text` (case-insensitive).
    fn token_mentions(text: &str, seed: &str) -> bool {
        if seed.is_empty() {
            return false;
        }
        let lower = text.to_ascii_lowercase();
        let seed_lower = seed.to_ascii_lowercase();
        let mut from = 0;
        while let Some(pos) = lower[from..].find(&seed_lower) {
            let abs = from + pos;
            let bytes = lower.as_bytes();
            let before_ok =
                abs == 0 || !symscope_core::token::is_word_byte(bytes[abs - 1]);
            let after = abs + seed_lower.len();
            let after_ok =
                after >= bytes.len() || !symscope_core::token::is_word_byte(bytes[after]);
            if before_ok && after_ok {
                return true;
            }
            from = after;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
