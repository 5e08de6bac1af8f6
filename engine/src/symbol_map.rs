//! Symbol-map construction: declarations, references, imports, and exports
//! for one identifier over a bounded candidate file set. Deterministic
//! given the same candidate set and AST output.

use crate::ast::{self, AstLayer, RelationKind};
use crate::config::EngineConfig;
use crate::discovery::Discovery;
use crate::error::{EngineError, EngineResult};
use crate::pool::SearchPool;
use crate::query::{respond, Orchestrator};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use symscope_core::token;
use symscope_core::types::{
    PerformanceMap, QueryResponse, Range, SearchOptions, SymbolEntry, SymbolMap,
};
use symscope_core::{Operation, QueryRequest};
use tracing::debug;

/// Fallback glob+text scan looks at this many files before capping.
const FALLBACK_SCAN_FILES: usize = 200;

/// Default candidate-set bound when the request does not carry one.
const DEFAULT_MAX_FILES: usize = 20;

pub struct SymbolMapBuilder<'a> {
    orchestrator: &'a Orchestrator,
    pool: &'a SearchPool,
    discovery: &'a Discovery,
    ast: &'a AstLayer,
    config: &'a Arc<EngineConfig>,
}

impl<'a> SymbolMapBuilder<'a> {
    pub fn new(
        orchestrator: &'a Orchestrator,
        pool: &'a SearchPool,
        discovery: &'a Discovery,
        ast: &'a AstLayer,
        config: &'a Arc<EngineConfig>,
    ) -> Self {
        SymbolMapBuilder { orchestrator, pool, discovery, ast, config }
    }

    pub async fn build(&self, request: &QueryRequest) -> EngineResult<QueryResponse<SymbolMap>> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        let max_files = request.max_files.unwrap_or(DEFAULT_MAX_FILES);
        let total_start = Instant::now();
        let mut performance = PerformanceMap::zero();

        // Seed candidates from precise definitions.
        let mut def_request = request.clone();
        def_request.operation = Operation::FindDefinition;
        def_request.precise = true;
        let defs = self.orchestrator.find_definition(&def_request).await?;
        performance.layer1 += defs.performance.layer1;
        performance.layer2 += defs.performance.layer2;

        let mut candidates: BTreeSet<PathBuf> =
            defs.data.iter().filter_map(|d| d.uri.to_path()).collect();

        // Precise references both widen the candidate set and become the
        // reference list.
        let mut ref_request = request.clone();
        ref_request.operation = Operation::FindReferences;
        ref_request.precise = true;
        ref_request.include_declaration = false;
        let refs = self.orchestrator.find_references(&ref_request).await?;
        performance.layer1 += refs.performance.layer1;
        performance.layer2 += refs.performance.layer2;

        if candidates.len() < max_files && !request.ast_only {
            candidates.extend(refs.data.iter().filter_map(|r| r.uri.to_path()));
        }

        // Last resort: a small glob + text scan.
        if candidates.is_empty() {
            candidates = self.fallback_scan(&request.identifier, max_files).await;
        }
        while candidates.len() > max_files {
            let last = candidates.iter().next_back().cloned();
            if let Some(last) = last {
                candidates.remove(&last);
            }
        }

        // One AST pass over the bounded set feeds declarations, imports and
        // exports.
        let budget = self.config.layer2_budget(&request.identifier, true);
        let l2_start = Instant::now();
        let output = self.ast.process(&candidates, &request.identifier, budget).await;
        performance.layer2 += l2_start.elapsed().as_millis() as u64;

        let mut map = SymbolMap { identifier: request.identifier.clone(), ..Default::default() };
        for file in &candidates {
            map.files.insert(file.display().to_string());
        }

        let mut seen_decls: BTreeSet<(String, u32, u32)> = BTreeSet::new();
        for def in ast::validated_definitions(&output, &request.identifier, &[]) {
            let key = (
                def.uri.as_str().to_string(),
                def.range.start.line,
                def.range.start.character,
            );
            if seen_decls.insert(key) {
                map.declarations.push(SymbolEntry {
                    uri: def.uri,
                    range: def.range,
                    kind: def.kind.as_str().to_string(),
                    name: def.name,
                    text: None,
                });
            }
        }

        for r in refs.data {
            map.references.push(SymbolEntry {
                uri: r.uri,
                range: r.range,
                kind: format!("{:?}", r.kind).to_lowercase(),
                name: r.name,
                text: None,
            });
        }

        // Imports and exports resolve their `path:line` locations by reading
        // just that line back.
        let identifier = request.identifier.clone();
        let relationships = output.relationships.clone();
        let resolved = tokio::task::spawn_blocking(move || {
            let mut imports = Vec::new();
            let mut exports = Vec::new();
            for rel in &relationships {
                if !rel.name.eq_ignore_ascii_case(&identifier) {
                    continue;
                }
                let Some((path, line1)) = rel.split_location() else { continue };
                let Some((range, text)) = resolve_line(Path::new(path), line1, &identifier) else {
                    continue;
                };
                let entry = SymbolEntry {
                    uri: symscope_core::types::FileUri::from_path(Path::new(path)),
                    range,
                    kind: match rel.kind {
                        RelationKind::Imports => "import".to_string(),
                        RelationKind::Exports => "export".to_string(),
                    },
                    name: identifier.clone(),
                    text: Some(text),
                };
                match rel.kind {
                    RelationKind::Imports => imports.push(entry),
                    RelationKind::Exports => exports.push(entry),
                }
            }
            (imports, exports)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("symbol map resolution panicked: {e}")))?;

        map.imports = resolved.0;
        map.exports = resolved.1;

        sort_entries(&mut map.declarations);
        sort_entries(&mut map.references);
        sort_entries(&mut map.imports);
        sort_entries(&mut map.exports);

        performance.total = total_start.elapsed().as_millis() as u64;
        debug!(
            identifier = request.identifier.as_str(),
            files = map.files.len(),
            declarations = map.declarations.len(),
            references = map.references.len(),
            "symbol map built"
        );
        Ok(respond(map, performance, false))
    }

    /// Glob + text scan fallback: list source files, keep the ones whose
    /// content actually mentions the identifier.
    async fn fallback_scan(&self, identifier: &str, max_files: usize) -> BTreeSet<PathBuf> {
        let timeout_ms = self.config.layer1.grep.default_timeout_ms;
        let listed = self
            .discovery
            .list_source_files(FALLBACK_SCAN_FILES, timeout_ms)
            .await
            .unwrap_or_default();
        if listed.is_empty() {
            return BTreeSet::new();
        }
        let mut opts =
            SearchOptions::new(token::exact_pattern(identifier), &self.config.workspace_root);
        opts.timeout_ms = timeout_ms;
        opts.max_results = FALLBACK_SCAN_FILES;
        opts.case_insensitive = true;
        let listed: BTreeSet<PathBuf> = listed.into_iter().collect();
        match self.pool.search(&opts).await {
            Ok(results) => results
                .into_iter()
                .map(|r| r.file)
                .filter(|f| listed.contains(f))
                .take(max_files)
                .collect(),
            Err(_) => listed.into_iter().take(max_files).collect(),
        }
    }
}

/// Read line `line1` (1-based) of `path` and locate the identifier on it.
fn resolve_line(path: &Path, line1: u64, identifier: &str) -> Option<(Range, String)> {
    if line1 == 0 {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    let line = content.lines().nth(line1 as usize - 1)?;
    let col = token::nearest_token_containing(line, 0, identifier)
        .map(|(start, _)| start)
        .or_else(|| line.find(identifier))?;
    Some((
        Range::token(line1 as u32 - 1, col as u32, identifier.chars().count() as u32),
        line.trim().to_string(),
    ))
}

fn sort_entries(entries: &mut [SymbolEntry]) {
    entries.sort_by(|a, b| {
        a.uri.cmp(&b.uri).then_with(|| a.range.start.cmp(&b.range.start))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_line_locates_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        std::fs::write(&file, "// top\nexport { HTTPServer } from './server';\n").unwrap();

        let (range, text) = resolve_line(&file, 2, "HTTPServer").unwrap();
        assert_eq!(range.start.line, 1);
        assert_eq!(range.start.character, 9);
        assert_eq!(range.end.character, 19);
        assert_eq!(text, "export { HTTPServer } from './server';");
    }

    #[test]
    fn test_resolve_line_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ts");
        std::fs::write(&file, "one line\n").unwrap();
        assert!(resolve_line(&file, 0, "x").is_none());
        assert!(resolve_line(&file, 5, "x").is_none());
        assert!(resolve_line(Path::new("/does/not/exist"), 1, "x").is_none());
    }

    #[test]
    fn test_sort_entries_is_stable_by_location() {
        let mk = |uri: &str, line: u32| SymbolEntry {
            uri: symscope_core::types::FileUri::parse(uri),
            range: Range::token(line, 0, 1),
            kind: "import".into(),
            name: "x".into(),
            text: None,
        };
        let mut entries = vec![mk("/w/b.ts", 0), mk("/w/a.ts", 5), mk("/w/a.ts", 1)];
        sort_entries(&mut entries);
        assert_eq!(entries[0].uri.as_str(), "file:///w/a.ts");
        assert_eq!(entries[0].range.start.line, 1);
        assert_eq!(entries[2].uri.as_str(), "file:///w/b.ts");
    }
}
