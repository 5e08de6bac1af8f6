//! End-to-end pipeline scenarios over a real fixture tree: definitions,
//! fuzzy fallback, references, rename planning, symbol maps, caching, and
//! the escalation policy boundaries.

mod helpers;

use helpers::{engine_for, engine_with, fixture_workspace, src_uri};
use symscope_core::types::{DefinitionKind, FileUri};
use symscope_core::{Operation, QueryRequest};

// ---------------------------------------------------------------------------
// findDefinition
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
#[tokio::test]
async fn test_exact_definition_typescript_precise() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request = QueryRequest::definition("TestClass", src_uri(&dir, "a.ts"));
    request.precise = true;
    let resp = engine.find_definition(&request).await.expect("find_definition");

    assert_eq!(resp.data.len(), 1, "precise mode yields the single declaration");
    let def = &resp.data[0];
    assert_eq!(def.kind, DefinitionKind::Class);
    assert!(def.ast_validated);
    assert!(def.confidence >= 0.85, "confidence was {}", def.confidence);
    assert_eq!(def.name, "TestClass");
    assert!(def.uri.as_str().ends_with("src/a.ts"));
    assert!(!resp.cache_hit);
}

#[tokio::test]
async fn test_definition_excludes_default_dirs() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::definition("TestClass", FileUri::global());
    let resp = engine.find_definition(&request).await.unwrap();
    assert!(!resp.data.is_empty());
    assert!(
        resp.data.iter().all(|d| !d.uri.as_str().contains("node_modules")),
        "node_modules results must never surface"
    );
}

#[tokio::test]
async fn test_definition_token_invariant() {
    // The token at every returned range equals the reported name.
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::definition("TestFunction", FileUri::global());
    let resp = engine.find_definition(&request).await.unwrap();
    assert!(!resp.data.is_empty());
    for def in &resp.data {
        assert!(def.range.start <= def.range.end);
        let path = def.uri.to_path().expect("file uri");
        let content = std::fs::read_to_string(&path).unwrap();
        let line = content.lines().nth(def.range.start.line as usize).expect("line exists");
        let start = def.range.start.character as usize;
        let end = def.range.end.character as usize;
        assert_eq!(&line[start..end], def.name, "range must cover the name token");
    }
}

#[tokio::test]
async fn test_fuzzy_seed_finds_real_symbol() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    // Typo seed: exact strategies miss, the subsequence fallback recovers.
    let request = QueryRequest::definition("Asnc", FileUri::global());
    let resp = engine.find_definition(&request).await.unwrap();
    assert!(!resp.data.is_empty(), "fuzzy fallback should surface AsyncEnhancedGrep");
    assert!(
        resp.data.iter().all(|d| d.name == "AsyncEnhancedGrep"),
        "dominant-token collapse keeps the common token, got {:?}",
        resp.data.iter().map(|d| d.name.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_unknown_identifier_is_empty_not_error() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    // Too short for the fuzzy fallback, nowhere in the tree.
    let request = QueryRequest::definition("zx", FileUri::global());
    let resp = engine.find_definition(&request).await.unwrap();
    assert!(resp.data.is_empty());

    // Empty results are cacheable: the identical retry hits.
    let retry = engine.find_definition(&request).await.unwrap();
    assert!(retry.cache_hit);
    assert!(retry.data.is_empty());
}

#[tokio::test]
async fn test_invalid_request_rejected() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::definition("", FileUri::parse(""));
    let err = engine.find_definition(&request).await.unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cache_hit_on_identical_request() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::definition("TestClass", src_uri(&dir, "a.ts"));
    let first = engine.find_definition(&request).await.unwrap();
    let second = engine.find_definition(&request).await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(second.performance.total, 0);
    assert_eq!(second.performance.layer1, 0);
    assert_eq!(second.performance.layer2, 0);
    assert_eq!(first.data, second.data, "cached data must deep-equal the original");
}

#[tokio::test]
async fn test_invalidation_forces_recompute() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::definition("TestClass", src_uri(&dir, "a.ts"));
    let first = engine.find_definition(&request).await.unwrap();
    assert!(!first.cache_hit);

    let declaring = first.data.first().map(|d| d.uri.clone()).expect("one definition");
    engine.invalidate_file(&declaring);

    let third = engine.find_definition(&request).await.unwrap();
    assert!(!third.cache_hit, "invalidation must drop the cached result");
}

// ---------------------------------------------------------------------------
// findReferences
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_references_with_declaration() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request = QueryRequest::references("TestFunction", src_uri(&dir, "util.ts"));
    request.include_declaration = true;
    let with_decl = engine.find_references(&request).await.unwrap();

    let mut without = QueryRequest::references("TestFunction", src_uri(&dir, "util.ts"));
    without.include_declaration = false;
    let without_decl = engine.find_references(&without).await.unwrap();

    assert!(with_decl.data.len() > without_decl.data.len(), "declaration site included on request");
    let decl_line_present = with_decl.data.iter().any(|r| r.range.start.line == 0);
    assert!(decl_line_present, "line 0 holds the declaration in util.ts");

    // Dedup invariant: unique (uri, line, character)
    let mut locations: Vec<(String, u32, u32)> = with_decl
        .data
        .iter()
        .map(|r| (r.uri.to_string(), r.range.start.line, r.range.start.character))
        .collect();
    locations.sort();
    let before = locations.len();
    locations.dedup();
    assert_eq!(before, locations.len());
}

#[cfg(feature = "treesitter")]
#[tokio::test]
async fn test_precise_references_are_ast_validated() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request = QueryRequest::references("TestFunction", src_uri(&dir, "util.ts"));
    request.precise = true;
    request.include_declaration = true;
    let resp = engine.find_references(&request).await.unwrap();
    assert!(!resp.data.is_empty());
    assert!(resp.data.iter().all(|r| r.ast_validated), "precise mode keeps only validated entries");
}

// ---------------------------------------------------------------------------
// Rename
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
#[tokio::test]
async fn test_prepare_rename_returns_placeholder() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::new(
        Operation::PrepareRename,
        "TestFunction",
        src_uri(&dir, "util.ts"),
    );
    let resp = engine.prepare_rename(&request).await.unwrap();
    assert_eq!(resp.data.placeholder, "TestFunction");
    assert!(resp.data.range.is_valid());
}

#[tokio::test]
async fn test_prepare_rename_rejects_unknown_symbol() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request =
        QueryRequest::new(Operation::PrepareRename, "NoSuchSymbolAnywhere", FileUri::global());
    let err = engine.prepare_rename(&request).await.unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");
}

#[tokio::test]
async fn test_rename_plan_covers_declaration_file() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request =
        QueryRequest::new(Operation::Rename, "TestFunction", src_uri(&dir, "util.ts"));
    request.new_name = Some("TestFunctionX".to_string());
    request.dry_run = true;
    let resp = engine.rename(&request).await.unwrap();

    let edit = &resp.data;
    assert!(!edit.is_empty());
    assert!(
        edit.changes.keys().any(|uri| uri.as_str().ends_with("src/util.ts")),
        "the declaring file must be part of the plan"
    );
    assert!(edit.edits_disjoint(), "per-file edits must be pairwise non-overlapping");
    for edits in edit.changes.values() {
        for e in edits {
            assert_eq!(e.new_text, "TestFunctionX");
        }
    }
}

#[tokio::test]
async fn test_rename_to_same_name_is_noop() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request =
        QueryRequest::new(Operation::Rename, "TestFunction", src_uri(&dir, "util.ts"));
    request.new_name = Some("TestFunction".to_string());
    request.dry_run = true;
    let resp = engine.rename(&request).await.unwrap();

    // Every edit replaces the token with itself: applying is a no-op.
    for edits in resp.data.changes.values() {
        for e in edits {
            assert_eq!(e.new_text, "TestFunction");
            assert_eq!(
                (e.range.end.character - e.range.start.character) as usize,
                "TestFunction".len()
            );
        }
    }
}

#[tokio::test]
async fn test_rename_requires_new_name() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::new(Operation::Rename, "TestFunction", FileUri::global());
    let err = engine.rename(&request).await.unwrap_err();
    assert_eq!(err.code(), "InvalidRequest");
}

// ---------------------------------------------------------------------------
// Symbol map
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
#[tokio::test]
async fn test_symbol_map_budgeted() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request =
        QueryRequest::new(Operation::BuildSymbolMap, "HTTPServer", FileUri::global());
    request.max_files = Some(20);
    let resp = engine.build_symbol_map(&request).await.unwrap();
    let map = &resp.data;

    assert_eq!(map.identifier, "HTTPServer");
    assert!(map.files.len() <= 20);
    assert!(!map.declarations.is_empty(), "declaration in server.ts expected");
    assert!(!map.imports.is_empty(), "import in use_server.ts expected");
    assert!(!map.exports.is_empty(), "export of HTTPServer expected");

    for entry in map
        .declarations
        .iter()
        .chain(map.references.iter())
        .chain(map.imports.iter())
        .chain(map.exports.iter())
    {
        assert!(entry.uri.as_str().starts_with("file://"), "entry uri: {}", entry.uri);
        assert!(entry.range.is_valid());
    }

    // Determinism given the same tree
    let again = engine.build_symbol_map(&request).await.unwrap();
    assert_eq!(resp.data.declarations, again.data.declarations);
    assert_eq!(resp.data.imports, again.data.imports);
}

// ---------------------------------------------------------------------------
// Explore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_explore_combines_both_arms() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let mut request =
        QueryRequest::new(Operation::ExploreCodebase, "TestClass", src_uri(&dir, "a.ts"));
    request.include_declaration = true;
    let resp = engine.explore_codebase(&request).await.unwrap();

    assert_eq!(resp.data.symbol, "TestClass");
    assert!(!resp.data.definitions.is_empty());
    assert!(!resp.data.references.is_empty());
    assert!(resp.data.performance.total >= resp.data.performance.definitions.min(resp.data.performance.references));
}

// ---------------------------------------------------------------------------
// Escalation policy boundaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_policy_never_skips_layer2() {
    let dir = fixture_workspace();
    let engine = engine_with(&dir, |c| {
        c.escalation.policy = symscope_engine::config::EscalationPolicy::Never;
    })
    .await;

    let request = QueryRequest::definition("TestClass", src_uri(&dir, "a.ts"));
    let resp = engine.find_definition(&request).await.unwrap();
    assert_eq!(resp.performance.layer2, 0, "policy=never must not run L2");
    assert!(resp.data.iter().all(|d| !d.ast_validated));
}

#[tokio::test]
async fn test_zero_ast_budget_equals_l1_output() {
    let dir = fixture_workspace();
    let engine = engine_with(&dir, |c| {
        c.layer2.budget_ms = 0;
        c.layer2.boosted_budget_ms = 0;
        c.escalation.policy = symscope_engine::config::EscalationPolicy::Always;
    })
    .await;

    let request = QueryRequest::definition("TestClass", src_uri(&dir, "a.ts"));
    let resp = engine.find_definition(&request).await.unwrap();
    assert!(!resp.data.is_empty());
    assert!(resp.data.iter().all(|d| !d.ast_validated), "zero budget means no AST validation");
}

#[tokio::test]
async fn test_metrics_accumulate() {
    let dir = fixture_workspace();
    let engine = engine_for(&dir).await;

    let request = QueryRequest::definition("TestClass", src_uri(&dir, "a.ts"));
    let _ = engine.find_definition(&request).await.unwrap();
    let _ = engine.find_definition(&request).await.unwrap();

    let snapshot = engine.metrics_snapshot();
    assert!(snapshot.layer1.searches >= 1);
    assert!(snapshot.cache.hits >= 1);
    assert!(snapshot.cache.insertions >= 1);
    let text = snapshot.render_prometheus();
    assert!(text.contains("symscope_layer1_searches_total"));
}
