//! Rename planning. `prepare_rename` proves the symbol is findable and
//! returns the placeholder; `rename` builds the full `WorkspaceEdit`
//! without applying it — applying edits belongs to the adapter that owns
//! editor state.

use crate::error::{EngineError, EngineResult};
use crate::query::{respond, Orchestrator};
use std::time::Instant;
use symscope_core::types::{
    FileUri, PerformanceMap, PrepareRenameResult, QueryResponse, TextEdit, WorkspaceEdit,
};
use symscope_core::{Operation, QueryRequest};
use tracing::debug;

pub struct RenamePlanner<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> RenamePlanner<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        RenamePlanner { orchestrator }
    }

    /// Validate that the symbol is findable; return the seed's range and a
    /// placeholder for the editor prompt.
    pub async fn prepare_rename(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<PrepareRenameResult>> {
        request.validate().map_err(EngineError::InvalidRequest)?;

        let mut def_request = request.clone();
        def_request.operation = Operation::FindDefinition;
        def_request.precise = true;
        let defs = self.orchestrator.find_definition(&def_request).await?;

        let best = defs.data.into_iter().next().ok_or_else(|| {
            EngineError::InvalidRequest(format!(
                "cannot rename: no definition found for '{}'",
                request.identifier
            ))
        })?;

        Ok(respond(
            PrepareRenameResult { range: best.range, placeholder: best.name },
            defs.performance,
            defs.cache_hit,
        ))
    }

    /// Plan a rename: precise references (AST-validated entries preferred,
    /// unvalidated dropped when any validated exist), the best definition,
    /// per-file dedup, and the non-overlap invariant enforced.
    pub async fn rename(&self, request: &QueryRequest) -> EngineResult<QueryResponse<WorkspaceEdit>> {
        self.rename_with_propagated(request, Vec::new()).await
    }

    /// Extension point: adapters can contribute propagated edits (comments,
    /// config files) that merge into the plan under the same invariants.
    pub async fn rename_with_propagated(
        &self,
        request: &QueryRequest,
        propagated: Vec<(FileUri, TextEdit)>,
    ) -> EngineResult<QueryResponse<WorkspaceEdit>> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        let new_name = request
            .new_name
            .clone()
            .ok_or_else(|| EngineError::InvalidRequest("rename requires newName".into()))?;

        let total_start = Instant::now();

        let mut ref_request = request.clone();
        ref_request.operation = Operation::FindReferences;
        ref_request.precise = true;
        ref_request.include_declaration = false;
        let refs = self.orchestrator.find_references(&ref_request).await?;

        let mut def_request = request.clone();
        def_request.operation = Operation::FindDefinition;
        def_request.precise = true;
        let defs = self.orchestrator.find_definition(&def_request).await?;

        let mut edit = WorkspaceEdit::new();
        for r in &refs.data {
            edit.push(r.uri.clone(), TextEdit { range: r.range, new_text: new_name.clone() });
        }
        if let Some(best) = defs.data.first() {
            edit.push(best.uri.clone(), TextEdit { range: best.range, new_text: new_name.clone() });
        }
        for (uri, text_edit) in propagated {
            edit.push(uri, text_edit);
        }
        edit.normalize();
        enforce_disjoint(&mut edit);

        let mut performance = PerformanceMap::zero();
        performance.layer1 = refs.performance.layer1 + defs.performance.layer1;
        performance.layer2 = refs.performance.layer2 + defs.performance.layer2;
        performance.total = total_start.elapsed().as_millis() as u64;

        debug!(
            identifier = request.identifier.as_str(),
            new_name = new_name.as_str(),
            files = edit.changes.len(),
            edits = edit.total_edits(),
            dry_run = request.dry_run,
            "rename planned"
        );
        Ok(respond(edit, performance, false))
    }
}

/// Drop any edit that overlaps its predecessor. Assumes per-file edits are
/// sorted; keeps the earlier edit on conflict so the plan stays applicable
/// left-to-right. Positions order by `(line, character)`, so `start <
/// prev.end` is the overlap test across multi-line ranges too — the same
/// test `WorkspaceEdit::edits_disjoint` verifies.
fn enforce_disjoint(edit: &mut WorkspaceEdit) {
    for edits in edit.changes.values_mut() {
        let mut kept: Vec<TextEdit> = Vec::with_capacity(edits.len());
        for e in edits.drain(..) {
            let overlaps =
                kept.last().map(|prev| e.range.start < prev.range.end).unwrap_or(false);
            if !overlaps {
                kept.push(e);
            }
        }
        *edits = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use symscope_core::types::{Position, Range};

    #[test]
    fn test_enforce_disjoint_drops_overlaps() {
        let uri = FileUri::parse("/w/a.rs");
        let mut edit = WorkspaceEdit::new();
        edit.push(uri.clone(), TextEdit { range: Range::token(1, 0, 6), new_text: "x".into() });
        edit.push(uri.clone(), TextEdit { range: Range::token(1, 4, 6), new_text: "x".into() });
        edit.push(uri.clone(), TextEdit { range: Range::token(1, 12, 3), new_text: "x".into() });
        edit.normalize();
        enforce_disjoint(&mut edit);
        assert_eq!(edit.total_edits(), 2);
        assert!(edit.edits_disjoint());
    }

    #[test]
    fn test_enforce_disjoint_keeps_cross_line_edits() {
        let uri = FileUri::parse("/w/a.rs");
        let mut edit = WorkspaceEdit::new();
        edit.push(uri.clone(), TextEdit { range: Range::token(1, 0, 6), new_text: "x".into() });
        edit.push(uri.clone(), TextEdit { range: Range::token(2, 0, 6), new_text: "x".into() });
        edit.normalize();
        enforce_disjoint(&mut edit);
        assert_eq!(edit.total_edits(), 2);
    }

    #[test]
    fn test_enforce_disjoint_drops_edit_inside_multiline_span() {
        // A propagated edit can span lines; a rename edit starting inside
        // that span must be dropped even though its start line differs from
        // the span's start line.
        let uri = FileUri::parse("/w/a.rs");
        let mut edit = WorkspaceEdit::new();
        edit.push(
            uri.clone(),
            TextEdit {
                range: Range::new(Position::new(0, 0), Position::new(2, 4)),
                new_text: "x".into(),
            },
        );
        edit.push(uri.clone(), TextEdit { range: Range::token(1, 2, 3), new_text: "x".into() });
        edit.push(uri.clone(), TextEdit { range: Range::token(3, 0, 3), new_text: "x".into() });
        edit.normalize();
        enforce_disjoint(&mut edit);
        assert_eq!(edit.total_edits(), 2);
        assert!(edit.edits_disjoint());
        let kept = &edit.changes[&uri];
        assert_eq!(kept[0].range.start, Position::new(0, 0));
        assert_eq!(kept[1].range.start, Position::new(3, 0));
    }
}
