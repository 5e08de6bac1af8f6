//! Explore aggregation: one symbol, definitions and references resolved
//! concurrently, combined into a single view. Either arm failing degrades
//! to an empty list for that arm.

use crate::error::EngineResult;
use crate::query::{now_ms, Orchestrator};
use std::sync::atomic::Ordering;
use std::time::Instant;
use symscope_core::types::{ExplorePerformance, ExploreResult};
use symscope_core::{Operation, QueryRequest};
use tracing::debug;

pub async fn explore_codebase(
    orchestrator: &Orchestrator,
    request: &QueryRequest,
) -> EngineResult<ExploreResult> {
    request.validate().map_err(crate::error::EngineError::InvalidRequest)?;

    let mut def_request = request.clone();
    def_request.operation = Operation::FindDefinition;
    let mut ref_request = request.clone();
    ref_request.operation = Operation::FindReferences;
    ref_request.include_declaration = request.include_declaration;

    let start = Instant::now();
    let def_start = Instant::now();
    let (def_result, ref_result) = tokio::join!(
        orchestrator.find_definition(&def_request),
        orchestrator.find_references(&ref_request),
    );

    let (mut definitions, def_ms) = match def_result {
        Ok(resp) => (resp.data, resp.performance.total),
        Err(e) => {
            debug!(error = %e, "explore definition arm degraded");
            (Vec::new(), def_start.elapsed().as_millis() as u64)
        }
    };
    let (mut references, ref_ms) = match ref_result {
        Ok(resp) => (resp.data, resp.performance.total),
        Err(e) => {
            debug!(error = %e, "explore reference arm degraded");
            (Vec::new(), 0)
        }
    };

    // Conceptual (subsequence) matches only surface when asked for.
    if !request.conceptual {
        definitions.retain(|d| d.source != symscope_core::types::MatchSource::Conceptual);
        references.retain(|r| r.source != symscope_core::types::MatchSource::Conceptual);
    }

    if orchestrator.config().explore_augment {
        // Feed the augmentation counter; the external store consumes the
        // snapshot, not the engine.
        orchestrator.metrics().storage.augment_events.fetch_add(1, Ordering::Relaxed);
    }

    Ok(ExploreResult {
        symbol: request.identifier.clone(),
        context_uri: request.normalized_uri(),
        definitions,
        references,
        performance: ExplorePerformance {
            definitions: def_ms,
            references: ref_ms,
            total: start.elapsed().as_millis() as u64,
        },
    })
}

/// Explore responses still carry the standard envelope metadata.
pub fn envelope(result: ExploreResult) -> symscope_core::types::QueryResponse<ExploreResult> {
    let mut performance = symscope_core::types::PerformanceMap::zero();
    performance.total = result.performance.total;
    symscope_core::types::QueryResponse {
        data: result,
        performance,
        request_id: uuid::Uuid::new_v4().to_string(),
        cache_hit: false,
        timestamp: now_ms(),
    }
}
