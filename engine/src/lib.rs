//! SymScope engine — a tiered code-intelligence query pipeline.
//!
//! Layer 1 is a budgeted, cancellable regex search pool; layer 2 validates
//! and refines candidates through an AST provider; the planners fuse both
//! into rename plans and symbol maps. Results are cached under stable
//! request fingerprints with quality-derived TTLs. The engine is
//! protocol-agnostic: adapters (LSP, stdio, HTTP) call the [`Engine`]
//! operations and render the envelopes themselves.

pub mod ast;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod explore;
pub mod metrics;
pub mod pool;
pub mod query;
pub mod rename;
pub mod symbol_map;
pub mod watch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use symscope_core::types::{
    Definition, ExploreResult, PrepareRenameResult, QueryResponse, Reference, SymbolMap,
    WorkspaceEdit,
};
use symscope_core::{FileUri, QueryRequest};
use tracing::{debug, info};

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use metrics::MetricsSnapshot;

/// The assembled engine. One instance per workspace; cheap to share behind
/// an `Arc`.
pub struct Engine {
    config: Arc<EngineConfig>,
    orchestrator: query::Orchestrator,
    pool: pool::SearchPool,
    discovery: discovery::Discovery,
    ast: ast::AstLayer,
    cache: Arc<cache::ResultCache>,
    metrics: Arc<metrics::EngineMetrics>,
    initialized: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(metrics::EngineMetrics::default());
        let pool = pool::SearchPool::new(&config, Arc::clone(&metrics));
        let discovery = discovery::Discovery::new(pool.clone(), &config.workspace_root);
        let cache = Arc::new(cache::ResultCache::new(
            config.cache.enabled,
            config.cache.min_ttl_secs,
            config.cache.max_ttl_secs,
            Arc::clone(&metrics),
        ));

        #[cfg(feature = "treesitter")]
        let provider: Arc<dyn ast::AstProvider> = Arc::new(ast::TreeSitterProvider::new(
            config.layer2.max_file_size,
            config.layer2.parse_timeout_ms,
        ));
        #[cfg(not(feature = "treesitter"))]
        let provider: Arc<dyn ast::AstProvider> = Arc::new(ast::NullProvider);

        let ast_layer = ast::AstLayer::new(provider, config.layer2.enabled, Arc::clone(&metrics));
        let orchestrator = query::Orchestrator::new(
            Arc::clone(&config),
            pool.clone(),
            discovery.clone(),
            ast_layer.clone(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );

        Engine {
            config,
            orchestrator,
            pool,
            discovery,
            ast: ast_layer,
            cache,
            metrics,
            initialized: AtomicBool::new(false),
        }
    }

    /// Engine with a caller-supplied AST provider instead of the built-in
    /// one.
    pub fn with_provider(config: EngineConfig, provider: Arc<dyn ast::AstProvider>) -> Self {
        let mut engine = Self::new(config);
        let ast_layer = ast::AstLayer::new(
            provider,
            engine.config.layer2.enabled,
            Arc::clone(&engine.metrics),
        );
        engine.orchestrator = query::Orchestrator::new(
            Arc::clone(&engine.config),
            engine.pool.clone(),
            engine.discovery.clone(),
            ast_layer.clone(),
            Arc::clone(&engine.cache),
            Arc::clone(&engine.metrics),
        );
        engine.ast = ast_layer;
        engine
    }

    /// Mark the engine ready and kick off background cache warming for the
    /// configured common identifiers.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(root = %self.config.workspace_root.display(), "Engine initialized");
        let warm = self.config.cache.warm_identifiers.clone();
        if warm.is_empty() || !self.config.cache.enabled {
            return;
        }
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            for identifier in warm {
                let request = QueryRequest::definition(identifier.clone(), FileUri::global());
                if let Err(e) = orchestrator.find_definition(&request).await {
                    debug!(identifier = identifier.as_str(), error = %e, "cache warm skipped");
                }
            }
            debug!("cache warming complete");
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> EngineResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    // -- operations ---------------------------------------------------------

    pub async fn find_definition(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<Vec<Definition>>> {
        self.ensure_initialized()?;
        self.orchestrator.find_definition(request).await
    }

    pub async fn find_references(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<Vec<Reference>>> {
        self.ensure_initialized()?;
        self.orchestrator.find_references(request).await
    }

    pub async fn prepare_rename(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<PrepareRenameResult>> {
        self.ensure_initialized()?;
        rename::RenamePlanner::new(&self.orchestrator).prepare_rename(request).await
    }

    pub async fn rename(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<WorkspaceEdit>> {
        self.ensure_initialized()?;
        rename::RenamePlanner::new(&self.orchestrator).rename(request).await
    }

    pub async fn build_symbol_map(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<SymbolMap>> {
        self.ensure_initialized()?;
        symbol_map::SymbolMapBuilder::new(
            &self.orchestrator,
            &self.pool,
            &self.discovery,
            &self.ast,
            &self.config,
        )
        .build(request)
        .await
    }

    pub async fn explore_codebase(
        &self,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse<ExploreResult>> {
        self.ensure_initialized()?;
        let result = explore::explore_codebase(&self.orchestrator, request).await?;
        Ok(explore::envelope(result))
    }

    // -- maintenance surfaces ------------------------------------------------

    pub fn invalidate_file(&self, uri: &FileUri) {
        self.cache.invalidate_file(uri);
    }

    /// Start the notify-based invalidation watcher over the workspace root.
    /// Keep the returned handle alive for as long as invalidation should
    /// run.
    pub fn start_watcher(&self) -> Option<notify::RecommendedWatcher> {
        watch::start_watcher(Arc::clone(&self.cache), &self.config.workspace_root)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.cache.len(), self.config.explore_augment)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
