//! SymScope binary — thin CLI shell over the [`symscope_engine`] library
//! crate. One query per invocation; adapters that need a long-lived engine
//! embed the library instead.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use symscope_core::types::{FileUri, Position};
use symscope_core::{Operation, QueryRequest};
use symscope_engine::{Engine, EngineConfig};
use tracing::error;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Tiered code-intelligence queries: definitions, references, rename plans,
/// and symbol maps over a source tree.
#[derive(Parser)]
#[command(name = "symscope", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Find where an identifier is defined
    Def {
        identifier: String,

        /// Context file URI or path
        #[arg(long)]
        uri: Option<String>,

        /// Force AST-preferred output with strict filtering
        #[arg(long)]
        precise: bool,

        /// Only return AST-validated entries
        #[arg(long)]
        ast_only: bool,

        #[arg(long, default_value_t = 50)]
        max_results: usize,
    },
    /// Find where an identifier is used
    Refs {
        identifier: String,

        #[arg(long)]
        uri: Option<String>,

        /// Include the declaration site among the references
        #[arg(long)]
        include_declaration: bool,

        #[arg(long)]
        precise: bool,

        #[arg(long, default_value_t = 50)]
        max_results: usize,
    },
    /// Plan a rename without applying it
    Rename {
        identifier: String,
        new_name: String,

        #[arg(long)]
        uri: Option<String>,

        /// Only validate the rename target (prepareRename)
        #[arg(long)]
        prepare: bool,
    },
    /// Build a symbol map: declarations, references, imports, exports
    Map {
        identifier: String,

        #[arg(long)]
        uri: Option<String>,

        #[arg(long, default_value_t = 20)]
        max_files: usize,

        #[arg(long)]
        ast_only: bool,
    },
    /// Run definition and reference queries together
    Explore {
        identifier: String,

        #[arg(long)]
        uri: Option<String>,

        #[arg(long)]
        precise: bool,

        /// Include conceptual (subsequence-fallback) matches
        #[arg(long)]
        conceptual: bool,
    },
    /// Print engine metrics (use --json for Prometheus-ready counters)
    Metrics {
        /// Emit Prometheus text exposition instead of a JSON snapshot
        #[arg(long)]
        prometheus: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn request_for(
    operation: Operation,
    identifier: &str,
    uri: &Option<String>,
    position: Option<Position>,
) -> QueryRequest {
    let uri = uri.as_deref().map(FileUri::parse).unwrap_or_else(FileUri::global);
    let mut request = QueryRequest::new(operation, identifier, uri);
    request.position = position;
    request
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => error!(error = %e, "failed to serialize output"),
    }
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("symscope=info".parse().unwrap()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let root = root.canonicalize().unwrap_or_else(|e| {
        error!(root = %root.display(), error = %e, "Workspace root not found");
        std::process::exit(1);
    });

    let engine = Engine::new(EngineConfig::load(&root));
    engine.initialize().await;

    let exit = run(&engine, &cli).await;
    std::process::exit(exit);
}

async fn run(engine: &Engine, cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Def { identifier, uri, precise, ast_only, max_results } => {
            let mut request = request_for(Operation::FindDefinition, identifier, uri, None);
            request.precise = *precise;
            request.ast_only = *ast_only;
            request.max_results = *max_results;
            match engine.find_definition(&request).await {
                Ok(resp) => {
                    if cli.json {
                        print_json(&resp);
                    } else {
                        for d in &resp.data {
                            println!(
                                "{}:{}:{}  {}  ({}, {:.2}{})",
                                d.uri,
                                d.range.start.line + 1,
                                d.range.start.character + 1,
                                d.name,
                                d.kind.as_str(),
                                d.confidence,
                                if d.ast_validated { ", ast" } else { "" },
                            );
                        }
                        eprintln!(
                            "{} result(s) in {} ms{}",
                            resp.data.len(),
                            resp.performance.total,
                            if resp.cache_hit { " (cached)" } else { "" },
                        );
                    }
                    0
                }
                Err(e) => fail(&e),
            }
        }
        Commands::Refs { identifier, uri, include_declaration, precise, max_results } => {
            let mut request = request_for(Operation::FindReferences, identifier, uri, None);
            request.include_declaration = *include_declaration;
            request.precise = *precise;
            request.max_results = *max_results;
            match engine.find_references(&request).await {
                Ok(resp) => {
                    if cli.json {
                        print_json(&resp);
                    } else {
                        for r in &resp.data {
                            println!(
                                "{}:{}:{}  {}  ({:?})",
                                r.uri,
                                r.range.start.line + 1,
                                r.range.start.character + 1,
                                r.name,
                                r.kind,
                            );
                        }
                        eprintln!("{} reference(s) in {} ms", resp.data.len(), resp.performance.total);
                    }
                    0
                }
                Err(e) => fail(&e),
            }
        }
        Commands::Rename { identifier, new_name, uri, prepare } => {
            if *prepare {
                let request = request_for(Operation::PrepareRename, identifier, uri, None);
                return match engine.prepare_rename(&request).await {
                    Ok(resp) => {
                        print_json(&resp);
                        0
                    }
                    Err(e) => fail(&e),
                };
            }
            let mut request = request_for(Operation::Rename, identifier, uri, None);
            request.new_name = Some(new_name.clone());
            request.dry_run = true;
            match engine.rename(&request).await {
                Ok(resp) => {
                    if cli.json {
                        print_json(&resp);
                    } else {
                        for (file_uri, edits) in &resp.data.changes {
                            println!("{file_uri}: {} edit(s)", edits.len());
                        }
                        eprintln!(
                            "{} edit(s) across {} file(s)",
                            resp.data.total_edits(),
                            resp.data.changes.len(),
                        );
                    }
                    0
                }
                Err(e) => fail(&e),
            }
        }
        Commands::Map { identifier, uri, max_files, ast_only } => {
            let mut request = request_for(Operation::BuildSymbolMap, identifier, uri, None);
            request.max_files = Some(*max_files);
            request.ast_only = *ast_only;
            match engine.build_symbol_map(&request).await {
                Ok(resp) => {
                    print_json(&resp);
                    0
                }
                Err(e) => fail(&e),
            }
        }
        Commands::Explore { identifier, uri, precise, conceptual } => {
            let mut request = request_for(Operation::ExploreCodebase, identifier, uri, None);
            request.precise = *precise;
            request.conceptual = *conceptual;
            request.include_declaration = true;
            match engine.explore_codebase(&request).await {
                Ok(resp) => {
                    print_json(&resp);
                    0
                }
                Err(e) => fail(&e),
            }
        }
        Commands::Metrics { prometheus } => {
            let snapshot = engine.metrics_snapshot();
            if *prometheus {
                print!("{}", snapshot.render_prometheus());
            } else {
                print_json(&snapshot);
            }
            0
        }
    }
}

fn fail(e: &symscope_engine::EngineError) -> i32 {
    let body = e.to_body(&uuid::Uuid::new_v4().to_string());
    eprintln!("{}", serde_json::to_string(&body).unwrap_or_else(|_| e.to_string()));
    1
}
