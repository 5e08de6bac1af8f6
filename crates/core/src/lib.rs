//! Core data model for SymScope: locations, definitions and references,
//! workspace edits, symbol maps, canonical requests with stable cache
//! fingerprints, and the token helpers the search layers share.
//!
//! This crate is pure — no I/O, no async. The engine crate owns all
//! filesystem and process work.

pub mod request;
pub mod token;
pub mod types;

pub use request::{fnv1a64, Operation, QueryRequest};
pub use types::{
    Definition, DefinitionKind, EnhancedMatches, ExplorePerformance, ExploreResult, FileUri,
    Layer, ListOptions, MatchBucket, MatchSource, PerformanceMap, Position, PrepareRenameResult,
    QueryResponse, Range, Reference, ReferenceKind, SearchOptions, StreamingResult, SymbolEntry,
    SymbolMap, TextEdit, WorkspaceEdit, GLOBAL_URI,
};
