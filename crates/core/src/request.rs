//! Canonical request objects and their cache fingerprints.
//!
//! A fingerprint is a pure function of the stable request fields — two
//! requests that differ only in request id or arrival time hash identically.
//! The scheme is FNV-1a 64 over a canonical `key=value` serialization with
//! keys in a fixed order, so keys are deterministic across processes.

use crate::types::{FileUri, Position};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The six operations the engine exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    FindDefinition,
    FindReferences,
    PrepareRename,
    Rename,
    BuildSymbolMap,
    ExploreCodebase,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FindDefinition => "findDefinition",
            Operation::FindReferences => "findReferences",
            Operation::PrepareRename => "prepareRename",
            Operation::Rename => "rename",
            Operation::BuildSymbolMap => "buildSymbolMap",
            Operation::ExploreCodebase => "exploreCodebase",
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A single query against the engine. All operations share this shape;
/// fields that do not apply to an operation stay at their defaults and do
/// not perturb the fingerprint semantics of other operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub operation: Operation,
    pub identifier: String,
    pub uri: FileUri,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(rename = "includeDeclaration", default)]
    pub include_declaration: bool,
    #[serde(rename = "maxResults", default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub precise: bool,
    #[serde(rename = "astOnly", default)]
    pub ast_only: bool,
    #[serde(rename = "newName", skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(rename = "dryRun", default)]
    pub dry_run: bool,
    #[serde(rename = "maxFiles", skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    /// Allow conceptual (subsequence-fallback) matches in explore output.
    #[serde(default)]
    pub conceptual: bool,
}

fn default_max_results() -> usize {
    50
}

impl QueryRequest {
    pub fn new(operation: Operation, identifier: impl Into<String>, uri: FileUri) -> Self {
        QueryRequest {
            operation,
            identifier: identifier.into(),
            uri,
            position: None,
            include_declaration: false,
            max_results: default_max_results(),
            precise: false,
            ast_only: false,
            new_name: None,
            dry_run: false,
            max_files: None,
            conceptual: false,
        }
    }

    pub fn definition(identifier: impl Into<String>, uri: FileUri) -> Self {
        Self::new(Operation::FindDefinition, identifier, uri)
    }

    pub fn references(identifier: impl Into<String>, uri: FileUri) -> Self {
        Self::new(Operation::FindReferences, identifier, uri)
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn precise(mut self) -> Self {
        self.precise = true;
        self
    }

    /// URI with the empty/unknown case already collapsed to the sentinel.
    pub fn normalized_uri(&self) -> FileUri {
        if self.uri.as_str().is_empty() {
            FileUri::global()
        } else {
            self.uri.clone()
        }
    }

    /// Structural validation shared by all operations. The engine maps the
    /// message into its own error type.
    pub fn validate(&self) -> Result<(), String> {
        if self.identifier.is_empty() && self.normalized_uri().is_global() {
            return Err("identifier and uri are both empty".into());
        }
        if self.operation == Operation::Rename {
            match &self.new_name {
                None => return Err("rename requires newName".into()),
                Some(n) if n.is_empty() => return Err("newName is empty".into()),
                _ => {}
            }
        }
        if self.max_results == 0 {
            return Err("maxResults must be positive".into());
        }
        Ok(())
    }

    /// Stable cache key. Fixed field order; absent optionals serialize as
    /// `-` so present/absent never collide with real values.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = String::with_capacity(128);
        push_field(&mut buf, "op", self.operation.as_str());
        push_field(&mut buf, "id", &self.identifier);
        push_field(&mut buf, "uri", self.normalized_uri().as_str());
        match self.position {
            Some(p) => push_field(&mut buf, "pos", &format!("{}:{}", p.line, p.character)),
            None => push_field(&mut buf, "pos", "-"),
        }
        push_field(&mut buf, "max", &self.max_results.to_string());
        push_field(&mut buf, "decl", if self.include_declaration { "1" } else { "0" });
        push_field(&mut buf, "precise", if self.precise { "1" } else { "0" });
        push_field(&mut buf, "ast", if self.ast_only { "1" } else { "0" });
        push_field(&mut buf, "new", self.new_name.as_deref().unwrap_or("-"));
        push_field(&mut buf, "dry", if self.dry_run { "1" } else { "0" });
        match self.max_files {
            Some(n) => push_field(&mut buf, "files", &n.to_string()),
            None => push_field(&mut buf, "files", "-"),
        }
        push_field(&mut buf, "conceptual", if self.conceptual { "1" } else { "0" });
        fnv1a64(buf.as_bytes())
    }
}

fn push_field(buf: &mut String, key: &str, value: &str) {
    buf.push_str(key);
    buf.push('=');
    buf.push_str(value);
    buf.push('\n');
}

// ---------------------------------------------------------------------------
// FNV-1a
// ---------------------------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a 64-bit. Deterministic across runs and platforms, unlike
/// `DefaultHasher`.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> QueryRequest {
        QueryRequest::definition("TestClass", FileUri::parse("/work/src/a.ts"))
    }

    #[test]
    fn test_fingerprint_is_pure() {
        assert_eq!(req().fingerprint(), req().fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let base = req().fingerprint();
        let mut r = req();
        r.identifier = "TestClasz".into();
        assert_ne!(base, r.fingerprint());

        let mut r = req();
        r.precise = true;
        assert_ne!(base, r.fingerprint());

        let mut r = req();
        r.position = Some(Position::new(0, 0));
        assert_ne!(base, r.fingerprint());

        let mut r = req();
        r.max_results = 10;
        assert_ne!(base, r.fingerprint());
    }

    #[test]
    fn test_fingerprint_normalizes_empty_uri() {
        let a = QueryRequest::definition("Foo", FileUri::parse(""));
        let b = QueryRequest::definition("Foo", FileUri::global());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_validate_rejects_doubly_empty() {
        let r = QueryRequest::definition("", FileUri::parse(""));
        assert!(r.validate().is_err());

        // Identifier alone is enough
        let r = QueryRequest::definition("Foo", FileUri::parse(""));
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_validate_rename_new_name() {
        let mut r = QueryRequest::new(Operation::Rename, "Foo", FileUri::global());
        assert!(r.validate().is_err());
        r.new_name = Some(String::new());
        assert!(r.validate().is_err());
        r.new_name = Some("Bar".into());
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_fnv_known_vector() {
        // FNV-1a("") is the offset basis
        assert_eq!(fnv1a64(b""), FNV_OFFSET);
        assert_ne!(fnv1a64(b"a"), fnv1a64(b"b"));
    }
}
