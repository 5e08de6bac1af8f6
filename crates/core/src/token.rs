//! Byte-level token helpers shared by the search layers: word expansion
//! around a reported column, nearest-token relocation, subsequence fuzzy
//! patterns, and keyword-driven definition-kind inference.
//!
//! Word characters are `[A-Za-z0-9_]`, matching the `\b` semantics of the
//! line-regex engine.

use crate::types::DefinitionKind;

#[inline]
pub fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// ---------------------------------------------------------------------------
// Token expansion
// ---------------------------------------------------------------------------

/// Expand a 0-based column to the word token surrounding it. Returns the
/// half-open byte span `(start, end)`, or `None` when the column is out of
/// bounds or sits on a non-word byte with no adjacent word byte.
pub fn expand_token(line: &str, col: usize) -> Option<(usize, usize)> {
    let bytes = line.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    // A column just past a token (engine columns can point at the match end)
    // snaps back onto it.
    let mut anchor = col.min(bytes.len().saturating_sub(1));
    if !is_word_byte(bytes[anchor]) {
        if anchor > 0 && is_word_byte(bytes[anchor - 1]) {
            anchor -= 1;
        } else {
            return None;
        }
    }
    let mut start = anchor;
    while start > 0 && is_word_byte(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = anchor + 1;
    while end < bytes.len() && is_word_byte(bytes[end]) {
        end += 1;
    }
    Some((start, end))
}

/// The word token at `col`, if any.
pub fn token_at(line: &str, col: usize) -> Option<&str> {
    expand_token(line, col).map(|(s, e)| &line[s..e])
}

/// Find the word token on `line` nearest to `col` that contains `seed`
/// (case-insensitive). Returns `(start, token)`.
pub fn nearest_token_containing<'a>(line: &'a str, col: usize, seed: &str) -> Option<(usize, &'a str)> {
    if seed.is_empty() {
        return None;
    }
    let seed_lower = seed.to_ascii_lowercase();
    let mut best: Option<(usize, &str)> = None;
    let mut best_distance = usize::MAX;

    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if is_word_byte(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_word_byte(bytes[i]) {
                i += 1;
            }
            let token = &line[start..i];
            if token.to_ascii_lowercase().contains(&seed_lower) {
                let distance = if col < start {
                    start - col
                } else if col >= i {
                    col - i + 1
                } else {
                    0
                };
                if distance < best_distance {
                    best_distance = distance;
                    best = Some((start, token));
                }
            }
        } else {
            i += 1;
        }
    }
    best
}

/// Find the word token on `line` nearest to `col` that contains `seed` as a
/// character subsequence (case-insensitive). Used for typo-tolerant hits
/// where no token contains the seed literally.
pub fn nearest_token_subsequence<'a>(
    line: &'a str,
    col: usize,
    seed: &str,
) -> Option<(usize, &'a str)> {
    if seed.is_empty() {
        return None;
    }
    let seed_lower: Vec<u8> = seed.bytes().map(|b| b.to_ascii_lowercase()).collect();
    let is_subsequence = |token: &str| {
        let mut si = 0;
        for b in token.bytes() {
            if si < seed_lower.len() && b.to_ascii_lowercase() == seed_lower[si] {
                si += 1;
            }
        }
        si == seed_lower.len()
    };

    let bytes = line.as_bytes();
    let mut best: Option<(usize, &str)> = None;
    let mut best_distance = usize::MAX;
    let mut i = 0;
    while i < bytes.len() {
        if is_word_byte(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_word_byte(bytes[i]) {
                i += 1;
            }
            let tok = &line[start..i];
            if is_subsequence(tok) {
                let distance =
                    if col < start { start - col } else if col >= i { col - i + 1 } else { 0 };
                if distance < best_distance {
                    best_distance = distance;
                    best = Some((start, tok));
                }
            }
        } else {
            i += 1;
        }
    }
    best
}

/// True when the token starting at `col` is exactly `name` on word
/// boundaries.
pub fn word_boundary_hit(line: &str, col: usize, name: &str) -> bool {
    let bytes = line.as_bytes();
    if name.is_empty() || col + name.len() > bytes.len() {
        return false;
    }
    if &line[col..col + name.len()] != name {
        return false;
    }
    let before_ok = col == 0 || !is_word_byte(bytes[col - 1]);
    let after = col + name.len();
    let after_ok = after >= bytes.len() || !is_word_byte(bytes[after]);
    before_ok && after_ok
}

// ---------------------------------------------------------------------------
// Fuzzy patterns
// ---------------------------------------------------------------------------

/// Subsequence regex for typo-tolerant fallback: `Asnc` → `A.*s.*n.*c`.
/// Each character is regex-escaped before joining.
pub fn subsequence_pattern(identifier: &str) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(identifier.chars().count());
    for ch in identifier.chars() {
        parts.push(regex::escape(&ch.to_string()));
    }
    parts.join(".*")
}

/// Word-boundary exact pattern: `\bID\b`.
pub fn exact_pattern(identifier: &str) -> String {
    format!(r"\b{}\b", regex::escape(identifier))
}

/// Prefix pattern: `\bID\w*`.
pub fn prefix_pattern(identifier: &str) -> String {
    format!(r"\b{}\w*", regex::escape(identifier))
}

/// Suffix pattern: `\w*ID\b`.
pub fn suffix_pattern(identifier: &str) -> String {
    format!(r"\w*{}\b", regex::escape(identifier))
}

// ---------------------------------------------------------------------------
// Definition-kind inference
// ---------------------------------------------------------------------------

/// Infer a definition kind from the declaring line. Keyword-table driven;
/// the strongest structural keyword wins so `export class Foo` classifies as
/// a class, not an export. Falls back to call-shape detection, then
/// variable.
pub fn infer_definition_kind(line: &str, name: &str) -> DefinitionKind {
    let trimmed = line.trim_start();

    let has_kw = |kw: &str| {
        trimmed.split(|c: char| !c.is_alphanumeric() && c != '_').any(|w| w == kw)
    };

    if has_kw("class") || has_kw("struct") || has_kw("enum") {
        return DefinitionKind::Class;
    }
    if has_kw("interface") || has_kw("trait") || has_kw("protocol") {
        return DefinitionKind::Interface;
    }
    if has_kw("fn") || has_kw("def") || has_kw("function") || has_kw("func") {
        return DefinitionKind::Function;
    }
    if has_kw("type") || has_kw("typedef") {
        return DefinitionKind::Type;
    }
    if has_kw("import") || has_kw("use") || has_kw("require") || has_kw("from") {
        return DefinitionKind::Import;
    }
    if has_kw("export") || has_kw("module") {
        return DefinitionKind::Export;
    }
    if has_kw("let") || has_kw("const") || has_kw("var") || has_kw("static") {
        return DefinitionKind::Variable;
    }

    // `name(...)` with no declaring keyword reads as a method site.
    if let Some(idx) = trimmed.find(name) {
        let rest = &trimmed[idx + name.len()..];
        if rest.trim_start().starts_with('(') {
            return DefinitionKind::Method;
        }
    }
    DefinitionKind::Variable
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
