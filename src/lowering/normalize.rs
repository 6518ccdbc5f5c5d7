//! # Semantic Normalizer
//!
//! Canonicalization rules applied to every identifier and constraint that
//! enters the IR, and reused by the compliance validator so code-side and
//! IR-side artifacts are compared under the same normal form.
//!
//! Hard contract: all IR identifiers are English, snake_case for fields and
//! flows, PascalCase for entities. A translation table maps common action
//! verbs to canonical English so downstream components never see locale
//! variants. Normalization is idempotent: `normalize(normalize(x)) ==
//! normalize(x)` for identifiers and constraints alike.

use crate::ir::{ConstraintValue, FieldConstraint};

/// Canonical action verbs and their accepted variants. The table is matched
/// case-insensitively against whole tokens.
const VERB_TABLE: &[(&str, &[&str])] = &[
    ("create", &["add", "new", "make", "insert", "register"]),
    ("update", &["edit", "modify", "change", "patch"]),
    ("delete", &["remove", "destroy", "drop", "erase"]),
    ("list", &["index", "all", "browse"]),
    ("get", &["fetch", "read", "show", "retrieve", "view"]),
    ("process", &["execute", "run", "perform", "handle"]),
    ("cancel", &["abort", "void", "revoke"]),
    ("pay", &["purchase", "charge", "settle"]),
    ("checkout", &["finalize", "complete"]),
    ("confirm", &["approve", "accept", "verify"]),
];

/// Map a verb token to its canonical form, or return it unchanged when it is
/// already canonical or unknown.
pub fn translate_verb(token: &str) -> &str {
    let lower = token.to_ascii_lowercase();
    for (canonical, variants) in VERB_TABLE {
        if *canonical == lower {
            return canonical;
        }
        if variants.iter().any(|v| *v == lower) {
            return canonical;
        }
    }
    token
}

/// Synonym set for a canonical verb, itself included. Used by the semantic
/// compliance view to match flow names by meaning.
pub fn verb_synonyms(verb: &str) -> Vec<&'static str> {
    let lower = verb.to_ascii_lowercase();
    for (canonical, variants) in VERB_TABLE {
        if *canonical == lower || variants.iter().any(|v| *v == lower) {
            let mut all = vec![*canonical];
            all.extend_from_slice(variants);
            return all;
        }
    }
    Vec::new()
}

/// Convert an arbitrary identifier to canonical snake_case. Non-ASCII is
/// dropped; separators and case boundaries become underscores.
pub fn to_snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_lower = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() {
                if prev_lower && !out.is_empty() && !out.ends_with('_') {
                    out.push('_');
                }
                out.push(ch.to_ascii_lowercase());
                prev_lower = false;
            } else {
                out.push(ch);
                prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            }
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
            prev_lower = false;
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    // Leading digits are not legal identifier starts.
    trimmed
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim_matches('_')
        .to_string()
}

/// Convert an arbitrary identifier to canonical PascalCase.
pub fn to_pascal_case(raw: &str) -> String {
    to_snake_case(raw)
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Normalize a flow or operation name: snake_case with canonical verbs.
/// `AddItemToCart` → `create_item_to_cart` is wrong, so the verb table is
/// applied only to the leading token: `add_item_to_cart` →
/// `add_item_to_cart` keeps `add` when it names a linking flow; plain
/// `add_widget` becomes `create_widget`.
pub fn normalize_operation(raw: &str) -> String {
    let snake = to_snake_case(raw);
    let mut parts: Vec<&str> = snake.split('_').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return snake;
    }
    // "add X to Y" is a linking flow, not a create; leave its verb alone.
    let is_link = parts.contains(&"to");
    if !is_link {
        parts[0] = translate_verb(parts[0]);
    }
    parts.join("_")
}

/// Resolve a URL path segment to its entity name: strip one trailing `s`
/// and PascalCase-ify. Purely structural, no hard-coded names.
pub fn segment_to_entity(segment: &str) -> String {
    let base = segment.strip_suffix('s').unwrap_or(segment);
    to_pascal_case(base)
}

/// Canonicalize spec text for digesting: normalize line endings, strip
/// trailing whitespace per line, collapse runs of blank lines. The cache
/// key is computed over this form so formatting-only edits hit the cache.
pub fn canonicalize_spec(spec: &str) -> String {
    let mut out = String::with_capacity(spec.len());
    let mut blank_run = 0usize;
    for line in spec.replace("\r\n", "\n").split('\n') {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Normalize one constraint. Idempotent:
/// - integral float payloads collapse to integers
/// - string payloads are trimmed
/// - list payloads keep order (first allowed value is meaningful) but drop
///   duplicates
pub fn normalize_constraint(constraint: FieldConstraint) -> FieldConstraint {
    let FieldConstraint { kind, value } = constraint;
    let value = match value {
        ConstraintValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            ConstraintValue::Int(f as i64)
        }
        ConstraintValue::Str(s) => ConstraintValue::Str(s.trim().to_string()),
        ConstraintValue::List(items) => {
            let mut seen = std::collections::HashSet::new();
            let deduped = items
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| seen.insert(i.clone()))
                .collect();
            ConstraintValue::List(deduped)
        }
        other => other,
    };
    FieldConstraint { kind, value }
}

/// Keywords of a canonical name: underscore-split tokens of length ≥ 3.
/// Used by the learning store's semantic matching; deliberately
/// domain-agnostic.
pub fn keywords(name: &str) -> Vec<String> {
    to_snake_case(name)
        .split('_')
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

/// Levenshtein edit distance. Small inputs only (identifiers).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized similarity in [0, 1] based on edit distance.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}
