//! # Error Knowledge Bridge
//!
//! Converts runtime error knowledge into generation-time anti-patterns, so
//! Run N's smoke failures become Run N+1's prompt warnings. Extraction is
//! structural throughout: entities come from path shape, endpoints are
//! normalized by id-segment replacement, and exception classes are pulled
//! out of logs by delimiter walking rather than by format-specific regexes.
//! Nothing in this module knows any business name.

use crate::lowering::normalize;

/// Replace numeric ids and UUIDs (8-4-4-4-12 hex) in a path with `{id}`.
pub fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|seg| {
            if seg.is_empty() {
                String::new()
            } else if is_numeric(seg) || is_uuid(seg) {
                "{id}".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect();
    segments.join("/")
}

fn is_numeric(seg: &str) -> bool {
    !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit())
}

/// Structural UUID recognition: 8-4-4-4-12 hex groups.
pub fn is_uuid(seg: &str) -> bool {
    let groups: Vec<&str> = seg.split('-').collect();
    if groups.len() != 5 {
        return false;
    }
    let expected = [8usize, 4, 4, 4, 12];
    groups
        .iter()
        .zip(expected)
        .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Extract the entity pattern from an endpoint path: the first segment that
/// is not a parameter, not `api`, and not a version tag, singularized and
/// PascalCase-ified. No hard-coded names.
pub fn extract_entity(path: &str) -> Option<String> {
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        if seg.starts_with('{') || is_numeric(seg) || is_uuid(seg) {
            continue;
        }
        if seg.eq_ignore_ascii_case("api") || is_version_tag(seg) {
            continue;
        }
        return Some(normalize::segment_to_entity(seg));
    }
    None
}

fn is_version_tag(seg: &str) -> bool {
    let mut chars = seg.chars();
    matches!(chars.next(), Some('v' | 'V')) && chars.as_str().chars().all(|c| c.is_ascii_digit())
        && seg.len() > 1
}

/// Extract an exception class from free-form log text.
///
/// Delimiter-based, not regex-based: split on `:`, newlines, and ` - `,
/// then walk dotted paths from the tail and accept any token that starts
/// upper-case and ends in `Error`, `Exception`, or `Warning`. This survives
/// the log format differences between traceback styles.
pub fn extract_exception_class(log: &str) -> Option<String> {
    for raw in log.split(|c| c == ':' || c == '\n' || c == '\r') {
        for piece in raw.split(" - ") {
            let token = piece.trim().trim_matches(|c: char| "\"'()<>".contains(c));
            if token.is_empty() || token.contains(' ') {
                continue;
            }
            // Walk the dotted path from the tail: sqlalchemy.exc.IntegrityError
            // yields IntegrityError.
            let tail = token.rsplit('.').next().unwrap_or(token);
            if is_exception_token(tail) {
                return Some(tail.to_string());
            }
        }
    }
    None
}

fn is_exception_token(token: &str) -> bool {
    let starts_upper = token.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    starts_upper
        && (token.ends_with("Error") || token.ends_with("Exception") || token.ends_with("Warning"))
        && token.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Keyword intersection score between a query name and a stored pattern's
/// token sources. Keywords shorter than 3 characters are discarded; the
/// matching is deliberately domain-agnostic.
pub fn semantic_match_score(query: &str, sources: &[&str]) -> usize {
    let singular = |t: &str| t.strip_suffix('s').unwrap_or(t).to_string();
    let query_keywords: Vec<String> = normalize::keywords(query).iter().map(|k| singular(k)).collect();
    let mut score = 0;
    for keyword in &query_keywords {
        if sources.iter().any(|source| {
            normalize::keywords(source)
                .iter()
                .any(|token| singular(token) == *keyword)
        }) {
            score += 1;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint_replaces_ids() {
        assert_eq!(
            normalize_endpoint("/carts/42/items/9d2f1b34-55aa-4c71-9f0e-1234567890ab"),
            "/carts/{id}/items/{id}"
        );
        assert_eq!(normalize_endpoint("/orders"), "/orders");
    }

    #[test]
    fn test_extract_entity_skips_api_and_versions() {
        assert_eq!(extract_entity("/api/v1/carts/42"), Some("Cart".to_string()));
        assert_eq!(extract_entity("/orders/{id}/pay"), Some("Order".to_string()));
        assert_eq!(extract_entity("/{id}"), None);
    }

    #[test]
    fn test_exception_extraction_from_varied_formats() {
        assert_eq!(
            extract_exception_class("sqlalchemy.exc.IntegrityError: NOT NULL constraint failed"),
            Some("IntegrityError".to_string())
        );
        assert_eq!(
            extract_exception_class("ERROR - ValidationError - field required"),
            Some("ValidationError".to_string())
        );
        assert_eq!(
            extract_exception_class("line 12, in create\nKeyError\n"),
            Some("KeyError".to_string())
        );
        assert_eq!(extract_exception_class("all good, 200 OK"), None);
    }

    #[test]
    fn test_uuid_recognition() {
        assert!(is_uuid("9d2f1b34-55aa-4c71-9f0e-1234567890ab"));
        assert!(!is_uuid("not-a-uuid"));
        assert!(!is_uuid("9d2f1b34-55aa-4c71-9f0e"));
    }

    #[test]
    fn test_semantic_match_counts_shared_keywords() {
        let score = semantic_match_score(
            "add_item_to_cart",
            &["POST /carts/{id}/items", "Cart", "stock underflow on item add"],
        );
        assert!(score >= 2);
    }
}
