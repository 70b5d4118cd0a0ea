//! Producer URI resolution.
//!
//! Lineage producers identify the emitting tool with a versioned URL, e.g.
//! `https://github.com/dbt-labs/dbt-core/tree/1.5.0`. These helpers
//! canonicalize such URLs into a `(name, version)` pair used to group
//! correlation statistics by tool. Resolution never fails: anything
//! unparseable degrades to the `"unknown"` producer so a malformed producer
//! URL can never reject an otherwise valid event.

/// Canonical producer name for URLs that cannot be resolved.
pub const UNKNOWN_PRODUCER: &str = "unknown";

/// Extract the producer name from a producer URL.
///
/// Resolution rules, in priority order:
/// 1. a path segment `integration/<name>` names an integration producer
///    (e.g. `.../OpenLineage/tree/1.0.0/integration/spark` -> `spark`);
/// 2. a GitHub-style URL `github.com/<org>/<repo>/...` yields the repo name
///    (e.g. `github.com/dbt-labs/dbt-core/tree/1.5.0` -> `dbt-core`);
/// 3. any other URL yields its host;
/// 4. empty or unresolvable input yields `"unknown"`.
pub fn extract_producer_name(producer_url: &str) -> String {
    let parts = split_url(producer_url);
    if parts.is_empty() {
        return UNKNOWN_PRODUCER.to_string();
    }

    // Integration producers take priority over the repository name.
    if let Some(name) = segment_after(&parts, "integration") {
        return name.to_string();
    }

    if parts.len() >= 3 && parts[0] == "github.com" {
        return parts[2].to_string();
    }

    if parts[0].is_empty() {
        return UNKNOWN_PRODUCER.to_string();
    }

    parts[0].to_string()
}

/// Extract the producer version from a producer URL.
///
/// A `tree/<version>` segment wins; otherwise, for GitHub-style URLs
/// without `tree/`, the trailing path segment is used when it looks
/// version-like (starts with a digit, or `v` followed by a digit). Returns
/// an empty string when no version can be extracted.
pub fn extract_producer_version(producer_url: &str) -> String {
    let parts = split_url(producer_url);
    if parts.is_empty() {
        return String::new();
    }

    if let Some(version) = segment_after(&parts, "tree") {
        return version.to_string();
    }

    if parts.len() >= 4 && parts[0] == "github.com" && looks_version_like(parts[3]) {
        return parts[3].to_string();
    }

    String::new()
}

/// Resolve a producer URL into its canonical `(name, version)` pair.
pub fn resolve_producer(producer_url: &str) -> (String, String) {
    (
        extract_producer_name(producer_url),
        extract_producer_version(producer_url),
    )
}

fn split_url(producer_url: &str) -> Vec<&str> {
    let trimmed = producer_url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");

    if trimmed.is_empty() {
        return Vec::new();
    }

    trimmed.split('/').collect()
}

/// Returns the segment following the first occurrence of `marker`, if any.
fn segment_after<'a>(parts: &[&'a str], marker: &str) -> Option<&'a str> {
    parts
        .iter()
        .position(|p| *p == marker)
        .and_then(|i| parts.get(i + 1))
        .filter(|s| !s.is_empty())
        .copied()
}

fn looks_version_like(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('v') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}
