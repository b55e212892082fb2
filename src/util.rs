//! Shared utility functions used across the codebase.

use std::collections::HashSet;

use chrono::Utc;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Split a comma-separated environment variable into trimmed, non-empty items.
pub fn env_var_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

/// Split a comma-separated string into trimmed, non-empty items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Current time as an RFC 3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Sanitize a string for use as a filename.
pub fn sanitize_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let out = out.trim_matches('.').to_string();
    if out.is_empty() {
        "default".to_string()
    } else {
        out
    }
}

/// Normalize a workspace-relative path for comparisons.
///
/// Backslashes become forward slashes, leading `./` and trailing `/` are
/// dropped, and repeated separators collapse.
pub fn normalize_rel_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if unified.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Whether `path` equals `prefix` or lives underneath it.
pub fn path_is_under(path: &str, prefix: &str) -> bool {
    let path = normalize_rel_path(path);
    let prefix = normalize_rel_path(prefix);
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Largest index `<= index` that falls on a char boundary of `text`.
pub fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest index `>= index` that falls on a char boundary of `text`.
pub fn ceil_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Truncate `text` to at most `max_bytes`, never splitting a character.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    &text[..floor_char_boundary(text, max_bytes)]
}

/// Estimate tokens from a character count using a chars-per-token ratio.
pub fn estimate_tokens(chars: usize, chars_per_token: f64) -> u64 {
    if chars == 0 || chars_per_token <= 0.0 {
        return 0;
    }
    (chars as f64 / chars_per_token).ceil() as u64
}

/// Lowercased alphanumeric tokens of at least three characters.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fraction of query tokens that also appear in `candidate` (0.0 - 1.0).
pub fn token_overlap_score(query: &HashSet<String>, candidate: &str) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let candidate = tokenize(candidate);
    let shared = query.iter().filter(|t| candidate.contains(*t)).count();
    shared as f64 / query.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rel_path_strips_noise() {
        assert_eq!(normalize_rel_path("./src//lib.rs"), "src/lib.rs");
        assert_eq!(normalize_rel_path("docs\\guide\\"), "docs/guide");
        assert_eq!(normalize_rel_path("/abs/path"), "/abs/path");
    }

    #[test]
    fn path_is_under_matches_prefix_segments() {
        assert!(path_is_under("docs/readme.md", "docs"));
        assert!(path_is_under("docs", "docs/"));
        assert!(!path_is_under("docsite/index.md", "docs"));
    }

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        let text = "héllo";
        assert_eq!(truncate_bytes(text, 2), "h");
        assert_eq!(truncate_bytes(text, 3), "hé");
        assert_eq!(truncate_bytes(text, 100), "héllo");
    }

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0, 4.0), 0);
        assert_eq!(estimate_tokens(9, 4.0), 3);
    }

    #[test]
    fn token_overlap_counts_shared_terms() {
        let query = tokenize("Add login button to header");
        let score = token_overlap_score(&query, "header login styles");
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn sanitize_filename_replaces_separators() {
        assert_eq!(sanitize_filename("job:1/task 2"), "job_1_task_2");
        assert_eq!(sanitize_filename(""), "default");
    }
}
