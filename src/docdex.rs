//! Narrow client interface to the documentation index (search, symbols, AST,
//! hook validation).
//!
//! Payloads for `open_file`, `symbols` and `ast` are index-defined JSON; the
//! helpers here pull the parts the context loader relies on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocdexError {
    #[error("Docdex request failed: {0}")]
    Request(String),

    #[error("Docdex hooks failed: {0}")]
    HooksFailed(String),

    #[error("Docdex unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: usize,
    /// Restrict hits to paths under this prefix
    pub path_prefix: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 8,
            path_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenFileOptions {
    pub start_line: Option<usize>,
    pub end_line: Option<usize>,
    pub max_bytes: Option<usize>,
}

/// Documentation-index client.
#[async_trait]
pub trait DocdexClient: Send + Sync {
    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResult, DocdexError>;

    /// Run the index's validation hooks over `files`; `Err` means they failed.
    async fn hooks_validate(&self, files: &[String]) -> Result<(), DocdexError>;

    async fn open_file(&self, path: &str, opts: &OpenFileOptions) -> Result<Value, DocdexError>;

    async fn symbols(&self, path: &str) -> Result<Value, DocdexError>;

    async fn ast(&self, path: &str) -> Result<Value, DocdexError>;
}

/// Text carried by an `open_file` payload, if any.
///
/// Accepts a bare string, `content`/`text` fields, or a `lines` array of
/// strings or `{text}` objects.
pub fn extract_text(payload: &Value) -> Option<String> {
    match payload {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => {
            for key in ["content", "text"] {
                if let Some(Value::String(s)) = map.get(key) {
                    if !s.is_empty() {
                        return Some(s.clone());
                    }
                }
            }
            if let Some(Value::Array(lines)) = map.get("lines") {
                let joined: Vec<String> = lines
                    .iter()
                    .filter_map(|line| match line {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o.get("text").and_then(Value::as_str).map(str::to_string),
                        _ => None,
                    })
                    .collect();
                if !joined.is_empty() {
                    return Some(joined.join("\n"));
                }
            }
            map.get("file").and_then(extract_text)
        }
        _ => None,
    }
}

/// Symbol names from a `symbols` payload (array, or `{symbols: [...]}`).
///
/// Entries may be plain strings or objects with `name` and optional
/// `kind`/`line`, rendered as `kind name (Lline)`.
pub fn symbol_names(payload: &Value) -> Vec<String> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("symbols") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    list.iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => {
                let name = o.get("name")?.as_str()?;
                let mut rendered = match o.get("kind").and_then(Value::as_str) {
                    Some(kind) => format!("{} {}", kind, name),
                    None => name.to_string(),
                };
                if let Some(line) = o.get("line").and_then(Value::as_u64) {
                    rendered.push_str(&format!(" (L{})", line));
                }
                Some(rendered)
            }
            _ => None,
        })
        .collect()
}

/// Count of top-level nodes in an `ast` payload (`nodes` array or bare array).
pub fn ast_node_count(payload: &Value) -> usize {
    match payload {
        Value::Array(items) => items.len(),
        Value::Object(map) => map
            .get("nodes")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_text_from_common_shapes() {
        assert_eq!(extract_text(&json!("plain")).as_deref(), Some("plain"));
        assert_eq!(extract_text(&json!({"content": "a"})).as_deref(), Some("a"));
        assert_eq!(
            extract_text(&json!({"lines": ["x", {"text": "y"}]})).as_deref(),
            Some("x\ny")
        );
        assert_eq!(extract_text(&json!({"file": {"text": "z"}})).as_deref(), Some("z"));
        assert_eq!(extract_text(&json!({"meta": 1})), None);
        assert_eq!(extract_text(&json!({"content": ""})), None);
    }

    #[test]
    fn renders_symbol_entries() {
        let payload = json!({"symbols": [
            "helper",
            {"name": "run", "kind": "fn", "line": 12},
            {"kind": "struct"}
        ]});
        assert_eq!(symbol_names(&payload), vec!["helper", "fn run (L12)"]);
    }
}
