//! Typed patch operations parsed from normalized builder output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::normalize_patch_output;

/// Output schema the builder is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    /// `{"patches": [{action, file, search_block?, replace_block?, content?}]}`
    #[default]
    SearchReplace,
    /// `{"files": [{path, content}], "delete": [path]}`
    FileWrites,
}

impl PatchFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchFormat::SearchReplace => "search_replace",
            PatchFormat::FileWrites => "file_writes",
        }
    }

    /// Top-level key the payload must carry.
    pub fn top_level_key(&self) -> &'static str {
        match self {
            PatchFormat::SearchReplace => "patches",
            PatchFormat::FileWrites => "files",
        }
    }

    /// Schema description included in builder and interpreter prompts.
    pub fn schema_hint(&self) -> &'static str {
        match self {
            PatchFormat::SearchReplace => {
                r#"{"patches": [{"action": "replace", "file": "path", "search_block": "exact existing text", "replace_block": "new text"}, {"action": "create", "file": "path", "content": "full file"}, {"action": "delete", "file": "path"}]}"#
            }
            PatchFormat::FileWrites => {
                r#"{"files": [{"path": "path", "content": "full file content"}], "delete": ["path"]}"#
            }
        }
    }
}

impl fmt::Display for PatchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "search_replace" => Ok(PatchFormat::SearchReplace),
            "file_writes" => Ok(PatchFormat::FileWrites),
            other => Err(format!("unknown patch format '{}'", other)),
        }
    }
}

/// One file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PatchOperation {
    Replace {
        #[serde(alias = "path")]
        file: String,
        search_block: String,
        replace_block: String,
    },
    Create {
        #[serde(alias = "path")]
        file: String,
        content: String,
    },
    Delete {
        #[serde(alias = "path")]
        file: String,
    },
}

impl PatchOperation {
    pub fn file(&self) -> &str {
        match self {
            PatchOperation::Replace { file, .. }
            | PatchOperation::Create { file, .. }
            | PatchOperation::Delete { file } => file,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            PatchOperation::Replace { .. } => "replace",
            PatchOperation::Create { .. } => "create",
            PatchOperation::Delete { .. } => "delete",
        }
    }
}

/// Distinct files touched by `ops`, in first-seen order.
pub fn touched_files(ops: &[PatchOperation]) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for op in ops {
        if !files.iter().any(|f| f == op.file()) {
            files.push(op.file().to_string());
        }
    }
    files
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchParseError {
    #[error("builder output contains no parseable JSON")]
    NotJson,

    #[error("builder output is missing the `{expected}` key")]
    SchemaMismatch { expected: String },

    #[error("patch operation {index} is invalid: {reason}")]
    InvalidOperation { index: usize, reason: String },
}

#[derive(Deserialize)]
struct FileWrite {
    #[serde(alias = "file")]
    path: String,
    content: String,
}

/// Normalize `raw` and parse it under `format`.
pub fn parse_patch_output(raw: &str, format: PatchFormat) -> Result<Vec<PatchOperation>, PatchParseError> {
    let normalized = normalize_patch_output(raw).ok_or(PatchParseError::NotJson)?;
    let payload: Value = serde_json::from_str(&normalized).map_err(|_| PatchParseError::NotJson)?;
    let key = format.top_level_key();
    let items = payload
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| PatchParseError::SchemaMismatch {
            expected: key.to_string(),
        })?;

    match format {
        PatchFormat::SearchReplace => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value::<PatchOperation>(item.clone()).map_err(|e| {
                    PatchParseError::InvalidOperation {
                        index,
                        reason: e.to_string(),
                    }
                })
            })
            .collect(),
        PatchFormat::FileWrites => {
            let mut ops = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let write: FileWrite = serde_json::from_value(item.clone()).map_err(|e| {
                    PatchParseError::InvalidOperation {
                        index,
                        reason: e.to_string(),
                    }
                })?;
                ops.push(PatchOperation::Create {
                    file: write.path,
                    content: write.content,
                });
            }
            if let Some(deletes) = payload.get("delete").and_then(Value::as_array) {
                for (offset, item) in deletes.iter().enumerate() {
                    let file = item.as_str().ok_or_else(|| PatchParseError::InvalidOperation {
                        index: items.len() + offset,
                        reason: "delete entries must be path strings".to_string(),
                    })?;
                    ops.push(PatchOperation::Delete {
                        file: file.to_string(),
                    });
                }
            }
            Ok(ops)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_REPLACE: &str = r#"{"patches":[
        {"action":"replace","file":"src/a.rs","search_block":"old","replace_block":"new"},
        {"action":"create","file":"src/b.rs","content":"fn b() {}"},
        {"action":"delete","file":"src/c.rs"}
    ]}"#;

    #[test]
    fn parses_search_replace_operations() {
        let ops = parse_patch_output(SEARCH_REPLACE, PatchFormat::SearchReplace).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0],
            PatchOperation::Replace {
                file: "src/a.rs".into(),
                search_block: "old".into(),
                replace_block: "new".into(),
            }
        );
        assert_eq!(ops[2].action(), "delete");
        assert_eq!(touched_files(&ops), vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
    }

    #[test]
    fn wrapped_payloads_parse_like_unwrapped() {
        let direct = parse_patch_output(SEARCH_REPLACE, PatchFormat::SearchReplace).unwrap();
        let wrappings = [
            format!("```json\n{}\n```", SEARCH_REPLACE),
            format!("Sure, here is the change.\n\n{}", SEARCH_REPLACE),
            format!("json: {}", SEARCH_REPLACE),
            format!("Plan below.\n```\n{}\n```\nThanks!", SEARCH_REPLACE),
        ];
        for wrapped in wrappings {
            let parsed = parse_patch_output(&wrapped, PatchFormat::SearchReplace).unwrap();
            assert_eq!(parsed, direct, "wrapped: {}", wrapped);
        }
    }

    #[test]
    fn file_writes_become_creates_then_deletes() {
        let raw = r##"{"files":[{"path":"a.md","content":"# A"}],"delete":["old.md"]}"##;
        let ops = parse_patch_output(raw, PatchFormat::FileWrites).unwrap();
        assert_eq!(
            ops,
            vec![
                PatchOperation::Create {
                    file: "a.md".into(),
                    content: "# A".into()
                },
                PatchOperation::Delete {
                    file: "old.md".into()
                },
            ]
        );
    }

    #[test]
    fn reports_failure_kinds() {
        assert_eq!(
            parse_patch_output("no json at all", PatchFormat::SearchReplace),
            Err(PatchParseError::NotJson)
        );
        assert_eq!(
            parse_patch_output(r#"{"files":[]}"#, PatchFormat::SearchReplace),
            Err(PatchParseError::SchemaMismatch {
                expected: "patches".into()
            })
        );
        assert!(matches!(
            parse_patch_output(
                r#"{"patches":[{"action":"replace","file":"a"}]}"#,
                PatchFormat::SearchReplace
            ),
            Err(PatchParseError::InvalidOperation { index: 0, .. })
        ));
    }

    #[test]
    fn format_parses_from_str() {
        assert_eq!("file-writes".parse::<PatchFormat>(), Ok(PatchFormat::FileWrites));
        assert!("diff".parse::<PatchFormat>().is_err());
    }
}
