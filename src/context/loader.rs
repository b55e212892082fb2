//! Focus/periphery file loading under byte budgets.
//!
//! Focus files carry real content, sliced head/middle/tail when over budget.
//! Periphery source files carry only a symbol skeleton; periphery docs are
//! loaded in full. A failing file is recorded in `load_errors` and the rest
//! of the batch keeps loading.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ContextRedactor;
use crate::config::{FileLoaderConfig, ReadStrategy};
use crate::docdex::{extract_text, symbol_names, DocdexClient, OpenFileOptions};
use crate::util::{
    ceil_char_boundary, estimate_tokens, floor_char_boundary, normalize_rel_path, path_is_under,
    truncate_bytes,
};

const TRUNCATION_MARKER: &str = "\n...truncated...\n";
const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "rst", "txt", "adoc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Focus,
    Periphery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStrategy {
    Full,
    HeadMiddleTail,
    HeadMiddleTailSkeleton,
    Skeleton,
    SkeletonTruncated,
    DocFull,
}

/// One loaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub role: FileRole,
    pub content: String,
    pub slice_strategy: SliceStrategy,
    pub original_bytes: usize,
    pub token_estimate: u64,
    pub truncated: bool,
}

/// A file that could not be loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadError {
    pub path: String,
    pub role: FileRole,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedFiles {
    pub entries: Vec<FileEntry>,
    pub load_errors: Vec<LoadError>,
}

pub struct ContextFileLoader {
    workspace_root: PathBuf,
    config: FileLoaderConfig,
    chars_per_token: f64,
    docdex: Option<Arc<dyn DocdexClient>>,
    redactor: Option<Arc<ContextRedactor>>,
}

impl ContextFileLoader {
    pub fn new(workspace_root: impl Into<PathBuf>, config: FileLoaderConfig, chars_per_token: f64) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            config,
            chars_per_token,
            docdex: None,
            redactor: None,
        }
    }

    pub fn with_docdex(mut self, docdex: Arc<dyn DocdexClient>) -> Self {
        self.docdex = Some(docdex);
        self
    }

    /// Ignore-file checks and content redaction.
    pub fn with_redactor(mut self, redactor: Arc<ContextRedactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    pub async fn load_focus(&self, paths: &[String]) -> LoadedFiles {
        let mut out = LoadedFiles::default();
        for path in paths {
            match self.load_one(path, FileRole::Focus).await {
                Ok(entry) => out.entries.push(entry),
                Err(error) => out.load_errors.push(self.record_error(path, FileRole::Focus, error)),
            }
        }
        out
    }

    pub async fn load_periphery(&self, paths: &[String]) -> LoadedFiles {
        let mut out = LoadedFiles::default();
        for path in paths {
            match self.load_one(path, FileRole::Periphery).await {
                Ok(entry) => out.entries.push(entry),
                Err(error) => out
                    .load_errors
                    .push(self.record_error(path, FileRole::Periphery, error)),
            }
        }
        out
    }

    fn record_error(&self, path: &str, role: FileRole, error: String) -> LoadError {
        tracing::debug!("Failed to load {:?} file {}: {}", role, path, error);
        LoadError {
            path: path.to_string(),
            role,
            error,
        }
    }

    async fn load_one(&self, path: &str, role: FileRole) -> Result<FileEntry, String> {
        let (rel, abs) = self.resolve(path)?;
        if let Some(redactor) = &self.redactor {
            if redactor.should_ignore(Path::new(&rel)) {
                return Err("path is ignored".to_string());
            }
        }

        let is_doc = self.is_doc(&rel);
        let (content, strategy, original_bytes, truncated) = match role {
            FileRole::Focus => {
                let raw = self.read_content(&rel, &abs).await?;
                let original = raw.len();
                if original <= self.config.focus_max_file_bytes {
                    (raw, SliceStrategy::Full, original, false)
                } else {
                    let sliced = slice_head_middle_tail(&raw, self.config.focus_max_file_bytes);
                    let skeleton = self.skeleton(&rel, &raw).await;
                    if skeleton.is_empty() {
                        (sliced, SliceStrategy::HeadMiddleTail, original, true)
                    } else {
                        (
                            format!("{}\n\n[skeleton]\n{}", sliced, skeleton),
                            SliceStrategy::HeadMiddleTailSkeleton,
                            original,
                            true,
                        )
                    }
                }
            }
            FileRole::Periphery if is_doc => {
                let raw = self.read_content(&rel, &abs).await?;
                let original = raw.len();
                (raw, SliceStrategy::DocFull, original, false)
            }
            FileRole::Periphery => {
                let raw = self.read_content(&rel, &abs).await?;
                let original = raw.len();
                let skeleton = self.skeleton(&rel, &raw).await;
                if skeleton.len() <= self.config.periphery_max_bytes {
                    (skeleton, SliceStrategy::Skeleton, original, false)
                } else {
                    let cut = truncate_bytes(&skeleton, self.config.periphery_max_bytes);
                    (
                        format!("{}{}", cut, TRUNCATION_MARKER.trim_end()),
                        SliceStrategy::SkeletonTruncated,
                        original,
                        true,
                    )
                }
            }
        };

        let content = match &self.redactor {
            Some(redactor) => redactor.redact(&content).content,
            None => content,
        };
        Ok(FileEntry {
            token_estimate: estimate_tokens(content.chars().count(), self.chars_per_token),
            path: rel,
            role,
            content,
            slice_strategy: strategy,
            original_bytes,
            truncated,
        })
    }

    /// Workspace-relative and absolute forms of `path`; rejects escapes.
    fn resolve(&self, path: &str) -> Result<(String, PathBuf), String> {
        let candidate = Path::new(path);
        let rel_path = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.workspace_root)
                .map_err(|_| "path is outside the workspace".to_string())?
                .to_path_buf()
        } else {
            candidate.to_path_buf()
        };
        if rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err("path is outside the workspace".to_string());
        }
        let rel = normalize_rel_path(&rel_path.to_string_lossy());
        if rel.is_empty() {
            return Err("empty path".to_string());
        }
        let abs = self.workspace_root.join(&rel);
        Ok((rel, abs))
    }

    fn is_doc(&self, rel: &str) -> bool {
        if self.config.docs_prefixes.iter().any(|p| path_is_under(rel, p)) {
            return true;
        }
        Path::new(rel)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| DOC_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    async fn read_content(&self, rel: &str, abs: &Path) -> Result<String, String> {
        if self.config.read_strategy == ReadStrategy::Docdex {
            if let Some(docdex) = &self.docdex {
                match docdex.open_file(rel, &OpenFileOptions::default()).await {
                    Ok(payload) => {
                        if let Some(text) = extract_text(&payload) {
                            return Ok(text);
                        }
                        tracing::debug!("Docdex payload for {} has no text; reading from disk", rel);
                    }
                    Err(e) => {
                        tracing::debug!("Docdex open failed for {}: {}; reading from disk", rel, e);
                    }
                }
            }
        }
        let bytes = tokio::fs::read(abs).await.map_err(|e| e.to_string())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Symbol skeleton from docdex when available, else from declaration lines.
    async fn skeleton(&self, rel: &str, content: &str) -> String {
        if let Some(docdex) = &self.docdex {
            match docdex.symbols(rel).await {
                Ok(payload) => {
                    let names = symbol_names(&payload);
                    if !names.is_empty() {
                        return names.join("\n");
                    }
                }
                Err(e) => tracing::debug!("Docdex symbols failed for {}: {}", rel, e),
            }
        }
        heuristic_skeleton(content)
    }
}

/// Keep 40% head, 20% middle, 40% tail of the byte budget.
fn slice_head_middle_tail(content: &str, budget: usize) -> String {
    let marker_total = TRUNCATION_MARKER.len() * 2;
    let usable = budget.saturating_sub(marker_total);
    let head_len = usable * 2 / 5;
    let middle_len = usable / 5;
    let tail_len = usable - head_len - middle_len;

    let head_end = floor_char_boundary(content, head_len);
    let mid_center = content.len() / 2;
    let mid_start = ceil_char_boundary(content, mid_center.saturating_sub(middle_len / 2).max(head_end));
    let mid_end = floor_char_boundary(content, (mid_start + middle_len).min(content.len()));
    let tail_start = ceil_char_boundary(content, content.len().saturating_sub(tail_len).max(mid_end));

    let mut out = String::with_capacity(budget);
    out.push_str(&content[..head_end]);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&content[mid_start..mid_end.max(mid_start)]);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&content[tail_start..]);
    out
}

fn declaration_regex() -> Option<&'static Regex> {
    static DECLARATION: OnceLock<Option<Regex>> = OnceLock::new();
    DECLARATION
        .get_or_init(|| {
            Regex::new(
                r"^\s*(?:(?:pub(?:\([^)]*\))?|export(?:\s+default)?|async|public|private|protected|static|abstract)\s+)*(?:fn|struct|enum|trait|impl|mod|type|const|class|interface|function|def|func)\b",
            )
            .ok()
        })
        .as_ref()
}

/// Declaration lines (`L12: pub fn run(...)`) found by pattern matching.
fn heuristic_skeleton(content: &str) -> String {
    let Some(re) = declaration_regex() else {
        return String::new();
    };
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(idx, line)| {
            let line = line.trim_end().trim_end_matches('{').trim_end();
            format!("L{}: {}", idx + 1, line.trim_start())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::test_support::FakeDocdex;

    fn loader(root: &Path, config: FileLoaderConfig) -> ContextFileLoader {
        ContextFileLoader::new(root, config, 4.0)
    }

    fn source_file(lines: usize) -> String {
        let mut out = String::new();
        for i in 0..lines {
            if i % 10 == 0 {
                out.push_str(&format!("pub fn item_{}() {{\n", i));
            } else {
                out.push_str(&format!("    let value_{} = {};\n", i, i));
            }
        }
        out
    }

    #[tokio::test]
    async fn focus_small_file_is_full() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.rs"), "fn a() {}\n").unwrap();
        let loaded = loader(temp.path(), FileLoaderConfig::default())
            .load_focus(&["a.rs".to_string()])
            .await;
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].slice_strategy, SliceStrategy::Full);
        assert_eq!(loaded.entries[0].content, "fn a() {}\n");
    }

    #[tokio::test]
    async fn focus_large_file_is_sliced_with_skeleton() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("big.rs"), source_file(2_000)).unwrap();
        let config = FileLoaderConfig {
            focus_max_file_bytes: 2_000,
            ..Default::default()
        };
        let loaded = loader(temp.path(), config).load_focus(&["big.rs".to_string()]).await;
        let entry = &loaded.entries[0];
        assert_eq!(entry.slice_strategy, SliceStrategy::HeadMiddleTailSkeleton);
        assert!(entry.truncated);
        assert!(entry.content.contains("...truncated..."));
        assert!(entry.content.contains("L1991: pub fn item_1990()"));
        assert!(entry.content.starts_with("pub fn item_0()"));
    }

    #[tokio::test]
    async fn periphery_source_is_skeleton_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("lib.rs"), source_file(30)).unwrap();
        let loaded = loader(temp.path(), FileLoaderConfig::default())
            .load_periphery(&["lib.rs".to_string()])
            .await;
        let entry = &loaded.entries[0];
        assert_eq!(entry.slice_strategy, SliceStrategy::Skeleton);
        assert_eq!(entry.content, "L1: pub fn item_0()\nL11: pub fn item_10()\nL21: pub fn item_20()");
        assert!(!entry.content.contains("let value_"));
    }

    #[tokio::test]
    async fn periphery_skeleton_is_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("lib.rs"), source_file(5_000)).unwrap();
        let config = FileLoaderConfig {
            periphery_max_bytes: 200,
            ..Default::default()
        };
        let loaded = loader(temp.path(), config).load_periphery(&["lib.rs".to_string()]).await;
        let entry = &loaded.entries[0];
        assert_eq!(entry.slice_strategy, SliceStrategy::SkeletonTruncated);
        assert!(entry.content.len() <= 200 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn periphery_docs_are_loaded_in_full() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("docs")).unwrap();
        std::fs::write(temp.path().join("docs/guide.txt"), "How to deploy.\n").unwrap();
        let loaded = loader(temp.path(), FileLoaderConfig::default())
            .load_periphery(&["docs/guide.txt".to_string()])
            .await;
        assert_eq!(loaded.entries[0].slice_strategy, SliceStrategy::DocFull);
        assert_eq!(loaded.entries[0].content, "How to deploy.\n");
    }

    #[tokio::test]
    async fn failures_are_recorded_without_aborting() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("ok.rs"), "fn ok() {}\n").unwrap();
        std::fs::write(temp.path().join(".env"), "SECRET=1\n").unwrap();
        let mut redactor = ContextRedactor::new(temp.path(), &ContextConfig::default()).unwrap();
        redactor.load_ignore_matchers();
        let loaded = loader(temp.path(), FileLoaderConfig::default())
            .with_redactor(Arc::new(redactor))
            .load_focus(&[
                "missing.rs".to_string(),
                "../escape.rs".to_string(),
                ".env".to_string(),
                "ok.rs".to_string(),
            ])
            .await;
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].path, "ok.rs");
        let failed: Vec<&str> = loaded.load_errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(failed, vec!["missing.rs", "../escape.rs", ".env"]);
        assert!(loaded.load_errors.iter().all(|e| e.role == FileRole::Focus));
    }

    #[tokio::test]
    async fn docdex_strategy_falls_back_to_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.rs"), "from disk\n").unwrap();
        std::fs::write(temp.path().join("b.rs"), "also disk\n").unwrap();
        let docdex = FakeDocdex::default()
            .with_file("a.rs", serde_json::json!({"content": "from index"}))
            .with_file("b.rs", serde_json::json!({"meta": "no text"}));
        let config = FileLoaderConfig {
            read_strategy: ReadStrategy::Docdex,
            ..Default::default()
        };
        let loaded = loader(temp.path(), config)
            .with_docdex(Arc::new(docdex))
            .load_focus(&["a.rs".to_string(), "b.rs".to_string()])
            .await;
        assert_eq!(loaded.entries[0].content, "from index");
        assert_eq!(loaded.entries[1].content, "also disk\n");
    }

    #[test]
    fn slice_respects_budget() {
        let content = "x".repeat(10_000);
        let sliced = slice_head_middle_tail(&content, 1_000);
        assert!(sliced.len() <= 1_000);
        assert_eq!(sliced.matches("...truncated...").count(), 2);
    }
}
