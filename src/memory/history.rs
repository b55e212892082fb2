//! Run-history memory backed by the documentation index.
//!
//! Each finished run is written as a JSON summary into the history
//! directory; the external index picks those files up and `find_similar`
//! searches them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::docdex::{DocdexClient, SearchOptions};
use crate::util::{normalize_rel_path, now_string, path_is_under, sanitize_filename, token_overlap_score, tokenize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub request: String,
    /// `pass`, `fail`, `aborted`, ...
    pub outcome: String,
    #[serde(default)]
    pub plan_summary: String,
    #[serde(default)]
    pub touched_files: Vec<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub created_at: String,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, request: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            request: request.into(),
            outcome: outcome.into(),
            plan_summary: String::new(),
            touched_files: Vec::new(),
            reasons: Vec::new(),
            created_at: now_string(),
        }
    }

    fn render(&self) -> String {
        let mut text = format!("[{}] {}", self.outcome, self.request);
        if !self.plan_summary.is_empty() {
            text.push_str(&format!(" => {}", self.plan_summary));
        }
        if !self.touched_files.is_empty() {
            text.push_str(&format!(" [{}]", self.touched_files.join(", ")));
        }
        text
    }
}

/// A past run similar to the current request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryExample {
    pub path: String,
    pub summary: String,
    pub score: f64,
}

pub struct RunHistoryIndexer {
    workspace_root: PathBuf,
    dir: PathBuf,
    docdex: Option<Arc<dyn DocdexClient>>,
}

impl RunHistoryIndexer {
    pub fn new(workspace_root: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            dir: dir.into(),
            docdex: None,
        }
    }

    pub fn with_docdex(mut self, docdex: Arc<dyn DocdexClient>) -> Self {
        self.docdex = Some(docdex);
        self
    }

    /// Write `summary` to `<dir>/<run_id>.json`, returning the path.
    pub async fn record(&self, summary: &RunSummary) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", sanitize_filename(&summary.run_id)));
        let data = serde_json::to_vec_pretty(summary)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to finalize {}", path.display()))?;
        tracing::debug!("Recorded run summary {}", path.display());
        Ok(path)
    }

    /// Search the index for past runs, keep hits inside the history
    /// directory, and rank them by token overlap with `query`.
    pub async fn find_similar(&self, query: &str, limit: usize) -> anyhow::Result<Vec<HistoryExample>> {
        let Some(docdex) = &self.docdex else {
            return Ok(Vec::new());
        };
        let prefix = self.history_prefix();
        let opts = SearchOptions {
            limit: limit.saturating_mul(3).max(limit),
            path_prefix: Some(prefix.clone()),
        };
        let result = docdex.search(query, &opts).await?;

        let query_tokens = tokenize(query);
        let mut examples = Vec::new();
        for hit in result.hits {
            let rel = self.relative(&hit.path);
            if !path_is_under(&rel, &prefix) {
                continue;
            }
            let summary = match self.read_summary(&rel).await {
                Some(summary) => summary.render(),
                None => match &hit.snippet {
                    Some(snippet) => snippet.clone(),
                    None => continue,
                },
            };
            let score = token_overlap_score(&query_tokens, &summary);
            if score > 0.0 {
                examples.push(HistoryExample {
                    path: rel,
                    summary,
                    score,
                });
            }
        }
        examples.sort_by(|a, b| b.score.total_cmp(&a.score));
        examples.truncate(limit);
        Ok(examples)
    }

    fn history_prefix(&self) -> String {
        self.relative(&self.dir.to_string_lossy())
    }

    fn relative(&self, path: &str) -> String {
        let p = Path::new(path);
        let rel = p.strip_prefix(&self.workspace_root).unwrap_or(p);
        normalize_rel_path(&rel.to_string_lossy())
    }

    async fn read_summary(&self, rel: &str) -> Option<RunSummary> {
        let path = if Path::new(rel).is_absolute() {
            PathBuf::from(rel)
        } else {
            self.workspace_root.join(rel)
        };
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!("Failed to parse run summary {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docdex::SearchHit;
    use crate::test_support::FakeDocdex;

    #[tokio::test]
    async fn records_and_finds_similar_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(".codeloop/runs");
        let mut summary = RunSummary::new("run-1", "add login button to header", "pass");
        summary.touched_files = vec!["src/header.tsx".to_string()];

        let docdex = FakeDocdex::default().with_hits(vec![
            SearchHit {
                path: ".codeloop/runs/run-1.json".to_string(),
                score: 0.9,
                snippet: None,
            },
            SearchHit {
                path: "src/header.tsx".to_string(),
                score: 0.8,
                snippet: Some("header button".to_string()),
            },
        ]);
        let indexer = RunHistoryIndexer::new(temp.path(), &dir).with_docdex(Arc::new(docdex));
        let path = indexer.record(&summary).await.unwrap();
        assert!(path.ends_with("run-1.json"));

        let found = indexer.find_similar("login button", 3).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, ".codeloop/runs/run-1.json");
        assert!(found[0].summary.contains("add login button"));
    }

    #[tokio::test]
    async fn without_index_nothing_is_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let indexer = RunHistoryIndexer::new(temp.path(), temp.path().join("runs"));
        assert!(indexer.find_similar("anything", 3).await.unwrap().is_empty());
    }
}
