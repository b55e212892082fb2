//! Golden set: the most recent successful intent → patch examples.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::util::{now_string, token_overlap_score, tokenize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenSetEntry {
    pub intent: String,
    pub plan_summary: String,
    pub touched_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_summary: Option<String>,
    pub created_at: String,
}

impl GoldenSetEntry {
    pub fn new(intent: impl Into<String>, plan_summary: impl Into<String>, touched_files: Vec<String>) -> Self {
        Self {
            intent: intent.into(),
            plan_summary: plan_summary.into(),
            touched_files,
            review_notes: None,
            qa_notes: None,
            patch_summary: None,
            created_at: now_string(),
        }
    }

    fn search_text(&self) -> String {
        let mut text = format!("{} {} {}", self.intent, self.plan_summary, self.touched_files.join(" "));
        if let Some(summary) = &self.patch_summary {
            text.push(' ');
            text.push_str(summary);
        }
        text
    }
}

/// JSONL-backed golden set keeping at most `max_entries` entries.
pub struct GoldenSetStore {
    path: PathBuf,
    max_entries: usize,
    write_lock: Mutex<()>,
}

impl GoldenSetStore {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// All entries, oldest first. Malformed lines are skipped.
    pub async fn load(&self) -> anyhow::Result<Vec<GoldenSetEntry>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<GoldenSetEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping malformed golden-set line in {}: {}", self.path.display(), e),
            }
        }
        Ok(entries)
    }

    /// Append one entry and rewrite the file with the newest `max_entries`.
    pub async fn append(&self, entry: GoldenSetEntry) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.push(entry);
        let overflow = entries.len().saturating_sub(self.max_entries);
        if overflow > 0 {
            entries.drain(..overflow);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut data = String::new();
        for entry in &entries {
            data.push_str(&serde_json::to_string(entry)?);
            data.push('\n');
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to finalize {}", self.path.display()))?;
        Ok(())
    }

    /// Up to `limit` entries with non-zero overlap, best first; newer wins ties.
    pub async fn find_examples(&self, query: &str, limit: usize) -> anyhow::Result<Vec<GoldenSetEntry>> {
        let query_tokens = tokenize(query);
        let mut scored: Vec<(f64, usize, GoldenSetEntry)> = self
            .load()
            .await?
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| (token_overlap_score(&query_tokens, &entry.search_text()), idx, entry))
            .filter(|(score, _, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored.into_iter().take(limit).map(|(_, _, e)| e).collect())
    }
}
