//! Context-management substrate.
//!
//! Each run keeps one conversation *lane* per (job, task, role). Lanes are
//! redacted on write, trimmed to message and byte budgets, summarized when a
//! model's token budget would be exceeded, and persisted as one JSONL file
//! per lane.
//!
//! ```text
//!  append ──► ContextRedactor ──► ContextManager ──► ContextStore (lanes/*.jsonl)
//!                                      │
//!  prepare ◄── ContextSummarizer ◄─────┘
//! ```

mod assembler;
mod bundle;
mod loader;
mod manager;
mod redactor;
mod store;
mod summarizer;

pub use assembler::{AssemblerConfig, AssembledContext, ContextAssembler};
pub use bundle::{ContextBundle, ImpactGraph, IntentSignals, Snippet, SymbolSummary};
pub use loader::{ContextFileLoader, FileEntry, FileRole, LoadError, LoadedFiles, SliceStrategy};
pub use manager::{AppendOptions, ContextManager, LaneMessage, PrepareOptions};
pub use redactor::{ContextRedactor, Redaction};
pub use store::ContextStore;
pub use summarizer::{ContextSummarizer, ExtractiveSummarizer, ProviderSummarizer};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::Role;

/// Errors from the context subsystem.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize lane record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown context lane: {0}")]
    UnknownLane(String),

    #[error("Summarization failed: {0}")]
    Summarize(String),
}

impl ContextError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Phase role owning a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneRole {
    Librarian,
    Architect,
    Builder,
    Critic,
    Custom,
}

impl LaneRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneRole::Librarian => "librarian",
            LaneRole::Architect => "architect",
            LaneRole::Builder => "builder",
            LaneRole::Critic => "critic",
            LaneRole::Custom => "custom",
        }
    }
}

impl std::fmt::Display for LaneRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a lane: one per (job, task, role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneScope {
    pub job_id: String,
    pub task_id: String,
    pub role: LaneRole,
    pub model: Option<String>,
    /// Ephemeral lanes are never read from or written to the store
    pub ephemeral: bool,
}

impl LaneScope {
    pub fn new(job_id: impl Into<String>, task_id: impl Into<String>, role: LaneRole) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            role,
            model: None,
            ephemeral: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Stable lane identifier derived from the scope.
    pub fn lane_id(&self) -> String {
        format!("{}:{}:{}", self.job_id, self.task_id, self.role)
    }
}

/// One persisted lane message. Redaction happens before construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessageRecord {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// In-memory view of a lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextLane {
    pub id: String,
    pub role: LaneRole,
    pub model: Option<String>,
    pub messages: Vec<ContextMessageRecord>,
    pub token_estimate: u64,
    pub updated_at: String,
    pub persisted: bool,
}

impl ContextLane {
    /// Serialized size in bytes, as it would be written to the lane file.
    pub fn byte_size(&self) -> usize {
        self.messages.iter().map(store::record_bytes).sum()
    }

    /// Total characters across message contents.
    pub fn char_count(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_id_combines_scope_parts() {
        let scope = LaneScope::new("job-1", "task-7", LaneRole::Critic);
        assert_eq!(scope.lane_id(), "job-1:task-7:critic");
    }

    #[test]
    fn record_omits_empty_optionals() {
        let record = ContextMessageRecord {
            role: Role::User,
            content: "hi".to_string(),
            name: None,
            ts: "2024-01-01T00:00:00Z".to_string(),
            model: None,
            tokens: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("name").is_none());
        assert_eq!(json["role"], "user");
    }
}
