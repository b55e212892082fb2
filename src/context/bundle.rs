//! The context bundle handed from the librarian phase to planning and building.

use serde::{Deserialize, Serialize};

use super::{FileEntry, FileRole, LoadError};
use crate::docdex::SearchHit;
use crate::memory::{GoldenSetEntry, HistoryExample};

/// Intent keyword table: (intent, trigger words).
const INTENT_TABLE: &[(&str, &[&str])] = &[
    (
        "ui",
        &["button", "page", "layout", "style", "css", "component", "modal", "header", "footer", "color", "icon", "responsive"],
    ),
    (
        "content",
        &["copy", "text", "wording", "typo", "label", "translation", "docs", "documentation", "readme", "message"],
    ),
    (
        "behavior",
        &["bug", "fix", "error", "crash", "logic", "validation", "handler", "flow", "retry", "timeout", "behavior"],
    ),
    (
        "data",
        &["schema", "database", "migration", "model", "field", "column", "query", "table", "api", "json"],
    ),
    (
        "testing",
        &["test", "tests", "spec", "coverage", "assert", "mock", "fixture", "e2e"],
    ),
    (
        "infra",
        &["deploy", "docker", "ci", "pipeline", "build", "config", "env", "dependency", "upgrade", "workflow"],
    ),
];

/// Intents and keywords derived from the request text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentSignals {
    pub intents: Vec<String>,
    pub keywords: Vec<String>,
}

impl IntentSignals {
    pub fn derive(request: &str) -> Self {
        let words: Vec<String> = request
            .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();

        let mut intents = Vec::new();
        let mut keywords = Vec::new();
        for (intent, triggers) in INTENT_TABLE {
            let mut matched = false;
            for word in &words {
                if triggers.contains(&word.as_str()) {
                    matched = true;
                    if !keywords.contains(word) {
                        keywords.push(word.clone());
                    }
                }
            }
            if matched {
                intents.push(intent.to_string());
            }
        }
        Self { intents, keywords }
    }

    pub fn has(&self, intent: &str) -> bool {
        self.intents.iter().any(|i| i == intent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub path: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub ast_nodes: usize,
}

/// Files affected by changes to `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactGraph {
    pub path: String,
    pub affected: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBundle {
    pub request: String,
    pub intent: IntentSignals,
    pub queries: Vec<String>,
    pub search_hits: Vec<SearchHit>,
    pub snippets: Vec<Snippet>,
    pub symbols: Vec<SymbolSummary>,
    pub impact: Vec<ImpactGraph>,
    pub files: Vec<FileEntry>,
    pub load_errors: Vec<LoadError>,
    pub golden_examples: Vec<GoldenSetEntry>,
    pub history_examples: Vec<HistoryExample>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized: Option<String>,
}

impl ContextBundle {
    pub fn new(request: impl Into<String>) -> Self {
        let request = request.into();
        Self {
            intent: IntentSignals::derive(&request),
            request,
            ..Default::default()
        }
    }

    pub fn focus_paths(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| f.role == FileRole::Focus)
            .map(|f| f.path.as_str())
            .collect()
    }

    /// Render and cache the prompt text.
    pub fn render(&mut self) -> &str {
        let text = self.serialize_for_prompt();
        self.serialized.insert(text).as_str()
    }

    /// Plain-text rendering used as a system message.
    pub fn serialize_for_prompt(&self) -> String {
        if let Some(cached) = &self.serialized {
            return cached.clone();
        }

        let mut out = String::new();
        out.push_str("# Request\n");
        out.push_str(self.request.trim());
        out.push('\n');

        if !self.intent.intents.is_empty() {
            out.push_str(&format!(
                "\n# Intent\n{} (keywords: {})\n",
                self.intent.intents.join(", "),
                self.intent.keywords.join(", ")
            ));
        }

        if !self.search_hits.is_empty() {
            out.push_str("\n# Search hits\n");
            for hit in &self.search_hits {
                out.push_str(&format!("- {} ({:.2})\n", hit.path, hit.score));
            }
        }

        let focus: Vec<&FileEntry> = self.files.iter().filter(|f| f.role == FileRole::Focus).collect();
        if !focus.is_empty() {
            out.push_str("\n# Focus files\n");
            for file in focus {
                out.push_str(&format!("\n## {}\n```\n{}\n```\n", file.path, file.content.trim_end()));
            }
        }

        let periphery: Vec<&FileEntry> = self
            .files
            .iter()
            .filter(|f| f.role == FileRole::Periphery)
            .collect();
        if !periphery.is_empty() {
            out.push_str("\n# Periphery\n");
            for file in periphery {
                out.push_str(&format!("\n## {}\n{}\n", file.path, file.content.trim_end()));
            }
        }

        if !self.snippets.is_empty() {
            out.push_str("\n# Snippets\n");
            for snippet in &self.snippets {
                out.push_str(&format!("- {}: {}\n", snippet.path, snippet.text.trim()));
            }
        }

        if !self.symbols.is_empty() {
            out.push_str("\n# Symbols\n");
            for summary in &self.symbols {
                out.push_str(&format!("- {}: {}\n", summary.path, summary.symbols.join(", ")));
            }
        }

        if !self.impact.is_empty() {
            out.push_str("\n# Impact\n");
            for graph in &self.impact {
                out.push_str(&format!("- {} -> {}\n", graph.path, graph.affected.join(", ")));
            }
        }

        if !self.golden_examples.is_empty() {
            out.push_str("\n# Past successful changes\n");
            for example in &self.golden_examples {
                out.push_str(&format!(
                    "- {} => {} [{}]\n",
                    example.intent,
                    example.plan_summary,
                    example.touched_files.join(", ")
                ));
            }
        }

        if !self.history_examples.is_empty() {
            out.push_str("\n# Similar past runs\n");
            for example in &self.history_examples {
                out.push_str(&format!("- {}: {}\n", example.path, example.summary));
            }
        }

        if !self.warnings.is_empty() || !self.load_errors.is_empty() {
            out.push_str("\n# Warnings\n");
            for warning in &self.warnings {
                out.push_str(&format!("- {}\n", warning));
            }
            for err in &self.load_errors {
                out.push_str(&format!("- could not load {}: {}\n", err.path, err.error));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SliceStrategy;

    #[test]
    fn derives_intents_from_keywords() {
        let signals = IntentSignals::derive("Fix the header button color and add a test");
        assert_eq!(signals.intents, vec!["ui", "behavior", "testing"]);
        assert!(signals.keywords.contains(&"header".to_string()));
        assert!(signals.has("ui"));
        assert!(!signals.has("infra"));
    }

    #[test]
    fn prompt_lists_files_by_role() {
        let mut bundle = ContextBundle::new("rename the login label");
        bundle.files.push(FileEntry {
            path: "src/login.tsx".to_string(),
            role: FileRole::Focus,
            content: "export const Login = () => null;".to_string(),
            slice_strategy: SliceStrategy::Full,
            original_bytes: 32,
            token_estimate: 8,
            truncated: false,
        });
        bundle.warnings.push("docdex unavailable".to_string());

        let text = bundle.serialize_for_prompt();
        assert!(text.starts_with("# Request\nrename the login label\n"));
        assert!(text.contains("## src/login.tsx"));
        assert!(text.contains("- docdex unavailable"));
        assert_eq!(bundle.focus_paths(), vec!["src/login.tsx"]);

        let rendered = bundle.render().to_string();
        assert_eq!(rendered, text);
        assert!(bundle.serialized.is_some());
    }
}
