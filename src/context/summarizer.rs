//! Lane summarization.
//!
//! When a lane outgrows the target model's token budget, its history is
//! collapsed into a short synopsis that replaces the messages in the prompt.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ContextError, ContextMessageRecord};
use crate::provider::{ChatMessage, Provider, ProviderRequest};
use crate::util::truncate_bytes;

/// Collapses lane history into a synopsis of at most `max_chars` characters.
#[async_trait]
pub trait ContextSummarizer: Send + Sync {
    async fn summarize(
        &self,
        messages: &[ContextMessageRecord],
        max_chars: usize,
    ) -> Result<String, ContextError>;
}

/// Keeps the first line of recent messages, newest last, within the budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveSummarizer;

const LINE_MAX_CHARS: usize = 240;

#[async_trait]
impl ContextSummarizer for ExtractiveSummarizer {
    async fn summarize(
        &self,
        messages: &[ContextMessageRecord],
        max_chars: usize,
    ) -> Result<String, ContextError> {
        let mut lines: Vec<String> = Vec::new();
        let mut used = 0;
        let mut omitted = 0;

        for message in messages.iter().rev() {
            let first_line = message.content.lines().find(|l| !l.trim().is_empty());
            let Some(first_line) = first_line else {
                continue;
            };
            let line = format!(
                "{}: {}",
                message.role.as_str().to_uppercase(),
                clip_chars(first_line.trim(), LINE_MAX_CHARS)
            );
            let cost = line.chars().count() + 1;
            if used + cost > max_chars {
                omitted += 1;
                continue;
            }
            used += cost;
            lines.push(line);
        }

        lines.reverse();
        if omitted > 0 {
            let note = format!("[{} earlier messages omitted]", omitted);
            if used + note.chars().count() < max_chars {
                lines.insert(0, note);
            }
        }
        Ok(lines.join("\n"))
    }
}

/// Asks a provider for the synopsis.
pub struct ProviderSummarizer {
    provider: Arc<dyn Provider>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ContextSummarizer for ProviderSummarizer {
    async fn summarize(
        &self,
        messages: &[ContextMessageRecord],
        max_chars: usize,
    ) -> Result<String, ContextError> {
        let mut transcript = String::new();
        for message in messages {
            transcript.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
        }
        let request = ProviderRequest::new(vec![
            ChatMessage::system(format!(
                "Summarize the conversation below for a coding agent. Keep decisions, file paths, \
                 open problems and constraints. Answer in at most {} characters.",
                max_chars
            )),
            ChatMessage::user(transcript),
        ])
        .with_temperature(0.0);

        let response = self
            .provider
            .generate(request)
            .await
            .map_err(|e| ContextError::Summarize(e.to_string()))?;
        let summary = response.content().trim();
        if summary.is_empty() {
            return Err(ContextError::Summarize("provider returned an empty summary".to_string()));
        }
        Ok(clip_chars(summary, max_chars))
    }
}

fn clip_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", truncate_bytes(text, idx)),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;
    use crate::test_support::ScriptedProvider;

    fn record(role: Role, content: &str) -> ContextMessageRecord {
        ContextMessageRecord {
            role,
            content: content.to_string(),
            name: None,
            ts: crate::util::now_string(),
            model: None,
            tokens: None,
        }
    }

    #[tokio::test]
    async fn extractive_keeps_recent_first_lines() {
        let messages = vec![
            record(Role::User, "add a login button\nwith details"),
            record(Role::Assistant, "plan: edit header.tsx"),
        ];
        let summary = ExtractiveSummarizer.summarize(&messages, 500).await.unwrap();
        assert_eq!(summary, "USER: add a login button\nASSISTANT: plan: edit header.tsx");
    }

    #[tokio::test]
    async fn extractive_respects_budget() {
        let messages: Vec<_> = (0..50)
            .map(|i| record(Role::User, &format!("message number {}", i)))
            .collect();
        let summary = ExtractiveSummarizer.summarize(&messages, 120).await.unwrap();
        assert!(summary.chars().count() <= 120);
        assert!(summary.contains("message number 49"));
        assert!(!summary.contains("message number 0\n"));
    }

    #[tokio::test]
    async fn provider_summary_is_clipped() {
        let provider = Arc::new(ScriptedProvider::with_texts(vec!["x".repeat(50)]));
        let summarizer = ProviderSummarizer::new(provider.clone());
        let summary = summarizer
            .summarize(&[record(Role::User, "hello")], 10)
            .await
            .unwrap();
        assert_eq!(summary, format!("{}...", "x".repeat(10)));
        assert_eq!(provider.requests().len(), 1);
    }
}
