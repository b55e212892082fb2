//! Lane ownership, budgets and prompt preparation.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;

use super::store::record_bytes;
use super::{
    ContextBundle, ContextError, ContextLane, ContextMessageRecord, ContextRedactor, ContextStore,
    ContextSummarizer, ExtractiveSummarizer, LaneScope,
};
use crate::config::ContextConfig;
use crate::logging::{NoopRunLogger, SharedLogger};
use crate::provider::{ChatMessage, Role};
use crate::util::{estimate_tokens, now_string};

/// A message to append to a lane, before redaction.
#[derive(Debug, Clone)]
pub struct LaneMessage {
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
    pub model: Option<String>,
}

impl LaneMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AppendOptions {
    /// `false` keeps the message in memory only
    pub persist: bool,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions<'a> {
    pub model: Option<&'a str>,
    pub system_prompt: Option<&'a str>,
    pub bundle: Option<&'a ContextBundle>,
}

struct LaneState {
    lane: ContextLane,
    ephemeral: bool,
    /// Parallel to `lane.messages`; `false` marks memory-only records
    durable: Vec<bool>,
}

impl LaneState {
    fn push(&mut self, record: ContextMessageRecord, durable: bool) {
        self.lane.messages.push(record);
        self.durable.push(durable);
    }

    fn drop_oldest(&mut self, count: usize) -> Vec<ContextMessageRecord> {
        let count = count.min(self.lane.messages.len());
        self.durable.drain(..count);
        self.lane.messages.drain(..count).collect()
    }

    /// Records that belong in the lane file.
    fn durable_messages(&self) -> Vec<ContextMessageRecord> {
        self.lane
            .messages
            .iter()
            .zip(&self.durable)
            .filter(|(_, durable)| **durable)
            .map(|(record, _)| record.clone())
            .collect()
    }
}

/// Owns every lane of a run.
pub struct ContextManager {
    config: ContextConfig,
    store: Option<ContextStore>,
    redactor: Arc<ContextRedactor>,
    summarizer: Arc<dyn ContextSummarizer>,
    logger: SharedLogger,
    lanes: RwLock<HashMap<String, LaneState>>,
}

impl ContextManager {
    pub fn new(
        config: ContextConfig,
        store: Option<ContextStore>,
        redactor: Arc<ContextRedactor>,
    ) -> Result<Self, ContextError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            redactor,
            summarizer: Arc::new(ExtractiveSummarizer),
            logger: Arc::new(NoopRunLogger),
            lanes: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ContextSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn redactor(&self) -> &Arc<ContextRedactor> {
        &self.redactor
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Load or create the lane for `scope`.
    pub async fn get_lane(&self, scope: &LaneScope) -> Result<ContextLane, ContextError> {
        let id = scope.lane_id();
        if let Some(state) = self.lanes.read().await.get(&id) {
            return Ok(state.lane.clone());
        }

        let messages = match (&self.store, scope.ephemeral) {
            (Some(store), false) => store.load(&id).await?,
            _ => Vec::new(),
        };
        let persisted = !scope.ephemeral && self.store.is_some();
        let mut lane = ContextLane {
            id: id.clone(),
            role: scope.role,
            model: scope.model.clone(),
            messages,
            token_estimate: 0,
            updated_at: now_string(),
            persisted,
        };
        self.refresh_estimate(&mut lane);
        let durable = vec![true; lane.messages.len()];

        let mut lanes = self.lanes.write().await;
        let state = lanes.entry(id).or_insert(LaneState {
            lane,
            ephemeral: scope.ephemeral,
            durable,
        });
        Ok(state.lane.clone())
    }

    /// Snapshot of a lane already opened with [`get_lane`](Self::get_lane).
    pub async fn lane(&self, lane_id: &str) -> Result<ContextLane, ContextError> {
        self.lanes
            .read()
            .await
            .get(lane_id)
            .map(|s| s.lane.clone())
            .ok_or_else(|| ContextError::UnknownLane(lane_id.to_string()))
    }

    /// Redact and append one message, then enforce the lane budgets.
    pub async fn append(
        &self,
        lane_id: &str,
        message: LaneMessage,
        opts: AppendOptions,
    ) -> Result<ContextMessageRecord, ContextError> {
        let redaction = self.redactor.redact(&message.content);
        let tokens = estimate_tokens(redaction.content.chars().count(), self.config.chars_per_token);
        let record = ContextMessageRecord {
            role: message.role,
            content: redaction.content,
            name: message.name,
            ts: now_string(),
            model: message.model,
            tokens: Some(tokens),
        };

        let mut lanes = self.lanes.write().await;
        let state = lanes
            .get_mut(lane_id)
            .ok_or_else(|| ContextError::UnknownLane(lane_id.to_string()))?;
        state.push(record.clone(), opts.persist);

        let mut trimmed = false;
        let over_count = state
            .lane
            .messages
            .len()
            .saturating_sub(self.config.max_messages);
        if over_count > 0 {
            state.drop_oldest(over_count);
            trimmed = true;
            self.logger.log(
                "context_lane_trimmed",
                json!({
                    "laneId": lane_id,
                    "reason": "max_messages",
                    "dropped": over_count,
                    "remaining": state.lane.messages.len(),
                }),
            );
        }

        let mut bytes = state.lane.byte_size();
        let mut dropped_for_bytes = 0;
        while bytes > self.config.max_bytes_per_lane && !state.lane.messages.is_empty() {
            for removed in state.drop_oldest(1) {
                bytes = bytes.saturating_sub(record_bytes(&removed));
            }
            dropped_for_bytes += 1;
        }
        if dropped_for_bytes > 0 {
            trimmed = true;
            self.logger.log(
                "context_lane_trimmed",
                json!({
                    "laneId": lane_id,
                    "reason": "max_bytes",
                    "dropped": dropped_for_bytes,
                    "remaining": state.lane.messages.len(),
                    "bytes": bytes,
                }),
            );
        }

        state.lane.updated_at = now_string();
        self.refresh_estimate(&mut state.lane);

        self.logger.log(
            "context_lane_update",
            json!({
                "laneId": lane_id,
                "role": state.lane.role.as_str(),
                "messageRole": record.role.as_str(),
                "messages": state.lane.messages.len(),
                "tokenEstimate": state.lane.token_estimate,
                "redactions": redaction.redactions,
            }),
        );

        if opts.persist && !state.ephemeral {
            if let Some(store) = &self.store {
                let kept_new = state.lane.messages.last() == Some(&record);
                if trimmed {
                    store.write_all(lane_id, &state.durable_messages()).await?;
                } else if kept_new {
                    store.append(lane_id, std::slice::from_ref(&record)).await?;
                }
            }
        }

        Ok(record)
    }

    /// Replace a lane's messages wholesale (redacting each one).
    pub async fn replace(
        &self,
        lane_id: &str,
        messages: Vec<LaneMessage>,
    ) -> Result<(), ContextError> {
        let records: Vec<ContextMessageRecord> = messages
            .into_iter()
            .map(|m| {
                let content = self.redactor.redact(&m.content).content;
                ContextMessageRecord {
                    tokens: Some(estimate_tokens(content.chars().count(), self.config.chars_per_token)),
                    role: m.role,
                    content,
                    name: m.name,
                    ts: now_string(),
                    model: m.model,
                }
            })
            .collect();

        let mut lanes = self.lanes.write().await;
        let state = lanes
            .get_mut(lane_id)
            .ok_or_else(|| ContextError::UnknownLane(lane_id.to_string()))?;
        state.durable = vec![true; records.len()];
        state.lane.messages = records;
        state.lane.updated_at = now_string();
        self.refresh_estimate(&mut state.lane);
        if !state.ephemeral {
            if let Some(store) = &self.store {
                store.write_all(lane_id, &state.lane.messages).await?;
            }
        }
        Ok(())
    }

    /// Keep only the newest `keep_last` messages.
    pub async fn truncate(&self, lane_id: &str, keep_last: usize) -> Result<usize, ContextError> {
        let mut lanes = self.lanes.write().await;
        let state = lanes
            .get_mut(lane_id)
            .ok_or_else(|| ContextError::UnknownLane(lane_id.to_string()))?;
        let dropped = state.lane.messages.len().saturating_sub(keep_last);
        if dropped == 0 {
            return Ok(0);
        }
        state.drop_oldest(dropped);
        state.lane.updated_at = now_string();
        self.refresh_estimate(&mut state.lane);
        self.logger.log(
            "context_lane_trimmed",
            json!({
                "laneId": lane_id,
                "reason": "truncate",
                "dropped": dropped,
                "remaining": state.lane.messages.len(),
            }),
        );
        if !state.ephemeral {
            if let Some(store) = &self.store {
                store.write_all(lane_id, &state.durable_messages()).await?;
            }
        }
        Ok(dropped)
    }

    /// Build the message sequence to send to a provider.
    ///
    /// Order: system prompt, serialized bundle, lane history. History is
    /// replaced by a single summary message when it exceeds the model's
    /// token limit.
    pub async fn prepare(
        &self,
        lane_id: &str,
        opts: PrepareOptions<'_>,
    ) -> Result<Vec<ChatMessage>, ContextError> {
        let lane = self.lane(lane_id).await?;
        let model = opts
            .model
            .map(str::to_string)
            .or_else(|| lane.model.clone());
        let limit = model
            .as_deref()
            .and_then(|m| self.config.token_limit_for(m))
            .or(self.config.default_token_limit);

        let mut history: Vec<ChatMessage> = lane
            .messages
            .iter()
            .map(|r| {
                let mut msg = ChatMessage::new(r.role, r.content.clone());
                msg.name = r.name.clone();
                msg
            })
            .collect();

        if let Some(limit) = limit {
            if lane.token_estimate > limit && !lane.messages.is_empty() {
                let summary = self
                    .summarizer
                    .summarize(&lane.messages, self.config.summary_max_chars)
                    .await?;
                self.logger.log(
                    "context_lane_summarized",
                    json!({
                        "laneId": lane_id,
                        "model": model,
                        "tokenEstimate": lane.token_estimate,
                        "tokenLimit": limit,
                        "messages": lane.messages.len(),
                        "summaryChars": summary.chars().count(),
                    }),
                );
                history = vec![ChatMessage::system(format!("Context summary: {}", summary))];
            }
        }

        let mut out = Vec::with_capacity(history.len() + 2);
        if let Some(prompt) = opts.system_prompt {
            out.push(ChatMessage::system(prompt));
        }
        if let Some(bundle) = opts.bundle {
            let rendered = bundle.serialize_for_prompt();
            out.push(ChatMessage::system(self.redactor.redact(&rendered).content));
        }
        out.extend(history);
        Ok(out)
    }

    fn refresh_estimate(&self, lane: &mut ContextLane) {
        lane.token_estimate = estimate_tokens(lane.char_count(), self.config.chars_per_token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LaneRole;
    use crate::logging::MemoryRunLogger;

    fn manager_with(
        config: ContextConfig,
        store: Option<ContextStore>,
        logger: Arc<MemoryRunLogger>,
    ) -> ContextManager {
        let redactor = Arc::new(ContextRedactor::new("/work", &config).unwrap());
        ContextManager::new(config, store, redactor)
            .unwrap()
            .with_logger(logger)
    }

    #[tokio::test]
    async fn rejects_invalid_chars_per_token() {
        let mut config = ContextConfig::default();
        config.chars_per_token = -1.0;
        let redactor = Arc::new(ContextRedactor::new("/work", &ContextConfig::default()).unwrap());
        assert!(matches!(
            ContextManager::new(config, None, redactor),
            Err(ContextError::Config(_))
        ));
    }

    #[tokio::test]
    async fn append_enforces_message_and_byte_budgets() {
        let mut config = ContextConfig::default();
        config.max_messages = 3;
        config.max_bytes_per_lane = 450;
        let logger = Arc::new(MemoryRunLogger::new());
        let manager = manager_with(config.clone(), None, logger.clone());
        let lane = manager
            .get_lane(&LaneScope::new("job", "task", LaneRole::Builder))
            .await
            .unwrap();

        for i in 0..40 {
            let size = (i * 37) % 180;
            let content = format!("{}:{}", i, "z".repeat(size));
            manager
                .append(&lane.id, LaneMessage::new(Role::User, content), AppendOptions::default())
                .await
                .unwrap();
            let snapshot = manager.lane(&lane.id).await.unwrap();
            assert!(snapshot.messages.len() <= config.max_messages);
            assert!(snapshot.byte_size() <= config.max_bytes_per_lane);
        }

        let trims = logger.events_of("context_lane_trimmed");
        assert!(trims.iter().any(|e| e.data["reason"] == "max_messages"));
        assert!(trims.iter().any(|e| e.data["reason"] == "max_bytes"));
        assert_eq!(logger.events_of("context_lane_update").len(), 40);
    }

    #[tokio::test]
    async fn append_redacts_before_persisting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::new(temp.path());
        let logger = Arc::new(MemoryRunLogger::new());
        let manager = manager_with(ContextConfig::default(), Some(store.clone()), logger);
        let lane = manager
            .get_lane(&LaneScope::new("job", "task", LaneRole::Architect))
            .await
            .unwrap();
        assert!(lane.persisted);

        manager
            .append(
                &lane.id,
                LaneMessage::new(Role::User, "use key sk-ABCDEFGHIJKLMNOPQRSTUV"),
                AppendOptions::default(),
            )
            .await
            .unwrap();

        let on_disk = tokio::fs::read_to_string(store.lane_path(&lane.id)).await.unwrap();
        assert!(on_disk.contains("[REDACTED_API_KEY]"));
        assert!(!on_disk.contains("sk-ABCDEFGH"));
    }

    #[tokio::test]
    async fn lanes_reload_from_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scope = LaneScope::new("job", "task", LaneRole::Critic);
        {
            let manager = manager_with(
                ContextConfig::default(),
                Some(ContextStore::new(temp.path())),
                Arc::new(MemoryRunLogger::new()),
            );
            let lane = manager.get_lane(&scope).await.unwrap();
            manager
                .append(&lane.id, LaneMessage::new(Role::Assistant, "first"), AppendOptions::default())
                .await
                .unwrap();
            manager
                .append(
                    &lane.id,
                    LaneMessage::new(Role::Assistant, "memory only"),
                    AppendOptions { persist: false },
                )
                .await
                .unwrap();
        }
        let manager = manager_with(
            ContextConfig::default(),
            Some(ContextStore::new(temp.path())),
            Arc::new(MemoryRunLogger::new()),
        );
        let lane = manager.get_lane(&scope).await.unwrap();
        assert_eq!(lane.messages.len(), 1);
        assert_eq!(lane.messages[0].content, "first");
    }

    #[tokio::test]
    async fn trimmed_rewrite_keeps_memory_only_records_off_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::new(temp.path());
        let mut config = ContextConfig::default();
        config.max_messages = 2;
        let scope = LaneScope::new("job", "task", LaneRole::Builder);
        let manager = manager_with(config.clone(), Some(store.clone()), Arc::new(MemoryRunLogger::new()));
        let lane = manager.get_lane(&scope).await.unwrap();

        for (content, persist) in [("one", true), ("two", true), ("memory only", false), ("three", true)] {
            manager
                .append(&lane.id, LaneMessage::new(Role::User, content), AppendOptions { persist })
                .await
                .unwrap();
        }

        let in_memory: Vec<String> = manager
            .lane(&lane.id)
            .await
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(in_memory, vec!["memory only", "three"]);

        let on_disk = store.load(&lane.id).await.unwrap();
        let on_disk: Vec<&str> = on_disk.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(on_disk, vec!["three"]);

        manager.truncate(&lane.id, 1).await.unwrap();
        let reloaded = manager_with(config, Some(store), Arc::new(MemoryRunLogger::new()))
            .get_lane(&scope)
            .await
            .unwrap();
        assert_eq!(reloaded.messages.len(), 1);
        assert_eq!(reloaded.messages[0].content, "three");
    }

    #[tokio::test]
    async fn ephemeral_lanes_never_touch_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ContextStore::new(temp.path().join("lanes"));
        let manager = manager_with(
            ContextConfig::default(),
            Some(store.clone()),
            Arc::new(MemoryRunLogger::new()),
        );
        let scope = LaneScope::new("job", "task", LaneRole::Librarian).ephemeral();
        let lane = manager.get_lane(&scope).await.unwrap();
        assert!(!lane.persisted);
        manager
            .append(&lane.id, LaneMessage::new(Role::User, "hello"), AppendOptions::default())
            .await
            .unwrap();
        assert!(!store.lane_path(&lane.id).exists());
    }

    #[tokio::test]
    async fn prepare_summarizes_over_limit() {
        let mut config = ContextConfig::default();
        config.model_token_limits.insert("tiny".to_string(), 10);
        let logger = Arc::new(MemoryRunLogger::new());
        let manager = manager_with(config, None, logger.clone());
        let lane = manager
            .get_lane(&LaneScope::new("job", "task", LaneRole::Architect).with_model("tiny"))
            .await
            .unwrap();
        manager
            .append(&lane.id, LaneMessage::new(Role::User, "a".repeat(200)), AppendOptions::default())
            .await
            .unwrap();

        let messages = manager
            .prepare(
                &lane.id,
                PrepareOptions {
                    system_prompt: Some("You are the architect."),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content.as_deref(), Some("You are the architect."));
        let summary = messages[1].content.as_deref().unwrap();
        assert!(summary.starts_with("Context summary: "));
        assert_eq!(logger.events_of("context_lane_summarized").len(), 1);
    }

    #[tokio::test]
    async fn prepare_passes_history_through_under_limit() {
        let logger = Arc::new(MemoryRunLogger::new());
        let manager = manager_with(ContextConfig::default(), None, logger.clone());
        let lane = manager
            .get_lane(&LaneScope::new("job", "task", LaneRole::Builder))
            .await
            .unwrap();
        manager
            .append(&lane.id, LaneMessage::new(Role::User, "one"), AppendOptions::default())
            .await
            .unwrap();
        manager
            .append(&lane.id, LaneMessage::new(Role::Assistant, "two"), AppendOptions::default())
            .await
            .unwrap();
        let bundle = ContextBundle::new("add a button");

        let messages = manager
            .prepare(
                &lane.id,
                PrepareOptions {
                    system_prompt: Some("sys"),
                    bundle: Some(&bundle),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages[1].content.as_deref().unwrap().contains("add a button"));
        assert_eq!(messages[2].content.as_deref(), Some("one"));
        assert_eq!(messages[3].role, Role::Assistant);
        assert!(logger.events_of("context_lane_summarized").is_empty());
    }

    #[tokio::test]
    async fn truncate_unknown_lane_fails() {
        let manager = manager_with(ContextConfig::default(), None, Arc::new(MemoryRunLogger::new()));
        assert!(matches!(
            manager.truncate("nope", 1).await,
            Err(ContextError::UnknownLane(_))
        ));
    }
}
