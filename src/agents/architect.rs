//! Architect phase: turn a context bundle into a validated [`Plan`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::PhaseCall;
use crate::context::{AppendOptions, ContextBundle, ContextError, ContextManager, LaneMessage, PrepareOptions};
use crate::patch::normalize_patch_output;
use crate::provider::{ChatMessage, Provider, ProviderError, ProviderRequest, ResponseFormat, Role};
use crate::util::normalize_rel_path;

/// Target-file sentinel meaning "no commitment".
pub const UNKNOWN_TARGET: &str = "unknown";

const SYSTEM_PROMPT: &str = r#"You are the architect of an automated code-change loop.
Read the request and repository context, then answer with a single JSON object:
{"steps": ["..."], "target_files": ["path"], "risk_assessment": "...", "verification": ["command or docdex:hooks:<files>"]}
List only files you expect to change in target_files; use "unknown" if you cannot tell."#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
    pub target_files: Vec<String>,
    pub risk_assessment: String,
    pub verification: Vec<String>,
}

impl Plan {
    /// Normalized targets without the `unknown` sentinel.
    pub fn comparable_targets(&self) -> Vec<String> {
        self.target_files
            .iter()
            .map(|f| normalize_rel_path(f))
            .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case(UNKNOWN_TARGET))
            .collect()
    }

    /// One-line summary for golden-set entries.
    pub fn summary(&self) -> String {
        let mut out = self.steps.join("; ");
        if out.chars().count() > 400 {
            out = out.chars().take(400).collect::<String>() + "...";
        }
        out
    }

    /// Extract a plan from a JSON value, accepting field aliases.
    pub fn from_value(value: &Value) -> Result<Self, PlannerError> {
        let obj = value
            .as_object()
            .ok_or_else(|| PlannerError::InvalidOutput("plan is not a JSON object".to_string()))?;
        let field = |names: &[&str]| names.iter().find_map(|n| obj.get(*n));

        let steps = field(&["steps", "plan"]).map(string_list);
        let targets = field(&["target_files", "targetFiles", "filesLikelyTouched", "files_likely_touched"])
            .map(string_list);

        let mut missing = Vec::new();
        if steps.is_none() {
            missing.push("steps".to_string());
        }
        if targets.is_none() {
            missing.push("target_files".to_string());
        }
        if !missing.is_empty() {
            return Err(PlannerError::MissingFields(missing));
        }

        Ok(Plan {
            steps: steps.unwrap_or_default(),
            target_files: targets.unwrap_or_default(),
            risk_assessment: field(&["risk_assessment", "riskAssessment", "risk"])
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            verification: field(&["verification", "verify", "validation"])
                .map(string_list)
                .unwrap_or_default(),
        })
    }
}

/// Strings from an array, a newline-separated string, or step objects.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(map) => ["description", "step", "title", "path"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
                    .or_else(|| Some(item.to_string())),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner output is not valid JSON: {0}")]
    InvalidOutput(String),

    #[error("planner output is missing fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("planner provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

pub struct ArchitectPlanner {
    provider: Arc<dyn Provider>,
    lane: Option<(Arc<ContextManager>, String)>,
    temperature: Option<f64>,
}

impl ArchitectPlanner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            lane: None,
            temperature: None,
        }
    }

    /// Prepend the history of `lane_id` and record the plan there.
    pub fn with_lane(mut self, manager: Arc<ContextManager>, lane_id: impl Into<String>) -> Self {
        self.lane = Some((manager, lane_id.into()));
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// One structured-output request; no retries.
    pub async fn plan(&self, bundle: &ContextBundle) -> Result<(Plan, PhaseCall), PlannerError> {
        let mut messages = match &self.lane {
            Some((manager, lane_id)) => {
                manager
                    .prepare(
                        lane_id,
                        PrepareOptions {
                            model: Some(self.provider.model()),
                            system_prompt: Some(SYSTEM_PROMPT),
                            bundle: None,
                        },
                    )
                    .await?
            }
            None => vec![ChatMessage::system(SYSTEM_PROMPT)],
        };
        messages.push(ChatMessage::user(bundle.serialize_for_prompt()));

        let mut request = ProviderRequest::new(messages).with_response_format(ResponseFormat::JsonObject);
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }
        let call = PhaseCall::new(request.char_count());
        let response = self.provider.generate(request).await?;
        let call = call.with_usage(response.usage);
        let content = response.content();

        let normalized = normalize_patch_output(content)
            .ok_or_else(|| PlannerError::InvalidOutput(preview(content)))?;
        let value: Value =
            serde_json::from_str(&normalized).map_err(|e| PlannerError::InvalidOutput(e.to_string()))?;
        let plan = Plan::from_value(&value)?;
        tracing::info!(
            "Architect produced plan: {} steps, targets {:?}",
            plan.steps.len(),
            plan.target_files
        );

        if let Some((manager, lane_id)) = &self.lane {
            let record = serde_json::to_string(&plan).map_err(ContextError::from)?;
            manager
                .append(
                    lane_id,
                    LaneMessage::new(Role::Assistant, record).with_model(self.provider.model()),
                    AppendOptions::default(),
                )
                .await?;
        }
        Ok((plan, call))
    }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(120).collect();
    if head.is_empty() {
        "empty response".to_string()
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::context::{ContextRedactor, LaneRole, LaneScope};
    use crate::provider::ProviderResponse;
    use crate::test_support::{text_with_usage, ScriptedProvider};
    use serde_json::json;

    #[test]
    fn aliases_resolve() {
        let plan = Plan::from_value(&json!({
            "plan": ["edit header", {"description": "update tests"}],
            "filesLikelyTouched": ["src/header.ts", "unknown"],
            "risk": "low",
            "verification": "npm test"
        }))
        .unwrap();
        assert_eq!(plan.steps, vec!["edit header", "update tests"]);
        assert_eq!(plan.target_files, vec!["src/header.ts", "unknown"]);
        assert_eq!(plan.comparable_targets(), vec!["src/header.ts"]);
        assert_eq!(plan.risk_assessment, "low");
        assert_eq!(plan.verification, vec!["npm test"]);
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = Plan::from_value(&json!({"risk": "high"})).unwrap_err();
        match err {
            PlannerError::MissingFields(fields) => assert_eq!(fields, vec!["steps", "target_files"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn plan_parses_fenced_json_in_one_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_with_usage(
            "```json\n{\"steps\":[\"a\"],\"target_files\":[\"src/a.rs\"]}\n```",
            100,
            20,
        ))]));
        let planner = ArchitectPlanner::new(provider.clone());
        let (plan, call) = planner.plan(&ContextBundle::new("fix a")).await.unwrap();
        assert_eq!(plan.target_files, vec!["src/a.rs"]);
        assert_eq!(call.usage.unwrap().input_tokens, 100);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].response_format, Some(ResponseFormat::JsonObject));
    }

    #[tokio::test]
    async fn prose_output_is_invalid_without_retry() {
        let provider = Arc::new(ScriptedProvider::with_texts(["I think we should edit a.rs", "{}"]));
        let planner = ArchitectPlanner::new(provider.clone());
        let err = planner.plan(&ContextBundle::new("x")).await.unwrap_err();
        assert!(matches!(err, PlannerError::InvalidOutput(_)));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn lane_history_is_prepended() {
        let config = ContextConfig::default();
        let redactor = Arc::new(ContextRedactor::new("/work", &config).unwrap());
        let manager = Arc::new(ContextManager::new(config, None, redactor).unwrap());
        let lane = manager
            .get_lane(&LaneScope::new("job", "task", LaneRole::Architect))
            .await
            .unwrap();
        manager
            .append(
                &lane.id,
                LaneMessage::new(Role::User, "earlier note"),
                AppendOptions::default(),
            )
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ProviderResponse::text(
            r#"{"steps":["s"],"target_files":[]}"#,
        ))]));
        let planner = ArchitectPlanner::new(provider.clone()).with_lane(manager.clone(), &lane.id);
        planner.plan(&ContextBundle::new("req")).await.unwrap();

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[1].content.as_deref(), Some("earlier note"));
        assert!(sent[2].content.as_deref().unwrap().starts_with("# Request\nreq"));
        assert_eq!(manager.lane(&lane.id).await.unwrap().messages.len(), 2);
    }
}
