//! Builder phase: ask the model for a patch implementing the plan.

use std::sync::Arc;

use thiserror::Error;

use super::{Plan, PhaseCall};
use crate::context::{AppendOptions, ContextBundle, ContextError, ContextManager, LaneMessage, PrepareOptions};
use crate::patch::PatchFormat;
use crate::provider::{Provider, ProviderError, ProviderRequest, Role};
use crate::runner::{Runner, RunnerError};

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("builder provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("builder tool loop failed: {0}")]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub raw: String,
    pub call: PhaseCall,
    pub tool_calls: usize,
}

pub struct BuilderPhase {
    provider: Arc<dyn Provider>,
    manager: Arc<ContextManager>,
    lane_id: String,
    format: PatchFormat,
    runner: Option<Arc<Runner>>,
}

impl BuilderPhase {
    pub fn new(
        provider: Arc<dyn Provider>,
        manager: Arc<ContextManager>,
        lane_id: impl Into<String>,
        format: PatchFormat,
    ) -> Self {
        Self {
            provider,
            manager,
            lane_id: lane_id.into(),
            format,
            runner: None,
        }
    }

    /// Drive the build through a tool-call loop instead of a single call.
    pub fn with_runner(mut self, runner: Arc<Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn lane_id(&self) -> &str {
        &self.lane_id
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are the builder of an automated code-change loop. Implement the plan by editing only its target files.\n\
             Answer with JSON only, matching:\n{}\n\
             search_block must be copied exactly from the current file.",
            self.format.schema_hint()
        )
    }

    /// Produce raw builder output. `feedback` is the critic's verdict on the
    /// previous attempt and is recorded in the lane first.
    pub async fn build(
        &self,
        plan: &Plan,
        bundle: &ContextBundle,
        feedback: Option<&str>,
    ) -> Result<BuildOutput, BuilderError> {
        let lane = self.manager.lane(&self.lane_id).await?;
        if lane.messages.is_empty() {
            let plan_json = serde_json::to_string_pretty(plan).map_err(ContextError::from)?;
            self.manager
                .append(
                    &self.lane_id,
                    LaneMessage::new(Role::User, format!("Implement this plan:\n{}", plan_json)),
                    AppendOptions::default(),
                )
                .await?;
        }
        if let Some(feedback) = feedback {
            self.manager
                .append(
                    &self.lane_id,
                    LaneMessage::new(
                        Role::User,
                        format!("The critic rejected the previous attempt:\n{}\nFix it and answer again.", feedback),
                    ),
                    AppendOptions::default(),
                )
                .await?;
        }

        let system_prompt = self.system_prompt();
        let messages = self
            .manager
            .prepare(
                &self.lane_id,
                PrepareOptions {
                    model: Some(self.provider.model()),
                    system_prompt: Some(&system_prompt),
                    bundle: Some(bundle),
                },
            )
            .await?;

        let request = ProviderRequest::new(messages);
        let char_count = request.char_count();
        let (raw, usage, tool_calls) = match &self.runner {
            Some(runner) => {
                let result = runner.run(request.messages).await?;
                (result.final_message, Some(result.usage), result.tool_calls_executed)
            }
            None => {
                let response = self.provider.generate(request).await?;
                (response.content().to_string(), response.usage, 0)
            }
        };
        tracing::info!("Builder produced {} bytes ({} tool calls)", raw.len(), tool_calls);

        self.manager
            .append(
                &self.lane_id,
                LaneMessage::new(Role::Assistant, raw.clone()).with_model(self.provider.model()),
                AppendOptions::default(),
            )
            .await?;

        Ok(BuildOutput {
            raw,
            call: PhaseCall::new(char_count).with_usage(usage),
            tool_calls,
        })
    }
}
