//! Bounded tool-call loop over one provider conversation.
//!
//! Each step sends the conversation to the provider. Tool calls in the
//! response are executed through the [`ToolRegistry`] and their results are
//! appended as tool messages; a response without tool calls ends the loop.
//! Step and tool-call caps are fatal, as is the optional overall deadline.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::RunnerConfig;
use crate::logging::{NoopRunLogger, SharedLogger};
use crate::provider::{ChatMessage, Provider, ProviderError, ProviderRequest, Role, TokenUsage, ToolCall};
use crate::tools::ToolRegistry;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner exceeded max steps ({0})")]
    StepLimitExceeded(usize),

    #[error("runner exceeded max tool calls ({0})")]
    ToolCallLimitExceeded(usize),

    #[error("runner timed out after {0}ms")]
    Timeout(u128),

    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerResult {
    pub final_message: String,
    /// Full conversation including tool traffic.
    #[serde(skip)]
    pub messages: Vec<ChatMessage>,
    pub tool_calls_executed: usize,
    pub usage: TokenUsage,
}

pub struct Runner {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    config: RunnerConfig,
    logger: SharedLogger,
}

impl Runner {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>, config: RunnerConfig) -> Self {
        Self {
            provider,
            tools,
            config,
            logger: Arc::new(NoopRunLogger),
        }
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Drive the conversation to a final message.
    ///
    /// The deadline is soft: a tool already executing when it expires is
    /// dropped at its next await point.
    pub async fn run(&self, messages: Vec<ChatMessage>) -> Result<RunnerResult, RunnerError> {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_loop(messages))
                .await
                .map_err(|_| RunnerError::Timeout(limit.as_millis()))?,
            None => self.run_loop(messages).await,
        }
    }

    async fn run_loop(&self, mut messages: Vec<ChatMessage>) -> Result<RunnerResult, RunnerError> {
        let tool_schemas = self.tools.schemas();
        let mut usage = TokenUsage::default();
        let mut tool_calls_executed = 0usize;

        for step in 0..self.config.max_steps {
            tracing::debug!("Runner step {}", step + 1);

            let mut request = ProviderRequest::new(messages.clone());
            if !tool_schemas.is_empty() {
                request = request.with_tools(tool_schemas.clone());
            }
            if let Some(temperature) = self.config.temperature {
                request = request.with_temperature(temperature);
            }

            let response = self.provider.generate(request).await?;
            if let Some(u) = &response.usage {
                usage.add(u);
            }
            self.logger.log(
                "runner_step",
                json!({
                    "step": step + 1,
                    "tool_calls": response.tool_calls.len(),
                    "usage": response.usage,
                }),
            );

            if response.tool_calls.is_empty() {
                let final_message = response.content().to_string();
                messages.push(response.message);
                return Ok(RunnerResult {
                    final_message,
                    messages,
                    tool_calls_executed,
                    usage,
                });
            }

            let mut assistant = response.message.clone();
            assistant.role = Role::Assistant;
            assistant.tool_calls = Some(response.tool_calls.clone());
            messages.push(assistant);

            for tool_call in &response.tool_calls {
                if tool_calls_executed >= self.config.max_tool_calls {
                    return Err(RunnerError::ToolCallLimitExceeded(self.config.max_tool_calls));
                }
                tool_calls_executed += 1;
                let output = self.execute_tool_call(tool_call).await;
                messages.push(ChatMessage::tool_result(tool_call.id.clone(), output));
            }
        }

        Err(RunnerError::StepLimitExceeded(self.config.max_steps))
    }

    /// Run one call; failures become `Error: ...` text for the model.
    async fn execute_tool_call(&self, tool_call: &ToolCall) -> String {
        let name = &tool_call.function.name;
        let args: Value = if tool_call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&tool_call.function.arguments) {
                Ok(args) => args,
                Err(e) => return format!("Error: invalid arguments for {}: {}", name, e),
            }
        };

        let (output, ok) = match self.tools.execute(name, args).await {
            Ok(result) => (result.output, true),
            Err(e) => {
                tracing::debug!("Tool {} failed: {}", name, e);
                (format!("Error: {}", e), false)
            }
        };
        self.logger.log(
            "runner_tool_call",
            json!({
                "id": tool_call.id,
                "name": name,
                "ok": ok,
                "output_bytes": output.len(),
            }),
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryRunLogger;
    use crate::provider::ProviderResponse;
    use crate::test_support::{text_with_usage, tool_call_response, ScriptedProvider};
    use crate::tools::{ToolContext, ToolOutput};
    use std::time::Duration;

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::empty(ToolContext::new("."));
        registry.register_fn("echo", "Echo text", json!({"type": "object"}), |args| {
            Ok(ToolOutput::new(format!("echo:{}", args["text"].as_str().unwrap_or(""))))
        });
        registry.register_fn("boom", "Always fails", json!({"type": "object"}), |_| {
            anyhow::bail!("kaboom")
        });
        Arc::new(registry)
    }

    fn config(max_steps: usize, max_tool_calls: usize) -> RunnerConfig {
        RunnerConfig {
            max_steps,
            max_tool_calls,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_tool_call_then_final_message() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("call-1", "echo", json!({"text": "hi"}))),
            Ok(text_with_usage("all done", 20, 7)),
        ]));
        let logger = Arc::new(MemoryRunLogger::new());
        let runner = Runner::new(provider.clone(), registry(), config(3, 3)).with_logger(logger.clone());

        let result = runner.run(vec![ChatMessage::user("do it")]).await.unwrap();
        assert_eq!(result.final_message, "all done");
        assert_eq!(result.tool_calls_executed, 1);
        assert_eq!(result.usage, TokenUsage::new(30, 12));
        assert_eq!(logger.events_of("runner_step").len(), 2);
        assert_eq!(logger.events_of("runner_tool_call").len(), 1);

        let second = &provider.requests()[1];
        let tool_msg = second.messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.content.as_deref(), Some("echo:hi"));
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
        assert!(second.tools.as_ref().map(|t| t.len() == 2).unwrap_or(false));
    }

    #[tokio::test]
    async fn tool_failures_are_fed_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("a", "boom", json!({}))),
            Ok(tool_call_response("b", "missing", json!({}))),
            Ok(ProviderResponse::text("recovered")),
        ]));
        let runner = Runner::new(provider.clone(), registry(), config(5, 5));
        let result = runner.run(vec![ChatMessage::user("go")]).await.unwrap();
        assert_eq!(result.final_message, "recovered");
        assert_eq!(result.tool_calls_executed, 2);

        let requests = provider.requests();
        let first_error = requests[1].messages.last().unwrap().content.clone().unwrap();
        assert_eq!(first_error, "Error: kaboom");
        let second_error = requests[2].messages.last().unwrap().content.clone().unwrap();
        assert!(second_error.starts_with("Error: Unknown tool: missing"));
    }

    #[tokio::test]
    async fn step_limit_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("1", "echo", json!({}))),
            Ok(tool_call_response("2", "echo", json!({}))),
        ]));
        let runner = Runner::new(provider, registry(), config(2, 10));
        let err = runner.run(vec![ChatMessage::user("loop")]).await.unwrap_err();
        assert!(matches!(err, RunnerError::StepLimitExceeded(2)));
    }

    #[tokio::test]
    async fn tool_call_limit_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("1", "echo", json!({}))),
            Ok(tool_call_response("2", "echo", json!({}))),
        ]));
        let runner = Runner::new(provider, registry(), config(5, 1));
        let err = runner.run(vec![ChatMessage::user("loop")]).await.unwrap_err();
        assert!(matches!(err, RunnerError::ToolCallLimitExceeded(1)));
    }

    #[tokio::test]
    async fn deadline_races_the_loop() {
        let provider = Arc::new(
            ScriptedProvider::with_texts(["late"]).with_delay(Duration::from_millis(500)),
        );
        let runner = Runner::new(
            provider,
            registry(),
            RunnerConfig {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let err = runner.run(vec![ChatMessage::user("wait")]).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(50)));
    }

    #[tokio::test]
    async fn provider_errors_propagate() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::server_error(
            502,
            "bad gateway".to_string(),
        ))]));
        let runner = Runner::new(provider, registry(), RunnerConfig::default());
        let err = runner.run(vec![ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, RunnerError::Provider(_)));
    }
}
