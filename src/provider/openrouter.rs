//! OpenAI-compatible chat-completions adapter (OpenRouter by default).
//!
//! Transient failures are retried inside `generate` according to [`RetryConfig`].

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::error::{ProviderError, RetryConfig};
use super::{
    ChatMessage, Provider, ProviderRequest, ProviderResponse, ResponseFormat, Role, TokenUsage,
    ToolCall, ToolChoice, ToolDefinition,
};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter chat-completions provider.
pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    retry_config: RetryConfig,
}

impl OpenRouterProvider {
    /// Create a new provider with default retry configuration.
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self::with_retry_config(api_key, model, RetryConfig::default())
    }

    /// Create a new provider with custom retry configuration.
    pub fn with_retry_config(
        api_key: String,
        model: impl Into<String>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.into(),
            base_url: OPENROUTER_API_URL.to_string(),
            retry_config,
        }
    }

    /// Point the provider at an OpenAI-compatible endpoint other than OpenRouter.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    fn build_request(&self, request: &ProviderRequest) -> OpenRouterRequest {
        if request.stream {
            tracing::debug!("Streaming requested; OpenRouter provider returns whole responses");
        }
        let tool_choice = match (&request.tools, &request.tool_choice) {
            (None, _) => None,
            (Some(_), None) => Some(json!("auto")),
            (Some(_), Some(choice)) => Some(match choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Function(name) => {
                    json!({"type": "function", "function": {"name": name}})
                }
            }),
        };
        let response_format = request.response_format.as_ref().and_then(|f| match f {
            ResponseFormat::Text => None,
            ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
            ResponseFormat::JsonSchema { name, schema } => Some(json!({
                "type": "json_schema",
                "json_schema": {"name": name, "schema": schema}
            })),
        });

        OpenRouterRequest {
            model: self.model.clone(),
            messages: request.messages.clone(),
            tools: request.tools.clone(),
            tool_choice,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format,
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(
        &self,
        request: &OpenRouterRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "codeloop")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    ProviderError::network_error(format!("Connection failed: {}", e))
                } else {
                    ProviderError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body, retry_after));
        }

        let raw: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::parse_error(format!("Failed to parse response: {}", e))
        })?;
        let parsed: OpenRouterResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ProviderError::parse_error(format!("Unexpected response shape: {}", e))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::parse_error("No choices in response".to_string()))?;

        let tool_calls = choice.message.tool_calls.unwrap_or_default();
        let message = ChatMessage {
            role: Role::Assistant,
            content: choice.message.content,
            name: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls.clone())
            },
            tool_call_id: None,
        };

        Ok(ProviderResponse {
            message,
            tool_calls,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            raw: Some(raw),
        })
    }

    async fn execute_with_retry(&self, request: &OpenRouterRequest) -> Result<ProviderResponse, ProviderError> {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            let error = match self.execute_request(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!("Provider call succeeded after {} retries in {:?}", attempt, start.elapsed());
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };
            let Some(delay) = self.retry_config.next_delay(&error, attempt, start.elapsed()) else {
                tracing::error!("Provider call failed after {} retries: {}", attempt, error);
                return Err(error);
            };
            tracing::warn!("Provider call attempt {} hit {}, retrying in {:?}", attempt + 1, error.kind, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_request(&request);
        tracing::debug!(
            "Sending request to OpenRouter: model={} messages={}",
            self.model,
            body.messages.len()
        );
        self.execute_with_retry(&body).await
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
