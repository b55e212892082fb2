//! Retry loop that asks the model to reformat unparseable builder output.

use std::sync::Arc;

use serde_json::json;

use super::{parse_patch_output, PatchFormat, PatchOperation, PatchParseError};
use crate::logging::{NoopRunLogger, SharedLogger};
use crate::provider::{ChatMessage, Provider, ProviderRequest, ResponseFormat, TokenUsage};

/// Successful interpretation of builder output.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub operations: Vec<PatchOperation>,
    /// Reformat calls issued before parsing succeeded.
    pub retries: usize,
    pub usage: TokenUsage,
}

pub struct PatchInterpreter {
    provider: Arc<dyn Provider>,
    format: PatchFormat,
    max_retries: usize,
    logger: SharedLogger,
}

impl PatchInterpreter {
    pub fn new(provider: Arc<dyn Provider>, format: PatchFormat) -> Self {
        Self {
            provider,
            format,
            max_retries: 2,
            logger: Arc::new(NoopRunLogger),
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn format(&self) -> PatchFormat {
        self.format
    }

    /// Parse `raw`; on failure re-ask the provider up to `max_retries` times.
    ///
    /// Returns the last parse error when every attempt fails.
    pub async fn interpret(&self, raw: &str) -> Result<Interpretation, PatchParseError> {
        let mut usage = TokenUsage::default();
        let mut last_error = match parse_patch_output(raw, self.format) {
            Ok(operations) => {
                return Ok(Interpretation {
                    operations,
                    retries: 0,
                    usage,
                })
            }
            Err(e) => e,
        };

        for attempt in 1..=self.max_retries {
            self.logger.log(
                "patch_interpreter_attempt",
                json!({
                    "attempt": attempt,
                    "format": self.format.as_str(),
                    "previous_error": last_error.to_string(),
                }),
            );

            let request = ProviderRequest::new(vec![
                ChatMessage::system(format!(
                    "You convert code-change descriptions into JSON. Respond with JSON only, matching:\n{}",
                    self.format.schema_hint()
                )),
                ChatMessage::user(format!(
                    "The previous output could not be used ({}). Reformat it:\n\n{}",
                    last_error, raw
                )),
            ])
            .with_response_format(ResponseFormat::JsonObject);

            let response = match self.provider.generate(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Patch interpreter call {} failed: {}", attempt, e);
                    continue;
                }
            };
            if let Some(u) = &response.usage {
                usage.add(u);
            }
            match parse_patch_output(response.content(), self.format) {
                Ok(operations) => {
                    return Ok(Interpretation {
                        operations,
                        retries: attempt,
                        usage,
                    })
                }
                Err(e) => last_error = e,
            }
        }

        self.logger.log(
            "patch_interpreter_failed",
            json!({
                "retries": self.max_retries,
                "format": self.format.as_str(),
                "error": last_error.to_string(),
            }),
        );
        Err(last_error)
    }
}
