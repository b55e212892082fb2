//! Fakes shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::docdex::{DocdexClient, DocdexError, OpenFileOptions, SearchHit, SearchOptions, SearchResult};
use crate::provider::{Provider, ProviderError, ProviderRequest, ProviderResponse, TokenUsage, ToolCall};

/// Provider answering from a fixed script, recording every request.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(|t| Ok(ProviderResponse::text(t))).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Assistant response requesting one tool call.
pub fn tool_call_response(id: &str, name: &str, args: Value) -> ProviderResponse {
    let call = ToolCall::new(id, name, args.to_string());
    let mut response = ProviderResponse::text("");
    response.message.content = None;
    response.message.tool_calls = Some(vec![call.clone()]);
    response.tool_calls = vec![call];
    response.usage = Some(TokenUsage::new(10, 5));
    response
}

/// Text response with usage attached.
pub fn text_with_usage(text: &str, input: u64, output: u64) -> ProviderResponse {
    let mut response = ProviderResponse::text(text);
    response.usage = Some(TokenUsage::new(input, output));
    response
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn model(&self) -> &str {
        "model-a"
    }

    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ProviderError::parse_error("script exhausted".to_string())))
    }
}

/// In-memory documentation index.
#[derive(Default)]
pub struct FakeDocdex {
    hits: Vec<SearchHit>,
    files: HashMap<String, Value>,
    symbols: HashMap<String, Value>,
    hooks_error: Option<String>,
    unavailable: bool,
    hook_calls: Mutex<Vec<Vec<String>>>,
    searches: Mutex<Vec<String>>,
}

impl FakeDocdex {
    pub fn with_hits(mut self, hits: Vec<SearchHit>) -> Self {
        self.hits = hits;
        self
    }

    pub fn with_file(mut self, path: &str, payload: Value) -> Self {
        self.files.insert(path.to_string(), payload);
        self
    }

    pub fn with_symbols(mut self, path: &str, payload: Value) -> Self {
        self.symbols.insert(path.to_string(), payload);
        self
    }

    pub fn failing_hooks(mut self, message: &str) -> Self {
        self.hooks_error = Some(message.to_string());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn hook_calls(&self) -> Vec<Vec<String>> {
        self.hook_calls.lock().unwrap().clone()
    }

    pub fn searches(&self) -> Vec<String> {
        self.searches.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), DocdexError> {
        if self.unavailable {
            Err(DocdexError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocdexClient for FakeDocdex {
    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResult, DocdexError> {
        self.check_available()?;
        self.searches.lock().unwrap().push(query.to_string());
        Ok(SearchResult {
            hits: self.hits.iter().take(opts.limit).cloned().collect(),
        })
    }

    async fn hooks_validate(&self, files: &[String]) -> Result<(), DocdexError> {
        self.check_available()?;
        self.hook_calls.lock().unwrap().push(files.to_vec());
        match &self.hooks_error {
            Some(message) => Err(DocdexError::HooksFailed(message.clone())),
            None => Ok(()),
        }
    }

    async fn open_file(&self, path: &str, _opts: &OpenFileOptions) -> Result<Value, DocdexError> {
        self.check_available()?;
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| DocdexError::Request(format!("not indexed: {}", path)))
    }

    async fn symbols(&self, path: &str) -> Result<Value, DocdexError> {
        self.check_available()?;
        self.symbols
            .get(path)
            .cloned()
            .ok_or_else(|| DocdexError::Request(format!("no symbols: {}", path)))
    }

    async fn ast(&self, path: &str) -> Result<Value, DocdexError> {
        self.check_available()?;
        match self.symbols.get(path) {
            Some(Value::Object(map)) => Ok(map.get("ast").cloned().unwrap_or(Value::Null)),
            _ => Err(DocdexError::Request(format!("no ast: {}", path))),
        }
    }
}
