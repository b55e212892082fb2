//! Configuration management for codeloop.
//!
//! Configuration can be set via environment variables:
//! - `CODELOOP_API_KEY` (or `OPENROUTER_API_KEY`) - Required. Provider API key.
//! - `CODELOOP_MODEL` - Optional. Model identifier. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `CODELOOP_PROVIDER` - Optional. Provider name used for pricing. Defaults to `openrouter`.
//! - `CODELOOP_PROVIDER_URL` - Optional. OpenAI-compatible endpoint override.
//! - `CODELOOP_WORKSPACE` - Optional. Workspace directory. Defaults to current directory.
//! - `CODELOOP_STATE_DIR` - Optional. State directory. Defaults to `<workspace>/.codeloop`.
//! - `CODELOOP_MAX_RETRIES` - Optional. Builder/critic retry budget. Defaults to `2`.
//! - `CODELOOP_MAX_STEPS` / `CODELOOP_MAX_TOOL_CALLS` / `CODELOOP_TIMEOUT_MS` - Runner limits.
//! - `CODELOOP_ALLOW_SHELL` - Optional. Enables shell validation steps.
//! - `CODELOOP_SHELL_ALLOWLIST` - Optional. Comma-separated command names.
//! - `CODELOOP_READ_ONLY_PATHS` / `CODELOOP_ALLOWED_PATHS` - Optional. Critic guardrails.
//! - `CODELOOP_LOCK_MAX_AGE_MS` - Optional. Workspace lock staleness threshold.
//! - `CODELOOP_GOLDEN_MAX_ENTRIES` - Optional. Golden-set cap. Defaults to `50`.
//! - `CODELOOP_PRICING_FILE` - Optional. JSON pricing table.
//! - `CODELOOP_MIN_SEARCH_HITS` - Optional. Evidence gate minimum.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patch::PatchFormat;
use crate::util::{env_var_bool, env_var_list};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// A configured redaction rule: regex pattern and its replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionRule {
    pub pattern: String,
    pub replacement: String,
}

/// Context lane budgets and redaction settings.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Maximum messages kept per lane (oldest dropped first)
    pub max_messages: usize,

    /// Maximum serialized bytes kept per lane (oldest dropped first)
    pub max_bytes_per_lane: usize,

    /// Characters per token used for token estimates
    pub chars_per_token: f64,

    /// Token limits keyed by model identifier
    pub model_token_limits: HashMap<String, u64>,

    /// Limit applied to models missing from `model_token_limits`
    pub default_token_limit: Option<u64>,

    /// Ignore files (workspace-relative) compiled into path matchers
    pub ignore_files: Vec<PathBuf>,

    /// Extra redaction rules applied before the built-ins
    pub redaction_rules: Vec<RedactionRule>,

    /// Upper bound for summaries produced by the summarizer
    pub summary_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_bytes_per_lane: 200_000,
            chars_per_token: 4.0,
            model_token_limits: HashMap::new(),
            default_token_limit: Some(32_000),
            ignore_files: vec![
                PathBuf::from(".codeloopignore"),
                PathBuf::from(".docdexignore"),
            ],
            redaction_rules: Vec::new(),
            summary_max_chars: 2_000,
        }
    }
}

impl ContextConfig {
    /// Reject settings that would make budgeting meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.chars_per_token.is_finite() || self.chars_per_token <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "chars_per_token".to_string(),
                format!("must be a positive number, got {}", self.chars_per_token),
            ));
        }
        if self.max_messages == 0 {
            return Err(ConfigError::InvalidValue(
                "max_messages".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Token limit for `model`, falling back to the default limit.
    pub fn token_limit_for(&self, model: &str) -> Option<u64> {
        self.model_token_limits
            .get(model)
            .copied()
            .or(self.default_token_limit)
    }
}

/// How the file loader reads file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    /// Read straight from the workspace filesystem
    #[default]
    Filesystem,
    /// Ask the docdex client to open the file, falling back to the filesystem
    Docdex,
}

/// Focus/periphery file loading budgets.
#[derive(Debug, Clone)]
pub struct FileLoaderConfig {
    pub focus_max_file_bytes: usize,
    pub periphery_max_bytes: usize,
    /// Path prefixes treated as documentation (loaded in full when peripheral)
    pub docs_prefixes: Vec<String>,
    pub read_strategy: ReadStrategy,
}

impl Default for FileLoaderConfig {
    fn default() -> Self {
        Self {
            focus_max_file_bytes: 40_000,
            periphery_max_bytes: 4_000,
            docs_prefixes: vec!["docs".to_string()],
            read_strategy: ReadStrategy::Filesystem,
        }
    }
}

/// Minimum evidence required before planning. `None` disables a criterion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceGateConfig {
    pub min_search_hits: Option<usize>,
    pub min_open_or_snippet: Option<usize>,
    pub min_symbols_or_ast: Option<usize>,
    pub min_impact: Option<usize>,
    pub max_warnings: Option<usize>,
}

/// Validation step execution policy.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub allow_shell: bool,
    /// Command names (first word) permitted for shell steps
    pub shell_allowlist: Vec<String>,
    pub step_timeout: Option<Duration>,
    /// Bytes of combined output kept for error messages
    pub output_limit_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allow_shell: false,
            shell_allowlist: Vec::new(),
            step_timeout: Some(Duration::from_secs(300)),
            output_limit_bytes: 8_000,
        }
    }
}

/// Critic guardrails.
#[derive(Debug, Clone)]
pub struct CriticConfig {
    /// Paths the builder must never touch
    pub read_only_paths: Vec<String>,
    /// When non-empty, every touched file must live under one of these
    pub allowed_write_paths: Vec<String>,
    /// Attach a context-fetch request when nothing was touched
    pub request_context_on_empty: bool,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            read_only_paths: Vec::new(),
            allowed_write_paths: Vec::new(),
            request_context_on_empty: true,
        }
    }
}

/// Tool-call loop limits.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_steps: usize,
    pub max_tool_calls: usize,
    pub timeout: Option<Duration>,
    pub temperature: Option<f64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            max_tool_calls: 24,
            timeout: None,
            temperature: None,
        }
    }
}

/// Workspace lock settings.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub max_age: Duration,
    /// Directory (relative to the workspace) holding the lock file
    pub dir_name: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(2 * 60 * 60),
            dir_name: ".codeloop".to_string(),
        }
    }
}

/// Builder/critic cycle settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Builder re-issues after a retryable critic FAIL
    pub max_retries: usize,
    pub patch_format: PatchFormat,
    /// Patch interpreter re-issues for unparseable builder output
    pub interpreter_max_retries: usize,
    pub job_id: String,
    pub task_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            patch_format: PatchFormat::SearchReplace,
            interpreter_max_retries: 2,
            job_id: "local".to_string(),
            task_id: "task".to_string(),
        }
    }
}

/// Provider connection settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub provider_name: String,
    pub model: String,
    pub base_url: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub provider: ProviderConfig,
    pub context: ContextConfig,
    pub file_loader: FileLoaderConfig,
    pub evidence: EvidenceGateConfig,
    pub validation: ValidationConfig,
    pub critic: CriticConfig,
    pub runner: RunnerConfig,
    pub lock: LockConfig,
    pub pipeline: PipelineConfig,
    pub golden_max_entries: usize,
    pub pricing_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if no API key is set and
    /// `ConfigError::InvalidValue` for unparseable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("CODELOOP_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("CODELOOP_API_KEY".to_string()))?;

        let workspace_root = std::env::var("CODELOOP_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut config = Self::new(
            api_key,
            std::env::var("CODELOOP_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string()),
            workspace_root,
        );

        if let Ok(dir) = std::env::var("CODELOOP_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("CODELOOP_PROVIDER") {
            config.provider.provider_name = name;
        }
        config.provider.base_url = std::env::var("CODELOOP_PROVIDER_URL").ok();

        if let Some(v) = parse_env::<usize>("CODELOOP_MAX_RETRIES")? {
            config.pipeline.max_retries = v;
        }
        if let Some(v) = parse_env::<usize>("CODELOOP_MAX_STEPS")? {
            config.runner.max_steps = v;
        }
        if let Some(v) = parse_env::<usize>("CODELOOP_MAX_TOOL_CALLS")? {
            config.runner.max_tool_calls = v;
        }
        if let Some(ms) = parse_env::<u64>("CODELOOP_TIMEOUT_MS")? {
            config.runner.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_env::<u64>("CODELOOP_LOCK_MAX_AGE_MS")? {
            config.lock.max_age = Duration::from_millis(ms);
        }
        if let Some(v) = parse_env::<usize>("CODELOOP_GOLDEN_MAX_ENTRIES")? {
            config.golden_max_entries = v;
        }
        if let Some(v) = parse_env::<f64>("CODELOOP_CHARS_PER_TOKEN")? {
            config.context.chars_per_token = v;
        }
        if let Some(v) = parse_env::<usize>("CODELOOP_MIN_SEARCH_HITS")? {
            config.evidence.min_search_hits = Some(v);
        }
        if let Ok(format) = std::env::var("CODELOOP_PATCH_FORMAT") {
            config.pipeline.patch_format = format
                .parse()
                .map_err(|e| ConfigError::InvalidValue("CODELOOP_PATCH_FORMAT".to_string(), e))?;
        }

        config.validation.allow_shell = env_var_bool("CODELOOP_ALLOW_SHELL", false);
        config.validation.shell_allowlist = env_var_list("CODELOOP_SHELL_ALLOWLIST");
        config.critic.read_only_paths = env_var_list("CODELOOP_READ_ONLY_PATHS");
        config.critic.allowed_write_paths = env_var_list("CODELOOP_ALLOWED_PATHS");
        config.pricing_file = std::env::var("CODELOOP_PRICING_FILE").ok().map(PathBuf::from);

        config.context.validate()?;
        Ok(config)
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, model: String, workspace_root: PathBuf) -> Self {
        let state_dir = workspace_root.join(".codeloop");
        Self {
            workspace_root,
            state_dir,
            provider: ProviderConfig {
                api_key,
                provider_name: "openrouter".to_string(),
                model,
                base_url: None,
            },
            context: ContextConfig::default(),
            file_loader: FileLoaderConfig::default(),
            evidence: EvidenceGateConfig::default(),
            validation: ValidationConfig::default(),
            critic: CriticConfig::default(),
            runner: RunnerConfig::default(),
            lock: LockConfig::default(),
            pipeline: PipelineConfig::default(),
            golden_max_entries: 50,
            pricing_file: None,
        }
    }

    /// Directory holding per-lane JSONL files.
    pub fn lanes_dir(&self) -> PathBuf {
        self.state_dir.join("lanes")
    }

    /// Golden-set JSONL file.
    pub fn golden_set_path(&self) -> PathBuf {
        self.state_dir.join("golden_set.jsonl")
    }

    /// Directory where run summaries are written for the search index.
    pub fn run_history_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_chars_per_token() {
        let mut config = ContextConfig::default();
        config.chars_per_token = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(field, _)) if field == "chars_per_token"
        ));
        config.chars_per_token = f64::NAN;
        assert!(config.validate().is_err());
        config.chars_per_token = 3.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn token_limit_prefers_model_specific_value() {
        let mut config = ContextConfig::default();
        config.model_token_limits.insert("small".to_string(), 1_000);
        assert_eq!(config.token_limit_for("small"), Some(1_000));
        assert_eq!(config.token_limit_for("other"), Some(32_000));
    }

    #[test]
    fn new_derives_state_paths() {
        let config = Config::new("k".into(), "m".into(), PathBuf::from("/work"));
        assert_eq!(config.lanes_dir(), PathBuf::from("/work/.codeloop/lanes"));
        assert_eq!(config.golden_set_path(), PathBuf::from("/work/.codeloop/golden_set.jsonl"));
    }
}
