//! codeloop - command-line entry point
//!
//! Runs one request through the pipeline against the configured workspace
//! and prints the run report as JSON. Patches are not applied.

use std::sync::Arc;

use anyhow::Context;
use codeloop::{
    config::Config,
    context::{
        AssemblerConfig, ContextAssembler, ContextFileLoader, ContextManager, ContextRedactor, ContextStore,
        ProviderSummarizer,
    },
    cost::{builtin_pricing, load_pricing_file, CostEstimator},
    logging::{FanoutRunLogger, JsonlRunLogger, SharedLogger, TracingRunLogger},
    memory::{GoldenSetStore, RunHistoryIndexer},
    pipeline::Pipeline,
    provider::{OpenRouterProvider, Provider},
    tools::{ToolContext, ToolRegistry},
    validation::ValidationRunner,
    workspace_lock::{ShutdownHandler, WorkspaceLock},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "codeloop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let request = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let request = if request.trim().is_empty() {
        std::env::var("CODELOOP_REQUEST").context("usage: codeloop <request> (or set CODELOOP_REQUEST)")?
    } else {
        request
    };

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, workspace={}",
        config.provider.model,
        config.workspace_root.display()
    );

    let run_id = uuid::Uuid::new_v4().to_string();
    let lock = Arc::new(WorkspaceLock::acquire(&config.workspace_root, &run_id, &config.lock)?);
    let shutdown = Arc::new(ShutdownHandler::new(lock.clone()));
    let _signals = shutdown.register();

    let (jsonl, writer) = JsonlRunLogger::spawn(config.state_dir.join("events").join(format!("{}.jsonl", run_id)));
    let report = {
        let sinks: Vec<SharedLogger> = vec![Arc::new(TracingRunLogger), Arc::new(jsonl)];
        let logger: SharedLogger = Arc::new(FanoutRunLogger::new(sinks));
        let pipeline = build_pipeline(&config, logger)?;
        pipeline.run_with_id(&run_id, &request).await
    };
    // Every sender is gone once the pipeline drops; wait for the log to flush.
    if let Err(e) = writer.await {
        warn!("Run log writer stopped abnormally: {}", e);
    }
    lock.release()?;

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_pipeline(config: &Config, logger: SharedLogger) -> anyhow::Result<Pipeline> {
    let mut openrouter = OpenRouterProvider::new(config.provider.api_key.clone(), config.provider.model.clone());
    if let Some(url) = &config.provider.base_url {
        openrouter = openrouter.with_base_url(url.clone());
    }
    let provider: Arc<dyn Provider> = Arc::new(openrouter);

    let mut redactor = ContextRedactor::new(&config.workspace_root, &config.context)?;
    let ignore_patterns = redactor.load_ignore_matchers();
    info!("Loaded {} ignore patterns", ignore_patterns);
    let redactor = Arc::new(redactor);

    let manager = ContextManager::new(
        config.context.clone(),
        Some(ContextStore::new(config.lanes_dir())),
        redactor.clone(),
    )?
    .with_summarizer(Arc::new(ProviderSummarizer::new(provider.clone())))
    .with_logger(logger.clone());

    let golden = Arc::new(GoldenSetStore::new(config.golden_set_path(), config.golden_max_entries));
    let history = Arc::new(RunHistoryIndexer::new(&config.workspace_root, config.run_history_dir()));

    let loader = ContextFileLoader::new(
        &config.workspace_root,
        config.file_loader.clone(),
        config.context.chars_per_token,
    )
    .with_redactor(redactor);
    let assembler = ContextAssembler::new(AssemblerConfig::default(), loader)
        .with_golden_set(golden.clone())
        .with_run_history(history.clone());

    let pricing = match &config.pricing_file {
        Some(path) => load_pricing_file(path)?,
        None => builtin_pricing(),
    };

    let validation = Arc::new(ValidationRunner::new(&config.workspace_root, config.validation.clone()));
    let tools = Arc::new(ToolRegistry::with_builtins(ToolContext::new(&config.workspace_root)));

    Ok(Pipeline::new(provider, Arc::new(manager), assembler, validation)
        .with_pipeline_config(config.pipeline.clone())
        .with_evidence_config(config.evidence.clone())
        .with_critic_config(config.critic.clone())
        .with_tools(tools, config.runner.clone())
        .with_cost_estimator(CostEstimator::new(pricing, config.context.chars_per_token))
        .with_logger(logger)
        .with_golden_set(golden)
        .with_run_history(history))
}
