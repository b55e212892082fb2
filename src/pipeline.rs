//! End-to-end run: librarian, evidence gate, architect, builder/critic loop.
//!
//! ```text
//!   request ──▶ ContextAssembler ──▶ Evidence Gate ──▶ ArchitectPlanner
//!                                        │ fail                 │
//!                                        ▼                      ▼
//!                              InsufficientEvidence   ┌──▶ BuilderPhase
//!                                                     │         │
//!                                                     │   PatchInterpreter
//!                                                     │         │
//!                                          retryable  │   CriticEvaluator ──▶ PASS ──▶ PatchApplier
//!                                          feedback   └─────────┤
//!                                                               └──▶ non-retryable: Aborted
//! ```
//!
//! Applying a passed patch is delegated to an injected [`PatchApplier`];
//! without one the run is a dry run.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::agents::{
    ArchitectPlanner, BuilderError, BuilderPhase, CriticEvaluator, CriticResult, PhaseCall, Plan, PlannerError,
};
use crate::config::{CriticConfig, EvidenceGateConfig, PipelineConfig, RunnerConfig};
use crate::context::{
    AppendOptions, ContextAssembler, ContextError, ContextManager, LaneMessage, LaneRole, LaneScope,
};
use crate::cost::{CostEstimate, CostEstimator};
use crate::evidence::{self, EvidenceGateResult};
use crate::logging::{NoopRunLogger, SharedLogger};
use crate::memory::{GoldenSetEntry, GoldenSetStore, RunHistoryIndexer, RunSummary};
use crate::patch::{touched_files, PatchInterpreter, PatchOperation};
use crate::provider::{Provider, Role};
use crate::runner::Runner;
use crate::tools::ToolRegistry;
use crate::validation::ValidationRunner;

/// Output tokens assumed when a provider reports no usage.
const EXPECTED_OUTPUT_TOKENS: u64 = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Passed,
    Failed,
    InsufficientEvidence,
    Aborted,
}

impl PipelineOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOutcome::Passed => "passed",
            PipelineOutcome::Failed => "failed",
            PipelineOutcome::InsufficientEvidence => "insufficient_evidence",
            PipelineOutcome::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub outcome: PipelineOutcome,
    pub evidence_gate: Option<EvidenceGateResult>,
    pub plan: Option<Plan>,
    /// Builder attempts made
    pub attempts: usize,
    pub critic: Option<CriticResult>,
    pub operations: Vec<PatchOperation>,
    pub cost: CostEstimate,
    pub reason: Option<String>,
}

impl PipelineReport {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            outcome: PipelineOutcome::Failed,
            evidence_gate: None,
            plan: None,
            attempts: 0,
            critic: None,
            operations: Vec::new(),
            cost: CostEstimate::default(),
            reason: None,
        }
    }

    fn finish(mut self, outcome: PipelineOutcome, reason: Option<String>) -> Self {
        self.outcome = outcome;
        self.reason = reason;
        self
    }
}

/// Writes a passed patch into the workspace.
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(&self, operations: &[PatchOperation]) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Builder(#[from] BuilderError),
}

pub struct Pipeline {
    provider: Arc<dyn Provider>,
    manager: Arc<ContextManager>,
    assembler: ContextAssembler,
    validation: Arc<ValidationRunner>,
    config: PipelineConfig,
    evidence: EvidenceGateConfig,
    critic: CriticConfig,
    tools: Option<(Arc<ToolRegistry>, RunnerConfig)>,
    cost: Option<CostEstimator>,
    logger: SharedLogger,
    applier: Option<Arc<dyn PatchApplier>>,
    golden: Option<Arc<GoldenSetStore>>,
    history: Option<Arc<RunHistoryIndexer>>,
}

impl Pipeline {
    pub fn new(
        provider: Arc<dyn Provider>,
        manager: Arc<ContextManager>,
        assembler: ContextAssembler,
        validation: Arc<ValidationRunner>,
    ) -> Self {
        Self {
            provider,
            manager,
            assembler,
            validation,
            config: PipelineConfig::default(),
            evidence: EvidenceGateConfig::default(),
            critic: CriticConfig::default(),
            tools: None,
            cost: None,
            logger: Arc::new(NoopRunLogger),
            applier: None,
            golden: None,
            history: None,
        }
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_evidence_config(mut self, config: EvidenceGateConfig) -> Self {
        self.evidence = config;
        self
    }

    pub fn with_critic_config(mut self, config: CriticConfig) -> Self {
        self.critic = config;
        self
    }

    /// Let the builder call tools through a bounded runner.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>, runner: RunnerConfig) -> Self {
        self.tools = Some((tools, runner));
        self
    }

    pub fn with_cost_estimator(mut self, estimator: CostEstimator) -> Self {
        self.cost = Some(estimator);
        self
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_patch_applier(mut self, applier: Arc<dyn PatchApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Record a golden-set entry for every passed run.
    pub fn with_golden_set(mut self, store: Arc<GoldenSetStore>) -> Self {
        self.golden = Some(store);
        self
    }

    /// Write a run summary for every finished run.
    pub fn with_run_history(mut self, history: Arc<RunHistoryIndexer>) -> Self {
        self.history = Some(history);
        self
    }

    fn phase(&self, run_id: &str, phase: &str, extra: serde_json::Value) {
        self.logger.log(
            "pipeline_phase",
            json!({ "run_id": run_id, "phase": phase, "detail": extra }),
        );
    }

    pub async fn run(&self, request: &str) -> Result<PipelineReport, PipelineError> {
        self.run_with_id(&Uuid::new_v4().to_string(), request).await
    }

    /// Run under a caller-chosen id, e.g. the one holding the workspace lock.
    pub async fn run_with_id(&self, run_id: &str, request: &str) -> Result<PipelineReport, PipelineError> {
        tracing::info!("Starting run {} for request: {}", run_id, request);
        let report = self.run_inner(run_id, request).await?;
        tracing::info!(
            "Run {} finished: {} after {} attempt(s)",
            run_id,
            report.outcome.as_str(),
            report.attempts
        );
        self.phase(run_id, "finished", json!({ "outcome": report.outcome }));
        self.record_history(request, &report).await;
        Ok(report)
    }

    async fn run_inner(&self, run_id: &str, request: &str) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::new(run_id.to_string());

        self.phase(run_id, "librarian", json!({}));
        let assembled = self.assembler.assemble(request).await;
        let gate = evidence::evaluate(&self.evidence, &assembled.evidence, &assembled.tool_usage, &[]);
        self.logger.log(
            "evidence_gate",
            json!({
                "run_id": run_id,
                "status": gate.status,
                "missing": gate.missing,
                "score": gate.score,
                "threshold": gate.threshold,
                "observed": gate.observed,
            }),
        );
        let passed_gate = gate.passed();
        let missing = gate.missing.join(", ");
        report.evidence_gate = Some(gate);
        if !passed_gate {
            tracing::warn!("Evidence gate failed for run {}: missing {}", run_id, missing);
            return Ok(report.finish(
                PipelineOutcome::InsufficientEvidence,
                Some(format!("missing: {}", missing)),
            ));
        }

        // Lanes are scoped to this run so a persisted lane never leaks into the next one.
        let task = format!(
            "{}-{}",
            self.config.task_id,
            run_id.split('-').next().unwrap_or(run_id)
        );
        let scope = |role| LaneScope::new(&self.config.job_id, &task, role).with_model(self.provider.model());
        let librarian = self.manager.get_lane(&scope(LaneRole::Librarian)).await?;
        let architect = self.manager.get_lane(&scope(LaneRole::Architect)).await?;
        let builder_lane = self.manager.get_lane(&scope(LaneRole::Builder)).await?;
        let critic_lane = self.manager.get_lane(&scope(LaneRole::Critic)).await?;

        self.manager
            .append(
                &librarian.id,
                LaneMessage::new(
                    Role::Assistant,
                    format!(
                        "Gathered {} search hits and {} files for: {}",
                        assembled.evidence.search_hits,
                        assembled.bundle.files.len(),
                        request
                    ),
                ),
                AppendOptions::default(),
            )
            .await?;

        self.phase(run_id, "architect", json!({}));
        let planner = ArchitectPlanner::new(self.provider.clone()).with_lane(self.manager.clone(), &architect.id);
        let (plan, call) = planner.plan(&assembled.bundle).await?;
        self.record_cost(run_id, "architect", call, &mut report.cost);
        report.plan = Some(plan.clone());

        let mut builder = BuilderPhase::new(
            self.provider.clone(),
            self.manager.clone(),
            &builder_lane.id,
            self.config.patch_format,
        );
        if let Some((tools, runner_config)) = &self.tools {
            let runner = Runner::new(self.provider.clone(), tools.clone(), runner_config.clone())
                .with_logger(self.logger.clone());
            builder = builder.with_runner(Arc::new(runner));
        }
        let interpreter = PatchInterpreter::new(self.provider.clone(), self.config.patch_format)
            .with_max_retries(self.config.interpreter_max_retries)
            .with_logger(self.logger.clone());
        let critic = CriticEvaluator::new(self.critic.clone(), self.validation.clone(), self.config.patch_format)
            .with_lane(self.manager.clone(), &critic_lane.id)
            .with_logger(self.logger.clone());

        let mut feedback: Option<String> = None;
        for attempt in 0..=self.config.max_retries {
            report.attempts = attempt + 1;
            self.phase(run_id, "builder", json!({ "attempt": attempt + 1 }));
            let output = builder.build(&plan, &assembled.bundle, feedback.as_deref()).await?;
            self.record_cost(run_id, "builder", output.call, &mut report.cost);

            let interpretation = match interpreter.interpret(&output.raw).await {
                Ok(interpretation) => interpretation,
                Err(e) => {
                    tracing::warn!("Builder attempt {} produced unusable output: {}", attempt + 1, e);
                    report.reason = Some(e.to_string());
                    feedback = Some(format!("patch output could not be parsed: {}", e));
                    continue;
                }
            };
            if interpretation.retries > 0 {
                let call = PhaseCall::new(output.raw.len()).with_usage(Some(interpretation.usage));
                self.record_cost(run_id, "interpreter", call, &mut report.cost);
            }

            self.phase(run_id, "critic", json!({ "attempt": attempt + 1 }));
            let verdict = critic
                .evaluate(&plan, &output.raw, Some(touched_files(&interpretation.operations)))
                .await;
            let reasons = verdict.reasons.join("; ");
            let passed = verdict.passed();
            let retryable = verdict.retryable;
            report.critic = Some(verdict);
            report.operations = interpretation.operations;

            if passed {
                return Ok(self.accept(run_id, request, &plan, report).await);
            }
            if !retryable {
                tracing::warn!("Critic rejected run {} without retry: {}", run_id, reasons);
                return Ok(report.finish(PipelineOutcome::Aborted, Some(reasons)));
            }
            report.reason = Some(reasons.clone());
            feedback = Some(reasons);
        }

        let reason = report.reason.take();
        Ok(report.finish(PipelineOutcome::Failed, reason))
    }

    /// Hand a passed patch to the applier and remember it.
    async fn accept(&self, run_id: &str, request: &str, plan: &Plan, report: PipelineReport) -> PipelineReport {
        if let Some(applier) = &self.applier {
            self.phase(run_id, "apply", json!({ "operations": report.operations.len() }));
            if let Err(e) = applier.apply(&report.operations).await {
                tracing::error!("Applying patch for run {} failed: {}", run_id, e);
                return report.finish(PipelineOutcome::Failed, Some(format!("patch application failed: {}", e)));
            }
        } else {
            tracing::info!("No patch applier configured; run {} is a dry run", run_id);
        }

        if let Some(golden) = &self.golden {
            let mut entry = GoldenSetEntry::new(request, plan.summary(), touched_files(&report.operations));
            entry.patch_summary = Some(
                report
                    .operations
                    .iter()
                    .map(|op| format!("{} {}", op.action(), op.file()))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            if let Err(e) = golden.append(entry).await {
                tracing::warn!("Failed to record golden-set entry: {}", e);
            }
        }
        report.finish(PipelineOutcome::Passed, None)
    }

    fn record_cost(&self, run_id: &str, phase: &str, call: PhaseCall, total: &mut CostEstimate) {
        let Some(estimator) = &self.cost else {
            return;
        };
        let provider = self.provider.name();
        let model = self.provider.model();
        let estimate = match &call.usage {
            Some(usage) => estimator.estimate_from_usage(provider, model, call.char_count, usage),
            None => estimator.estimate_from_chars(provider, model, call.char_count, EXPECTED_OUTPUT_TOKENS),
        };
        self.logger.log(
            "cost_estimate",
            json!({
                "run_id": run_id,
                "phase": phase,
                "provider": provider,
                "model": model,
                "estimate": estimate,
            }),
        );
        total.add(&estimate);
    }

    async fn record_history(&self, request: &str, report: &PipelineReport) {
        let Some(history) = &self.history else {
            return;
        };
        let mut summary = RunSummary::new(&report.run_id, request, report.outcome.as_str());
        if let Some(plan) = &report.plan {
            summary.plan_summary = plan.summary();
        }
        summary.touched_files = touched_files(&report.operations);
        if let Some(reason) = &report.reason {
            summary.reasons = vec![reason.clone()];
        }
        if let Err(e) = history.record(&summary).await {
            tracing::warn!("Failed to record run history: {}", e);
        }
    }
}
