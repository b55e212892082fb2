//! Pipeline phases that talk to a model.
//!
//! # Phases
//! - **ArchitectPlanner**: context bundle to validated [`Plan`]
//! - **BuilderPhase**: plan to raw patch output, optionally through the tool runner
//! - **CriticEvaluator**: judges builder output against the plan and guardrails
//!
//! Phases that call the provider report a [`PhaseCall`] so the pipeline can
//! estimate cost.

mod architect;
mod builder;
mod critic;

pub use architect::{ArchitectPlanner, Plan, PlannerError, UNKNOWN_TARGET};
pub use builder::{BuildOutput, BuilderError, BuilderPhase};
pub use critic::{
    classify_reason, detect_guardrail, ContextRequest, CriticEvaluator, CriticResult, CriticStatus,
    Disposition, GuardrailClassification,
};

use crate::provider::TokenUsage;

/// Size and reported usage of one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCall {
    pub char_count: usize,
    pub usage: Option<TokenUsage>,
}

impl PhaseCall {
    pub fn new(char_count: usize) -> Self {
        Self {
            char_count,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }
}
