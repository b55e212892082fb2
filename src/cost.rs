//! Cost estimation from character counts or token usage.
//!
//! Pricing is looked up by specificity: `provider:model`, then `model`, then
//! `provider`, then `default`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::provider::TokenUsage;
use crate::util::estimate_tokens;

/// Prices in dollars per 1K tokens.
///
/// `per_1k` applies to every token; otherwise input and output rates apply
/// separately (a missing rate counts as free).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingSpec {
    #[serde(default, alias = "per1K", alias = "per1k", skip_serializing_if = "Option::is_none")]
    pub per_1k: Option<f64>,
    #[serde(default, alias = "inputPer1K", alias = "input_per1k", skip_serializing_if = "Option::is_none")]
    pub input_per_1k: Option<f64>,
    #[serde(default, alias = "outputPer1K", alias = "output_per1k", skip_serializing_if = "Option::is_none")]
    pub output_per_1k: Option<f64>,
}

impl PricingSpec {
    pub fn flat(per_1k: f64) -> Self {
        Self {
            per_1k: Some(per_1k),
            ..Default::default()
        }
    }

    pub fn split(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            per_1k: None,
            input_per_1k: Some(input_per_1k),
            output_per_1k: Some(output_per_1k),
        }
    }

    /// Dollar cost of the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.per_1k {
            Some(rate) => (input_tokens + output_tokens) as f64 / 1000.0 * rate,
            None => {
                input_tokens as f64 / 1000.0 * self.input_per_1k.unwrap_or(0.0)
                    + output_tokens as f64 / 1000.0 * self.output_per_1k.unwrap_or(0.0)
            }
        }
    }
}

/// Resolve the most specific pricing entry. Returns the spec and its key.
pub fn resolve_pricing<'a>(
    table: &'a HashMap<String, PricingSpec>,
    provider: &str,
    model: &str,
) -> Option<(&'a PricingSpec, String)> {
    let candidates = [
        format!("{}:{}", provider, model),
        model.to_string(),
        provider.to_string(),
        "default".to_string(),
    ];
    candidates
        .into_iter()
        .filter(|key| !key.is_empty() && key != ":")
        .find_map(|key| table.get(&key).map(|spec| (spec, key)))
}

/// Load a `{"key": {"per1K": ...}}` pricing table from JSON.
pub fn load_pricing_file(path: &Path) -> anyhow::Result<HashMap<String, PricingSpec>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid pricing table {}", path.display()))
}

/// Per-1K prices for common models ($/1M divided by 1000).
pub fn builtin_pricing() -> HashMap<String, PricingSpec> {
    let entries: &[(&str, f64, f64)] = &[
        ("anthropic/claude-sonnet-4.5", 0.003, 0.015),
        ("anthropic/claude-sonnet-4", 0.003, 0.015),
        ("anthropic/claude-3.5-haiku", 0.0008, 0.004),
        ("anthropic/claude-opus-4", 0.015, 0.075),
        ("openai/gpt-4o", 0.0025, 0.01),
        ("openai/gpt-4o-mini", 0.00015, 0.0006),
        ("openai/o4-mini", 0.0011, 0.0044),
        ("google/gemini-2.5-pro", 0.00125, 0.01),
        ("google/gemini-2.5-flash", 0.00015, 0.0006),
    ];
    entries
        .iter()
        .map(|(model, input, output)| (model.to_string(), PricingSpec::split(*input, *output)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub char_count: usize,
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub estimated_total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing_source: Option<String>,
}

impl CostEstimate {
    /// Accumulate another estimate; cost stays `None` only if both are `None`.
    pub fn add(&mut self, other: &CostEstimate) {
        self.char_count += other.char_count;
        self.estimated_input_tokens += other.estimated_input_tokens;
        self.estimated_output_tokens += other.estimated_output_tokens;
        self.estimated_total_tokens += other.estimated_total_tokens;
        self.estimated_cost = match (self.estimated_cost, other.estimated_cost) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
        if self.pricing_source.is_none() {
            self.pricing_source = other.pricing_source.clone();
        }
    }
}

pub struct CostEstimator {
    pricing: HashMap<String, PricingSpec>,
    chars_per_token: f64,
}

impl CostEstimator {
    pub fn new(pricing: HashMap<String, PricingSpec>, chars_per_token: f64) -> Self {
        Self {
            pricing,
            chars_per_token,
        }
    }

    /// Estimate from prompt size before a call.
    pub fn estimate_from_chars(
        &self,
        provider: &str,
        model: &str,
        char_count: usize,
        expected_output_tokens: u64,
    ) -> CostEstimate {
        let input = estimate_tokens(char_count, self.chars_per_token);
        self.build(provider, model, char_count, input, expected_output_tokens)
    }

    /// Estimate from usage reported by the provider.
    pub fn estimate_from_usage(
        &self,
        provider: &str,
        model: &str,
        char_count: usize,
        usage: &TokenUsage,
    ) -> CostEstimate {
        self.build(provider, model, char_count, usage.input_tokens, usage.output_tokens)
    }

    fn build(&self, provider: &str, model: &str, char_count: usize, input: u64, output: u64) -> CostEstimate {
        let resolved = resolve_pricing(&self.pricing, provider, model);
        if resolved.is_none() {
            tracing::debug!(provider = %provider, model = %model, "No pricing entry; cost left unset");
        }
        CostEstimate {
            char_count,
            estimated_input_tokens: input,
            estimated_output_tokens: output,
            estimated_total_tokens: input.saturating_add(output),
            estimated_cost: resolved.as_ref().map(|(spec, _)| spec.cost(input, output)),
            pricing_source: resolved.map(|(_, key)| key),
        }
    }
}
