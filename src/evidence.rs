//! Evidence gate: did the librarian phase gather enough context to plan?

use serde::{Deserialize, Serialize};

use crate::config::EvidenceGateConfig;

/// Evidence gathered while assembling context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceCounts {
    pub search_hits: usize,
    pub snippet_count: usize,
    pub symbol_count: usize,
    pub ast_count: usize,
    pub impact_files: usize,
    pub warnings: Vec<String>,
}

/// How often each retrieval tool was used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub search: usize,
    pub open: usize,
    pub snippet: usize,
    pub symbols: usize,
    pub ast: usize,
    pub impact: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pass,
    Fail,
}

/// Observed values the thresholds were compared against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedEvidence {
    pub search_hits: usize,
    pub open_or_snippet: usize,
    pub symbols_or_ast: usize,
    pub impact: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceGateResult {
    pub status: GateStatus,
    pub missing: Vec<String>,
    pub score: f64,
    pub threshold: f64,
    pub observed: ObservedEvidence,
}

impl EvidenceGateResult {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Pass
    }
}

/// Compare observed evidence with the configured minimums.
///
/// Search hits and impact files count results only. Open/snippet and
/// symbols/AST take the larger of the raw evidence and the matching tool usage.
/// Warnings fail only when they *exceed* `max_warnings`.
pub fn evaluate(
    config: &EvidenceGateConfig,
    evidence: &EvidenceCounts,
    tool_usage: &ToolUsage,
    warnings: &[String],
) -> EvidenceGateResult {
    let observed = ObservedEvidence {
        search_hits: evidence.search_hits,
        open_or_snippet: evidence.snippet_count.max(tool_usage.open + tool_usage.snippet),
        symbols_or_ast: (evidence.symbol_count + evidence.ast_count)
            .max(tool_usage.symbols + tool_usage.ast),
        impact: evidence.impact_files,
        warnings: evidence.warnings.len() + warnings.len(),
    };

    let mut missing = Vec::new();
    let mut total = 0usize;
    let mut satisfied = 0usize;
    let mut check = |name: &str, ok: bool| {
        total += 1;
        if ok {
            satisfied += 1;
        } else {
            missing.push(name.to_string());
        }
    };

    if let Some(min) = config.min_search_hits {
        check("search_hits", observed.search_hits >= min);
    }
    if let Some(min) = config.min_open_or_snippet {
        check("open_or_snippet", observed.open_or_snippet >= min);
    }
    if let Some(min) = config.min_symbols_or_ast {
        check("symbols_or_ast", observed.symbols_or_ast >= min);
    }
    if let Some(min) = config.min_impact {
        check("impact", observed.impact >= min);
    }
    if let Some(max) = config.max_warnings {
        check("warnings", observed.warnings <= max);
    }

    let score = if total == 0 {
        1.0
    } else {
        satisfied as f64 / total as f64
    };
    let threshold = 1.0;
    EvidenceGateResult {
        status: if score >= threshold {
            GateStatus::Pass
        } else {
            GateStatus::Fail
        },
        missing,
        score,
        threshold,
        observed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_hit_shortfall_fails() {
        let config = EvidenceGateConfig {
            min_search_hits: Some(4),
            min_open_or_snippet: Some(1),
            ..Default::default()
        };
        let evidence = EvidenceCounts {
            search_hits: 1,
            snippet_count: 3,
            ..Default::default()
        };
        let result = evaluate(&config, &evidence, &ToolUsage::default(), &[]);
        assert_eq!(result.status, GateStatus::Fail);
        assert_eq!(result.missing, vec!["search_hits"]);
        assert!((result.score - 0.5).abs() < f64::EPSILON);
        assert_eq!(result.threshold, 1.0);
    }

    #[test]
    fn tool_usage_can_satisfy_thresholds() {
        let config = EvidenceGateConfig {
            min_open_or_snippet: Some(2),
            min_symbols_or_ast: Some(2),
            ..Default::default()
        };
        let usage = ToolUsage {
            open: 1,
            snippet: 1,
            symbols: 1,
            ast: 1,
            ..Default::default()
        };
        let result = evaluate(&config, &EvidenceCounts::default(), &usage, &[]);
        assert!(result.passed());
        assert_eq!(result.observed.open_or_snippet, 2);
    }

    #[test]
    fn query_and_impact_counts_do_not_stand_in_for_results() {
        let config = EvidenceGateConfig {
            min_search_hits: Some(4),
            min_impact: Some(1),
            ..Default::default()
        };
        let evidence = EvidenceCounts {
            search_hits: 1,
            ..Default::default()
        };
        let usage = ToolUsage {
            search: 4,
            impact: 2,
            ..Default::default()
        };
        let result = evaluate(&config, &evidence, &usage, &[]);
        assert_eq!(result.status, GateStatus::Fail);
        assert_eq!(result.missing, vec!["search_hits", "impact"]);
        assert_eq!(result.observed.search_hits, 1);
        assert_eq!(result.observed.impact, 0);
    }

    #[test]
    fn warnings_fail_only_when_exceeding_max() {
        let config = EvidenceGateConfig {
            max_warnings: Some(2),
            ..Default::default()
        };
        let evidence = EvidenceCounts {
            warnings: vec!["a".into()],
            ..Default::default()
        };
        let at_max = evaluate(&config, &evidence, &ToolUsage::default(), &["b".to_string()]);
        assert!(at_max.passed());
        assert_eq!(at_max.observed.warnings, 2);

        let over = evaluate(
            &config,
            &evidence,
            &ToolUsage::default(),
            &["b".to_string(), "c".to_string()],
        );
        assert!(!over.passed());
        assert_eq!(over.missing, vec!["warnings"]);
    }

    #[test]
    fn no_criteria_passes() {
        let result = evaluate(
            &EvidenceGateConfig::default(),
            &EvidenceCounts::default(),
            &ToolUsage::default(),
            &[],
        );
        assert!(result.passed());
        assert_eq!(result.score, 1.0);
    }
}
