//! Critic phase: accept or reject builder output.
//!
//! Checks run in a fixed order and the first failure wins: empty output,
//! read-only paths, the write allow-list, nothing touched, no overlap with
//! the plan's targets, then the plan's verification steps.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::Plan;
use crate::config::CriticConfig;
use crate::context::{AppendOptions, ContextManager, LaneMessage};
use crate::logging::{NoopRunLogger, SharedLogger};
use crate::patch::{parse_patch_output, touched_files, PatchFormat};
use crate::provider::Role;
use crate::util::{normalize_rel_path, path_is_under};
use crate::validation::ValidationRunner;

pub const SCOPE_VIOLATION: &str = "scope_violation";
pub const DOC_EDIT_GUARD: &str = "doc_edit_guard";
pub const MERGE_CONFLICT: &str = "merge_conflict";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriticStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailClassification {
    pub reason_code: String,
    pub disposition: Disposition,
}

/// Extra context the critic wants before the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub reason: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticResult {
    pub status: CriticStatus,
    pub reasons: Vec<String>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<GuardrailClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<ContextRequest>,
}

impl CriticResult {
    pub fn passed(&self) -> bool {
        self.status == CriticStatus::Pass
    }

    fn pass() -> Self {
        Self {
            status: CriticStatus::Pass,
            reasons: Vec::new(),
            retryable: false,
            guardrail: None,
            report: None,
            request: None,
        }
    }

    fn fail(reasons: Vec<String>, default_code: &str) -> Self {
        let code = detect_guardrail(&reasons).unwrap_or(default_code);
        let guardrail = classify_reason(code);
        Self {
            status: CriticStatus::Fail,
            retryable: guardrail.disposition == Disposition::Retryable,
            reasons,
            guardrail: Some(guardrail),
            report: None,
            request: None,
        }
    }
}

/// Fixed disposition table: guardrail codes are non-retryable.
pub fn classify_reason(reason_code: &str) -> GuardrailClassification {
    let disposition = match reason_code {
        SCOPE_VIOLATION | DOC_EDIT_GUARD | MERGE_CONFLICT => Disposition::NonRetryable,
        _ => Disposition::Retryable,
    };
    GuardrailClassification {
        reason_code: reason_code.to_string(),
        disposition,
    }
}

fn guardrail_patterns() -> &'static [(&'static str, Option<Regex>)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Option<Regex>)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                SCOPE_VIOLATION,
                Regex::new(r"(?i)scope[_ ]violation|outside (?:the )?(?:allowed|permitted|plan) (?:scope|paths?|files?)").ok(),
            ),
            (
                DOC_EDIT_GUARD,
                Regex::new(r"(?i)doc[_ ]edit[_ ]guard|read[- ]only (?:path|file)").ok(),
            ),
            (
                MERGE_CONFLICT,
                Regex::new(r"(?i)merge[_ ]conflict|conflict markers?|<{7}").ok(),
            ),
        ]
    })
}

/// First guardrail code whose pattern matches any reason.
pub fn detect_guardrail(reasons: &[String]) -> Option<&'static str> {
    guardrail_patterns().iter().find_map(|(code, re)| {
        let re = re.as_ref()?;
        reasons.iter().any(|r| re.is_match(r)).then_some(*code)
    })
}

/// Paths named by unified-diff headers.
fn diff_paths(output: &str) -> Vec<String> {
    static HEADER: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = HEADER
        .get_or_init(|| Regex::new(r"(?m)^(?:\+\+\+|---) (?:[ab]/)?(\S+)").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    re.captures_iter(output)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|p| p != "/dev/null")
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

pub struct CriticEvaluator {
    config: CriticConfig,
    validation: Arc<ValidationRunner>,
    format: PatchFormat,
    lane: Option<(Arc<ContextManager>, String)>,
    logger: SharedLogger,
}

impl CriticEvaluator {
    pub fn new(config: CriticConfig, validation: Arc<ValidationRunner>, format: PatchFormat) -> Self {
        Self {
            config,
            validation,
            format,
            lane: None,
            logger: Arc::new(NoopRunLogger),
        }
    }

    /// Append every verdict to `lane_id`.
    pub fn with_lane(mut self, manager: Arc<ContextManager>, lane_id: impl Into<String>) -> Self {
        self.lane = Some((manager, lane_id.into()));
        self
    }

    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Files touched by `output`: parsed patch operations, else diff headers.
    pub fn infer_touched(&self, output: &str) -> Vec<String> {
        match parse_patch_output(output, self.format) {
            Ok(ops) => touched_files(&ops),
            Err(_) => diff_paths(output),
        }
    }

    pub async fn evaluate(&self, plan: &Plan, output: &str, touched: Option<Vec<String>>) -> CriticResult {
        let targets = plan.comparable_targets();
        let touched: Vec<String> = match touched {
            Some(files) => files,
            None if !targets.is_empty() => self.infer_touched(output),
            None => Vec::new(),
        }
        .iter()
        .map(|f| normalize_rel_path(f))
        .filter(|f| !f.is_empty())
        .collect();

        let mut validation_errors = Vec::new();
        let mut result = self.judge(plan, output, &targets, &touched, &mut validation_errors).await;

        result.report = Some(json!({
            "status": result.status,
            "reasons": result.reasons,
            "retryable": result.retryable,
            "guardrail": result.guardrail,
            "touched_files": touched,
            "target_files": targets,
            "validation_errors": validation_errors,
        }));
        self.record(&result).await;
        result
    }

    async fn judge(
        &self,
        plan: &Plan,
        output: &str,
        targets: &[String],
        touched: &[String],
        validation_errors: &mut Vec<String>,
    ) -> CriticResult {
        if output.trim().is_empty() {
            return CriticResult::fail(vec!["builder output is empty".to_string()], "empty_output");
        }

        let read_only: Vec<&String> = touched
            .iter()
            .filter(|f| self.config.read_only_paths.iter().any(|p| path_is_under(f, p)))
            .collect();
        if !read_only.is_empty() {
            let reasons = read_only
                .iter()
                .map(|f| format!("{}: read-only path touched: {}", DOC_EDIT_GUARD, f))
                .collect();
            return CriticResult::fail(reasons, DOC_EDIT_GUARD);
        }

        if !self.config.allowed_write_paths.is_empty() {
            let outside: Vec<&String> = touched
                .iter()
                .filter(|f| !self.config.allowed_write_paths.iter().any(|p| path_is_under(f, p)))
                .collect();
            if !outside.is_empty() {
                let reasons = outside
                    .iter()
                    .map(|f| format!("{}: {} is outside the allowed write paths", SCOPE_VIOLATION, f))
                    .collect();
                return CriticResult::fail(reasons, SCOPE_VIOLATION);
            }
        }

        if !targets.is_empty() && touched.is_empty() {
            let mut result = CriticResult::fail(
                vec![format!(
                    "no files were touched; plan targets {}",
                    targets.join(", ")
                )],
                "no_changes",
            );
            if self.config.request_context_on_empty {
                result.request = Some(ContextRequest {
                    reason: "builder produced no file changes".to_string(),
                    files: targets.to_vec(),
                });
            }
            return result;
        }

        if !targets.is_empty() && !touched.iter().any(|f| targets.contains(f)) {
            return CriticResult::fail(
                vec![format!(
                    "{}: touched files [{}] do not overlap plan targets [{}]",
                    SCOPE_VIOLATION,
                    touched.join(", "),
                    targets.join(", ")
                )],
                SCOPE_VIOLATION,
            );
        }

        let report = self.validation.run(&plan.verification).await;
        if !report.ok {
            *validation_errors = report.errors.clone();
            return CriticResult::fail(report.errors, "validation_failed");
        }
        CriticResult::pass()
    }

    async fn record(&self, result: &CriticResult) {
        self.logger.log(
            "critic_verdict",
            json!({
                "status": result.status,
                "retryable": result.retryable,
                "guardrail": result.guardrail,
                "reasons": result.reasons,
            }),
        );
        let Some((manager, lane_id)) = &self.lane else {
            return;
        };
        let body = result
            .report
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default();
        let mut message = LaneMessage::new(Role::Assistant, body);
        message.name = Some("critic".to_string());
        if let Err(e) = manager.append(lane_id, message, AppendOptions::default()).await {
            tracing::warn!("Failed to record critic verdict: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, ValidationConfig};
    use crate::context::{ContextRedactor, LaneRole, LaneScope};
    use crate::logging::MemoryRunLogger;
    use crate::test_support::FakeDocdex;

    fn plan(targets: &[&str], verification: &[&str]) -> Plan {
        Plan {
            steps: vec!["change".into()],
            target_files: targets.iter().map(|s| s.to_string()).collect(),
            risk_assessment: String::new(),
            verification: verification.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn critic(config: CriticConfig) -> CriticEvaluator {
        let validation = Arc::new(
            ValidationRunner::new("/work", ValidationConfig::default())
                .with_docdex(Arc::new(FakeDocdex::default())),
        );
        CriticEvaluator::new(config, validation, PatchFormat::SearchReplace)
    }

    const PATCH_A: &str = r#"{"patches":[{"action":"replace","file":"src/a.rs","search_block":"x","replace_block":"y"}]}"#;

    #[tokio::test]
    async fn empty_output_fails_retryable() {
        let result = critic(CriticConfig::default()).evaluate(&plan(&["src/a.rs"], &[]), "  ", None).await;
        assert_eq!(result.status, CriticStatus::Fail);
        assert!(result.retryable);
    }

    #[tokio::test]
    async fn read_only_touch_is_doc_edit_guard() {
        let config = CriticConfig {
            read_only_paths: vec!["docs".into()],
            allowed_write_paths: vec!["src".into()],
            ..Default::default()
        };
        let result = critic(config)
            .evaluate(
                &plan(&[], &["false"]),
                "anything",
                Some(vec!["docs/guide.md".into(), "src/a.rs".into()]),
            )
            .await;
        assert!(!result.retryable);
        assert_eq!(
            result.guardrail,
            Some(GuardrailClassification {
                reason_code: DOC_EDIT_GUARD.into(),
                disposition: Disposition::NonRetryable,
            })
        );
    }

    #[tokio::test]
    async fn allow_list_violation_is_scope_violation() {
        let config = CriticConfig {
            allowed_write_paths: vec!["src".into()],
            ..Default::default()
        };
        let result = critic(config)
            .evaluate(&plan(&["src/a.rs"], &[]), "x", Some(vec!["build.rs".into()]))
            .await;
        assert_eq!(result.guardrail.unwrap().reason_code, SCOPE_VIOLATION);
        assert!(!result.retryable);
    }

    #[tokio::test]
    async fn nothing_touched_requests_context() {
        let result = critic(CriticConfig::default())
            .evaluate(&plan(&["src/a.rs", "unknown"], &[]), "I could not find the file.", None)
            .await;
        assert!(result.retryable);
        assert_eq!(result.guardrail.as_ref().unwrap().reason_code, "no_changes");
        assert_eq!(result.request.unwrap().files, vec!["src/a.rs"]);
    }

    #[tokio::test]
    async fn disjoint_targets_are_scope_violation() {
        let result = critic(CriticConfig::default())
            .evaluate(&plan(&["src/b.rs"], &[]), PATCH_A, None)
            .await;
        assert!(!result.retryable);
        assert_eq!(result.guardrail.unwrap().reason_code, SCOPE_VIOLATION);
    }

    #[tokio::test]
    async fn validation_errors_fail_and_pass_otherwise() {
        let c = critic(CriticConfig::default());
        let failed = c.evaluate(&plan(&["src/a.rs"], &["cargo test"]), PATCH_A, None).await;
        assert!(failed.retryable);
        assert_eq!(failed.reasons, vec!["shell validation disabled: cargo test"]);

        let passed = c.evaluate(&plan(&["src/a.rs"], &["hooks:src/a.rs"]), PATCH_A, None).await;
        assert!(passed.passed());
        assert!(passed.report.is_some());
    }

    #[tokio::test]
    async fn diff_headers_are_inferred() {
        let diff = "--- a/src/a.rs\n+++ b/src/a.rs\n@@ -1 +1 @@\n-x\n+y\n";
        let c = critic(CriticConfig::default());
        assert_eq!(c.infer_touched(diff), vec!["src/a.rs"]);
        assert!(c.evaluate(&plan(&["./src/a.rs"], &[]), diff, None).await.passed());
    }

    #[test]
    fn guardrail_detection_scans_reason_text() {
        assert_eq!(
            detect_guardrail(&["hooks: merge conflict in a.rs".to_string()]),
            Some(MERGE_CONFLICT)
        );
        assert_eq!(detect_guardrail(&["<<<<<<< HEAD".to_string()]), Some(MERGE_CONFLICT));
        assert_eq!(detect_guardrail(&["tests failed".to_string()]), None);
        assert_eq!(classify_reason("tests_failed").disposition, Disposition::Retryable);
    }

    #[tokio::test]
    async fn verdicts_are_logged_and_recorded_in_lane() {
        let config = ContextConfig::default();
        let redactor = Arc::new(ContextRedactor::new("/work", &config).unwrap());
        let manager = Arc::new(ContextManager::new(config, None, redactor).unwrap());
        let lane = manager
            .get_lane(&LaneScope::new("j", "t", LaneRole::Critic))
            .await
            .unwrap();
        let logger = Arc::new(MemoryRunLogger::new());
        let c = critic(CriticConfig::default())
            .with_lane(manager.clone(), &lane.id)
            .with_logger(logger.clone());

        c.evaluate(&plan(&["src/a.rs"], &[]), PATCH_A, None).await;
        let recorded = manager.lane(&lane.id).await.unwrap();
        assert_eq!(recorded.messages.len(), 1);
        assert!(recorded.messages[0].content.contains("\"status\":\"PASS\""));
        assert_eq!(logger.events_of("critic_verdict").len(), 1);
    }
}
