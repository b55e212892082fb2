//! Secret masking and ignore-file matching.
//!
//! A redactor is built once per run and shared by reference with every
//! consumer that writes text to durable storage.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use regex::{Captures, Regex};

use super::ContextError;
use crate::config::{ConfigError, ContextConfig};
use crate::util::normalize_rel_path;

const BUILTIN_IGNORES: &[&str] = &[".git/**", "**/.env", "**/.env.*"];

/// Result of redacting one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redaction {
    pub content: String,
    pub redactions: usize,
}

struct Rule {
    regex: Regex,
    replacement: String,
}

/// Masks secrets and answers ignore-file queries.
pub struct ContextRedactor {
    workspace_root: PathBuf,
    ignore_files: Vec<PathBuf>,
    rules: Vec<Rule>,
    ignore: GlobSet,
}

impl ContextRedactor {
    /// Compile configured rules followed by the built-ins.
    pub fn new(workspace_root: impl Into<PathBuf>, config: &ContextConfig) -> Result<Self, ContextError> {
        let mut rules = Vec::new();
        for rule in &config.redaction_rules {
            let regex = Regex::new(&rule.pattern).map_err(|e| {
                ConfigError::InvalidValue(format!("redaction rule {}", rule.pattern), e.to_string())
            })?;
            rules.push(Rule {
                regex,
                replacement: rule.replacement.clone(),
            });
        }
        rules.extend(builtin_rules());

        Ok(Self {
            workspace_root: workspace_root.into(),
            ignore_files: config.ignore_files.clone(),
            rules,
            ignore: build_globset(BUILTIN_IGNORES.iter().map(|s| s.to_string())),
        })
    }

    /// Read the configured ignore files (missing ones are skipped) and
    /// compile their patterns together with the built-in ignores.
    pub fn load_ignore_matchers(&mut self) -> usize {
        let mut patterns: Vec<String> = BUILTIN_IGNORES.iter().map(|s| s.to_string()).collect();
        let mut loaded = 0;
        for file in &self.ignore_files {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                self.workspace_root.join(file)
            };
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!("Failed to read ignore file {}: {}", path.display(), err);
                    continue;
                }
            };
            for line in content.lines() {
                for pattern in ignore_line_patterns(line) {
                    patterns.push(pattern);
                    loaded += 1;
                }
            }
        }
        self.ignore = build_globset(patterns.into_iter());
        loaded
    }

    /// Whether `path` (absolute or workspace-relative) matches an ignore pattern.
    pub fn should_ignore(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.workspace_root).unwrap_or(path);
        let rel = normalize_rel_path(&rel.to_string_lossy());
        let rel = rel.trim_start_matches('/');
        !rel.is_empty() && self.ignore.is_match(rel)
    }

    /// Apply every rule in order, counting substitutions.
    ///
    /// Matches that already equal their replacement are left alone and not
    /// counted, so redacting redacted text is a no-op.
    pub fn redact(&self, text: &str) -> Redaction {
        let mut content = text.to_string();
        let mut redactions = 0;
        for rule in &self.rules {
            if !rule.regex.is_match(&content) {
                continue;
            }
            let mut count = 0;
            let replaced = rule.regex.replace_all(&content, |caps: &Captures| {
                let mut expanded = String::new();
                caps.expand(&rule.replacement, &mut expanded);
                if expanded != caps[0] {
                    count += 1;
                }
                expanded
            });
            if count > 0 {
                content = replaced.into_owned();
                redactions += count;
            }
        }
        Redaction {
            content,
            redactions,
        }
    }
}

fn builtin_rules() -> Vec<Rule> {
    let table: &[(&str, &str)] = &[
        (
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
            "[REDACTED PRIVATE KEY]",
        ),
        (r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]{8,}=*", "Bearer [REDACTED]"),
        (r"\bsk-[A-Za-z0-9_\-]{16,}", "[REDACTED_API_KEY]"),
        (r"\bAKIA[0-9A-Z]{16}\b", "[REDACTED_API_KEY]"),
        (r"\bgh[pousr]_[A-Za-z0-9]{20,}", "[REDACTED_API_KEY]"),
        (
            r#"(?i)\b(api[_-]?key|secret|token|password|passwd)(\s*[:=]\s*)["']?[A-Za-z0-9\-._~+/]{8,}["']?"#,
            "${1}${2}[REDACTED]",
        ),
    ];
    table
        .iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(regex) => Some(Rule {
                regex,
                replacement: replacement.to_string(),
            }),
            Err(e) => {
                tracing::error!("Built-in redaction rule failed to compile: {}", e);
                None
            }
        })
        .collect()
}

/// Translate one gitignore-style line into glob patterns.
fn ignore_line_patterns(line: &str) -> Vec<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return Vec::new();
    }
    let (body, dir_only) = match line.strip_suffix('/') {
        Some(body) => (body, true),
        None => (line, false),
    };
    let anchored = body.starts_with('/') || body.trim_start_matches('/').contains('/');
    let body = body.trim_start_matches('/');
    if body.is_empty() {
        return Vec::new();
    }
    let base = if anchored || body.starts_with("**/") {
        body.to_string()
    } else {
        format!("**/{}", body)
    };
    if dir_only {
        vec![format!("{}/**", base)]
    } else {
        vec![base.clone(), format!("{}/**", base)]
    }
}

fn build_globset(patterns: impl Iterator<Item = String>) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match compile_glob(&pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!("Skipping invalid ignore pattern {}: {}", pattern, e),
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Failed to build ignore matcher: {}", e);
        GlobSet::empty()
    })
}

fn compile_glob(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}
