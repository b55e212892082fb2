//! Validation runner for plan verification steps.
//!
//! A step is either a docdex hook directive (`docdex:hooks:a.rs,b.rs` or
//! `hooks:a.rs`) or a shell command. Every step runs; failures are collected
//! rather than aborting the batch.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::ValidationConfig;
use crate::docdex::DocdexClient;
use crate::util::split_list;

/// Lines buffered between the subprocess readers and the collector.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStep {
    DocdexHooks(Vec<String>),
    Shell(String),
}

impl ValidationStep {
    pub fn parse(step: &str) -> Self {
        let trimmed = step.trim();
        for prefix in ["docdex:hooks:", "hooks:"] {
            let matches = trimmed
                .get(..prefix.len())
                .map(|head| head.eq_ignore_ascii_case(prefix))
                .unwrap_or(false);
            if matches {
                return ValidationStep::DocdexHooks(split_list(&trimmed[prefix.len()..]));
            }
        }
        ValidationStep::Shell(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
}

pub struct ValidationRunner {
    workspace_root: PathBuf,
    config: ValidationConfig,
    docdex: Option<Arc<dyn DocdexClient>>,
}

impl ValidationRunner {
    pub fn new(workspace_root: impl Into<PathBuf>, config: ValidationConfig) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            config,
            docdex: None,
        }
    }

    pub fn with_docdex(mut self, docdex: Arc<dyn DocdexClient>) -> Self {
        self.docdex = Some(docdex);
        self
    }

    /// Run every step in order. `ok` is true only when no step failed.
    pub async fn run(&self, steps: &[String]) -> ValidationReport {
        let mut errors = Vec::new();
        for step in steps.iter().filter(|s| !s.trim().is_empty()) {
            let result = match ValidationStep::parse(step) {
                ValidationStep::DocdexHooks(files) => self.run_hooks(&files).await,
                ValidationStep::Shell(command) => self.run_shell(&command).await,
            };
            if let Err(e) = result {
                tracing::debug!("Validation step failed: {}", e);
                errors.push(e);
            }
        }
        ValidationReport {
            ok: errors.is_empty(),
            errors,
        }
    }

    async fn run_hooks(&self, files: &[String]) -> Result<(), String> {
        let docdex = self
            .docdex
            .as_ref()
            .ok_or_else(|| "docdex hooks unavailable: no docdex client configured".to_string())?;
        docdex
            .hooks_validate(files)
            .await
            .map_err(|e| format!("docdex hooks failed for [{}]: {}", files.join(", "), e))
    }

    async fn run_shell(&self, command: &str) -> Result<(), String> {
        if !self.config.allow_shell {
            return Err(format!("shell validation disabled: {}", command));
        }
        let words = split_command(command);
        let Some((program, args)) = words.split_first() else {
            return Err("empty validation command".to_string());
        };
        if !self.config.shell_allowlist.iter().any(|allowed| allowed == program) {
            return Err(format!("shell command not allowed: {}", program));
        }

        tracing::info!("Running validation step in {:?}: {}", self.workspace_root, command);
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", command, e))?;

        let (tx, rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);
        let collector = tokio::spawn(collect_tail(rx, self.config.output_limit_bytes));

        let waited = match self.config.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    let _ = child.kill().await;
                    collector.abort();
                    return Err(format!(
                        "command timed out after {}s: {}",
                        limit.as_secs_f64(),
                        command
                    ));
                }
            },
            None => child.wait().await,
        };
        let status = waited.map_err(|e| format!("failed to wait for {}: {}", command, e))?;
        let output = collector.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        if output.is_empty() {
            Err(format!("command failed (exit {}): {}", code, command))
        } else {
            Err(format!("command failed (exit {}): {}\n{}", code, command, output))
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(format!("[output read error: {}]", e)).await;
                break;
            }
        }
    }
}

/// Keep the last `limit` bytes worth of lines.
async fn collect_tail(mut rx: mpsc::Receiver<String>, limit: usize) -> String {
    let mut lines: VecDeque<String> = VecDeque::new();
    let mut bytes = 0usize;
    while let Some(line) = rx.recv().await {
        bytes += line.len() + 1;
        lines.push_back(line);
        while bytes > limit && lines.len() > 1 {
            if let Some(dropped) = lines.pop_front() {
                bytes -= dropped.len() + 1;
            }
        }
    }
    lines.into_iter().collect::<Vec<_>>().join("\n")
}

/// Split a command line on whitespace, honoring single and double quotes.
fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
