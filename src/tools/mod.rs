//! Tool system for the runner.
//!
//! Tools let a phase read the workspace and query the documentation index
//! while the model drives the conversation.
//!
//! ## Workspace Confinement
//!
//! Tool paths are relative to the workspace root:
//! - `src/lib.rs` resolves to `{workspace}/src/lib.rs`
//! - absolute paths and `..` escapes are refused

mod directory;
mod docdex;
mod file_ops;

pub use directory::ListDirectory;
pub use docdex::{DocdexOpen, DocdexSearch};
pub use file_ops::ReadFile;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::docdex::DocdexClient;
use crate::provider::{FunctionDefinition, ToolDefinition};

// ============================================================================
// Path Resolution
// ============================================================================

/// Resolve `path_str` under `workspace`, refusing anything that leaves it.
pub fn resolve_path(path_str: &str, workspace: &Path) -> anyhow::Result<PathBuf> {
    let path = Path::new(path_str);
    if path.is_absolute() {
        anyhow::bail!("Absolute paths are not allowed: {}", path_str);
    }
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            anyhow::bail!("Path escapes the workspace: {}", path_str);
        }
    }
    let resolved = workspace.join(path);

    // Symlinks can still point outside; compare canonical forms when the path exists.
    if let (Ok(canonical), Ok(root)) = (resolved.canonicalize(), workspace.canonicalize()) {
        if !canonical.starts_with(&root) {
            anyhow::bail!("Path escapes the workspace: {}", path_str);
        }
    }
    Ok(resolved)
}

// ============================================================================
// Tool Trait and Registry
// ============================================================================

/// What a tool handler receives besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub docdex: Option<Arc<dyn DocdexClient>>,
}

impl ToolContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            docdex: None,
        }
    }

    pub fn with_docdex(mut self, docdex: Arc<dyn DocdexClient>) -> Self {
        self.docdex = Some(docdex);
        self
    }
}

/// Handler result fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
}

impl ToolOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

type ToolFn = dyn Fn(Value) -> anyhow::Result<ToolOutput> + Send + Sync;

/// Closure-backed tool created by [`ToolRegistry::register_fn`].
struct FnTool {
    name: String,
    description: String,
    schema: Value,
    handler: Box<ToolFn>,
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        (self.handler)(args)
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: ToolContext,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in tools).
    pub fn empty(context: ToolContext) -> Self {
        Self {
            tools: HashMap::new(),
            context,
        }
    }

    /// Registry with the file tools, plus the docdex tools when a client is set.
    pub fn with_builtins(context: ToolContext) -> Self {
        let has_docdex = context.docdex.is_some();
        let mut registry = Self::empty(context);
        registry.register(Arc::new(ReadFile));
        registry.register(Arc::new(ListDirectory));
        if has_docdex {
            registry.register(Arc::new(DocdexSearch));
            registry.register(Arc::new(DocdexOpen));
        }
        tracing::debug!("Created tool registry with {} tools", registry.len());
        registry
    }

    /// Add or replace a tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn register_fn<F>(&mut self, name: &str, description: &str, schema: Value, handler: F)
    where
        F: Fn(Value) -> anyhow::Result<ToolOutput> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnTool {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            handler: Box::new(handler),
        }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the provider, sorted by name.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;
        tool.execute(args, &self.context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_path_refuses_escapes() {
        let temp = tempfile::tempdir().unwrap();
        assert!(resolve_path("src/lib.rs", temp.path()).is_ok());
        assert!(resolve_path("src/../lib.rs", temp.path()).is_ok());
        assert!(resolve_path("../outside", temp.path()).is_err());
        assert!(resolve_path("/etc/hosts", temp.path()).is_err());
    }

    #[tokio::test]
    async fn closure_tools_execute_and_unknown_fails() {
        let temp = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::empty(ToolContext::new(temp.path()));
        registry.register_fn(
            "echo",
            "Echo the text argument",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args| Ok(ToolOutput::new(args["text"].as_str().unwrap_or_default())),
        );
        let out = registry.execute("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out.output, "hi");
        let err = registry.execute("missing", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool: missing"));
    }

    #[test]
    fn builtins_depend_on_docdex() {
        let temp = tempfile::tempdir().unwrap();
        let plain = ToolRegistry::with_builtins(ToolContext::new(temp.path()));
        let names: Vec<String> = plain.schemas().into_iter().map(|d| d.function.name).collect();
        assert_eq!(names, vec!["list_directory", "read_file"]);

        let ctx = ToolContext::new(temp.path())
            .with_docdex(Arc::new(crate::test_support::FakeDocdex::default()));
        assert_eq!(ToolRegistry::with_builtins(ctx).len(), 4);
    }
}
