//! Directory listing tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{resolve_path, Tool, ToolContext, ToolOutput};

/// Entries beyond this are elided.
const MAX_ENTRIES: usize = 500;

/// List contents of a workspace directory as an indented tree.
pub struct ListDirectory;

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories. Use '.' for the workspace root or relative paths like 'src/'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative directory ('.' for the root)"
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum depth to traverse (default: 2)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = args["path"].as_str().unwrap_or(".");
        let max_depth = args["max_depth"].as_u64().unwrap_or(2) as usize;

        let full_path = resolve_path(path, &ctx.workspace_root)?;
        if !full_path.is_dir() {
            anyhow::bail!("Not a directory: {}", path);
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(&full_path)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");

        for entry in walker.filter_map(|e| e.ok()) {
            let relative = entry.path().strip_prefix(&full_path).unwrap_or(entry.path());
            if relative.as_os_str().is_empty() {
                continue;
            }
            if entries.len() >= MAX_ENTRIES {
                entries.push(format!("... (truncated at {} entries)", MAX_ENTRIES));
                break;
            }
            let prefix = "  ".repeat(entry.depth().saturating_sub(1));
            let name = entry.file_name().to_string_lossy();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{}{}{}", prefix, name, suffix));
        }

        if entries.is_empty() {
            Ok(ToolOutput::new("Directory is empty"))
        } else {
            Ok(ToolOutput::new(entries.join("\n")))
        }
    }
}
