//! Documentation-index tools: search and open.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolOutput};
use crate::docdex::{extract_text, DocdexClient, OpenFileOptions, SearchOptions};

fn client(ctx: &ToolContext) -> anyhow::Result<&dyn DocdexClient> {
    ctx.docdex
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("Docdex is not configured"))
}

/// Ranked search over the documentation index.
pub struct DocdexSearch;

#[async_trait]
impl Tool for DocdexSearch {
    fn name(&self) -> &str {
        "docdex_search"
    }

    fn description(&self) -> &str {
        "Search the repository index. Returns matching paths with scores and snippets."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search terms"},
                "limit": {"type": "integer", "description": "Maximum hits (default: 8)"},
                "path_prefix": {"type": "string", "description": "Optional: only paths under this prefix"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?;
        let mut opts = SearchOptions::default();
        if let Some(limit) = args["limit"].as_u64() {
            opts.limit = limit as usize;
        }
        opts.path_prefix = args["path_prefix"].as_str().map(str::to_string);

        let result = client(ctx)?.search(query, &opts).await?;
        if result.hits.is_empty() {
            return Ok(ToolOutput::new(format!("No results for '{}'", query)));
        }
        let lines: Vec<String> = result
            .hits
            .iter()
            .map(|hit| match &hit.snippet {
                Some(snippet) => format!("{} ({:.2})\n  {}", hit.path, hit.score, snippet.trim()),
                None => format!("{} ({:.2})", hit.path, hit.score),
            })
            .collect();
        Ok(ToolOutput::new(lines.join("\n")))
    }
}

/// Open a file through the index.
pub struct DocdexOpen;

#[async_trait]
impl Tool for DocdexOpen {
    fn name(&self) -> &str {
        "docdex_open"
    }

    fn description(&self) -> &str {
        "Open an indexed file, optionally limited to a line range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Repository-relative path"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let opts = OpenFileOptions {
            start_line: args["start_line"].as_u64().map(|n| n as usize),
            end_line: args["end_line"].as_u64().map(|n| n as usize),
            max_bytes: None,
        };
        let payload = client(ctx)?.open_file(path, &opts).await?;
        let text = extract_text(&payload).unwrap_or_else(|| payload.to_string());
        Ok(ToolOutput::new(text))
    }
}
