//! File reading tool.
//!
//! Paths are workspace-relative: `src/main.rs` reads `{workspace}/src/main.rs`.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, Tool, ToolContext, ToolOutput};

/// Read the contents of a workspace file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a workspace file with line numbers. Use relative paths like 'src/main.rs'. Optionally pass start_line/end_line."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative file path (e.g., 'src/lib.rs')"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;

        let resolved = resolve_path(path, &ctx.workspace_root)?;
        if !resolved.is_file() {
            anyhow::bail!("File not found: {}", path);
        }

        let bytes = tokio::fs::read(&resolved).await?;
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(ToolOutput::new(format!(
                "Binary file detected: {}. Cannot display binary content.",
                path
            )));
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start_line = args["start_line"].as_u64().map(|n| n as usize);
        let end_line = args["end_line"].as_u64().map(|n| n as usize);

        let start = start_line.unwrap_or(1).saturating_sub(1).min(total_lines);
        let end = end_line.unwrap_or(total_lines).min(total_lines);
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        if start_line.is_some() && start >= total_lines {
            return Ok(ToolOutput::new(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total_lines,
                start + 1
            )));
        }

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect();
        Ok(ToolOutput::new(numbered.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_line_ranges() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let ctx = ToolContext::new(temp.path());

        let all = ReadFile.execute(json!({"path": "a.txt"}), &ctx).await.unwrap();
        assert_eq!(all.output, "   1| one\n   2| two\n   3| three");

        let range = ReadFile
            .execute(json!({"path": "a.txt", "start_line": 2, "end_line": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(range.output, "   2| two");

        let past = ReadFile
            .execute(json!({"path": "a.txt", "start_line": 9}), &ctx)
            .await
            .unwrap();
        assert!(past.output.contains("beyond end of file"));
    }

    #[tokio::test]
    async fn refuses_missing_and_escaping_paths() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(temp.path());
        assert!(ReadFile.execute(json!({"path": "nope.txt"}), &ctx).await.is_err());
        assert!(ReadFile.execute(json!({"path": "../x"}), &ctx).await.is_err());
        assert!(ReadFile.execute(json!({}), &ctx).await.is_err());
    }
}
