//! `read_file`

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chat_core::{
    error::Result,
    message::truncate_text,
    tool::{ParameterSchema, Tool, ToolContext, ToolKind, ToolOutcome, ToolSchema},
};
use serde_json::{Map, Value, json};
use tokio::io::AsyncReadExt;

/// Characters of file content returned to the model
pub const MAX_CONTENT_CHARS: usize = 20_000;

/// Bytes read from disk; enough for `MAX_CONTENT_CHARS` of 4-byte UTF-8
const READ_LIMIT_BYTES: u64 = 4 * 20_000 + 4;

/// Read a text file below the context's root path
#[derive(Clone, Debug, Default)]
pub struct ReadFileTool;

impl ReadFileTool {
    pub const fn new() -> Self {
        Self
    }

    /// Resolve `requested` under `root`, refusing anything that escapes it
    async fn resolve(root: &Path, requested: &str) -> std::result::Result<PathBuf, String> {
        let relative = Path::new(requested);
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err("path must not contain '..'".into());
        }

        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| format!("root path unavailable: {e}"))?;
        let joined = if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            root.join(relative)
        };
        let resolved = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|_| format!("file not found: {requested}"))?;

        if resolved.starts_with(&root) {
            Ok(resolved)
        } else {
            Err(format!("path is outside the allowed root: {requested}"))
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            kind: ToolKind::ReadFile,
            description: "Read a UTF-8 text file. Paths are relative to the workspace root.".into(),
            parameters: vec![ParameterSchema::new("path", "string", "File path relative to the root", true)],
        }
    }

    async fn execute(&self, arguments: &Map<String, Value>, ctx: &ToolContext) -> Result<ToolOutcome> {
        let requested = arguments
            .get("path")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if requested.is_empty() {
            return Ok(ToolOutcome::failure("path must not be empty"));
        }

        let path = match Self::resolve(&ctx.root_path, requested).await {
            Ok(path) => path,
            Err(reason) => return Ok(ToolOutcome::failure(reason)),
        };
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Ok(ToolOutcome::failure(format!("not a regular file: {requested}")));
        }

        let mut bytes = Vec::new();
        tokio::fs::File::open(&path)
            .await?
            .take(READ_LIMIT_BYTES)
            .read_to_end(&mut bytes)
            .await?;
        let text = String::from_utf8_lossy(&bytes);
        let total_chars = text.chars().count();

        Ok(ToolOutcome::success("ok").with_data(json!({
            "path": requested,
            "size": metadata.len(),
            "truncated": total_chars > MAX_CONTENT_CHARS || metadata.len() > bytes.len() as u64,
            "content": truncate_text(&text, MAX_CONTENT_CHARS),
        })))
    }
}
