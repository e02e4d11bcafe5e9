//! `search_knowledge`
//!
//! Keyword search over the `.md` and `.txt` files of a knowledge directory.
//! Files are re-read on every search so edits show up without a restart.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chat_core::{
    error::{ChatError, Result},
    tool::{ParameterSchema, Tool, ToolContext, ToolKind, ToolOutcome, ToolSchema},
};
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Longest chunk, in characters
pub const CHUNK_MAX_CHARS: usize = 500;

/// Results returned when the model does not ask for a count
pub const DEFAULT_TOP_K: usize = 5;

const MAX_TOP_K: usize = 20;

/// Score bonus when the whole query appears in a chunk
const WHOLE_QUERY_BONUS: usize = 10;

/// One searchable piece of a knowledge file
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Path relative to the knowledge directory
    pub source: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
struct Hit<'a> {
    source: &'a str,
    text: &'a str,
    score: usize,
}

/// Knowledge directory search
#[derive(Clone, Debug)]
pub struct KnowledgeTool {
    dir: PathBuf,
}

impl KnowledgeTool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load(&self) -> Result<Vec<Chunk>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || load_chunks(&dir))
            .await
            .map_err(|e| ChatError::ToolExecution(format!("knowledge loader failed: {e}")))?
            .map_err(ChatError::from)
    }
}

#[async_trait]
impl Tool for KnowledgeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            kind: ToolKind::SearchKnowledge,
            description: "Search the local knowledge base (markdown and text notes) by keywords. \
                Use it when the answer may be in the user's own reference material."
                .into(),
            parameters: vec![
                ParameterSchema::new("query", "string", "Keywords to look for", true),
                ParameterSchema::new("top_k", "integer", "Maximum number of results (default 5)", false),
            ],
        }
    }

    async fn execute(&self, arguments: &Map<String, Value>, _ctx: &ToolContext) -> Result<ToolOutcome> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(ToolOutcome::failure("query must not be empty"));
        }
        let top_k = arguments
            .get("top_k")
            .and_then(Value::as_u64)
            .and_then(|k| usize::try_from(k).ok())
            .map_or(DEFAULT_TOP_K, |k| k.clamp(1, MAX_TOP_K));

        let chunks = self.load().await?;
        if chunks.is_empty() {
            return Ok(ToolOutcome::success(
                "the knowledge base is empty; add .md or .txt files to the knowledge directory",
            )
            .with_data(json!({"results": [], "total_chunks": 0})));
        }

        let hits = rank(&chunks, query, top_k);
        tracing::debug!(query, hits = hits.len(), total_chunks = chunks.len(), "knowledge search");
        Ok(ToolOutcome::success("ok").with_data(json!({
            "results": hits,
            "total_chunks": chunks.len(),
        })))
    }
}

/// Best `top_k` chunks by score; chunks scoring zero are dropped
fn rank<'a>(chunks: &'a [Chunk], query: &str, top_k: usize) -> Vec<Hit<'a>> {
    let query = query.to_lowercase();
    let terms: Vec<&str> = query.split_whitespace().filter(|t| t.chars().count() > 1).collect();

    let mut hits: Vec<Hit<'a>> = chunks
        .iter()
        .filter_map(|chunk| {
            let text = chunk.text.to_lowercase();
            let mut score = terms.iter().map(|t| text.matches(t).count()).sum::<usize>();
            if text.contains(&query) {
                score += WHOLE_QUERY_BONUS;
            }
            (score > 0).then_some(Hit {
                source: &chunk.source,
                text: &chunk.text,
                score,
            })
        })
        .collect();

    hits.sort_by(|a, b| b.score.cmp(&a.score));
    hits.truncate(top_k);
    hits
}

/// Read and chunk every knowledge file below `dir`
pub fn load_chunks(dir: &Path) -> anyhow::Result<Vec<Chunk>> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut chunks = Vec::new();
    for file in files {
        let Ok(bytes) = std::fs::read(&file) else {
            tracing::debug!(path = %file.display(), "skipping unreadable knowledge file");
            continue;
        };
        let source = file
            .strip_prefix(dir)
            .unwrap_or(&file)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        chunks.extend(
            chunk_text(&String::from_utf8_lossy(&bytes))
                .into_iter()
                .map(|text| Chunk {
                    source: source.clone(),
                    text,
                }),
        );
    }
    Ok(chunks)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        // Symlinked directories are not followed
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if (file_type.is_file() || (file_type.is_symlink() && path.is_file()))
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("txt"))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Split on blank lines; blocks over the limit are packed sentence by sentence
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    for block in blocks(text) {
        if block.chars().count() <= CHUNK_MAX_CHARS {
            chunks.push(block);
            continue;
        }

        let mut current = String::new();
        for piece in sentences(&block) {
            if current.chars().count() + piece.chars().count() <= CHUNK_MAX_CHARS {
                current.push_str(piece);
            } else {
                if !current.trim().is_empty() {
                    chunks.push(current.trim().to_string());
                }
                current = piece.to_string();
            }
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }
    }
    chunks
}

/// Paragraphs separated by lines that are empty or whitespace only
fn blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current.join("\n").trim().to_string());
    }
    blocks
}

/// Pieces ending after a sentence mark or newline, delimiter included
fn sentences(block: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, c) in block.char_indices() {
        if matches!(c, '.' | '。' | '\n') {
            let end = i + c.len_utf8();
            pieces.push(&block[start..end]);
            start = end;
        }
    }
    if start < block.len() {
        pieces.push(&block[start..]);
    }
    pieces
}
