//! Built-in tools
//!
//! One type per [`ToolKind`](chat_core::tool::ToolKind) variant.

pub mod datetime;
pub mod file;
pub mod knowledge;
pub mod shell;

use std::path::PathBuf;

use chat_core::tool::ToolRegistry;

pub use datetime::DateTimeTool;
pub use file::ReadFileTool;
pub use knowledge::KnowledgeTool;
pub use shell::ShellTool;

/// Registry holding every built-in tool
pub fn default_tools(knowledge_dir: impl Into<PathBuf>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(DateTimeTool::new());
    registry.register(ShellTool::new());
    registry.register(ReadFileTool::new());
    registry.register(KnowledgeTool::new(knowledge_dir));
    registry
}
