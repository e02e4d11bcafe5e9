//! # chat-runtime
//!
//! Concrete collaborators for `chat-core`.
//!
//! - [`OpenAiGateway`]: OpenAI-compatible `/v1/chat/completions` client,
//!   buffered and streaming
//! - [`tools`]: the built-in tool set
//! - [`FileConversationStore`]: one JSON document per conversation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_runtime::{OpenAiGateway, FileConversationStore, tools};
//!
//! let gateway = Arc::new(OpenAiGateway::from_env()?);
//! let driver = RoundDriver::new(gateway, Arc::new(tools::default_tools("knowledge")));
//! let store = Arc::new(FileConversationStore::new("data/conversations"));
//! ```

pub mod openai;
pub mod store;
pub mod tools;

pub use openai::{OpenAiConfig, OpenAiGateway};
pub use store::FileConversationStore;

// Re-export core types for convenience
pub use chat_core::{ChatError, ModelGateway, Result, ToolRegistry};
