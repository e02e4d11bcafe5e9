//! # chat-core
//!
//! Tool-calling orchestration engine with a provider-agnostic model gateway
//! and a closed, dispatch-table tool system.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ChatService                             │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │ RoundDriver │──│ ToolRegistry │──│ ModelGateway (Strategy)  │ │
//! │  └──────┬──────┘  └──────┬───────┘  └──────────────────────────┘ │
//! │         │                │ Watchdog (ModelJudge)                 │
//! │  ┌──────┴──────┐  ┌──────┴────────────┐                          │
//! │  │ EventSink   │──│ TurnRecorder      │── ConversationStore      │
//! │  └─────────────┘  └───────────────────┘                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ModelGateway` and `ConversationStore` traits keep this crate free of
//! network and disk I/O; `chat-runtime` supplies the concrete collaborators.

pub mod driver;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod recorder;
pub mod service;
pub mod store;
pub mod tool;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{RoundDriver, TurnConfig, TurnOutcome};
pub use error::{ChatError, Result};
pub use event::StreamEvent;
pub use message::{Conversation, ConversationSummary, Message, Role, ToolStep};
pub use provider::{ModelGateway, ProviderRegistry};
pub use service::{ChatService, ChatSettings, TurnReply, TurnRequest};
pub use store::ConversationStore;
pub use tool::{Tool, ToolCall, ToolContext, ToolOutcome, ToolRegistry};
pub use watchdog::{CommandProbe, Verdict, Watchdog};
