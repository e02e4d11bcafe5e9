//! Conversation Messages
//!
//! Message format shared by the round driver, the model gateway and the
//! conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// Maximum characters kept in a step's argument preview
pub const ARGUMENTS_PREVIEW_CHARS: usize = 200;

/// Maximum characters kept in a step's result summary
pub const RESULT_SUMMARY_CHARS: usize = 200;

/// Maximum characters kept in a step's full result
pub const RESULT_FULL_CHARS: usize = 8000;

/// Title used until the summarizer (or the first user message) provides one
pub const DEFAULT_TITLE: &str = "New chat";

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result fed back to the model
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One executed tool call, attached to the assistant message that closes a turn
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStep {
    /// Call id assigned by the model
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub arguments_preview: String,

    /// Empty until the matching result arrives
    #[serde(default)]
    pub result_summary: String,

    #[serde(default)]
    pub result_full: String,
}

impl ToolStep {
    /// Step for a call whose result has not arrived yet
    pub fn pending(id: impl Into<String>, name: impl Into<String>, arguments: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments_preview: truncate_text(arguments, ARGUMENTS_PREVIEW_CHARS),
            result_summary: String::new(),
            result_full: String::new(),
        }
    }

    pub fn complete(&mut self, result: &str) {
        self.result_summary = truncate_text(result, RESULT_SUMMARY_CHARS);
        self.result_full = truncate_text(result, RESULT_FULL_CHARS);
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content
    #[serde(default)]
    pub content: String,

    /// Call this message answers (tool messages only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Raw calls requested by the model. Only present on in-flight protocol
    /// messages, never on stored ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Tool calls executed during the turn this message closes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_steps: Vec<ToolStep>,

    /// Model that generated this (for assistant messages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_label: Option<String>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
            tool_steps: Vec::new(),
            model_label: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message carrying the model's tool call requests
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::assistant(content);
        msg.tool_calls = Some(calls);
        msg
    }

    /// Create a tool result message
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_tool_steps(mut self, steps: Vec<ToolStep>) -> Self {
        self.tool_steps = steps;
        self
    }

    /// Whether this is a driver-to-model protocol message that must not be stored
    pub fn is_protocol_only(&self) -> bool {
        self.role == Role::Tool || self.tool_calls.is_some()
    }
}

/// A stored conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub messages: Vec<Message>,

    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            title: title.into(),
            messages,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the stored history is exactly one user/assistant pair
    pub fn is_first_exchange(&self) -> bool {
        let mut roles = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.role);
        matches!(
            (roles.next(), roles.next(), roles.next()),
            (Some(Role::User), Some(Role::Assistant), None)
        )
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
        }
    }
}

/// Conversation listing entry (no message bodies)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Title derived from the opening user message
pub fn title_from(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        text.chars().take(50).collect()
    }
}

/// Truncate to at most `max` characters, marking the cut with `...`
pub fn truncate_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
