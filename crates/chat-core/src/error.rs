//! Error Types

use thiserror::Error;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat error types
#[derive(Error, Debug)]
pub enum ChatError {
    /// Provider endpoint or key missing
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure, timeout, or non-2xx response from the model endpoint
    #[error("Transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// Response body did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Malformed or incomplete client request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced conversation does not exist
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Conversation store failure
    #[error("Store error: {0}")]
    Store(String),

    /// The consumer of the event stream went away
    #[error("Turn cancelled")]
    Cancelled,

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl ChatError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Whether a failed tools-attached request should be retried without tool schemas.
    ///
    /// Only transport-level rejections qualify; a malformed body or a missing
    /// endpoint would fail the same way on the retry.
    pub const fn triggers_degrade(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(_) => "The model provider is not configured.".into(),
            Self::Transport {
                status: Some(status),
                ..
            } => format!("The model service returned an error (HTTP {status})."),
            Self::Transport { status: None, .. } => {
                "The model service is currently unreachable. Please try again.".into()
            }
            Self::Protocol(msg) => format!("Unexpected response from the model service: {msg}"),
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::ConversationNotFound(_) => "Conversation not found.".into(),
            Self::Store(_) => "Failed to save the conversation.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for ChatError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_degrade() {
        assert!(ChatError::transport(Some(400), "tools not supported").triggers_degrade());
        assert!(ChatError::transport(None, "connection reset").triggers_degrade());
        assert!(!ChatError::Protocol("bad json".into()).triggers_degrade());
        assert!(!ChatError::Config("no key".into()).triggers_degrade());
    }

    #[test]
    fn test_user_message_mentions_status() {
        let err = ChatError::transport(Some(422), "bad request");
        assert_eq!(err.to_string(), "Transport error: bad request");
        assert!(err.user_message().contains("422"));
    }
}
