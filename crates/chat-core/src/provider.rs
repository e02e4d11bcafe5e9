//! Model Gateway Strategy Pattern
//!
//! Defines the interface to an OpenAI-compatible chat-completion endpoint and
//! the read-only registry that maps a provider id to its endpoint.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chat_core::provider::{ChatRequest, ModelGateway};
//!
//! let gateway = OpenAiGateway::new();
//! let completion = gateway.complete(&request).await?;
//! if completion.has_tool_calls() {
//!     // execute and continue the round
//! }
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::message::Message;
use crate::tool::ToolCall;

/// Where and how to reach a provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub api_base: String,
    pub api_key: String,
}

impl ProviderEndpoint {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
        }
    }

    /// Both the base URL and the key are present
    pub fn is_configured(&self) -> bool {
        !self.api_base.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

/// One chat-completion request
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub endpoint: ProviderEndpoint,

    /// Model identifier (e.g., "deepseek-chat", "qwen-turbo")
    pub model: String,

    pub messages: Vec<Message>,

    /// OpenAI `tools` array. Ignored by streaming calls.
    pub tools: Option<Vec<Value>>,

    /// Vendor extension fields merged into the request body
    pub extra: Option<Map<String, Value>>,
}

impl ChatRequest {
    pub fn new(endpoint: ProviderEndpoint, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            messages,
            tools: None,
            extra: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_extra(mut self, extra: Option<Map<String, Value>>) -> Self {
        self.extra = extra;
        self
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Response from a synchronous completion
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Completion {
    /// The generated text (may be empty when only tool calls were returned)
    pub content: String,

    /// Calls the model wants executed, in the order given
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Finish reason
    pub finish_reason: Option<FinishReason>,

    /// Token usage statistics (if available)
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            finish_reason: Some(FinishReason::ToolCalls),
            usage: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "length" => Some(Self::Length),
            "tool_calls" | "function_call" => Some(Self::ToolCalls),
            "content_filter" => Some(Self::ContentFilter),
            _ => None,
        }
    }
}

/// Lazily produced content deltas; ends at the provider's end marker
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Strategy trait for model endpoints
///
/// The round driver works exclusively through this interface.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Generate a completion, optionally with tool schemas attached
    async fn complete(&self, request: &ChatRequest) -> Result<Completion>;

    /// Generate a streaming completion (no tool schemas)
    async fn complete_stream(&self, request: &ChatRequest) -> Result<CompletionStream>;
}

/// A configured provider as stored in the provider file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub api_base: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub models: Vec<String>,
}

impl ProviderConfig {
    pub fn endpoint(&self) -> ProviderEndpoint {
        ProviderEndpoint::new(self.api_base.trim(), self.api_key.trim())
    }

    /// Public view (no key)
    pub fn info(&self) -> ProviderInfo {
        let models: Vec<String> = self
            .models
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        ProviderInfo {
            id: self.id.clone(),
            name: if self.name.trim().is_empty() {
                self.id.clone()
            } else {
                self.name.trim().to_string()
            },
            models: if models.is_empty() {
                vec!["default".into()]
            } else {
                models
            },
        }
    }
}

/// Provider metadata safe to show to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
}

/// Read-only lookup from provider id to endpoint
pub trait ProviderRegistry: Send + Sync {
    fn lookup(&self, provider_id: &str) -> Option<ProviderEndpoint>;

    fn providers(&self) -> Vec<ProviderInfo>;
}

/// Registry over a fixed provider list
#[derive(Clone, Debug, Default)]
pub struct StaticProviderRegistry {
    providers: Vec<ProviderConfig>,
}

impl StaticProviderRegistry {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .filter(|p| !p.id.trim().is_empty())
                .collect(),
        }
    }

    /// Providers used when no provider file exists
    pub fn builtin() -> Self {
        Self::new(vec![
            ProviderConfig {
                id: "qwen".into(),
                name: "Qwen".into(),
                api_base: String::new(),
                api_key: String::new(),
                models: vec!["qwen-turbo".into()],
            },
            ProviderConfig {
                id: "deepseek".into(),
                name: "DeepSeek".into(),
                api_base: "https://api.deepseek.com".into(),
                api_key: String::new(),
                models: vec!["deepseek-chat".into()],
            },
        ])
    }
}

impl ProviderRegistry for StaticProviderRegistry {
    fn lookup(&self, provider_id: &str) -> Option<ProviderEndpoint> {
        self.providers
            .iter()
            .find(|p| p.id == provider_id)
            .map(ProviderConfig::endpoint)
    }

    fn providers(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(ProviderConfig::info).collect()
    }
}
