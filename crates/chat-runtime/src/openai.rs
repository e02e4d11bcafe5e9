//! OpenAI-compatible Gateway
//!
//! Implementation of `ModelGateway` for any endpoint that speaks the
//! `/v1/chat/completions` protocol (DeepSeek, Qwen compatible mode, vLLM,
//! llama.cpp server, ...).

use std::time::Duration;

use async_trait::async_trait;
use chat_core::{
    error::{ChatError, Result},
    message::{Message, truncate_text},
    provider::{ChatRequest, Completion, CompletionStream, FinishReason, ModelGateway, TokenUsage},
    tool::ToolCall,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value, json};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Longest error body kept in a transport error
const ERROR_BODY_CHARS: usize = 500;

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Total cap on a buffered completion
    pub timeout: Duration,

    /// Longest silence tolerated while a streamed answer is being read
    pub read_timeout: Duration,

    pub connect_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            read_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl OpenAiConfig {
    /// `CHAT_MODEL_TIMEOUT_SECS` sets both the buffered cap and the stream idle limit
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout = std::env::var("CHAT_MODEL_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .map_or(defaults.timeout, Duration::from_secs);
        Self {
            timeout,
            read_timeout: timeout,
            ..defaults
        }
    }
}

/// OpenAI-compatible chat-completion client
#[derive(Clone, Debug)]
pub struct OpenAiGateway {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiGateway {
    pub fn new() -> Result<Self> {
        Self::from_config(OpenAiConfig::default())
    }

    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiConfig::from_env())
    }

    pub const fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    /// Full completions URL for a provider base
    pub fn completions_url(api_base: &str) -> String {
        format!("{}{COMPLETIONS_PATH}", api_base.trim().trim_end_matches('/'))
    }

    fn build_body(request: &ChatRequest, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert(
            "messages".into(),
            Value::Array(request.messages.iter().map(message_to_openai).collect()),
        );
        body.insert("stream".into(), json!(stream));

        if !stream {
            if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
                body.insert("tools".into(), Value::Array(tools.clone()));
            }
        }

        if let Some(extra) = &request.extra {
            for (key, value) in extra {
                body.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        Value::Object(body)
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        if !request.endpoint.is_configured() {
            return Err(ChatError::Config("provider API base or key missing".into()));
        }

        let url = Self::completions_url(&request.endpoint.api_base);
        tracing::debug!(
            url = %url,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            stream,
            "chat completion request"
        );

        let builder = self
            .client
            .post(&url)
            .bearer_auth(&request.endpoint.api_key)
            .json(&Self::build_body(request, stream));

        // Streamed bodies are bounded per read, not in total
        let sent = if stream {
            tokio::time::timeout(self.config.read_timeout, builder.send())
                .await
                .map_err(|_| {
                    ChatError::transport(
                        None,
                        format!("no response within {}s", self.config.read_timeout.as_secs()),
                    )
                })?
        } else {
            builder.timeout(self.config.timeout).send().await
        };
        let response = sent.map_err(|e| ChatError::transport(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), model = %request.model, "chat completion rejected");
            return Err(ChatError::transport(
                Some(status.as_u16()),
                format!("HTTP {status}: {}", truncate_text(body.trim(), ERROR_BODY_CHARS)),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let response = self.post(request, false).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ChatError::transport(None, e.to_string()))?;
        parse_completion(&text)
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<CompletionStream> {
        let response = self.post(request, true).await?;
        let bytes = response.bytes_stream();
        let idle = self.config.read_timeout;

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;
            futures::pin_mut!(bytes);

            'read: loop {
                let chunk = match tokio::time::timeout(idle, bytes.next()).await {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(Some(Err(e))) => {
                        yield Err(ChatError::transport(None, e.to_string()));
                        done = true;
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(ChatError::transport(None, format!("stream idle for {}s", idle.as_secs())));
                        done = true;
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=end).collect();
                    let line = String::from_utf8_lossy(&raw);
                    match parse_sse_line(line.trim()) {
                        SseLine::Delta(text) => yield Ok(text),
                        SseLine::Done => {
                            done = true;
                            break 'read;
                        }
                        SseLine::Skip => {}
                    }
                }
            }

            // The body may end without a newline after its last line
            if !done {
                if let SseLine::Delta(text) = parse_sse_line(String::from_utf8_lossy(&buffer).trim()) {
                    yield Ok(text);
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// One decoded line of a streaming response
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Delta(String),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty())
            .map_or(SseLine::Skip, SseLine::Delta),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed stream chunk");
            SseLine::Skip
        }
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallBody>>,
}

#[derive(Deserialize)]
struct ToolCallBody {
    #[serde(default)]
    id: String,
    function: FunctionBody,
}

#[derive(Deserialize)]
struct FunctionBody {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

fn parse_completion(text: &str) -> Result<Completion> {
    let body: CompletionBody =
        serde_json::from_str(text).map_err(|e| ChatError::Protocol(format!("invalid completion body: {e}")))?;
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::Protocol("completion has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = match tc.function.arguments {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            ToolCall::new(tc.id, tc.function.name, arguments)
        })
        .collect();

    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: choice.finish_reason.as_deref().and_then(FinishReason::parse),
        usage: body.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
    })
}

/// Wire form of one message; stored-only fields are left out
fn message_to_openai(message: &Message) -> Value {
    let mut value = json!({
        "role": message.role.to_string(),
        "content": message.content,
    });

    if let Some(calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        if message.content.is_empty() {
            value["content"] = Value::Null;
        }
        value["tool_calls"] = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                })
            })
            .collect();
    }

    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}
