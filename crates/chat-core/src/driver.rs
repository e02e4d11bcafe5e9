//! Round Driver
//!
//! Drives one user turn: alternates model calls and tool executions until the
//! model answers without tool calls or the round budget runs out.
//!
//! ```text
//!  INIT ─▶ AWAIT_MODEL ──no tool calls──▶ DONE
//!              │  ▲ │
//!              │  │ └──transport failure with tools──▶ DEGRADE_RETRY ─┐
//!              │  └───────────────────────────────────────────────────┘
//!              └──tool calls──▶ EXECUTE_TOOLS ──▶ AWAIT_MODEL
//!                                     │
//!                               budget reached ──▶ DONE (exhausted)
//! ```
//!
//! Progress goes to an [`EventSink`]. The streaming variant uses a
//! [`ChannelSink`]; the buffered variant discards events and only returns
//! the [`TurnOutcome`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::event::StreamEvent;
use crate::message::{Message, ToolStep};
use crate::provider::{ChatRequest, Completion, ModelGateway, ProviderEndpoint};
use crate::recorder::TurnRecorder;
use crate::tool::{ToolCall, ToolContext, ToolRegistry};
use crate::watchdog::ModelJudge;

/// Default round budget per turn
pub const DEFAULT_MAX_ROUNDS: usize = 8;

/// Bound on events buffered between the driver and the transport
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Answer given instead of calling an unconfigured provider
pub const UNCONFIGURED_ANSWER: &str = "Please configure the API base and key for this provider first.";

/// Immutable configuration snapshot for one turn
#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub endpoint: ProviderEndpoint,
    pub model: String,
    pub max_rounds: usize,

    /// Attach tool schemas to model calls
    pub tools_enabled: bool,

    pub safe_mode: bool,
    pub root_path: PathBuf,
    pub scratch_dir: PathBuf,

    /// Give long-running tools a model-backed watchdog
    pub watchdog: bool,

    /// Model used by the watchdog; defaults to the turn's model
    pub judge_model: Option<String>,

    /// Vendor extension fields sent with every model call
    pub extra: Option<Map<String, Value>>,
}

impl TurnConfig {
    pub fn new(endpoint: ProviderEndpoint, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            tools_enabled: true,
            safe_mode: true,
            root_path: PathBuf::from("."),
            scratch_dir: std::env::temp_dir().join("chat-scratch"),
            watchdog: false,
            judge_model: None,
            extra: None,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub const fn with_tools(mut self, enabled: bool) -> Self {
        self.tools_enabled = enabled;
        self
    }

    pub const fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_paths(mut self, root_path: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        self.root_path = root_path.into();
        self.scratch_dir = scratch_dir.into();
        self
    }

    pub const fn with_watchdog(mut self, enabled: bool) -> Self {
        self.watchdog = enabled;
        self
    }

    pub fn with_judge_model(mut self, model: Option<String>) -> Self {
        self.judge_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_extra(mut self, extra: Option<Map<String, Value>>) -> Self {
        self.extra = extra;
        self
    }
}

/// Transient per-turn state; never persisted
#[derive(Clone, Debug)]
pub struct RoundState {
    round_index: usize,
    message_context: Vec<Message>,
    tools_enabled: bool,
    degraded: bool,
}

impl RoundState {
    pub const fn new(message_context: Vec<Message>, tools_enabled: bool) -> Self {
        Self {
            round_index: 0,
            message_context,
            tools_enabled,
            degraded: false,
        }
    }

    pub const fn round_index(&self) -> usize {
        self.round_index
    }

    pub fn message_context(&self) -> &[Message] {
        &self.message_context
    }

    pub const fn tools_enabled(&self) -> bool {
        self.tools_enabled
    }

    pub const fn degraded(&self) -> bool {
        self.degraded
    }

    /// Stop attaching tool schemas for the rest of the turn. There is no way back.
    pub fn degrade(&mut self) {
        self.tools_enabled = false;
        self.degraded = true;
    }

    fn push(&mut self, message: Message) {
        self.message_context.push(message);
    }
}

/// Result of a completed turn
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnOutcome {
    pub content: String,
    pub tool_steps: Vec<ToolStep>,

    /// Model calls made, excluding the degrade retry
    pub rounds: usize,

    pub degraded: bool,

    /// The budget ran out while the model was still asking for tools
    pub exhausted: bool,
}

/// Destination of a turn's progress events
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event. Fails with [`ChatError::Cancelled`] once the
    /// consumer is gone.
    async fn emit(&mut self, event: StreamEvent) -> Result<()>;

    fn is_cancelled(&self) -> bool {
        false
    }

    /// Whether tool-free rounds should be streamed delta by delta
    fn streams_content(&self) -> bool {
        false
    }
}

/// Sink for the buffered variant
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&mut self, _event: StreamEvent) -> Result<()> {
        Ok(())
    }
}

/// Bounded channel towards the transport, with optional partial persistence
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
    recorder: Option<TurnRecorder>,
}

impl ChannelSink {
    pub const fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx, recorder: None }
    }

    /// Record every later event into the conversation store
    pub fn attach(&mut self, recorder: TurnRecorder) {
        self.recorder = Some(recorder);
    }

    pub fn take_recorder(&mut self) -> Option<TurnRecorder> {
        self.recorder.take()
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: StreamEvent) -> Result<()> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.observe(&event).await;
        }
        self.tx.send(event).await.map_err(|_| ChatError::Cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    fn streams_content(&self) -> bool {
        true
    }
}

/// The multi-round tool-calling state machine
pub struct RoundDriver {
    gateway: Arc<dyn ModelGateway>,
    tools: Arc<ToolRegistry>,
}

impl RoundDriver {
    pub const fn new(gateway: Arc<dyn ModelGateway>, tools: Arc<ToolRegistry>) -> Self {
        Self { gateway, tools }
    }

    pub const fn gateway(&self) -> &Arc<dyn ModelGateway> {
        &self.gateway
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run a turn to completion and return only the outcome
    pub async fn run(&self, config: &TurnConfig, messages: Vec<Message>) -> Result<TurnOutcome> {
        self.drive(config, messages, &mut NullSink).await
    }

    /// Run a turn, reporting progress to `sink`
    pub async fn drive(
        &self,
        config: &TurnConfig,
        messages: Vec<Message>,
        sink: &mut dyn EventSink,
    ) -> Result<TurnOutcome> {
        if !config.endpoint.is_configured() {
            tracing::warn!(model = %config.model, "provider endpoint not configured, answering with placeholder");
            sink.emit(StreamEvent::Content(UNCONFIGURED_ANSWER.into())).await?;
            return Ok(TurnOutcome {
                content: UNCONFIGURED_ANSWER.into(),
                ..Default::default()
            });
        }

        let schemas = if config.tools_enabled {
            self.tools.openai_tools()
        } else {
            Vec::new()
        };
        let ctx = self.tool_context(config);
        let mut state = RoundState::new(messages, !schemas.is_empty());
        let mut steps = Vec::new();
        let mut last_content = String::new();

        while state.round_index < config.max_rounds {
            state.round_index += 1;
            if sink.is_cancelled() {
                return Err(ChatError::Cancelled);
            }

            let (completion, streamed) = self.call_model(config, &mut state, &schemas, sink).await?;

            if !completion.has_tool_calls() {
                if !streamed && !completion.content.is_empty() {
                    sink.emit(StreamEvent::Content(completion.content.clone())).await?;
                }
                tracing::debug!(
                    rounds = state.round_index,
                    degraded = state.degraded,
                    steps = steps.len(),
                    "turn finished"
                );
                return Ok(TurnOutcome {
                    content: completion.content,
                    tool_steps: steps,
                    rounds: state.round_index,
                    degraded: state.degraded,
                    exhausted: false,
                });
            }

            last_content.clone_from(&completion.content);
            if state.round_index >= config.max_rounds {
                tracing::warn!(
                    max_rounds = config.max_rounds,
                    dropped_calls = completion.tool_calls.len(),
                    "round budget exhausted with tool calls pending"
                );
                break;
            }

            let calls = with_call_ids(completion.tool_calls);
            state.push(Message::assistant_with_calls(completion.content, calls.clone()));

            for call in &calls {
                sink.emit(StreamEvent::tool_call(call)).await?;
                if sink.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }

                tracing::info!(round = state.round_index, tool = %call.name, call_id = %call.id, "executing tool");
                let result = self.tools.execute(call, &ctx).await;

                let mut step = ToolStep::pending(&call.id, &call.name, &call.arguments);
                step.complete(&result);
                steps.push(step);

                sink.emit(StreamEvent::tool_result(call, &result)).await?;
                state.push(Message::tool(result, &call.id));
            }
        }

        if !last_content.is_empty() {
            sink.emit(StreamEvent::Content(last_content.clone())).await?;
        }
        Ok(TurnOutcome {
            content: last_content,
            tool_steps: steps,
            rounds: state.round_index,
            degraded: state.degraded,
            exhausted: true,
        })
    }

    /// One round's model call, including the single degrade retry.
    ///
    /// Returns the completion and whether its content was already emitted.
    async fn call_model(
        &self,
        config: &TurnConfig,
        state: &mut RoundState,
        schemas: &[Value],
        sink: &mut dyn EventSink,
    ) -> Result<(Completion, bool)> {
        if state.tools_enabled {
            let request = Self::request(config, state).with_tools(schemas.to_vec());
            match self.gateway.complete(&request).await {
                Ok(completion) => return Ok((completion, false)),
                Err(e) if e.triggers_degrade() => {
                    tracing::warn!(
                        round = state.round_index,
                        model = %config.model,
                        error = %e,
                        "request with tools rejected, retrying without tools"
                    );
                    state.degrade();
                }
                Err(e) => return Err(e),
            }
        }

        let request = Self::request(config, state);
        if !sink.streams_content() {
            let mut completion = self.gateway.complete(&request).await?;
            completion.tool_calls.clear();
            return Ok((completion, false));
        }

        let mut deltas = self.gateway.complete_stream(&request).await?;
        let mut content = String::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            if delta.is_empty() {
                continue;
            }
            content.push_str(&delta);
            sink.emit(StreamEvent::Content(delta)).await?;
        }
        Ok((Completion::text(content), true))
    }

    fn request(config: &TurnConfig, state: &RoundState) -> ChatRequest {
        ChatRequest::new(config.endpoint.clone(), config.model.clone(), state.message_context.clone())
            .with_extra(config.extra.clone())
    }

    fn tool_context(&self, config: &TurnConfig) -> ToolContext {
        let ctx = ToolContext::new(config.root_path.clone(), config.scratch_dir.clone())
            .with_safe_mode(config.safe_mode);
        if !config.watchdog {
            return ctx;
        }

        let judge_model = config.judge_model.clone().unwrap_or_else(|| config.model.clone());
        let judge = ModelJudge::new(self.gateway.clone(), config.endpoint.clone(), judge_model);
        ctx.with_watchdog(Arc::new(judge))
    }
}

/// Give every call an id so its `tool_call`/`tool_result` events pair up
fn with_call_ids(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.trim().is_empty() {
                call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
            call
        })
        .collect()
}
