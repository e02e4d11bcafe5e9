//! Test doubles shared by the engine's unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value, json};

use crate::driver::TurnConfig;
use crate::error::{ChatError, Result};
use crate::message::{Conversation, ConversationSummary, Message};
use crate::provider::{ChatRequest, Completion, CompletionStream, ModelGateway, ProviderEndpoint};
use crate::store::{ConversationStore, MemoryConversationStore, MessageEdit};
use crate::tool::{Tool, ToolCall, ToolContext, ToolKind, ToolOutcome, ToolSchema};

/// One scripted gateway response
#[derive(Clone, Debug)]
pub enum Step {
    Reply(Completion),
    Chunks(Vec<&'static str>),
    Reject(u16),
    Offline,
    Malformed,
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub request: ChatRequest,
    pub streamed: bool,
}

/// Gateway that plays back a fixed script and records every request
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Step>>,
    fallback: Option<Step>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answer every call with the same step
    pub fn repeating(step: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(step),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, request: &ChatRequest, streamed: bool) -> Result<Step> {
        self.calls.lock().unwrap().push(RecordedCall {
            request: request.clone(),
            streamed,
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| ChatError::Other("script exhausted".into()))
    }
}

fn failure(step: Step) -> ChatError {
    match step {
        Step::Reject(status) => ChatError::transport(Some(status), "tools are not supported by this model"),
        Step::Malformed => ChatError::Protocol("missing choices".into()),
        _ => ChatError::transport(None, "connection refused"),
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        match self.next(request, false)? {
            Step::Reply(completion) => Ok(completion),
            Step::Chunks(parts) => Ok(Completion::text(parts.concat())),
            other => Err(failure(other)),
        }
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<CompletionStream> {
        let parts: Vec<String> = match self.next(request, true)? {
            Step::Reply(completion) => vec![completion.content],
            Step::Chunks(parts) => parts.into_iter().map(String::from).collect(),
            other => return Err(failure(other)),
        };
        Ok(futures::stream::iter(parts.into_iter().map(Ok)).boxed())
    }
}

/// Fixed-clock stand-in for `get_current_time`
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            kind: ToolKind::GetCurrentTime,
            description: "Current time".into(),
            parameters: Vec::new(),
        }
    }

    async fn execute(&self, _arguments: &Map<String, Value>, _ctx: &ToolContext) -> Result<ToolOutcome> {
        Ok(ToolOutcome::success("time retrieved").with_data(json!({"time": "10:00:00"})))
    }
}

pub fn clock_call(id: &str) -> ToolCall {
    ToolCall::new(id, "get_current_time", "{}")
}

pub fn configured() -> TurnConfig {
    TurnConfig::new(ProviderEndpoint::new("http://model.test", "sk-test"), "test-model")
}

/// Memory store that remembers every conversation state a `modify` produced
#[derive(Default)]
pub struct SnapshotStore {
    inner: MemoryConversationStore,
    history: Mutex<Vec<Conversation>>,
}

impl SnapshotStore {
    pub fn history(&self) -> Vec<Conversation> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationStore for SnapshotStore {
    async fn list(&self) -> Result<Vec<ConversationSummary>> {
        self.inner.list().await
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        self.inner.get(id).await
    }

    async fn create(&self, title: &str, messages: Vec<Message>) -> Result<Conversation> {
        self.inner.create(title, messages).await
    }

    async fn update(
        &self,
        id: &str,
        title: Option<String>,
        messages: Option<Vec<Message>>,
    ) -> Result<Option<Conversation>> {
        self.inner.update(id, title, messages).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn modify(&self, id: &str, edit: MessageEdit) -> Result<Option<Conversation>> {
        let result = self.inner.modify(id, edit).await?;
        if let Some(conversation) = &result {
            self.history.lock().unwrap().push(conversation.clone());
        }
        Ok(result)
    }
}
