//! Chat Service
//!
//! Entry point for one user turn. Resolves the provider, opens or creates the
//! conversation, persists the user message, runs the [`RoundDriver`] and
//! commits the final assistant message.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::driver::{ChannelSink, DEFAULT_MAX_ROUNDS, EVENT_CHANNEL_CAPACITY, EventSink, RoundDriver, TurnConfig};
use crate::error::{ChatError, Result};
use crate::event::StreamEvent;
use crate::message::{Conversation, Message, Role, ToolStep, title_from};
use crate::provider::{ChatRequest, ProviderRegistry};
use crate::recorder::{SNAPSHOT_EVERY_EVENTS, TurnRecorder};
use crate::store::ConversationStore;

const DEFAULT_SYSTEM_PROMPT: &str = r"You are a helpful assistant.
You can call tools to look up the current time, run shell commands, read files and search the knowledge base.
Call a tool only when it helps answer the question, then answer concisely using its result.";

const TITLE_PROMPT: &str = "Summarize the topic of this conversation as a short title of at most eight words. Reply with the title only, without quotes or punctuation at the end.";

const TITLE_MAX_CHARS: usize = 50;

/// Process-wide turn settings, copied into every [`TurnConfig`]
#[derive(Clone, Debug)]
pub struct ChatSettings {
    pub max_rounds: usize,
    pub tools_enabled: bool,
    pub safe_mode: bool,
    pub watchdog: bool,
    pub root_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub system_prompt: String,

    /// Partial persistence cadence in events
    pub snapshot_every: usize,

    /// Ask the model for a title after the first exchange
    pub summarize_titles: bool,

    /// Model the watchdog asks; `None` reuses the turn's model
    pub judge_model: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            tools_enabled: true,
            safe_mode: true,
            watchdog: true,
            root_path: PathBuf::from("."),
            scratch_dir: std::env::temp_dir().join("chat-scratch"),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            snapshot_every: SNAPSHOT_EVERY_EVENTS,
            summarize_titles: true,
            judge_model: None,
        }
    }
}

/// Body of a chat request
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub provider_id: String,

    #[serde(default)]
    pub model: String,

    /// Either the full history ending with the new user message, or just
    /// the new user message when `conversation_id` names a stored history
    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Vendor extension fields passed through to the model
    #[serde(default)]
    pub extra: Option<Map<String, Value>>,
}

/// Result of a buffered turn
#[derive(Clone, Debug, Serialize)]
pub struct TurnReply {
    pub content: String,
    pub conversation_id: String,
    pub tool_steps: Vec<ToolStep>,
}

/// Everything a turn needs once the request has been accepted
struct PreparedTurn {
    config: TurnConfig,
    conversation_id: String,
    created: bool,
    user: Message,
    context: Vec<Message>,
}

/// Orchestrates turns against the store and the provider registry
#[derive(Clone)]
pub struct ChatService {
    driver: Arc<RoundDriver>,
    store: Arc<dyn ConversationStore>,
    providers: Arc<dyn ProviderRegistry>,
    settings: Arc<ChatSettings>,
}

impl ChatService {
    pub fn new(
        driver: RoundDriver,
        store: Arc<dyn ConversationStore>,
        providers: Arc<dyn ProviderRegistry>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            driver: Arc::new(driver),
            store,
            providers,
            settings: Arc::new(settings),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn providers(&self) -> &Arc<dyn ProviderRegistry> {
        &self.providers
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// Start a streaming turn.
    ///
    /// Request errors (bad input, unknown conversation) are returned before
    /// any event is produced. Everything after that arrives on the receiver,
    /// which closes when the turn ends. Dropping the receiver cancels the turn.
    pub async fn stream_turn(&self, request: TurnRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let turn = self.prepare(request).await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let span = tracing::info_span!("turn", conversation_id = %turn.conversation_id, model = %turn.config.model);
        let service = self.clone();
        tokio::spawn(async move { service.run_stream(turn, tx).await }.instrument(span));

        Ok(rx)
    }

    /// Run a turn to completion and return the final answer
    pub async fn complete_turn(&self, request: TurnRequest) -> Result<TurnReply> {
        let turn = self.prepare(request).await?;
        let mut recorder = self.recorder(&turn);
        recorder.begin(turn.user).await?;

        let outcome = self.driver.run(&turn.config, turn.context).await?;
        let conversation = recorder
            .finalize(outcome.content.clone(), outcome.tool_steps.clone())
            .await?;
        self.summarize_title(&turn.config, conversation);

        Ok(TurnReply {
            content: outcome.content,
            conversation_id: turn.conversation_id,
            tool_steps: outcome.tool_steps,
        })
    }

    async fn run_stream(self, turn: PreparedTurn, tx: mpsc::Sender<StreamEvent>) {
        let mut sink = ChannelSink::new(tx);
        if turn.created
            && sink
                .emit(StreamEvent::ConversationId(turn.conversation_id.clone()))
                .await
                .is_err()
        {
            tracing::debug!("client left before the turn started");
            return;
        }

        let mut recorder = self.recorder(&turn);
        if let Err(e) = recorder.begin(turn.user).await {
            tracing::error!(error = %e, "failed to persist user message");
            let _ = sink.emit(StreamEvent::Error(e.user_message())).await;
            return;
        }
        sink.attach(recorder);

        let result = self.driver.drive(&turn.config, turn.context, &mut sink).await;
        let recorder = sink.take_recorder();

        match (result, recorder) {
            (Ok(outcome), Some(recorder)) => {
                match recorder.finalize(outcome.content, outcome.tool_steps).await {
                    Ok(conversation) => {
                        tracing::info!(rounds = outcome.rounds, degraded = outcome.degraded, "turn completed");
                        self.summarize_title(&turn.config, conversation);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to persist final answer");
                        let _ = sink.emit(StreamEvent::Error(e.user_message())).await;
                    }
                }
            }
            (Ok(_), None) => {}
            (Err(e), _) if e.is_cancelled() => {
                tracing::info!("client disconnected, turn abandoned");
            }
            (Err(e), recorder) => {
                tracing::error!(error = %e, "turn failed");
                if let Some(mut recorder) = recorder {
                    if let Err(snapshot_err) = recorder.snapshot().await {
                        tracing::warn!(error = %snapshot_err, "failed to persist partial answer");
                    }
                }
                let _ = sink.emit(StreamEvent::Error(e.user_message())).await;
            }
        }
    }

    async fn prepare(&self, request: TurnRequest) -> Result<PreparedTurn> {
        let user = Self::validate(&request)?;

        let (conversation, created) = match request.conversation_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                let conversation = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
                (conversation, false)
            }
            _ => (self.store.create(&title_from(&user.content), Vec::new()).await?, true),
        };

        let context = self.build_context(&request, &conversation, &user);
        let config = self.turn_config(&request);

        Ok(PreparedTurn {
            config,
            conversation_id: conversation.id,
            created,
            user,
            context,
        })
    }

    fn validate(request: &TurnRequest) -> Result<Message> {
        if request.provider_id.trim().is_empty() || request.model.trim().is_empty() || request.messages.is_empty() {
            return Err(ChatError::InvalidRequest(
                "provider_id, model and messages are required".into(),
            ));
        }
        request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| Message::user(m.content.clone()))
            .ok_or_else(|| ChatError::InvalidRequest("messages must contain a user message".into()))
    }

    /// Message context for the first round
    fn build_context(&self, request: &TurnRequest, stored: &Conversation, user: &Message) -> Vec<Message> {
        let mut context: Vec<Message> = if request.messages.len() == 1 {
            stored
                .messages
                .iter()
                .filter(|m| !m.is_protocol_only())
                .cloned()
                .chain(std::iter::once(user.clone()))
                .collect()
        } else {
            request.messages.clone()
        };

        if context.first().map(|m| m.role) != Some(Role::System) {
            context.insert(0, Message::system(self.settings.system_prompt.clone()));
        }
        context
    }

    fn turn_config(&self, request: &TurnRequest) -> TurnConfig {
        let endpoint = self.providers.lookup(&request.provider_id).unwrap_or_default();
        TurnConfig::new(endpoint, request.model.trim())
            .with_max_rounds(self.settings.max_rounds)
            .with_tools(self.settings.tools_enabled)
            .with_safe_mode(self.settings.safe_mode)
            .with_paths(self.settings.root_path.clone(), self.settings.scratch_dir.clone())
            .with_watchdog(self.settings.watchdog)
            .with_judge_model(self.settings.judge_model.clone())
            .with_extra(request.extra.clone())
    }

    fn recorder(&self, turn: &PreparedTurn) -> TurnRecorder {
        TurnRecorder::new(
            self.store.clone(),
            turn.conversation_id.clone(),
            Some(turn.config.model.clone()),
        )
        .with_cadence(self.settings.snapshot_every)
    }

    /// Replace the title once, after the first user/assistant exchange
    fn summarize_title(&self, config: &TurnConfig, conversation: Conversation) {
        if !self.settings.summarize_titles || !conversation.is_first_exchange() || !config.endpoint.is_configured() {
            return;
        }

        let transcript: String = conversation
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();
        let mut extra = Map::new();
        extra.insert("max_tokens".into(), json!(24));
        extra.insert("temperature".into(), json!(0));
        let request = ChatRequest::new(
            config.endpoint.clone(),
            config.model.clone(),
            vec![Message::system(TITLE_PROMPT), Message::user(transcript)],
        )
        .with_extra(Some(extra));

        let gateway = self.driver.gateway().clone();
        let store = self.store.clone();
        let id = conversation.id;
        tokio::spawn(async move {
            let title = match gateway.complete(&request).await {
                Ok(completion) => clean_title(&completion.content),
                Err(e) => {
                    tracing::debug!(conversation_id = %id, error = %e, "title summarization failed");
                    return;
                }
            };
            if title.is_empty() {
                return;
            }
            match store.update(&id, Some(title), None).await {
                Ok(Some(_)) => tracing::debug!(conversation_id = %id, "title updated"),
                Ok(None) => {}
                Err(e) => tracing::warn!(conversation_id = %id, error = %e, "failed to store title"),
            }
        });
    }
}

/// First line of a model-written title, unquoted and bounded
fn clean_title(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let unquoted = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '“' | '”' | '「' | '」'))
        .trim_end_matches(['.', '。'])
        .trim();
    unquoted.chars().take(TITLE_MAX_CHARS).collect()
}
