//! Partial Persistence
//!
//! A turn's assistant message is built in an [`OpenRound`] buffer and written
//! to the store every few events, so a client that reconnects mid-turn sees
//! near-real-time progress. The first write appends the message; later writes
//! replace it at the index it was appended to. [`TurnRecorder::finalize`]
//! performs the last rewrite and closes the slot.

use std::sync::Arc;

use crate::error::{ChatError, Result};
use crate::event::StreamEvent;
use crate::message::{Conversation, Message, Role, ToolStep};
use crate::store::ConversationStore;

/// Persist progress after this many emitted events
pub const SNAPSHOT_EVERY_EVENTS: usize = 5;

/// Assistant message under construction
#[derive(Clone, Debug, Default)]
pub struct OpenRound {
    content: String,
    tool_steps: Vec<ToolStep>,
    model_label: Option<String>,
}

impl OpenRound {
    pub fn new(model_label: Option<String>) -> Self {
        Self {
            model_label,
            ..Default::default()
        }
    }

    /// Fold one event into the buffer
    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Content(delta) => self.content.push_str(delta),
            StreamEvent::ToolCall {
                id,
                name,
                arguments,
                ..
            } => self.tool_steps.push(ToolStep::pending(id, name, arguments)),
            StreamEvent::ToolResult {
                id,
                result_summary,
                result_full,
                ..
            } => {
                if let Some(step) = self.tool_steps.iter_mut().rev().find(|s| &s.id == id) {
                    step.result_summary.clone_from(result_summary);
                    step.result_full.clone_from(result_full);
                }
            }
            StreamEvent::ConversationId(_) | StreamEvent::Error(_) => {}
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tool_steps(&self) -> &[ToolStep] {
        &self.tool_steps
    }

    pub fn to_message(&self) -> Message {
        let mut message = Message::assistant(self.content.clone()).with_tool_steps(self.tool_steps.clone());
        message.model_label.clone_from(&self.model_label);
        message
    }
}

/// Where the open assistant message lives in the stored list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    /// Nothing written yet; the next write appends
    Unwritten,
    /// Written at this index; the next write replaces it
    Open(usize),
}

/// Writes one turn's progress to the conversation store
pub struct TurnRecorder {
    store: Arc<dyn ConversationStore>,
    conversation_id: String,
    round: OpenRound,
    slot: Slot,
    pending_events: usize,
    every: usize,
}

impl TurnRecorder {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        conversation_id: impl Into<String>,
        model_label: Option<String>,
    ) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            round: OpenRound::new(model_label),
            slot: Slot::Unwritten,
            pending_events: 0,
            every: SNAPSHOT_EVERY_EVENTS,
        }
    }

    pub fn with_cadence(mut self, every: usize) -> Self {
        self.every = every.max(1);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Append the user's message before any model call
    pub async fn begin(&mut self, user: Message) -> Result<Conversation> {
        self.store
            .modify(&self.conversation_id, Box::new(move |messages: &mut Vec<Message>| messages.push(user)))
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(self.conversation_id.clone()))
    }

    /// Fold an emitted event in and write a snapshot every `every` events.
    /// Snapshot failures are logged and never end the turn.
    pub async fn observe(&mut self, event: &StreamEvent) {
        self.round.observe(event);
        self.pending_events += 1;
        if self.pending_events >= self.every {
            if let Err(e) = self.snapshot().await {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "partial snapshot failed");
            }
        }
    }

    /// Write the open message now
    pub async fn snapshot(&mut self) -> Result<()> {
        self.pending_events = 0;
        let message = self.round.to_message();
        self.write(message).await?;
        tracing::trace!(
            conversation_id = %self.conversation_id,
            steps = self.round.tool_steps.len(),
            chars = self.round.content.len(),
            "partial snapshot written"
        );
        Ok(())
    }

    /// Final rewrite with the turn's complete answer
    pub async fn finalize(mut self, content: String, tool_steps: Vec<ToolStep>) -> Result<Conversation> {
        self.round.content = content;
        self.round.tool_steps = tool_steps;
        let message = self.round.to_message();
        self.write(message).await
    }

    async fn write(&mut self, message: Message) -> Result<Conversation> {
        let slot = self.slot;
        let conversation = self
            .store
            .modify(
                &self.conversation_id,
                Box::new(move |messages: &mut Vec<Message>| match slot {
                    Slot::Open(index)
                        if messages.get(index).is_some_and(|m| m.role == Role::Assistant) =>
                    {
                        messages[index] = message;
                    }
                    _ => messages.push(message),
                }),
            )
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(self.conversation_id.clone()))?;

        if slot == Slot::Unwritten {
            self.slot = Slot::Open(conversation.messages.len().saturating_sub(1));
        }
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConversationStore;
    use crate::tool::ToolCall;

    async fn recorder(every: usize) -> (Arc<MemoryConversationStore>, TurnRecorder) {
        let store = Arc::new(MemoryConversationStore::new());
        let conversation = store.create("t", Vec::new()).await.unwrap();
        let recorder = TurnRecorder::new(store.clone(), conversation.id, Some("m".into())).with_cadence(every);
        (store, recorder)
    }

    async fn stored(store: &MemoryConversationStore, recorder: &TurnRecorder) -> Vec<Message> {
        store.get(recorder.conversation_id()).await.unwrap().unwrap().messages
    }

    #[tokio::test]
    async fn test_user_message_is_appended_immediately() {
        let (store, mut recorder) = recorder(5).await;
        recorder.begin(Message::user("what time is it")).await.unwrap();
        let messages = stored(&store, &recorder).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_snapshots_follow_cadence_and_replace_in_place() {
        let (store, mut recorder) = recorder(2).await;
        recorder.begin(Message::user("q")).await.unwrap();

        recorder.observe(&StreamEvent::Content("a".into())).await;
        assert_eq!(stored(&store, &recorder).await.len(), 1);

        recorder.observe(&StreamEvent::Content("b".into())).await;
        let messages = stored(&store, &recorder).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "ab");

        recorder.observe(&StreamEvent::Content("c".into())).await;
        recorder.observe(&StreamEvent::Content("d".into())).await;
        let messages = stored(&store, &recorder).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "abcd");
        assert_eq!(messages[1].model_label.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_tool_steps_fill_in_on_result() {
        let (store, mut recorder) = recorder(1).await;
        recorder.begin(Message::user("q")).await.unwrap();
        let call = ToolCall::new("c1", "get_current_time", "{}");

        recorder.observe(&StreamEvent::tool_call(&call)).await;
        let steps = stored(&store, &recorder).await[1].tool_steps.clone();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].result_full.is_empty());

        recorder.observe(&StreamEvent::tool_result(&call, r#"{"success":true}"#)).await;
        let steps = stored(&store, &recorder).await[1].tool_steps.clone();
        assert_eq!(steps[0].result_full, r#"{"success":true}"#);
    }

    #[tokio::test]
    async fn test_finalize_rewrites_open_slot() {
        let (store, mut recorder) = recorder(1).await;
        recorder.begin(Message::user("q")).await.unwrap();
        recorder.observe(&StreamEvent::Content("partial".into())).await;

        let conversation = recorder.finalize("complete".into(), Vec::new()).await.unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].content, "complete");
        assert_eq!(stored_len(&store).await, 2);
    }

    #[tokio::test]
    async fn test_finalize_without_snapshot_appends() {
        let (_store, mut recorder) = recorder(100).await;
        recorder.begin(Message::user("q")).await.unwrap();
        let conversation = recorder.finalize("answer".into(), Vec::new()).await.unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert!(conversation.is_first_exchange());
    }

    #[tokio::test]
    async fn test_missing_conversation_is_reported() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut recorder = TurnRecorder::new(store, "gone", None);
        let err = recorder.begin(Message::user("q")).await.unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));
    }

    async fn stored_len(store: &MemoryConversationStore) -> usize {
        let list = store.list().await.unwrap();
        list[0].message_count
    }
}
