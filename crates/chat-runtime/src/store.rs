//! File-backed conversation store
//!
//! One pretty-printed JSON document per conversation, `<id>.json` in a single
//! directory. Writes go through a temp file and a rename so readers never see
//! a half-written document, and writes to the same id are serialized by
//! [`WriteLocks`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chat_core::{
    error::{ChatError, Result},
    message::{Conversation, ConversationSummary, Message},
    store::{ConversationStore, MessageEdit, WriteLocks},
};
use tokio::io::AsyncWriteExt;
use tokio_stream::{StreamExt, wrappers::ReadDirStream};

pub struct FileConversationStore {
    base_path: PathBuf,
    locks: WriteLocks,
}

impl FileConversationStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            locks: WriteLocks::new(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.base_path.join(format!("{id}.json")))
    }

    async fn load(&self, id: &str) -> Result<Option<Conversation>> {
        let path = self.conversation_path(id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ChatError::Store(format!("corrupt conversation {id}: {e}")))
    }

    async fn save(&self, conversation: &Conversation) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.conversation_path(&conversation.id)?;
        let content = serde_json::to_string_pretty(conversation)?;

        let tmp_path = self.base_path.join(format!(
            ".{}.{}.tmp",
            conversation.id,
            uuid::Uuid::new_v4().simple()
        ));

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            match tokio::fs::rename(&tmp_path, &path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tokio::fs::remove_file(&path).await?;
                    tokio::fs::rename(&tmp_path, &path).await?;
                }
                Err(e) => return Err(e),
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Reject ids that could name a file outside the store directory
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ChatError::InvalidRequest("conversation id cannot be empty".into()));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.chars().any(char::is_control) {
        return Err(ChatError::InvalidRequest(format!(
            "conversation id contains invalid characters: {id:?}"
        )));
    }
    Ok(())
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn list(&self) -> Result<Vec<ConversationSummary>> {
        let entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        let mut entries = ReadDirStream::new(entries);
        while let Some(entry) = entries.next().await {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            match self.load(id).await {
                Ok(Some(conversation)) => summaries.push(conversation.summary()),
                Ok(None) => {}
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable conversation"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        self.load(id).await
    }

    async fn create(&self, title: &str, messages: Vec<Message>) -> Result<Conversation> {
        let conversation = Conversation::new(title, messages);
        let _guard = self.locks.lock(&conversation.id).await;
        self.save(&conversation).await?;
        tracing::debug!(id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    async fn update(
        &self,
        id: &str,
        title: Option<String>,
        messages: Option<Vec<Message>>,
    ) -> Result<Option<Conversation>> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        let Some(mut conversation) = self.load(id).await? else {
            return Ok(None);
        };
        if let Some(title) = title {
            conversation.title = title;
        }
        if let Some(messages) = messages {
            conversation.messages = messages;
        }
        conversation.touch();
        self.save(&conversation).await?;
        Ok(Some(conversation))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.conversation_path(id)?;
        {
            let _guard = self.locks.lock(id).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(id, "conversation deleted"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.locks.forget(id);
        Ok(())
    }

    async fn modify(&self, id: &str, edit: MessageEdit) -> Result<Option<Conversation>> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        let Some(mut conversation) = self.load(id).await? else {
            return Ok(None);
        };
        edit(&mut conversation.messages);
        conversation.touch();
        self.save(&conversation).await?;
        Ok(Some(conversation))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn store() -> (tempfile::TempDir, FileConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConversationStore::new(dir.path().join("conversations"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let (_dir, store) = store();
        let created = store.create("hello", vec![Message::user("hi")]).await.unwrap();
        assert!(store.base_path().join(format!("{}.json", created.id)).exists());

        let loaded = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "hello");
        assert_eq!(loaded.messages.len(), 1);

        let updated = store
            .update(&created.id, Some("renamed".into()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.messages.len(), 1);
        assert!(updated.updated_at >= created.updated_at);

        store.delete(&created.id).await.unwrap();
        assert!(store.get(&created.id).await.unwrap().is_none());
        store.delete(&created.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_ids_are_none() {
        let (_dir, store) = store();
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.update("missing", Some("t".into()), None).await.unwrap().is_none());
        let edit: MessageEdit = Box::new(|_: &mut Vec<Message>| {});
        assert!(store.modify("missing", edit).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_cannot_escape_the_directory() {
        let (_dir, store) = store();
        for id in ["../etc", "a/b", "a\\b", "", "bad\nid"] {
            assert!(matches!(store.get(id).await, Err(ChatError::InvalidRequest(_))), "{id:?}");
        }
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_skips_junk() {
        let (_dir, store) = store();
        let first = store.create("first", Vec::new()).await.unwrap();
        let second = store.create("second", Vec::new()).await.unwrap();
        tokio::fs::write(store.base_path().join("broken.json"), "{not json").await.unwrap();
        tokio::fs::write(store.base_path().join("notes.txt"), "ignored").await.unwrap();

        store
            .update(&first.id, Some("first again".into()), None)
            .await
            .unwrap();

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, first.id);
        assert_eq!(list[1].id, second.id);
    }

    #[tokio::test]
    async fn test_concurrent_modifications_are_serialized() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let conversation = store.create("busy", Vec::new()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let id = conversation.id.clone();
            handles.push(tokio::spawn(async move {
                let edit: MessageEdit = Box::new(move |messages: &mut Vec<Message>| {
                    messages.push(Message::user(format!("m{i}")));
                });
                store.modify(&id, edit).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let loaded = store.get(&conversation.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 16);
    }

    #[tokio::test]
    async fn test_documents_survive_a_new_store_instance() {
        let (dir, store) = store();
        let created = store.create("kept", vec![Message::user("hi")]).await.unwrap();
        drop(store);

        let reopened = FileConversationStore::new(dir.path().join("conversations"));
        let loaded = reopened.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "kept");
    }
}
