//! Session persistence gateway.
//!
//! Snapshots finalized model state into durable chat records keyed by
//! `(user_id, chat_id)`. Persistence only happens for authenticated owners; anonymous
//! conversations are never written.

use crate::context::Identity;
use crate::error::PersistenceError;
use crate::message::{Message, Role};
use crate::projector::ModelState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const TITLE_MAX_CHARS: usize = 100;
const UNTITLED: &str = "New chat";

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    pub title: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_path: Option<String>,
}

impl ChatRecord {
    pub fn model_state(&self) -> ModelState {
        ModelState {
            conversation_id: self.id.clone(),
            messages: self.messages.clone(),
        }
    }
}

/// Keyed chat storage. Last write wins; no transactions are assumed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn put(&self, record: ChatRecord) -> Result<(), PersistenceError>;

    async fn get(&self, user_id: &str, chat_id: &str)
    -> Result<Option<ChatRecord>, PersistenceError>;

    /// All chats of a user, most recent first.
    async fn list(&self, user_id: &str) -> Result<Vec<ChatRecord>, PersistenceError>;

    /// A chat by id, only if its owner shared it.
    async fn get_shared(&self, chat_id: &str) -> Result<Option<ChatRecord>, PersistenceError>;
}

/// A `ChatStore` kept in process memory, used for development and tests.
#[derive(Default)]
pub struct MemoryChatStore {
    records: RwLock<HashMap<(String, String), ChatRecord>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn put(&self, record: ChatRecord) -> Result<(), PersistenceError> {
        let key = (record.user_id.clone(), record.id.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn get(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatRecord>, PersistenceError> {
        let key = (user_id.to_string(), chat_id.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatRecord>, PersistenceError> {
        let mut chats: Vec<ChatRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(chats)
    }

    async fn get_shared(&self, chat_id: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|record| record.id == chat_id && record.share_path.is_some())
            .cloned())
    }
}

/// How often and how patiently detached persistence retries a failed write.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Derives a chat title from the first user message.
pub fn chat_title(messages: &[Message]) -> String {
    let source = messages
        .iter()
        .find(|m| m.role == Role::User)
        .or_else(|| messages.first())
        .map(|m| m.content.trim())
        .unwrap_or_default();
    if source.is_empty() {
        return UNTITLED.to_string();
    }
    source.chars().take(TITLE_MAX_CHARS).collect()
}

pub fn chat_path(chat_id: &str) -> String {
    format!("/chat/{chat_id}")
}

pub fn share_path(chat_id: &str) -> String {
    format!("/share/{chat_id}")
}

/// `(user_id, chat_id)` of a record.
type RecordKey = (String, String);

/// Conversations with a detached writer running, each with the newest state still
/// waiting to be written behind the current one.
type PendingWrites = HashMap<RecordKey, Option<ModelState>>;

#[derive(Clone)]
pub struct SessionGateway {
    store: Arc<dyn ChatStore>,
    retry: RetryPolicy,
    pending: Arc<Mutex<PendingWrites>>,
}

impl SessionGateway {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            pending: Arc::default(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingWrites> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Writes the chat record for `state`, overwriting any earlier version.
    ///
    /// Returns `Ok(None)` without touching the store when there is no owner. The
    /// creation time and share path of an existing record carry over.
    pub async fn persist(
        &self,
        state: &ModelState,
        owner: Option<&Identity>,
    ) -> Result<Option<ChatRecord>, PersistenceError> {
        let Some(owner) = owner else {
            debug!(
                conversation_id = %state.conversation_id,
                "No authenticated identity; skipping persistence"
            );
            return Ok(None);
        };

        let existing = self
            .store
            .get(&owner.user_id, &state.conversation_id)
            .await?;
        let (created_at, share_path) = match existing {
            Some(record) => (record.created_at, record.share_path),
            None => (Utc::now(), None),
        };

        let record = ChatRecord {
            id: state.conversation_id.clone(),
            title: chat_title(&state.messages),
            user_id: owner.user_id.clone(),
            created_at,
            messages: state.messages.clone(),
            path: chat_path(&state.conversation_id),
            share_path,
        };
        self.store.put(record.clone()).await?;
        info!(
            conversation_id = %record.id,
            messages = record.messages.len(),
            "Chat persisted"
        );
        Ok(Some(record))
    }

    /// Persists in a detached task so the turn never waits on the store.
    ///
    /// Writes of one conversation never overlap: while a write is in flight, a newer
    /// state replaces whatever was queued behind it and is written once the current
    /// write finishes. A failed write is retried according to the retry policy unless a
    /// newer state is already queued. Returns the handle of the spawned writer, or
    /// `None` when there is no owner or the state was queued behind a running writer.
    pub fn persist_detached(
        &self,
        state: ModelState,
        owner: Option<Identity>,
    ) -> Option<JoinHandle<()>> {
        let Some(owner) = owner else {
            debug!(
                conversation_id = %state.conversation_id,
                "No authenticated identity; skipping persistence"
            );
            return None;
        };

        let key = (owner.user_id.clone(), state.conversation_id.clone());
        {
            let mut pending = self.pending();
            if let Some(queued) = pending.get_mut(&key) {
                debug!(
                    conversation_id = %state.conversation_id,
                    "Write in flight; queueing newest state"
                );
                *queued = Some(state);
                return None;
            }
            pending.insert(key.clone(), None);
        }

        let gateway = self.clone();
        let span = info_span!("persist", conversation_id = %state.conversation_id);
        Some(tokio::spawn(
            async move {
                let mut next = Some(state);
                while let Some(state) = next {
                    gateway.write_with_retry(&state, &owner, &key).await;
                    next = gateway.take_queued(&key);
                }
            }
            .instrument(span),
        ))
    }

    async fn write_with_retry(&self, state: &ModelState, owner: &Identity, key: &RecordKey) {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.persist(state, Some(owner)).await {
                Ok(_) => return,
                Err(e) if self.has_queued(key) => {
                    warn!(attempt, error = %e, "Persisting chat failed; superseded by a newer state");
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Persisting chat failed; retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Persisting chat failed; giving up");
                }
            }
        }
    }

    fn has_queued(&self, key: &RecordKey) -> bool {
        self.pending().get(key).is_some_and(Option::is_some)
    }

    /// Takes the state queued behind the finished write, releasing the writer slot
    /// when there is none.
    fn take_queued(&self, key: &RecordKey) -> Option<ModelState> {
        let mut pending = self.pending();
        let queued = pending.get_mut(key).and_then(Option::take);
        if queued.is_none() {
            pending.remove(key);
        }
        queued
    }

    pub async fn load(
        &self,
        owner: &Identity,
        chat_id: &str,
    ) -> Result<Option<ChatRecord>, PersistenceError> {
        self.store.get(&owner.user_id, chat_id).await
    }

    pub async fn list(&self, owner: &Identity) -> Result<Vec<ChatRecord>, PersistenceError> {
        self.store.list(&owner.user_id).await
    }

    /// Marks an owned chat as shared and returns the updated record.
    pub async fn share(
        &self,
        owner: &Identity,
        chat_id: &str,
    ) -> Result<Option<ChatRecord>, PersistenceError> {
        let Some(mut record) = self.store.get(&owner.user_id, chat_id).await? else {
            return Ok(None);
        };
        record.share_path = Some(share_path(chat_id));
        self.store.put(record.clone()).await?;
        info!(conversation_id = %chat_id, "Chat shared");
        Ok(Some(record))
    }

    pub async fn shared(&self, chat_id: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        self.store.get_shared(chat_id).await
    }
}
