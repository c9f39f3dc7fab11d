use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{client::transcript::Role, config::ClientConfig};

pub type SessionId = i64;

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
pub const UNTITLED_SESSION_TITLE: &str = "Untitled Chat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sender: Role,
    pub content: String,
}

/// Generation settings recorded with a chat session when it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub model: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub title: String,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unknown chat session {0}")]
    UnknownSession(SessionId),
}

fn title_or(title: &str, fallback: &str) -> String {
    if title.trim().is_empty() {
        fallback.to_owned()
    } else {
        title.to_owned()
    }
}

/// Where finished exchanges are written. Append-only from the consumer's side.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Creates a chat session titled `title` when `session_id` is `None`.
    async fn save_user_message(
        &self,
        content: &str,
        session_id: Option<SessionId>,
        title: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionId, StoreError>;

    async fn save_assistant_message(
        &self,
        content: &str,
        session_id: SessionId,
    ) -> Result<(), StoreError>;

    async fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError>;

    async fn session(&self, session_id: SessionId) -> Result<ChatSession, StoreError>;

    async fn messages_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}

#[derive(Debug)]
struct MemorySession {
    record: ChatSession,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    sessions: Mutex<HashMap<SessionId, MemorySession>>,
    next_id: AtomicI64,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn append(
        &self,
        session_id: SessionId,
        message: StoredMessage,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StoreError::UnknownSession(session_id))?;
        session.messages.push(message);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_user_message(
        &self,
        content: &str,
        session_id: Option<SessionId>,
        title: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionId, StoreError> {
        let session_id = match session_id {
            Some(session_id) => session_id,
            None => {
                let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                let record = ChatSession {
                    id: session_id,
                    title: title_or(title, DEFAULT_SESSION_TITLE),
                    metadata: metadata.clone(),
                };
                self.sessions.lock().await.insert(
                    session_id,
                    MemorySession {
                        record,
                        messages: Vec::new(),
                    },
                );
                session_id
            }
        };
        self.append(
            session_id,
            StoredMessage {
                sender: Role::User,
                content: content.to_owned(),
            },
        )
        .await?;
        Ok(session_id)
    }

    async fn save_assistant_message(
        &self,
        content: &str,
        session_id: SessionId,
    ) -> Result<(), StoreError> {
        self.append(
            session_id,
            StoredMessage {
                sender: Role::Assistant,
                content: content.to_owned(),
            },
        )
        .await
    }

    async fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(&session_id)
            .map(|session| &mut session.record)
            .ok_or(StoreError::UnknownSession(session_id))?;
        record.title = title_or(title, UNTITLED_SESSION_TITLE);
        Ok(())
    }

    async fn session(&self, session_id: SessionId) -> Result<ChatSession, StoreError> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .map(|session| session.record.clone())
            .ok_or(StoreError::UnknownSession(session_id))
    }

    async fn messages_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .map(|session| session.messages.clone())
            .ok_or(StoreError::UnknownSession(session_id))
    }
}

pub struct RedisMessageStore {
    client: redis::Client,
    prefix: String,
}

impl RedisMessageStore {
    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
        })
    }

    fn session_key(&self, session_id: SessionId) -> String {
        format!("{}:session:{session_id}", self.prefix)
    }

    fn messages_key(&self, session_id: SessionId) -> String {
        format!("{}:session:{session_id}:messages", self.prefix)
    }

    async fn write_session(&self, record: &ChatSession) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        connection
            .set::<_, _, ()>(self.session_key(record.id), payload)
            .await?;
        Ok(())
    }

    async fn append(
        &self,
        session_id: SessionId,
        message: &StoredMessage,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(message)?;
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let known: bool = connection.exists(self.session_key(session_id)).await?;
        if !known {
            return Err(StoreError::UnknownSession(session_id));
        }
        connection
            .rpush::<_, _, ()>(self.messages_key(session_id), payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for RedisMessageStore {
    async fn save_user_message(
        &self,
        content: &str,
        session_id: Option<SessionId>,
        title: &str,
        metadata: &SessionMetadata,
    ) -> Result<SessionId, StoreError> {
        let session_id = match session_id {
            Some(session_id) => session_id,
            None => {
                let mut connection = self.client.get_multiplexed_async_connection().await?;
                let session_id: SessionId = connection
                    .incr(format!("{}:session_seq", self.prefix), 1)
                    .await?;
                self.write_session(&ChatSession {
                    id: session_id,
                    title: title_or(title, DEFAULT_SESSION_TITLE),
                    metadata: metadata.clone(),
                })
                .await?;
                session_id
            }
        };
        let message = StoredMessage {
            sender: Role::User,
            content: content.to_owned(),
        };
        self.append(session_id, &message).await?;
        Ok(session_id)
    }

    async fn save_assistant_message(
        &self,
        content: &str,
        session_id: SessionId,
    ) -> Result<(), StoreError> {
        let message = StoredMessage {
            sender: Role::Assistant,
            content: content.to_owned(),
        };
        self.append(session_id, &message).await
    }

    async fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError> {
        let mut record = self.session(session_id).await?;
        record.title = title_or(title, UNTITLED_SESSION_TITLE);
        self.write_session(&record).await
    }

    async fn session(&self, session_id: SessionId) -> Result<ChatSession, StoreError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = connection.get(self.session_key(session_id)).await?;
        let payload = payload.ok_or(StoreError::UnknownSession(session_id))?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn messages_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut connection = self.client.get_multiplexed_async_connection().await?;
        let payloads: Vec<String> = connection
            .lrange(self.messages_key(session_id), 0, -1)
            .await?;
        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(StoreError::from))
            .collect()
    }
}

/// Redis when `REDIS_URL` is configured and valid, memory otherwise.
pub fn store_from_config(config: &ClientConfig) -> Arc<dyn MessageStore> {
    match config.redis_url.as_deref() {
        Some(url) => match RedisMessageStore::open(url, config.redis_prefix.clone()) {
            Ok(store) => {
                info!(prefix = %config.redis_prefix, "persisting messages to redis");
                Arc::new(store)
            }
            Err(error) => {
                warn!(error = %error, "invalid REDIS_URL, keeping messages in memory");
                Arc::new(InMemoryMessageStore::new())
            }
        },
        None => Arc::new(InMemoryMessageStore::new()),
    }
}
