use std::{fmt, sync::Arc};

use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{
        store::{MessageStore, SessionId, SessionMetadata, StoreError},
        transcript::{Message, Transcript},
    },
    errors::ErrorBody,
    handlers::SESSION_ID_HEADER,
    models::{ChatBody, ChatOptions},
};

pub const NEW_CONVERSATION_TITLE: &str = "New Conversation";
const TITLE_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    UserMessageAppended,
    AwaitingFirstFragment,
    StreamingAssistantMessage,
    Completed,
    Cancelled,
    Failed,
}

impl ExchangePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangePhase::Completed | ExchangePhase::Cancelled | ExchangePhase::Failed
        )
    }
}

/// What a UI needs to render the exchange in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSnapshot {
    pub exchange: u64,
    pub phase: ExchangePhase,
    pub streaming: bool,
    pub content: String,
    pub error: Option<ModelError>,
}

impl Default for ExchangeSnapshot {
    fn default() -> Self {
        Self {
            exchange: 0,
            phase: ExchangePhase::Idle,
            streaming: false,
            content: String::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{title}: {}", .message_lines.join(" "))]
pub struct ModelError {
    pub title: String,
    pub message_lines: Vec<String>,
    pub suggestion: String,
    pub code: String,
}

impl ModelError {
    fn network(detail: impl fmt::Display) -> Self {
        Self {
            title: "Network Error".to_owned(),
            message_lines: vec![
                "Failed to connect to the server.".to_owned(),
                detail.to_string(),
            ],
            suggestion:
                "Please check your connection and ensure the bridge server is running.".to_owned(),
            code: "NETWORK_ERROR".to_owned(),
        }
    }

    fn from_response(status: StatusCode, body: &str) -> Self {
        let code = status.as_u16().to_string();
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => Self {
                title: parsed.error,
                message_lines: vec![parsed.message],
                suggestion: parsed
                    .suggestion
                    .unwrap_or_else(|| "Please try again later.".to_owned()),
                code,
            },
            Err(_) => Self {
                title: "Error".to_owned(),
                message_lines: vec![status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_owned()],
                suggestion: "Please try again later.".to_owned(),
                code,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("an exchange is already streaming in this conversation")]
    Busy,
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug)]
pub struct Conversation {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub session_id: Option<SessionId>,
    transcript: Transcript,
    streaming: bool,
}

impl Conversation {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>, temperature: f64) -> Self {
        Self {
            name: NEW_CONVERSATION_TITLE.to_owned(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            temperature,
            session_id: None,
            transcript: Transcript::default(),
            streaming: false,
        }
    }

    /// Rebuilds a stored conversation: title, model and temperature from the
    /// session record, history from its messages.
    pub async fn resume(
        store: &dyn MessageStore,
        session_id: SessionId,
        system_prompt: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let session = store.session(session_id).await?;
        let messages = store
            .messages_for_session(session_id)
            .await?
            .into_iter()
            .map(|stored| Message {
                role: stored.sender,
                content: stored.content,
            })
            .collect();

        Ok(Self {
            name: session.title,
            model: session.metadata.model,
            system_prompt: system_prompt.into(),
            temperature: session.metadata.temperature,
            session_id: Some(session_id),
            transcript: Transcript::from_messages(messages),
            streaming: false,
        })
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            model: self.model.clone(),
            temperature: self.temperature,
        }
    }

    /// Appends the user turn and marks the conversation as streaming.
    pub fn begin_exchange(&mut self, content: &str) -> Result<(), ConsumerError> {
        if self.streaming {
            return Err(ConsumerError::Busy);
        }
        self.transcript
            .push_user(content)
            .map_err(|_| ConsumerError::Busy)?;
        self.streaming = true;
        Ok(())
    }

    fn chat_body(&self) -> ChatBody {
        ChatBody {
            model: self.model.clone(),
            system: self.system_prompt.clone(),
            prompt: self.transcript.prompt(),
            options: Some(ChatOptions {
                temperature: Some(self.temperature),
            }),
        }
    }
}

pub fn conversation_title(content: &str) -> String {
    if content.chars().count() > TITLE_CHARS {
        let prefix: String = content.chars().take(TITLE_CHARS).collect();
        format!("{prefix}...")
    } else {
        content.to_owned()
    }
}

#[derive(Debug)]
pub struct ExchangeOutcome {
    pub phase: ExchangePhase,
    pub content: String,
    pub fragments: usize,
    /// Set when the reply could not be saved; the reply itself is kept.
    pub persist_error: Option<StoreError>,
}

/// Closes an exchange whose future was dropped before it settled.
struct OpenExchange<'a> {
    consumer: &'a ChatConsumer,
    conversation: &'a mut Conversation,
    bridge_session: Option<Uuid>,
}

impl<'a> OpenExchange<'a> {
    fn new(consumer: &'a ChatConsumer, conversation: &'a mut Conversation) -> Self {
        Self {
            consumer,
            conversation,
            bridge_session: None,
        }
    }
}

impl Drop for OpenExchange<'_> {
    fn drop(&mut self) {
        if self.conversation.streaming {
            self.consumer.abandon(self.conversation, self.bridge_session);
        }
    }
}

/// Drives one conversation's exchanges against the bridge.
pub struct ChatConsumer {
    http: reqwest::Client,
    bridge_url: String,
    store: Arc<dyn MessageStore>,
    state: watch::Sender<ExchangeSnapshot>,
}

impl ChatConsumer {
    pub fn new(
        bridge_url: impl Into<String>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().build()?;
        let (state, _) = watch::channel(ExchangeSnapshot::default());
        Ok(Self {
            http,
            bridge_url: bridge_url.into().trim_end_matches('/').to_owned(),
            store,
            state,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ExchangeSnapshot> {
        self.state.subscribe()
    }

    /// Runs a full exchange: user turn, request, streamed reply, persistence.
    ///
    /// Errors are returned only when no reply was produced at all; a stream
    /// that breaks midway still yields an outcome with the partial reply.
    /// Dropping the returned future closes the exchange as cancelled.
    pub async fn send(
        &self,
        conversation: &mut Conversation,
        content: impl Into<String>,
        stop: CancellationToken,
    ) -> Result<ExchangeOutcome, ConsumerError> {
        let content = content.into();
        conversation.begin_exchange(&content)?;
        self.state.send_modify(|snapshot| {
            snapshot.exchange += 1;
            snapshot.phase = ExchangePhase::UserMessageAppended;
            snapshot.streaming = true;
            snapshot.content.clear();
            snapshot.error = None;
        });

        let mut open = OpenExchange::new(self, conversation);
        self.run_exchange(&mut open, content, stop).await
    }

    async fn run_exchange(
        &self,
        open: &mut OpenExchange<'_>,
        content: String,
        stop: CancellationToken,
    ) -> Result<ExchangeOutcome, ConsumerError> {
        let conversation = &mut *open.conversation;
        match self
            .store
            .save_user_message(
                &content,
                conversation.session_id,
                &conversation.name,
                &conversation.metadata(),
            )
            .await
        {
            Ok(session_id) => conversation.session_id = Some(session_id),
            Err(error) => warn!(error = %error, "failed to save user message"),
        }

        let body = conversation.chat_body();
        self.publish(ExchangePhase::AwaitingFirstFragment, "", None);

        let bridge_session = Uuid::new_v4();
        open.bridge_session = Some(bridge_session);
        let request = self
            .http
            .post(format!("{}/api/chat", self.bridge_url))
            .header(SESSION_ID_HEADER, bridge_session.to_string())
            .json(&body)
            .send();
        let response = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                self.request_stop(bridge_session).await;
                return Ok(self.finish(conversation, ExchangePhase::Cancelled).await);
            }
            response = request => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => return Err(self.fail(conversation, ModelError::network(error))),
        };
        let status = response.status();
        if !status.is_success() {
            let text = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    return Ok(self.finish(conversation, ExchangePhase::Cancelled).await);
                }
                text = response.text() => text.unwrap_or_default(),
            };
            return Err(self.fail(conversation, ModelError::from_response(status, &text)));
        }

        let bridge_session = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(bridge_session);
        open.bridge_session = Some(bridge_session);

        if conversation.transcript.len() == 1 {
            conversation.name = conversation_title(&content);
            if let Some(session_id) = conversation.session_id {
                if let Err(error) = self
                    .store
                    .rename_session(session_id, &conversation.name)
                    .await
                {
                    warn!(error = %error, session_id, "failed to save conversation title");
                }
            }
        }

        let outcome = self
            .stream_reply(conversation, response.bytes_stream(), stop)
            .await;
        if outcome.phase == ExchangePhase::Cancelled {
            self.request_stop(bridge_session).await;
        }
        Ok(outcome)
    }

    /// Accumulates the bridge's byte stream into the conversation until it
    /// ends, breaks, or `stop` fires. Stop is checked before every read.
    pub async fn consume<S, B, E>(
        &self,
        conversation: &mut Conversation,
        stream: S,
        stop: CancellationToken,
    ) -> ExchangeOutcome
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        let mut open = OpenExchange::new(self, conversation);
        self.stream_reply(&mut *open.conversation, stream, stop).await
    }

    async fn stream_reply<S, B, E>(
        &self,
        conversation: &mut Conversation,
        stream: S,
        stop: CancellationToken,
    ) -> ExchangeOutcome
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        let mut stream = Box::pin(stream);
        let mut decoder = Utf8Chunks::default();
        let mut phase = ExchangePhase::Completed;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    phase = ExchangePhase::Cancelled;
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let text = decoder.push(chunk.as_ref());
                    self.apply(conversation, &text);
                }
                Some(Err(error)) => {
                    warn!(error = %error, "reply stream cut off, keeping partial content");
                    phase = ExchangePhase::Failed;
                    break;
                }
                None => {
                    let rest = decoder.finish();
                    self.apply(conversation, &rest);
                    break;
                }
            }
        }
        drop(stream);

        self.finish(conversation, phase).await
    }

    fn apply(&self, conversation: &mut Conversation, text: &str) {
        if text.is_empty() {
            return;
        }
        let current = conversation.transcript.append_fragment(text);
        self.publish(ExchangePhase::StreamingAssistantMessage, current, None);
    }

    /// Commits the trailing message and ends streaming. Returns the reply.
    fn close(&self, conversation: &mut Conversation, phase: ExchangePhase) -> (String, usize) {
        let fragments = conversation.transcript.trailing_fragments();
        let content = conversation
            .transcript
            .commit()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        conversation.streaming = false;
        self.publish(phase, &content, None);
        (content, fragments)
    }

    async fn finish(&self, conversation: &mut Conversation, phase: ExchangePhase) -> ExchangeOutcome {
        let (content, fragments) = self.close(conversation, phase);
        let persist_error = self.persist(conversation.session_id, &content).await;
        info!(
            phase = ?phase,
            fragments,
            chars = content.len(),
            session_id = ?conversation.session_id,
            "exchange finished"
        );
        ExchangeOutcome {
            phase,
            content,
            fragments,
            persist_error,
        }
    }

    /// Synchronous close for a dropped exchange; saving and the bridge stop
    /// run on spawned tasks.
    fn abandon(&self, conversation: &mut Conversation, bridge_session: Option<Uuid>) {
        let (content, fragments) = self.close(conversation, ExchangePhase::Cancelled);
        warn!(fragments, "exchange dropped before it finished, keeping partial reply");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime left to save the abandoned reply");
            return;
        };
        if let Some(bridge_session) = bridge_session {
            let request = self.http.post(self.stop_url(bridge_session)).send();
            runtime.spawn(async move {
                if let Err(error) = request.await {
                    debug!(error = %error, "stop request not delivered");
                }
            });
        }
        if let (false, Some(session_id)) = (content.is_empty(), conversation.session_id) {
            let store = Arc::clone(&self.store);
            runtime.spawn(async move {
                if let Err(error) = store.save_assistant_message(&content, session_id).await {
                    warn!(error = %error, session_id, "failed to save assistant reply");
                }
            });
        }
    }

    fn fail(&self, conversation: &mut Conversation, error: ModelError) -> ConsumerError {
        conversation.streaming = false;
        warn!(title = %error.title, code = %error.code, "exchange failed before any reply");
        self.publish(ExchangePhase::Failed, "", Some(error.clone()));
        ConsumerError::Model(error)
    }

    async fn persist(&self, session_id: Option<SessionId>, content: &str) -> Option<StoreError> {
        if content.is_empty() {
            return None;
        }
        let Some(session_id) = session_id else {
            warn!("no chat session to attach the reply to, skipping save");
            return None;
        };
        match self.store.save_assistant_message(content, session_id).await {
            Ok(()) => None,
            Err(error) => {
                warn!(error = %error, session_id, "failed to save assistant reply");
                Some(error)
            }
        }
    }

    fn stop_url(&self, bridge_session: Uuid) -> String {
        format!("{}/api/chat/{bridge_session}/stop", self.bridge_url)
    }

    async fn request_stop(&self, bridge_session: Uuid) {
        match self.http.post(self.stop_url(bridge_session)).send().await {
            Ok(response) => debug!(status = %response.status(), "stop request delivered"),
            Err(error) => debug!(error = %error, "stop request not delivered"),
        }
    }

    fn publish(&self, phase: ExchangePhase, content: &str, error: Option<ModelError>) {
        self.state.send_modify(|snapshot| {
            snapshot.phase = phase;
            snapshot.streaming = !phase.is_terminal();
            snapshot.content.clear();
            snapshot.content.push_str(content);
            snapshot.error = error;
        });
    }
}

/// Decodes UTF-8 across chunk boundaries, holding back incomplete sequences.
#[derive(Debug, Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(error) if error.error_len().is_none() => error.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let ready: Vec<u8> = self.pending.drain(..valid).collect();
        String::from_utf8_lossy(&ready).into_owned()
    }

    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}
