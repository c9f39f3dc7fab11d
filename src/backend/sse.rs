use std::fmt;

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, BackendTarget},
    models::{Fragment, GenerationRequest},
};

pub fn request_body(request: &GenerationRequest) -> Value {
    json!({
        "model": request.model_name,
        "messages": [
            {"role": "system", "content": request.system_prompt},
            {"role": "user", "content": request.user_prompt}
        ],
        "temperature": request.temperature,
        "stream": true
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extracts `choices[0].delta.content` from one event payload.
pub fn parse_event_data(data: &str) -> Option<Fragment> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .and_then(Fragment::new),
        Err(error) => {
            warn!(error = %error, "failed to parse SSE event payload");
            None
        }
    }
}

pub fn fragments<S, B, E>(
    bytes: S,
    target: BackendTarget,
) -> impl Stream<Item = Result<Fragment, BackendError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    async_stream::stream! {
        let events = bytes.eventsource();
        futures_util::pin_mut!(events);

        while let Some(next) = events.next().await {
            match next {
                Ok(event) => {
                    if let Some(fragment) = parse_event_data(&event.data) {
                        yield Ok(fragment);
                    }
                }
                Err(EventStreamError::Transport(error)) => {
                    yield Err(target.connection_error(error));
                    return;
                }
                Err(error) => {
                    debug!(error = %error, "skipping undecodable SSE event");
                }
            }
        }
    }
}
