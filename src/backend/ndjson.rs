use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    backend::{BackendError, BackendTarget},
    models::{Fragment, GenerationRequest},
};

pub fn request_body(request: &GenerationRequest) -> Value {
    json!({
        "model": request.model_name,
        "prompt": request.user_prompt,
        "system": request.system_prompt,
        "options": {
            "temperature": request.temperature
        }
    })
}

/// Splits a byte stream into lines and pulls the `response` field out of each.
///
/// Bytes are held until a newline arrives, so objects and UTF-8 sequences
/// split across network chunks are reassembled before parsing.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
}

impl NdjsonDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Fragment> {
        self.buffer.extend_from_slice(chunk);

        let mut fragments = Vec::new();
        while let Some(index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.split_to(index + 1);
            if let Some(fragment) = parse_line(&line[..index]) {
                fragments.push(fragment);
            }
        }
        fragments
    }

    /// Parses whatever trails the last newline once the upstream closes.
    pub fn finish(&mut self) -> Option<Fragment> {
        let rest = self.buffer.split();
        parse_line(&rest)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: Option<String>,
}

fn parse_line(line: &[u8]) -> Option<Fragment> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<GenerateLine>(trimmed) {
        Ok(parsed) => parsed.response.and_then(Fragment::new),
        Err(error) => {
            debug!(error = %error, line = %trimmed, "skipping malformed ndjson line");
            None
        }
    }
}

pub fn fragments<S, E>(
    bytes: S,
    target: BackendTarget,
) -> impl Stream<Item = Result<Fragment, BackendError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send,
{
    async_stream::stream! {
        futures_util::pin_mut!(bytes);
        let mut decoder = NdjsonDecoder::default();

        while let Some(next) = bytes.next().await {
            match next {
                Ok(chunk) => {
                    for fragment in decoder.feed(&chunk) {
                        yield Ok(fragment);
                    }
                }
                Err(error) => {
                    yield Err(target.connection_error(error));
                    return;
                }
            }
        }

        if let Some(fragment) = decoder.finish() {
            yield Ok(fragment);
        }
    }
}
