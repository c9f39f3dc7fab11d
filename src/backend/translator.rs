use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{
    header::{ACCEPT, CACHE_CONTROL, PRAGMA},
    StatusCode,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{ndjson, sse, BackendError, BackendKind, BackendTarget, FragmentStream},
    models::GenerationRequest,
};

const MAX_UPSTREAM_MESSAGE_CHARS: usize = 400;

/// Opens generation requests against either backend and hands back the
/// canonical fragment stream.
#[derive(Clone)]
pub struct StreamTranslator {
    client: reqwest::Client,
}

impl StreamTranslator {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Firing `token` aborts the request in flight or ends the returned
    /// stream, which drops the upstream connection.
    pub async fn translate(
        &self,
        target: &BackendTarget,
        request: &GenerationRequest,
        token: CancellationToken,
    ) -> Result<FragmentStream, BackendError> {
        let kind = target.kind();
        let payload = match kind {
            BackendKind::Ndjson => ndjson::request_body(request),
            BackendKind::Sse => sse::request_body(request),
        };

        let send = self
            .client
            .post(target.generate_url())
            .header(ACCEPT, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .json(&payload)
            .send();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BackendError::Cancelled(kind)),
            result = send => result.map_err(|error| target.connection_error(error))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(BackendError::Cancelled(kind)),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(BackendError::Upstream {
                backend: kind,
                status: status.as_u16(),
                message: upstream_message(status, &body),
            });
        }

        let bytes = response.bytes_stream().take_until(token.cancelled_owned());
        debug!(
            backend = kind.name(),
            url = %target.generate_url(),
            model = %request.model_name,
            "upstream stream opened"
        );

        let stream = match kind {
            BackendKind::Ndjson => ndjson::fragments(bytes, target.clone()).boxed(),
            BackendKind::Sse => sse::fragments(bytes, target.clone()).boxed(),
        };
        Ok(stream)
    }
}

fn upstream_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| reported_message(&value))
        .unwrap_or_else(|| {
            format!(
                "HTTP error {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            )
            .trim_end()
            .to_owned()
        });
    message.chars().take(MAX_UPSTREAM_MESSAGE_CHARS).collect()
}

fn reported_message(value: &Value) -> Option<String> {
    match value.get("error") {
        Some(Value::String(message)) => return Some(message.clone()),
        Some(Value::Object(error)) => {
            if let Some(message) = error.get("message").and_then(Value::as_str) {
                return Some(message.to_owned());
            }
        }
        _ => {}
    }
    value
        .get("message")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}
