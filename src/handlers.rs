use std::{convert::Infallible, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, Path, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    backend::BackendTarget,
    errors::AppError,
    models::ChatBody,
    session::{SessionError, StreamSession},
    state::AppState,
};

pub const SESSION_ID_HEADER: &str = "x-session-id";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    let response = match process_chat(state.clone(), &headers, payload).await {
        Ok(response) => response,
        Err(error) => {
            warn!(kind = error.kind(), error = %error, "chat request failed");
            error.into_response()
        }
    };

    state.metrics.observe_request(
        "/api/chat",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

/// A caller may pick the session id up front so it can stop the session
/// before response headers reach it.
fn requested_session_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(SESSION_ID_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn process_chat(
    state: AppState,
    headers: &HeaderMap,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = payload.map_err(|rejection| AppError::Validation(rejection.body_text()))?;
    let request = body
        .into_generation(&state.config.defaults)
        .map_err(AppError::Validation)?;
    let target = BackendTarget::select(&state.config.backends);
    let backend = target.kind();

    let mut session = StreamSession::new(state.config.session_timeout, &state.shutdown)
        .with_metrics(&state.metrics);
    if let Some(id) = requested_session_id(headers) {
        if !state.sessions.contains(&id) {
            session = session.with_id(id);
        }
    }
    let mut session = session.register(&state.sessions);
    let session_id = session.id();
    info!(
        session_id = %session_id,
        model = %request.model_name,
        backend = backend.name(),
        host = %target.base_url(),
        temperature = request.temperature,
        "chat request accepted"
    );

    let opened = session
        .start(state.translator.translate(&target, &request, session.token()))
        .await;
    let first = match opened {
        Ok(()) => session.next_fragment().await,
        Err(error) => Err(error),
    };
    let first = first.map_err(|error| {
        if let SessionError::Backend(backend_error) = &error {
            state
                .metrics
                .observe_backend_error(backend.name(), backend_error.kind_label());
        }
        AppError::from_session(error, &target, &request)
    })?;

    let metrics = state.metrics.clone();
    let body = async_stream::stream! {
        let mut session = session;
        let Some(first) = first else {
            return;
        };
        metrics.observe_fragment(backend.name());
        yield Ok::<Bytes, Infallible>(first.into());

        loop {
            match session.next_fragment().await {
                Ok(Some(fragment)) => {
                    metrics.observe_fragment(backend.name());
                    yield Ok::<Bytes, Infallible>(fragment.into());
                }
                Ok(None) => break,
                Err(error) => {
                    if let SessionError::Backend(backend_error) = &error {
                        metrics.observe_backend_error(backend.name(), backend_error.kind_label());
                    }
                    warn!(
                        session_id = %session.id(),
                        fragments = session.fragments_produced(),
                        error = %error,
                        "upstream failed mid-stream, closing response"
                    );
                    break;
                }
            }
        }
    };

    let mut response = (
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response();
    crate::errors::apply_header(
        response.headers_mut(),
        SESSION_ID_HEADER,
        &session_id.to_string(),
    );
    Ok(response)
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.sessions.stop(&session_id) {
        info!(session_id = %session_id, "stop requested");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::NotFound(format!(
            "no active session with id {session_id}"
        )))
    }
}
