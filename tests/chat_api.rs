mod common;

use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{
    dead_host, ndjson_state, spawn_upstream, state_for, state_with_timeout, Behavior,
};
use futures_util::StreamExt;
use local_llm_bridge::{build_app, config::BackendConfig, errors::ErrorBody};
use tower::util::ServiceExt;

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .expect("request build")
}

fn stop_request(session_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/chat/{session_id}/stop"))
        .body(Body::empty())
        .expect("request build")
}

async fn error_body(response: axum::response::Response) -> ErrorBody {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read");
    serde_json::from_slice(&bytes).expect("error body is json")
}

async fn text_body(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn ndjson_fragments_stream_back_as_plain_text() {
    let (ollama, upstream) = spawn_upstream(Behavior::NdjsonHello).await;
    let app = build_app(ndjson_state(&ollama));

    let response = app
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"hi"}"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/plain; charset=utf-8")
    );
    assert!(response.headers().contains_key("x-session-id"));
    assert_eq!(text_body(response).await, "Hello");

    let sent = upstream.last_request().expect("upstream saw the request");
    assert_eq!(sent["model"], "llama3");
    assert_eq!(sent["prompt"], "hi");
    assert_eq!(
        sent["system"],
        local_llm_bridge::config::DEFAULT_SYSTEM_PROMPT
    );
    assert_eq!(sent["options"]["temperature"], 1.0);
}

#[tokio::test]
async fn identical_hosts_select_the_sse_backend() {
    let (host, upstream) = spawn_upstream(Behavior::SseHi).await;
    let app = build_app(state_for(BackendConfig::new(&host, &host)));

    let response = app
        .oneshot(chat_request(
            r#"{"model":"qwen","system":"be brief","prompt":"hello","options":{"temperature":0.2}}"#,
        ))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "Hi");

    let sent = upstream.last_request().expect("upstream saw the request");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["temperature"], 0.2);
    assert_eq!(
        sent["messages"],
        serde_json::json!([
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hello"}
        ])
    );
}

#[tokio::test]
async fn upstream_error_message_is_surfaced() {
    let (ollama, _upstream) = spawn_upstream(Behavior::Boom).await;
    let app = build_app(ndjson_state(&ollama));

    let response = app
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"hi"}"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = error_body(response).await;
    assert_eq!(body.error, "upstream_error");
    assert!(body.message.contains("boom"));
    assert!(body.suggestion.is_some_and(|text| text.contains("llama3")));
}

#[tokio::test]
async fn unreachable_backend_is_a_connection_error() {
    let ollama = dead_host().await;
    let app = build_app(ndjson_state(&ollama));

    let response = app
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"hi"}"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = error_body(response).await;
    assert_eq!(body.error, "connection_error");
    assert!(body.message.contains("Ollama"));
    assert!(body.message.contains(&ollama));
    assert!(body.suggestion.is_some_and(|text| text.contains("OLLAMA_HOST")));
}

#[tokio::test]
async fn missing_model_is_rejected_before_any_upstream_call() {
    let (ollama, upstream) = spawn_upstream(Behavior::NdjsonHello).await;
    let app = build_app(ndjson_state(&ollama));

    let response = app
        .oneshot(chat_request(r#"{"prompt":"hi"}"#))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.error, "validation_error");
    assert!(upstream.last_request().is_none());
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let app = build_app(ndjson_state("http://127.0.0.1:1"));

    let response = app
        .oneshot(chat_request("{not json"))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.error, "validation_error");
}

#[tokio::test]
async fn silent_backend_times_out() {
    let (ollama, _upstream) = spawn_upstream(Behavior::Stalled).await;
    let app = build_app(state_with_timeout(&ollama, Duration::from_millis(200)));

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        app.oneshot(chat_request(r#"{"model":"llama3","prompt":"hi"}"#)),
    )
    .await
    .expect("deadline enforced")
    .expect("request execution");

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_body(response).await.error, "timed_out");
}

#[tokio::test]
async fn stop_endpoint_ends_the_stream_and_releases_the_backend() {
    let (ollama, upstream) = spawn_upstream(Behavior::Endless).await;
    let state = ndjson_state(&ollama);
    let app: Router = build_app(state.clone());

    let response = app
        .clone()
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"count"}"#))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("x-session-id")
        .and_then(|value| value.to_str().ok())
        .expect("session id header")
        .to_owned();

    let mut body = response.into_body().into_data_stream();
    let first = body
        .next()
        .await
        .expect("first chunk")
        .expect("chunk read");
    assert_eq!(&first[..], b"tick ");

    let stopped = app
        .clone()
        .oneshot(stop_request(&session_id))
        .await
        .expect("stop execution");
    assert_eq!(stopped.status(), StatusCode::ACCEPTED);

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let mut chunks = 0;
        while let Some(chunk) = body.next().await {
            chunk.expect("chunk read");
            chunks += 1;
        }
        chunks
    })
    .await
    .expect("stream ends after stop");
    assert!(drained < 50);
    drop(body);
    assert_eq!(state.metrics.active_sessions(), 0);

    assert!(upstream.wait_closed().await, "upstream body was not dropped");

    let again = app
        .oneshot(stop_request(&session_id))
        .await
        .expect("stop execution");
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stopping_an_unknown_session_is_not_found() {
    let app = build_app(ndjson_state("http://127.0.0.1:1"));

    let response = app
        .oneshot(stop_request("6f1c1b8e-8a57-4c8f-9a43-2f0f0e0f5b11"))
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_count_session_outcomes() {
    let (ollama, _upstream) = spawn_upstream(Behavior::NdjsonHello).await;
    let app = build_app(ndjson_state(&ollama));

    let response = app
        .clone()
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"hi"}"#))
        .await
        .expect("request execution");
    assert_eq!(text_body(response).await, "Hello");

    let metrics = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("metrics execution");
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = text_body(metrics).await;
    assert!(text.contains("bridge_session_outcomes_total{outcome=\"completed\"} 1"));
    assert!(text.contains("bridge_fragments_total{backend=\"ollama\"} 2"));
    assert!(text.contains("bridge_active_sessions 0"));
}

async fn first_chunk_then_hold(app: &Router) -> (String, axum::body::BodyDataStream) {
    let response = app
        .clone()
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"count"}"#))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get("x-session-id")
        .and_then(|value| value.to_str().ok())
        .expect("session id header")
        .to_owned();
    let mut body = response.into_body().into_data_stream();
    body.next()
        .await
        .expect("first chunk")
        .expect("chunk read");
    (session_id, body)
}

#[tokio::test]
async fn stop_releases_the_backend_while_the_body_sits_unread() {
    let (ollama, upstream) = spawn_upstream(Behavior::Endless).await;
    let app = build_app(ndjson_state(&ollama));
    let (session_id, body) = first_chunk_then_hold(&app).await;

    let stopped = app
        .clone()
        .oneshot(stop_request(&session_id))
        .await
        .expect("stop execution");
    assert_eq!(stopped.status(), StatusCode::ACCEPTED);

    assert!(upstream.wait_closed().await, "upstream kept open while body unread");
    drop(body);
}

#[tokio::test]
async fn deadline_releases_the_backend_while_the_body_sits_unread() {
    let (ollama, upstream) = spawn_upstream(Behavior::Endless).await;
    let app = build_app(state_with_timeout(&ollama, Duration::from_millis(300)));
    let (_session_id, body) = first_chunk_then_hold(&app).await;

    assert!(upstream.wait_closed().await, "upstream kept open past the deadline");
    drop(body);
}

#[tokio::test]
async fn caller_chosen_session_id_is_honoured() {
    let (ollama, _upstream) = spawn_upstream(Behavior::NdjsonHello).await;
    let app = build_app(ndjson_state(&ollama));
    let chosen = "0d7b8f4e-2c1a-4a55-9f4e-5b2f8c9d1e01";

    let mut request = chat_request(r#"{"model":"llama3","prompt":"hi"}"#);
    request
        .headers_mut()
        .insert("x-session-id", chosen.parse().expect("header value"));
    let response = app.oneshot(request).await.expect("request execution");

    assert_eq!(
        response
            .headers()
            .get("x-session-id")
            .and_then(|value| value.to_str().ok()),
        Some(chosen)
    );
    assert_eq!(text_body(response).await, "Hello");
}

#[tokio::test]
async fn broken_backend_mid_stream_closes_after_partial_text() {
    let (ollama, _upstream) = spawn_upstream(Behavior::Broken).await;
    let app = build_app(ndjson_state(&ollama));

    let response = app
        .clone()
        .oneshot(chat_request(r#"{"model":"llama3","prompt":"hi"}"#))
        .await
        .expect("request execution");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "partial");

    let metrics = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("metrics execution");
    let text = text_body(metrics).await;
    assert!(text.contains("bridge_session_outcomes_total{outcome=\"failed\"} 1"));
    assert!(text.contains(
        "bridge_backend_errors_total{backend=\"ollama\",kind=\"connection\"} 1"
    ));
}
