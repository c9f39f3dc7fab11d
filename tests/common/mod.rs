#![allow(dead_code)]

use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use local_llm_bridge::{
    build_app,
    config::{BackendConfig, BridgeConfig},
    state::AppState,
};
use serde_json::Value;

/// What a fake backend saw and whether its response body was torn down.
#[derive(Clone, Default)]
pub struct Upstream {
    pub requests: Arc<Mutex<Vec<Value>>>,
    pub closed: Arc<AtomicBool>,
}

impl Upstream {
    pub fn last_request(&self) -> Option<Value> {
        self.requests.lock().expect("lock").last().cloned()
    }

    pub fn record(&self, body: Value) {
        self.requests.lock().expect("lock").push(body);
    }

    pub async fn wait_closed(&self) -> bool {
        for _ in 0..100 {
            if self.closed.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

struct CloseFlag(Arc<AtomicBool>);

impl Drop for CloseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// An address nothing listens on.
pub async fn dead_host() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

fn streamed(content_type: &'static str, chunks: Vec<&'static str>) -> Response {
    let stream = async_stream::stream! {
        for chunk in chunks {
            yield Ok::<Bytes, Infallible>(Bytes::from_static(chunk.as_bytes()));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    ([(CONTENT_TYPE, content_type)], Body::from_stream(stream)).into_response()
}

async fn ndjson_hello(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    upstream.record(body);
    streamed(
        "application/x-ndjson",
        vec![
            "{\"response\":\"Hel\",\"done\":false}\n",
            "{\"response\":\"lo\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
        ],
    )
}

async fn sse_hi(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    upstream.record(body);
    streamed(
        "text/event-stream",
        vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"H\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"i\"}}]}\n\n",
            "data: [DONE]\n\n",
        ],
    )
}

async fn boom(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    upstream.record(body);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "boom"})),
    )
        .into_response()
}

async fn stalled(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    upstream.record(body);
    tokio::time::sleep(Duration::from_secs(30)).await;
    streamed("application/x-ndjson", vec!["{\"response\":\"late\"}\n"])
}

async fn endless(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    upstream.record(body);
    let flag = CloseFlag(upstream.closed.clone());
    let stream = async_stream::stream! {
        let _flag = flag;
        loop {
            yield Ok::<Bytes, Infallible>(Bytes::from_static(b"{\"response\":\"tick \"}\n"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    ([(CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(stream)).into_response()
}

async fn broken(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Response {
    upstream.record(body);
    let stream = async_stream::stream! {
        yield Ok::<Bytes, std::io::Error>(Bytes::from_static(b"{\"response\":\"partial\"}\n"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        yield Err(std::io::Error::other("connection reset"));
    };
    ([(CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(stream)).into_response()
}

pub enum Behavior {
    NdjsonHello,
    SseHi,
    Boom,
    Stalled,
    Endless,
    /// One line, then the connection is aborted.
    Broken,
}

pub async fn spawn_upstream(behavior: Behavior) -> (String, Upstream) {
    let upstream = Upstream::default();
    let router = match behavior {
        Behavior::NdjsonHello => Router::new().route("/api/generate", post(ndjson_hello)),
        Behavior::SseHi => Router::new().route("/v1/chat/completions", post(sse_hi)),
        Behavior::Boom => Router::new().route("/api/generate", post(boom)),
        Behavior::Stalled => Router::new().route("/api/generate", post(stalled)),
        Behavior::Endless => Router::new().route("/api/generate", post(endless)),
        Behavior::Broken => Router::new().route("/api/generate", post(broken)),
    };
    let url = serve(router.with_state(upstream.clone())).await;
    (url, upstream)
}

/// Bridge state pointing NDJSON traffic at `ollama`.
pub fn ndjson_state(ollama: &str) -> AppState {
    state_for(BackendConfig::new(ollama, "http://127.0.0.1:1"))
}

pub fn state_for(backends: BackendConfig) -> AppState {
    AppState::new(BridgeConfig::for_backends(backends)).expect("state builds")
}

pub fn state_with_timeout(ollama: &str, timeout: Duration) -> AppState {
    let mut config =
        BridgeConfig::for_backends(BackendConfig::new(ollama, "http://127.0.0.1:1"));
    config.session_timeout = timeout;
    AppState::new(config).expect("state builds")
}

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub async fn spawn_bridge(state: AppState) -> String {
    serve(build_app(state)).await
}
