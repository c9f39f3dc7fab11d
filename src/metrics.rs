use std::{sync::Arc, time::Duration};

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    active_sessions: IntGauge,
    session_outcomes_total: IntCounterVec,
    backend_errors_total: IntCounterVec,
    fragments_total: IntCounterVec,
}

/// Counts a session as active for as long as it is held.
pub struct SessionGuard {
    metrics: Arc<AppMetrics>,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "bridge_http_requests_total",
                "Total HTTP requests processed by the bridge"
            ),
            &["path", "method", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "bridge_http_request_duration_seconds",
                "Time until response headers were ready, in seconds",
            ),
            &["path", "method"],
        )
        .expect("valid request_duration_seconds metric");

        let active_sessions = IntGauge::new(
            "bridge_active_sessions",
            "Stream sessions currently holding an upstream connection",
        )
        .expect("valid active_sessions metric");

        let session_outcomes_total = IntCounterVec::new(
            opts!(
                "bridge_session_outcomes_total",
                "Terminal states reached by stream sessions"
            ),
            &["outcome"],
        )
        .expect("valid session_outcomes_total metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "bridge_backend_errors_total",
                "Backend failures by backend and kind"
            ),
            &["backend", "kind"],
        )
        .expect("valid backend_errors_total metric");

        let fragments_total = IntCounterVec::new(
            opts!(
                "bridge_fragments_total",
                "Fragments forwarded to callers by backend"
            ),
            &["backend"],
        )
        .expect("valid fragments_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(session_outcomes_total.clone()))
            .expect("register session_outcomes_total");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(fragments_total.clone()))
            .expect("register fragments_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            active_sessions,
            session_outcomes_total,
            backend_errors_total,
            fragments_total,
        }
    }

    pub fn session_guard(self: &Arc<Self>) -> SessionGuard {
        self.active_sessions.inc();
        SessionGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_error(&self, backend: &str, kind: &str) {
        self.backend_errors_total
            .with_label_values(&[backend, kind])
            .inc();
    }

    pub fn observe_fragment(&self, backend: &str) {
        self.fragments_total.with_label_values(&[backend]).inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    pub fn observe_outcome(&self, outcome: &str) {
        self.metrics
            .session_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.active_sessions.dec();
    }
}
