use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    backend::StreamTranslator, config::BridgeConfig, metrics::AppMetrics,
    session::SessionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub translator: StreamTranslator,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<AppMetrics>,
    /// Parent of every session token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Result<Self, reqwest::Error> {
        let translator = StreamTranslator::new(config.connect_timeout)?;
        Ok(Self {
            config: Arc::new(config),
            translator,
            sessions: Arc::new(SessionRegistry::default()),
            metrics: Arc::new(AppMetrics::new()),
            shutdown: CancellationToken::new(),
        })
    }
}
