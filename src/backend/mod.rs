pub mod ndjson;
pub mod sse;
mod translator;

use std::fmt;

use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::{config::BackendConfig, models::Fragment};

pub use translator::StreamTranslator;

pub type FragmentStream = BoxStream<'static, Result<Fragment, BackendError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Ndjson,
    Sse,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Ndjson => "ollama",
            BackendKind::Sse => "lmstudio",
        }
    }

    pub fn generate_path(self) -> &'static str {
        match self {
            BackendKind::Ndjson => "/api/generate",
            BackendKind::Sse => "/v1/chat/completions",
        }
    }

    pub fn host_variable(self) -> &'static str {
        match self {
            BackendKind::Ndjson => "OLLAMA_HOST",
            BackendKind::Sse => "LMSTUDIO_HOST",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Ndjson => f.write_str("Ollama"),
            BackendKind::Sse => f.write_str("LM Studio"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Ndjson { base_url: String },
    Sse { base_url: String },
}

impl BackendTarget {
    /// Identical hosts mean both names point at one OpenAI-compatible server.
    pub fn select(config: &BackendConfig) -> Self {
        if config.ollama_host == config.lmstudio_host {
            BackendTarget::Sse {
                base_url: config.lmstudio_host.clone(),
            }
        } else {
            BackendTarget::Ndjson {
                base_url: config.ollama_host.clone(),
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendTarget::Ndjson { .. } => BackendKind::Ndjson,
            BackendTarget::Sse { .. } => BackendKind::Sse,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            BackendTarget::Ndjson { base_url } | BackendTarget::Sse { base_url } => base_url,
        }
    }

    pub fn generate_url(&self) -> String {
        format!("{}{}", self.base_url(), self.kind().generate_path())
    }

    pub(crate) fn connection_error(&self, detail: impl fmt::Display) -> BackendError {
        BackendError::Connection {
            backend: self.kind(),
            host: self.base_url().to_owned(),
            detail: detail.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("could not connect to {backend} at {host}: {detail}")]
    Connection {
        backend: BackendKind,
        host: String,
        detail: String,
    },
    #[error("{message}")]
    Upstream {
        backend: BackendKind,
        status: u16,
        message: String,
    },
    #[error("request to {0} was cancelled")]
    Cancelled(BackendKind),
}

impl BackendError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            BackendError::Connection { .. } => "connection",
            BackendError::Upstream { .. } => "upstream",
            BackendError::Cancelled(_) => "cancelled",
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            BackendError::Connection { backend, .. } | BackendError::Upstream { backend, .. } => {
                *backend
            }
            BackendError::Cancelled(backend) => *backend,
        }
    }
}
