use std::{env, net::SocketAddr, time::Duration};

use tracing::warn;

pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";
pub const DEFAULT_LMSTUDIO_HOST: &str = "http://127.0.0.1:1234";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an AI assistant that follows instructions. Help the user with their tasks.";
pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub backends: BackendConfig,
    pub defaults: RequestDefaults,
    /// Fixed deadline for a whole session, counted from acceptance.
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub ollama_host: String,
    pub lmstudio_host: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub system_prompt: String,
    pub temperature: f64,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self {
            backends: BackendConfig::from_env(),
            defaults: RequestDefaults {
                system_prompt: read_string("DEFAULT_SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
                temperature: read_f64("DEFAULT_TEMPERATURE", DEFAULT_TEMPERATURE),
            },
            session_timeout: Duration::from_millis(read_u64(
                "API_TIMEOUT_DURATION",
                DEFAULT_TIMEOUT_MS,
            )),
            connect_timeout: Duration::from_secs(read_u64("BRIDGE_CONNECT_TIMEOUT_SECS", 10)),
            bind_addr: read_addr("BRIDGE_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
        }
    }

    pub fn for_backends(backends: BackendConfig) -> Self {
        Self {
            backends,
            defaults: RequestDefaults::default(),
            session_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(10),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self::new(
            read_string("OLLAMA_HOST", DEFAULT_OLLAMA_HOST),
            read_string("LMSTUDIO_HOST", DEFAULT_LMSTUDIO_HOST),
        )
    }

    pub fn new(ollama_host: impl Into<String>, lmstudio_host: impl Into<String>) -> Self {
        Self {
            ollama_host: normalize_host(ollama_host.into()),
            lmstudio_host: normalize_host(lmstudio_host.into()),
        }
    }
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Settings for the terminal client and anything else driving the consumer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub bridge_url: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    /// Stored chat session to continue instead of starting a new one.
    pub resume_session: Option<i64>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            bridge_url: normalize_host(read_string("BRIDGE_URL", "http://127.0.0.1:8080")),
            model: read_string("BRIDGE_MODEL", "llama3"),
            system_prompt: read_string("DEFAULT_SYSTEM_PROMPT", ""),
            temperature: read_f64("DEFAULT_TEMPERATURE", DEFAULT_TEMPERATURE),
            redis_url: env::var("REDIS_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            redis_prefix: read_string("BRIDGE_REDIS_PREFIX", "bridge"),
            resume_session: env::var("BRIDGE_SESSION_ID")
                .ok()
                .and_then(|value| value.trim().parse().ok()),
        }
    }
}

fn normalize_host(host: String) -> String {
    host.trim().trim_end_matches('/').to_owned()
}

fn read_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn read_addr(name: &str, default: SocketAddr) -> SocketAddr {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|error| {
            warn!(%value, %error, "invalid {name}, using {default}");
            default
        }),
        Err(_) => default,
    }
}
