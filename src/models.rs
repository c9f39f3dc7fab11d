use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::RequestDefaults;

/// Inbound body of `POST /api/chat`, also sent as-is by the client consumer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatBody {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub options: Option<ChatOptions>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model_name: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
}

impl ChatBody {
    pub fn into_generation(self, defaults: &RequestDefaults) -> Result<GenerationRequest, String> {
        if self.model.trim().is_empty() {
            return Err("model is required".to_owned());
        }

        let system_prompt = if self.system.is_empty() {
            defaults.system_prompt.clone()
        } else {
            self.system
        };
        let temperature = self
            .options
            .and_then(|options| options.temperature)
            .unwrap_or(defaults.temperature);

        Ok(GenerationRequest {
            model_name: self.model,
            system_prompt,
            user_prompt: self.prompt,
            temperature,
        })
    }
}

/// A non-empty piece of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment(String);

impl Fragment {
    pub fn new(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        if text.is_empty() {
            None
        } else {
            Some(Self(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<Fragment> for Bytes {
    fn from(fragment: Fragment) -> Self {
        Bytes::from(fragment.0)
    }
}
