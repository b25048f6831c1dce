pub mod claude;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatResponse {
    pub role: String,
    pub content: String,
    pub model: String,
}

/// A chat-completion capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Unified LLM provider enum: dispatches to OpenAI-compatible or Claude backends.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(openai::OpenAiConfig),
    Claude(claude::ClaudeConfig),
    Ollama(openai::OpenAiConfig),
}

impl Provider {
    pub fn openai(api_key: String, base_url: String) -> Self {
        Provider::OpenAi(openai::OpenAiConfig { api_key, base_url })
    }

    pub fn claude(api_key: String, base_url: String) -> Self {
        Provider::Claude(claude::ClaudeConfig { api_key, base_url })
    }

    pub fn ollama(host: String) -> Self {
        Provider::Ollama(openai::OpenAiConfig {
            api_key: String::new(),
            base_url: format!("{}/v1", host.trim_end_matches('/')),
        })
    }

    /// Builds a provider from a kind name as used in configuration.
    pub fn from_kind(kind: &str, api_key: String, base_url: String) -> Result<Self, LlmError> {
        match kind {
            "openai" => Ok(Self::openai(api_key, base_url)),
            "claude" | "anthropic" => Ok(Self::claude(api_key, base_url)),
            "ollama" => Ok(Self::ollama(base_url)),
            other => Err(LlmError::UnsupportedProvider(other.to_string())),
        }
    }
}

#[async_trait]
impl LanguageModel for Provider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        match self {
            Provider::OpenAi(config) | Provider::Ollama(config) => {
                openai::chat(config, request).await
            }
            Provider::Claude(config) => claude::chat(config, request).await,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_from_kind() {
        assert!(matches!(
            Provider::from_kind("openai", "k".into(), "https://api.openai.com/v1".into()),
            Ok(Provider::OpenAi(_))
        ));
        assert!(matches!(
            Provider::from_kind("anthropic", "k".into(), "https://api.anthropic.com".into()),
            Ok(Provider::Claude(_))
        ));
        match Provider::from_kind("ollama", String::new(), "http://localhost:11434/".into()) {
            Ok(Provider::Ollama(cfg)) => assert_eq!(cfg.base_url, "http://localhost:11434/v1"),
            other => panic!("unexpected provider: {other:?}"),
        }
        assert!(matches!(
            Provider::from_kind("copilot", String::new(), String::new()),
            Err(LlmError::UnsupportedProvider(_))
        ));
    }
}
