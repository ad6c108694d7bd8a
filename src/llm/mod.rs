//! Content generation: the provider adapters, the router that picks one per
//! call, and the selector that tracks the active (provider, model) pair.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod router;
pub mod selector;
pub mod sse;
pub mod types;

pub use router::{ContentRouter, Routed};
pub use selector::{ActiveSelection, ModelSelector};
pub use types::*;

use crate::error::{Error, Result};
use crate::provider_config::ProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Backend provider. Closed set; parsing anything else is an unknown-provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "deepseek")]
    DeepSeek,
    Ollama,
}

/// Request/response shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFamily {
    OpenAiCompatible,
    Anthropic,
    Gemini,
}

impl ProviderId {
    pub const ALL: [ProviderId; 6] = [
        Self::OpenAi,
        Self::Anthropic,
        Self::Gemini,
        Self::OpenRouter,
        Self::DeepSeek,
        Self::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::OpenRouter => "openrouter",
            Self::DeepSeek => "deepseek",
            Self::Ollama => "ollama",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Gemini => "Google Gemini",
            Self::OpenRouter => "OpenRouter",
            Self::DeepSeek => "DeepSeek",
            Self::Ollama => "Ollama (local)",
        }
    }

    pub fn wire_family(self) -> WireFamily {
        match self {
            Self::OpenAi | Self::OpenRouter | Self::DeepSeek | Self::Ollama => {
                WireFamily::OpenAiCompatible
            }
            Self::Anthropic => WireFamily::Anthropic,
            Self::Gemini => WireFamily::Gemini,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
            Self::Ollama => "OLLAMA_API_KEY",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-sonnet-4-5",
            Self::Gemini => "gemini-2.0-flash",
            Self::OpenRouter => "openai/gpt-4o-mini",
            Self::DeepSeek => "deepseek-chat",
            Self::Ollama => "llama3.1",
        }
    }

    /// Local backends run without a credential.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        match wanted.as_str() {
            "google" => Ok(Self::Gemini),
            _ => Self::ALL
                .into_iter()
                .find(|p| p.as_str() == wanted)
                .ok_or_else(|| Error::UnknownProvider(s.to_string())),
        }
    }
}

/// The uniform content-generation contract every provider adapter implements.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse>;

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream>;

    async fn count_tokens(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenCount>;

    async fn embed(&self, request: &EmbedRequest, cancel: &CancellationToken) -> Result<Embedding>;

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>>;
}

/// Build the adapter for a provider configuration.
pub fn build_adapter(config: ProviderConfig) -> Result<Arc<dyn ContentGenerator>> {
    if config.provider.requires_api_key() && config.api_key.as_deref().unwrap_or("").is_empty() {
        return Err(Error::config(format!(
            "no API key for {}. Set {} or store one with `research key set {} <key>`",
            config.provider,
            config.provider.api_key_env(),
            config.provider
        )));
    }

    let adapter: Arc<dyn ContentGenerator> = match config.provider.wire_family() {
        WireFamily::OpenAiCompatible => Arc::new(openai::OpenAiAdapter::new(config)?),
        WireFamily::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(config)?),
        WireFamily::Gemini => Arc::new(gemini::GeminiAdapter::new(config)?),
    };
    Ok(adapter)
}

/// Rough token estimate for backends without a counting endpoint.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}
