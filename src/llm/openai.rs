//! OpenAI-compatible chat completions (OpenAI, OpenRouter, DeepSeek, Ollama).

use super::sse;
use super::types::*;
use super::{ContentGenerator, ProviderId, estimate_tokens};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::provider_config::ProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct OpenAiAdapter {
    config: ProviderConfig,
    http: HttpClient,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
}

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

impl OpenAiAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = HttpClient::new(config.provider.as_str(), config.timeout_ms)?;
        Ok(Self { config, http })
    }

    fn auth_header(&self) -> Option<String> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| format!("Bearer {k}"))
    }

    fn headers<'a>(&self, auth: &'a Option<String>) -> Vec<(&'static str, &'a str)> {
        let mut headers = Vec::new();
        if let Some(a) = auth {
            headers.push(("Authorization", a.as_str()));
        }
        headers
    }

    fn body(&self, request: &GenerateRequest, stream: bool) -> Result<String> {
        build_chat_body(&self.config, request, stream)
    }
}

/// Serialize a chat completion body: system prompt first, then the turns.
pub(crate) fn build_chat_body(
    config: &ProviderConfig,
    request: &GenerateRequest,
    stream: bool,
) -> Result<String> {
    let model = request.model.as_deref().unwrap_or(&config.model);
    let sampling = config.sampling.merged_with(&request.sampling);

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system.as_deref() {
        messages.push(Msg {
            role: "system",
            content: system,
        });
    }
    for m in &request.messages {
        messages.push(Msg {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &m.content,
        });
    }

    let body = ChatRequest {
        model,
        messages,
        max_tokens: sampling.max_tokens,
        temperature: sampling.temperature,
        top_p: sampling.top_p,
        presence_penalty: sampling.presence_penalty,
        frequency_penalty: sampling.frequency_penalty,
        stop: &sampling.stop_sequences,
        stream,
    };
    let mut value = serde_json::to_value(&body)
        .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
    if let Value::Object(obj) = &mut value {
        for (k, v) in &config.extras {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(value.to_string())
}

fn parse_chat_response(
    provider: ProviderId,
    fallback_model: &str,
    text: &str,
) -> Result<GenerateResponse> {
    let resp: ChatResponse = serde_json::from_str(text)
        .map_err(|e| Error::malformed(provider.as_str(), format!("parse chat response: {e}")))?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::malformed(provider.as_str(), "response has no choices"))?;
    Ok(GenerateResponse {
        text: choice.message.content.unwrap_or_default(),
        model: resp.model.unwrap_or_else(|| fallback_model.to_string()),
        usage: resp.usage.map(Usage::from).unwrap_or_default(),
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_openai),
    })
}

fn parse_stream_event(provider: ProviderId, data: &str) -> Result<Option<StreamChunk>> {
    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| Error::malformed(provider.as_str(), format!("parse stream event: {e}")))?;
    let usage = event.usage.map(Usage::from);
    let Some(choice) = event.choices.into_iter().next() else {
        return Ok(usage.map(|u| StreamChunk {
            usage: Some(u),
            ..Default::default()
        }));
    };
    Ok(Some(StreamChunk {
        delta: choice.delta.content.unwrap_or_default(),
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_openai),
        usage,
    }))
}

#[async_trait]
impl ContentGenerator for OpenAiAdapter {
    fn provider(&self) -> ProviderId {
        self.config.provider
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse> {
        debug!(provider = %self.config.provider, model = ?request.model, "sending chat completion");
        let body = self.body(request, false)?;
        let url = format!("{}/chat/completions", self.config.base_url);
        let auth = self.auth_header();
        let text = self
            .http
            .post_json_raw(&url, &body, &self.headers(&auth), cancel)
            .await?;
        let fallback_model = request.model.as_deref().unwrap_or(&self.config.model);
        parse_chat_response(self.config.provider, fallback_model, &text)
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let body = self.body(request, true)?;
        let url = format!("{}/chat/completions", self.config.base_url);
        let auth = self.auth_header();
        let mut headers = self.headers(&auth);
        headers.push(("Accept", "text/event-stream"));
        let response = self.http.post_stream(&url, &body, &headers, cancel).await?;
        let provider = self.config.provider;
        Ok(sse::chunk_stream(
            response,
            provider.as_str(),
            cancel.clone(),
            move |data| parse_stream_event(provider, data),
        ))
    }

    async fn count_tokens(
        &self,
        request: &GenerateRequest,
        _cancel: &CancellationToken,
    ) -> Result<TokenCount> {
        Ok(TokenCount {
            total: estimate_tokens(&request.prompt_text()),
            exact: false,
        })
    }

    async fn embed(&self, request: &EmbedRequest, cancel: &CancellationToken) -> Result<Embedding> {
        let model = request
            .model
            .clone()
            .or_else(|| {
                self.config
                    .extras
                    .get("embeddingModel")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
        let body = serde_json::to_string(&EmbeddingRequest {
            model: &model,
            input: &request.input,
        })
        .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        let url = format!("{}/embeddings", self.config.base_url);
        let auth = self.auth_header();
        let resp: EmbeddingResponse = self
            .http
            .post_json(&url, &body, &self.headers(&auth), cancel)
            .await?;
        let values = resp
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                Error::malformed(self.config.provider.as_str(), "empty embedding response")
            })?;
        Ok(Embedding { model, values })
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.config.base_url);
        let auth = self.auth_header();
        let list: ModelList = self
            .http
            .get_json(&url, &self.headers(&auth), cancel)
            .await?;
        let provider = self.config.provider;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                display_name: m.name.unwrap_or_else(|| m.id.clone()),
                context_length: m.context_length,
                capabilities: vec!["chat".into()],
                id: m.id,
                provider,
            })
            .collect())
    }
}
