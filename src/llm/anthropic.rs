use super::sse;
use super::types::*;
use super::{ContentGenerator, ProviderId};
use crate::error::{Error, ProviderErrorKind, Result};
use crate::http::HttpClient;
use crate::provider_config::ProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const API_VERSION: &str = "2023-06-01";
/// The messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Largest page `GET /models` accepts.
const MODEL_PAGE_LIMIT: u32 = 1000;

pub struct AnthropicAdapter {
    config: ProviderConfig,
    http: HttpClient,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Msg<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct CountRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Msg<'a>>,
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<Block>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct Block {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct CountResponse {
    input_tokens: u32,
}

/// Streaming events, tagged by `type`. Only the ones carrying text, the
/// stop reason or usage matter here.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

fn messages(request: &GenerateRequest) -> Vec<Msg<'_>> {
    request
        .messages
        .iter()
        .map(|m| Msg {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &m.content,
        })
        .collect()
}

pub(crate) fn build_messages_body(
    config: &ProviderConfig,
    request: &GenerateRequest,
    stream: bool,
) -> Result<String> {
    let sampling = config.sampling.merged_with(&request.sampling);
    let body = MessagesRequest {
        model: request.model.as_deref().unwrap_or(&config.model),
        max_tokens: sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: request.system.as_deref(),
        messages: messages(request),
        temperature: sampling.temperature,
        top_p: sampling.top_p,
        top_k: sampling.top_k,
        stop_sequences: &sampling.stop_sequences,
        stream,
    };
    serde_json::to_string(&body).map_err(|e| Error::parse(format!("serialize request: {e}")))
}

fn parse_messages_response(text: &str) -> Result<GenerateResponse> {
    let resp: MessagesResponse = serde_json::from_str(text)
        .map_err(|e| Error::malformed("anthropic", format!("parse messages response: {e}")))?;
    Ok(GenerateResponse {
        text: resp
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n"),
        model: resp.model,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
        finish_reason: resp.stop_reason.as_deref().map(FinishReason::from_anthropic),
    })
}

fn parse_stream_event(data: &str) -> Result<Option<StreamChunk>> {
    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| Error::malformed("anthropic", format!("parse stream event: {e}")))?;
    Ok(match event {
        StreamEvent::MessageStart { message } => message.usage.map(|u| StreamChunk {
            usage: Some(Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            ..Default::default()
        }),
        StreamEvent::ContentBlockDelta { delta } => delta.text.map(|text| StreamChunk {
            delta: text,
            ..Default::default()
        }),
        StreamEvent::MessageDelta { delta, usage } => Some(StreamChunk {
            delta: String::new(),
            finish_reason: delta.stop_reason.as_deref().map(FinishReason::from_anthropic),
            usage: usage.map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
        }),
        StreamEvent::Error { error } => {
            let kind = match error.kind.as_str() {
                "authentication_error" | "permission_error" => ProviderErrorKind::Auth,
                "rate_limit_error" => ProviderErrorKind::RateLimit,
                _ => ProviderErrorKind::Unavailable,
            };
            return Err(Error::provider("anthropic", kind, error.message));
        }
        StreamEvent::Other => None,
    })
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = HttpClient::new(config.provider.as_str(), config.timeout_ms)?;
        Ok(Self { config, http })
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    fn headers(&self) -> [(&str, &str); 2] {
        [("x-api-key", self.api_key()), ("anthropic-version", API_VERSION)]
    }
}

#[async_trait]
impl ContentGenerator for AnthropicAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse> {
        debug!(model = ?request.model, "sending Anthropic request");
        let body = build_messages_body(&self.config, request, false)?;
        let url = format!("{}/messages", self.config.base_url);
        let text = self
            .http
            .post_json_raw(&url, &body, &self.headers(), cancel)
            .await?;
        parse_messages_response(&text)
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let body = build_messages_body(&self.config, request, true)?;
        let url = format!("{}/messages", self.config.base_url);
        let [key, version] = self.headers();
        let headers = [key, version, ("Accept", "text/event-stream")];
        let response = self.http.post_stream(&url, &body, &headers, cancel).await?;
        Ok(sse::chunk_stream(
            response,
            "anthropic",
            cancel.clone(),
            parse_stream_event,
        ))
    }

    async fn count_tokens(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenCount> {
        let body = serde_json::to_string(&CountRequest {
            model: request.model.as_deref().unwrap_or(&self.config.model),
            system: request.system.as_deref(),
            messages: messages(request),
        })
        .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        let url = format!("{}/messages/count_tokens", self.config.base_url);
        let resp: CountResponse = self
            .http
            .post_json(&url, &body, &self.headers(), cancel)
            .await?;
        Ok(TokenCount {
            total: resp.input_tokens,
            exact: true,
        })
    }

    async fn embed(
        &self,
        _request: &EmbedRequest,
        _cancel: &CancellationToken,
    ) -> Result<Embedding> {
        Err(Error::unsupported("anthropic", "embeddings"))
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        let mut models = Vec::new();
        let mut after_id: Option<String> = None;
        loop {
            let mut url = format!("{}/models?limit={MODEL_PAGE_LIMIT}", self.config.base_url);
            if let Some(id) = &after_id {
                url.push_str("&after_id=");
                url.push_str(id);
            }
            let page: ModelList = self.http.get_json(&url, &self.headers(), cancel).await?;
            let last = page.last_id.or_else(|| page.data.last().map(|m| m.id.clone()));
            models.extend(page.data.into_iter().map(|m| ModelInfo {
                display_name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                provider: ProviderId::Anthropic,
                context_length: Some(200_000),
                capabilities: vec!["chat".into(), "vision".into()],
            }));

            // A cursor that does not advance would loop forever.
            match last {
                Some(id) if page.has_more && after_id.as_deref() != Some(id.as_str()) => {
                    debug!(after_id = %id, "fetching next model page");
                    after_id = Some(id);
                }
                _ => break,
            }
        }
        Ok(models)
    }
}
