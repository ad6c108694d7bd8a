use super::sse;
use super::types::*;
use super::{ContentGenerator, ProviderId};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::provider_config::ProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

pub struct GeminiAdapter {
    config: ProviderConfig,
    http: HttpClient,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        }
    }
}

#[derive(Serialize)]
struct CountTokensRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    total_tokens: u32,
}

#[derive(Serialize)]
struct EmbedContentRequest<'a> {
    content: Content<'a>,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    input_token_limit: Option<u32>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

fn contents(request: &GenerateRequest) -> Vec<Content<'_>> {
    request
        .messages
        .iter()
        .map(|m| Content {
            role: Some(match m.role {
                Role::User => "user",
                Role::Assistant => "model",
            }),
            parts: vec![Part { text: &m.content }],
        })
        .collect()
}

pub(crate) fn build_generate_body(
    config: &ProviderConfig,
    request: &GenerateRequest,
) -> Result<String> {
    let sampling = config.sampling.merged_with(&request.sampling);
    let body = GenerateContentRequest {
        contents: contents(request),
        system_instruction: request.system.as_deref().map(|s| Content {
            role: None,
            parts: vec![Part { text: s }],
        }),
        generation_config: GenerationConfig {
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            max_output_tokens: sampling.max_tokens,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
            stop_sequences: &sampling.stop_sequences,
        },
    };
    serde_json::to_string(&body).map_err(|e| Error::parse(format!("serialize request: {e}")))
}

fn decode_response(data: &str) -> Result<GenerateContentResponse> {
    serde_json::from_str(data)
        .map_err(|e| Error::malformed("gemini", format!("parse generateContent response: {e}")))
}

fn candidate_text(candidate: &Candidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|c| {
            c.parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn parse_generate_response(model: &str, text: &str) -> Result<GenerateResponse> {
    let resp = decode_response(text)?;
    let candidate = resp
        .candidates
        .first()
        .ok_or_else(|| Error::malformed("gemini", "response has no candidates"))?;
    Ok(GenerateResponse {
        text: candidate_text(candidate),
        model: resp.model_version.clone().unwrap_or_else(|| model.to_string()),
        usage: resp.usage_metadata.map(Usage::from).unwrap_or_default(),
        finish_reason: candidate.finish_reason.as_deref().map(FinishReason::from_gemini),
    })
}

fn parse_stream_event(data: &str) -> Result<Option<StreamChunk>> {
    let resp = decode_response(data)?;
    let usage = resp.usage_metadata.map(Usage::from);
    let Some(candidate) = resp.candidates.first() else {
        return Ok(usage.map(|u| StreamChunk {
            usage: Some(u),
            ..Default::default()
        }));
    };
    Ok(Some(StreamChunk {
        delta: candidate_text(candidate),
        finish_reason: candidate.finish_reason.as_deref().map(FinishReason::from_gemini),
        usage,
    }))
}

impl GeminiAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = HttpClient::new(config.provider.as_str(), config.timeout_ms)?;
        Ok(Self { config, http })
    }

    fn headers(&self) -> [(&str, &str); 1] {
        [(
            "x-goog-api-key",
            self.config.api_key.as_deref().unwrap_or_default(),
        )]
    }

    fn model<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .unwrap_or(&self.config.model)
            .trim_start_matches("models/")
    }
}

#[async_trait]
impl ContentGenerator for GeminiAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse> {
        let model = self.model(request.model.as_deref());
        debug!(model, "sending Gemini request");
        let body = build_generate_body(&self.config, request)?;
        let url = format!("{}/models/{model}:generateContent", self.config.base_url);
        let text = self
            .http
            .post_json_raw(&url, &body, &self.headers(), cancel)
            .await?;
        parse_generate_response(model, &text)
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let model = self.model(request.model.as_deref());
        let body = build_generate_body(&self.config, request)?;
        let url = format!(
            "{}/models/{model}:streamGenerateContent?alt=sse",
            self.config.base_url
        );
        let response = self
            .http
            .post_stream(&url, &body, &self.headers(), cancel)
            .await?;
        Ok(sse::chunk_stream(
            response,
            "gemini",
            cancel.clone(),
            parse_stream_event,
        ))
    }

    async fn count_tokens(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenCount> {
        let model = self.model(request.model.as_deref());
        let mut all = contents(request);
        if let Some(system) = request.system.as_deref() {
            all.insert(
                0,
                Content {
                    role: Some("user"),
                    parts: vec![Part { text: system }],
                },
            );
        }
        let body = serde_json::to_string(&CountTokensRequest { contents: all })
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        let url = format!("{}/models/{model}:countTokens", self.config.base_url);
        let resp: CountTokensResponse = self
            .http
            .post_json(&url, &body, &self.headers(), cancel)
            .await?;
        Ok(TokenCount {
            total: resp.total_tokens,
            exact: true,
        })
    }

    async fn embed(&self, request: &EmbedRequest, cancel: &CancellationToken) -> Result<Embedding> {
        let model = request
            .model
            .as_deref()
            .unwrap_or(DEFAULT_EMBEDDING_MODEL)
            .trim_start_matches("models/")
            .to_string();
        let body = serde_json::to_string(&EmbedContentRequest {
            content: Content {
                role: None,
                parts: vec![Part {
                    text: &request.input,
                }],
            },
        })
        .map_err(|e| Error::parse(format!("serialize request: {e}")))?;
        let url = format!("{}/models/{model}:embedContent", self.config.base_url);
        let resp: EmbedContentResponse = self
            .http
            .post_json(&url, &body, &self.headers(), cancel)
            .await?;
        Ok(Embedding {
            model,
            values: resp.embedding.values,
        })
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.config.base_url);
        let list: ModelList = self.http.get_json(&url, &self.headers(), cancel).await?;
        Ok(list
            .models
            .into_iter()
            .map(|m| {
                let id = m.name.trim_start_matches("models/").to_string();
                ModelInfo {
                    display_name: m.display_name.unwrap_or_else(|| id.clone()),
                    id,
                    provider: ProviderId::Gemini,
                    context_length: m.input_token_limit,
                    capabilities: m.supported_generation_methods,
                }
            })
            .collect())
    }
}
