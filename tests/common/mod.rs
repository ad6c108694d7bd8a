#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use research_agent::error::{Error, ProviderErrorKind, Result};
use research_agent::llm::{
    ChunkStream, ContentGenerator, EmbedRequest, Embedding, FinishReason, GenerateRequest,
    GenerateResponse, ModelInfo, ProviderId, StreamChunk, TokenCount, Usage, estimate_tokens,
};
use research_agent::tools::{Tool, ToolCategory};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Scripted content generator. Replies are served in order; once the script
/// runs out it answers "reply from <provider>".
pub struct MockAdapter {
    provider: ProviderId,
    models: Vec<String>,
    fail_with: Option<ProviderErrorKind>,
    replies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    last_model: Mutex<Option<String>>,
}

impl MockAdapter {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            models: vec![provider.default_model().to_string()],
            fail_with: None,
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            last_model: Mutex::new(None),
        }
    }

    pub fn failing(mut self, kind: ProviderErrorKind) -> Self {
        self.fail_with = Some(kind);
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_replies(self, replies: &[&str]) -> Self {
        *self.replies.lock().unwrap() = replies.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_model(&self) -> Option<String> {
        self.last_model.lock().unwrap().clone()
    }

    fn begin(&self, request: &GenerateRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_model.lock().unwrap() = request.model.clone();
        if let Some(kind) = self.fail_with {
            return Err(Error::provider(self.provider.as_str(), kind, "scripted failure"));
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("reply from {}", self.provider));
        Ok(reply)
    }
}

#[async_trait]
impl ContentGenerator for MockAdapter {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn default_model(&self) -> &str {
        &self.models[0]
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let text = self.begin(request)?;
        Ok(GenerateResponse {
            usage: Usage {
                input_tokens: estimate_tokens(&request.prompt_text()),
                output_tokens: estimate_tokens(&text),
            },
            text,
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model().to_string()),
            finish_reason: Some(FinishReason::Stop),
        })
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        _cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let text = self.begin(request)?;
        let chunks: Vec<Result<StreamChunk>> = text
            .split_inclusive(' ')
            .map(|w| {
                Ok(StreamChunk {
                    delta: w.to_string(),
                    ..Default::default()
                })
            })
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn count_tokens(
        &self,
        request: &GenerateRequest,
        _cancel: &CancellationToken,
    ) -> Result<TokenCount> {
        self.begin(request)?;
        Ok(TokenCount {
            total: estimate_tokens(&request.prompt_text()),
            exact: false,
        })
    }

    async fn embed(
        &self,
        request: &EmbedRequest,
        _cancel: &CancellationToken,
    ) -> Result<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail_with {
            return Err(Error::provider(self.provider.as_str(), kind, "scripted failure"));
        }
        Ok(Embedding {
            model: request.model.clone().unwrap_or_else(|| "mock-embed".into()),
            values: vec![0.0; 4],
        })
    }

    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<ModelInfo>> {
        Ok(self
            .models
            .iter()
            .map(|m| ModelInfo::new(self.provider, m.as_str()))
            .collect())
    }
}

/// Tool that counts executions and requires a string `text` parameter.
#[derive(Default)]
pub struct CountingTool {
    pub executions: AtomicUsize,
}

impl CountingTool {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "shout"
    }

    fn description(&self) -> &str {
        "Upper-cases text"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Utility
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
    }

    fn validate(&self, params: &Value) -> bool {
        params.get("text").is_some_and(Value::is_string)
    }

    async fn execute(&self, params: Value, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let text = params["text"].as_str().unwrap_or_default();
        Ok(Value::String(text.to_uppercase()))
    }
}

/// Tool whose behaviour is picked by its `mode` parameter.
pub struct UnrulyTool;

#[async_trait]
impl Tool for UnrulyTool {
    fn name(&self) -> &str {
        "unruly"
    }

    fn description(&self) -> &str {
        "Fails in assorted ways"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Utility
    }

    fn version(&self) -> &str {
        "0.3.0"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"mode": {"enum": ["error", "panic", "sleep", "strict"]}}
        })
    }

    fn validate(&self, params: &Value) -> bool {
        if params["mode"] == "strict" {
            // Expects an `items` array and does not check for it.
            return !params["items"].as_array().unwrap().is_empty();
        }
        params.get("mode").is_some_and(Value::is_string)
    }

    async fn execute(&self, params: Value, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        match params["mode"].as_str() {
            Some("error") => anyhow::bail!("disk quota exceeded"),
            Some("panic") => panic!("index out of range"),
            Some("sleep") => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            _ => Ok(json!("ok")),
        }
    }
}

/// Request targets seen by a test server, in arrival order.
pub type SeenTargets = Arc<Mutex<Vec<String>>>;

/// Serve JSON on an ephemeral localhost port, one request per connection.
/// `respond` maps a request target such as `/models?limit=10` to a body.
/// Returns the base URL and the log of request targets.
pub async fn start_json_server<F>(respond: F) -> (String, SeenTargets)
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    let seen = SeenTargets::default();
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let target = read_request_target(&mut socket).await;
            log.lock().unwrap().push(target.clone());
            let body = respond(&target);
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), seen)
}

/// Open an SSE response, send `events` as `data:` frames, then hold the
/// connection open without sending anything else.
pub async fn start_stalling_sse_server(events: Vec<String>) -> String {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request_target(&mut socket).await;
        let mut reply = String::from(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n",
        );
        for event in &events {
            reply.push_str(&format!("data: {event}\n\n"));
        }
        let _ = socket.write_all(reply.as_bytes()).await;
        let _ = socket.flush().await;
        std::future::pending::<()>().await;
    });

    format!("http://{addr}")
}

async fn read_request_target(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head)
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string()
}
