use crate::error::{Error, ProviderErrorKind, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP client scoped to a single provider. All failures come back as
/// provider errors labelled with that provider.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    provider: String,
    max_retries: u32,
    base_delay_ms: u64,
}

impl HttpClient {
    pub fn new(provider: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(concat!("research-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("build HTTP client: {e}")))?;

        Ok(Self {
            client,
            provider: provider.into(),
            max_retries: 3,
            base_delay_ms: 1000,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn get_text(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let resp = self
            .send_with_retry(
                || {
                    let mut req = self.client.get(url);
                    for (k, v) in headers {
                        req = req.header(*k, *v);
                    }
                    req
                },
                cancel,
            )
            .await?;
        self.read_body(resp, cancel).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let body = self.get_text(url, headers, cancel).await?;
        self.decode(&body)
    }

    pub async fn post_json_raw(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let resp = self.post(url, body, headers, cancel).await?;
        self.read_body(resp, cancel).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let text = self.post_json_raw(url, body, headers, cancel).await?;
        self.decode(&text)
    }

    /// POST and hand back the open response for server-sent event streaming.
    pub async fn post_stream(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.post(url, body, headers, cancel).await
    }

    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.send_with_retry(
            || {
                let mut req = self
                    .client
                    .post(url)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body.to_string());
                for (k, v) in headers {
                    req = req.header(*k, *v);
                }
                req
            },
            cancel,
        )
        .await
    }

    fn decode<T: DeserializeOwned>(&self, body: &str) -> Result<T> {
        serde_json::from_str(body)
            .map_err(|e| Error::malformed(&self.provider, format!("JSON parse: {e}")))
    }

    async fn read_body(&self, resp: Response, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            text = resp.text() => text.map_err(|e| self.transport_error(&e)),
        }
    }

    /// Only connection failures are retried here. Timeouts and HTTP errors
    /// go straight back to the caller.
    async fn send_with_retry<F>(&self, build: F, cancel: &CancellationToken) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay = self.base_delay_ms;
        let mut attempt = 0;

        loop {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = build().send() => sent,
            };

            match sent {
                Ok(resp) => return self.check_status(resp).await,
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(provider = %self.provider, attempt, "connection failed, will retry");
                    debug!(delay_ms = delay, "backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(Duration::from_millis(delay)) => {}
                    }
                    delay = (delay * 2).min(30_000);
                }
                Err(e) => return Err(self.transport_error(&e)),
            }
        }
    }

    async fn check_status(&self, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        let mut message = format!("HTTP {}: {}", status.as_u16(), truncate_body(&body));
        if let Some(secs) = retry_after {
            message.push_str(&format!(" (retry after {secs}s)"));
        }
        Err(Error::provider(&self.provider, classify_status(status), message))
    }

    fn transport_error(&self, e: &reqwest::Error) -> Error {
        let kind = if e.is_timeout() {
            ProviderErrorKind::Timeout
        } else if e.is_decode() {
            ProviderErrorKind::MalformedResponse
        } else {
            ProviderErrorKind::Unavailable
        };
        Error::provider(&self.provider, kind, e.to_string())
    }
}

/// Map an HTTP status onto the provider error taxonomy.
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderErrorKind::Auth,
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            ProviderErrorKind::RateLimit
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderErrorKind::Timeout,
        _ => ProviderErrorKind::Unavailable,
    }
}

fn truncate_body(body: &str) -> &str {
    const MAX: usize = 500;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
