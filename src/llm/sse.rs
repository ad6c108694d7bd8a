//! Server-sent event framing shared by the streaming adapters.
//!
//! Bytes from the HTTP body are buffered until a blank line closes an event;
//! the `data:` lines of that event are handed to a provider-specific parser.
//! Each pull from the resulting stream is a suspension point and checks the
//! cancellation token first.

use super::types::{ChunkStream, StreamChunk};
use crate::error::{Error, ProviderErrorKind, Result};
use futures::StreamExt;
use futures::stream;
use reqwest::Response;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Marker some providers send as the final data payload.
const DONE: &str = "[DONE]";

/// Incremental SSE framer. Works on raw bytes so multi-byte characters split
/// across network frames survive.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
    }

    /// Next complete event's data payload. Events without data lines
    /// (comments, keep-alives) are skipped.
    pub fn next_event(&mut self) -> Option<String> {
        loop {
            let end = self.buf.windows(2).position(|w| w == b"\n\n")?;
            let raw: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(data) = data_payload(&raw[..end]) {
                return Some(data);
            }
        }
    }

    /// Whatever is left once the body ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        data_payload(&raw)
    }
}

fn data_payload(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

struct StreamState<F> {
    body: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    sse: SseBuffer,
    parse: F,
    cancel: CancellationToken,
    provider: String,
    finished: bool,
}

/// Turn an open SSE response into a chunk stream. `parse` maps one event's
/// data payload to a chunk; `Ok(None)` skips the event.
pub fn chunk_stream<F>(
    response: Response,
    provider: impl Into<String>,
    cancel: CancellationToken,
    parse: F,
) -> ChunkStream
where
    F: FnMut(&str) -> Result<Option<StreamChunk>> + Send + 'static,
{
    let state = StreamState {
        body: response
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()))
            .boxed(),
        sse: SseBuffer::default(),
        parse,
        cancel,
        provider: provider.into(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            if let Some(data) = st.sse.next_event() {
                match handle_event(&mut st, &data) {
                    Some(item) => return Some((item, st)),
                    None if st.finished => return None,
                    None => continue,
                }
            }

            let next = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => {
                    st.finished = true;
                    return Some((Err(Error::Cancelled), st));
                }
                next = st.body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => st.sse.push(&bytes),
                Some(Err(e)) => {
                    st.finished = true;
                    let kind = if e.is_timeout() {
                        ProviderErrorKind::Timeout
                    } else {
                        ProviderErrorKind::Unavailable
                    };
                    let err = Error::provider(&st.provider, kind, format!("stream read: {e}"));
                    return Some((Err(err), st));
                }
                None => {
                    st.finished = true;
                    let item = st.sse.finish().and_then(|data| handle_event(&mut st, &data));
                    return item.map(|item| (item, st));
                }
            }
        }
    })
    .boxed()
}

fn handle_event<F>(st: &mut StreamState<F>, data: &str) -> Option<Result<StreamChunk>>
where
    F: FnMut(&str) -> Result<Option<StreamChunk>>,
{
    if data.trim() == DONE {
        debug!(provider = %st.provider, "stream finished");
        st.finished = true;
        return None;
    }
    match (st.parse)(data) {
        Ok(Some(chunk)) => Some(Ok(chunk)),
        Ok(None) => None,
        Err(e) => {
            st.finished = true;
            Some(Err(e))
        }
    }
}
