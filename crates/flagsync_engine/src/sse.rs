//! Server-sent events transport for the streaming synchronizer.

use crate::config::StreamingConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::map_error;
use crate::requestor::FDV1_FALLBACK_HEADER;
use crate::streaming::{EventStream, StreamConnector};
use async_trait::async_trait;
use flagsync_protocol::{EventEnvelope, Selector};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

const DEFAULT_EVENT: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub(crate) name: String,
    pub(crate) data: String,
}

impl SseEvent {
    /// Decodes the data field as a protocol event of this name.
    pub(crate) fn into_envelope(self) -> SyncResult<EventEnvelope> {
        let data = serde_json::from_str(&self.data)
            .map_err(|e| SyncError::Protocol(format!("invalid data for {} event: {e}", self.name)))?;
        Ok(EventEnvelope::new(self.name, data))
    }
}

/// Incremental `text/event-stream` parser.
///
/// Bytes may arrive split anywhere, including inside a line.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    name: Option<String>,
    data: Option<String>,
    ready: VecDeque<SseEvent>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds received bytes.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.line(&line);
        }
    }

    /// Takes the next complete event.
    pub(crate) fn next_event(&mut self) -> Option<SseEvent> {
        self.ready.pop_front()
    }

    fn line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.name = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            // id and retry are not used.
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        let name = self.name.take();
        let Some(data) = self.data.take() else {
            return;
        };
        self.ready.push_back(SseEvent {
            name: name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        });
    }
}

/// Connects to the streaming endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct SseConnector {
    config: StreamingConfig,
    client: reqwest::Client,
}

impl SseConnector {
    /// Creates a connector. The connection itself has no overall timeout;
    /// `read_timeout` bounds the silence between chunks instead.
    pub fn new(config: StreamingConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Builds the stream URL for `selector`.
    pub fn stream_url(&self, selector: &Selector) -> SyncResult<String> {
        let base = self.config.base_url.trim_end_matches('/');
        let path = self.config.path.trim_start_matches('/');
        let mut url = reqwest::Url::parse(&format!("{base}/{path}"))
            .map_err(|e| SyncError::transport_fatal(format!("invalid streaming URL: {e}")))?;

        let mut params = Vec::new();
        if !selector.is_empty() {
            params.push(("version", selector.version().to_string()));
            if let Some(state) = selector.state() {
                params.push(("state", state.to_string()));
            }
        }
        if let Some(filter) = self.config.payload_filter.as_deref().filter(|f| !f.is_empty()) {
            params.push(("filter", filter.to_string()));
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.into())
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn connect(&self, selector: &Selector) -> SyncResult<Box<dyn EventStream>> {
        let url = self.stream_url(selector)?;
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "text/event-stream");
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        debug!(url = %url, "opening stream");
        let response = request.send().await.map_err(|e| map_error(&url, e))?;
        if !response.status().is_success() {
            let fdv1_fallback = response
                .headers()
                .get(FDV1_FALLBACK_HEADER)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.eq_ignore_ascii_case("true"));
            return Err(SyncError::HttpStatus {
                status: response.status().as_u16(),
                fdv1_fallback,
            });
        }

        Ok(Box::new(SseStream {
            response,
            url,
            parser: SseParser::new(),
            read_timeout: self.config.read_timeout,
        }))
    }
}

struct SseStream {
    response: reqwest::Response,
    url: String,
    parser: SseParser,
    read_timeout: Duration,
}

#[async_trait]
impl EventStream for SseStream {
    async fn next_event(&mut self) -> Option<SyncResult<EventEnvelope>> {
        loop {
            if let Some(event) = self.parser.next_event() {
                return Some(event.into_envelope());
            }
            match tokio::time::timeout(self.read_timeout, self.response.chunk()).await {
                Err(_) => {
                    return Some(Err(SyncError::Timeout {
                        url: self.url.clone(),
                    }))
                }
                Ok(Err(err)) => return Some(Err(map_error(&self.url, err))),
                Ok(Ok(None)) => return None,
                Ok(Ok(Some(chunk))) => self.parser.feed(&chunk),
            }
        }
    }
}
