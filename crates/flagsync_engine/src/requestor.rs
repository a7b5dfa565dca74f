//! Polling requestors.

use crate::config::PollingConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, ReqwestClient};
use async_trait::async_trait;
use flagsync_protocol::{parse_events, EventEnvelope, Selector};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Response header by which the server asks clients to fall back to FDv1.
pub const FDV1_FALLBACK_HEADER: &str = "x-ld-fd-fallback";

/// Events returned by one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResponse {
    /// Events in received order; empty when nothing changed.
    pub events: Vec<EventEnvelope>,
    /// Whether the server asked the client to fall back to FDv1.
    pub fdv1_fallback: bool,
}

impl PollResponse {
    /// Creates a response carrying events.
    pub fn new(events: Vec<EventEnvelope>) -> Self {
        Self {
            events,
            fdv1_fallback: false,
        }
    }

    /// A response for unchanged data.
    pub fn not_modified() -> Self {
        Self::default()
    }

    /// Sets the fallback flag.
    pub fn with_fdv1_fallback(mut self, fdv1_fallback: bool) -> Self {
        self.fdv1_fallback = fdv1_fallback;
        self
    }
}

/// Fetches protocol events for a selector.
#[async_trait]
pub trait Requestor: Send + Sync {
    /// Performs one poll.
    async fn poll(&self, selector: &Selector) -> SyncResult<PollResponse>;
}

/// HTTP polling requestor with per-URI ETag caching.
pub struct HttpRequestor<C: HttpClient> {
    config: PollingConfig,
    client: C,
    etags: Mutex<HashMap<String, String>>,
}

impl<C: HttpClient> HttpRequestor<C> {
    /// Creates a requestor using the given client.
    pub fn new(config: PollingConfig, client: C) -> Self {
        Self {
            config,
            client,
            etags: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Returns the ETag cached for a URL.
    pub fn cached_etag(&self, url: &str) -> Option<String> {
        self.etags.lock().get(url).cloned()
    }

    /// Builds the poll URL for a selector.
    pub fn poll_url(&self, selector: &Selector) -> SyncResult<String> {
        let base = self.config.base_url.trim_end_matches('/');
        let path = self.config.path.trim_start_matches('/');
        let mut url = reqwest::Url::parse(&format!("{base}/{path}"))
            .map_err(|e| SyncError::transport_fatal(format!("invalid polling URL: {e}")))?;

        let mut params = Vec::new();
        if selector.version() > 0 {
            params.push(("version", selector.version().to_string()));
        }
        if let Some(state) = selector.state().filter(|state| !state.is_empty()) {
            params.push(("state", state.to_string()));
        }
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.into())
    }
}

impl HttpRequestor<ReqwestClient> {
    /// Creates a requestor backed by `reqwest`, using the configured timeout.
    pub fn with_reqwest(config: PollingConfig) -> SyncResult<Self> {
        let client = ReqwestClient::new(config.request_timeout)?;
        Ok(Self::new(config, client))
    }
}

#[async_trait]
impl<C: HttpClient> Requestor for HttpRequestor<C> {
    async fn poll(&self, selector: &Selector) -> SyncResult<PollResponse> {
        let url = self.poll_url(selector)?;
        let mut headers = self.config.headers.clone();
        if let Some(etag) = self.cached_etag(&url) {
            headers.push(("If-None-Match".to_string(), etag));
        }

        debug!(url = %url, "polling for flag data");
        let response = self.client.get(&url, &headers).await?;
        let fdv1_fallback = response
            .header(FDV1_FALLBACK_HEADER)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));

        if response.status == 304 {
            debug!(url = %url, "flag data not modified");
            return Ok(PollResponse::not_modified().with_fdv1_fallback(fdv1_fallback));
        }
        if !response.is_success() {
            return Err(SyncError::HttpStatus {
                status: response.status,
                fdv1_fallback,
            });
        }

        {
            let mut etags = self.etags.lock();
            match response.header("etag") {
                Some(etag) => {
                    etags.insert(url.clone(), etag.to_string());
                }
                None => {
                    etags.remove(&url);
                }
            }
        }

        let events = parse_events(&response.body)
            .map_err(|e| SyncError::Protocol(format!("invalid polling response: {e}")))?;
        Ok(PollResponse::new(events).with_fdv1_fallback(fdv1_fallback))
    }
}

/// A scripted requestor for testing.
///
/// Responses are returned in the order they were queued; once the script is
/// exhausted every poll returns `not_modified`.
#[derive(Debug, Default)]
pub struct MockRequestor {
    responses: Mutex<VecDeque<SyncResult<PollResponse>>>,
    polls: Mutex<Vec<Selector>>,
}

impl MockRequestor {
    /// Creates a requestor with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: PollResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a response carrying these events.
    pub fn push_events(&self, events: Vec<EventEnvelope>) {
        self.push_response(PollResponse::new(events));
    }

    /// Queues an error.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Selectors passed to each poll so far.
    pub fn polls(&self) -> Vec<Selector> {
        self.polls.lock().clone()
    }

    /// Number of polls so far.
    pub fn poll_count(&self) -> usize {
        self.polls.lock().len()
    }
}

#[async_trait]
impl Requestor for MockRequestor {
    async fn poll(&self, selector: &Selector) -> SyncResult<PollResponse> {
        self.polls.lock().push(selector.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(PollResponse::not_modified()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;

    /// Replies from a script and records every request.
    #[derive(Default)]
    struct TestClient {
        responses: Mutex<VecDeque<SyncResult<HttpResponse>>>,
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl TestClient {
        fn reply(&self, response: HttpResponse) {
            self.responses.lock().push_back(Ok(response));
        }

        fn fail(&self, error: SyncError) {
            self.responses.lock().push_back(Err(error));
        }

        fn last_request(&self) -> (String, Vec<(String, String)>) {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn get(&self, url: &str, headers: &[(String, String)]) -> SyncResult<HttpResponse> {
            self.requests
                .lock()
                .push((url.to_string(), headers.to_vec()));
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::transport_fatal("no response scripted")))
        }
    }

    const BODY: &str = r#"{"events": [
        {"event": "server-intent", "data": {"payloads": [{"id": "p1", "target": 1, "intentCode": "xfer-full"}]}},
        {"event": "payload-transferred", "data": {"state": "s1", "version": 1}}
    ]}"#;

    fn requestor() -> HttpRequestor<TestClient> {
        HttpRequestor::new(
            PollingConfig::new("https://sdk.example.com/").with_header("Authorization", "key"),
            TestClient::default(),
        )
    }

    fn if_none_match(headers: &[(String, String)]) -> Option<&str> {
        headers
            .iter()
            .find(|(name, _)| name == "If-None-Match")
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn url_carries_selector() {
        let requestor = requestor();
        assert_eq!(
            requestor.poll_url(&Selector::empty()).unwrap(),
            "https://sdk.example.com/sdk/poll"
        );
        assert_eq!(
            requestor.poll_url(&Selector::new(52, "(p:p1:52)")).unwrap(),
            "https://sdk.example.com/sdk/poll?version=52&state=%28p%3Ap1%3A52%29"
        );
        assert_eq!(
            requestor.poll_url(&Selector::new(0, "")).unwrap(),
            "https://sdk.example.com/sdk/poll"
        );
    }

    #[test]
    fn invalid_base_url() {
        let requestor = HttpRequestor::new(PollingConfig::new("not a url"), TestClient::default());
        assert!(matches!(
            requestor.poll_url(&Selector::empty()),
            Err(SyncError::Transport { retryable: false, .. })
        ));
    }

    #[tokio::test]
    async fn parses_events_and_sends_headers() {
        let requestor = requestor();
        requestor.client.reply(HttpResponse::new(200, BODY));

        let response = requestor.poll(&Selector::empty()).await.unwrap();
        assert_eq!(response.events.len(), 2);
        assert!(!response.fdv1_fallback);

        let (_, headers) = requestor.client.last_request();
        assert!(headers.contains(&("Authorization".to_string(), "key".to_string())));
        assert_eq!(if_none_match(&headers), None);
    }

    #[tokio::test]
    async fn etag_is_cached_per_uri_and_cleared() {
        let requestor = requestor();
        let url = requestor.poll_url(&Selector::empty()).unwrap();

        requestor
            .client
            .reply(HttpResponse::new(200, BODY).with_header("ETag", "\"v1\""));
        requestor.poll(&Selector::empty()).await.unwrap();
        assert_eq!(requestor.cached_etag(&url).as_deref(), Some("\"v1\""));

        // A different selector is a different URI.
        requestor.client.reply(HttpResponse::new(200, BODY));
        requestor.poll(&Selector::new(1, "s1")).await.unwrap();
        assert_eq!(if_none_match(&requestor.client.last_request().1), None);

        requestor.client.reply(HttpResponse::new(304, Vec::new()));
        let response = requestor.poll(&Selector::empty()).await.unwrap();
        assert!(response.events.is_empty());
        assert_eq!(
            if_none_match(&requestor.client.last_request().1),
            Some("\"v1\"")
        );

        requestor.client.reply(HttpResponse::new(200, BODY));
        requestor.poll(&Selector::empty()).await.unwrap();
        assert_eq!(requestor.cached_etag(&url), None);
    }

    #[tokio::test]
    async fn error_status_carries_fallback() {
        let requestor = requestor();
        requestor
            .client
            .reply(HttpResponse::new(503, Vec::new()).with_header(FDV1_FALLBACK_HEADER, "true"));

        let err = requestor.poll(&Selector::empty()).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::HttpStatus {
                status: 503,
                fdv1_fallback: true
            }
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_protocol_error() {
        let requestor = requestor();
        requestor.client.reply(HttpResponse::new(200, "{\"items\": []}"));
        let err = requestor.poll(&Selector::empty()).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn timeout_is_distinct() {
        let requestor = requestor();
        requestor.client.fail(SyncError::Timeout {
            url: "https://sdk.example.com/sdk/poll".into(),
        });
        let err = requestor.poll(&Selector::empty()).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
    }

    #[tokio::test]
    async fn mock_requestor_replays_script() {
        let mock = MockRequestor::new();
        mock.push_events(Vec::new());
        mock.push_error(SyncError::transport_retryable("reset"));

        assert!(mock.poll(&Selector::empty()).await.unwrap().events.is_empty());
        assert!(mock.poll(&Selector::new(2, "s")).await.is_err());
        assert_eq!(
            mock.poll(&Selector::empty()).await.unwrap(),
            PollResponse::not_modified()
        );
        assert_eq!(mock.poll_count(), 3);
        assert_eq!(mock.polls()[1], Selector::new(2, "s"));
    }
}
