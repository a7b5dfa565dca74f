//! Configuration for data sources.

use std::path::PathBuf;
use std::time::Duration;

/// Default polling endpoint path.
pub const DEFAULT_POLL_PATH: &str = "/sdk/poll";

/// Default streaming endpoint path.
pub const DEFAULT_STREAM_PATH: &str = "/sdk/stream";

/// Configuration for polling data sources.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Base URL of the polling service (e.g., "https://sdk.example.com").
    pub base_url: String,
    /// Path of the polling endpoint.
    pub path: String,
    /// Time between polls for a synchronizer.
    pub poll_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Extra headers sent with every request (e.g., authorization).
    pub headers: Vec<(String, String)>,
}

impl PollingConfig {
    /// Creates a new polling configuration.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: DEFAULT_POLL_PATH.to_string(),
            poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            headers: Vec::new(),
        }
    }

    /// Sets the endpoint path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for the streaming data source.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Base URL of the streaming service.
    pub base_url: String,
    /// Path of the streaming endpoint.
    pub path: String,
    /// Wait between a dropped connection and the next attempt.
    pub reconnect_delay: Duration,
    /// A connection that sends nothing for this long is considered dead.
    pub read_timeout: Duration,
    /// Extra headers sent when connecting.
    pub headers: Vec<(String, String)>,
    /// Payload filter key sent as the `filter` query parameter.
    pub payload_filter: Option<String>,
}

impl StreamingConfig {
    /// Creates a new streaming configuration.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: DEFAULT_STREAM_PATH.to_string(),
            reconnect_delay: Duration::from_secs(1),
            read_timeout: Duration::from_secs(300),
            headers: Vec::new(),
            payload_filter: None,
        }
    }

    /// Sets the endpoint path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the dead-connection timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Adds a header sent when connecting.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the payload filter.
    pub fn with_payload_filter(mut self, filter: impl Into<String>) -> Self {
        self.payload_filter = Some(filter.into());
        self
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// What to do when the same key appears in more than one file source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateKeysHandling {
    /// Fail the load.
    #[default]
    Fail,
    /// Keep the first definition.
    Ignore,
}

/// Where a file data source reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// A file on disk; watched when auto-update is on.
    Path(PathBuf),
    /// Data embedded in the program; never watched.
    Resource {
        /// Name used in error messages.
        name: String,
        /// The JSON or YAML document.
        contents: String,
    },
}

impl FileSource {
    /// A file on disk.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Embedded data.
    pub fn resource(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self::Resource {
            name: name.into(),
            contents: contents.into(),
        }
    }

    /// Name used to identify this source in errors.
    pub fn name(&self) -> String {
        match self {
            FileSource::Path(path) => path.display().to_string(),
            FileSource::Resource { name, .. } => name.clone(),
        }
    }
}

/// Configuration for file data sources.
#[derive(Debug, Clone)]
pub struct FileSourceConfig {
    /// Sources, in priority order.
    pub sources: Vec<FileSource>,
    /// Reload when a source file changes.
    pub auto_update: bool,
    /// Duplicate key policy.
    pub duplicate_keys: DuplicateKeysHandling,
    /// Whether produced change-sets should be persisted.
    pub should_persist: bool,
    /// How long the watcher waits for further events before reloading.
    pub reload_quiet_period: Duration,
}

impl FileSourceConfig {
    /// Creates a configuration reading the given sources.
    pub fn new(sources: Vec<FileSource>) -> Self {
        Self {
            sources,
            auto_update: false,
            duplicate_keys: DuplicateKeysHandling::Fail,
            should_persist: true,
            reload_quiet_period: Duration::from_millis(100),
        }
    }

    /// Adds a source.
    pub fn with_source(mut self, source: FileSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Enables or disables auto-update.
    pub fn with_auto_update(mut self, auto_update: bool) -> Self {
        self.auto_update = auto_update;
        self
    }

    /// Sets the duplicate key policy.
    pub fn with_duplicate_keys(mut self, handling: DuplicateKeysHandling) -> Self {
        self.duplicate_keys = handling;
        self
    }

    /// Sets whether produced change-sets should be persisted.
    pub fn with_persist(mut self, should_persist: bool) -> Self {
        self.should_persist = should_persist;
        self
    }

    /// Sets the watcher quiet period.
    pub fn with_reload_quiet_period(mut self, period: Duration) -> Self {
        self.reload_quiet_period = period;
        self
    }

    /// Paths of all on-disk sources.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.sources.iter().filter_map(|source| match source {
            FileSource::Path(path) => Some(path),
            FileSource::Resource { .. } => None,
        })
    }
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_config_builder() {
        let config = StreamingConfig::new("https://stream.example.com")
            .with_reconnect_delay(Duration::from_millis(250))
            .with_payload_filter("mobile")
            .with_header("Authorization", "sdk-key");

        assert_eq!(config.path, DEFAULT_STREAM_PATH);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.read_timeout, Duration::from_secs(300));
        assert_eq!(config.payload_filter.as_deref(), Some("mobile"));
        assert_eq!(config.headers.len(), 1);
    }

    #[test]
    fn polling_config_builder() {
        let config = PollingConfig::new("https://sdk.example.com")
            .with_poll_interval(Duration::from_secs(60))
            .with_request_timeout(Duration::from_secs(5))
            .with_header("Authorization", "sdk-key");

        assert_eq!(config.base_url, "https://sdk.example.com");
        assert_eq!(config.path, DEFAULT_POLL_PATH);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.headers,
            vec![("Authorization".to_string(), "sdk-key".to_string())]
        );
    }

    #[test]
    fn polling_config_defaults() {
        let config = PollingConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.headers.is_empty());
    }

    #[test]
    fn file_config_builder() {
        let config = FileSourceConfig::new(vec![FileSource::path("/tmp/flags.json")])
            .with_source(FileSource::resource("builtin", "{}"))
            .with_auto_update(true)
            .with_duplicate_keys(DuplicateKeysHandling::Ignore)
            .with_persist(false);

        assert_eq!(config.sources.len(), 2);
        assert!(config.auto_update);
        assert_eq!(config.duplicate_keys, DuplicateKeysHandling::Ignore);
        assert!(!config.should_persist);
        assert_eq!(config.reload_quiet_period, Duration::from_millis(100));
        assert_eq!(config.paths().count(), 1);
        assert_eq!(config.sources[1].name(), "builtin");
    }
}
