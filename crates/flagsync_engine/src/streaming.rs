//! Streaming synchronizer.
//!
//! One long-lived connection feeds a single `ProtocolStateMachine`. The
//! machine is reset whenever a new connection is made, so a transfer cut off
//! by a dropped connection never leaks into the next session. Server errors
//! and malformed events are reported and the connection is kept; a closed or
//! broken connection is reported as `Interrupted` and re-established after
//! the reconnect delay.

use crate::config::StreamingConfig;
use crate::error::{is_http_error_recoverable, SyncError, SyncResult};
use crate::queue::{HandoffQueue, WaiterMode};
use crate::result::{ErrorInfo, ErrorKind, SourceResult};
use crate::source::{SelectorSource, ShutdownSignal, Synchronizer};
use crate::sse::SseConnector;
use async_trait::async_trait;
use flagsync_protocol::{EventEnvelope, ProtocolAction, ProtocolErrorKind, ProtocolStateMachine, Selector};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// An open event stream.
#[async_trait]
pub trait EventStream: Send {
    /// Waits for the next event. `None` means the server closed the stream.
    async fn next_event(&mut self) -> Option<SyncResult<EventEnvelope>>;
}

/// Opens event streams.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connects, resuming from `selector`.
    async fn connect(&self, selector: &Selector) -> SyncResult<Box<dyn EventStream>>;
}

/// How a connection ended.
enum StreamEnd {
    /// Report the result and connect again.
    Reconnect(SourceResult),
    /// Report the result and stop.
    Stop(SourceResult),
}

fn internal_error_kind(kind: ProtocolErrorKind) -> ErrorKind {
    match kind {
        ProtocolErrorKind::InvalidData
        | ProtocolErrorKind::JsonError
        | ProtocolErrorKind::MissingPayload => ErrorKind::InvalidData,
        ProtocolErrorKind::ProtocolError
        | ProtocolErrorKind::UnknownEvent
        | ProtocolErrorKind::Unknown => ErrorKind::Unknown,
    }
}

fn connect_failure(err: &SyncError) -> StreamEnd {
    let info = err.to_error_info();
    let fallback = err.fdv1_fallback();
    match err {
        SyncError::HttpStatus { status, .. } if !is_http_error_recoverable(*status) => {
            error!(status, "streaming connection refused, giving up");
            StreamEnd::Stop(SourceResult::terminal_error(info).with_fdv1_fallback(fallback))
        }
        _ => {
            warn!(error = %err, "streaming connection failed, will retry");
            StreamEnd::Reconnect(SourceResult::interrupted(info).with_fdv1_fallback(fallback))
        }
    }
}

/// Reads one connection until it ends.
async fn read_stream(
    stream: &mut dyn EventStream,
    machine: &mut ProtocolStateMachine,
    queue: &HandoffQueue<SourceResult>,
) -> StreamEnd {
    loop {
        let envelope = match stream.next_event().await {
            Some(Ok(envelope)) => envelope,
            Some(Err(err)) => {
                warn!(error = %err, "streaming connection broken");
                return StreamEnd::Reconnect(SourceResult::interrupted(err.to_error_info()));
            }
            None => {
                debug!("stream closed by server");
                return StreamEnd::Reconnect(SourceResult::interrupted(ErrorInfo::new(
                    ErrorKind::NetworkError,
                    "stream closed by server",
                )));
            }
        };

        match machine.handle(&envelope) {
            ProtocolAction::None => {}
            ProtocolAction::ChangeSet(changes) => queue.put(SourceResult::change_set(changes)),
            ProtocolAction::ApplicationError { id, reason } => {
                error!(payload = ?id, %reason, "server reported an error");
            }
            ProtocolAction::InternalError {
                kind: ProtocolErrorKind::UnknownEvent,
                message,
            } => warn!(%message, "ignoring event"),
            ProtocolAction::InternalError { kind, message } => {
                error!(kind = ?kind, %message, "invalid event on stream");
                queue.put(SourceResult::interrupted(ErrorInfo::new(
                    internal_error_kind(kind),
                    message,
                )));
            }
            ProtocolAction::Goodbye { reason } => {
                debug!(reason = ?reason, "server sent goodbye");
                return StreamEnd::Stop(SourceResult::goodbye(reason));
            }
        }
    }
}

async fn stream_loop(
    connector: Arc<dyn StreamConnector>,
    selectors: Arc<dyn SelectorSource>,
    reconnect_delay: Duration,
    queue: HandoffQueue<SourceResult>,
    shutdown: Arc<ShutdownSignal>,
) {
    let mut machine = ProtocolStateMachine::new();
    loop {
        if shutdown.is_completed() {
            break;
        }
        let selector = selectors.selector();
        let end = match connector.connect(&selector).await {
            Ok(mut stream) => {
                debug!(version = selector.version(), "stream connected");
                machine.reset();
                read_stream(stream.as_mut(), &mut machine, &queue).await
            }
            Err(err) => connect_failure(&err),
        };
        match end {
            StreamEnd::Reconnect(result) => {
                queue.put(result);
                tokio::time::sleep(reconnect_delay).await;
            }
            StreamEnd::Stop(result) => {
                queue.put(result);
                break;
            }
        }
    }
    debug!("streaming stopped");
}

/// Receives protocol events over a persistent connection.
///
/// The connection is opened on the first `next()`. Goodbye and unrecoverable
/// HTTP statuses end the synchronizer after anything queued ahead of them is
/// delivered.
pub struct StreamingSynchronizer {
    connector: Arc<dyn StreamConnector>,
    selectors: Arc<dyn SelectorSource>,
    reconnect_delay: Duration,
    queue: HandoffQueue<SourceResult>,
    shutdown: Arc<ShutdownSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSynchronizer {
    /// Creates a synchronizer.
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        selectors: Arc<dyn SelectorSource>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            connector,
            selectors,
            reconnect_delay,
            queue: HandoffQueue::new(WaiterMode::Single),
            shutdown: Arc::new(ShutdownSignal::new()),
            task: Mutex::new(None),
        }
    }

    /// Creates a synchronizer streaming server-sent events over HTTP.
    pub fn from_config(
        config: StreamingConfig,
        selectors: Arc<dyn SelectorSource>,
    ) -> SyncResult<Self> {
        let reconnect_delay = config.reconnect_delay;
        let connector = SseConnector::new(config)?;
        Ok(Self::new(Arc::new(connector), selectors, reconnect_delay))
    }

    fn ensure_started(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_completed() {
            return;
        }
        *task = Some(tokio::spawn(stream_loop(
            Arc::clone(&self.connector),
            Arc::clone(&self.selectors),
            self.reconnect_delay,
            self.queue.clone(),
            Arc::clone(&self.shutdown),
        )));
    }
}

#[async_trait]
impl Synchronizer for StreamingSynchronizer {
    async fn next(&self) -> SourceResult {
        self.ensure_started();
        let result = self.shutdown.race(self.queue.take()).await;
        if result.is_terminal() {
            self.shutdown.complete(result.clone());
        }
        result
    }

    fn close(&self) {
        self.shutdown.complete(SourceResult::shutdown());
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StreamingSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}

enum Script {
    Connect {
        items: Vec<SyncResult<EventEnvelope>>,
        close: bool,
    },
    Refuse(SyncError),
}

struct ScriptedStream {
    items: VecDeque<SyncResult<EventEnvelope>>,
    close: bool,
}

#[async_trait]
impl EventStream for ScriptedStream {
    async fn next_event(&mut self) -> Option<SyncResult<EventEnvelope>> {
        if let Some(item) = self.items.pop_front() {
            return Some(item);
        }
        if self.close {
            return None;
        }
        std::future::pending().await
    }
}

/// A scripted connector for testing.
///
/// Each `connect` consumes the next scripted connection. Once the script is
/// exhausted, connections open and stay silent.
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    connects: Mutex<Vec<Selector>>,
}

impl MockConnector {
    /// Creates a connector with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a connection that delivers `events` and then stays open.
    pub fn push_open(&self, events: Vec<EventEnvelope>) {
        self.push(events.into_iter().map(Ok).collect(), false);
    }

    /// Queues a connection that delivers `events` and is then closed by the server.
    pub fn push_closed(&self, events: Vec<EventEnvelope>) {
        self.push(events.into_iter().map(Ok).collect(), true);
    }

    /// Queues a connection that delivers `events` and then fails with `error`.
    pub fn push_broken(&self, events: Vec<EventEnvelope>, error: SyncError) {
        let mut items: Vec<_> = events.into_iter().map(Ok).collect();
        items.push(Err(error));
        self.push(items, false);
    }

    /// Queues a failed connection attempt.
    pub fn push_refused(&self, error: SyncError) {
        self.script.lock().push_back(Script::Refuse(error));
    }

    /// Selectors of all connection attempts so far.
    pub fn connects(&self) -> Vec<Selector> {
        self.connects.lock().clone()
    }

    /// Number of connection attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    fn push(&self, items: Vec<SyncResult<EventEnvelope>>, close: bool) {
        self.script
            .lock()
            .push_back(Script::Connect { items, close });
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, selector: &Selector) -> SyncResult<Box<dyn EventStream>> {
        self.connects.lock().push(selector.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(Script::Refuse(error)) => Err(error),
            Some(Script::Connect { items, close }) => Ok(Box::new(ScriptedStream {
                items: items.into(),
                close,
            })),
            None => Ok(Box::new(ScriptedStream {
                items: VecDeque::new(),
                close: false,
            })),
        }
    }
}
