//! Polling initializer and synchronizer.
//!
//! Every poll feeds the returned events through a fresh
//! `ProtocolStateMachine`. The first change-set, goodbye, or error ends the
//! poll; a response that runs out of events first is invalid.

use crate::config::PollingConfig;
use crate::error::{is_http_error_recoverable, SyncError, SyncResult};
use crate::queue::{HandoffQueue, WaiterMode};
use crate::requestor::{HttpRequestor, PollResponse, Requestor};
use crate::result::{ErrorInfo, ErrorKind, SourceResult};
use crate::source::{Initializer, SelectorSource, ShutdownSignal, Synchronizer};
use async_trait::async_trait;
use flagsync_protocol::{ProtocolAction, ProtocolStateMachine};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

fn failure(info: ErrorInfo, one_shot: bool) -> SourceResult {
    if one_shot {
        SourceResult::terminal_error(info)
    } else {
        SourceResult::interrupted(info)
    }
}

/// Maps a failed request to a result. One-shot failures are always terminal.
fn error_result(err: &SyncError, one_shot: bool) -> SourceResult {
    match err {
        SyncError::HttpStatus { status, .. } => {
            error!(status, "polling request failed with HTTP error");
        }
        SyncError::Protocol(_) => error!(error = %err, "polling response was malformed"),
        _ => error!(error = %err, "polling request failed"),
    }

    let info = err.to_error_info();
    let unrecoverable = matches!(
        err,
        SyncError::HttpStatus { status, .. } if !is_http_error_recoverable(*status)
    );
    let result = if unrecoverable {
        SourceResult::terminal_error(info)
    } else {
        failure(info, one_shot)
    };
    result.with_fdv1_fallback(err.fdv1_fallback())
}

/// Runs the events of one response through the protocol.
fn events_result(response: PollResponse, one_shot: bool) -> SourceResult {
    let fallback = response.fdv1_fallback;
    let mut machine = ProtocolStateMachine::new();

    for event in &response.events {
        let result = match machine.handle(event) {
            ProtocolAction::None => continue,
            ProtocolAction::ChangeSet(changes) => SourceResult::change_set(changes),
            ProtocolAction::Goodbye { reason } => {
                debug!(reason = ?reason, "server sent goodbye");
                SourceResult::goodbye(reason)
            }
            ProtocolAction::ApplicationError { id, reason } => {
                warn!(payload = ?id, %reason, "server reported an error");
                failure(ErrorInfo::new(ErrorKind::Unknown, reason), one_shot)
            }
            ProtocolAction::InternalError { kind, message } => {
                error!(kind = ?kind, %message, "invalid polling response");
                failure(ErrorInfo::new(ErrorKind::InvalidData, message), one_shot)
            }
        };
        return result.with_fdv1_fallback(fallback);
    }

    failure(
        ErrorInfo::new(ErrorKind::InvalidData, "unexpected end of polling response"),
        one_shot,
    )
    .with_fdv1_fallback(fallback)
}

/// Performs one poll and interprets it.
///
/// In continuous mode an empty (not modified) response yields `None`.
async fn poll_once(
    requestor: &dyn Requestor,
    selectors: &dyn SelectorSource,
    one_shot: bool,
) -> Option<SourceResult> {
    let selector = selectors.selector();
    match requestor.poll(&selector).await {
        Ok(response) if response.events.is_empty() && !one_shot => None,
        Ok(response) => Some(events_result(response, one_shot)),
        Err(err) => Some(error_result(&err, one_shot)),
    }
}

/// Obtains initial data with a single poll.
pub struct PollingInitializer {
    requestor: Arc<dyn Requestor>,
    selectors: Arc<dyn SelectorSource>,
    shutdown: ShutdownSignal,
    result: OnceCell<SourceResult>,
}

impl PollingInitializer {
    /// Creates an initializer.
    pub fn new(requestor: Arc<dyn Requestor>, selectors: Arc<dyn SelectorSource>) -> Self {
        Self {
            requestor,
            selectors,
            shutdown: ShutdownSignal::new(),
            result: OnceCell::new(),
        }
    }

    /// Creates an initializer polling over HTTP.
    pub fn from_config(
        config: PollingConfig,
        selectors: Arc<dyn SelectorSource>,
    ) -> SyncResult<Self> {
        let requestor = HttpRequestor::with_reqwest(config)?;
        Ok(Self::new(Arc::new(requestor), selectors))
    }
}

#[async_trait]
impl Initializer for PollingInitializer {
    async fn run(&self) -> SourceResult {
        let poll = async {
            self.result
                .get_or_init(|| async {
                    poll_once(self.requestor.as_ref(), self.selectors.as_ref(), true)
                        .await
                        .unwrap_or_else(|| {
                            SourceResult::terminal_error(ErrorInfo::new(
                                ErrorKind::InvalidData,
                                "unexpected end of polling response",
                            ))
                        })
                })
                .await
                .clone()
        };
        self.shutdown.race(poll).await
    }

    fn close(&self) {
        self.shutdown.complete(SourceResult::shutdown());
    }
}

/// Polls on a fixed interval and delivers each outcome through `next()`.
///
/// Polling starts on the first `next()`, with the first request sent
/// immediately. A terminal outcome stops polling. It is delivered after any
/// results still queued ahead of it and then returned by every later `next()`.
pub struct PollingSynchronizer {
    requestor: Arc<dyn Requestor>,
    selectors: Arc<dyn SelectorSource>,
    poll_interval: Duration,
    queue: HandoffQueue<SourceResult>,
    shutdown: Arc<ShutdownSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingSynchronizer {
    /// Creates a synchronizer.
    pub fn new(
        requestor: Arc<dyn Requestor>,
        selectors: Arc<dyn SelectorSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            requestor,
            selectors,
            // tokio intervals must be non-zero.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            queue: HandoffQueue::new(WaiterMode::Single),
            shutdown: Arc::new(ShutdownSignal::new()),
            task: Mutex::new(None),
        }
    }

    /// Creates a synchronizer polling over HTTP at `config.poll_interval`.
    pub fn from_config(
        config: PollingConfig,
        selectors: Arc<dyn SelectorSource>,
    ) -> SyncResult<Self> {
        let poll_interval = config.poll_interval;
        let requestor = HttpRequestor::with_reqwest(config)?;
        Ok(Self::new(Arc::new(requestor), selectors, poll_interval))
    }

    fn ensure_started(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_completed() {
            return;
        }
        *task = Some(tokio::spawn(poll_loop(
            Arc::clone(&self.requestor),
            Arc::clone(&self.selectors),
            self.poll_interval,
            self.queue.clone(),
            Arc::clone(&self.shutdown),
        )));
    }
}

async fn poll_loop(
    requestor: Arc<dyn Requestor>,
    selectors: Arc<dyn SelectorSource>,
    poll_interval: Duration,
    queue: HandoffQueue<SourceResult>,
    shutdown: Arc<ShutdownSignal>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shutdown.is_completed() {
            break;
        }
        let Some(result) = poll_once(requestor.as_ref(), selectors.as_ref(), false).await else {
            continue;
        };
        // Terminal results are queued behind anything not yet taken.
        let terminal = result.is_terminal();
        queue.put(result);
        if terminal {
            break;
        }
    }
    debug!("polling stopped");
}

#[async_trait]
impl Synchronizer for PollingSynchronizer {
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

impl Drop for PollingSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}
