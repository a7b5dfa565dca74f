//! # flagsync Engine
//!
//! Asynchronous data sources that keep local feature-flag data in sync.
//!
//! This crate provides:
//! - `Initializer` and `Synchronizer` source contracts
//! - `SourceResult`, the change-set or status outcome of a source
//! - `HandoffQueue` and `ShutdownSignal` for bridging producers to `next()`
//! - HTTP polling with ETag caching (`HttpRequestor`, `PollingSynchronizer`)
//! - Server-sent event streaming (`StreamingSynchronizer`, `SseConnector`)
//! - File sources with filesystem watching (`FileSynchronizer`)
//! - An in-memory source for tests (`TestData`)
//!
//! ## Architecture
//!
//! Producers (poll and stream loops, the file watcher thread, test calls)
//! push results into a queue; consumers pull them one at a time:
//!
//! ```text
//! transport -> EventEnvelope -> ProtocolStateMachine -> SourceResult
//!           -> HandoffQueue -> next() / run() -> orchestrator
//! ```
//!
//! ## Key Invariants
//!
//! - `close()` always unblocks a pending `next()` or `run()` with `Shutdown`
//! - After a terminal result a synchronizer produces nothing else
//! - Initializer failures are terminal; synchronizer failures are
//!   `Interrupted` unless they cannot succeed on retry
//! - Results are delivered in the order they were produced

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod error;
mod file;
mod http;
mod polling;
mod queue;
mod requestor;
mod result;
mod source;
mod sse;
mod streaming;
mod test_data;

pub use config::{
    DuplicateKeysHandling, FileSource, FileSourceConfig, PollingConfig, StreamingConfig,
    DEFAULT_POLL_PATH, DEFAULT_STREAM_PATH,
};
pub use error::{is_http_error_recoverable, SyncError, SyncResult};
pub use file::{FileInitializer, FileSynchronizer, FLAG_KIND, SEGMENT_KIND};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use polling::{PollingInitializer, PollingSynchronizer};
pub use queue::{HandoffQueue, WaiterMode};
pub use requestor::{HttpRequestor, MockRequestor, PollResponse, Requestor, FDV1_FALLBACK_HEADER};
pub use result::{
    ErrorInfo, ErrorKind, SourcePayload, SourceResult, SourceResultType, SourceSignal, Status,
};
pub use source::{Initializer, SelectorSource, SharedSelector, ShutdownSignal, Synchronizer};
pub use sse::SseConnector;
pub use streaming::{EventStream, MockConnector, StreamConnector, StreamingSynchronizer};
pub use test_data::{DataSourceState, TestData, TestSynchronizer};
