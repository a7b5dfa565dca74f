//! Data source contracts.
//!
//! An [`Initializer`] produces one result and is done; a [`Synchronizer`]
//! produces a stream of results pulled one at a time with `next()`. Both are
//! closed with `close()`, which always unblocks a pending call with
//! `Shutdown`.

use crate::result::SourceResult;
use async_trait::async_trait;
use flagsync_protocol::Selector;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;

/// A one-shot data source used to obtain initial data.
#[async_trait]
pub trait Initializer: Send + Sync {
    /// Runs the initializer.
    ///
    /// Resolves to a change-set on success and to a terminal status
    /// (`TerminalError` or `Shutdown`) on any failure.
    async fn run(&self) -> SourceResult;

    /// Stops the initializer, resolving a pending `run()` with `Shutdown`.
    fn close(&self);
}

/// A continuous data source.
///
/// Callers keep at most one `next()` outstanding and stop after a terminal
/// result (`Shutdown`, `TerminalError` or `Goodbye`).
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Waits for the next result.
    async fn next(&self) -> SourceResult;

    /// Stops the synchronizer. Idempotent.
    fn close(&self);
}

/// Supplies the selector each request should resume from.
pub trait SelectorSource: Send + Sync {
    /// Returns the current selector.
    fn selector(&self) -> Selector;
}

impl SelectorSource for Selector {
    fn selector(&self) -> Selector {
        self.clone()
    }
}

/// A selector shared between a source and whoever applies its change-sets.
#[derive(Debug, Clone, Default)]
pub struct SharedSelector {
    inner: Arc<RwLock<Selector>>,
}

impl SharedSelector {
    /// Creates a shared selector.
    pub fn new(selector: Selector) -> Self {
        Self {
            inner: Arc::new(RwLock::new(selector)),
        }
    }

    /// Replaces the selector.
    pub fn set(&self, selector: Selector) {
        *self.inner.write() = selector;
    }
}

impl SelectorSource for SharedSelector {
    fn selector(&self) -> Selector {
        self.inner.read().clone()
    }
}

/// A one-time completion that pending calls race against.
///
/// The first `complete` wins; later calls are ignored. Once completed, every
/// `race` resolves to the completion result.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    result: Mutex<Option<SourceResult>>,
    notify: Notify,
}

impl ShutdownSignal {
    /// Creates an uncompleted signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the signal. Returns false if it was already completed.
    pub fn complete(&self, result: SourceResult) -> bool {
        {
            let mut slot = self.result.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.notify.notify_waiters();
        true
    }

    /// Returns true once the signal has been completed.
    pub fn is_completed(&self) -> bool {
        self.result.lock().is_some()
    }

    /// The completion result, if completed.
    pub fn result(&self) -> Option<SourceResult> {
        self.result.lock().clone()
    }

    /// Waits for completion.
    pub async fn wait(&self) -> SourceResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    /// Resolves to `future`'s output, unless the signal is or becomes
    /// completed first, in which case resolves to the completion result.
    pub async fn race<F>(&self, future: F) -> SourceResult
    where
        F: Future<Output = SourceResult>,
    {
        if let Some(result) = self.result() {
            return result;
        }
        tokio::select! {
            biased;
            result = self.wait() => result,
            result = future => result,
        }
    }
}
