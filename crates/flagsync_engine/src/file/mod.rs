//! File data sources.
//!
//! Both sources read one or more JSON or YAML documents of the form
//!
//! ```json
//! {
//!   "flags": { "<key>": { ...flag object... } },
//!   "flagValues": { "<key>": <value> },
//!   "segments": { "<key>": { ...segment object... } }
//! }
//! ```
//!
//! and produce a single `Full` change-set with an empty selector. Every load
//! stamps the objects with a new version number.

mod loader;
mod watcher;

pub use loader::{FLAG_KIND, SEGMENT_KIND};

use crate::config::FileSourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::{HandoffQueue, WaiterMode};
use crate::result::SourceResult;
use crate::source::{Initializer, ShutdownSignal, Synchronizer};
use async_trait::async_trait;
use flagsync_protocol::ChangeSet;
use loader::DataLoader;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, warn};
use watcher::FileWatcher;

fn load_result(loader: &DataLoader) -> SourceResult {
    match loader.load() {
        Ok(changes) => SourceResult::change_set(changes),
        Err(err) => {
            error!(error = %err, "failed to load flag data files");
            SourceResult::interrupted(err.to_error_info())
        }
    }
}

/// Loads on the blocking pool so file reads never stall a runtime worker.
async fn load_blocking(loader: Arc<DataLoader>) -> SyncResult<ChangeSet> {
    tokio::task::spawn_blocking(move || loader.load())
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
}

/// Loads file data once.
///
/// Any read, parse, or duplicate key failure is a terminal error.
pub struct FileInitializer {
    loader: Arc<DataLoader>,
    shutdown: ShutdownSignal,
    result: OnceCell<SourceResult>,
}

impl FileInitializer {
    /// Creates an initializer. Auto-update settings are ignored.
    pub fn new(config: &FileSourceConfig) -> Self {
        Self {
            loader: Arc::new(DataLoader::new(config)),
            shutdown: ShutdownSignal::new(),
            result: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Initializer for FileInitializer {
    async fn run(&self) -> SourceResult {
        let load = async {
            self.result
                .get_or_init(|| async {
                    match load_blocking(Arc::clone(&self.loader)).await {
                        Ok(changes) => SourceResult::change_set(changes),
                        Err(err) => {
                            error!(error = %err, "failed to load flag data files");
                            SourceResult::terminal_error(err.to_error_info())
                        }
                    }
                })
                .await
                .clone()
        };
        self.shutdown.race(load).await
    }

    fn close(&self) {
        self.shutdown.complete(SourceResult::shutdown());
    }
}

#[derive(Default)]
struct WatchState {
    started: bool,
    watcher: Option<FileWatcher>,
}

/// Loads file data and, with auto-update, reloads whenever a file changes.
///
/// The first `next()` returns the initial load. Load failures are reported as
/// `Interrupted`; a later successful reload recovers. The watcher starts once
/// the initial load is queued, so reloads always follow it.
pub struct FileSynchronizer {
    config: FileSourceConfig,
    loader: Arc<DataLoader>,
    queue: HandoffQueue<SourceResult>,
    shutdown: Arc<ShutdownSignal>,
    state: Arc<Mutex<WatchState>>,
}

impl FileSynchronizer {
    /// Creates a synchronizer. Nothing is read until the first `next()`.
    pub fn new(config: FileSourceConfig) -> Self {
        Self {
            loader: Arc::new(DataLoader::new(&config)),
            config,
            queue: HandoffQueue::new(WaiterMode::Multi),
            shutdown: Arc::new(ShutdownSignal::new()),
            state: Arc::new(Mutex::new(WatchState::default())),
        }
    }

    fn ensure_started(&self) {
        {
            let mut state = self.state.lock();
            if state.started || self.shutdown.is_completed() {
                return;
            }
            state.started = true;
        }

        let loader = Arc::clone(&self.loader);
        let queue = self.queue.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            queue.put(load_result(&loader));
            if config.auto_update {
                start_watcher(&config, loader, queue, &shutdown, &state);
            }
        });
    }

    /// Returns true while a filesystem watcher is running.
    pub fn is_watching(&self) -> bool {
        self.state.lock().watcher.is_some()
    }
}

fn start_watcher(
    config: &FileSourceConfig,
    loader: Arc<DataLoader>,
    queue: HandoffQueue<SourceResult>,
    shutdown: &ShutdownSignal,
    state: &Mutex<WatchState>,
) {
    // Checked under the lock `close` takes, so a watcher is never left behind.
    let mut state = state.lock();
    if shutdown.is_completed() {
        return;
    }
    let started = FileWatcher::start(config.paths(), config.reload_quiet_period, move || {
        queue.put(load_result(&loader))
    });
    match started {
        Ok(watcher) => state.watcher = Some(watcher),
        Err(err) => warn!(error = %err, "auto-update disabled, could not watch flag data files"),
    }
}

#[async_trait]
impl Synchronizer for FileSynchronizer {
    async fn next(&self) -> SourceResult {
        self.ensure_started();
        self.shutdown.race(self.queue.take()).await
    }

    fn close(&self) {
        self.shutdown.complete(SourceResult::shutdown());
        let watcher = self.state.lock().watcher.take();
        if let Some(mut watcher) = watcher {
            watcher.stop();
        }
    }
}

impl Drop for FileSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}
