//! Filesystem watcher that triggers reloads.
//!
//! Each watched file's parent directory is registered with `notify`; events
//! are forwarded to one named thread, which filters them down to the watched
//! files and coalesces bursts before calling the reload callback.

use crate::error::{SyncError, SyncResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

enum WatchMessage {
    Event(Event),
    Stop,
}

/// A running watcher. Stops on drop.
pub(crate) struct FileWatcher {
    tx: Sender<WatchMessage>,
    thread: Option<JoinHandle<()>>,
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Starts watching `paths`, calling `on_change` after relevant changes.
    pub(crate) fn start<'a, F>(
        paths: impl IntoIterator<Item = &'a PathBuf>,
        quiet_period: Duration,
        on_change: F,
    ) -> SyncResult<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let events = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                // The receiver is gone once the watcher is stopping.
                let _ = events.send(WatchMessage::Event(event));
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        })
        .map_err(|e| SyncError::Watch(e.to_string()))?;

        let mut watched = HashSet::new();
        let mut dirs = HashSet::new();
        for path in paths {
            let absolute = absolute_path(path)?;
            if let Some(dir) = absolute.parent() {
                if dirs.insert(dir.to_path_buf()) {
                    watcher
                        .watch(dir, RecursiveMode::NonRecursive)
                        .map_err(|e| SyncError::Watch(format!("{}: {e}", dir.display())))?;
                }
            }
            watched.insert(absolute);
        }
        debug!(files = watched.len(), "watching flag data files");

        let thread = thread::Builder::new()
            .name("flagsync-file-watcher".to_string())
            .spawn(move || run(rx, watched, quiet_period, on_change))?;

        Ok(Self {
            tx,
            thread: Some(thread),
            _watcher: watcher,
        })
    }

    /// Stops the watcher thread and waits for it to exit.
    pub(crate) fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.tx.send(WatchMessage::Stop);
        if thread.join().is_err() {
            warn!("file watcher thread panicked");
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Canonical form of a possibly not-yet-existing file: canonical parent plus
/// file name, which is how `notify` reports paths under a watched directory.
fn absolute_path(path: &Path) -> SyncResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| SyncError::Watch(format!("{} is not a file path", path.display())))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = parent
        .canonicalize()
        .map_err(|e| SyncError::Watch(format!("{}: {e}", parent.display())))?;
    Ok(parent.join(name))
}

fn is_relevant(event: &Event, watched: &HashSet<PathBuf>) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|path| watched.contains(path))
}

fn run<F: Fn()>(
    rx: Receiver<WatchMessage>,
    watched: HashSet<PathBuf>,
    quiet_period: Duration,
    on_change: F,
) {
    loop {
        match rx.recv() {
            Ok(WatchMessage::Event(event)) if is_relevant(&event, &watched) => {
                // Let a burst of writes settle before reloading once.
                loop {
                    match rx.recv_timeout(quiet_period) {
                        Ok(WatchMessage::Event(_)) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Ok(WatchMessage::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                debug!("flag data files changed, reloading");
                on_change();
            }
            Ok(WatchMessage::Event(_)) => {}
            Ok(WatchMessage::Stop) | Err(_) => return,
        }
    }
}
