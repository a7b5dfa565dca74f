//! Handoff queue between push-style producers and pull-style consumers.
//!
//! Producers (HTTP poll loops, the file watcher thread, test harness calls)
//! `put` items at any time; a consumer `take`s them in order. If a consumer is
//! already waiting, the item goes straight to it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

/// How many consumers may wait on a queue at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterMode {
    /// At most one waiter; a new `take` replaces any earlier waiter.
    Single,
    /// Waiters queue up and are served oldest first.
    Multi,
}

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    mode: WaiterMode,
}

impl<T> Inner<T> {
    /// Hands `item` to the oldest live waiter, or queues it.
    fn deliver(&mut self, mut item: T, to_front: bool) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                // Waiter went away; try the next one.
                Err(returned) => item = returned,
            }
        }
        if to_front {
            self.items.push_front(item);
        } else {
            self.items.push_back(item);
        }
    }
}

/// An unbounded FIFO that hands items directly to waiting consumers.
///
/// Cloning the queue yields another handle to the same queue.
pub struct HandoffQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> HandoffQueue<T> {
    /// Creates an empty queue.
    pub fn new(mode: WaiterMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                mode,
            })),
        }
    }

    /// Returns the waiter mode.
    pub fn mode(&self) -> WaiterMode {
        self.inner.lock().mode
    }

    /// Adds an item, waking the oldest waiting consumer if there is one.
    pub fn put(&self, item: T) {
        self.inner.lock().deliver(item, false);
    }

    /// Removes the next item, waiting for one if the queue is empty.
    ///
    /// Dropping the returned future before it completes loses nothing: an
    /// item already handed to it goes back to the head of the queue.
    pub async fn take(&self) -> T {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.items.pop_front() {
                return item;
            }
            let (tx, rx) = oneshot::channel();
            if inner.mode == WaiterMode::Single {
                inner.waiters.clear();
            }
            inner.waiters.push_back(tx);
            rx
        };

        let mut pending = PendingTake {
            rx,
            inner: &self.inner,
            done: false,
        };
        match (&mut pending.rx).await {
            Ok(item) => {
                pending.done = true;
                item
            }
            // Replaced by a newer waiter; this take never completes.
            Err(_) => std::future::pending().await,
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Returns true if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Number of consumers currently waiting.
    pub fn waiters(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|waiter| !waiter.is_closed())
            .count()
    }
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HandoffQueue")
            .field("mode", &inner.mode)
            .field("items", &inner.items.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// A registered waiter; returns an undelivered item to the queue on drop.
struct PendingTake<'a, T> {
    rx: oneshot::Receiver<T>,
    inner: &'a Mutex<Inner<T>>,
    done: bool,
}

impl<T> Drop for PendingTake<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // After close() no further sends can succeed, so anything we can
        // still receive was handed to us and must be redelivered.
        self.rx.close();
        if let Ok(item) = self.rx.try_recv() {
            self.inner.lock().deliver(item, true);
        }
    }
}
