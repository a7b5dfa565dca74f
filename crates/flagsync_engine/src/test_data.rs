//! In-memory data source for tests.
//!
//! A [`TestData`] holds flag data that test code changes directly. Any number
//! of [`TestSynchronizer`]s can be created from it; each change is pushed to
//! all of them, and the changing call waits until every open synchronizer has
//! handed the change out through `next()`.

use crate::file::FLAG_KIND;
use crate::queue::{HandoffQueue, WaiterMode};
use crate::result::{ErrorInfo, ErrorKind, SourceResult};
use crate::source::{ShutdownSignal, Synchronizer};
use async_trait::async_trait;
use flagsync_protocol::{ChangeSet, Selector, Update};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Data source state reported through [`TestData::update_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSourceState {
    /// Not yet initialized.
    Initializing,
    /// Working normally.
    Valid,
    /// Temporarily failing.
    Interrupted,
    /// Permanently stopped.
    Off,
}

#[derive(Debug, Clone)]
struct Item {
    version: u64,
    object: Option<Value>,
}

struct Queued {
    result: SourceResult,
    delivered: Option<oneshot::Sender<()>>,
}

struct Instance {
    queue: HandoffQueue<Queued>,
    shutdown: ShutdownSignal,
    initialized: AtomicBool,
}

struct Inner {
    items: BTreeMap<String, Item>,
    instances: Vec<Arc<Instance>>,
    should_persist: bool,
}

impl Inner {
    fn snapshot(&self) -> ChangeSet {
        let updates = self
            .items
            .iter()
            .map(|(key, item)| match &item.object {
                Some(object) => Update::put(FLAG_KIND, key, item.version, object.clone()),
                None => Update::delete(FLAG_KIND, key, item.version),
            })
            .collect();
        ChangeSet::full(updates, Selector::empty()).with_persist(self.should_persist)
    }

    fn next_version(&self, key: &str) -> u64 {
        self.items.get(key).map_or(0, |item| item.version) + 1
    }

    /// Queues `result` on every open instance, returning what to wait on.
    fn broadcast(&self, result: SourceResult) -> Vec<(oneshot::Receiver<()>, Arc<Instance>)> {
        self.instances
            .iter()
            .filter(|instance| !instance.shutdown.is_completed())
            .map(|instance| {
                let (tx, rx) = oneshot::channel();
                instance.queue.put(Queued {
                    result: result.clone(),
                    delivered: Some(tx),
                });
                (rx, Arc::clone(instance))
            })
            .collect()
    }
}

/// Shared, mutable flag data feeding test synchronizers.
///
/// Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct TestData {
    inner: Arc<Mutex<Inner>>,
}

impl TestData {
    /// Creates an empty data set.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                items: BTreeMap::new(),
                instances: Vec::new(),
                should_persist: true,
            })),
        }
    }

    /// Creates a synchronizer fed by this data.
    pub fn synchronizer(&self) -> TestSynchronizer {
        let instance = Arc::new(Instance {
            queue: HandoffQueue::new(WaiterMode::Single),
            shutdown: ShutdownSignal::new(),
            initialized: AtomicBool::new(false),
        });
        self.inner.lock().instances.push(Arc::clone(&instance));
        TestSynchronizer {
            data: self.clone(),
            instance,
        }
    }

    /// Sets whether change-sets produced from now on should be persisted.
    pub fn should_persist(&self, should_persist: bool) {
        self.inner.lock().should_persist = should_persist;
    }

    /// Sets a flag, bumping its version, and waits for delivery.
    ///
    /// If `object` is a JSON object its `key` and `version` fields are set.
    pub async fn update(&self, key: impl Into<String>, object: Value) {
        let key = key.into();
        let waits = {
            let mut inner = self.inner.lock();
            let version = inner.next_version(&key);
            let object = stamp(object, &key, version);
            inner.items.insert(
                key.clone(),
                Item {
                    version,
                    object: Some(object.clone()),
                },
            );
            let changes = ChangeSet::partial(
                vec![Update::put(FLAG_KIND, key, version, object)],
                Selector::empty(),
            )
            .with_persist(inner.should_persist);
            inner.broadcast(SourceResult::change_set(changes))
        };
        wait_for_delivery(waits).await;
    }

    /// Deletes a flag, leaving a tombstone, and waits for delivery.
    pub async fn delete(&self, key: impl Into<String>) {
        let key = key.into();
        let waits = {
            let mut inner = self.inner.lock();
            let version = inner.next_version(&key);
            inner.items.insert(
                key.clone(),
                Item {
                    version,
                    object: None,
                },
            );
            let changes = ChangeSet::partial(
                vec![Update::delete(FLAG_KIND, key, version)],
                Selector::empty(),
            )
            .with_persist(inner.should_persist);
            inner.broadcast(SourceResult::change_set(changes))
        };
        wait_for_delivery(waits).await;
    }

    /// Reports a status change to every synchronizer and waits for delivery.
    ///
    /// `Off` becomes `TerminalError` when `error` is given and `Shutdown`
    /// otherwise; `Interrupted` becomes `Interrupted`. `Initializing` and
    /// `Valid` produce nothing.
    pub async fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        let result = match (state, error) {
            (DataSourceState::Off, Some(info)) => SourceResult::terminal_error(info),
            (DataSourceState::Off, None) => SourceResult::shutdown(),
            (DataSourceState::Interrupted, info) => SourceResult::interrupted(
                info.unwrap_or_else(|| ErrorInfo::of_kind(ErrorKind::Unknown)),
            ),
            (DataSourceState::Initializing | DataSourceState::Valid, _) => return,
        };
        let waits = self.inner.lock().broadcast(result);
        wait_for_delivery(waits).await;
    }

    /// A full change-set of the current data.
    pub fn snapshot(&self) -> ChangeSet {
        self.inner.lock().snapshot()
    }

    fn remove(&self, instance: &Arc<Instance>) {
        self.inner
            .lock()
            .instances
            .retain(|other| !Arc::ptr_eq(other, instance));
    }
}

impl Default for TestData {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp(object: Value, key: &str, version: u64) -> Value {
    match object {
        Value::Object(mut map) => {
            map.insert("key".to_string(), Value::String(key.to_string()));
            map.insert("version".to_string(), Value::from(version));
            Value::Object(map)
        }
        other => other,
    }
}

/// Waits until each instance has delivered its copy or shut down.
async fn wait_for_delivery(waits: Vec<(oneshot::Receiver<()>, Arc<Instance>)>) {
    for (delivered, instance) in waits {
        tokio::select! {
            _ = delivered => {}
            _ = instance.shutdown.wait() => {}
        }
    }
}

/// A synchronizer fed by a [`TestData`].
///
/// The first `next()` returns a full snapshot of the data at that moment.
/// Changes made between creating the synchronizer and that first `next()`
/// are already in the snapshot and are still delivered again afterwards;
/// they carry the same versions, so applying them twice changes nothing.
pub struct TestSynchronizer {
    data: TestData,
    instance: Arc<Instance>,
}

#[async_trait]
impl Synchronizer for TestSynchronizer {
    async fn next(&self) -> SourceResult {
        let instance = &self.instance;
        if !instance.shutdown.is_completed() && !instance.initialized.swap(true, Ordering::SeqCst) {
            return SourceResult::change_set(self.data.snapshot());
        }
        let result = instance
            .shutdown
            .race(async {
                let queued = instance.queue.take().await;
                if let Some(delivered) = queued.delivered {
                    let _ = delivered.send(());
                }
                queued.result
            })
            .await;
        if result.is_terminal() {
            instance.shutdown.complete(result.clone());
        }
        result
    }

    fn close(&self) {
        self.instance.shutdown.complete(SourceResult::shutdown());
        self.data.remove(&self.instance);
    }
}

impl Drop for TestSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{SourcePayload, SourceSignal, Status};
    use flagsync_protocol::ChangeSetType;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn change_set(result: SourceResult) -> ChangeSet {
        match result.into_payload() {
            SourcePayload::ChangeSet(changes) => changes,
            other => panic!("expected a change-set, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_next_is_a_full_snapshot() {
        let data = TestData::new();
        data.update("f1", json!({"on": true})).await;
        data.delete("f2").await;

        let sync = data.synchronizer();
        let changes = change_set(sync.next().await);
        assert_eq!(changes.change_type, ChangeSetType::Full);
        assert_eq!(changes.updates.len(), 2);
        assert_eq!(
            changes.updates[0].object(),
            Some(&json!({"on": true, "key": "f1", "version": 1}))
        );
        assert!(changes.updates[1].is_deleted());
    }

    #[tokio::test]
    async fn update_waits_for_delivery() {
        let data = TestData::new();
        let sync = data.synchronizer();
        change_set(sync.next().await);

        let updater = {
            let data = data.clone();
            tokio::spawn(async move { data.update("f1", json!(true)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!updater.is_finished());

        let changes = change_set(timeout(WAIT, sync.next()).await.unwrap());
        assert_eq!(changes.change_type, ChangeSetType::Partial);
        assert_eq!(changes.updates[0].key, "f1");
        assert_eq!(changes.updates[0].version, 1);
        timeout(WAIT, updater).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn changes_before_first_next_follow_the_snapshot() {
        let data = TestData::new();
        let sync = data.synchronizer();
        let updater = {
            let data = data.clone();
            tokio::spawn(async move { data.update("f1", json!({"on": true})).await })
        };
        timeout(WAIT, async {
            while data.snapshot().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = change_set(sync.next().await);
        assert_eq!(snapshot.change_type, ChangeSetType::Full);
        assert_eq!(snapshot.updates[0].version, 1);

        let repeated = change_set(timeout(WAIT, sync.next()).await.unwrap());
        assert_eq!(repeated.change_type, ChangeSetType::Partial);
        assert_eq!(repeated.updates, snapshot.updates);
        timeout(WAIT, updater).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn versions_increase_per_key() {
        let data = TestData::new();
        data.update("f1", json!({})).await;
        data.update("f1", json!({})).await;
        data.delete("f1").await;

        let snapshot = data.snapshot();
        assert_eq!(snapshot.updates.len(), 1);
        assert_eq!(snapshot.updates[0].version, 3);
        assert!(snapshot.updates[0].is_deleted());
    }

    #[tokio::test]
    async fn closed_synchronizer_does_not_block_updates() {
        let data = TestData::new();
        let open = Arc::new(data.synchronizer());
        let closed = data.synchronizer();
        change_set(open.next().await);
        closed.close();

        let reader = {
            let open = Arc::clone(&open);
            tokio::spawn(async move { open.next().await })
        };
        timeout(WAIT, data.update("f1", json!(1))).await.unwrap();
        let changes = change_set(reader.await.unwrap());
        assert_eq!(changes.updates[0].key, "f1");
        assert_eq!(closed.next().await, SourceResult::shutdown());
    }

    #[tokio::test]
    async fn close_unblocks_pending_update() {
        let data = TestData::new();
        let sync = data.synchronizer();
        change_set(sync.next().await);

        let updater = {
            let data = data.clone();
            tokio::spawn(async move { data.update("f1", json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sync.close();
        timeout(WAIT, updater).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_mapping() {
        let data = TestData::new();
        let sync = Arc::new(data.synchronizer());
        change_set(sync.next().await);

        let reader = |sync: &Arc<TestSynchronizer>| {
            let sync = Arc::clone(sync);
            tokio::spawn(async move { sync.next().await })
        };

        let pending = reader(&sync);
        data.update_status(DataSourceState::Interrupted, None).await;
        let result = pending.await.unwrap();
        let status = result.status().unwrap();
        assert_eq!(status.signal(), SourceSignal::Interrupted);
        assert_eq!(status.error_info().map(|i| i.kind), Some(ErrorKind::Unknown));

        // Produces nothing, so returns immediately.
        timeout(WAIT, data.update_status(DataSourceState::Valid, None))
            .await
            .unwrap();

        let pending = reader(&sync);
        data.update_status(
            DataSourceState::Off,
            Some(ErrorInfo::new(ErrorKind::ErrorResponse, "gone")),
        )
        .await;
        let result = pending.await.unwrap();
        assert_eq!(
            result.status().map(Status::signal),
            Some(SourceSignal::TerminalError)
        );

        sync.close();
        let other = data.synchronizer();
        change_set(other.next().await);
        let waiting = tokio::spawn({
            let data = data.clone();
            async move { data.update_status(DataSourceState::Off, None).await }
        });
        assert_eq!(timeout(WAIT, other.next()).await.unwrap(), SourceResult::shutdown());
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn persist_flag_applies_to_new_change_sets() {
        let data = TestData::new();
        data.should_persist(false);
        let sync = data.synchronizer();
        assert!(!change_set(sync.next().await).should_persist);
    }
}
