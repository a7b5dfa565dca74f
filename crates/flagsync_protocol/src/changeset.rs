//! Accumulated updates and change-sets.

use crate::selector::Selector;
use serde_json::Value;

/// How a change-set relates to the data already held locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSetType {
    /// Replace all local state with these updates.
    Full,
    /// Apply these updates as upserts/deletes over existing state.
    Partial,
    /// No change; local data is already current.
    None,
}

/// A single put (upsert) or delete (tombstone) for one keyed object.
///
/// A tombstone keeps its version but carries no object, so
/// `is_deleted()` holds exactly when `object` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Kind of object, e.g. `flag` or `segment`.
    pub kind: String,
    /// Key of the object within its kind.
    pub key: String,
    /// Version of the object after this update.
    pub version: u64,
    object: Option<Value>,
}

impl Update {
    /// Creates an upsert.
    pub fn put(kind: impl Into<String>, key: impl Into<String>, version: u64, object: Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            version,
            object: Some(object),
        }
    }

    /// Creates a tombstone.
    pub fn delete(kind: impl Into<String>, key: impl Into<String>, version: u64) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            version,
            object: None,
        }
    }

    /// Returns true if this update is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.object.is_none()
    }

    /// The object being put, or `None` for a tombstone.
    pub fn object(&self) -> Option<&Value> {
        self.object.as_ref()
    }

    /// Consumes the update, returning the object being put.
    pub fn into_object(self) -> Option<Value> {
        self.object
    }
}

/// An atomic set of changes produced by one completed transfer.
///
/// Updates are kept in the order they were received; consumers replay them
/// in that order and resolve duplicates by last-write-wins.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Whether this replaces, patches, or leaves local data alone.
    pub change_type: ChangeSetType,
    /// Updates in replay order.
    pub updates: Vec<Update>,
    /// Resumption token for the data after applying this change-set.
    pub selector: Selector,
    /// Environment the data belongs to, when known.
    pub environment_id: Option<String>,
    /// Whether the consumer should write this change-set to persistent storage.
    pub should_persist: bool,
}

impl ChangeSet {
    /// Creates a change-set that persists and has no environment id.
    pub fn new(change_type: ChangeSetType, updates: Vec<Update>, selector: Selector) -> Self {
        Self {
            change_type,
            updates,
            selector,
            environment_id: None,
            should_persist: true,
        }
    }

    /// The "already current" change-set: no updates, empty selector.
    pub fn none() -> Self {
        Self::new(ChangeSetType::None, Vec::new(), Selector::empty())
    }

    /// Creates a full change-set.
    pub fn full(updates: Vec<Update>, selector: Selector) -> Self {
        Self::new(ChangeSetType::Full, updates, selector)
    }

    /// Creates a partial change-set.
    pub fn partial(updates: Vec<Update>, selector: Selector) -> Self {
        Self::new(ChangeSetType::Partial, updates, selector)
    }

    /// Sets the environment id.
    pub fn with_environment_id(mut self, environment_id: impl Into<String>) -> Self {
        self.environment_id = Some(environment_id.into());
        self
    }

    /// Sets whether the change-set should be persisted.
    pub fn with_persist(mut self, should_persist: bool) -> Self {
        self.should_persist = should_persist;
        self
    }

    /// Returns true if there are no updates.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
