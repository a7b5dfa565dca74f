//! The FDv2 protocol state machine.
//!
//! `ProtocolStateMachine` is a pure reducer: every inbound event is turned
//! into exactly one `ProtocolAction` and nothing else happens. It performs no
//! I/O, never blocks, and is meant to be owned by a single reader per
//! connection (typically a transport's read loop).
//!
//! ```text
//!            server-intent(xfer-full | xfer-changes | none)
//!   Inactive ───────────────────────────────────────────► Accumulating(kind)
//!      ▲                                                     │  ▲
//!      │ reset()                         put / delete / error │  │ payload-transferred
//!      │                                                     ▼  │ (kind becomes Changes)
//!      └──────────────────────────────────────────────── Accumulating(kind)
//! ```

use crate::changeset::{ChangeSet, ChangeSetType, Update};
use crate::error::ProtocolError;
use crate::event::{
    DeleteObject, ErrorEvent, EventEnvelope, IntentCode, PayloadTransferred, ProtocolEvent,
    PutObject, ServerIntent,
};
use crate::selector::Selector;

/// Categories of problems reported through `ProtocolAction::InternalError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    /// Parseable but semantically incomplete, e.g. a missing intent code.
    InvalidData,
    /// Data did not deserialize into the shape its event type requires.
    JsonError,
    /// A server intent without any payloads.
    MissingPayload,
    /// An event that is valid alone but illegal in the current state.
    ProtocolError,
    /// An unrecognized event type.
    UnknownEvent,
    /// A server-reported `error` event.
    Unknown,
}

/// Kind of transfer currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// The server is sending the entire data set.
    Full,
    /// The server is sending incremental changes.
    Changes,
}

/// What the caller should do in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolAction {
    /// Nothing to do.
    None,
    /// A transfer completed; apply this change-set.
    ChangeSet(ChangeSet),
    /// The server reported an error; pending updates were discarded.
    ApplicationError {
        /// Payload the error applies to.
        id: Option<String>,
        /// Server-provided reason.
        reason: String,
    },
    /// The server intends to disconnect.
    Goodbye {
        /// Server-provided reason.
        reason: Option<String>,
    },
    /// Something about the event stream was wrong; log it and continue.
    InternalError {
        /// Error category.
        kind: ProtocolErrorKind,
        /// Description for logs.
        message: String,
    },
}

impl ProtocolAction {
    fn internal_error(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        ProtocolAction::InternalError {
            kind,
            message: message.into(),
        }
    }

    /// Returns the error category if this action reports an error.
    pub fn error_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            ProtocolAction::InternalError { kind, .. } => Some(*kind),
            ProtocolAction::ApplicationError { .. } => Some(ProtocolErrorKind::Unknown),
            ProtocolAction::None | ProtocolAction::ChangeSet(_) | ProtocolAction::Goodbye { .. } => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransferState {
    Inactive,
    Accumulating {
        kind: TransferKind,
        payload_id: String,
        target_version: u64,
    },
}

/// Turns a sequence of protocol events into change-sets and status actions.
///
/// Not internally synchronized: concurrent callers must serialize access.
#[derive(Debug)]
pub struct ProtocolStateMachine {
    state: TransferState,
    updates: Vec<Update>,
}

impl ProtocolStateMachine {
    /// Creates a machine in the inactive state.
    pub fn new() -> Self {
        Self {
            state: TransferState::Inactive,
            updates: Vec::new(),
        }
    }

    /// Decodes and handles one event envelope.
    ///
    /// Unknown event types and undecodable data are reported as
    /// `InternalError` actions and leave the state untouched.
    pub fn handle(&mut self, envelope: &EventEnvelope) -> ProtocolAction {
        match ProtocolEvent::decode(envelope) {
            Ok(event) => self.handle_event(event),
            Err(ProtocolError::UnknownEventType(event_type)) => ProtocolAction::internal_error(
                ProtocolErrorKind::UnknownEvent,
                format!("received an unknown event of type {event_type}"),
            ),
            Err(err) => ProtocolAction::internal_error(
                ProtocolErrorKind::JsonError,
                format!("failed to deserialize {}: {err}", envelope.event_type),
            ),
        }
    }

    /// Handles one decoded event.
    pub fn handle_event(&mut self, event: ProtocolEvent) -> ProtocolAction {
        match event {
            ProtocolEvent::ServerIntent(intent) => self.server_intent(intent),
            ProtocolEvent::PutObject(put) => {
                self.put_object(put);
                ProtocolAction::None
            }
            ProtocolEvent::DeleteObject(delete) => {
                self.delete_object(delete);
                ProtocolAction::None
            }
            ProtocolEvent::PayloadTransferred(transferred) => self.payload_transferred(transferred),
            ProtocolEvent::Error(error) => self.error(error),
            ProtocolEvent::Goodbye(goodbye) => ProtocolAction::Goodbye {
                reason: goodbye.reason,
            },
            ProtocolEvent::Heartbeat => ProtocolAction::None,
        }
    }

    /// Returns to the inactive state, discarding any in-flight transfer.
    ///
    /// Call this whenever the underlying connection is re-established.
    pub fn reset(&mut self) {
        self.state = TransferState::Inactive;
        self.updates.clear();
    }

    /// Returns true if a transfer intent has been established.
    pub fn is_active(&self) -> bool {
        matches!(self.state, TransferState::Accumulating { .. })
    }

    /// Kind of the transfer in progress, if any.
    pub fn transfer_kind(&self) -> Option<TransferKind> {
        match &self.state {
            TransferState::Inactive => None,
            TransferState::Accumulating { kind, .. } => Some(*kind),
        }
    }

    /// Payload id and target version of the transfer in progress, if any.
    pub fn payload(&self) -> Option<(&str, u64)> {
        match &self.state {
            TransferState::Inactive => None,
            TransferState::Accumulating {
                payload_id,
                target_version,
                ..
            } => Some((payload_id.as_str(), *target_version)),
        }
    }

    /// Number of updates accumulated since the last intent or transfer.
    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    fn server_intent(&mut self, intent: ServerIntent) -> ProtocolAction {
        // A new intent always starts a fresh transfer.
        self.updates.clear();

        let Some(payload) = intent.payloads.into_iter().next() else {
            return ProtocolAction::internal_error(
                ProtocolErrorKind::MissingPayload,
                "no payload present in server-intent",
            );
        };
        let Some(intent_code) = payload.intent_code else {
            return ProtocolAction::internal_error(
                ProtocolErrorKind::InvalidData,
                format!("server-intent for payload {} has no intent code", payload.id),
            );
        };

        let kind = match intent_code {
            IntentCode::TransferFull => TransferKind::Full,
            IntentCode::TransferChanges | IntentCode::None => TransferKind::Changes,
        };
        self.state = TransferState::Accumulating {
            kind,
            payload_id: payload.id,
            target_version: payload.target,
        };

        match intent_code {
            IntentCode::None => ProtocolAction::ChangeSet(ChangeSet::none()),
            IntentCode::TransferFull | IntentCode::TransferChanges => ProtocolAction::None,
        }
    }

    fn put_object(&mut self, put: PutObject) {
        if self.is_active() {
            self.updates
                .push(Update::put(put.kind, put.key, put.version, put.object));
        }
    }

    fn delete_object(&mut self, delete: DeleteObject) {
        if self.is_active() {
            self.updates
                .push(Update::delete(delete.kind, delete.key, delete.version));
        }
    }

    fn payload_transferred(&mut self, transferred: PayloadTransferred) -> ProtocolAction {
        let TransferState::Accumulating { kind, .. } = &mut self.state else {
            return ProtocolAction::internal_error(
                ProtocolErrorKind::ProtocolError,
                "payload-transferred without an intent",
            );
        };
        let Some(state) = transferred.state else {
            return ProtocolAction::internal_error(
                ProtocolErrorKind::InvalidData,
                "payload-transferred has no state",
            );
        };

        let change_type = match kind {
            TransferKind::Full => ChangeSetType::Full,
            TransferKind::Changes => ChangeSetType::Partial,
        };
        // Later transfers without a new intent are incremental.
        *kind = TransferKind::Changes;

        let updates = std::mem::take(&mut self.updates);
        ProtocolAction::ChangeSet(ChangeSet::new(
            change_type,
            updates,
            Selector::new(transferred.version, state),
        ))
    }

    fn error(&mut self, error: ErrorEvent) -> ProtocolAction {
        self.updates.clear();
        ProtocolAction::ApplicationError {
            id: error.id,
            reason: error.reason,
        }
    }
}

impl Default for ProtocolStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn intent(code: &str, id: &str, target: u64) -> EventEnvelope {
        EventEnvelope::new(
            "server-intent",
            json!({"payloads": [{"id": id, "target": target, "intentCode": code, "reason": "test"}]}),
        )
    }

    fn put(key: &str, version: u64) -> EventEnvelope {
        EventEnvelope::new(
            "put-object",
            json!({"version": version, "kind": "flag", "key": key, "object": {"key": key}}),
        )
    }

    fn delete(key: &str, version: u64) -> EventEnvelope {
        EventEnvelope::new(
            "delete-object",
            json!({"version": version, "kind": "flag", "key": key}),
        )
    }

    fn transferred(state: &str, version: u64) -> EventEnvelope {
        EventEnvelope::new(
            "payload-transferred",
            json!({"state": state, "version": version}),
        )
    }

    fn expect_change_set(action: ProtocolAction) -> ChangeSet {
        match action {
            ProtocolAction::ChangeSet(changes) => changes,
            other => panic!("expected a change-set, got {other:?}"),
        }
    }

    fn keys(changes: &ChangeSet) -> Vec<&str> {
        changes.updates.iter().map(|u| u.key.as_str()).collect()
    }

    #[test]
    fn none_intent_yields_empty_change_set() {
        let mut machine = ProtocolStateMachine::new();
        let changes = expect_change_set(machine.handle(&intent("none", "p1", 52)));

        assert_eq!(changes, ChangeSet::none());
        assert_eq!(machine.transfer_kind(), Some(TransferKind::Changes));
        assert_eq!(machine.payload(), Some(("p1", 52)));
    }

    #[test]
    fn full_transfer() {
        let mut machine = ProtocolStateMachine::new();
        assert_eq!(machine.handle(&intent("xfer-full", "p1", 52)), ProtocolAction::None);
        assert_eq!(machine.handle(&put("f1", 1)), ProtocolAction::None);
        assert_eq!(machine.handle(&put("f2", 1)), ProtocolAction::None);

        let changes = expect_change_set(machine.handle(&transferred("(p:p1:52)", 52)));
        assert_eq!(changes.change_type, ChangeSetType::Full);
        assert_eq!(keys(&changes), vec!["f1", "f2"]);
        assert_eq!(changes.selector, Selector::new(52, "(p:p1:52)"));
        assert_eq!(machine.pending_updates(), 0);
    }

    #[test]
    fn changes_transfer_is_partial() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-changes", "p1", 52));
        machine.handle(&put("f1", 1));
        machine.handle(&put("f2", 1));

        let changes = expect_change_set(machine.handle(&transferred("(p:p1:52)", 52)));
        assert_eq!(changes.change_type, ChangeSetType::Partial);
        assert_eq!(keys(&changes), vec!["f1", "f2"]);
        assert_eq!(changes.selector, Selector::new(52, "(p:p1:52)"));
    }

    #[test]
    fn deletes_are_tombstones_in_order() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-changes", "p1", 3));
        machine.handle(&put("f1", 2));
        machine.handle(&delete("f1", 3));

        let changes = expect_change_set(machine.handle(&transferred("s", 3)));
        assert!(!changes.updates[0].is_deleted());
        assert!(changes.updates[1].is_deleted());
        assert_eq!(changes.updates[1].version, 3);
    }

    #[test]
    fn transfers_after_the_first_default_to_partial() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        machine.handle(&put("f1", 1));
        let first = expect_change_set(machine.handle(&transferred("s1", 1)));
        assert_eq!(first.change_type, ChangeSetType::Full);

        machine.handle(&put("f1", 2));
        let second = expect_change_set(machine.handle(&transferred("s2", 2)));
        assert_eq!(second.change_type, ChangeSetType::Partial);
        assert_eq!(keys(&second), vec!["f1"]);
        assert_eq!(machine.payload(), Some(("p1", 1)));
    }

    #[test]
    fn second_intent_discards_pending_updates() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        machine.handle(&put("stale", 1));
        machine.handle(&intent("xfer-full", "p2", 2));
        machine.handle(&put("fresh", 2));

        let changes = expect_change_set(machine.handle(&transferred("s", 2)));
        assert_eq!(keys(&changes), vec!["fresh"]);
        assert_eq!(changes.change_type, ChangeSetType::Full);
    }

    #[test]
    fn only_first_payload_is_used() {
        let mut machine = ProtocolStateMachine::new();
        let event = EventEnvelope::new(
            "server-intent",
            json!({"payloads": [
                {"id": "p1", "target": 1, "intentCode": "xfer-changes", "reason": "a"},
                {"id": "p2", "target": 2, "intentCode": "xfer-full", "reason": "b"}
            ]}),
        );
        assert_eq!(machine.handle(&event), ProtocolAction::None);
        assert_eq!(machine.transfer_kind(), Some(TransferKind::Changes));
        assert_eq!(machine.payload(), Some(("p1", 1)));
    }

    #[test]
    fn empty_intent_list_is_missing_payload() {
        let mut machine = ProtocolStateMachine::new();
        let action = machine.handle(&EventEnvelope::new("server-intent", json!({"payloads": []})));
        assert_eq!(action.error_kind(), Some(ProtocolErrorKind::MissingPayload));
        assert!(!machine.is_active());
    }

    #[test]
    fn missing_intent_code_is_invalid_data() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        machine.handle(&put("f1", 1));

        let action = machine.handle(&EventEnvelope::new(
            "server-intent",
            json!({"payloads": [{"id": "p2", "target": 2}]}),
        ));
        assert_eq!(action.error_kind(), Some(ProtocolErrorKind::InvalidData));
        assert_eq!(machine.pending_updates(), 0);
    }

    #[test]
    fn orphan_payload_transferred_is_protocol_error() {
        let mut machine = ProtocolStateMachine::new();
        let action = machine.handle(&transferred("s", 1));
        assert_eq!(action.error_kind(), Some(ProtocolErrorKind::ProtocolError));
        assert!(!machine.is_active());
    }

    #[test]
    fn payload_transferred_without_state_is_invalid_data() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        machine.handle(&put("f1", 1));

        let action = machine.handle(&EventEnvelope::new(
            "payload-transferred",
            json!({"version": 1}),
        ));
        assert_eq!(action.error_kind(), Some(ProtocolErrorKind::InvalidData));
        assert_eq!(machine.pending_updates(), 1);
        assert_eq!(machine.transfer_kind(), Some(TransferKind::Full));
    }

    #[test]
    fn puts_while_inactive_are_ignored() {
        let mut machine = ProtocolStateMachine::new();
        assert_eq!(machine.handle(&put("f1", 1)), ProtocolAction::None);
        assert_eq!(machine.handle(&delete("f1", 2)), ProtocolAction::None);
        assert_eq!(machine.pending_updates(), 0);
    }

    #[test]
    fn error_discards_updates_but_keeps_transfer_kind() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 52));
        machine.handle(&put("f1", 1));
        machine.handle(&put("f2", 1));

        let action = machine.handle(&EventEnvelope::new(
            "error",
            json!({"id": "p1", "reason": "something broke"}),
        ));
        assert_eq!(
            action,
            ProtocolAction::ApplicationError {
                id: Some("p1".into()),
                reason: "something broke".into(),
            }
        );
        assert_eq!(action.error_kind(), Some(ProtocolErrorKind::Unknown));

        machine.handle(&put("f3", 1));
        let changes = expect_change_set(machine.handle(&transferred("(p:p1:52)", 52)));
        assert_eq!(changes.change_type, ChangeSetType::Full);
        assert_eq!(keys(&changes), vec!["f3"]);
    }

    #[test]
    fn goodbye_and_heartbeat_leave_state_alone() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        machine.handle(&put("f1", 1));

        let action = machine.handle(&EventEnvelope::new("goodbye", json!({"reason": "maintenance"})));
        assert_eq!(
            action,
            ProtocolAction::Goodbye {
                reason: Some("maintenance".into())
            }
        );
        assert_eq!(
            machine.handle(&EventEnvelope::new("heartbeat", Value::Null)),
            ProtocolAction::None
        );
        assert_eq!(machine.pending_updates(), 1);
        assert_eq!(machine.transfer_kind(), Some(TransferKind::Full));
    }

    #[test]
    fn unknown_event_is_reported() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        let action = machine.handle(&EventEnvelope::new("surprise", json!({})));
        match action {
            ProtocolAction::InternalError { kind, message } => {
                assert_eq!(kind, ProtocolErrorKind::UnknownEvent);
                assert!(message.contains("surprise"));
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(machine.is_active());
    }

    #[test]
    fn malformed_data_is_json_error() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        let action = machine.handle(&EventEnvelope::new("put-object", json!({"kind": "flag"})));
        match action {
            ProtocolAction::InternalError { kind, message } => {
                assert_eq!(kind, ProtocolErrorKind::JsonError);
                assert!(message.starts_with("failed to deserialize put-object"));
            }
            other => panic!("unexpected action {other:?}"),
        }

        let action = machine.handle(&EventEnvelope::new(
            "server-intent",
            json!({"payloads": [{"id": "p", "target": 1, "intentCode": "xfer-sideways"}]}),
        ));
        assert_eq!(action.error_kind(), Some(ProtocolErrorKind::JsonError));
        assert_eq!(machine.transfer_kind(), Some(TransferKind::Full));
    }

    #[test]
    fn reset_returns_to_inactive() {
        let mut machine = ProtocolStateMachine::new();
        machine.handle(&intent("xfer-full", "p1", 1));
        machine.handle(&put("f1", 1));
        machine.reset();

        assert!(!machine.is_active());
        assert_eq!(machine.pending_updates(), 0);
        assert_eq!(
            machine.handle(&transferred("s", 1)).error_kind(),
            Some(ProtocolErrorKind::ProtocolError)
        );
    }

    proptest! {
        #[test]
        fn updates_are_replayed_in_arrival_order(
            ops in prop::collection::vec((0u8..8, any::<bool>(), 1u64..100), 0..40)
        ) {
            let mut machine = ProtocolStateMachine::new();
            machine.handle(&intent("xfer-changes", "p", 1));

            for (key, is_delete, version) in &ops {
                let key = format!("k{key}");
                let event = if *is_delete { delete(&key, *version) } else { put(&key, *version) };
                prop_assert_eq!(machine.handle(&event), ProtocolAction::None);
            }

            let changes = expect_change_set(machine.handle(&transferred("s", 1)));
            prop_assert_eq!(changes.updates.len(), ops.len());
            for (update, (key, is_delete, version)) in changes.updates.iter().zip(&ops) {
                prop_assert_eq!(&update.key, &format!("k{key}"));
                prop_assert_eq!(update.is_deleted(), *is_delete);
                prop_assert_eq!(update.version, *version);
            }
        }

        #[test]
        fn a_new_intent_always_discards_earlier_updates(
            before in 0usize..20,
            after in 0usize..20,
        ) {
            let mut machine = ProtocolStateMachine::new();
            machine.handle(&intent("xfer-full", "p1", 1));
            for i in 0..before {
                machine.handle(&put(&format!("old{i}"), 1));
            }
            machine.handle(&intent("xfer-full", "p2", 2));
            for i in 0..after {
                machine.handle(&put(&format!("new{i}"), 2));
            }

            let changes = expect_change_set(machine.handle(&transferred("s", 2)));
            prop_assert_eq!(changes.updates.len(), after);
            prop_assert!(changes.updates.iter().all(|u| u.key.starts_with("new")));
        }
    }
}
