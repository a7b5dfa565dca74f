//! # flagsync Protocol
//!
//! FDv2 payload-transfer protocol types and state machine.
//!
//! This crate provides:
//! - `Selector` resumption tokens
//! - `Update` and `ChangeSet` for accumulated changes
//! - Event envelopes and typed event payloads
//! - `ProtocolStateMachine`, the event -> action reducer
//!
//! This is a pure protocol crate with no I/O operations. The state machine is
//! driven by a single caller per connection and never blocks.
//!
//! ## Example
//!
//! ```
//! use flagsync_protocol::{ChangeSetType, EventEnvelope, ProtocolAction, ProtocolStateMachine};
//! use serde_json::json;
//!
//! let mut machine = ProtocolStateMachine::new();
//! let events = [
//!     EventEnvelope::new("server-intent", json!({
//!         "payloads": [{"id": "p1", "target": 52, "intentCode": "xfer-full", "reason": "payload-missing"}]
//!     })),
//!     EventEnvelope::new("put-object", json!({
//!         "version": 1, "kind": "flag", "key": "f1", "object": {"on": true}
//!     })),
//!     EventEnvelope::new("payload-transferred", json!({"state": "(p:p1:52)", "version": 52})),
//! ];
//!
//! let mut last = ProtocolAction::None;
//! for event in &events {
//!     last = machine.handle(event);
//! }
//!
//! match last {
//!     ProtocolAction::ChangeSet(changes) => {
//!         assert_eq!(changes.change_type, ChangeSetType::Full);
//!         assert_eq!(changes.updates.len(), 1);
//!     }
//!     other => panic!("unexpected action {other:?}"),
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod error;
mod event;
mod selector;
mod state_machine;

pub use changeset::{ChangeSet, ChangeSetType, Update};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    parse_events, DeleteObject, ErrorEvent, EventEnvelope, EventType, Goodbye, IntentCode,
    PayloadIntent, PayloadTransferred, ProtocolEvent, PutObject, ServerIntent, HANDLED_EVENT_TYPES,
};
pub use selector::Selector;
pub use state_machine::{ProtocolAction, ProtocolErrorKind, ProtocolStateMachine, TransferKind};
