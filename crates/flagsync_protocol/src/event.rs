//! Protocol event envelopes and typed payloads.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names handled by the protocol.
pub const HANDLED_EVENT_TYPES: [&str; 7] = [
    "server-intent",
    "put-object",
    "delete-object",
    "payload-transferred",
    "error",
    "goodbye",
    "heartbeat",
];

/// The kinds of event defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Declares how the server intends to transfer the payload.
    ServerIntent,
    /// Upsert of one object.
    PutObject,
    /// Deletion of one object.
    DeleteObject,
    /// Marks the end of a transfer.
    PayloadTransferred,
    /// Server-side error affecting the transfer.
    Error,
    /// Server is about to disconnect.
    Goodbye,
    /// Keep-alive.
    Heartbeat,
}

impl EventType {
    /// Returns the wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ServerIntent => HANDLED_EVENT_TYPES[0],
            EventType::PutObject => HANDLED_EVENT_TYPES[1],
            EventType::DeleteObject => HANDLED_EVENT_TYPES[2],
            EventType::PayloadTransferred => HANDLED_EVENT_TYPES[3],
            EventType::Error => HANDLED_EVENT_TYPES[4],
            EventType::Goodbye => HANDLED_EVENT_TYPES[5],
            EventType::Heartbeat => HANDLED_EVENT_TYPES[6],
        }
    }

    /// Looks up an event type by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "server-intent" => Some(EventType::ServerIntent),
            "put-object" => Some(EventType::PutObject),
            "delete-object" => Some(EventType::DeleteObject),
            "payload-transferred" => Some(EventType::PayloadTransferred),
            "error" => Some(EventType::Error),
            "goodbye" => Some(EventType::Goodbye),
            "heartbeat" => Some(EventType::Heartbeat),
            _ => None,
        }
    }
}

/// One inbound protocol unit: an event type and its raw JSON data.
///
/// Streaming transports build envelopes from SSE `event:`/`data:` pairs;
/// polling responses carry them as JSON objects with an `event` (or `type`)
/// field and a `data` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event type name.
    #[serde(rename = "event", alias = "type")]
    pub event_type: String,
    /// The undecoded event data.
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    /// Creates a new envelope.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// How the server intends to transfer a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentCode {
    /// Local data is already current.
    #[serde(rename = "none")]
    None,
    /// The entire data set will be sent.
    #[serde(rename = "xfer-full")]
    TransferFull,
    /// An incremental diff will be sent.
    #[serde(rename = "xfer-changes")]
    TransferChanges,
}

/// The server's intent for one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadIntent {
    /// Payload identifier.
    pub id: String,
    /// Version the transfer will bring the payload to.
    pub target: u64,
    /// Transfer mode; absent codes are reported by the state machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_code: Option<IntentCode>,
    /// Why the server chose this mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PayloadIntent {
    /// Creates a payload intent.
    pub fn new(id: impl Into<String>, target: u64, intent_code: IntentCode) -> Self {
        Self {
            id: id.into(),
            target,
            intent_code: Some(intent_code),
            reason: None,
        }
    }
}

/// `server-intent` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIntent {
    /// Payload intents; only the first one is acted upon.
    pub payloads: Vec<PayloadIntent>,
}

/// `put-object` data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutObject {
    /// Object version.
    pub version: u64,
    /// Object kind.
    pub kind: String,
    /// Object key.
    pub key: String,
    /// The object itself.
    pub object: Value,
}

/// `delete-object` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteObject {
    /// Version of the tombstone.
    pub version: u64,
    /// Object kind.
    pub kind: String,
    /// Object key.
    pub key: String,
}

/// `payload-transferred` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadTransferred {
    /// Payload state; required for a transfer to complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Version of the transferred payload.
    pub version: u64,
}

/// `error` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Payload the error applies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable reason.
    pub reason: String,
}

/// `goodbye` data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Goodbye {
    /// Why the server is disconnecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `server-intent`
    ServerIntent(ServerIntent),
    /// `put-object`
    PutObject(PutObject),
    /// `delete-object`
    DeleteObject(DeleteObject),
    /// `payload-transferred`
    PayloadTransferred(PayloadTransferred),
    /// `error`
    Error(ErrorEvent),
    /// `goodbye`
    Goodbye(Goodbye),
    /// `heartbeat`
    Heartbeat,
}

impl ProtocolEvent {
    /// Decodes an envelope into a typed event.
    pub fn decode(envelope: &EventEnvelope) -> ProtocolResult<Self> {
        let event_type = EventType::from_name(&envelope.event_type)
            .ok_or_else(|| ProtocolError::UnknownEventType(envelope.event_type.clone()))?;

        let event = match event_type {
            EventType::ServerIntent => ProtocolEvent::ServerIntent(decode_data(envelope)?),
            EventType::PutObject => ProtocolEvent::PutObject(decode_data(envelope)?),
            EventType::DeleteObject => ProtocolEvent::DeleteObject(decode_data(envelope)?),
            EventType::PayloadTransferred => {
                ProtocolEvent::PayloadTransferred(decode_data(envelope)?)
            }
            EventType::Error => ProtocolEvent::Error(decode_data(envelope)?),
            EventType::Goodbye => ProtocolEvent::Goodbye(decode_data(envelope)?),
            // Heartbeat data carries nothing we use.
            EventType::Heartbeat => ProtocolEvent::Heartbeat,
        };
        Ok(event)
    }

    /// Returns the type of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            ProtocolEvent::ServerIntent(_) => EventType::ServerIntent,
            ProtocolEvent::PutObject(_) => EventType::PutObject,
            ProtocolEvent::DeleteObject(_) => EventType::DeleteObject,
            ProtocolEvent::PayloadTransferred(_) => EventType::PayloadTransferred,
            ProtocolEvent::Error(_) => EventType::Error,
            ProtocolEvent::Goodbye(_) => EventType::Goodbye,
            ProtocolEvent::Heartbeat => EventType::Heartbeat,
        }
    }

    /// Encodes this event back into an envelope.
    pub fn to_envelope(&self) -> ProtocolResult<EventEnvelope> {
        let data = match self {
            ProtocolEvent::ServerIntent(data) => serde_json::to_value(data)?,
            ProtocolEvent::PutObject(data) => serde_json::to_value(data)?,
            ProtocolEvent::DeleteObject(data) => serde_json::to_value(data)?,
            ProtocolEvent::PayloadTransferred(data) => serde_json::to_value(data)?,
            ProtocolEvent::Error(data) => serde_json::to_value(data)?,
            ProtocolEvent::Goodbye(data) => serde_json::to_value(data)?,
            ProtocolEvent::Heartbeat => Value::Object(serde_json::Map::new()),
        };
        Ok(EventEnvelope::new(self.event_type().as_str(), data))
    }
}

fn decode_data<T: for<'de> Deserialize<'de>>(envelope: &EventEnvelope) -> ProtocolResult<T> {
    T::deserialize(&envelope.data).map_err(|source| ProtocolError::InvalidEventData {
        event_type: envelope.event_type.clone(),
        source,
    })
}

/// Parses a polling response body into event envelopes.
///
/// Accepts either a bare JSON array of envelopes or an object with an
/// `events` array. Null entries are rejected.
pub fn parse_events(body: &[u8]) -> ProtocolResult<Vec<EventEnvelope>> {
    let root: Value = serde_json::from_slice(body)?;
    let items = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ProtocolError::invalid_event_list(
                    "'events' is not an array",
                ))
            }
            None => {
                return Err(ProtocolError::invalid_event_list(
                    "response missing 'events' property",
                ))
            }
        },
        _ => {
            return Err(ProtocolError::invalid_event_list(
                "expected an array or an object",
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            if item.is_null() {
                return Err(ProtocolError::invalid_event_list(format!(
                    "null event at index {index}"
                )));
            }
            Ok(serde_json::from_value(item)?)
        })
        .collect()
}
