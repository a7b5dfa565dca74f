//! Error types for protocol decoding.

use thiserror::Error;

/// Result type for protocol decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while decoding protocol input.
///
/// The state machine itself never fails; these errors only come from
/// decoding whole response bodies or individual event payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The body is not valid JSON or does not have the expected shape.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The body is valid JSON but not a list of events.
    #[error("invalid event list: {0}")]
    InvalidEventList(String),

    /// An event type string that the protocol does not define.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Event data could not be deserialized into the shape its type requires.
    #[error("failed to deserialize {event_type}: {source}")]
    InvalidEventData {
        /// The event type whose payload was malformed.
        event_type: String,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Creates an invalid event list error.
    pub fn invalid_event_list(message: impl Into<String>) -> Self {
        Self::InvalidEventList(message.into())
    }
}
