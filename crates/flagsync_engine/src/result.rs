//! Outcomes produced by data sources.

use flagsync_protocol::ChangeSet;
use std::time::SystemTime;

/// Broad category of a data source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection failed or timed out.
    NetworkError,
    /// The server returned an error status.
    ErrorResponse,
    /// Data was received but could not be used.
    InvalidData,
    /// The persistent store failed.
    StoreError,
    /// Anything else.
    Unknown,
}

/// Description of a data source failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Failure category.
    pub kind: ErrorKind,
    /// HTTP status, for `ErrorResponse` failures.
    pub status_code: Option<u16>,
    /// Human-readable detail.
    pub message: Option<String>,
    /// When the failure was observed.
    pub time: SystemTime,
}

impl ErrorInfo {
    /// Creates error info stamped with the current time.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: Some(message.into()),
            time: SystemTime::now(),
        }
    }

    /// Creates error info without a message.
    pub fn of_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            status_code: None,
            message: None,
            time: SystemTime::now(),
        }
    }

    /// Creates `ErrorResponse` info for an HTTP status.
    pub fn from_http_status(status: u16) -> Self {
        Self {
            kind: ErrorKind::ErrorResponse,
            status_code: Some(status),
            message: None,
            time: SystemTime::now(),
        }
    }
}

/// Discriminant of a `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceSignal {
    /// See `Status::Interrupted`.
    Interrupted,
    /// See `Status::Shutdown`.
    Shutdown,
    /// See `Status::TerminalError`.
    TerminalError,
    /// See `Status::Goodbye`.
    Goodbye,
}

/// A non-data outcome of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// A transient failure; the source keeps going.
    Interrupted(ErrorInfo),
    /// The source was closed.
    Shutdown,
    /// The source failed and will produce nothing further.
    TerminalError(ErrorInfo),
    /// The server is disconnecting the source.
    Goodbye {
        /// Server-provided reason.
        reason: Option<String>,
    },
}

impl Status {
    /// Returns the discriminant of this status.
    pub fn signal(&self) -> SourceSignal {
        match self {
            Status::Interrupted(_) => SourceSignal::Interrupted,
            Status::Shutdown => SourceSignal::Shutdown,
            Status::TerminalError(_) => SourceSignal::TerminalError,
            Status::Goodbye { .. } => SourceSignal::Goodbye,
        }
    }

    /// Error details, for `Interrupted` and `TerminalError`.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Status::Interrupted(info) | Status::TerminalError(info) => Some(info),
            Status::Shutdown | Status::Goodbye { .. } => None,
        }
    }

    /// The goodbye reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Status::Goodbye { reason } => reason.as_deref(),
            _ => None,
        }
    }

    /// Returns true if the source will produce nothing after this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Interrupted(_))
    }
}

/// What a source produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePayload {
    /// New data.
    ChangeSet(ChangeSet),
    /// A status change.
    Status(Status),
}

/// Discriminant of a `SourcePayload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceResultType {
    /// The result carries a change-set.
    ChangeSet,
    /// The result carries a status.
    Status,
}

/// One result delivered by an initializer or synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResult {
    payload: SourcePayload,
    fdv1_fallback: bool,
}

impl SourceResult {
    fn new(payload: SourcePayload) -> Self {
        Self {
            payload,
            fdv1_fallback: false,
        }
    }

    /// A result carrying new data.
    pub fn change_set(changes: ChangeSet) -> Self {
        Self::new(SourcePayload::ChangeSet(changes))
    }

    /// A transient failure.
    pub fn interrupted(info: ErrorInfo) -> Self {
        Self::new(SourcePayload::Status(Status::Interrupted(info)))
    }

    /// A permanent failure.
    pub fn terminal_error(info: ErrorInfo) -> Self {
        Self::new(SourcePayload::Status(Status::TerminalError(info)))
    }

    /// The source was closed.
    pub fn shutdown() -> Self {
        Self::new(SourcePayload::Status(Status::Shutdown))
    }

    /// The server is disconnecting.
    pub fn goodbye(reason: Option<String>) -> Self {
        Self::new(SourcePayload::Status(Status::Goodbye { reason }))
    }

    /// Sets whether the orchestrator should fall back to FDv1.
    pub fn with_fdv1_fallback(mut self, fdv1_fallback: bool) -> Self {
        self.fdv1_fallback = fdv1_fallback;
        self
    }

    /// Returns whether the orchestrator should fall back to FDv1.
    pub fn fdv1_fallback(&self) -> bool {
        self.fdv1_fallback
    }

    /// Returns the payload.
    pub fn payload(&self) -> &SourcePayload {
        &self.payload
    }

    /// Consumes the result, returning the payload.
    pub fn into_payload(self) -> SourcePayload {
        self.payload
    }

    /// Returns the kind of payload.
    pub fn result_type(&self) -> SourceResultType {
        match self.payload {
            SourcePayload::ChangeSet(_) => SourceResultType::ChangeSet,
            SourcePayload::Status(_) => SourceResultType::Status,
        }
    }

    /// The change-set, if this result carries one.
    pub fn as_change_set(&self) -> Option<&ChangeSet> {
        match &self.payload {
            SourcePayload::ChangeSet(changes) => Some(changes),
            SourcePayload::Status(_) => None,
        }
    }

    /// The status, if this result carries one.
    pub fn status(&self) -> Option<&Status> {
        match &self.payload {
            SourcePayload::ChangeSet(_) => None,
            SourcePayload::Status(status) => Some(status),
        }
    }

    /// Returns true if the caller should stop pulling from the source.
    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(Status::is_terminal)
    }
}
