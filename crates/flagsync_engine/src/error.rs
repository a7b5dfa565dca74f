//! Error types for the sync engine.

use crate::result::{ErrorInfo, ErrorKind};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while fetching or loading flag data.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The request did not complete in time.
    #[error("request to {url} timed out")]
    Timeout {
        /// URL being requested.
        url: String,
    },

    /// The server answered with a non-success status.
    #[error("HTTP error {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Whether the server asked the client to fall back to FDv1.
        fdv1_fallback: bool,
    },

    /// Protocol error (malformed response body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A file data source could not be read or parsed.
    #[error("{source_name}: {message}")]
    FileData {
        /// Path or resource name of the source.
        source_name: String,
        /// What went wrong.
        message: String,
    },

    /// The filesystem watcher could not be set up.
    #[error("watch error: {0}")]
    Watch(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a file data error.
    pub fn file_data(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileData {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout { .. } => true,
            SyncError::HttpStatus { status, .. } => is_http_error_recoverable(*status),
            _ => false,
        }
    }

    /// Returns true if the server asked the client to fall back to FDv1.
    pub fn fdv1_fallback(&self) -> bool {
        matches!(
            self,
            SyncError::HttpStatus {
                fdv1_fallback: true,
                ..
            }
        )
    }

    /// Converts this error into the status-level description reported to consumers.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            SyncError::Transport { .. } | SyncError::Timeout { .. } => {
                ErrorInfo::new(ErrorKind::NetworkError, self.to_string())
            }
            SyncError::HttpStatus { status, .. } => ErrorInfo::from_http_status(*status),
            SyncError::Protocol(_) | SyncError::FileData { .. } => {
                ErrorInfo::new(ErrorKind::InvalidData, self.to_string())
            }
            SyncError::Watch(_) | SyncError::Io(_) => {
                ErrorInfo::new(ErrorKind::Unknown, self.to_string())
            }
        }
    }
}

/// Returns true if a request that failed with this HTTP status may succeed later.
///
/// 400, 408, 429 and all 5xx statuses are recoverable, as is 0 (no status).
/// Every other 4xx means the request will keep failing as sent.
pub fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        0 => true,
        400..=499 => matches!(status, 400 | 408 | 429),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout {
            url: "http://localhost".into()
        }
        .is_retryable());
        assert!(!SyncError::Protocol("bad body".into()).is_retryable());
    }

    #[test]
    fn http_recoverability() {
        for status in [0, 400, 408, 429, 500, 503] {
            assert!(is_http_error_recoverable(status), "{status}");
        }
        for status in [401, 403, 404, 405] {
            assert!(!is_http_error_recoverable(status), "{status}");
        }
        let err = SyncError::HttpStatus {
            status: 401,
            fdv1_fallback: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_info_mapping() {
        let info = SyncError::HttpStatus {
            status: 503,
            fdv1_fallback: true,
        }
        .to_error_info();
        assert_eq!(info.kind, ErrorKind::ErrorResponse);
        assert_eq!(info.status_code, Some(503));

        let info = SyncError::Timeout {
            url: "http://localhost/sdk/poll".into(),
        }
        .to_error_info();
        assert_eq!(info.kind, ErrorKind::NetworkError);

        let info = SyncError::file_data("flags.json", "missing").to_error_info();
        assert_eq!(info.kind, ErrorKind::InvalidData);
        assert_eq!(info.message.as_deref(), Some("flags.json: missing"));
    }

    #[test]
    fn fallback_flag() {
        assert!(SyncError::HttpStatus {
            status: 500,
            fdv1_fallback: true
        }
        .fdv1_fallback());
        assert!(!SyncError::Protocol("x".into()).fdv1_fallback());
    }
}
