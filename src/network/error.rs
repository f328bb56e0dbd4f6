use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// How the sync engine treats a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The server rejected the mutation against its current state. Retrying
    /// cannot help.
    Conflict,
    /// Might succeed later.
    Transient,
}

/// Maps a transport status onto a failure class. 409 and 422 mean the
/// mutation is invalid against current server state; everything else is
/// worth retrying.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        409 | 422 => FailureClass::Conflict,
        _ => FailureClass::Transient,
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Displays as the bare server message, which is what gets stored as a
    /// mutation's `last_error`.
    #[error("{message}")]
    Conflict { status: u16, message: String },

    #[error("HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Request timed out after {0:?}")]
    TimeoutError(Duration),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Invalid request: {0}")]
    RequestError(String),

    #[error("Unsupported mutation kind: {0}")]
    UnsupportedKind(String),

    #[error("{0}")]
    Transient(String),
}

impl RemoteError {
    /// A server-side rejection, reported with the canonical 409 status.
    pub fn conflict(message: impl Into<String>) -> Self {
        RemoteError::Conflict {
            status: 409,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient(message.into())
    }

    /// Builds the error for a non-success response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_status(status) {
            FailureClass::Conflict => RemoteError::Conflict { status, message },
            FailureClass::Transient => RemoteError::HttpError { status, message },
        }
    }

    pub fn classification(&self) -> FailureClass {
        match self {
            RemoteError::Conflict { .. } | RemoteError::UnsupportedKind(_) => {
                FailureClass::Conflict
            }
            RemoteError::HttpError { .. }
            | RemoteError::TimeoutError(_)
            | RemoteError::ConnectionError(_)
            | RemoteError::RequestError(_)
            | RemoteError::Transient(_) => FailureClass::Transient,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.classification() == FailureClass::Conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_statuses_are_409_and_422_only() {
        assert_eq!(classify_status(409), FailureClass::Conflict);
        assert_eq!(classify_status(422), FailureClass::Conflict);
        for status in [400, 401, 404, 429, 500, 502, 503] {
            assert_eq!(classify_status(status), FailureClass::Transient, "{status}");
        }
    }

    #[test]
    fn conflict_displays_bare_message() {
        let err = RemoteError::from_status(422, "duplicate item_code");
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "duplicate item_code");
    }

    #[test]
    fn display_includes_error_kind() {
        let http = RemoteError::from_status(503, "unavailable");
        assert_eq!(http.classification(), FailureClass::Transient);
        assert!(format!("{http}").contains("HTTP 503"));

        let timeout = RemoteError::TimeoutError(Duration::from_secs(10));
        assert!(format!("{timeout}").contains("timed out"));

        let conn = RemoteError::ConnectionError("refused".to_string());
        assert!(format!("{conn}").contains("Connection error"));
    }
}
