use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Could not extract session parameters: {0}")]
    ParameterExtractionFailed(String),

    #[error("No week offsets found in the week selector")]
    NoOffsetsFound,

    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Re-authentication failed: {0}")]
    ReauthenticationFailed(String),

    #[error("Merge conflict for lesson {lesson_id}: {message}")]
    MergeConflict { lesson_id: String, message: String },

    #[error("Request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// How a failed fetch should be handled by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network trouble or a 5xx; retry with backoff.
    Transient,
    /// The portal no longer recognises the session; reauthenticate.
    Auth,
    /// Retrying would repeat the same bad request.
    Fatal,
}

impl Error {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    FailureClass::Transient
                } else if let Some(status) = e.status() {
                    classify_status(status.as_u16())
                } else {
                    FailureClass::Transient
                }
            }
            Error::TransientFetch(_) => FailureClass::Transient,
            Error::SessionExpired(_) => FailureClass::Auth,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted => FailureClass::Transient,
                _ => FailureClass::Fatal,
            },
            _ => FailureClass::Fatal,
        }
    }

    /// Errors that stop the whole batch rather than a single key.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Error::ReauthenticationFailed(_) | Error::ParameterExtractionFailed(_)
        )
    }

    /// Copy of a run-fatal error, so it can be reported both against the key
    /// that hit it and as the batch abort reason.
    pub(crate) fn run_fatal_copy(&self) -> Option<Error> {
        match self {
            Error::ReauthenticationFailed(m) => Some(Error::ReauthenticationFailed(m.clone())),
            Error::ParameterExtractionFailed(m) => {
                Some(Error::ParameterExtractionFailed(m.clone()))
            }
            _ => None,
        }
    }
}

/// Classify a bare HTTP status (auth-page detection happens on the body).
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        401 | 403 => FailureClass::Auth,
        408 | 429 => FailureClass::Transient,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(503), FailureClass::Transient);
        assert_eq!(classify_status(500), FailureClass::Transient);
        assert_eq!(classify_status(401), FailureClass::Auth);
        assert_eq!(classify_status(403), FailureClass::Auth);
        assert_eq!(classify_status(404), FailureClass::Fatal);
        assert_eq!(classify_status(400), FailureClass::Fatal);
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            Error::TransientFetch("reset".into()).failure_class(),
            FailureClass::Transient
        );
        assert_eq!(
            Error::SessionExpired("login page".into()).failure_class(),
            FailureClass::Auth
        );
        assert_eq!(
            Error::Parse("no table".into()).failure_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            Error::Rejected { status: 404, message: "gone".into() }.failure_class(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_run_fatal_copy() {
        let e = Error::ReauthenticationFailed("bad password".into());
        assert!(e.is_run_fatal());
        let copy = e.run_fatal_copy().unwrap();
        assert_eq!(copy.to_string(), e.to_string());

        assert!(Error::NoOffsetsFound.run_fatal_copy().is_none());
    }
}
