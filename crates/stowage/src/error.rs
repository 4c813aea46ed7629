use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StowageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StowageError>,
    },

    #[error("Provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Scan not found: {0}")]
    ScanNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("User input error: {0}")]
    UserInput(String),
}

impl From<dialoguer::Error> for StowageError {
    fn from(err: dialoguer::Error) -> Self {
        StowageError::UserInput(err.to_string())
    }
}

impl StowageError {
    /// Whether a retry could reasonably succeed.
    ///
    /// Network and transport failures, timeouts, throttling and server-side
    /// provider errors are transient. Cancellation is never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            StowageError::Network(_) | StowageError::Timeout(_) => true,
            StowageError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StowageError::Provider { status, .. } => *status == 429 || (500..600).contains(status),
            StowageError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StowageError::Cancelled)
    }
}

fn is_transient_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
    ) {
        return true;
    }

    let message = err.to_string().to_lowercase();
    ["network", "connection", "timeout", "timed out"]
        .iter()
        .any(|needle| message.contains(needle))
}

pub type Result<T> = std::result::Result<T, StowageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_errors_classified_by_kind_and_message() {
        let reset = StowageError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_transient());

        let by_message = StowageError::Io(io::Error::new(
            io::ErrorKind::Other,
            "Network is unreachable",
        ));
        assert!(by_message.is_transient());

        let denied = StowageError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(!denied.is_transient());
    }

    #[test]
    fn test_provider_status_classification() {
        let throttled = StowageError::Provider {
            status: 429,
            message: "slow down".to_string(),
        };
        let unavailable = StowageError::Provider {
            status: 503,
            message: "unavailable".to_string(),
        };
        let not_found = StowageError::Provider {
            status: 404,
            message: "missing".to_string(),
        };

        assert!(throttled.is_transient());
        assert!(unavailable.is_transient());
        assert!(!not_found.is_transient());
    }

    #[test]
    fn test_fatal_errors_are_not_transient() {
        assert!(!StowageError::Config("bad".to_string()).is_transient());
        assert!(!StowageError::Cancelled.is_transient());
        assert!(StowageError::Cancelled.is_cancelled());
        assert!(StowageError::Timeout("hash".to_string()).is_transient());
    }

    #[test]
    fn test_retries_exhausted_display_includes_cause() {
        let err = StowageError::RetriesExhausted {
            attempts: 4,
            source: Box::new(StowageError::Network("connection dropped".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 4 attempts: Network error: connection dropped"
        );
    }
}
