use reqwest::StatusCode;
use thiserror::Error;

/// Why a single segment attempt failed. Every variant counts against the retry budget.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Status(StatusCode),
    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("body ended early: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("no data received within the stall timeout")]
    Stalled,
}

impl SegmentError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SegmentError::Status(code) => Some(code.as_u16()),
            SegmentError::Http(err) => err.status().map(|code| code.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("scheduler must be started from within a Tokio runtime")]
    NoRuntime,
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] std::io::Error),
}
