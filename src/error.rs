use thiserror::Error;

use crate::types::FailureReason;

/// Rejections of a scan request. Per-target problems never surface here;
/// they become result rows instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("a scan session is already {0}")]
    SessionBusy(&'static str),
}

impl ScanError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::InvalidInput(_) => "invalid_input",
            ScanError::SessionBusy(_) => "session_busy",
        }
    }
}

/// Errors a prober reports while talking to one target.
#[derive(Error, Debug)]
pub enum ProbeFailure {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("timed out")]
    TimedOut,

    #[error("credential rejected")]
    Rejected,

    #[error("probe error: {0}")]
    Other(String),
}

impl ProbeFailure {
    /// Map onto the closed set of failure reasons. `during_connect` decides
    /// where an unclassified error lands.
    pub fn reason(&self, during_connect: bool) -> FailureReason {
        match self {
            ProbeFailure::Refused(_) => FailureReason::ConnectionRefused,
            ProbeFailure::TimedOut => FailureReason::Timeout,
            ProbeFailure::Rejected => FailureReason::AuthRejected,
            ProbeFailure::Other(_) if during_connect => FailureReason::ConnectionRefused,
            ProbeFailure::Other(_) => FailureReason::AuthRejected,
        }
    }
}

/// Event stream client errors. All of them leave the local table intact.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("event stream disconnected: {0}")]
    StreamDisconnected(String),

    #[error("event stream returned HTTP {0}")]
    BadStatus(u16),

    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
}
