use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Outcome state of one target's result row.
///
/// Closed set: a row is pending until its attempt finalizes, then it is either
/// `Success` or `Failed` for good.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Pending,
    Success,
    Failed,
}

impl ProbeStatus {
    /// Sort rank used by the result table: success first, pending last.
    pub fn ordinal(self) -> u8 {
        match self {
            ProbeStatus::Success => 1,
            ProbeStatus::Failed => 2,
            ProbeStatus::Pending => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ProbeStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeStatus::Pending => "pending",
            ProbeStatus::Success => "success",
            ProbeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt ended in `failed`. Rendered into `ResultRecord::details`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ConnectionRefused,
    Timeout,
    AuthRejected,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::ConnectionRefused => "connection-refused",
            FailureReason::Timeout => "timeout",
            FailureReason::AuthRejected => "auth-rejected",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the result table as delivered to observers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub id: u64,
    pub address: String,
    pub status: ProbeStatus,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub details: String,
}

impl ResultRecord {
    pub fn pending(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            status: ProbeStatus::Pending,
            username: String::new(),
            password: String::new(),
            details: String::new(),
        }
    }

    pub fn success(
        id: u64,
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            status: ProbeStatus::Success,
            username: username.into(),
            password: password.into(),
            details: details.into(),
        }
    }

    pub fn failed(id: u64, address: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            id,
            address: address.into(),
            status: ProbeStatus::Failed,
            username: String::new(),
            password: String::new(),
            details: reason.as_str().to_string(),
        }
    }

    /// Compare two rows on a single column; status uses its ordinal rank.
    pub fn cmp_by(&self, other: &Self, key: SortKey) -> Ordering {
        match key {
            SortKey::Id => self.id.cmp(&other.id),
            SortKey::Address => self.address.cmp(&other.address),
            SortKey::Status => self.status.ordinal().cmp(&other.status.ordinal()),
            SortKey::Username => self.username.cmp(&other.username),
            SortKey::Password => self.password.cmp(&other.password),
            SortKey::Details => self.details.cmp(&other.details),
        }
    }
}

/// Result table columns, in their fixed export order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Id,
    Address,
    Status,
    Username,
    Password,
    Details,
}

impl SortKey {
    pub const COLUMNS: [SortKey; 6] = [
        SortKey::Id,
        SortKey::Address,
        SortKey::Status,
        SortKey::Username,
        SortKey::Password,
        SortKey::Details,
    ];

    pub fn header(self) -> &'static str {
        match self {
            SortKey::Id => "id",
            SortKey::Address => "address",
            SortKey::Status => "status",
            SortKey::Username => "username",
            SortKey::Password => "password",
            SortKey::Details => "details",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub scanning: bool,
    /// Session the flag belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

/// Envelope pushed over the event stream: `{"type": "status"|"result", "data": ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ScanEvent {
    Status(StatusPayload),
    Result(ResultRecord),
}

impl ScanEvent {
    pub fn scanning(scanning: bool) -> Self {
        ScanEvent::Status(StatusPayload {
            scanning,
            session_id: None,
        })
    }

    pub fn session_status(session_id: u64, scanning: bool) -> Self {
        ScanEvent::Status(StatusPayload {
            scanning,
            session_id: Some(session_id),
        })
    }
}

/// Lifecycle of a scan session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Stopping,
    Completed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopping)
    }
}

/// Point-in-time view of the coordinator, served at `/api/status`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub state: SessionState,
    pub scanning: bool,
    pub concurrency: usize,
    pub total: u64,
    pub finalized: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub started_at: Option<String>,
}
