//! Replication session state
//!
//! One session is one replication attempt of one version from its
//! source node to one target node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle
///
/// ```text
/// Pending -> InProgress -> Completed
///                    \--> Failed (terminal; recoverable by re-trigger)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Queued, waiting for a transfer slot
    Pending,
    /// Delta computed, chunks in flight
    InProgress,
    /// Target acknowledged the version
    Completed,
    /// Transport, integrity, or deadline failure
    Failed,
}

impl SessionState {
    /// Whether the session has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Pending => write!(f, "PENDING"),
            SessionState::InProgress => write!(f, "IN_PROGRESS"),
            SessionState::Completed => write!(f, "COMPLETED"),
            SessionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// State of one replication session
#[derive(Debug, Clone, Serialize)]
pub struct SyncSession {
    pub session_id: String,
    pub file_id: String,
    pub version_id: String,
    pub source_node: String,
    pub target_node: String,
    pub state: SessionState,
    /// Monotonic, non-decreasing; reaches 100 before Completed
    pub progress: u8,
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncSession {
    /// Open a pending session
    pub fn new(
        session_id: String,
        file_id: String,
        version_id: String,
        source_node: String,
        target_node: String,
    ) -> Self {
        Self {
            session_id,
            file_id,
            version_id,
            source_node,
            target_node,
            state: SessionState::Pending,
            progress: 0,
            bytes_transferred: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Pending.is_terminal());
        assert!(!SessionState::InProgress.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }

    #[test]
    fn test_new_session_is_pending() {
        let session = SyncSession::new(
            "s1".into(),
            "file-1".into(),
            "v1".into(),
            "n1".into(),
            "n2".into(),
        );
        assert_eq!(session.state, SessionState::Pending);
        assert_eq!(session.progress, 0);
        assert!(session.error.is_none());
    }
}
