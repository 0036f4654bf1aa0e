//! Replication
//!
//! Fan-out of newly created versions to every online peer, with
//! per-session progress reporting and failure handling.

pub mod orchestrator;
pub mod session;
pub mod transport;

pub use orchestrator::{Orchestrator, ReplicationStatsSnapshot};
pub use session::{SessionState, SyncSession};
pub use transport::{CoordinatorTransport, PeerTransport};

use std::time::Duration;

use crate::config::SyncConfig;

/// Configuration for the replication orchestrator
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Concurrent sessions per target node
    pub max_sessions_per_target: usize,
    /// Coordinator-wide cap on concurrent sessions
    pub max_sessions_total: usize,
    /// Whole-session deadline
    pub session_deadline: Duration,
    /// Per-chunk transfer deadline
    pub chunk_deadline: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_target: 1,
            max_sessions_total: 16,
            session_deadline: Duration::from_secs(300),
            chunk_deadline: Duration::from_secs(30),
        }
    }
}

impl From<&SyncConfig> for ReplicationConfig {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            max_sessions_per_target: sync.max_sessions_per_target,
            max_sessions_total: sync.max_sessions_total,
            session_deadline: Duration::from_millis(sync.session_deadline_ms),
            chunk_deadline: Duration::from_millis(sync.chunk_deadline_ms),
        }
    }
}
