//! Driftsync - Distributed File Synchronization Coordinator
//!
//! A coordinator that accepts file uploads from a dynamic fleet of
//! client nodes, replicates each new version to every other online node,
//! keeps a causally consistent audit of all replication activity, and
//! detects concurrent modifications so they surface as conflicts.
//!
//! # Architecture
//!
//! The coordinator composes six narrow components assembled at startup:
//!
//! - Vector clock manager: causal ordering of events across nodes
//! - Chunk store: content-addressed chunk bodies with reference counts
//! - Delta engine: chunk signatures, delta construction and application
//! - Version store: immutable per-file version DAGs with conflict
//!   detection
//! - Replication orchestrator: fan-out of new versions with progress
//!   reporting and per-peer failure handling
//! - Event log: append-only audit with a live push channel
//!
//! # Features
//!
//! - Delta synchronization transferring only changed chunks
//! - Vector-clock conflict detection with explicit resolution
//! - Version history with restore-as-forward-step
//! - Per-(file, target) ordered replication with bounded parallelism
//! - HTTP + WebSocket API for nodes and dashboards

pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod replication;
pub mod state;
pub mod store;
pub mod sync;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{ClockManager, ClockOrdering, VectorClock};
    pub use crate::config::CoordinatorConfig;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventLog, EventPayload};
    pub use crate::replication::{Orchestrator, SessionState, SyncSession};
    pub use crate::state::{NodeInfo, NodeRegistry, NodeStatus};
    pub use crate::store::{ChunkStore, FileVersion, MetadataStore, VersionStore};
    pub use crate::sync::{ChunkSignature, Delta, DeltaEngine, DeltaMetrics};
}
