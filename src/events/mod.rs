//! Event Log & Broadcaster
//!
//! Append-only audit of replication activity. Every event carries the
//! vector clock at issuance; the log assigns a monotonic sequence on
//! append and pushes each event to live subscribers. Subscribers receive
//! only events appended after subscription, and slow subscribers lag out
//! rather than blocking producers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::{self, CausallyOrdered, ClockManager, VectorClock};
use crate::error::Result;
use crate::state::NodeStatus;
use crate::store::MetadataStore;
use crate::sync::DeltaMetrics;

/// Capacity of the subscriber push channel
const BROADCAST_CAPACITY: usize = 1024;

/// Phase of a replication progress update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    SyncStarted,
    Syncing,
}

/// Typed event payloads. `event_type` discriminates on the wire and each
/// variant carries its fixed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    NodeRegistered {
        name: String,
        address: String,
        port: u16,
    },
    NodeRemoved {
        name: String,
    },
    NodeStatusChanged {
        status: NodeStatus,
    },
    FileModified {
        file_name: String,
        version_id: String,
        size: u64,
    },
    FileSyncProgress {
        action: SyncAction,
        progress: u8,
        source_node: String,
        target_node: String,
        version_id: String,
    },
    SyncCompleted {
        source_node: String,
        target_node: String,
        version_id: String,
        bytes_transferred: u64,
        metrics: DeltaMetrics,
    },
    SyncError {
        source_node: String,
        target_node: String,
        version_id: String,
        reason: String,
    },
    ConflictDetected {
        conflict_id: String,
        version_a: String,
        version_b: String,
    },
    ConflictResolved {
        conflict_id: String,
        winner_version_id: String,
    },
}

impl EventPayload {
    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::NodeRegistered { .. } => "node_registered",
            EventPayload::NodeRemoved { .. } => "node_removed",
            EventPayload::NodeStatusChanged { .. } => "node_status_changed",
            EventPayload::FileModified { .. } => "file_modified",
            EventPayload::FileSyncProgress { .. } => "file_sync_progress",
            EventPayload::SyncCompleted { .. } => "sync_completed",
            EventPayload::SyncError { .. } => "sync_error",
            EventPayload::ConflictDetected { .. } => "conflict_detected",
            EventPayload::ConflictResolved { .. } => "conflict_resolved",
        }
    }
}

/// One audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub event_id: String,
    /// Monotonic sequence assigned on append
    #[serde(default)]
    pub seq: u64,
    /// When the event was issued
    pub timestamp: DateTime<Utc>,
    /// Node the event is attributed to
    pub node_id: String,
    /// File the event concerns, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_id: Option<String>,
    /// Typed payload
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Vector clock at issuance
    pub vector_clock: VectorClock,
    /// Whether a consumer has acknowledged the event
    #[serde(default)]
    pub processed: bool,
}

impl CausallyOrdered for Event {
    fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn tie_breaker(&self) -> &str {
        &self.event_id
    }
}

/// Append-only event log with live push
pub struct EventLog {
    meta: Arc<MetadataStore>,
    clocks: Arc<ClockManager>,
    tx: broadcast::Sender<Event>,
}

impl EventLog {
    /// Create a log persisting through the given metadata store
    pub fn new(meta: Arc<MetadataStore>, clocks: Arc<ClockManager>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { meta, clocks, tx }
    }

    /// Append a locally originated event: tick the node's clock and
    /// persist the event carrying it as one atomic step. The clock lock
    /// is held across persistence, so the sequence order of a node's
    /// events always matches their clock order.
    pub async fn append_local(
        &self,
        node_id: impl Into<String>,
        file_id: Option<String>,
        payload: EventPayload,
    ) -> Result<Event> {
        let node_id = node_id.into();
        let mut clocks = self.clocks.lock().await;
        let clock = clocks.tick(&node_id);
        self.persist(node_id, file_id, clock, payload).await
    }

    /// Append an event recording receipt of a peer's clock: merge it
    /// into the node's clock, tick, and persist atomically, as with
    /// [`EventLog::append_local`].
    pub async fn append_receipt(
        &self,
        node_id: impl Into<String>,
        incoming: &VectorClock,
        file_id: Option<String>,
        payload: EventPayload,
    ) -> Result<Event> {
        let node_id = node_id.into();
        let mut clocks = self.clocks.lock().await;
        let clock = clocks.merge(&node_id, incoming);
        self.persist(node_id, file_id, clock, payload).await
    }

    /// Append an event bound to an externally determined clock (e.g. a
    /// final snapshot for a node being removed). Does not advance any
    /// clock.
    pub async fn append(
        &self,
        node_id: impl Into<String>,
        file_id: Option<String>,
        vector_clock: VectorClock,
        payload: EventPayload,
    ) -> Result<Event> {
        self.persist(node_id.into(), file_id, vector_clock, payload)
            .await
    }

    async fn persist(
        &self,
        node_id: String,
        file_id: Option<String>,
        vector_clock: VectorClock,
        payload: EventPayload,
    ) -> Result<Event> {
        let mut event = Event {
            event_id: Uuid::new_v4().to_string(),
            seq: 0,
            timestamp: Utc::now(),
            node_id,
            file_id,
            payload,
            vector_clock,
            processed: false,
        };

        event.seq = self.meta.append_event(&event).await?;
        tracing::debug!(
            "event {} seq={} type={} node={}",
            event.event_id,
            event.seq,
            event.payload.event_type(),
            event.node_id
        );

        // Nobody listening is fine; lagging receivers drop events on
        // their side rather than blocking the append path.
        let _ = self.tx.send(event.clone());

        Ok(event)
    }

    /// Most recent events, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<Event>> {
        self.meta.recent_events(limit).await
    }

    /// Most recent events re-sorted into causal order (oldest first)
    pub async fn causal_recent(&self, limit: usize) -> Result<Vec<Event>> {
        let events = self.meta.recent_events(limit).await?;
        Ok(clock::causal_sort(events))
    }

    /// Subscribe to events appended after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Mark an event as processed by a consumer
    pub async fn mark_processed(&self, event_id: &str) -> Result<()> {
        self.meta.mark_event_processed(event_id).await
    }
}
