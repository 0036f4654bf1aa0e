//! Replication Orchestrator
//!
//! Drives fan-out of a newly created version to every online peer other
//! than the originator. Sessions for the same (file, target) pair are
//! serialized in creation order so each replica observes versions in
//! causal order; across files and targets sessions run in parallel,
//! bounded per target and coordinator-wide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventLog, EventPayload, SyncAction};
use crate::state::NodeRegistry;
use crate::store::{FileVersion, MetadataStore, VersionStore};
use crate::sync::{DeltaEngine, DeltaMetrics, DeltaOp};

use super::session::{SessionState, SyncSession};
use super::transport::PeerTransport;
use super::ReplicationConfig;

/// Quantized progress milestones emitted during transfer
const PROGRESS_MILESTONES: [u8; 3] = [25, 50, 75];

/// FIFO turnstile serializing sessions for one (file, target) pair.
/// Tickets are taken in session-creation order; a session runs only
/// once every earlier ticket has been released.
struct PairGate {
    state: Mutex<GateState>,
    notify: Notify,
}

struct GateState {
    next_ticket: u64,
    now_serving: u64,
}

impl PairGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                next_ticket: 0,
                now_serving: 0,
            }),
            notify: Notify::new(),
        }
    }

    async fn enqueue(&self) -> u64 {
        let mut state = self.state.lock().await;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        ticket
    }

    async fn wait(&self, ticket: u64) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().await;
                if state.now_serving == ticket {
                    return;
                }
            }
            notified.await;
        }
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        state.now_serving += 1;
        drop(state);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct ReplicationStats {
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    bytes_transferred: AtomicU64,
    bytes_saved: AtomicU64,
}

/// Cumulative replication numbers for the metrics surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStatsSnapshot {
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    pub average_compression_ratio: f64,
}

/// Replication fan-out driver
pub struct Orchestrator {
    config: ReplicationConfig,
    registry: Arc<NodeRegistry>,
    versions: Arc<VersionStore>,
    meta: Arc<MetadataStore>,
    events: Arc<EventLog>,
    transport: Arc<dyn PeerTransport>,
    sessions: RwLock<HashMap<String, SyncSession>>,
    gates: Mutex<HashMap<(String, String), Arc<PairGate>>>,
    target_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    total_slots: Arc<Semaphore>,
    stats: ReplicationStats,
}

impl Orchestrator {
    /// Assemble the orchestrator over its collaborators
    pub fn new(
        config: ReplicationConfig,
        registry: Arc<NodeRegistry>,
        versions: Arc<VersionStore>,
        meta: Arc<MetadataStore>,
        events: Arc<EventLog>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let total = config.max_sessions_total;
        Self {
            config,
            registry,
            versions,
            meta,
            events,
            transport,
            sessions: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            target_slots: Mutex::new(HashMap::new()),
            total_slots: Arc::new(Semaphore::new(total)),
            stats: ReplicationStats::default(),
        }
    }

    /// Fan a version out to every online node except its originator.
    /// Returns the opened session ids; transfers continue in background
    /// tasks.
    pub async fn replicate_version(self: &Arc<Self>, version: &FileVersion) -> Result<Vec<String>> {
        let targets: Vec<String> = self
            .registry
            .online()
            .await
            .into_iter()
            .filter(|node| node.node_id != version.created_by)
            .map(|node| node.node_id)
            .collect();

        let mut session_ids = Vec::with_capacity(targets.len());
        for target in targets {
            session_ids.push(self.spawn_session(version.clone(), target).await?);
        }

        Ok(session_ids)
    }

    /// Explicitly re-replicate a file's head to one target. Used after a
    /// failed session; the orchestrator never retries on its own.
    pub async fn retrigger(self: &Arc<Self>, file_id: &str, target: &str) -> Result<String> {
        if !self.registry.is_online(target).await {
            return Err(Error::TargetOffline(target.to_string()));
        }

        let heads = self.versions.head(file_id).await?;
        let version = heads
            .into_iter()
            .next()
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        self.spawn_session(version, target.to_string()).await
    }

    async fn spawn_session(self: &Arc<Self>, version: FileVersion, target: String) -> Result<String> {
        let session = SyncSession::new(
            Uuid::new_v4().to_string(),
            version.file_id.clone(),
            version.version_id.clone(),
            version.created_by.clone(),
            target.clone(),
        );
        let session_id = session.session_id.clone();

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);

        // Ticket taken here fixes the pair's serialization order.
        let gate = self.pair_gate(&version.file_id, &target).await;
        let ticket = gate.enqueue().await;

        self.emit_progress(&version, &target, SyncAction::SyncStarted, 0)
            .await?;

        tracing::info!(
            "session {}: replicating {} of file {} to {}",
            session_id,
            version.version_id,
            version.file_id,
            target
        );

        let this = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            this.run_session(version, target, id, gate, ticket).await;
        });

        Ok(session_id)
    }

    async fn run_session(
        self: Arc<Self>,
        version: FileVersion,
        target: String,
        session_id: String,
        gate: Arc<PairGate>,
        ticket: u64,
    ) {
        let outcome = tokio::time::timeout(
            self.config.session_deadline,
            self.drive_session(&version, &target, &session_id, &gate, ticket),
        )
        .await;

        match outcome {
            Ok(Ok((bytes, metrics))) => {
                self.complete_session(&session_id, &version, &target, bytes, metrics)
                    .await;
            }
            Ok(Err(error)) => {
                self.fail_session(&session_id, &error.to_string()).await;
            }
            Err(_) => {
                let error = Error::SessionTimeout {
                    phase: "session".into(),
                };
                self.fail_session(&session_id, &error.to_string()).await;
            }
        }

        gate.release().await;
    }

    /// Transfer phase: compute the delta against the target's replica,
    /// push missing chunk bodies, commit, and record the replica.
    async fn drive_session(
        &self,
        version: &FileVersion,
        target: &str,
        session_id: &str,
        gate: &PairGate,
        ticket: u64,
    ) -> Result<(u64, DeltaMetrics)> {
        // Successive versions for one (file, target) pair serialize here.
        gate.wait(ticket).await;

        let target_slot = self.target_slot(target).await;
        let _target_permit = target_slot
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("target slot closed".into()))?;
        let _total_permit = Arc::clone(&self.total_slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("session slots closed".into()))?;

        self.update_session(session_id, |session| {
            session.state = SessionState::InProgress;
        })
        .await;

        if !self.registry.is_online(target).await {
            return Err(Error::TargetOffline(target.to_string()));
        }

        let base_signature = match self.meta.replica_version(&version.file_id, target).await? {
            Some(replica_id) => self.versions.get_version(&replica_id).await?.chunks,
            None => Vec::new(),
        };

        let content = self.versions.content(&version.version_id).await?;
        let engine = self.versions.engine();
        let delta = engine.delta(&base_signature, &content);
        let metrics = DeltaEngine::metrics(&delta);

        // Only bodies the target does not already hold cross the wire.
        let mut missing = Vec::new();
        for op in &delta.ops {
            if let DeltaOp::Insert { hash, size, bytes } = op {
                if !self.transport.has_chunk(target, hash).await? {
                    let body = bytes
                        .as_ref()
                        .ok_or_else(|| Error::MissingChunk(hex::encode(hash)))?;
                    missing.push((*hash, *size, body.clone()));
                }
            }
        }

        let total_bytes: u64 = missing.iter().map(|(_, size, _)| *size as u64).sum();
        let mut sent = 0u64;
        let mut last_milestone = 0u8;

        for (hash, size, body) in missing {
            if !self.registry.is_online(target).await {
                return Err(Error::TargetOffline(target.to_string()));
            }

            tokio::time::timeout(
                self.config.chunk_deadline,
                self.transport.send_chunk(target, &hash, &body),
            )
            .await
            .map_err(|_| Error::SessionTimeout {
                phase: "chunk transfer".into(),
            })??;

            sent += size as u64;
            let progress = ((sent * 100) / total_bytes.max(1)) as u8;
            for milestone in PROGRESS_MILESTONES {
                if progress >= milestone && last_milestone < milestone {
                    last_milestone = milestone;
                    self.emit_progress(version, target, SyncAction::Syncing, milestone)
                        .await?;
                    self.update_session(session_id, |session| {
                        session.progress = milestone;
                    })
                    .await;
                }
            }
            self.update_session(session_id, |session| {
                session.bytes_transferred = sent;
            })
            .await;
        }

        tokio::time::timeout(
            self.config.chunk_deadline,
            self.transport
                .commit_version(target, &version.file_id, &version.version_id, &delta),
        )
        .await
        .map_err(|_| Error::SessionTimeout {
            phase: "commit".into(),
        })??;

        self.meta
            .set_replica(&version.file_id, target, &version.version_id)
            .await?;

        Ok((sent, metrics))
    }

    async fn complete_session(
        &self,
        session_id: &str,
        version: &FileVersion,
        target: &str,
        bytes: u64,
        metrics: DeltaMetrics,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(session) if !session.state.is_terminal() => {
                    session.state = SessionState::Completed;
                    session.progress = 100;
                    session.bytes_transferred = bytes;
                    session.finished_at = Some(Utc::now());
                }
                _ => return,
            }
        }

        if let Err(error) = self
            .emit_progress(version, target, SyncAction::Syncing, 100)
            .await
        {
            tracing::error!("session {}: progress event failed: {}", session_id, error);
        }

        // Receiving the version is a message receipt at the target; the
        // clock merge and the completion event land atomically.
        let completed = self
            .events
            .append_receipt(
                target,
                &version.vector_clock,
                Some(version.file_id.clone()),
                EventPayload::SyncCompleted {
                    source_node: version.created_by.clone(),
                    target_node: target.to_string(),
                    version_id: version.version_id.clone(),
                    bytes_transferred: bytes,
                    metrics: metrics.clone(),
                },
            )
            .await;
        if let Err(error) = completed {
            tracing::error!("session {}: completion event failed: {}", session_id, error);
        }

        self.stats.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_transferred
            .fetch_add(bytes, Ordering::Relaxed);
        self.stats
            .bytes_saved
            .fetch_add(metrics.bytes_saved, Ordering::Relaxed);

        tracing::info!(
            "session {}: completed ({} bytes sent, {} saved)",
            session_id,
            bytes,
            metrics.bytes_saved
        );
    }

    async fn fail_session(&self, session_id: &str, reason: &str) {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(session) if !session.state.is_terminal() => {
                    session.state = SessionState::Failed;
                    session.error = Some(reason.to_string());
                    session.finished_at = Some(Utc::now());
                    session.clone()
                }
                _ => return,
            }
        };

        tracing::warn!("session {}: failed: {}", session_id, reason);

        let emitted = self
            .events
            .append_local(
                session.target_node.clone(),
                Some(session.file_id.clone()),
                EventPayload::SyncError {
                    source_node: session.source_node.clone(),
                    target_node: session.target_node.clone(),
                    version_id: session.version_id.clone(),
                    reason: reason.to_string(),
                },
            )
            .await;
        if let Err(error) = emitted {
            tracing::error!("session {}: error event failed: {}", session_id, error);
        }

        self.stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fail every active session targeting a node that left or went
    /// offline. Chunks it already received stay accounted for, so a
    /// later re-trigger transfers only what is missing.
    pub async fn fail_sessions_for_target(&self, target: &str) {
        let active: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.target_node == target && !s.state.is_terminal())
                .map(|s| s.session_id.clone())
                .collect()
        };

        for session_id in active {
            self.fail_session(&session_id, &format!("target {} went offline", target))
                .await;
        }
    }

    async fn emit_progress(
        &self,
        version: &FileVersion,
        target: &str,
        action: SyncAction,
        progress: u8,
    ) -> Result<()> {
        self.events
            .append_local(
                target,
                Some(version.file_id.clone()),
                EventPayload::FileSyncProgress {
                    action,
                    progress,
                    source_node: version.created_by.clone(),
                    target_node: target.to_string(),
                    version_id: version.version_id.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn update_session(&self, session_id: &str, apply: impl FnOnce(&mut SyncSession)) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            apply(session);
        }
    }

    async fn pair_gate(&self, file_id: &str, target: &str) -> Arc<PairGate> {
        let mut gates = self.gates.lock().await;
        gates
            .entry((file_id.to_string(), target.to_string()))
            .or_insert_with(|| Arc::new(PairGate::new()))
            .clone()
    }

    async fn target_slot(&self, target: &str) -> Arc<Semaphore> {
        let mut slots = self.target_slots.lock().await;
        slots
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_sessions_per_target)))
            .clone()
    }

    /// Snapshot of one session
    pub async fn session(&self, session_id: &str) -> Option<SyncSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Snapshot of all sessions
    pub async fn sessions(&self) -> Vec<SyncSession> {
        let mut all: Vec<SyncSession> = self.sessions.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Number of sessions not yet terminal
    pub async fn in_flight(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.state.is_terminal())
            .count()
    }

    /// Cumulative replication statistics
    pub fn stats(&self) -> ReplicationStatsSnapshot {
        let transferred = self.stats.bytes_transferred.load(Ordering::Relaxed);
        let saved = self.stats.bytes_saved.load(Ordering::Relaxed);
        let total = transferred + saved;

        ReplicationStatsSnapshot {
            sessions_completed: self.stats.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.stats.sessions_failed.load(Ordering::Relaxed),
            bytes_transferred: transferred,
            bytes_saved: saved,
            average_compression_ratio: if total > 0 {
                saved as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockManager;
    use crate::events::Event;
    use crate::replication::transport::CoordinatorTransport;
    use crate::state::NodeInfo;
    use crate::store::chunks::{content_hash, ChunkHash, ChunkStore};
    use crate::store::versions::NewVersion;
    use crate::sync::Delta;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::tempdir;

    const CHUNK: usize = 4096;

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        versions: Arc<VersionStore>,
        registry: Arc<NodeRegistry>,
        clocks: Arc<ClockManager>,
        chunks: Arc<ChunkStore>,
        events: Arc<EventLog>,
        _dir: tempfile::TempDir,
    }

    async fn fixture_with_transport(
        build: impl FnOnce(Arc<NodeRegistry>) -> Arc<dyn PeerTransport>,
    ) -> Fixture {
        let dir = tempdir().unwrap();
        let meta = Arc::new(MetadataStore::in_memory().unwrap());
        let chunks = Arc::new(ChunkStore::new(dir.path().to_path_buf()).unwrap());
        let clocks = Arc::new(ClockManager::new());
        let events = Arc::new(EventLog::new(meta.clone(), clocks.clone()));
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(10)));
        let versions = Arc::new(VersionStore::new(
            meta.clone(),
            chunks.clone(),
            clocks.clone(),
            events.clone(),
            DeltaEngine::new(CHUNK),
        ));

        for id in ["n1", "n2", "n3"] {
            registry
                .register(NodeInfo::new(
                    id.to_string(),
                    id.to_string(),
                    "127.0.0.1".into(),
                    9000,
                ))
                .await;
            clocks.register_node(id).await;
        }

        let transport = build(registry.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            ReplicationConfig::default(),
            registry.clone(),
            versions.clone(),
            meta,
            events.clone(),
            transport,
        ));

        Fixture {
            orchestrator,
            versions,
            registry,
            clocks,
            chunks,
            events,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_transport(|registry| Arc::new(CoordinatorTransport::new(registry))).await
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    async fn upload(fx: &Fixture, file_id: &str, source: &str, content: &[u8]) -> FileVersion {
        let engine = fx.versions.engine();
        let signature = engine.signature(content);
        for chunk in content.chunks(CHUNK) {
            fx.chunks.put(chunk).unwrap();
        }

        let clock = fx.clocks.tick(source).await;
        let (version, _) = fx
            .versions
            .create_version(NewVersion {
                file_id: file_id.to_string(),
                file_name: "data.bin".into(),
                created_by: source.to_string(),
                clock,
                chunks: signature,
                size: content.len() as u64,
                content_hash: content_hash(content),
            })
            .await
            .unwrap();
        version
    }

    async fn wait_terminal(fx: &Fixture, session_id: &str) -> SyncSession {
        for _ in 0..300 {
            if let Some(session) = fx.orchestrator.session(session_id).await {
                if session.state.is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {} did not reach a terminal state", session_id);
    }

    fn progress_events_for(events: &[Event], target: &str) -> Vec<u8> {
        let mut progress: Vec<(u64, u8)> = events
            .iter()
            .filter_map(|event| match &event.payload {
                EventPayload::FileSyncProgress {
                    target_node,
                    progress,
                    ..
                } if target_node == target => Some((event.seq, *progress)),
                _ => None,
            })
            .collect();
        progress.sort_by_key(|(seq, _)| *seq);
        progress.into_iter().map(|(_, p)| p).collect()
    }

    #[tokio::test]
    async fn test_initial_upload_fans_out_to_all_peers() {
        let fx = fixture().await;
        let content = patterned(10 * 1024, 1); // 3 chunks: 4096 + 4096 + 2048

        let version = upload(&fx, "file-1", "n1", &content).await;
        let sessions = fx.orchestrator.replicate_version(&version).await.unwrap();
        assert_eq!(sessions.len(), 2);

        for session_id in &sessions {
            let session = wait_terminal(&fx, session_id).await;
            assert_eq!(session.state, SessionState::Completed);
            assert_eq!(session.progress, 100);
            assert_eq!(session.bytes_transferred, 10 * 1024);
        }

        let recent = fx.events.recent(100).await.unwrap();
        let completed = recent
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::SyncCompleted { .. }))
            .count();
        assert_eq!(completed, 2);

        for target in ["n2", "n3"] {
            let progress = progress_events_for(&recent, target);
            assert_eq!(progress, vec![0, 25, 50, 75, 100]);
        }

        // No prior base: nothing saved.
        let stats = fx.orchestrator.stats();
        assert_eq!(stats.bytes_saved, 0);
        assert_eq!(stats.sessions_completed, 2);
    }

    #[tokio::test]
    async fn test_delta_reuse_transfers_only_changed_chunk() {
        let fx = fixture().await;
        let old = patterned(3 * CHUNK, 1);

        let v1 = upload(&fx, "file-1", "n1", &old).await;
        let sessions = fx.orchestrator.replicate_version(&v1).await.unwrap();
        for id in &sessions {
            assert_eq!(wait_terminal(&fx, id).await.state, SessionState::Completed);
        }

        // Rewrite only the middle chunk.
        let mut new = old.clone();
        for byte in &mut new[CHUNK..2 * CHUNK] {
            *byte = byte.wrapping_add(13);
        }

        let v2 = upload(&fx, "file-1", "n1", &new).await;
        let sessions = fx.orchestrator.replicate_version(&v2).await.unwrap();
        for id in &sessions {
            let session = wait_terminal(&fx, id).await;
            assert_eq!(session.state, SessionState::Completed);
            assert_eq!(session.bytes_transferred, CHUNK as u64);
        }

        let recent = fx.events.recent(100).await.unwrap();
        let metrics = recent
            .iter()
            .find_map(|event| match &event.payload {
                EventPayload::SyncCompleted {
                    version_id,
                    metrics,
                    ..
                } if *version_id == v2.version_id => Some(metrics.clone()),
                _ => None,
            })
            .expect("completion event for v2");

        assert_eq!(metrics.bytes_saved, 2 * CHUNK as u64);
        assert_eq!(metrics.chunks_inserted, 1);
        assert!((metrics.compression_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_offline_target_is_skipped_at_fanout() {
        let fx = fixture().await;
        fx.registry
            .set_status("n3", crate::state::NodeStatus::Offline)
            .await
            .unwrap();

        let version = upload(&fx, "file-1", "n1", &patterned(CHUNK, 2)).await;
        let sessions = fx.orchestrator.replicate_version(&version).await.unwrap();
        assert_eq!(sessions.len(), 1);

        let session = wait_terminal(&fx, &sessions[0]).await;
        assert_eq!(session.target_node, "n2");
        assert_eq!(session.state, SessionState::Completed);
    }

    /// Transport failing after a fixed number of chunk deliveries,
    /// retaining delivered chunks like a real peer would.
    struct FlakyTransport {
        held: RwLock<HashSet<(String, ChunkHash)>>,
        remaining: Mutex<Option<usize>>,
        delivered: Mutex<Vec<ChunkHash>>,
    }

    impl FlakyTransport {
        fn new(fail_after: usize) -> Self {
            Self {
                held: RwLock::new(HashSet::new()),
                remaining: Mutex::new(Some(fail_after)),
                delivered: Mutex::new(Vec::new()),
            }
        }

        async fn heal(&self) {
            *self.remaining.lock().await = None;
        }

        async fn delivered_count(&self) -> usize {
            self.delivered.lock().await.len()
        }
    }

    #[async_trait]
    impl PeerTransport for FlakyTransport {
        async fn has_chunk(&self, target: &str, hash: &ChunkHash) -> crate::Result<bool> {
            let held = self.held.read().await;
            Ok(held.contains(&(target.to_string(), *hash)))
        }

        async fn send_chunk(
            &self,
            target: &str,
            hash: &ChunkHash,
            _bytes: &[u8],
        ) -> crate::Result<()> {
            let mut remaining = self.remaining.lock().await;
            if let Some(left) = remaining.as_mut() {
                if *left == 0 {
                    return Err(Error::Transport("link dropped".into()));
                }
                *left -= 1;
            }
            drop(remaining);

            self.held.write().await.insert((target.to_string(), *hash));
            self.delivered.lock().await.push(*hash);
            Ok(())
        }

        async fn commit_version(
            &self,
            _target: &str,
            _file_id: &str,
            _version_id: &str,
            _delta: &Delta,
        ) -> crate::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_session_retains_chunks_for_retrigger() {
        let transport = Arc::new(FlakyTransport::new(2));
        let transport_handle = Arc::clone(&transport);
        let fx = fixture_with_transport(move |_| transport).await;

        // Only replicate to n2: take n3 out of the fleet first.
        fx.registry.remove("n3").await;

        let content = patterned(10 * 1024, 7); // 3 chunks
        let version = upload(&fx, "file-1", "n1", &content).await;
        let sessions = fx.orchestrator.replicate_version(&version).await.unwrap();
        assert_eq!(sessions.len(), 1);

        // Link drops after 2 of 3 chunks.
        let failed = wait_terminal(&fx, &sessions[0]).await;
        assert_eq!(failed.state, SessionState::Failed);
        assert!(failed.error.is_some());
        assert_eq!(transport_handle.delivered_count().await, 2);

        let recent = fx.events.recent(50).await.unwrap();
        assert!(recent
            .iter()
            .any(|e| matches!(e.payload, EventPayload::SyncError { .. })));

        // Explicit re-trigger after the link heals: only the missing
        // chunk crosses.
        transport_handle.heal().await;
        let retry = fx.orchestrator.retrigger("file-1", "n2").await.unwrap();
        let session = wait_terminal(&fx, &retry).await;

        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.bytes_transferred, 2048);
        assert_eq!(transport_handle.delivered_count().await, 3);
    }

    #[tokio::test]
    async fn test_fail_sessions_for_target_only_touches_active() {
        let fx = fixture().await;
        let version = upload(&fx, "file-1", "n1", &patterned(CHUNK, 3)).await;
        let sessions = fx.orchestrator.replicate_version(&version).await.unwrap();
        for id in &sessions {
            wait_terminal(&fx, id).await;
        }

        // All sessions already terminal: nothing transitions, no new
        // error events.
        let before = fx.orchestrator.stats().sessions_failed;
        fx.orchestrator.fail_sessions_for_target("n2").await;
        assert_eq!(fx.orchestrator.stats().sessions_failed, before);
    }

    #[tokio::test]
    async fn test_successive_versions_serialize_per_target() {
        let fx = fixture().await;
        fx.registry.remove("n3").await;

        let v1 = upload(&fx, "file-1", "n1", &patterned(2 * CHUNK, 1)).await;
        let v2 = upload(&fx, "file-1", "n1", &patterned(2 * CHUNK, 2)).await;

        let mut ids = fx.orchestrator.replicate_version(&v1).await.unwrap();
        ids.extend(fx.orchestrator.replicate_version(&v2).await.unwrap());

        for id in &ids {
            assert_eq!(wait_terminal(&fx, id).await.state, SessionState::Completed);
        }

        // Sessions ran in creation order: the replica ends at v2.
        let replica = fx
            .orchestrator
            .meta
            .replica_version("file-1", "n2")
            .await
            .unwrap();
        assert_eq!(replica.as_deref(), Some(v2.version_id.as_str()));
    }

    #[tokio::test]
    async fn test_concurrent_fanout_keeps_event_clocks_monotonic() {
        let fx = fixture().await;

        // Two files fan out to the same targets at the same time, so
        // their sessions race on every target's clock.
        let v1 = upload(&fx, "file-1", "n1", &patterned(10 * 1024, 1)).await;
        let v2 = upload(&fx, "file-2", "n1", &patterned(10 * 1024, 2)).await;

        let (first, second) = tokio::join!(
            fx.orchestrator.replicate_version(&v1),
            fx.orchestrator.replicate_version(&v2),
        );

        let mut ids = first.unwrap();
        ids.extend(second.unwrap());
        assert_eq!(ids.len(), 4);
        for id in &ids {
            assert_eq!(wait_terminal(&fx, id).await.state, SessionState::Completed);
        }

        // Per node, sequence order must match clock order.
        let mut events = fx.events.recent(200).await.unwrap();
        events.sort_by_key(|e| e.seq);
        for node in ["n1", "n2", "n3"] {
            let for_node: Vec<&Event> =
                events.iter().filter(|e| e.node_id == node).collect();
            for pair in for_node.windows(2) {
                assert!(
                    pair[1].vector_clock.dominates(&pair[0].vector_clock),
                    "event {} does not dominate its predecessor at {}",
                    pair[1].event_id,
                    node
                );
            }
        }
    }

    #[tokio::test]
    async fn test_retrigger_refuses_offline_target() {
        let fx = fixture().await;
        let version = upload(&fx, "file-1", "n1", &patterned(CHUNK, 4)).await;
        let sessions = fx.orchestrator.replicate_version(&version).await.unwrap();
        for id in &sessions {
            wait_terminal(&fx, id).await;
        }

        fx.registry
            .set_status("n2", crate::state::NodeStatus::Offline)
            .await
            .unwrap();

        let err = fx.orchestrator.retrigger("file-1", "n2").await.unwrap_err();
        assert!(matches!(err, Error::TargetOffline(_)));
    }
}
