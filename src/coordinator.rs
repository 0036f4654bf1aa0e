//! Coordinator
//!
//! Composition root: assembles the clock manager, stores, event log,
//! node registry, and replication orchestrator at startup, and exposes
//! the operations the API surface is built from. No component reaches
//! into another's mutable state; everything is threaded through here.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::clock::{ClockManager, VectorClock};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventLog, EventPayload};
use crate::replication::{CoordinatorTransport, Orchestrator, PeerTransport, ReplicationConfig, SyncSession};
use crate::state::{NodeInfo, NodeRegistry, NodeStatus};
use crate::store::chunks::ChunkHash;
use crate::store::{ChunkStore, Conflict, FileRecord, FileVersion, MetadataStore, VersionStore};
use crate::sync::{ChunkSignature, Delta, DeltaEngine, DeltaMetrics, DeltaOp};

/// One chunk of an upload. `data` is absent when the coordinator is
/// expected to already hold the body.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub hash: ChunkHash,
    pub data: Option<Vec<u8>>,
}

/// Decoded upload request
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_id: Option<String>,
    pub file_name: String,
    pub node_id: String,
    pub chunks: Vec<ChunkUpload>,
    pub vector_clock: VectorClock,
    pub use_delta_sync: bool,
}

/// Decoded delta submission against a declared base signature
#[derive(Debug, Clone)]
pub struct DeltaSubmission {
    pub node_id: String,
    pub base_digest: ChunkHash,
    pub ops: Vec<DeltaOp>,
    pub content_hash: ChunkHash,
    pub vector_clock: VectorClock,
}

/// Result of accepting a new version
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub file_id: String,
    pub version_id: String,
    pub metrics: DeltaMetrics,
    /// Conflicts raised by this acceptance (empty in the common case)
    pub conflicts: Vec<String>,
}

/// A file with its current head versions
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file: FileRecord,
    pub heads: Vec<FileVersion>,
}

/// Aggregate numbers for `/metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub nodes_total: usize,
    pub nodes_online: usize,
    pub files: u64,
    pub versions: u64,
    pub events: u64,
    pub unresolved_conflicts: u64,
    pub sessions_in_flight: usize,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub bytes_transferred: u64,
    pub bandwidth_saved: u64,
    pub average_compression_ratio: f64,
}

/// Chunk-store numbers for `/delta-metrics`
#[derive(Debug, Clone, Serialize)]
pub struct DeltaMetricsReport {
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub chunk_store_bytes: u64,
    pub bytes_transferred: u64,
    pub bandwidth_saved: u64,
    pub average_compression_ratio: f64,
}

/// The assembled coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    meta: Arc<MetadataStore>,
    chunks: Arc<ChunkStore>,
    clocks: Arc<ClockManager>,
    events: Arc<EventLog>,
    registry: Arc<NodeRegistry>,
    versions: Arc<VersionStore>,
    orchestrator: Arc<Orchestrator>,
    transport: Arc<dyn PeerTransport>,
    engine: DeltaEngine,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Assemble all components from configuration, restoring persisted
    /// nodes, clocks, and chunk reference counts.
    pub async fn new(config: CoordinatorConfig) -> Result<Arc<Self>> {
        let meta = Arc::new(MetadataStore::open(&config.metadata_path())?);
        let chunks = Arc::new(ChunkStore::new(config.chunk_dir())?);
        chunks.preload_refcounts(meta.chunk_refcounts().await?)?;

        let clocks = Arc::new(ClockManager::new());
        let events = Arc::new(EventLog::new(Arc::clone(&meta), Arc::clone(&clocks)));
        let registry = Arc::new(NodeRegistry::new(config.node_offline_after()));
        let engine = DeltaEngine::new(config.storage.chunk_size);

        // Rebuild node state: persisted nodes come back offline until
        // they heartbeat, each with the clock its last event carried.
        for node in meta.all_nodes().await? {
            let node_id = node.node_id.clone();
            registry.restore(node).await;
            match meta.last_clock_for_node(&node_id).await? {
                Some(clock) => clocks.restore_node(&node_id, clock).await,
                None => {
                    clocks.register_node(&node_id).await;
                }
            }
        }

        let versions = Arc::new(VersionStore::new(
            Arc::clone(&meta),
            Arc::clone(&chunks),
            Arc::clone(&clocks),
            Arc::clone(&events),
            engine,
        ));

        let transport: Arc<dyn PeerTransport> =
            Arc::new(CoordinatorTransport::new(Arc::clone(&registry)));

        let orchestrator = Arc::new(Orchestrator::new(
            ReplicationConfig::from(&config.sync),
            Arc::clone(&registry),
            Arc::clone(&versions),
            Arc::clone(&meta),
            Arc::clone(&events),
            Arc::clone(&transport),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            meta,
            chunks,
            clocks,
            events,
            registry,
            versions,
            orchestrator,
            transport,
            engine,
            shutdown,
        }))
    }

    /// The loaded configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ===== background monitoring =====

    /// Spawn the heartbeat monitor marking silent nodes offline
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_monitor().await;
        })
    }

    async fn run_monitor(&self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_offline().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("heartbeat monitor stopped");
    }

    /// One monitor pass: time out silent nodes, fail their sessions
    pub async fn sweep_offline(&self) {
        for node_id in self.registry.check_timeouts().await {
            if let Err(error) = self.handle_node_offline(&node_id).await {
                tracing::error!("offline handling for {} failed: {}", node_id, error);
            }
        }
    }

    async fn handle_node_offline(&self, node_id: &str) -> Result<()> {
        self.meta
            .set_node_status(node_id, NodeStatus::Offline)
            .await?;

        self.events
            .append_local(
                node_id,
                None,
                EventPayload::NodeStatusChanged {
                    status: NodeStatus::Offline,
                },
            )
            .await?;

        self.orchestrator.fail_sessions_for_target(node_id).await;
        Ok(())
    }

    /// Signal background tasks to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    // ===== nodes =====

    /// Register a node (or refresh a returning one) and give it a clock
    pub async fn register_node(
        &self,
        node_id: String,
        name: String,
        address: String,
        port: u16,
        capabilities: Vec<String>,
    ) -> Result<NodeInfo> {
        if node_id.is_empty() {
            return Err(Error::InvalidRequest("node_id cannot be empty".into()));
        }

        let mut info = NodeInfo::new(node_id.clone(), name.clone(), address.clone(), port);
        info.capabilities = capabilities;

        let is_new = self.registry.register(info.clone()).await;
        self.meta.upsert_node(&info).await?;
        self.clocks.register_node(&node_id).await;

        self.events
            .append_local(
                node_id.clone(),
                None,
                EventPayload::NodeRegistered {
                    name,
                    address,
                    port,
                },
            )
            .await?;

        tracing::info!(
            "node {} {}",
            node_id,
            if is_new { "registered" } else { "re-registered" }
        );

        self.registry
            .get(&node_id)
            .await
            .ok_or_else(|| Error::Internal("registered node vanished".into()))
    }

    /// All nodes with status
    pub async fn list_nodes(&self) -> Vec<NodeInfo> {
        self.registry.all().await
    }

    /// One node's state
    pub async fn get_node(&self, node_id: &str) -> Result<NodeInfo> {
        self.registry
            .get(node_id)
            .await
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))
    }

    /// Record a heartbeat from a node
    pub async fn heartbeat(&self, node_id: &str) -> Result<NodeStatus> {
        self.registry.heartbeat(node_id).await
    }

    /// Remove a node: cancel its sessions, drop its clock, cascade its
    /// metadata rows, and record the removal.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        let info = self
            .registry
            .remove(node_id)
            .await
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        self.orchestrator.fail_sessions_for_target(node_id).await;
        self.transport.forget_target(node_id).await;

        let final_clock = self.clocks.snapshot(node_id).await.unwrap_or_default();
        self.clocks.remove_node(node_id).await;
        self.meta.remove_node(node_id).await?;

        self.events
            .append(
                node_id.to_string(),
                None,
                final_clock,
                EventPayload::NodeRemoved { name: info.name },
            )
            .await?;

        tracing::info!("node {} removed", node_id);
        Ok(())
    }

    // ===== files & versions =====

    /// Accept an upload: verify and store chunk bodies, bind the version
    /// to the submitted clock, and fan it out to all online peers.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome> {
        self.get_node(&request.node_id).await?;
        let _ = self.registry.heartbeat(&request.node_id).await;

        let chunk_size = self.engine.chunk_size();
        let count = request.chunks.len();
        let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(count);
        let mut taken: Vec<ChunkHash> = Vec::new();
        let mut metrics = DeltaMetrics {
            chunks_total: count as u64,
            ..DeltaMetrics::default()
        };

        for (index, chunk) in request.chunks.iter().enumerate() {
            let outcome = self.ingest_chunk(chunk, &mut metrics);
            let body = match outcome {
                Ok(body) => body,
                Err(error) => {
                    self.release_refs(&taken);
                    return Err(error);
                }
            };

            if index + 1 < count && body.len() != chunk_size {
                self.release_refs(&taken);
                return Err(Error::InvalidRequest(format!(
                    "chunk {} is {} bytes; every chunk but the last must be {}",
                    index,
                    body.len(),
                    chunk_size
                )));
            }

            taken.push(chunk.hash);
            bodies.push(body);
        }

        let total = metrics.bytes_transferred + metrics.bytes_saved;
        if total > 0 {
            metrics.compression_ratio = metrics.bytes_saved as f64 / total as f64;
        }

        let mut signature = Vec::with_capacity(count);
        let mut offset = 0u64;
        let mut content = Vec::new();
        for (index, body) in bodies.iter().enumerate() {
            signature.push(ChunkSignature {
                index: index as u32,
                offset,
                size: body.len() as u32,
                hash: request.chunks[index].hash,
            });
            offset += body.len() as u64;
            content.extend_from_slice(body);
        }

        let file_id = request
            .file_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let outcome = self
            .accept_version(
                file_id,
                request.file_name,
                request.node_id,
                request.vector_clock,
                signature,
                content.len() as u64,
                crate::store::chunks::content_hash(&content),
                metrics,
            )
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                self.release_refs(&taken);
                Err(error)
            }
        }
    }

    fn ingest_chunk(&self, chunk: &ChunkUpload, metrics: &mut DeltaMetrics) -> Result<Vec<u8>> {
        match &chunk.data {
            Some(data) => {
                self.chunks.put_with_hash(&chunk.hash, data)?;
                metrics.chunks_inserted += 1;
                metrics.bytes_transferred += data.len() as u64;
                Ok(data.clone())
            }
            None => {
                if !self.chunks.has(&chunk.hash) {
                    return Err(Error::MissingChunk(hex::encode(chunk.hash)));
                }
                self.chunks.ref_chunk(&chunk.hash)?;
                let body = self.chunks.get(&chunk.hash)?;
                metrics.chunks_copied += 1;
                metrics.bytes_saved += body.len() as u64;
                Ok(body)
            }
        }
    }

    fn release_refs(&self, taken: &[ChunkHash]) {
        for hash in taken {
            if let Err(error) = self.chunks.unref_chunk(hash) {
                tracing::error!("failed to release chunk {}: {}", hex::encode(hash), error);
            }
        }
    }

    /// Shared tail of upload/delta acceptance: create the version, log
    /// the modification, and start the fan-out.
    #[allow(clippy::too_many_arguments)]
    async fn accept_version(
        &self,
        file_id: String,
        file_name: String,
        node_id: String,
        submitted_clock: VectorClock,
        signature: Vec<ChunkSignature>,
        size: u64,
        content_hash: ChunkHash,
        metrics: DeltaMetrics,
    ) -> Result<UploadOutcome> {
        let (version, conflicts) = self
            .versions
            .create_version(crate::store::versions::NewVersion {
                file_id: file_id.clone(),
                file_name: file_name.clone(),
                created_by: node_id.clone(),
                clock: submitted_clock,
                chunks: signature,
                size,
                content_hash,
            })
            .await?;

        // The version is committed at this point; audit or fan-out
        // trouble must not unwind the caller's chunk references. The
        // receipt append advances the coordinator's record of the
        // node's clock past the accepted version, atomically with the
        // event that records it.
        let logged = self
            .events
            .append_receipt(
                node_id,
                &version.vector_clock,
                Some(file_id.clone()),
                EventPayload::FileModified {
                    file_name,
                    version_id: version.version_id.clone(),
                    size,
                },
            )
            .await;
        if let Err(error) = logged {
            tracing::error!("file_modified event for {} failed: {}", file_id, error);
        }

        if let Err(error) = self.orchestrator.replicate_version(&version).await {
            tracing::error!("fan-out of {} failed to start: {}", version.version_id, error);
        }

        Ok(UploadOutcome {
            file_id,
            version_id: version.version_id,
            metrics,
            conflicts: conflicts.into_iter().map(|c| c.conflict_id).collect(),
        })
    }

    /// Accept a delta against a declared base signature
    pub async fn submit_delta(
        &self,
        file_id: &str,
        submission: DeltaSubmission,
    ) -> Result<UploadOutcome> {
        self.get_node(&submission.node_id).await?;

        let heads = self.versions.head(file_id).await?;
        let base = heads
            .iter()
            .find(|head| DeltaEngine::signature_digest(&head.chunks) == submission.base_digest)
            .ok_or_else(|| Error::StaleVersion {
                file_id: file_id.to_string(),
            })?;

        let base_content = self.versions.content(&base.version_id).await?;
        let delta = Delta {
            base_digest: submission.base_digest,
            ops: submission.ops,
        };
        let new_content = self
            .engine
            .apply(&base_content, &delta, &submission.content_hash)?;
        let metrics = DeltaEngine::metrics(&delta);

        let signature = self.engine.signature(&new_content);
        let mut taken: Vec<ChunkHash> = Vec::new();
        for (chunk, body) in signature
            .iter()
            .zip(new_content.chunks(self.engine.chunk_size().max(1)))
        {
            let stored = if self.chunks.has(&chunk.hash) {
                self.chunks.ref_chunk(&chunk.hash)
            } else {
                self.chunks.put(body).map(|_| ())
            };
            if let Err(error) = stored {
                self.release_refs(&taken);
                return Err(error);
            }
            taken.push(chunk.hash);
        }

        let file_name = self
            .meta
            .get_file(file_id)
            .await?
            .map(|f| f.name)
            .unwrap_or_else(|| file_id.to_string());

        let outcome = self
            .accept_version(
                file_id.to_string(),
                file_name,
                submission.node_id,
                submission.vector_clock,
                signature,
                new_content.len() as u64,
                submission.content_hash,
                metrics,
            )
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                self.release_refs(&taken);
                Err(error)
            }
        }
    }

    /// All files with their current heads
    pub async fn list_files(&self) -> Result<Vec<FileSummary>> {
        let mut summaries = Vec::new();
        for file in self.meta.all_files().await? {
            let heads = self.meta.head_versions(&file.file_id).await?;
            summaries.push(FileSummary { file, heads });
        }
        Ok(summaries)
    }

    /// Current head version(s) of a file
    pub async fn file_head(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        self.versions.head(file_id).await
    }

    /// Chunk signature of the current head, for peers preparing a delta
    pub async fn file_chunks(&self, file_id: &str) -> Result<Vec<ChunkSignature>> {
        let heads = self.versions.head(file_id).await?;
        heads
            .into_iter()
            .next()
            .map(|head| head.chunks)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))
    }

    /// Reconstructed bytes of the current head
    pub async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        let heads = self.versions.head(file_id).await?;
        let head = heads
            .into_iter()
            .next()
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;
        self.versions.content(&head.version_id).await
    }

    /// Causal-ordered version history
    pub async fn file_history(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        self.versions.history(file_id).await
    }

    /// Restore an old version as a new head and fan it out.
    /// `node_id` defaults to the restored version's author.
    pub async fn restore(
        &self,
        file_id: &str,
        version_id: &str,
        node_id: Option<String>,
    ) -> Result<FileVersion> {
        let originator = match node_id {
            Some(id) => id,
            None => self.versions.get_version(version_id).await?.created_by,
        };

        let version = self
            .versions
            .restore(file_id, version_id, &originator)
            .await?;

        self.events
            .append_receipt(
                originator,
                &version.vector_clock,
                Some(file_id.to_string()),
                EventPayload::FileModified {
                    file_name: self
                        .meta
                        .get_file(file_id)
                        .await?
                        .map(|f| f.name)
                        .unwrap_or_else(|| file_id.to_string()),
                    version_id: version.version_id.clone(),
                    size: version.size,
                },
            )
            .await?;

        self.orchestrator.replicate_version(&version).await?;
        Ok(version)
    }

    // ===== conflicts =====

    /// Unresolved conflicts
    pub async fn conflicts(&self) -> Result<Vec<Conflict>> {
        self.meta.unresolved_conflicts().await
    }

    /// Resolve a conflict and fan the resolution out
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        winner_version_id: &str,
    ) -> Result<FileVersion> {
        let version = self
            .versions
            .resolve_conflict(conflict_id, winner_version_id)
            .await?;
        self.orchestrator.replicate_version(&version).await?;
        Ok(version)
    }

    // ===== events & clocks =====

    /// Recent events, newest first
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        self.events.recent(limit).await
    }

    /// Recent events in causal order
    pub async fn causal_events(&self, limit: usize) -> Result<Vec<Event>> {
        self.events.causal_recent(limit).await
    }

    /// Live event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Mark an event acknowledged by a consumer
    pub async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        self.events.mark_processed(event_id).await
    }

    /// Current vector clock per node
    pub async fn vector_clocks(&self) -> std::collections::HashMap<String, VectorClock> {
        self.clocks.all_clocks().await
    }

    // ===== metrics =====

    /// Aggregates for `/metrics`
    pub async fn metrics(&self) -> Result<MetricsReport> {
        let counts = self.meta.counts().await?;
        let nodes = self.registry.all().await;
        let online = nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Online | NodeStatus::Syncing))
            .count();
        let stats = self.orchestrator.stats();

        Ok(MetricsReport {
            nodes_total: nodes.len(),
            nodes_online: online,
            files: counts.files,
            versions: counts.versions,
            events: counts.events,
            unresolved_conflicts: counts.unresolved_conflicts,
            sessions_in_flight: self.orchestrator.in_flight().await,
            sessions_completed: stats.sessions_completed,
            sessions_failed: stats.sessions_failed,
            bytes_transferred: stats.bytes_transferred,
            bandwidth_saved: stats.bytes_saved,
            average_compression_ratio: stats.average_compression_ratio,
        })
    }

    /// Chunk-store numbers for `/delta-metrics`
    pub fn delta_metrics(&self) -> DeltaMetricsReport {
        let (chunk_count, chunk_store_bytes) = self.chunks.stats();
        let stats = self.orchestrator.stats();

        DeltaMetricsReport {
            chunk_size: self.engine.chunk_size(),
            chunk_count,
            chunk_store_bytes,
            bytes_transferred: stats.bytes_transferred,
            bandwidth_saved: stats.bytes_saved,
            average_compression_ratio: stats.average_compression_ratio,
        }
    }

    /// Replication session snapshots
    pub async fn sessions(&self) -> Vec<SyncSession> {
        self.orchestrator.sessions().await
    }

    /// Re-trigger replication of a file's head to one target
    pub async fn retrigger_replication(&self, file_id: &str, target: &str) -> Result<String> {
        self.orchestrator.retrigger(file_id, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, StorageConfig, SyncConfig};
    use crate::store::chunks::content_hash;
    use tempfile::tempdir;

    const CHUNK: usize = 4096;

    async fn coordinator(dir: &std::path::Path) -> Arc<Coordinator> {
        let config = CoordinatorConfig {
            node: NodeConfig {
                id: "coordinator".into(),
                data_dir: dir.to_path_buf(),
            },
            storage: StorageConfig { chunk_size: CHUNK },
            sync: SyncConfig {
                heartbeat_interval_ms: 50,
                node_offline_after_ms: 150,
                ..SyncConfig::default()
            },
            api: Default::default(),
            logging: Default::default(),
        };
        Coordinator::new(config).await.unwrap()
    }

    async fn register_fleet(coordinator: &Coordinator, ids: &[&str]) {
        for id in ids {
            coordinator
                .register_node(
                    id.to_string(),
                    format!("node {}", id),
                    "127.0.0.1".into(),
                    9000,
                    vec![],
                )
                .await
                .unwrap();
        }
    }

    fn chunked(content: &[u8]) -> Vec<ChunkUpload> {
        content
            .chunks(CHUNK)
            .map(|chunk| ChunkUpload {
                hash: content_hash(chunk),
                data: Some(chunk.to_vec()),
            })
            .collect()
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    async fn wait_sessions_settled(coordinator: &Coordinator) {
        for _ in 0..300 {
            if coordinator.sessions().await.iter().all(|s| s.state.is_terminal()) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("sessions did not settle");
    }

    #[tokio::test]
    async fn test_upload_creates_version_and_fans_out() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2", "n3"]).await;

        let content = patterned(10 * 1024, 1);
        let outcome = coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n1".into(),
                chunks: chunked(&content),
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap();

        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.metrics.chunks_inserted, 3);

        wait_sessions_settled(&coordinator).await;

        let heads = coordinator.file_head("file-1").await.unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].version_id, outcome.version_id);

        let bytes = coordinator.file_content("file-1").await.unwrap();
        assert_eq!(bytes, content);

        let metrics = coordinator.metrics().await.unwrap();
        assert_eq!(metrics.sessions_completed, 2);
        assert_eq!(metrics.nodes_online, 3);
    }

    #[tokio::test]
    async fn test_upload_with_known_chunks_saves_bandwidth() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2"]).await;

        let content = patterned(2 * CHUNK, 1);
        coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n1".into(),
                chunks: chunked(&content),
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap();
        wait_sessions_settled(&coordinator).await;

        // A second file re-declares the same chunks without bodies.
        let reuse: Vec<ChunkUpload> = content
            .chunks(CHUNK)
            .map(|chunk| ChunkUpload {
                hash: content_hash(chunk),
                data: None,
            })
            .collect();

        let outcome = coordinator
            .upload(UploadRequest {
                file_id: Some("file-2".into()),
                file_name: "copy.bin".into(),
                node_id: "n1".into(),
                chunks: reuse,
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap();

        assert_eq!(outcome.metrics.chunks_copied, 2);
        assert_eq!(outcome.metrics.bytes_transferred, 0);
        assert_eq!(outcome.metrics.bytes_saved, 2 * CHUNK as u64);
        wait_sessions_settled(&coordinator).await;
    }

    #[tokio::test]
    async fn test_stale_upload_rejected() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2"]).await;

        let content = patterned(CHUNK, 1);
        coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n1".into(),
                chunks: chunked(&content),
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap();
        wait_sessions_settled(&coordinator).await;

        // An empty clock is strictly below the current head.
        let err = coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n2".into(),
                chunks: chunked(&patterned(CHUNK, 9)),
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_uploads_detect_conflict() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2", "n3"]).await;

        let base = patterned(CHUNK, 1);
        let v1 = coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n1".into(),
                chunks: chunked(&base),
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap();
        wait_sessions_settled(&coordinator).await;

        // Both peers observed v1, then edit independently: each claims
        // the head clock plus its own local tick.
        let v1_clock = coordinator
            .file_head("file-1")
            .await
            .unwrap()
            .remove(0)
            .vector_clock;
        let mut n2_claim = v1_clock.clone();
        n2_claim.increment("n2");
        let mut n3_claim = v1_clock;
        n3_claim.increment("n3");

        let from_n2 = coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n2".into(),
                chunks: chunked(&patterned(CHUNK, 50)),
                vector_clock: n2_claim,
                use_delta_sync: true,
            })
            .await
            .unwrap();
        assert!(from_n2.conflicts.is_empty());

        let from_n3 = coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n3".into(),
                chunks: chunked(&patterned(CHUNK, 80)),
                vector_clock: n3_claim,
                use_delta_sync: true,
            })
            .await
            .unwrap();

        assert_eq!(from_n3.conflicts.len(), 1);

        let heads = coordinator.file_head("file-1").await.unwrap();
        assert_eq!(heads.len(), 2);

        let conflicts = coordinator.conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);

        // History keeps all three versions queryable.
        let history = coordinator.file_history("file-1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().any(|v| v.version_id == v1.version_id));

        wait_sessions_settled(&coordinator).await;

        // Resolution collapses the heads again.
        let resolved = coordinator
            .resolve_conflict(&from_n3.conflicts[0], &from_n2.version_id)
            .await
            .unwrap();
        let heads = coordinator.file_head("file-1").await.unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].version_id, resolved.version_id);
        wait_sessions_settled(&coordinator).await;
    }

    #[tokio::test]
    async fn test_restore_creates_new_head_and_replicates() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2"]).await;

        let mut version_ids = Vec::new();
        for seed in 1..=3u8 {
            let mut clock = coordinator
                .vector_clocks()
                .await
                .get("n1")
                .cloned()
                .unwrap_or_default();
            clock.increment("n1");
            let outcome = coordinator
                .upload(UploadRequest {
                    file_id: Some("file-1".into()),
                    file_name: "report.bin".into(),
                    node_id: "n1".into(),
                    chunks: chunked(&patterned(CHUNK, seed)),
                    vector_clock: clock,
                    use_delta_sync: true,
                })
                .await
                .unwrap();
            version_ids.push(outcome.version_id);
            wait_sessions_settled(&coordinator).await;
        }

        let restored = coordinator
            .restore("file-1", &version_ids[0], Some("n1".into()))
            .await
            .unwrap();
        wait_sessions_settled(&coordinator).await;

        let content = coordinator.file_content("file-1").await.unwrap();
        assert_eq!(content, patterned(CHUNK, 1));

        let history = coordinator.file_history("file-1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().unwrap().version_id, restored.version_id);
    }

    #[tokio::test]
    async fn test_delta_submission_against_head() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2"]).await;

        let old = patterned(3 * CHUNK, 1);
        coordinator
            .upload(UploadRequest {
                file_id: Some("file-1".into()),
                file_name: "report.bin".into(),
                node_id: "n1".into(),
                chunks: chunked(&old),
                vector_clock: VectorClock::new(),
                use_delta_sync: true,
            })
            .await
            .unwrap();
        wait_sessions_settled(&coordinator).await;

        let mut new = old.clone();
        for byte in &mut new[CHUNK..2 * CHUNK] {
            *byte = byte.wrapping_add(31);
        }

        let engine = DeltaEngine::new(CHUNK);
        let base_signature = coordinator.file_chunks("file-1").await.unwrap();
        let delta = engine.delta(&base_signature, &new);
        let mut clock = coordinator.vector_clocks().await["n1"].clone();
        clock.increment("n1");

        let outcome = coordinator
            .submit_delta(
                "file-1",
                DeltaSubmission {
                    node_id: "n1".into(),
                    base_digest: delta.base_digest,
                    ops: delta.ops,
                    content_hash: content_hash(&new),
                    vector_clock: clock,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.metrics.chunks_inserted, 1);
        assert_eq!(outcome.metrics.bytes_saved, 2 * CHUNK as u64);
        wait_sessions_settled(&coordinator).await;

        let content = coordinator.file_content("file-1").await.unwrap();
        assert_eq!(content, new);
    }

    #[tokio::test]
    async fn test_monitor_marks_silent_nodes_offline() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2"]).await;

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        coordinator.sweep_offline().await;

        let node = coordinator.get_node("n2").await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);

        let events = coordinator.recent_events(20).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e.payload,
            EventPayload::NodeStatusChanged {
                status: NodeStatus::Offline
            }
        )));

        // A heartbeat brings the node back.
        coordinator.heartbeat("n2").await.unwrap();
        let node = coordinator.get_node("n2").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_remove_node_cascades() {
        let dir = tempdir().unwrap();
        let coordinator = coordinator(dir.path()).await;
        register_fleet(&coordinator, &["n1", "n2"]).await;

        coordinator.remove_node("n2").await.unwrap();

        assert!(matches!(
            coordinator.get_node("n2").await,
            Err(Error::NodeNotFound(_))
        ));
        assert!(!coordinator.vector_clocks().await.contains_key("n2"));

        let err = coordinator.remove_node("n2").await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();

        let version_id;
        {
            let coordinator = coordinator(dir.path()).await;
            register_fleet(&coordinator, &["n1", "n2"]).await;
            let outcome = coordinator
                .upload(UploadRequest {
                    file_id: Some("file-1".into()),
                    file_name: "report.bin".into(),
                    node_id: "n1".into(),
                    chunks: chunked(&patterned(2 * CHUNK, 5)),
                    vector_clock: VectorClock::new(),
                    use_delta_sync: true,
                })
                .await
                .unwrap();
            version_id = outcome.version_id;
            wait_sessions_settled(&coordinator).await;
            coordinator.shutdown();
        }

        let coordinator = coordinator(dir.path()).await;

        // Nodes restored offline until they heartbeat again.
        let node = coordinator.get_node("n1").await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);

        // Content still reconstructs from the reloaded chunk store.
        let heads = coordinator.file_head("file-1").await.unwrap();
        assert_eq!(heads[0].version_id, version_id);
        let content = coordinator.file_content("file-1").await.unwrap();
        assert_eq!(content, patterned(2 * CHUNK, 5));
    }
}
