//! File Version Store
//!
//! Per file, an immutable DAG of versions. Each version binds a vector
//! clock, a full chunk list, and links to the head versions it
//! supersedes. Heads normally form a singleton; two or more heads with
//! incomparable clocks mean unresolved concurrent history and produce a
//! conflict record.
//!
//! All mutations of one file's DAG are serialized behind a per-file
//! lock; readers work from snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{causal_sort, CausallyOrdered, ClockManager, ClockOrdering, VectorClock};
use crate::error::{Error, Result};
use crate::events::{EventLog, EventPayload};
use crate::store::chunks::{hash_hex, ChunkHash, ChunkStore};
use crate::store::metadata::MetadataStore;
use crate::sync::{ChunkSignature, Delta, DeltaEngine};

/// A synchronized file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One immutable version of a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub file_id: String,
    pub version_id: String,
    /// Head versions this one superseded at creation
    #[serde(default)]
    pub parent_ids: Vec<String>,
    pub vector_clock: VectorClock,
    pub chunks: Vec<ChunkSignature>,
    pub size: u64,
    #[serde(with = "hash_hex")]
    pub content_hash: ChunkHash,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl CausallyOrdered for FileVersion {
    fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn tie_breaker(&self) -> &str {
        &self.version_id
    }
}

/// Record of concurrent heads detected for a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub file_id: String,
    pub version_a: String,
    pub version_b: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolution: Option<String>,
}

/// Parameters for accepting a new version.
///
/// `clock` is the submitted causal claim. It drives the staleness check
/// and becomes the version's clock, with the originator's entry raised
/// just past every superseded head so the version strictly advances its
/// own line.
///
/// The caller owns one chunk-store reference per `chunks` entry before
/// calling in; those references become the version's.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub file_id: String,
    pub file_name: String,
    pub created_by: String,
    pub clock: VectorClock,
    pub chunks: Vec<ChunkSignature>,
    pub size: u64,
    pub content_hash: ChunkHash,
}

/// Store of per-file version DAGs
pub struct VersionStore {
    meta: Arc<MetadataStore>,
    chunks: Arc<ChunkStore>,
    clocks: Arc<ClockManager>,
    events: Arc<EventLog>,
    engine: DeltaEngine,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VersionStore {
    /// Assemble the store over its collaborators
    pub fn new(
        meta: Arc<MetadataStore>,
        chunks: Arc<ChunkStore>,
        clocks: Arc<ClockManager>,
        events: Arc<EventLog>,
        engine: DeltaEngine,
    ) -> Self {
        Self {
            meta,
            chunks,
            clocks,
            events,
            engine,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn release_chunk_refs(&self, chunks: &[ChunkSignature]) {
        for chunk in chunks {
            if let Err(error) = self.chunks.unref_chunk(&chunk.hash) {
                tracing::error!(
                    "failed to release chunk {}: {}",
                    hex::encode(chunk.hash),
                    error
                );
            }
        }
    }

    /// The logical mutex serializing one file's mutations
    async fn file_lock(&self, file_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Accept a new version for a file.
    ///
    /// Fails with `StaleVersion` when the submitted clock does not
    /// descend past every current head, and with `MissingChunk` when the
    /// chunk list references a body the store does not hold. A version
    /// whose clock is concurrent with a remaining head is accepted and
    /// flagged: one conflict record per concurrent head.
    pub async fn create_version(
        &self,
        request: NewVersion,
    ) -> Result<(FileVersion, Vec<Conflict>)> {
        let lock = self.file_lock(&request.file_id).await;
        let _guard = lock.lock().await;
        self.create_version_locked(request).await
    }

    async fn create_version_locked(
        &self,
        request: NewVersion,
    ) -> Result<(FileVersion, Vec<Conflict>)> {
        for chunk in &request.chunks {
            if !self.chunks.has(&chunk.hash) {
                return Err(Error::MissingChunk(hex::encode(chunk.hash)));
            }
        }

        if self.meta.get_file(&request.file_id).await?.is_none() {
            self.meta
                .upsert_file(&FileRecord {
                    file_id: request.file_id.clone(),
                    name: request.file_name.clone(),
                    path: None,
                    created_at: Utc::now(),
                })
                .await?;
        }

        let heads = self.meta.head_versions(&request.file_id).await?;

        for head in &heads {
            if matches!(
                request.clock.ordering(&head.vector_clock),
                ClockOrdering::Before | ClockOrdering::Equal
            ) {
                return Err(Error::StaleVersion {
                    file_id: request.file_id.clone(),
                });
            }
        }

        // The version's own entry must move strictly past every head it
        // supersedes, whatever the submitted claim carried.
        let mut clock = request.clock;
        let floor = heads
            .iter()
            .map(|head| head.vector_clock.get(&request.created_by))
            .max()
            .unwrap_or(0);
        if clock.get(&request.created_by) <= floor {
            clock.set(request.created_by.clone(), floor + 1);
        }

        // Heads the new clock dominates are superseded; the rest stay
        // and make the history concurrent.
        let (superseded, surviving): (Vec<_>, Vec<_>) = heads
            .into_iter()
            .partition(|head| clock.dominates(&head.vector_clock));

        let version = FileVersion {
            file_id: request.file_id.clone(),
            version_id: Uuid::new_v4().to_string(),
            parent_ids: superseded.iter().map(|v| v.version_id.clone()).collect(),
            vector_clock: clock,
            chunks: request.chunks,
            size: request.size,
            content_hash: request.content_hash,
            created_by: request.created_by.clone(),
            created_at: Utc::now(),
        };

        let unhead: Vec<String> = version.parent_ids.clone();
        self.meta.insert_version(&version, &unhead).await?;

        let mut conflicts = Vec::new();
        for head in &surviving {
            if head.vector_clock.is_concurrent_with(&version.vector_clock) {
                let conflict = Conflict {
                    conflict_id: Uuid::new_v4().to_string(),
                    file_id: version.file_id.clone(),
                    version_a: head.version_id.clone(),
                    version_b: version.version_id.clone(),
                    detected_at: Utc::now(),
                    resolved: false,
                    resolution: None,
                };
                self.meta.insert_conflict(&conflict).await?;
                tracing::warn!(
                    "conflict {} on file {}: {} || {}",
                    conflict.conflict_id,
                    conflict.file_id,
                    conflict.version_a,
                    conflict.version_b
                );

                self.events
                    .append_receipt(
                        version.created_by.clone(),
                        &version.vector_clock,
                        Some(version.file_id.clone()),
                        EventPayload::ConflictDetected {
                            conflict_id: conflict.conflict_id.clone(),
                            version_a: conflict.version_a.clone(),
                            version_b: conflict.version_b.clone(),
                        },
                    )
                    .await?;

                conflicts.push(conflict);
            }
        }

        Ok((version, conflicts))
    }

    /// Current head version(s) of a file
    pub async fn head(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        let heads = self.meta.head_versions(file_id).await?;
        if heads.is_empty() && self.meta.get_file(file_id).await?.is_none() {
            return Err(Error::FileNotFound(file_id.to_string()));
        }
        Ok(heads)
    }

    /// Full version history in causal order
    pub async fn history(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        if self.meta.get_file(file_id).await?.is_none() {
            return Err(Error::FileNotFound(file_id.to_string()));
        }
        let versions = self.meta.versions_for_file(file_id).await?;
        Ok(causal_sort(versions))
    }

    /// Fetch one version
    pub async fn get_version(&self, version_id: &str) -> Result<FileVersion> {
        self.meta
            .get_version(version_id)
            .await?
            .ok_or_else(|| Error::VersionNotFound(version_id.to_string()))
    }

    /// Reconstruct a version's full content from the chunk store
    pub async fn content(&self, version_id: &str) -> Result<Vec<u8>> {
        let version = self.get_version(version_id).await?;
        let mut content = Vec::with_capacity(version.size as usize);
        for chunk in &version.chunks {
            content.extend_from_slice(&self.chunks.get(&chunk.hash)?);
        }
        Ok(content)
    }

    /// Restore an old version as a new forward step.
    ///
    /// The new version carries the old content, supersedes every current
    /// head, and is clocked as `tick(originator)` over the merge of the
    /// head clocks. History is never rewritten.
    pub async fn restore(
        &self,
        file_id: &str,
        version_id: &str,
        originator: &str,
    ) -> Result<FileVersion> {
        let lock = self.file_lock(file_id).await;
        let _guard = lock.lock().await;

        let target = self.get_version(version_id).await?;
        if target.file_id != file_id {
            return Err(Error::VersionNotFound(version_id.to_string()));
        }

        let heads = self.meta.head_versions(file_id).await?;
        let mut merged = VectorClock::new();
        for head in &heads {
            merged.merge_from(&head.vector_clock);
        }
        let clock = self.clocks.merge(originator, &merged).await;

        for chunk in &target.chunks {
            self.chunks.ref_chunk(&chunk.hash)?;
        }

        let file_name = self
            .meta
            .get_file(file_id)
            .await?
            .map(|f| f.name)
            .unwrap_or_else(|| file_id.to_string());

        let created = self
            .create_version_locked(NewVersion {
                file_id: file_id.to_string(),
                file_name,
                created_by: originator.to_string(),
                clock,
                chunks: target.chunks.clone(),
                size: target.size,
                content_hash: target.content_hash,
            })
            .await;

        match created {
            Ok((version, _)) => Ok(version),
            Err(error) => {
                self.release_chunk_refs(&target.chunks);
                Err(error)
            }
        }
    }

    /// Resolve a conflict by promoting one side's content as a new head
    /// whose clock merges both branches.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        winner_version_id: &str,
    ) -> Result<FileVersion> {
        let conflict = self
            .meta
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        if conflict.resolved {
            return Err(Error::InvalidRequest(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        if winner_version_id != conflict.version_a && winner_version_id != conflict.version_b {
            return Err(Error::InvalidRequest(format!(
                "version {} is not a side of conflict {}",
                winner_version_id, conflict_id
            )));
        }

        let lock = self.file_lock(&conflict.file_id).await;
        let _guard = lock.lock().await;

        let winner = self.get_version(winner_version_id).await?;

        let heads = self.meta.head_versions(&conflict.file_id).await?;
        let mut merged = VectorClock::new();
        for head in &heads {
            merged.merge_from(&head.vector_clock);
        }
        let clock = self.clocks.merge(&winner.created_by, &merged).await;

        for chunk in &winner.chunks {
            self.chunks.ref_chunk(&chunk.hash)?;
        }

        let file_name = self
            .meta
            .get_file(&conflict.file_id)
            .await?
            .map(|f| f.name)
            .unwrap_or_else(|| conflict.file_id.clone());

        let created = self
            .create_version_locked(NewVersion {
                file_id: conflict.file_id.clone(),
                file_name,
                created_by: winner.created_by.clone(),
                clock,
                chunks: winner.chunks.clone(),
                size: winner.size,
                content_hash: winner.content_hash,
            })
            .await;
        let (version, _) = match created {
            Ok(created) => created,
            Err(error) => {
                self.release_chunk_refs(&winner.chunks);
                return Err(error);
            }
        };

        self.meta
            .mark_conflict_resolved(conflict_id, &format!("winner:{}", winner_version_id))
            .await?;

        self.events
            .append_receipt(
                winner.created_by.clone(),
                &version.vector_clock,
                Some(conflict.file_id.clone()),
                EventPayload::ConflictResolved {
                    conflict_id: conflict_id.to_string(),
                    winner_version_id: winner_version_id.to_string(),
                },
            )
            .await?;

        Ok(version)
    }

    /// Delta between two stored versions of a file
    pub async fn diff(
        &self,
        file_id: &str,
        from_version: &str,
        to_version: &str,
    ) -> Result<Delta> {
        let from = self.get_version(from_version).await?;
        let to = self.get_version(to_version).await?;
        if from.file_id != file_id || to.file_id != file_id {
            return Err(Error::FileNotFound(file_id.to_string()));
        }

        let from_content = self.content(from_version).await?;
        let to_content = self.content(to_version).await?;
        let base = self.engine.signature(&from_content);
        Ok(self.engine.delta(&base, &to_content))
    }

    /// The configured delta engine
    pub fn engine(&self) -> DeltaEngine {
        self.engine
    }
}
