//! Metadata Store
//!
//! Persistent relational record of nodes, files, versions, chunk
//! references, replicas, events, and conflicts, backed by SQLite. The
//! store owns uniqueness of `(file_id, version_id)` and the cascades
//! that follow a node's removal.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::state::{NodeInfo, NodeStatus};
use crate::store::chunks::ChunkHash;
use crate::sync::ChunkSignature;

use super::versions::{Conflict, FileRecord, FileVersion};

/// Aggregate row counts for the metrics endpoint
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub nodes: u64,
    pub files: u64,
    pub versions: u64,
    pub events: u64,
    pub unresolved_conflicts: u64,
}

/// SQLite-backed metadata store
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Create or open the store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory store (tests and ephemeral runs)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '[]',
                registered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS files (
                file_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS file_versions (
                version_id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
                parent_ids TEXT NOT NULL DEFAULT '[]',
                vector_clock TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                is_head INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_versions_file
                ON file_versions(file_id);

            CREATE TABLE IF NOT EXISTS version_chunks (
                version_id TEXT NOT NULL
                    REFERENCES file_versions(version_id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                size INTEGER NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (version_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_version_chunks_hash
                ON version_chunks(hash);

            CREATE TABLE IF NOT EXISTS replicas (
                file_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                version_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (file_id, node_id)
            );

            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                node_id TEXT NOT NULL,
                file_id TEXT,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_events_node ON events(node_id);

            CREATE TABLE IF NOT EXISTS conflicts (
                conflict_id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                version_a TEXT NOT NULL,
                version_b TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_conflicts_file ON conflicts(file_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ===== nodes =====

    /// Insert or refresh a node row
    pub async fn upsert_node(&self, node: &NodeInfo) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO nodes (node_id, name, address, port, status, capabilities, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(node_id) DO UPDATE SET
                name = ?2, address = ?3, port = ?4, status = ?5, capabilities = ?6
            "#,
            params![
                node.node_id,
                node.name,
                node.address,
                node.port,
                node.status.as_str(),
                serde_json::to_string(&node.capabilities)?,
                node.registered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a node row
    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        let conn = self.conn.lock().await;
        let node = conn
            .query_row(
                "SELECT node_id, name, address, port, status, capabilities, registered_at
                 FROM nodes WHERE node_id = ?1",
                params![node_id],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// All persisted nodes
    pub async fn all_nodes(&self) -> Result<Vec<NodeInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT node_id, name, address, port, status, capabilities, registered_at
             FROM nodes ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], row_to_node)?;
        collect_rows(rows)
    }

    /// Update a node's persisted status
    pub async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE nodes SET status = ?2 WHERE node_id = ?1",
            params![node_id, status.as_str()],
        )?;
        Ok(())
    }

    /// Remove a node and cascade its owned rows: replicas and events.
    /// Returns false when the node was unknown.
    pub async fn remove_node(&self, node_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM replicas WHERE node_id = ?1", params![node_id])?;
        tx.execute("DELETE FROM events WHERE node_id = ?1", params![node_id])?;
        let removed = tx.execute("DELETE FROM nodes WHERE node_id = ?1", params![node_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // ===== files =====

    /// Insert a file row if absent
    pub async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO files (file_id, name, path, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(file_id) DO UPDATE SET name = ?2, path = ?3
            "#,
            params![
                file.file_id,
                file.name,
                file.path,
                file.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Fetch a file row
    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().await;
        let file = conn
            .query_row(
                "SELECT file_id, name, path, created_at FROM files WHERE file_id = ?1",
                params![file_id],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    /// All file rows
    pub async fn all_files(&self) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT file_id, name, path, created_at FROM files ORDER BY file_id")?;
        let rows = stmt.query_map([], row_to_file)?;
        collect_rows(rows)
    }

    // ===== versions =====

    /// Persist a version with its chunk list, mark it a head, and clear
    /// the head flag of its superseded parents. One transaction.
    pub async fn insert_version(&self, version: &FileVersion, unhead: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO file_versions
                (version_id, file_id, parent_ids, vector_clock, size,
                 content_hash, created_by, created_at, is_head)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
            "#,
            params![
                version.version_id,
                version.file_id,
                serde_json::to_string(&version.parent_ids)?,
                serde_json::to_string(&version.vector_clock)?,
                version.size as i64,
                hex::encode(version.content_hash),
                version.created_by,
                version.created_at.to_rfc3339(),
            ],
        )?;

        for chunk in &version.chunks {
            tx.execute(
                r#"
                INSERT INTO version_chunks (version_id, chunk_index, offset, size, hash)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    version.version_id,
                    chunk.index,
                    chunk.offset as i64,
                    chunk.size,
                    hex::encode(chunk.hash),
                ],
            )?;
        }

        for parent in unhead {
            tx.execute(
                "UPDATE file_versions SET is_head = 0 WHERE version_id = ?1",
                params![parent],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch one version with its chunk list
    pub async fn get_version(&self, version_id: &str) -> Result<Option<FileVersion>> {
        let conn = self.conn.lock().await;
        let version = conn
            .query_row(
                "SELECT version_id, file_id, parent_ids, vector_clock, size,
                        content_hash, created_by, created_at
                 FROM file_versions WHERE version_id = ?1",
                params![version_id],
                row_to_version,
            )
            .optional()?;

        match version {
            Some(mut version) => {
                version.chunks = load_chunks(&conn, &version.version_id)?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    /// All versions of a file, insertion-ordered
    pub async fn versions_for_file(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT version_id, file_id, parent_ids, vector_clock, size,
                    content_hash, created_by, created_at
             FROM file_versions WHERE file_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![file_id], row_to_version)?;
        let mut versions: Vec<FileVersion> = collect_rows(rows)?;
        for version in &mut versions {
            version.chunks = load_chunks(&conn, &version.version_id)?;
        }
        Ok(versions)
    }

    /// Current head versions of a file
    pub async fn head_versions(&self, file_id: &str) -> Result<Vec<FileVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT version_id, file_id, parent_ids, vector_clock, size,
                    content_hash, created_by, created_at
             FROM file_versions WHERE file_id = ?1 AND is_head = 1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![file_id], row_to_version)?;
        let mut versions: Vec<FileVersion> = collect_rows(rows)?;
        for version in &mut versions {
            version.chunks = load_chunks(&conn, &version.version_id)?;
        }
        Ok(versions)
    }

    /// Head versions across every file
    pub async fn all_head_versions(&self) -> Result<Vec<FileVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT version_id, file_id, parent_ids, vector_clock, size,
                    content_hash, created_by, created_at
             FROM file_versions WHERE is_head = 1 ORDER BY file_id, rowid",
        )?;
        let rows = stmt.query_map([], row_to_version)?;
        let mut versions: Vec<FileVersion> = collect_rows(rows)?;
        for version in &mut versions {
            version.chunks = load_chunks(&conn, &version.version_id)?;
        }
        Ok(versions)
    }

    /// Reference counts derivable from stored chunk lists
    pub async fn chunk_refcounts(&self) -> Result<Vec<(ChunkHash, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT hash, COUNT(*) FROM version_chunks GROUP BY hash")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (hash_text, count) = row?;
            counts.push((parse_stored_hash(&hash_text)?, count));
        }
        Ok(counts)
    }

    // ===== replicas =====

    /// Record the version a target node now holds for a file
    pub async fn set_replica(&self, file_id: &str, node_id: &str, version_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO replicas (file_id, node_id, version_id, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(file_id, node_id) DO UPDATE SET
                version_id = ?3, updated_at = ?4
            "#,
            params![file_id, node_id, version_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Version a target node last confirmed for a file
    pub async fn replica_version(&self, file_id: &str, node_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let version = conn
            .query_row(
                "SELECT version_id FROM replicas WHERE file_id = ?1 AND node_id = ?2",
                params![file_id, node_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    // ===== events =====

    /// Persist an event and return its assigned sequence number
    pub async fn append_event(&self, event: &Event) -> Result<u64> {
        let conn = self.conn.lock().await;

        let wire = serde_json::to_value(&event.payload)?;
        let event_type = wire
            .get("event_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Internal("event payload missing type tag".into()))?
            .to_string();
        let data = wire
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        conn.execute(
            r#"
            INSERT INTO events
                (event_id, timestamp, node_id, file_id, event_type, data, vector_clock, processed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.node_id,
                event.file_id,
                event_type,
                serde_json::to_string(&data)?,
                serde_json::to_string(&event.vector_clock)?,
                event.processed,
            ],
        )?;

        Ok(conn.last_insert_rowid() as u64)
    }

    /// Most recent events, newest first
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, event_id, timestamp, node_id, file_id, event_type, data,
                    vector_clock, processed
             FROM events ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        collect_rows(rows)
    }

    /// Events not yet acknowledged by a consumer, oldest first
    pub async fn unprocessed_events(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, event_id, timestamp, node_id, file_id, event_type, data,
                    vector_clock, processed
             FROM events WHERE processed = 0 ORDER BY seq LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        collect_rows(rows)
    }

    /// Mark an event processed
    pub async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE events SET processed = 1 WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    /// The clock carried by a node's most recent event
    pub async fn last_clock_for_node(&self, node_id: &str) -> Result<Option<VectorClock>> {
        let conn = self.conn.lock().await;
        let clock: Option<String> = conn
            .query_row(
                "SELECT vector_clock FROM events WHERE node_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        match clock {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    // ===== conflicts =====

    /// Record a detected conflict
    pub async fn insert_conflict(&self, conflict: &Conflict) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO conflicts
                (conflict_id, file_id, version_a, version_b, detected_at, resolved, resolution)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                conflict.conflict_id,
                conflict.file_id,
                conflict.version_a,
                conflict.version_b,
                conflict.detected_at.to_rfc3339(),
                conflict.resolved,
                conflict.resolution,
            ],
        )?;
        Ok(())
    }

    /// Fetch a conflict
    pub async fn get_conflict(&self, conflict_id: &str) -> Result<Option<Conflict>> {
        let conn = self.conn.lock().await;
        let conflict = conn
            .query_row(
                "SELECT conflict_id, file_id, version_a, version_b, detected_at,
                        resolved, resolution
                 FROM conflicts WHERE conflict_id = ?1",
                params![conflict_id],
                row_to_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Conflicts not yet resolved, oldest first
    pub async fn unresolved_conflicts(&self) -> Result<Vec<Conflict>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT conflict_id, file_id, version_a, version_b, detected_at,
                    resolved, resolution
             FROM conflicts WHERE resolved = 0 ORDER BY detected_at",
        )?;
        let rows = stmt.query_map([], row_to_conflict)?;
        collect_rows(rows)
    }

    /// Record a conflict's resolution
    pub async fn mark_conflict_resolved(&self, conflict_id: &str, resolution: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE conflicts SET resolved = 1, resolution = ?2 WHERE conflict_id = ?1",
            params![conflict_id, resolution],
        )?;
        if updated == 0 {
            return Err(Error::ConflictNotFound(conflict_id.to_string()));
        }
        Ok(())
    }

    // ===== aggregates =====

    /// Row counts for the metrics surface
    pub async fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn.lock().await;
        let count = |sql: &str| -> Result<u64> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };

        Ok(StoreCounts {
            nodes: count("SELECT COUNT(*) FROM nodes")?,
            files: count("SELECT COUNT(*) FROM files")?,
            versions: count("SELECT COUNT(*) FROM file_versions")?,
            events: count("SELECT COUNT(*) FROM events")?,
            unresolved_conflicts: count("SELECT COUNT(*) FROM conflicts WHERE resolved = 0")?,
        })
    }
}

// ===== row mapping =====

fn parse_timestamp(text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(text: String) -> rusqlite::Result<T> {
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_stored_hash(text: &str) -> Result<ChunkHash> {
    let bytes = hex::decode(text)
        .map_err(|_| Error::Metadata(format!("corrupt chunk hash in store: {}", text)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Metadata(format!("corrupt chunk hash length in store: {}", text)))
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<NodeInfo> {
    Ok(NodeInfo {
        node_id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        port: row.get(3)?,
        status: NodeStatus::parse(&row.get::<_, String>(4)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })?,
        capabilities: parse_json(row.get::<_, String>(5)?)?,
        registered_at: parse_timestamp(row.get::<_, String>(6)?)?,
        last_heartbeat: None,
    })
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        file_id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: parse_timestamp(row.get::<_, String>(3)?)?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<FileVersion> {
    let hash_text: String = row.get(5)?;
    let content_hash = hex::decode(&hash_text)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "corrupt content hash",
                )),
            )
        })?;

    Ok(FileVersion {
        version_id: row.get(0)?,
        file_id: row.get(1)?,
        parent_ids: parse_json(row.get::<_, String>(2)?)?,
        vector_clock: parse_json(row.get::<_, String>(3)?)?,
        size: row.get::<_, i64>(4)? as u64,
        content_hash,
        created_by: row.get(6)?,
        created_at: parse_timestamp(row.get::<_, String>(7)?)?,
        chunks: Vec::new(),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(5)?;
    let data: serde_json::Value = parse_json(row.get::<_, String>(6)?)?;
    let payload = parse_json(
        serde_json::json!({ "event_type": event_type, "data": data }).to_string(),
    )?;

    Ok(Event {
        seq: row.get::<_, i64>(0)? as u64,
        event_id: row.get(1)?,
        timestamp: parse_timestamp(row.get::<_, String>(2)?)?,
        node_id: row.get(3)?,
        file_id: row.get(4)?,
        payload,
        vector_clock: parse_json(row.get::<_, String>(7)?)?,
        processed: row.get(8)?,
    })
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    Ok(Conflict {
        conflict_id: row.get(0)?,
        file_id: row.get(1)?,
        version_a: row.get(2)?,
        version_b: row.get(3)?,
        detected_at: parse_timestamp(row.get::<_, String>(4)?)?,
        resolved: row.get(5)?,
        resolution: row.get(6)?,
    })
}

fn load_chunks(conn: &Connection, version_id: &str) -> rusqlite::Result<Vec<ChunkSignature>> {
    let mut stmt = conn.prepare(
        "SELECT chunk_index, offset, size, hash FROM version_chunks
         WHERE version_id = ?1 ORDER BY chunk_index",
    )?;
    let rows = stmt.query_map(params![version_id], |row| {
        let hash_text: String = row.get(3)?;
        let hash = hex::decode(&hash_text)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "corrupt chunk hash",
                    )),
                )
            })?;
        Ok(ChunkSignature {
            index: row.get(0)?,
            offset: row.get::<_, i64>(1)? as u64,
            size: row.get(2)?,
            hash,
        })
    })?;

    rows.collect()
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
