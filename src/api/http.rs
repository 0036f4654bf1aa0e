//! HTTP API Server
//!
//! REST API for node registration, uploads, delta submission, history,
//! conflicts, events, and metrics.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::config::ApiConfig;
use crate::coordinator::{ChunkUpload, Coordinator, DeltaSubmission, UploadRequest};
use crate::error::{Error, Result};
use crate::store::chunks::parse_hash;
use crate::sync::DeltaOp;

use super::ws;

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    coordinator: Arc<Coordinator>,
}

impl HttpServer {
    /// Create a server over an assembled coordinator
    pub fn new(config: ApiConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/register", post(handle_register))
            .route("/nodes", get(handle_nodes))
            .route("/nodes/:node_id", get(handle_node).delete(handle_remove_node))
            .route("/nodes/:node_id/heartbeat", post(handle_heartbeat))
            .route("/files", get(handle_files))
            .route("/files/upload", post(handle_upload))
            .route("/files/:file_id", get(handle_file))
            .route("/files/:file_id/chunks", get(handle_file_chunks))
            .route("/files/:file_id/delta", post(handle_delta))
            .route("/files/:file_id/history", get(handle_history))
            .route("/files/:file_id/restore", post(handle_restore))
            .route("/files/:file_id/content", get(handle_content))
            .route("/files/:file_id/replicate", post(handle_replicate))
            .route("/conflicts", get(handle_conflicts))
            .route("/conflicts/:conflict_id/resolve", post(handle_resolve))
            .route("/events", get(handle_events))
            .route("/causal-order", get(handle_causal_order))
            .route("/vector-clocks", get(handle_vector_clocks))
            .route("/metrics", get(handle_metrics))
            .route("/delta-metrics", get(handle_delta_metrics))
            .route("/health", get(handle_health))
            .route("/ws", get(ws::handle_ws))
            .with_state(Arc::clone(&self.coordinator))
    }

    /// Start serving
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Transport(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Error mapping ============

/// Error wrapper implementing the HTTP status mapping
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

fn error_code(error: &Error) -> &'static str {
    match error {
        Error::NodeNotFound(_)
        | Error::FileNotFound(_)
        | Error::VersionNotFound(_)
        | Error::ChunkNotFound(_)
        | Error::ConflictNotFound(_) => "not_found",
        Error::StaleVersion { .. } => "stale_version",
        Error::MissingChunk(_) => "missing_chunk",
        Error::DeltaIntegrity(_) => "delta_integrity_error",
        Error::SessionTimeout { .. } => "session_timeout",
        Error::TargetOffline(_) => "target_offline",
        Error::Transport(_) => "transport_error",
        Error::InvalidRequest(_) => "invalid_request",
        _ => "internal_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            Error::NodeNotFound(_)
            | Error::FileNotFound(_)
            | Error::VersionNotFound(_)
            | Error::ChunkNotFound(_)
            | Error::ConflictNotFound(_) => StatusCode::NOT_FOUND,
            Error::StaleVersion { .. } => StatusCode::CONFLICT,
            Error::MissingChunk(_) => StatusCode::PRECONDITION_FAILED,
            Error::DeltaIntegrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::SessionTimeout { .. } | Error::TargetOffline(_) | Error::Transport(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorResponse {
            error: self.0.to_string(),
            code: error_code(&self.0),
        };

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Request/Response Types ============

/// Node registration request
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// File metadata carried by an upload
#[derive(Debug, Deserialize)]
pub struct FileMetaDto {
    #[serde(default)]
    pub file_id: Option<String>,
    pub name: String,
    pub owner_node: String,
}

/// One uploaded chunk: hex digest plus optional base64 body
#[derive(Debug, Deserialize)]
pub struct ChunkDto {
    pub hash: String,
    #[serde(default)]
    pub data: Option<String>,
}

/// Upload request
#[derive(Debug, Deserialize)]
pub struct UploadRequestDto {
    pub file_metadata: FileMetaDto,
    pub chunks: Vec<ChunkDto>,
    #[serde(default)]
    pub vector_clock: VectorClock,
    #[serde(default = "default_true")]
    pub use_delta_sync: bool,
}

fn default_true() -> bool {
    true
}

/// One delta operation on the wire
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOpDto {
    Copy {
        from_index: u32,
        count: u32,
        size: u64,
    },
    Insert {
        hash: String,
        size: u32,
        #[serde(default)]
        bytes: Option<String>,
    },
}

/// Delta submission request
#[derive(Debug, Deserialize)]
pub struct DeltaRequestDto {
    pub node_id: String,
    pub base_digest: String,
    pub ops: Vec<DeltaOpDto>,
    pub content_hash: String,
    #[serde(default)]
    pub vector_clock: VectorClock,
}

/// Restore request
#[derive(Debug, Deserialize)]
pub struct RestoreRequestDto {
    pub version_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Conflict resolution request
#[derive(Debug, Deserialize)]
pub struct ResolveRequestDto {
    pub winner_version_id: String,
}

/// Replication re-trigger request
#[derive(Debug, Deserialize)]
pub struct ReplicateRequestDto {
    pub target_node: String,
}

/// Query string for event listings
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

// ============ Handlers ============

async fn handle_register(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let node = coordinator
        .register_node(
            request.node_id,
            request.name,
            request.address,
            request.port,
            request.capabilities,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn handle_nodes(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.list_nodes().await)
}

async fn handle_node(
    State(coordinator): State<Arc<Coordinator>>,
    Path(node_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.get_node(&node_id).await?))
}

async fn handle_remove_node(
    State(coordinator): State<Arc<Coordinator>>,
    Path(node_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    coordinator.remove_node(&node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_heartbeat(
    State(coordinator): State<Arc<Coordinator>>,
    Path(node_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = coordinator.heartbeat(&node_id).await?;
    Ok(Json(serde_json::json!({ "node_id": node_id, "status": status })))
}

async fn handle_files(
    State(coordinator): State<Arc<Coordinator>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.list_files().await?))
}

async fn handle_file(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.file_head(&file_id).await?))
}

async fn handle_file_chunks(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.file_chunks(&file_id).await?))
}

async fn handle_upload(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<UploadRequestDto>,
) -> ApiResult<impl IntoResponse> {
    let mut chunks = Vec::with_capacity(request.chunks.len());
    for chunk in &request.chunks {
        chunks.push(ChunkUpload {
            hash: parse_hash(&chunk.hash)?,
            data: chunk.data.as_deref().map(decode_body).transpose()?,
        });
    }

    let outcome = coordinator
        .upload(UploadRequest {
            file_id: request.file_metadata.file_id,
            file_name: request.file_metadata.name,
            node_id: request.file_metadata.owner_node,
            chunks,
            vector_clock: request.vector_clock,
            use_delta_sync: request.use_delta_sync,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn handle_delta(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
    Json(request): Json<DeltaRequestDto>,
) -> ApiResult<impl IntoResponse> {
    let mut ops = Vec::with_capacity(request.ops.len());
    for op in request.ops {
        ops.push(match op {
            DeltaOpDto::Copy {
                from_index,
                count,
                size,
            } => DeltaOp::Copy {
                from_index,
                count,
                size,
            },
            DeltaOpDto::Insert { hash, size, bytes } => DeltaOp::Insert {
                hash: parse_hash(&hash)?,
                size,
                bytes: bytes.as_deref().map(decode_body).transpose()?,
            },
        });
    }

    let outcome = coordinator
        .submit_delta(
            &file_id,
            DeltaSubmission {
                node_id: request.node_id,
                base_digest: parse_hash(&request.base_digest)?,
                ops,
                content_hash: parse_hash(&request.content_hash)?,
                vector_clock: request.vector_clock,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn handle_history(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.file_history(&file_id).await?))
}

async fn handle_restore(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
    Json(request): Json<RestoreRequestDto>,
) -> ApiResult<impl IntoResponse> {
    let version = coordinator
        .restore(&file_id, &request.version_id, request.node_id)
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn handle_content(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let bytes = coordinator.file_content(&file_id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

async fn handle_replicate(
    State(coordinator): State<Arc<Coordinator>>,
    Path(file_id): Path<String>,
    Json(request): Json<ReplicateRequestDto>,
) -> ApiResult<impl IntoResponse> {
    let session_id = coordinator
        .retrigger_replication(&file_id, &request.target_node)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "session_id": session_id })),
    ))
}

async fn handle_conflicts(
    State(coordinator): State<Arc<Coordinator>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.conflicts().await?))
}

async fn handle_resolve(
    State(coordinator): State<Arc<Coordinator>>,
    Path(conflict_id): Path<String>,
    Json(request): Json<ResolveRequestDto>,
) -> ApiResult<impl IntoResponse> {
    let version = coordinator
        .resolve_conflict(&conflict_id, &request.winner_version_id)
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn handle_events(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.recent_events(query.limit).await?))
}

async fn handle_causal_order(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.causal_events(query.limit).await?))
}

async fn handle_vector_clocks(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.vector_clocks().await)
}

async fn handle_metrics(
    State(coordinator): State<Arc<Coordinator>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.metrics().await?))
}

async fn handle_delta_metrics(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.delta_metrics())
}

async fn handle_health(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: coordinator.config().node.id.clone(),
    })
}

fn decode_body(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| Error::InvalidRequest("chunk body is not valid base64".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let not_found = ApiError(Error::FileNotFound("file-1".into())).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let stale = ApiError(Error::StaleVersion {
            file_id: "file-1".into(),
        })
        .into_response();
        assert_eq!(stale.status(), StatusCode::CONFLICT);

        let missing = ApiError(Error::MissingChunk("abcd".into())).into_response();
        assert_eq!(missing.status(), StatusCode::PRECONDITION_FAILED);

        let offline = ApiError(Error::TargetOffline("n2".into())).into_response();
        assert_eq!(offline.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_decode_body_rejects_bad_base64() {
        assert!(decode_body("AAAA").is_ok());
        assert!(decode_body("not base64 ***").is_err());
    }

    #[test]
    fn test_upload_request_shape() {
        let json = r#"{
            "file_metadata": {"file_id": "file-1", "name": "report.txt", "owner_node": "n1"},
            "chunks": [{"hash": "00", "data": "AAAA"}],
            "vector_clock": {"n1": 1},
            "use_delta_sync": true
        }"#;

        let request: UploadRequestDto = serde_json::from_str(json).unwrap();
        assert_eq!(request.file_metadata.owner_node, "n1");
        assert_eq!(request.chunks.len(), 1);
        assert_eq!(request.vector_clock.get("n1"), 1);
    }

    #[test]
    fn test_delta_op_wire_shape() {
        let json = r#"[
            {"op": "copy", "from_index": 0, "count": 2, "size": 8192},
            {"op": "insert", "hash": "ab", "size": 4096, "bytes": "AAAA"}
        ]"#;

        let ops: Vec<DeltaOpDto> = serde_json::from_str(json).unwrap();
        assert!(matches!(ops[0], DeltaOpDto::Copy { count: 2, .. }));
        assert!(matches!(ops[1], DeltaOpDto::Insert { .. }));
    }
}
