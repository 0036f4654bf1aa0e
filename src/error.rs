//! Driftsync Error Types

use thiserror::Error;

/// Result type alias for driftsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Driftsync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Lookup failures
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    // Version store errors
    #[error("Stale version for file {file_id}: submitted clock does not descend from the current head")]
    StaleVersion { file_id: String },

    #[error("Version references missing chunk {0}; upload the chunk body first")]
    MissingChunk(String),

    // Delta errors
    #[error("Delta integrity failure: {0}")]
    DeltaIntegrity(String),

    // Replication errors
    #[error("Session deadline exceeded during {phase}")]
    SessionTimeout { phase: String },

    #[error("Target node {0} is offline")]
    TargetOffline(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Boundary errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Persistence errors
    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("Chunk store error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error terminates a replication session
    pub fn fails_session(&self) -> bool {
        matches!(
            self,
            Error::SessionTimeout { .. }
                | Error::TargetOffline(_)
                | Error::Transport(_)
                | Error::DeltaIntegrity(_)
        )
    }

    /// Check if this error should be reported to the caller without retry
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NodeNotFound(_)
                | Error::FileNotFound(_)
                | Error::VersionNotFound(_)
                | Error::ChunkNotFound(_)
                | Error::ConflictNotFound(_)
                | Error::StaleVersion { .. }
                | Error::MissingChunk(_)
                | Error::InvalidRequest(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Metadata(format!("SQLite error: {}", e))
    }
}
