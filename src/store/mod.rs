//! Storage Layer
//!
//! Content-addressable chunk bodies, the relational metadata store, and
//! the per-file version DAG built on top of both.

pub mod chunks;
pub mod metadata;
pub mod versions;

pub use chunks::{content_hash, ChunkHash, ChunkStore};
pub use metadata::MetadataStore;
pub use versions::{Conflict, FileRecord, FileVersion, VersionStore};
