//! Delta Synchronization
//!
//! Chunk-signature generation, delta construction against a base
//! signature, and delta application with integrity verification.

pub mod delta;

pub use delta::{ChunkSignature, Delta, DeltaEngine, DeltaMetrics, DeltaOp};
