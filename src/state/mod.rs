//! Node State
//!
//! Registry of client nodes: identity, status, heartbeats, and offline
//! detection.

pub mod registry;

pub use registry::{NodeInfo, NodeRegistry, NodeStatus};
