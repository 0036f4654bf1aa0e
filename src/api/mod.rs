//! HTTP + WebSocket API
//!
//! REST surface over the coordinator and a push channel streaming
//! events to dashboards and node listeners.

pub mod http;
pub mod ws;

pub use http::HttpServer;
