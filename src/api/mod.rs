//! HTTP API Module
//!
//! Provides the diagnostic and bootstrap endpoints of a node.

mod http;

pub use http::{router, HealthResponse, StateResponse};
