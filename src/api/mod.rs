//! HTTP API Module
//!
//! Provides a REST API for node status, client proposals and cluster joins.

mod http;

pub use http::{AppendResponse, ErrorResponse, HealthResponse, HttpServer};
