//! HTTP API Module
//!
//! Provides a REST API over the transaction coordinator.

mod http;

pub use http::{AppState, ErrorResponse, HttpServer, QueryRequest};
