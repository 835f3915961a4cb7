//! HTTP API Module
//!
//! Provides a REST control surface for the election coordinator.

mod http;

pub use http::{AppState, HttpServer, ModeRequest};
