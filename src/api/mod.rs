//! HTTP/WebSocket surface: a single router exposing the Gateway's RPC
//! contract and the Subscription Bus's feed, bound to one listener by
//! `main.rs`.
//!
//! Router-assembly shape and handler conventions (`State<Arc<AppState>>`
//! extraction, `Json` request/response, `tracing` on every request),
//! generalized down to this core's three RPC operations plus the bus
//! upgrade. Crate: `axum`.

pub mod routes;
pub mod websocket;

use std::sync::Arc;

use crate::bus::Bus;
use crate::collab::AuthResolver;
use crate::gateway::Gateway;

/// Shared application state every handler extracts via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub bus: Arc<Bus>,
    pub auth: Arc<dyn AuthResolver>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
