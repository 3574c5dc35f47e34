//! RPC routes: place/cancel/query an order, health, and Prometheus
//! exposition.
//!
//! Request shape, `tracing::info!` on accept, mapping a domain error
//! straight through `IntoResponse`, and a flat `Router::new().route(...)`
//! assembly.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::websocket::ws_upgrade;
use crate::api::AppState;
use crate::error::CoreError;
use crate::gateway::PlaceOrder;
use crate::metrics;
use crate::model::order::{OrderStatus, OrderType, Side, TimeInForce, TriggerOp, TriggerReference};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/orders", post(place_order))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id", axum::routing::delete(cancel_order))
        .route("/ws", get(ws_upgrade))
        .with_state(Arc::new(state))
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, CoreError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(CoreError::Unauthorized)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, CoreError> {
    let token = bearer_token(headers)?;
    state.auth.verify(token).await
}

/// Request shape for `POST /orders`.
#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub trigger_reference: Option<TriggerReference>,
    #[serde(default)]
    pub trigger_op: Option<TriggerOp>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub quote_budget: Option<Decimal>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

fn default_leverage() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

impl From<crate::gateway::PlaceOrderResponse> for OrderResponse {
    fn from(r: crate::gateway::PlaceOrderResponse) -> Self {
        Self {
            order_id: r.order_id,
            status: r.status,
            filled_qty: r.filled_qty,
            avg_fill_price: r.avg_fill_price,
        }
    }
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<Json<OrderResponse>, CoreError> {
    let user = authenticate(&state, &headers).await?;
    let start = Instant::now();
    let symbol = req.symbol.clone();
    let side = req.side.to_string();
    let order_type = format!("{:?}", req.order_type);

    let intent = PlaceOrder {
        user,
        symbol: req.symbol,
        side: req.side,
        order_type: req.order_type,
        qty: req.qty,
        price: req.price,
        stop_price: req.stop_price,
        trigger_reference: req.trigger_reference,
        trigger_op: req.trigger_op,
        time_in_force: req.time_in_force,
        post_only: req.post_only,
        reduce_only: req.reduce_only,
        quote_budget: req.quote_budget,
        client_order_id: req.client_order_id,
        leverage: req.leverage,
    };

    metrics::record_order_submitted(&symbol, &side, &order_type);
    let result = state.gateway.submit(intent).await;
    metrics::record_order_match_duration(start.elapsed().as_secs_f64());
    match &result {
        Ok(response) => {
            tracing::info!(order_id = %response.order_id, symbol = %symbol, status = %response.status, "order accepted");
        }
        Err(err) => {
            metrics::record_order_rejected(&symbol, err.code());
            tracing::warn!(symbol = %symbol, error = %err, "order rejected");
        }
    }
    result.map(|r| Json(r.into()))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, CoreError> {
    let user = authenticate(&state, &headers).await?;
    let response = state.gateway.cancel(&user, order_id).await?;
    if response.status == OrderStatus::Cancelled {
        let symbol = state.gateway.query_order(order_id).map(|o| o.symbol).unwrap_or_default();
        metrics::record_order_cancelled(&symbol);
    }
    Ok(Json(response.into()))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderResponse>, CoreError> {
    let user = authenticate(&state, &headers).await?;
    let order = state.gateway.query_order(order_id).ok_or(CoreError::NotFound)?;
    if order.user != user {
        return Err(CoreError::Unauthorized);
    }
    Ok(Json(OrderResponse {
        order_id: order.order_id,
        status: order.status,
        filled_qty: order.filled_qty,
        avg_fill_price: order.avg_fill_price,
    }))
}
