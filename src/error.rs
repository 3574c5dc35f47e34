//! Core error taxonomy and its `axum` surface.
//!
//! A typed `thiserror` enum carries the stable `code` the client sees, and
//! a thin `IntoResponse` impl translates it to JSON without ever leaking
//! internal identifiers.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use uuid::Uuid;

/// Errors the core can return from its public contracts (`submit`, `cancel`,
/// ledger operations). Variants are grouped per §7's taxonomy in comments.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // ---- Input errors: synchronous, no side effects, reservation released ----
    #[error("unknown symbol: {0}")]
    InvalidSymbol(String),
    #[error("invalid price: {0}")]
    InvalidPrice(String),
    #[error("invalid quantity: {0}")]
    InvalidQty(String),
    #[error("unknown order type: {0}")]
    UnknownType(String),
    #[error("order would cross the book")]
    WouldCross,
    #[error("fill-or-kill order could not be fully filled")]
    WouldNotFill,

    // ---- Account errors: synchronous rejection, no reservation held ----
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,

    // ---- State errors: synchronous, idempotent for cancel ----
    #[error("not found")]
    NotFound,
    #[error("order already in a terminal state")]
    AlreadyTerminal,
    #[error("duplicate client_order_id, existing order is {0}")]
    DuplicateClientOrderId(Uuid),

    // ---- Fatal: an internal invariant was violated ----
    #[error("internal invariant violated: {0}")]
    Inconsistent(String),
}

impl CoreError {
    /// Stable machine-readable code. Never includes internal identifiers.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidSymbol(_) => "INVALID_SYMBOL",
            CoreError::InvalidPrice(_) => "INVALID_PRICE",
            CoreError::InvalidQty(_) => "INVALID_QTY",
            CoreError::UnknownType(_) => "UNKNOWN_TYPE",
            CoreError::WouldCross => "WOULD_CROSS",
            CoreError::WouldNotFill => "WOULD_NOT_FILL",
            CoreError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            CoreError::Unauthorized => "UNAUTHORIZED",
            CoreError::RateLimited => "RATE_LIMITED",
            CoreError::NotFound => "NOT_FOUND",
            CoreError::AlreadyTerminal => "ALREADY_TERMINAL",
            CoreError::DuplicateClientOrderId(_) => "DUPLICATE_CLIENT_ORDER_ID",
            CoreError::Inconsistent(_) => "INCONSISTENT",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidSymbol(_)
            | CoreError::InvalidPrice(_)
            | CoreError::InvalidQty(_)
            | CoreError::UnknownType(_)
            | CoreError::WouldCross
            | CoreError::WouldNotFill => StatusCode::BAD_REQUEST,
            CoreError::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::AlreadyTerminal => StatusCode::CONFLICT,
            CoreError::DuplicateClientOrderId(_) => StatusCode::CONFLICT,
            CoreError::Inconsistent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<Uuid>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let order_id = match &self {
            CoreError::DuplicateClientOrderId(id) => Some(*id),
            _ => None,
        };
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            order_id,
        };
        (self.status(), Json(body)).into_response()
    }
}
