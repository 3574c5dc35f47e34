//! Matched trades.
//!
//! Merges a trade-execution/trade-event split into one type carrying both
//! maker and taker user ids on a single trade record.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: Uuid,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub taker_order_id: Uuid,
    pub maker_order_id: Uuid,
    pub taker_user: String,
    pub maker_user: String,
    /// Side of the taker order; the maker is always the opposite side.
    pub taker_side: Side,
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    pub seq: u64,
    pub timestamp_ns: u64,
}
