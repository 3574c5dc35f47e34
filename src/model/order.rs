//! Order identity and lifecycle state.
//!
//! Generalizes a plain side/order-type enum pair into the full stop/IOC/FOK
//! order-type surface and the lifecycle an order moves through from
//! submission to a terminal status.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::asset::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    StopLimit,
    StopMarket,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good Till Cancel
    Gtc,
    /// Immediate or Cancel
    Ioc,
    /// Fill or Kill
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        TimeInForce::Gtc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Reference price used by a stop order's trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReference {
    LastPrice,
    MarkPrice,
}

/// Comparison operator of a stop order's trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOp {
    Ge,
    Le,
}

impl TriggerOp {
    pub fn holds(self, observed: Decimal, stop_price: Decimal) -> bool {
        match self {
            TriggerOp::Ge => observed >= stop_price,
            TriggerOp::Le => observed <= stop_price,
        }
    }
}

/// An order's immutable identity plus its evolving fill state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub client_order_id: Option<String>,
    pub user: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub post_only: bool,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
    pub quote_budget: Option<Decimal>,
    pub created_seq: u64,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    /// What the Gateway reserved for this order, in the reserved asset
    /// (quote for Buy, base for Sell), minus whatever fills have already
    /// consumed. Cancelling releases exactly this amount back to available.
    pub reserved_remaining: Decimal,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.qty - self.filled_qty
    }

    /// The asset a reservation for this order is held in: quote for a buy
    /// (it pays quote to receive base), base for a sell.
    pub fn reserved_asset<'a>(&self, symbol: &'a Symbol) -> &'a str {
        match self.side {
            Side::Buy => symbol.quote.as_str(),
            Side::Sell => symbol.base.as_str(),
        }
    }

    /// Record that a fill consumed `amount` of the held reservation.
    pub fn consume_reservation(&mut self, amount: Decimal) {
        self.reserved_remaining -= amount;
    }

    /// Zero out and return whatever reservation remains, for release back
    /// to available on cancel, IOC/FOK remainder, or self-trade prevention.
    pub fn take_reservation(&mut self) -> Decimal {
        let amount = self.reserved_remaining;
        self.reserved_remaining = Decimal::ZERO;
        amount
    }

    /// Record a fill of `qty` at `price`, updating `filled_qty` and the
    /// running volume-weighted `avg_fill_price`.
    pub fn apply_fill(&mut self, qty: Decimal, price: Decimal) {
        let prior_notional = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_qty;
        let new_filled = self.filled_qty + qty;
        self.avg_fill_price = if new_filled.is_zero() {
            self.avg_fill_price
        } else {
            Some((prior_notional + price * qty) / new_filled)
        };
        self.filled_qty = new_filled;
        self.status = if self.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}
