//! The conditional/stop order shelf.
//!
//! A dormant set of trigger-conditional orders evaluated on every last-price
//! change for a symbol. Triggered stops become ordinary Limit/Market intents
//! resubmitted through the Gateway in shelf-arrival order. Reservations are
//! held from submission, not from trigger, so the shelf only stores the
//! dormant record — the funds were already reserved by the Gateway before
//! the order reached here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::asset::Symbol;
use crate::model::order::{Order, OrderType, Side, TriggerOp, TriggerReference};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrder {
    pub order_id: Uuid,
    pub user: String,
    pub symbol: String,
    pub side: Side,
    /// The intent this stop becomes once triggered: Limit if `limit_price`
    /// is set, Market otherwise.
    pub limit_price: Option<Decimal>,
    pub qty: Decimal,
    pub quote_budget: Option<Decimal>,
    pub reference: TriggerReference,
    pub op: TriggerOp,
    pub stop_price: Decimal,
    pub arrival_seq: u64,
    /// Reservation held since this stop was submitted, not from trigger.
    pub reserved_remaining: Decimal,
}

impl StopOrder {
    /// The asset this stop's reservation is held in, same convention as
    /// `Order::reserved_asset`: quote for a buy, base for a sell.
    pub fn reserved_asset<'a>(&self, symbol: &'a Symbol) -> &'a str {
        match self.side {
            Side::Buy => symbol.quote.as_str(),
            Side::Sell => symbol.base.as_str(),
        }
    }

    /// The order type this stop resubmits as.
    pub fn resubmit_type(&self) -> OrderType {
        if self.limit_price.is_some() {
            OrderType::StopLimit
        } else {
            OrderType::StopMarket
        }
    }

    pub fn into_resubmitted_order(&self, created_seq: u64) -> Order {
        Order {
            order_id: self.order_id,
            client_order_id: None,
            user: self.user.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: if self.limit_price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            qty: self.qty,
            price: self.limit_price,
            stop_price: Some(self.stop_price),
            post_only: false,
            reduce_only: false,
            time_in_force: crate::model::order::TimeInForce::Gtc,
            quote_budget: self.quote_budget,
            created_seq,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            status: crate::model::order::OrderStatus::Open,
            reserved_remaining: self.reserved_remaining,
        }
    }
}

/// Dormant stop orders for one symbol, kept in arrival order.
#[derive(Default)]
pub struct StopShelf {
    orders: Vec<StopOrder>,
    next_arrival: u64,
}

impl StopShelf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut stop: StopOrder) {
        stop.arrival_seq = self.next_arrival;
        self.next_arrival += 1;
        self.orders.push(stop);
    }

    pub fn cancel(&mut self, order_id: Uuid) -> Option<StopOrder> {
        let pos = self.orders.iter().position(|o| o.order_id == order_id)?;
        Some(self.orders.remove(pos))
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Evaluate `last_price`/`mark_price` against every dormant stop and
    /// remove + return the ones that trigger, in shelf-arrival order.
    pub fn evaluate(&mut self, last_price: Decimal, mark_price: Option<Decimal>) -> Vec<StopOrder> {
        let mut triggered = Vec::new();
        self.orders.retain(|stop| {
            let observed = match stop.reference {
                TriggerReference::LastPrice => Some(last_price),
                TriggerReference::MarkPrice => mark_price,
            };
            let fires = observed.map(|p| stop.op.holds(p, stop.stop_price)).unwrap_or(false);
            if fires {
                triggered.push(stop.clone());
            }
            !fires
        });
        triggered.sort_by_key(|s| s.arrival_seq);
        triggered
    }
}
