//! Publisher event envelope.
//!
//! Merges the `OrderbookUpdate`/`TradeUpdate`/`OrderUpdate`/`BalanceUpdate`
//! message shapes into one tagged enum so a matching step's entire output
//! can travel through the WAL and the bus as a single ordered sequence.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::balance::BalanceUpdate;
use super::order::{OrderStatus, Side};
use super::trade::Trade;

/// One event produced by a matching step, tagged with its per-symbol
/// monotonic `seq`. All events from a single step share a seq range and are
/// delivered to subscribers as one atomic batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventEnvelope {
    /// `new_size == 0` means the level was removed.
    BookDelta {
        seq: u64,
        symbol: String,
        side: Side,
        price: Decimal,
        new_size: Decimal,
    },
    Trade {
        seq: u64,
        trade: Trade,
    },
    /// Delivered on the per-user `orders:{user}` channel, never the public
    /// book/trade channels.
    OrderUpdate {
        seq: u64,
        user: String,
        order_id: Uuid,
        status: OrderStatus,
        filled_qty: Decimal,
        avg_fill_price: Option<Decimal>,
    },
    BalanceUpdate {
        seq: u64,
        update: BalanceUpdate,
    },
    /// Emitted when a symbol's matching task halts after an `Inconsistent`
    /// invariant violation.
    SymbolHalted { seq: u64, symbol: String, reason: String },
}

impl EventEnvelope {
    pub fn seq(&self) -> u64 {
        match self {
            EventEnvelope::BookDelta { seq, .. }
            | EventEnvelope::Trade { seq, .. }
            | EventEnvelope::OrderUpdate { seq, .. }
            | EventEnvelope::BalanceUpdate { seq, .. }
            | EventEnvelope::SymbolHalted { seq, .. } => *seq,
        }
    }
}
