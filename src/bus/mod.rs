//! Subscription bus: `book:{symbol}`, `trades:{symbol}`, `orders:{user}`,
//! `balances:{user}` channels with snapshot-then-delta semantics and
//! backpressure-driven disconnects.
//!
//! A `Channel` enum handles parsing and `is_private`, fanning subscribers
//! out over an in-process `tokio::sync::broadcast` authority rather than a
//! Redis-backed relay — there is no external pub/sub here, the bus itself
//! is the single source of truth.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::book::price_level::PriceLevel;
use crate::error::CoreError;
use crate::model::event::EventEnvelope;
use crate::model::order::Side;

const CHANNEL_CAPACITY: usize = 4096;

/// A parsed, validated channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Book(String),
    Trades(String),
    Orders(String),
    Balances(String),
}

impl Channel {
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, id) = raw.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "book" => Some(Channel::Book(id.to_string())),
            "trades" => Some(Channel::Trades(id.to_string())),
            "orders" => Some(Channel::Orders(id.to_string())),
            "balances" => Some(Channel::Balances(id.to_string())),
            _ => None,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Channel::Orders(_) | Channel::Balances(_))
    }

    /// The user a private channel is scoped to; `None` for public channels.
    pub fn owner(&self) -> Option<&str> {
        match self {
            Channel::Orders(user) | Channel::Balances(user) => Some(user),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Channel::Book(id) => format!("book:{id}"),
            Channel::Trades(id) => format!("trades:{id}"),
            Channel::Orders(id) => format!("orders:{id}"),
            Channel::Balances(id) => format!("balances:{id}"),
        }
    }
}

/// Wire frame delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub channel: String,
    pub seq: u64,
    pub ts_ns: u64,
    pub payload: serde_json::Value,
}

/// A book snapshot, best-first on both sides, for the `book:{symbol}`
/// subscribe handshake.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookSnapshot {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    Unauthorized,
    InvalidChannel,
}

impl From<SubscribeError> for CoreError {
    fn from(e: SubscribeError) -> Self {
        match e {
            SubscribeError::Unauthorized => CoreError::Unauthorized,
            SubscribeError::InvalidChannel => CoreError::InvalidSymbol("malformed channel name".into()),
        }
    }
}

/// A live channel subscription: an optional snapshot to deliver first, then
/// a stream of deltas. Lagging beyond the broadcast channel's capacity ends
/// the subscription with `Lagged` rather than blocking the matching engine
/// that produced the events.
pub struct Subscription {
    pub snapshot: Option<Frame>,
    receiver: broadcast::Receiver<Frame>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<Frame, Lagged> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(_)) => return Err(Lagged),
                Err(broadcast::error::RecvError::Closed) => return Err(Lagged),
            }
        }
    }
}

/// Marker error: the subscriber fell too far behind and must reconnect.
#[derive(Debug, Clone, Copy)]
pub struct Lagged;

type Side2 = BTreeMap<PriceLevel, Decimal>;

struct BookState {
    bids: Side2,
    asks: Side2,
    last_seq: AtomicU64,
}

impl Default for BookState {
    fn default() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_seq: AtomicU64::new(0),
        }
    }
}

/// The process-wide fan-out authority. One broadcast sender per channel
/// name, created lazily on first publish or subscribe.
pub struct Bus {
    channels: DashMap<String, broadcast::Sender<Frame>>,
    book_state: DashMap<String, Mutex<BookState>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            book_state: DashMap::new(),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Frame> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe `caller_user` (already authenticated by `AuthResolver`) to
    /// `channel`. Private channels require `caller_user` to match the
    /// channel's own user.
    pub fn subscribe(&self, channel: &str, caller_user: &str, ts_ns: u64) -> Result<Subscription, SubscribeError> {
        let parsed = Channel::parse(channel).ok_or(SubscribeError::InvalidChannel)?;
        if let Some(owner) = parsed.owner() {
            if owner != caller_user {
                return Err(SubscribeError::Unauthorized);
            }
        }
        let receiver = self.sender_for(&parsed.name()).subscribe();
        let snapshot = match &parsed {
            Channel::Book(symbol) => Some(self.snapshot_frame(symbol, ts_ns)),
            _ => None,
        };
        Ok(Subscription { snapshot, receiver })
    }

    fn snapshot_frame(&self, symbol: &str, ts_ns: u64) -> Frame {
        let entry = self.book_state.entry(symbol.to_string()).or_default();
        let state = entry.lock();
        let bids: Vec<_> = state.bids.iter().rev().map(|(p, q)| (p.to_decimal(), *q)).collect();
        let asks: Vec<_> = state.asks.iter().map(|(p, q)| (p.to_decimal(), *q)).collect();
        let seq = state.last_seq.load(Ordering::SeqCst);
        Frame {
            channel: format!("book:{symbol}"),
            seq,
            ts_ns,
            payload: serde_json::to_value(BookSnapshot { bids, asks }).expect("snapshot serializes"),
        }
    }

    /// Publish one matching step's events. Called by the Publisher after the
    /// step is durably written to the WAL, so subscribers never observe an
    /// event that would not survive a crash.
    pub fn publish_batch(&self, symbol: &str, events: &[EventEnvelope], ts_ns: u64) {
        for event in events {
            self.publish_one(symbol, event, ts_ns);
        }
    }

    fn publish_one(&self, symbol: &str, event: &EventEnvelope, ts_ns: u64) {
        match event {
            EventEnvelope::BookDelta { seq, side, price, new_size, .. } => {
                self.update_book_state(symbol, *side, *price, *new_size, *seq);
                let frame = Frame {
                    channel: format!("book:{symbol}"),
                    seq: *seq,
                    ts_ns,
                    payload: serde_json::json!({"side": side, "price": price, "size": new_size}),
                };
                let _ = self.sender_for(&frame.channel).send(frame);
            }
            EventEnvelope::Trade { seq, trade } => {
                let frame = Frame {
                    channel: format!("trades:{symbol}"),
                    seq: *seq,
                    ts_ns,
                    payload: serde_json::to_value(trade).expect("trade serializes"),
                };
                let _ = self.sender_for(&frame.channel).send(frame);
            }
            EventEnvelope::OrderUpdate { seq, user, order_id, status, filled_qty, avg_fill_price } => {
                let frame = Frame {
                    channel: format!("orders:{user}"),
                    seq: *seq,
                    ts_ns,
                    payload: serde_json::json!({
                        "order_id": order_id,
                        "status": status,
                        "filled_qty": filled_qty,
                        "avg_fill_price": avg_fill_price,
                    }),
                };
                let _ = self.sender_for(&frame.channel).send(frame);
            }
            EventEnvelope::BalanceUpdate { seq, update } => {
                let frame = Frame {
                    channel: format!("balances:{}", update.user),
                    seq: *seq,
                    ts_ns,
                    payload: serde_json::to_value(update).expect("balance update serializes"),
                };
                let _ = self.sender_for(&frame.channel).send(frame);
            }
            EventEnvelope::SymbolHalted { seq, symbol, reason } => {
                let frame = Frame {
                    channel: format!("book:{symbol}"),
                    seq: *seq,
                    ts_ns,
                    payload: serde_json::json!({"halted": true, "reason": reason}),
                };
                let _ = self.sender_for(&frame.channel).send(frame);
            }
        }
    }

    fn update_book_state(&self, symbol: &str, side: Side, price: Decimal, new_size: Decimal, seq: u64) {
        let entry = self.book_state.entry(symbol.to_string()).or_default();
        let mut state = entry.lock();
        let level = PriceLevel::from_decimal(price);
        let map = match side {
            Side::Buy => &mut state.bids,
            Side::Sell => &mut state.asks,
        };
        if new_size.is_zero() {
            map.remove(&level);
        } else {
            map.insert(level, new_size);
        }
        state.last_seq.store(seq, Ordering::SeqCst);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_public_and_private_channels() {
        assert_eq!(Channel::parse("book:BTC/USDT"), Some(Channel::Book("BTC/USDT".into())));
        assert_eq!(Channel::parse("orders:alice"), Some(Channel::Orders("alice".into())));
        assert!(Channel::parse("book").is_none());
        assert!(!Channel::Book("BTC/USDT".into()).is_private());
        assert!(Channel::Orders("alice".into()).is_private());
    }

    #[test]
    fn private_channel_rejects_mismatched_caller() {
        let bus = Bus::new();
        let err = bus.subscribe("orders:alice", "bob", 0).unwrap_err();
        assert_eq!(err, SubscribeError::Unauthorized);
        assert!(bus.subscribe("orders:alice", "alice", 0).is_ok());
    }

    #[test]
    fn book_snapshot_reflects_prior_deltas_before_new_subscriber_deltas() {
        let bus = Bus::new();
        bus.publish_batch(
            "BTC/USDT",
            &[EventEnvelope::BookDelta {
                seq: 1,
                symbol: "BTC/USDT".into(),
                side: Side::Buy,
                price: dec!(100.0),
                new_size: dec!(2.0),
            }],
            0,
        );
        let sub = bus.subscribe("book:BTC/USDT", "anyone", 0).unwrap();
        let snapshot = sub.snapshot.unwrap();
        assert_eq!(snapshot.seq, 1);
    }
}
