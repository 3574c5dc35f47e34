//! Order Gateway: validates intents, reserves funds, assigns ids, and
//! dispatches to the right symbol's matching task.
//!
//! Validate shape, call the engine, apply side effects — generalized so a
//! `Ledger::reserve` call gates entry to the book instead of the book being
//! entered unconditionally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::book::{BookHandle, MatchOutcome, StopOrder};
use crate::collab::KycPolicy;
use crate::error::CoreError;
use crate::ledger::Ledger;
use crate::model::asset::SymbolConfig;
use crate::model::event::EventEnvelope;
use crate::model::order::{Order, OrderStatus, OrderType, Side, TimeInForce, TriggerOp, TriggerReference};
use crate::ratelimit::RateLimiter;

/// One order placement request, as received from the API surface after auth
/// has resolved the caller's user id.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub user: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trigger_reference: Option<TriggerReference>,
    pub trigger_op: Option<TriggerOp>,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub reduce_only: bool,
    pub quote_budget: Option<Decimal>,
    pub client_order_id: Option<String>,
    /// Requested leverage, validated against the caller's KYC limit but not
    /// otherwise interpreted by the core: margin is a client concern layered
    /// on top of spot settlement.
    pub leverage: u32,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

impl From<&Order> for PlaceOrderResponse {
    fn from(o: &Order) -> Self {
        Self {
            order_id: o.order_id,
            status: o.status,
            filled_qty: o.filled_qty,
            avg_fill_price: o.avg_fill_price,
        }
    }
}

struct SymbolEntry {
    config: SymbolConfig,
    handle: BookHandle,
    created_seq: AtomicU64,
}

/// The single entry point orders and cancels come through. Cheaply clonable;
/// every clone shares the same symbol registry, ledger, and order cache.
#[derive(Clone)]
pub struct Gateway {
    symbols: Arc<DashMap<String, SymbolEntry>>,
    ledger: Arc<Ledger>,
    kyc: Arc<dyn KycPolicy>,
    client_order_ids: Arc<DashMap<(String, String), Uuid>>,
    /// Last known state of every order this Gateway has placed or touched,
    /// used for idempotent cancel and `query_order`. Maker orders that fill
    /// as part of someone else's taker match are kept in sync from the
    /// resulting `OrderUpdate` events.
    orders: Arc<DashMap<Uuid, Order>>,
    order_symbol: Arc<DashMap<Uuid, String>>,
    rate_limiter: RateLimiter,
}

impl Gateway {
    pub fn new(ledger: Arc<Ledger>, kyc: Arc<dyn KycPolicy>) -> Self {
        Self {
            symbols: Arc::new(DashMap::new()),
            ledger,
            kyc,
            client_order_ids: Arc::new(DashMap::new()),
            orders: Arc::new(DashMap::new()),
            order_symbol: Arc::new(DashMap::new()),
            rate_limiter: RateLimiter::default(),
        }
    }

    /// Same as [`Gateway::new`] with an explicit rate-limit budget, for
    /// deployments that need a tighter or looser window than the default
    /// 30-requests-per-minute preset.
    pub fn with_rate_limit(
        ledger: Arc<Ledger>,
        kyc: Arc<dyn KycPolicy>,
        rate_limit: crate::ratelimit::RateLimitConfig,
    ) -> Self {
        let mut gateway = Self::new(ledger, kyc);
        gateway.rate_limiter = RateLimiter::new(rate_limit);
        gateway
    }

    /// Register a symbol's matching task. Called once at startup per
    /// configured symbol.
    pub fn register_symbol(&self, config: SymbolConfig, handle: BookHandle) {
        let name = config.symbol.as_string();
        self.symbols.insert(
            name,
            SymbolEntry {
                config,
                handle,
                created_seq: AtomicU64::new(0),
            },
        );
    }

    fn entry(&self, symbol: &str) -> Result<dashmap::mapref::one::Ref<'_, String, SymbolEntry>, CoreError> {
        self.symbols
            .get(symbol)
            .ok_or_else(|| CoreError::InvalidSymbol(symbol.to_string()))
    }

    /// Validate shape, reserve funds, assign identity, and dispatch.
    pub async fn submit(&self, intent: PlaceOrder) -> Result<PlaceOrderResponse, CoreError> {
        // Account-level throttle, checked before anything else touches the
        // ledger or a symbol's queue: a synchronous rejection with no
        // reservation held.
        self.rate_limiter.check(&intent.user)?;

        if let Some(client_order_id) = &intent.client_order_id {
            let key = (intent.user.clone(), client_order_id.clone());
            if let Some(existing) = self.client_order_ids.get(&key) {
                return Err(CoreError::DuplicateClientOrderId(*existing));
            }
        }

        // Extract everything needed from the registry entry up front and
        // drop the guard before any `.await` — a `DashMap` shard guard held
        // across an await point would block every other order on this
        // symbol for the duration of that await.
        let (config, handle, created_seq) = {
            let entry = self.entry(&intent.symbol)?;
            validate_shape(&intent, &entry.config)?;
            let created_seq = entry.created_seq.fetch_add(1, Ordering::SeqCst);
            (entry.config.clone(), entry.handle.clone(), created_seq)
        };

        let limits = self.kyc.limits(&intent.user).await?;
        if intent.leverage > limits.max_leverage {
            return Err(CoreError::Unauthorized);
        }
        let notional = notional_of(&intent);
        if let Some(notional) = notional {
            if notional > limits.max_order_notional {
                return Err(CoreError::Unauthorized);
            }
        }

        let (reserve_asset, reserve_amount) = reservation_of(&intent, &config)?;
        self.ledger.reserve(&intent.user, reserve_asset, reserve_amount)?;

        let order_id = Uuid::new_v4();

        if let Some(client_order_id) = &intent.client_order_id {
            self.client_order_ids
                .insert((intent.user.clone(), client_order_id.clone()), order_id);
        }
        self.order_symbol.insert(order_id, intent.symbol.clone());

        if matches!(intent.order_type, OrderType::StopLimit | OrderType::StopMarket) {
            let stop = build_stop_order(&intent, order_id, reserve_amount);
            handle.submit_stop(stop.clone()).await?;
            let placeholder = stop.into_resubmitted_order(created_seq);
            let response = PlaceOrderResponse::from(&placeholder);
            self.orders.insert(order_id, placeholder);
            return Ok(response);
        }

        let order = build_order(&intent, order_id, created_seq, reserve_amount);

        match handle.submit(order).await {
            Ok(outcome) => {
                self.absorb_outcome(&outcome);
                Ok(PlaceOrderResponse::from(&outcome.accepted))
            }
            Err(err) => {
                if matches!(err, CoreError::WouldCross | CoreError::WouldNotFill) {
                    // The book never saw this reservation (precheck runs
                    // before any ledger mutation), so the Gateway must
                    // release what it reserved itself.
                    let _ = self.ledger.release(&intent.user, reserve_asset, reserve_amount);
                }
                Err(err)
            }
        }
    }

    /// Cancel by order id. Idempotent: cancelling an already-terminal order
    /// returns its current state rather than erroring.
    pub async fn cancel(&self, user: &str, order_id: Uuid) -> Result<PlaceOrderResponse, CoreError> {
        let known = self.orders.get(&order_id).map(|o| o.clone());
        let Some(known) = known else {
            return Err(CoreError::NotFound);
        };
        if known.user != user {
            return Err(CoreError::Unauthorized);
        }
        if known.status.is_terminal() {
            return Ok(PlaceOrderResponse::from(&known));
        }

        let symbol = self
            .order_symbol
            .get(&order_id)
            .map(|s| s.clone())
            .ok_or(CoreError::NotFound)?;
        let entry = self.entry(&symbol)?;
        let handle = entry.handle.clone();
        drop(entry);

        match handle.cancel(order_id).await? {
            Some(outcome) => {
                self.absorb_outcome(&outcome);
                let updated = self.orders.get(&order_id).map(|o| o.clone()).unwrap_or(known);
                Ok(PlaceOrderResponse::from(&updated))
            }
            None => Ok(PlaceOrderResponse::from(&known)),
        }
    }

    pub fn query_order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.get(&order_id).map(|o| o.clone())
    }

    /// Fold a matching step's events back into the local order cache so
    /// `query_order`/idempotent cancel stay current for both the taker and
    /// any maker orders this Gateway already knew about. Also called by
    /// startup WAL replay, once per outcome `book::spawn_from_wal` produced,
    /// so pre-restart orders remain queryable/cancelable.
    pub fn absorb_outcome(&self, outcome: &MatchOutcome) {
        self.orders.insert(outcome.accepted.order_id, outcome.accepted.clone());
        for event in &outcome.events {
            if let EventEnvelope::OrderUpdate { order_id, status, filled_qty, avg_fill_price, .. } = event {
                if let Some(mut order) = self.orders.get_mut(order_id) {
                    order.status = *status;
                    order.filled_qty = *filled_qty;
                    order.avg_fill_price = *avg_fill_price;
                }
            }
        }
    }
}

fn notional_of(intent: &PlaceOrder) -> Option<Decimal> {
    intent.price.map(|p| p * intent.qty)
}

fn validate_shape(intent: &PlaceOrder, config: &SymbolConfig) -> Result<(), CoreError> {
    if intent.qty <= Decimal::ZERO {
        return Err(CoreError::InvalidQty("qty must be positive".into()));
    }
    if !config.qty_aligned(intent.qty) {
        return Err(CoreError::InvalidQty(format!("qty not aligned to step {}", config.qty_step)));
    }

    let needs_price = matches!(intent.order_type, OrderType::Limit | OrderType::StopLimit | OrderType::Ioc | OrderType::Fok);
    match intent.price {
        Some(price) if needs_price || matches!(intent.order_type, OrderType::Market | OrderType::StopMarket) => {
            if price <= Decimal::ZERO {
                return Err(CoreError::InvalidPrice("price must be positive".into()));
            }
            if !config.price_aligned(price) {
                return Err(CoreError::InvalidPrice(format!("price not aligned to tick {}", config.price_tick)));
            }
        }
        None if needs_price => {
            return Err(CoreError::InvalidPrice("price required for this order type".into()));
        }
        _ => {}
    }

    let needs_stop = matches!(intent.order_type, OrderType::StopLimit | OrderType::StopMarket);
    if needs_stop {
        if intent.stop_price.is_none() {
            return Err(CoreError::InvalidPrice("stop_price required for stop orders".into()));
        }
        if intent.trigger_reference.is_none() || intent.trigger_op.is_none() {
            return Err(CoreError::InvalidPrice("trigger reference/op required for stop orders".into()));
        }
    }

    if intent.order_type == OrderType::Market && intent.side == Side::Buy && intent.quote_budget.is_none() {
        return Err(CoreError::InvalidQty("quote_budget required for a market buy".into()));
    }

    if intent.post_only && matches!(intent.order_type, OrderType::Market | OrderType::Ioc | OrderType::Fok) {
        return Err(CoreError::InvalidQty("post_only is incompatible with market/IOC/FOK".into()));
    }

    Ok(())
}

/// Compute what the Gateway must reserve before dispatch and in which
/// asset: a buy reserves notional plus the maximum possible taker fee in
/// quote; a sell reserves quantity in base; a market buy reserves its
/// caller-supplied quote budget. Returns the real asset ticker (e.g.
/// "USDT"), borrowed from `config.symbol` — the same string `Order::
/// reserved_asset`/`Ledger::settle` key their side of the reservation
/// under, so a reserve here and a release/settle later land on the same
/// balance row.
fn reservation_of<'a>(intent: &PlaceOrder, config: &'a SymbolConfig) -> Result<(&'a str, Decimal), CoreError> {
    match intent.side {
        Side::Sell => Ok((config.symbol.base.as_str(), intent.qty)),
        Side::Buy => {
            if intent.order_type == OrderType::Market || intent.order_type == OrderType::StopMarket {
                let budget = intent
                    .quote_budget
                    .ok_or_else(|| CoreError::InvalidQty("quote_budget required for a market buy".into()))?;
                Ok((config.symbol.quote.as_str(), budget))
            } else {
                let price = intent
                    .price
                    .or(intent.stop_price)
                    .ok_or_else(|| CoreError::InvalidPrice("price required to size a buy reservation".into()))?;
                let notional = price * intent.qty;
                let fee = config.fee(notional, config.taker_fee_rate);
                Ok((config.symbol.quote.as_str(), notional + fee))
            }
        }
    }
}

fn build_order(intent: &PlaceOrder, order_id: Uuid, created_seq: u64, reserved_remaining: Decimal) -> Order {
    Order {
        order_id,
        client_order_id: intent.client_order_id.clone(),
        user: intent.user.clone(),
        symbol: intent.symbol.clone(),
        side: intent.side,
        order_type: intent.order_type,
        qty: intent.qty,
        price: intent.price,
        stop_price: intent.stop_price,
        post_only: intent.post_only,
        reduce_only: intent.reduce_only,
        time_in_force: intent.time_in_force,
        quote_budget: intent.quote_budget,
        created_seq,
        filled_qty: Decimal::ZERO,
        avg_fill_price: None,
        status: OrderStatus::Open,
        reserved_remaining,
    }
}

fn build_stop_order(intent: &PlaceOrder, order_id: Uuid, reserved_remaining: Decimal) -> StopOrder {
    StopOrder {
        order_id,
        user: intent.user.clone(),
        symbol: intent.symbol.clone(),
        side: intent.side,
        limit_price: intent.price,
        qty: intent.qty,
        quote_budget: intent.quote_budget,
        reference: intent.trigger_reference.expect("validated by validate_shape"),
        op: intent.trigger_op.expect("validated by validate_shape"),
        stop_price: intent.stop_price.expect("validated by validate_shape"),
        arrival_seq: 0,
        reserved_remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book;
    use crate::collab::UnlimitedKycPolicy;
    use crate::ledger::CreditReason;
    use crate::model::asset::Symbol;
    use crate::publisher::Publisher;
    use crate::wal::Wal;
    use rust_decimal_macros::dec;

    fn symbol_config() -> SymbolConfig {
        SymbolConfig {
            symbol: Symbol::new("BTC", "USDT"),
            price_tick: dec!(0.01),
            qty_step: dec!(0.0001),
            maker_fee_rate: dec!(0.0002),
            taker_fee_rate: dec!(0.0005),
            max_leverage: 10,
        }
    }

    /// Deletes its WAL directory on drop so repeated test runs don't pile up
    /// files under the system temp directory.
    struct TempWalDir(std::path::PathBuf);

    impl Drop for TempWalDir {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    fn test_gateway() -> (Gateway, Arc<Ledger>, TempWalDir) {
        let dir = TempWalDir(std::env::temp_dir().join(format!("clob-gateway-test-{}", Uuid::new_v4())));
        let ledger = Arc::new(Ledger::new("fees"));
        let wal = Arc::new(Wal::open(dir.0.clone()).unwrap());
        let bus = Arc::new(crate::bus::Bus::new());
        let publisher = Publisher::new(wal, bus);
        let gateway = Gateway::new(ledger.clone(), Arc::new(UnlimitedKycPolicy));

        let config = symbol_config();
        let handle = book::spawn(config.clone(), ledger.clone(), publisher);
        gateway.register_symbol(config, handle);
        (gateway, ledger, dir)
    }

    fn test_gateway_with_rate_limit(rate_limit: crate::ratelimit::RateLimitConfig) -> (Gateway, Arc<Ledger>, TempWalDir) {
        let dir = TempWalDir(std::env::temp_dir().join(format!("clob-gateway-test-{}", Uuid::new_v4())));
        let ledger = Arc::new(Ledger::new("fees"));
        let wal = Arc::new(Wal::open(dir.0.clone()).unwrap());
        let bus = Arc::new(crate::bus::Bus::new());
        let publisher = Publisher::new(wal, bus);
        let gateway = Gateway::with_rate_limit(ledger.clone(), Arc::new(UnlimitedKycPolicy), rate_limit);

        let config = symbol_config();
        let handle = book::spawn(config.clone(), ledger.clone(), publisher);
        gateway.register_symbol(config, handle);
        (gateway, ledger, dir)
    }

    fn place(user: &str, side: Side, qty: Decimal, price: Option<Decimal>) -> PlaceOrder {
        PlaceOrder {
            user: user.to_string(),
            symbol: "BTC/USDT".into(),
            side,
            order_type: OrderType::Limit,
            qty,
            price,
            stop_price: None,
            trigger_reference: None,
            trigger_op: None,
            time_in_force: TimeInForce::Gtc,
            post_only: false,
            reduce_only: false,
            quote_budget: None,
            client_order_id: None,
            leverage: 1,
        }
    }

    #[tokio::test]
    async fn rejects_unknown_symbol() {
        let (gateway, _ledger, _dir) = test_gateway();
        let mut intent = place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)));
        intent.symbol = "ETH/USDT".into();
        let err = gateway.submit(intent).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SYMBOL");
    }

    #[tokio::test]
    async fn buy_limit_reserves_notional_plus_fee() {
        let (gateway, ledger, _dir) = test_gateway();
        ledger.credit("alice", "USDT", dec!(10_000.0), CreditReason::Deposit);

        let intent = place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)));
        let response = gateway.submit(intent).await.unwrap();
        assert_eq!(response.status, OrderStatus::Open);

        let fee = symbol_config().fee(dec!(100.0), dec!(0.0005));
        assert_eq!(ledger.balance("alice", "USDT").reserved, dec!(100.0) + fee);
    }

    #[tokio::test]
    async fn insufficient_funds_rejects_without_reserving() {
        let (gateway, ledger, _dir) = test_gateway();
        ledger.credit("alice", "USDT", dec!(10.0), CreditReason::Deposit);

        let intent = place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)));
        let err = gateway.submit(intent).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(ledger.balance("alice", "USDT").reserved, Decimal::ZERO);
    }

    #[tokio::test]
    async fn duplicate_client_order_id_returns_first_order_id() {
        let (gateway, ledger, _dir) = test_gateway();
        ledger.credit("alice", "USDT", dec!(10_000.0), CreditReason::Deposit);

        let mut intent = place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)));
        intent.client_order_id = Some("abc".into());
        let first = gateway.submit(intent.clone()).await.unwrap();

        let err = gateway.submit(intent).await.unwrap_err();
        match err {
            CoreError::DuplicateClientOrderId(id) => assert_eq!(id, first.order_id),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_orders() {
        let (gateway, ledger, _dir) = test_gateway();
        ledger.credit("alice", "USDT", dec!(10_000.0), CreditReason::Deposit);

        let intent = place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)));
        let placed = gateway.submit(intent).await.unwrap();

        let first = gateway.cancel("alice", placed.order_id).await.unwrap();
        assert_eq!(first.status, OrderStatus::Cancelled);
        let second = gateway.cancel("alice", placed.order_id).await.unwrap();
        assert_eq!(second.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_by_another_user_is_unauthorized() {
        let (gateway, ledger, _dir) = test_gateway();
        ledger.credit("alice", "USDT", dec!(10_000.0), CreditReason::Deposit);
        let intent = place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)));
        let placed = gateway.submit(intent).await.unwrap();

        let err = gateway.cancel("mallory", placed.order_id).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn rate_limited_user_is_rejected_without_touching_the_ledger() {
        let (gateway, ledger, _dir) = test_gateway_with_rate_limit(crate::ratelimit::RateLimitConfig {
            max_requests: 1,
            window: std::time::Duration::from_secs(60),
        });
        ledger.credit("alice", "USDT", dec!(10_000.0), CreditReason::Deposit);

        let first = gateway.submit(place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)))).await;
        assert!(first.is_ok());

        let balance_before = ledger.balance("alice", "USDT");
        let second = gateway.submit(place("alice", Side::Buy, dec!(1.0), Some(dec!(100.0)))).await;
        let err = second.unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        let balance_after = ledger.balance("alice", "USDT");
        assert_eq!(balance_after.available, balance_before.available);
        assert_eq!(balance_after.reserved, balance_before.reserved);
    }

    #[tokio::test]
    async fn market_buy_without_quote_budget_is_rejected() {
        let (gateway, ledger, _dir) = test_gateway();
        ledger.credit("alice", "USDT", dec!(10_000.0), CreditReason::Deposit);
        let mut intent = place("alice", Side::Buy, dec!(1.0), None);
        intent.order_type = OrderType::Market;
        let err = gateway.submit(intent).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_QTY");
    }
}
