//! Per-symbol matching core.
//!
//! Generalizes the `BTreeMap<PriceLevel, VecDeque<OrderEntry>>`-per-side,
//! atomics-for-last-trade-price, `match_order`-walk shape into full order
//! types and safety rails: post-only, FOK pre-flight, IOC remainder
//! cancellation, self-trade prevention and the stop shelf. Owned exclusively
//! by one matching task per symbol — nothing here is `Send`-shared.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::CoreError;
use crate::ledger::Ledger;
use crate::model::asset::SymbolConfig;
use crate::model::balance::{Balance, BalanceUpdate};
use crate::model::event::EventEnvelope;
use crate::model::order::{Order, OrderStatus, OrderType, Side, TimeInForce};
use crate::model::trade::Trade;

use super::price_level::PriceLevel;
use super::stop_shelf::{StopOrder, StopShelf};

/// Where a resting order lives, so cancel can reach its queue without a
/// `BTreeMap` lookup by price.
struct Location {
    side: Side,
    price: PriceLevel,
}

/// Everything one `submit`/`cancel` call produced: the ordered event log
/// (trades, book deltas, order and balance updates) and the caller's order
/// in its resulting state.
pub struct MatchOutcome {
    pub events: Vec<EventEnvelope>,
    pub accepted: Order,
}

/// One symbol's book: two price-ordered sides, an O(1) order index, the
/// dormant stop shelf, and the monotonic event sequence for this symbol.
pub struct Book {
    config: SymbolConfig,
    bids: BTreeMap<PriceLevel, VecDeque<Order>>,
    asks: BTreeMap<PriceLevel, VecDeque<Order>>,
    index: HashMap<Uuid, Location>,
    stop_shelf: StopShelf,
    last_trade_price: Option<Decimal>,
    mark_price: Option<Decimal>,
    next_seq: u64,
    halted: Option<String>,
}

impl Book {
    pub fn new(config: SymbolConfig) -> Self {
        Self {
            config,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            stop_shelf: StopShelf::new(),
            last_trade_price: None,
            mark_price: None,
            next_seq: 1,
            halted: None,
        }
    }

    pub fn symbol(&self) -> String {
        self.config.symbol.as_string()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn set_mark_price(&mut self, price: Decimal) {
        self.mark_price = Some(price);
    }

    /// Allocate the seq for a `SymbolHalted` event emitted by the owning
    /// task after this book has already recorded an `Inconsistent` failure.
    pub fn take_seq_for_halt(&mut self) -> u64 {
        self.take_seq()
    }

    /// Allocate a seq for a command that doesn't itself produce an event
    /// (stop submission, mark-price update) but still needs one to order
    /// its WAL record within this symbol's command log.
    pub fn allocate_seq(&mut self) -> u64 {
        self.take_seq()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().map(|p| p.to_decimal())
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().map(|p| p.to_decimal())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Map holding resting orders of `side` (bids hold Buy orders, asks hold
    /// Sell orders).
    fn side_map(&self, side: Side) -> &BTreeMap<PriceLevel, VecDeque<Order>> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<PriceLevel, VecDeque<Order>> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Best (highest-priority) key for `side`'s map: highest price for bids,
    /// lowest for asks.
    fn best_key(map: &BTreeMap<PriceLevel, VecDeque<Order>>, side: Side) -> Option<PriceLevel> {
        match side {
            Side::Buy => map.keys().next_back().copied(),
            Side::Sell => map.keys().next().copied(),
        }
    }

    /// The same map's entries walked in match priority order.
    fn priority_order(map: &BTreeMap<PriceLevel, VecDeque<Order>>, side: Side) -> Vec<(PriceLevel, &VecDeque<Order>)> {
        let mut entries: Vec<_> = map.iter().map(|(p, q)| (*p, q)).collect();
        if side == Side::Buy {
            entries.reverse();
        }
        entries
    }

    fn level_size(queue: &VecDeque<Order>) -> Decimal {
        queue.iter().map(|o| o.remaining()).sum()
    }

    /// Stop orders go straight to the shelf; they never touch the book until
    /// triggered or cancelled.
    pub fn add_stop(&mut self, stop: StopOrder) {
        self.stop_shelf.insert(stop);
    }

    pub fn cancel_stop(&mut self, order_id: Uuid) -> Option<StopOrder> {
        self.stop_shelf.cancel(order_id)
    }

    /// `true` if resting `order` at its price would immediately cross the
    /// book (used by the post-only check). Orders with no price (Market)
    /// never rest, so this only matters for Limit-family orders.
    fn would_cross(&self, order: &Order) -> bool {
        let Some(price) = order.price else { return false };
        let level = PriceLevel::from_decimal(price);
        match order.side {
            Side::Buy => self.asks.keys().next().is_some_and(|best| *best <= level),
            Side::Sell => self.bids.keys().next_back().is_some_and(|best| *best >= level),
        }
    }

    /// Read-only simulation of how much of `order` is satisfiable right now,
    /// honoring its price bound and quote budget, without mutating the book.
    /// Mirrors `execute`'s stopping conditions; used by the FOK pre-flight
    /// probe to check the full quantity is satisfiable before committing
    /// any mutation.
    fn fillable_qty(&self, order: &Order) -> Decimal {
        let maker_side = order.side.opposite();
        let map = self.side_map(maker_side);
        let mut budget = order.quote_budget;
        let mut filled = Decimal::ZERO;
        for (price, queue) in Self::priority_order(map, maker_side) {
            if let Some(limit) = order.price {
                let blocked = match order.side {
                    Side::Buy => price.to_decimal() > limit,
                    Side::Sell => price.to_decimal() < limit,
                };
                if blocked {
                    break;
                }
            }
            let level_qty = Self::level_size(queue);
            let mut take = (order.qty - filled).min(level_qty);
            if let Some(b) = budget {
                // Cap by price inclusive of the taker fee, not just notional:
                // the reservation this budget tracks must cover both.
                let price_with_fee = price.to_decimal() * (Decimal::ONE + self.config.taker_fee_rate);
                if price_with_fee > Decimal::ZERO {
                    take = take.min(b / price_with_fee);
                }
            }
            if take <= Decimal::ZERO {
                break;
            }
            if let Some(b) = budget.as_mut() {
                let notional = price.to_decimal() * take;
                let fee = self.config.fee(notional, self.config.taker_fee_rate);
                *b -= notional + fee;
            }
            filled += take;
            if filled >= order.qty {
                break;
            }
        }
        filled
    }

    /// Effective time-in-force once the order-type shorthand (`Ioc`/`Fok`
    /// types, which duplicate the `time_in_force` field) is folded in.
    /// Market orders never rest, so they behave like IOC for remainder
    /// handling.
    fn effective_tif(order: &Order) -> TimeInForce {
        match order.order_type {
            OrderType::Ioc => TimeInForce::Ioc,
            OrderType::Fok => TimeInForce::Fok,
            OrderType::Market => TimeInForce::Ioc,
            OrderType::Limit => order.time_in_force,
            OrderType::StopLimit | OrderType::StopMarket => {
                unreachable!("stop orders are materialized to Limit/Market before reaching the book")
            }
        }
    }

    fn precheck(&self, order: &Order) -> Result<(), CoreError> {
        if order.post_only && self.would_cross(order) {
            return Err(CoreError::WouldCross);
        }
        if Self::effective_tif(order) == TimeInForce::Fok && self.fillable_qty(order) < order.qty {
            return Err(CoreError::WouldNotFill);
        }
        Ok(())
    }

    /// Submit a tradable intent (Limit/Market/IOC/FOK, or a materialized
    /// stop). Runs the full price-time-priority walk, settles every trade
    /// against `ledger`, and evaluates the stop shelf against any resulting
    /// last-price change — triggered stops are matched in the same step's
    /// tail before this call returns.
    pub fn submit(&mut self, intent: Order, ledger: &Ledger) -> Result<MatchOutcome, CoreError> {
        self.precheck(&intent)?;
        let mut events = Vec::new();
        let mut pending = VecDeque::from([intent.clone()]);
        let mut accepted = intent;
        let mut first = true;
        while let Some(order) = pending.pop_front() {
            let result = self.execute(order, ledger, &mut events, &mut pending);
            match result {
                Ok(final_order) => {
                    if first {
                        accepted = final_order;
                        first = false;
                    }
                }
                Err(err) => {
                    // Only a ledger call inside `execute` can fail here, and
                    // it only ever fails with `Inconsistent`: halt the
                    // affected symbol only, other symbols keep running.
                    if matches!(err, CoreError::Inconsistent(_)) {
                        self.halted = Some(err.to_string());
                    }
                    return Err(err);
                }
            }
        }
        Ok(MatchOutcome { events, accepted })
    }

    /// Run one order (the original intent, or a stop materialized onto
    /// `pending`) to completion: match it against the book, rest or cancel
    /// the remainder, then queue any stops the resulting trade triggers.
    fn execute(
        &mut self,
        mut taker: Order,
        ledger: &Ledger,
        events: &mut Vec<EventEnvelope>,
        pending: &mut VecDeque<Order>,
    ) -> Result<Order, CoreError> {
        let maker_side = taker.side.opposite();
        let mut traded = false;

        loop {
            if taker.remaining().is_zero() {
                break;
            }
            let map = self.side_map(maker_side);
            let Some(level_price) = Self::best_key(map, maker_side) else {
                break;
            };
            if let Some(limit) = taker.price {
                let blocked = match taker.side {
                    Side::Buy => level_price.to_decimal() > limit,
                    Side::Sell => level_price.to_decimal() < limit,
                };
                if blocked {
                    break;
                }
            }

            let queue = self
                .side_map_mut(maker_side)
                .get_mut(&level_price)
                .expect("level indexed by best_key must exist");

            if queue.front().is_some_and(|m| m.user == taker.user) {
                // Self-trade prevention: drop the older (maker) order before
                // matching, never a Trade between the same user.
                let mut maker = queue.pop_front().expect("checked front above");
                let new_size = Self::level_size(queue);
                let level_now_empty = queue.is_empty();
                // `queue`'s last use is the line above; free to re-borrow self.
                self.index.remove(&maker.order_id);
                if level_now_empty {
                    self.side_map_mut(maker_side).remove(&level_price);
                }
                let released = maker.take_reservation();
                if !released.is_zero() {
                    let balance = ledger.release(&maker.user, maker.reserved_asset(&self.config.symbol), released)?;
                    let seq = self.take_seq();
                    events.push(balance_update_event(seq, &balance));
                }
                maker.status = OrderStatus::Cancelled;
                let seq = self.take_seq();
                events.push(EventEnvelope::BookDelta {
                    seq,
                    symbol: self.config.symbol.as_string(),
                    side: maker_side,
                    price: level_price.to_decimal(),
                    new_size,
                });
                let seq = self.take_seq();
                events.push(order_update_event(seq, &maker));
                continue;
            }

            let mut maker = queue.front().expect("checked front above").clone();
            let notional_cap = taker.quote_budget;
            let mut fill_qty = taker.remaining().min(maker.remaining());
            if let Some(budget) = notional_cap {
                // Cap by price inclusive of the taker fee: `quote_budget` is
                // the exact reservation held (gateway.reservation_of), and
                // every fill consumes notional+fee from it, not notional
                // alone.
                let price_with_fee = level_price.to_decimal() * (Decimal::ONE + self.config.taker_fee_rate);
                if price_with_fee > Decimal::ZERO {
                    fill_qty = fill_qty.min(budget / price_with_fee);
                }
                if fill_qty <= Decimal::ZERO {
                    break;
                }
            }

            let fill_price = level_price.to_decimal();
            let notional = fill_price * fill_qty;
            let taker_fee = self.config.fee(notional, self.config.taker_fee_rate);
            let maker_fee = self.config.fee(notional, self.config.maker_fee_rate);

            taker.apply_fill(fill_qty, fill_price);
            maker.apply_fill(fill_qty, fill_price);
            match taker.side {
                Side::Buy => {
                    taker.consume_reservation(notional + taker_fee);
                    maker.consume_reservation(fill_qty);
                }
                Side::Sell => {
                    taker.consume_reservation(fill_qty);
                    maker.consume_reservation(notional + maker_fee);
                }
            }
            if let Some(budget) = taker.quote_budget.as_mut() {
                *budget -= notional + taker_fee;
            }

            let trade = Trade {
                trade_id: Uuid::new_v4(),
                symbol: self.config.symbol.as_string(),
                price: fill_price,
                quantity: fill_qty,
                taker_order_id: taker.order_id,
                maker_order_id: maker.order_id,
                taker_user: taker.user.clone(),
                maker_user: maker.user.clone(),
                taker_side: taker.side,
                taker_fee,
                maker_fee,
                seq: 0,
                timestamp_ns: 0,
            };
            let touched_balances = ledger.settle(
                &trade,
                self.config.symbol.base.as_str(),
                self.config.symbol.quote.as_str(),
            )?;

            let queue = self
                .side_map_mut(maker_side)
                .get_mut(&level_price)
                .expect("level indexed by best_key must exist");
            let maker_fully_filled = maker.remaining().is_zero();
            if maker_fully_filled {
                queue.pop_front();
            } else {
                *queue.front_mut().expect("maker still resting") = maker.clone();
            }
            let new_size = Self::level_size(queue);
            let level_now_empty = queue.is_empty();
            // `queue`'s last use is the line above; free to re-borrow self.
            if maker_fully_filled {
                self.index.remove(&maker.order_id);
            }
            if level_now_empty {
                self.side_map_mut(maker_side).remove(&level_price);
            }

            traded = true;
            self.last_trade_price = Some(fill_price);

            let mut trade = trade;
            let seq = self.take_seq();
            trade.seq = seq;
            events.push(EventEnvelope::Trade { seq, trade });
            let seq = self.take_seq();
            events.push(EventEnvelope::BookDelta {
                seq,
                symbol: self.config.symbol.as_string(),
                side: maker_side,
                price: fill_price,
                new_size,
            });
            let seq = self.take_seq();
            events.push(order_update_event(seq, &maker));
            for balance in &touched_balances {
                let seq = self.take_seq();
                events.push(balance_update_event(seq, balance));
            }

            if taker.quote_budget.is_some_and(|b| b <= Decimal::ZERO) {
                break;
            }
        }

        let should_rest = taker.order_type == OrderType::Limit
            && Self::effective_tif(&taker) == TimeInForce::Gtc
            && !taker.remaining().is_zero();

        if should_rest {
            let level = PriceLevel::from_decimal(taker.price.expect("Limit orders carry a price"));
            let queue = self.side_map_mut(taker.side).entry(level).or_default();
            queue.push_back(taker.clone());
            self.index.insert(
                taker.order_id,
                Location {
                    side: taker.side,
                    price: level,
                },
            );
            let new_size = Self::level_size(self.side_map(taker.side).get(&level).expect("just inserted"));
            let seq = self.take_seq();
            events.push(EventEnvelope::BookDelta {
                seq,
                symbol: self.config.symbol.as_string(),
                side: taker.side,
                price: level.to_decimal(),
                new_size,
            });
        }

        let mut taker_released_balance = None;
        if should_rest {
            // Resting: no reservation released, the order keeps it.
        } else if !taker.remaining().is_zero() {
            let released = taker.take_reservation();
            if !released.is_zero() {
                taker_released_balance =
                    Some(ledger.release(&taker.user, taker.reserved_asset(&self.config.symbol), released)?);
            }
            taker.status = OrderStatus::Cancelled;
        } else {
            // Fully filled: release whatever dust the reservation formula
            // overestimated relative to fee rounding (fees round down, so
            // actual consumption can be fractionally less than reserved).
            let released = taker.take_reservation();
            if !released.is_zero() {
                taker_released_balance =
                    Some(ledger.release(&taker.user, taker.reserved_asset(&self.config.symbol), released)?);
            }
        }

        let seq = self.take_seq();
        events.push(order_update_event(seq, &taker));
        if let Some(balance) = &taker_released_balance {
            let seq = self.take_seq();
            events.push(balance_update_event(seq, balance));
        }

        if traded {
            if let Some(last) = self.last_trade_price {
                for stop in self.stop_shelf.evaluate(last, self.mark_price) {
                    pending.push_back(stop.into_resubmitted_order(0));
                }
            }
        }

        Ok(taker)
    }

    /// Locate and remove a resting order from the book; idempotent for an
    /// order that is no longer resting (already filled/cancelled/unknown),
    /// which simply returns `None` rather than erroring.
    pub fn cancel(&mut self, order_id: Uuid, ledger: &Ledger) -> Result<Option<MatchOutcome>, CoreError> {
        let Some(location) = self.index.remove(&order_id) else {
            return Ok(None);
        };
        let queue = self
            .side_map_mut(location.side)
            .get_mut(&location.price)
            .expect("index points at a live level");
        let pos = queue
            .iter()
            .position(|o| o.order_id == order_id)
            .expect("index points at a live order");
        let mut order = queue.remove(pos).expect("position just found");
        let new_size = Self::level_size(queue);
        if queue.is_empty() {
            self.side_map_mut(location.side).remove(&location.price);
        }

        let released = order.take_reservation();
        let released_balance = if !released.is_zero() {
            Some(ledger.release(&order.user, order.reserved_asset(&self.config.symbol), released)?)
        } else {
            None
        };
        order.status = OrderStatus::Cancelled;

        let mut events = Vec::new();
        let seq = self.take_seq();
        events.push(EventEnvelope::BookDelta {
            seq,
            symbol: self.config.symbol.as_string(),
            side: location.side,
            price: location.price.to_decimal(),
            new_size,
        });
        let seq = self.take_seq();
        events.push(order_update_event(seq, &order));
        if let Some(balance) = &released_balance {
            let seq = self.take_seq();
            events.push(balance_update_event(seq, balance));
        }

        Ok(Some(MatchOutcome { events, accepted: order }))
    }
}

fn balance_update_event(seq: u64, balance: &Balance) -> EventEnvelope {
    EventEnvelope::BalanceUpdate {
        seq,
        update: BalanceUpdate::from(balance),
    }
}

fn order_update_event(seq: u64, order: &Order) -> EventEnvelope {
    EventEnvelope::OrderUpdate {
        seq,
        user: order.user.clone(),
        order_id: order.order_id,
        status: order.status,
        filled_qty: order.filled_qty,
        avg_fill_price: order.avg_fill_price,
    }
}
