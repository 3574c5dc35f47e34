//! Property-based invariant tests for the matching engine and ledger.
//!
//! Tests the `Book`/`Ledger` types directly with hand-built fixtures,
//! generalized to randomized sequences via `proptest` the way a matching
//! engine's test suite generates random order streams. Crate: `proptest`.

use clob_core::book::engine::Book;
use clob_core::error::CoreError;
use clob_core::ledger::{CreditReason, Ledger};
use clob_core::model::asset::{Symbol, SymbolConfig};
use clob_core::model::event::EventEnvelope;
use clob_core::model::order::{Order, OrderStatus, OrderType, Side, TimeInForce};
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn config() -> SymbolConfig {
    SymbolConfig {
        symbol: Symbol::new("BTC", "USDT"),
        price_tick: dec!(0.01),
        qty_step: dec!(0.0001),
        maker_fee_rate: dec!(0.0002),
        taker_fee_rate: dec!(0.0005),
        max_leverage: 10,
    }
}

fn limit_order(side: Side, qty: Decimal, price: Decimal, user: &str, seq: u64) -> Order {
    let reserved = match side {
        Side::Buy => qty * price,
        Side::Sell => qty,
    };
    Order {
        order_id: Uuid::new_v4(),
        client_order_id: None,
        user: user.into(),
        symbol: "BTC/USDT".into(),
        side,
        order_type: OrderType::Limit,
        qty,
        price: Some(price),
        stop_price: None,
        post_only: false,
        reduce_only: false,
        time_in_force: TimeInForce::Gtc,
        quote_budget: None,
        created_seq: seq,
        filled_qty: Decimal::ZERO,
        avg_fill_price: None,
        status: OrderStatus::Open,
        reserved_remaining: reserved,
    }
}

fn fund(ledger: &Ledger, user: &str, asset: &str, amount: Decimal) {
    ledger.credit(user, asset, amount, CreditReason::Deposit);
}

fn trades_in(outcome_events: &[EventEnvelope]) -> Vec<&clob_core::model::trade::Trade> {
    outcome_events
        .iter()
        .filter_map(|e| match e {
            EventEnvelope::Trade { trade, .. } => Some(trade),
            _ => None,
        })
        .collect()
}

/// Integer cents in [1, 200_00], converted to a tick-aligned price.
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..=200_00).prop_map(|cents| Decimal::new(cents, 2))
}

/// Quantity in ten-thousandths of a unit, tick-aligned to `qty_step`.
fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..=100_0000).prop_map(|units| Decimal::new(units, 4))
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant #1: settling trades never creates or destroys funds — the
    /// sum of every participant's available+reserved balance for an asset
    /// is unchanged by any number of matches.
    #[test]
    fn conservation_holds_across_random_crosses(
        price in price_strategy(),
        qtys in prop_vec(qty_strategy(), 1..20),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "maker", "BTC", dec!(10000.0));
        fund(&ledger, "taker", "USDT", dec!(200_000_000.0));
        ledger.reserve("maker", "BTC", dec!(10000.0)).unwrap();

        let base_before = ledger.total_for_asset("BTC");
        let quote_before = ledger.total_for_asset("USDT");

        let mut seq = 1u64;
        for qty in qtys {
            let sell = limit_order(Side::Sell, qty, price, "maker", seq);
            seq += 1;
            if book.submit(sell, &ledger).is_err() {
                continue;
            }
            let notional = price * qty + price * qty; // generous headroom for fees
            ledger.reserve("taker", "USDT", notional).ok();
            let buy = limit_order(Side::Buy, qty, price, "taker", seq);
            seq += 1;
            let _ = book.submit(buy, &ledger);
            // release any unused reservation so totals stay comparable
            let remaining = ledger.balance("taker", "USDT").reserved;
            if !remaining.is_zero() {
                ledger.release("taker", "USDT", remaining).ok();
            }
        }

        prop_assert_eq!(ledger.total_for_asset("BTC"), base_before);
        prop_assert_eq!(ledger.total_for_asset("USDT"), quote_before);
    }

    /// Invariant #2: the book is never crossed — best_bid is always
    /// strictly less than best_ask whenever both sides are non-empty.
    #[test]
    fn book_never_crosses(
        sides in prop_vec(side_strategy(), 1..30),
        prices in prop_vec(price_strategy(), 1..30),
        qtys in prop_vec(qty_strategy(), 1..30),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "u", "BTC", dec!(1_000_000.0));
        fund(&ledger, "u", "USDT", dec!(1_000_000_000.0));
        ledger.reserve("u", "BTC", dec!(1_000_000.0)).unwrap();
        ledger.reserve("u", "USDT", dec!(1_000_000_000.0)).unwrap();

        let n = sides.len().min(prices.len()).min(qtys.len());
        for i in 0..n {
            let order = limit_order(sides[i], qtys[i], prices[i], "u", i as u64 + 1);
            let _ = book.submit(order, &ledger);
            if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
                prop_assert!(bid < ask, "book crossed: bid {} >= ask {}", bid, ask);
            }
        }
    }

    /// Invariant #3: resting orders at the same price fill in arrival
    /// order — an earlier `created_seq` maker is always matched before a
    /// later one at an identical price level.
    #[test]
    fn price_time_priority_is_respected(
        price in price_strategy(),
        n_makers in 2usize..6,
        unit_qty in qty_strategy(),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "taker", "USDT", dec!(200_000_000.0));

        let mut maker_seq = Vec::new();
        for i in 0..n_makers {
            let user = format!("maker{i}");
            fund(&ledger, &user, "BTC", unit_qty);
            ledger.reserve(&user, "BTC", unit_qty).unwrap();
            let order = limit_order(Side::Sell, unit_qty, price, &user, i as u64 + 1);
            book.submit(order, &ledger).unwrap();
            maker_seq.push(user);
        }

        let total_qty = unit_qty * Decimal::from(n_makers as u64);
        ledger.reserve("taker", "USDT", price * total_qty * dec!(2)).ok();
        let taker = limit_order(Side::Buy, total_qty, price, "taker", 999);
        let outcome = book.submit(taker, &ledger).unwrap();

        let fills = trades_in(&outcome.events);
        prop_assert_eq!(fills.len(), n_makers);
        for (i, trade) in fills.iter().enumerate() {
            prop_assert_eq!(&trade.maker_user, &maker_seq[i]);
        }
    }

    /// Invariant #4 (price improvement): a marketable buy never pays more
    /// than its own limit price, and fills against each resting ask at that
    /// ask's own price rather than the taker's limit.
    #[test]
    fn fills_never_worse_than_limit_price(
        ask_price in price_strategy(),
        qty in qty_strategy(),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "maker", "BTC", qty);
        ledger.reserve("maker", "BTC", qty).unwrap();
        fund(&ledger, "taker", "USDT", dec!(200_000_000.0));
        ledger.reserve("taker", "USDT", dec!(200_000_000.0)).unwrap();

        book.submit(limit_order(Side::Sell, qty, ask_price, "maker", 1), &ledger).unwrap();

        let limit_price = ask_price + dec!(50.0);
        let outcome = book.submit(limit_order(Side::Buy, qty, limit_price, "taker", 2), &ledger).unwrap();

        for trade in trades_in(&outcome.events) {
            prop_assert!(trade.price <= limit_price);
            prop_assert_eq!(trade.price, ask_price);
        }
    }

    /// Invariant #5: a post-only order that would cross is rejected and
    /// never produces a trade or touches the resting book.
    #[test]
    fn post_only_never_trades(
        price in price_strategy(),
        qty in qty_strategy(),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "maker", "BTC", qty);
        ledger.reserve("maker", "BTC", qty).unwrap();
        fund(&ledger, "taker", "USDT", dec!(200_000_000.0));
        ledger.reserve("taker", "USDT", dec!(200_000_000.0)).unwrap();

        book.submit(limit_order(Side::Sell, qty, price, "maker", 1), &ledger).unwrap();

        let mut crossing_buy = limit_order(Side::Buy, qty, price, "taker", 2);
        crossing_buy.post_only = true;
        let result = book.submit(crossing_buy, &ledger);

        prop_assert!(matches!(result, Err(CoreError::WouldCross)));
        prop_assert_eq!(ledger.balance("taker", "BTC").available, Decimal::ZERO);
    }

    /// Invariant #6: a fill-or-kill order either fully fills or leaves no
    /// trace — no partial fill, no resting remainder.
    #[test]
    fn fok_is_all_or_nothing(
        available_qty in qty_strategy(),
        requested_qty in qty_strategy(),
        price in price_strategy(),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "maker", "BTC", available_qty);
        ledger.reserve("maker", "BTC", available_qty).unwrap();
        fund(&ledger, "taker", "USDT", dec!(200_000_000.0));
        ledger.reserve("taker", "USDT", dec!(200_000_000.0)).unwrap();

        book.submit(limit_order(Side::Sell, available_qty, price, "maker", 1), &ledger).unwrap();

        let mut fok = limit_order(Side::Buy, requested_qty, price, "taker", 2);
        fok.order_type = OrderType::Fok;
        fok.time_in_force = TimeInForce::Fok;
        let result = book.submit(fok, &ledger);

        if requested_qty > available_qty {
            prop_assert!(matches!(result, Err(CoreError::WouldNotFill)));
            prop_assert_eq!(ledger.balance("maker", "BTC").reserved, available_qty);
        } else {
            let outcome = result.unwrap();
            prop_assert_eq!(outcome.accepted.status, OrderStatus::Filled);
            prop_assert_eq!(outcome.accepted.filled_qty, requested_qty);
        }
    }

    /// Invariant #7: every event's `seq` strictly increases across a
    /// sequence of submits on one symbol, regardless of how many events a
    /// single step produces.
    #[test]
    fn seq_is_strictly_monotonic(
        sides in prop_vec(side_strategy(), 1..30),
        prices in prop_vec(price_strategy(), 1..30),
        qtys in prop_vec(qty_strategy(), 1..30),
    ) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "u", "BTC", dec!(1_000_000.0));
        fund(&ledger, "u", "USDT", dec!(1_000_000_000.0));
        ledger.reserve("u", "BTC", dec!(1_000_000.0)).unwrap();
        ledger.reserve("u", "USDT", dec!(1_000_000_000.0)).unwrap();

        let n = sides.len().min(prices.len()).min(qtys.len());
        let mut last_seq = 0u64;
        for i in 0..n {
            let order = limit_order(sides[i], qtys[i], prices[i], "u", i as u64 + 1);
            if let Ok(outcome) = book.submit(order, &ledger) {
                for event in &outcome.events {
                    prop_assert!(event.seq() > last_seq, "seq {} did not exceed previous {}", event.seq(), last_seq);
                    last_seq = event.seq();
                }
            }
        }
    }

    /// Invariant #8: cancelling an order twice is safe — the second cancel
    /// is a no-op rather than double-releasing the reservation.
    #[test]
    fn cancel_is_idempotent(qty in qty_strategy(), price in price_strategy()) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "u", "BTC", qty);
        ledger.reserve("u", "BTC", qty).unwrap();

        let order = limit_order(Side::Sell, qty, price, "u", 1);
        let order_id = order.order_id;
        book.submit(order, &ledger).unwrap();

        let first = book.cancel(order_id, &ledger).unwrap();
        prop_assert!(first.is_some());
        let reserved_after_first = ledger.balance("u", "BTC").reserved;
        prop_assert_eq!(reserved_after_first, Decimal::ZERO);

        let second = book.cancel(order_id, &ledger).unwrap();
        prop_assert!(second.is_none());
        prop_assert_eq!(ledger.balance("u", "BTC").reserved, Decimal::ZERO);
    }

    /// Invariant #9: an incoming order never trades against a resting
    /// order from the same user — it either skips that level's maker or
    /// cancels the crossing remainder instead.
    #[test]
    fn self_trades_are_prevented(qty in qty_strategy(), price in price_strategy()) {
        let ledger = Ledger::new("fees");
        let mut book = Book::new(config());
        fund(&ledger, "same-user", "BTC", qty);
        ledger.reserve("same-user", "BTC", qty).unwrap();
        fund(&ledger, "same-user", "USDT", dec!(200_000_000.0));
        ledger.reserve("same-user", "USDT", dec!(200_000_000.0)).unwrap();

        book.submit(limit_order(Side::Sell, qty, price, "same-user", 1), &ledger).unwrap();
        let outcome = book.submit(limit_order(Side::Buy, qty, price, "same-user", 2), &ledger).unwrap();

        prop_assert!(trades_in(&outcome.events).is_empty());
    }

    /// Invariant #10: replaying the exact sequence of accepted orders a run
    /// processed — reserving against a fresh ledger and resubmitting each
    /// one, the way `book::spawn_from_wal` replays a persisted command log
    /// — reconstructs the same resting book and the same balances, not just
    /// a seq counter past the prior high-water mark.
    #[test]
    fn replay_reconstructs_identical_book_and_ledger_state(
        orders in prop_vec((any::<bool>(), price_strategy(), qty_strategy()), 1..12),
    ) {
        fn build(orders: &[(bool, Decimal, Decimal)]) -> (Book, Ledger) {
            let ledger = Ledger::new("fees");
            let mut book = Book::new(config());
            fund(&ledger, "maker", "BTC", dec!(1_000_000.0));
            fund(&ledger, "maker", "USDT", dec!(200_000_000.0));
            fund(&ledger, "taker", "BTC", dec!(1_000_000.0));
            fund(&ledger, "taker", "USDT", dec!(200_000_000.0));

            for (i, (is_buy, price, qty)) in orders.iter().enumerate() {
                let side = if *is_buy { Side::Buy } else { Side::Sell };
                let user = if i % 2 == 0 { "maker" } else { "taker" };
                let asset = match side {
                    Side::Buy => "USDT",
                    Side::Sell => "BTC",
                };
                let reserved = match side {
                    Side::Buy => qty * price,
                    Side::Sell => *qty,
                };
                if ledger.reserve(user, asset, reserved).is_ok() {
                    let _ = book.submit(limit_order(side, *qty, *price, user, i as u64), &ledger);
                }
            }
            (book, ledger)
        }

        let (book_a, ledger_a) = build(&orders);
        let (book_b, ledger_b) = build(&orders);

        prop_assert_eq!(book_a.best_bid(), book_b.best_bid());
        prop_assert_eq!(book_a.best_ask(), book_b.best_ask());
        for user in ["maker", "taker"] {
            for asset in ["BTC", "USDT"] {
                let a = ledger_a.balance(user, asset);
                let b = ledger_b.balance(user, asset);
                prop_assert_eq!(a.available, b.available);
                prop_assert_eq!(a.reserved, b.reserved);
            }
        }
    }
}
