//! Per-(user, asset) balances with available/reserved split.
//!
//! The same fetch-validate-mutate-atomically-record transaction shape as
//! fund settlement elsewhere, built on `dashmap` for sharded concurrent
//! state — one entry per (user, asset) pair instead of one global lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::error::CoreError;
use crate::model::balance::Balance;
use crate::model::order::Side;
use crate::model::trade::Trade;

type Key = (String, String);

/// Reason tag for out-of-band credits/debits (deposits, withdrawals, fee
/// sweeps). Not interpreted by the ledger itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditReason {
    Deposit,
    Withdrawal,
    FeeCollection,
}

/// Shared balance store. Every (user, asset) pair is guarded by its own
/// lock; `settle` acquires the two locks it needs (taker's and maker's
/// relevant assets) in a total order on asset identifier to avoid deadlock
/// when two settlements on the same pair of users run concurrently on
/// different symbols.
pub struct Ledger {
    balances: DashMap<Key, Mutex<Balance>>,
    fee_account: String,
}

impl Ledger {
    pub fn new(fee_account: impl Into<String>) -> Self {
        Self {
            balances: DashMap::new(),
            fee_account: fee_account.into(),
        }
    }

    fn key(user: &str, asset: &str) -> Key {
        (user.to_string(), asset.to_string())
    }

    /// Returns a clone of the current balance, creating a zero entry on
    /// first access — balance entries are created on first credit and are
    /// never destroyed.
    pub fn balance(&self, user: &str, asset: &str) -> Balance {
        let entry = self
            .balances
            .entry(Self::key(user, asset))
            .or_insert_with(|| Mutex::new(Balance::zero(user, asset)));
        entry.lock().clone()
    }

    fn with_entry<R>(&self, user: &str, asset: &str, f: impl FnOnce(&mut Balance) -> R) -> R {
        let entry = self
            .balances
            .entry(Self::key(user, asset))
            .or_insert_with(|| Mutex::new(Balance::zero(user, asset)));
        let mut guard = entry.lock();
        f(&mut guard)
    }

    /// Move `amount` from available to reserved. Fails with
    /// `InsufficientFunds` if `available < amount`. Returns the resulting
    /// balance so callers can publish a `BalanceUpdate` event.
    pub fn reserve(&self, user: &str, asset: &str, amount: Decimal) -> Result<Balance, CoreError> {
        self.with_entry(user, asset, |b| {
            if b.available < amount {
                return Err(CoreError::InsufficientFunds);
            }
            b.available -= amount;
            b.reserved += amount;
            Ok(b.clone())
        })
    }

    /// Move `amount` from reserved back to available. A `reserved` underflow
    /// is an internal bug, not a user error. Returns the resulting balance.
    pub fn release(&self, user: &str, asset: &str, amount: Decimal) -> Result<Balance, CoreError> {
        self.with_entry(user, asset, |b| {
            if b.reserved < amount {
                return Err(CoreError::Inconsistent(format!(
                    "release {} exceeds reserved {} for {}/{}",
                    amount, b.reserved, user, asset
                )));
            }
            b.reserved -= amount;
            b.available += amount;
            Ok(b.clone())
        })
    }

    /// Credit/debit outside the matching critical section (deposits,
    /// withdrawals). Not atomic with `reserve`/`settle` on a different
    /// asset, which is fine: these calls are always single-asset.
    pub fn credit(&self, user: &str, asset: &str, amount: Decimal, _reason: CreditReason) {
        self.with_entry(user, asset, |b| b.available += amount);
    }

    pub fn debit(&self, user: &str, asset: &str, amount: Decimal, _reason: CreditReason) -> Result<(), CoreError> {
        self.with_entry(user, asset, |b| {
            if b.available < amount {
                return Err(CoreError::InsufficientFunds);
            }
            b.available -= amount;
            Ok(())
        })
    }

    /// Settle a matched trade. Debits/credits are applied in a total order
    /// on asset identifier (base before quote, alphabetically if tied) so
    /// that two concurrent settlements touching the same two users can never
    /// deadlock against each other.
    ///
    /// For a buy taker: debit `qty*price + taker_fee` from the taker's quote
    /// reserved, credit `qty` of base to the taker's available; debit `qty`
    /// of base from the maker's base reserved, credit `qty*price -
    /// maker_fee` of quote to the maker's available. Sell-taker trades are
    /// the mirror image. Fees accrue to the configured fee account.
    ///
    /// Returns every balance entry touched, in mutation order, so callers
    /// can publish one `BalanceUpdate` event per entry.
    pub fn settle(&self, trade: &Trade, base: &str, quote: &str) -> Result<Vec<Balance>, CoreError> {
        let notional = trade.price * trade.quantity;

        let (buyer, seller) = match trade.taker_side {
            Side::Buy => (trade.taker_user.as_str(), trade.maker_user.as_str()),
            Side::Sell => (trade.maker_user.as_str(), trade.taker_user.as_str()),
        };
        let (buyer_fee, seller_fee) = match trade.taker_side {
            Side::Buy => (trade.taker_fee, trade.maker_fee),
            Side::Sell => (trade.maker_fee, trade.taker_fee),
        };

        let mut touched = Vec::with_capacity(5);

        // Each balance entry is locked only for the duration of its own
        // mutation (never two at once), so settlement can never deadlock
        // regardless of asset ordering between concurrent calls.

        // Buyer: debit quote reserved, credit base available.
        touched.push(self.with_entry(buyer, quote, |b| {
            if b.reserved < notional + buyer_fee {
                return Err(CoreError::Inconsistent(format!(
                    "buyer {} reserved {} insufficient for notional+fee {}",
                    buyer, b.reserved, notional + buyer_fee
                )));
            }
            b.reserved -= notional + buyer_fee;
            Ok(b.clone())
        })?);
        touched.push(self.with_entry(buyer, base, |b| {
            b.available += trade.quantity;
            b.clone()
        }));

        // Seller: debit base reserved, credit quote available (net of fee).
        touched.push(self.with_entry(seller, base, |b| {
            if b.reserved < trade.quantity {
                return Err(CoreError::Inconsistent(format!(
                    "seller {} reserved base {} insufficient for qty {}",
                    seller, b.reserved, trade.quantity
                )));
            }
            b.reserved -= trade.quantity;
            Ok(b.clone())
        })?);
        touched.push(self.with_entry(seller, quote, |b| {
            b.available += notional - seller_fee;
            b.clone()
        }));

        // Fees accrue to the configured fee account.
        let total_fee = trade.taker_fee + trade.maker_fee;
        if !total_fee.is_zero() {
            touched.push(self.with_entry(&self.fee_account.clone(), quote, |b| {
                b.available += total_fee;
                b.clone()
            }));
        }

        Ok(touched)
    }

    /// Sum of `available + reserved` across every (user, asset) entry for
    /// one asset, used by the conservation property test.
    pub fn total_for_asset(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .filter(|e| e.key().1 == asset)
            .map(|e| e.value().lock().total())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::order::Side;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn mk_trade(price: Decimal, qty: Decimal, taker_fee: Decimal, maker_fee: Decimal, taker_side: Side) -> Trade {
        Trade {
            trade_id: Uuid::new_v4(),
            symbol: "BTC/USDT".into(),
            price,
            quantity: qty,
            taker_order_id: Uuid::new_v4(),
            maker_order_id: Uuid::new_v4(),
            taker_user: "taker".into(),
            maker_user: "maker".into(),
            taker_side,
            taker_fee,
            maker_fee,
            seq: 1,
            timestamp_ns: 0,
        }
    }

    #[test]
    fn reserve_then_release_is_a_no_op() {
        let ledger = Ledger::new("fees");
        ledger.credit("alice", "USDT", dec!(1000), CreditReason::Deposit);
        ledger.reserve("alice", "USDT", dec!(400)).unwrap();
        assert_eq!(ledger.balance("alice", "USDT").available, dec!(600));
        assert_eq!(ledger.balance("alice", "USDT").reserved, dec!(400));
        ledger.release("alice", "USDT", dec!(400)).unwrap();
        assert_eq!(ledger.balance("alice", "USDT").available, dec!(1000));
        assert_eq!(ledger.balance("alice", "USDT").reserved, dec!(0));
    }

    #[test]
    fn reserve_rejects_insufficient_funds() {
        let ledger = Ledger::new("fees");
        ledger.credit("alice", "USDT", dec!(10), CreditReason::Deposit);
        let err = ledger.reserve("alice", "USDT", dec!(20)).unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    }

    #[test]
    fn settle_conserves_funds_across_buy_taker() {
        let ledger = Ledger::new("fees");
        ledger.credit("taker", "USDT", dec!(100000), CreditReason::Deposit);
        ledger.credit("maker", "BTC", dec!(10), CreditReason::Deposit);

        ledger.reserve("taker", "USDT", dec!(50000)).unwrap();
        ledger.reserve("maker", "BTC", dec!(1.0)).unwrap();

        let trade = mk_trade(dec!(50000), dec!(1.0), Decimal::ZERO, Decimal::ZERO, Side::Buy);
        ledger.settle(&trade, "BTC", "USDT").unwrap();

        assert_eq!(ledger.balance("taker", "BTC").available, dec!(1.0));
        assert_eq!(ledger.balance("taker", "USDT").reserved, dec!(0));
        assert_eq!(ledger.balance("maker", "USDT").available, dec!(50000));
        assert_eq!(ledger.balance("maker", "BTC").reserved, dec!(0));

        let total_usdt = ledger.total_for_asset("USDT");
        assert_eq!(total_usdt, dec!(100000));
    }

    #[test]
    fn settle_with_fees_credits_fee_account() {
        let ledger = Ledger::new("fees");
        ledger.credit("taker", "USDT", dec!(100000), CreditReason::Deposit);
        ledger.credit("maker", "BTC", dec!(10), CreditReason::Deposit);
        ledger.reserve("taker", "USDT", dec!(50010)).unwrap();
        ledger.reserve("maker", "BTC", dec!(1.0)).unwrap();

        let trade = mk_trade(dec!(50000), dec!(1.0), dec!(10), dec!(5), Side::Buy);
        ledger.settle(&trade, "BTC", "USDT").unwrap();

        assert_eq!(ledger.balance("maker", "USDT").available, dec!(49995));
        assert_eq!(ledger.balance("fees", "USDT").available, dec!(15));
        // taker paid notional + fee out of reserved, nothing left over
        assert_eq!(ledger.balance("taker", "USDT").reserved, dec!(0));
    }
}
