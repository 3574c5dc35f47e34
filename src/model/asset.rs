//! Assets and symbols.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque uppercase asset identifier, e.g. "BTC", "USDT".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Asset(String);

impl Asset {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Asset {
    fn from(s: &str) -> Self {
        Asset::new(s)
    }
}

/// Ordered pair (base, quote) written "BASE/QUOTE". The book trades base
/// against quote.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub base: Asset,
    pub quote: Asset,
}

impl Symbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: Asset::new(base),
            quote: Asset::new(quote),
        }
    }

    /// Parse "BASE/QUOTE". Returns `None` if the separator is missing.
    pub fn parse(raw: &str) -> Option<Self> {
        let (base, quote) = raw.split_once('/')?;
        Some(Self::new(base, quote))
    }

    pub fn as_string(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Per-symbol trading parameters: smallest allowed price/quantity increments
/// and the fee schedule applied at settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: Symbol,
    pub price_tick: Decimal,
    pub qty_step: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub max_leverage: u32,
}

impl SymbolConfig {
    /// `true` if `value` is an exact multiple of `increment`.
    pub fn is_aligned(value: Decimal, increment: Decimal) -> bool {
        if increment.is_zero() {
            return true;
        }
        (value % increment).is_zero()
    }

    pub fn price_aligned(&self, price: Decimal) -> bool {
        Self::is_aligned(price, self.price_tick)
    }

    pub fn qty_aligned(&self, qty: Decimal) -> bool {
        Self::is_aligned(qty, self.qty_step)
    }

    /// `floor(notional * rate / tick) * tick`, i.e. fees are rounded down to
    /// the quote asset's price tick to avoid dust creation.
    pub fn fee(&self, notional: Decimal, rate: Decimal) -> Decimal {
        if self.price_tick.is_zero() {
            return (notional * rate).round_dp(8);
        }
        let raw = notional * rate;
        (raw / self.price_tick).floor() * self.price_tick
    }
}
