//! Fixed-point price key used to sort book levels.
//!
//! `Decimal` scaled into an `i64` for cheap `BTreeMap` ordering — a sortable
//! fixed-point key beats scanning an insertion-ordered map for the best price.

use rust_decimal::Decimal;
use std::cmp::Ordering;

const SCALE: i64 = 100_000_000; // 8 implied decimal places

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceLevel(i64);

impl PriceLevel {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = (price * Decimal::from(SCALE)).round();
        PriceLevel(scaled.mantissa() as i64 / 10i64.pow(scaled.scale()))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(SCALE)
    }
}

impl Ord for PriceLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_trips_through_decimal() {
        let price = dec!(97500.50);
        let level = PriceLevel::from_decimal(price);
        assert_eq!(level.to_decimal(), price);
    }

    #[test]
    fn orders_by_numeric_value() {
        let p1 = PriceLevel::from_decimal(dec!(100.0));
        let p2 = PriceLevel::from_decimal(dec!(200.0));
        assert!(p1 < p2);
    }
}
