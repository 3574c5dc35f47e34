//! Per-(user, asset) balances.
//!
//! `available`/`reserved` split, renamed from `available`/`frozen` to make
//! the order-gateway reservation flow read more directly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub user: String,
    pub asset: String,
    pub available: Decimal,
    pub reserved: Decimal,
}

impl Balance {
    pub fn zero(user: impl Into<String>, asset: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            asset: asset.into(),
            available: Decimal::ZERO,
            reserved: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.reserved
    }
}

/// Wire representation for the `balances:{user}` bus channel and for
/// `QueryOrder`-adjacent reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub user: String,
    pub asset: String,
    pub available: Decimal,
    pub reserved: Decimal,
}

impl From<&Balance> for BalanceUpdate {
    fn from(b: &Balance) -> Self {
        Self {
            user: b.user.clone(),
            asset: b.asset.clone(),
            available: b.available,
            reserved: b.reserved,
        }
    }
}
