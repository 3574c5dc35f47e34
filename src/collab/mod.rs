//! Collaborator boundary traits: the wallet, auth, and KYC systems the core
//! consumes but does not implement. `async-trait` trait objects describe
//! these external bridge/settlement contracts at the seam; these three
//! collaborators genuinely sit outside this core's ownership and are only
//! described here as an interface, never implemented.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::CoreError;
use crate::ledger::{CreditReason, Ledger};
use crate::wal::{LedgerRecord, Wal};

/// Deposits and withdrawals. The core treats these as ledger-only
/// operations and never touches on-chain state itself (§6).
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    async fn credit(&self, user: &str, asset: &str, amount: Decimal, external_ref: &str) -> Result<(), CoreError>;
    async fn debit(&self, user: &str, asset: &str, amount: Decimal, external_ref: &str) -> Result<(), CoreError>;
}

/// Resolves a bearer token to an authenticated user id for gateway and
/// subscription admission.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, CoreError>;
}

/// Per-user limits evaluated at submit time (§6). A returned limit below
/// the intent rejects with `Unauthorized`.
#[derive(Debug, Clone, Copy)]
pub struct KycLimits {
    pub max_order_notional: Decimal,
    pub max_leverage: u32,
}

#[async_trait]
pub trait KycPolicy: Send + Sync {
    async fn limits(&self, user: &str) -> Result<KycLimits, CoreError>;
}

/// `WalletAdapter` backed directly by the core's own ledger — a stand-in
/// for whatever on-chain or banking rail a real deployment would use. Every
/// credit/debit is appended to the ledger's own WAL log before returning, so
/// a restart can replay deposits/withdrawals ahead of any symbol's command
/// log. `Ledger` itself stays WAL-agnostic — test fixtures construct one
/// directly and call `credit`/`debit` with no log in scope — this adapter is
/// the one boundary real deposits and withdrawals cross.
pub struct LedgerWalletAdapter {
    ledger: Arc<Ledger>,
    wal: Arc<Wal>,
}

impl LedgerWalletAdapter {
    pub fn new(ledger: Arc<Ledger>, wal: Arc<Wal>) -> Self {
        Self { ledger, wal }
    }
}

#[async_trait]
impl WalletAdapter for LedgerWalletAdapter {
    async fn credit(&self, user: &str, asset: &str, amount: Decimal, _external_ref: &str) -> Result<(), CoreError> {
        self.ledger.credit(user, asset, amount, CreditReason::Deposit);
        self.wal.append_ledger_record(
            now_ns(),
            &LedgerRecord::Credit {
                user: user.to_string(),
                asset: asset.to_string(),
                amount,
            },
        )
    }

    async fn debit(&self, user: &str, asset: &str, amount: Decimal, _external_ref: &str) -> Result<(), CoreError> {
        self.ledger.debit(user, asset, amount, CreditReason::Withdrawal)?;
        self.wal.append_ledger_record(
            now_ns(),
            &LedgerRecord::Debit {
                user: user.to_string(),
                asset: asset.to_string(),
                amount,
            },
        )
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
}

/// `AuthResolver` backed by HS256 bearer tokens via `jsonwebtoken`, the
/// only concrete auth mechanism this core needs out of the box.
pub struct JwtAuthResolver {
    secret: String,
}

impl JwtAuthResolver {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl AuthResolver for JwtAuthResolver {
    async fn verify(&self, token: &str) -> Result<String, CoreError> {
        use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let data = decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
            .map_err(|_| CoreError::Unauthorized)?;
        Ok(data.claims.sub)
    }
}

/// Fixed-token `AuthResolver` for tests and local development.
pub struct StaticAuthResolver {
    tokens: HashMap<String, String>,
}

impl StaticAuthResolver {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthResolver for StaticAuthResolver {
    async fn verify(&self, token: &str) -> Result<String, CoreError> {
        self.tokens.get(token).cloned().ok_or(CoreError::Unauthorized)
    }
}

/// `KycPolicy` that never restricts anyone — the default for local
/// development and for symbols KYC simply doesn't gate.
pub struct UnlimitedKycPolicy;

#[async_trait]
impl KycPolicy for UnlimitedKycPolicy {
    async fn limits(&self, _user: &str) -> Result<KycLimits, CoreError> {
        Ok(KycLimits {
            max_order_notional: Decimal::MAX,
            max_leverage: 125,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn static_auth_resolver_rejects_unknown_tokens() {
        let mut tokens = HashMap::new();
        tokens.insert("abc".to_string(), "alice".to_string());
        let resolver = StaticAuthResolver::new(tokens);
        assert_eq!(resolver.verify("abc").await.unwrap(), "alice");
        assert!(resolver.verify("nope").await.is_err());
    }

    #[tokio::test]
    async fn ledger_wallet_adapter_credits_available_balance() {
        let dir = std::env::temp_dir().join(format!("clob-collab-test-{}", uuid::Uuid::new_v4()));
        let ledger = Arc::new(Ledger::new("fees"));
        let wal = Arc::new(Wal::open(&dir).unwrap());
        let adapter = LedgerWalletAdapter::new(ledger.clone(), wal.clone());
        adapter.credit("alice", "USDT", dec!(100.0), "tx1").await.unwrap();
        assert_eq!(ledger.balance("alice", "USDT").available, dec!(100.0));
        assert_eq!(wal.replay_ledger().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
