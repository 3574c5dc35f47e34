//! Process configuration.
//!
//! `config` layered over `dotenvy::dotenv().ok()`: environment variables
//! layered over an optional file, with a `CLOB_` prefix, loaded once at
//! startup before anything else.

use std::net::SocketAddr;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::model::asset::{Symbol, SymbolConfig};

/// One symbol's trading parameters as they appear in configuration, before
/// being parsed into a [`SymbolConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolSettings {
    pub symbol: String,
    pub price_tick: Decimal,
    pub qty_step: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub max_leverage: u32,
}

impl SymbolSettings {
    fn into_symbol_config(self) -> anyhow::Result<SymbolConfig> {
        let symbol = Symbol::parse(&self.symbol)
            .ok_or_else(|| anyhow::anyhow!("invalid symbol in config: {}", self.symbol))?;
        Ok(SymbolConfig {
            symbol,
            price_tick: self.price_tick,
            qty_step: self.qty_step,
            maker_fee_rate: self.maker_fee_rate,
            taker_fee_rate: self.taker_fee_rate,
            max_leverage: self.max_leverage,
        })
    }
}

/// Top-level process configuration, loaded once at startup. Every field is
/// overridable via `CLOB_<FIELD>` environment
/// variables (e.g. `CLOB_BIND_ADDR`), with environment taking precedence
/// over file-based configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Address the combined Gateway RPC + Subscription Bus listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory the WAL writes its per-symbol log files under.
    #[serde(default = "default_wal_dir")]
    pub wal_dir: String,
    /// Account credited with every settlement fee.
    #[serde(default = "default_fee_account")]
    pub fee_account: String,
    /// Shared secret for the `JwtAuthResolver` stub — a real deployment's
    /// `AuthResolver` would not need this, it exists only for the in-memory
    /// stub this core ships with.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    /// Symbols registered with the Gateway at startup.
    pub symbols: Vec<SymbolSettings>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_wal_dir() -> String {
    "./data/wal".to_string()
}

fn default_fee_account() -> String {
    "fees".to_string()
}

fn default_jwt_secret() -> String {
    "dev-secret-change-me".to_string()
}

impl AppConfig {
    /// Load configuration from (in increasing precedence) `config/default.toml`,
    /// an optional `config/local.toml`, and `CLOB_`-prefixed environment
    /// variables. Returns an error the caller should translate to exit code 1.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("CLOB").separator("__"))
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;
        if config.symbols.is_empty() {
            anyhow::bail!("at least one symbol must be configured");
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.bind_addr.parse()?)
    }

    pub fn symbol_configs(self) -> anyhow::Result<Vec<SymbolConfig>> {
        self.symbols.into_iter().map(SymbolSettings::into_symbol_config).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_settings_parse_into_symbol_config() {
        let settings = SymbolSettings {
            symbol: "BTC/USDT".into(),
            price_tick: dec!(0.01),
            qty_step: dec!(0.0001),
            maker_fee_rate: dec!(0.0002),
            taker_fee_rate: dec!(0.0005),
            max_leverage: 10,
        };
        let config = settings.into_symbol_config().unwrap();
        assert_eq!(config.symbol.as_string(), "BTC/USDT");
    }

    #[test]
    fn symbol_settings_reject_malformed_symbol() {
        let settings = SymbolSettings {
            symbol: "BTCUSDT".into(),
            price_tick: dec!(0.01),
            qty_step: dec!(0.0001),
            maker_fee_rate: dec!(0.0002),
            taker_fee_rate: dec!(0.0005),
            max_leverage: 10,
        };
        assert!(settings.into_symbol_config().is_err());
    }
}
