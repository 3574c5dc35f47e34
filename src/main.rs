//! Process entry point: one listening socket serving both the Gateway's
//! order RPC and the Subscription Bus's websocket feed. Exit codes: 0
//! normal, 1 config error, 2 persistence replay failure.
//!
//! Router-assembly (`CorsLayer`, `TraceLayer`, one `axum::serve` over one
//! `TcpListener`) and `tracing_subscriber` init pattern — this process's
//! only collaborators are the ones named in the collaborator-boundary
//! traits, so there is no database or cache manager to wire up here.

use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clob_core::api::{routes, AppState};
use clob_core::book;
use clob_core::bus::Bus;
use clob_core::collab::{JwtAuthResolver, UnlimitedKycPolicy};
use clob_core::config::AppConfig;
use clob_core::gateway::Gateway;
use clob_core::ledger::Ledger;
use clob_core::metrics;
use clob_core::publisher::Publisher;
use clob_core::wal::Wal;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "clob_core=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let bind_addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, "invalid bind_addr in configuration");
            return ExitCode::from(1);
        }
    };
    let wal_dir = config.wal_dir.clone();
    let fee_account = config.fee_account.clone();
    let jwt_secret = config.jwt_secret.clone();
    let symbol_configs = match config.symbol_configs() {
        Ok(configs) => configs,
        Err(err) => {
            tracing::error!(error = %err, "invalid symbol configuration");
            return ExitCode::from(1);
        }
    };

    let wal = match Wal::open(&wal_dir) {
        Ok(wal) => Arc::new(wal),
        Err(err) => {
            tracing::error!(error = %err, wal_dir, "failed to open write-ahead log");
            return ExitCode::from(2);
        }
    };
    let bus = Arc::new(Bus::new());
    let publisher = Publisher::new(wal.clone(), bus.clone());
    let ledger = Arc::new(Ledger::new(fee_account));

    // Deposits/withdrawals replay before any symbol's command log, so every
    // order's reservation in that log finds the balance it expects.
    let ledger_records = match publisher.replay_ledger() {
        Ok(records) => records,
        Err(err) => {
            tracing::error!(error = %err, "failed to replay ledger write-ahead log");
            return ExitCode::from(2);
        }
    };
    for record in ledger_records {
        match record {
            clob_core::wal::LedgerRecord::Credit { user, asset, amount } => {
                ledger.credit(&user, &asset, amount, clob_core::ledger::CreditReason::Deposit);
            }
            clob_core::wal::LedgerRecord::Debit { user, asset, amount } => {
                if let Err(err) = ledger.debit(&user, &asset, amount, clob_core::ledger::CreditReason::Withdrawal) {
                    tracing::error!(error = %err, "wal ledger replay: debit failed");
                }
            }
        }
    }

    let auth = Arc::new(JwtAuthResolver::new(jwt_secret));
    let kyc = Arc::new(UnlimitedKycPolicy);
    let gateway = Gateway::new(ledger.clone(), kyc);

    for symbol_config in symbol_configs {
        let symbol = symbol_config.symbol.as_string();
        let records = match publisher.replay_commands(&symbol) {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, symbol, "failed to replay write-ahead log");
                return ExitCode::from(2);
            }
        };
        metrics::record_wal_replay_events(&symbol, records.len() as u64);
        let (handle, outcomes) = book::spawn_from_wal(symbol_config.clone(), ledger.clone(), publisher.clone(), records);
        for outcome in &outcomes {
            gateway.absorb_outcome(outcome);
        }
        gateway.register_symbol(symbol_config, handle);
        tracing::info!(symbol, "symbol registered");
    }

    let metrics_handle = metrics::init_metrics();
    let state = AppState {
        gateway,
        bus,
        auth,
        metrics_handle,
    };

    let app: Router = routes::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %bind_addr, "failed to bind listener");
            return ExitCode::from(1);
        }
    };
    tracing::info!(%bind_addr, "listening");

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server error");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}
