//! Trade Publisher: commits one matching step's input command durably (WAL)
//! before making its resulting events visible to subscribers (Bus), so
//! nothing on the bus can outrun what would survive a crash.
//!
//! Sits in front of a `tokio::sync::broadcast`-based fan-out
//! (`subscribe_trades`, `subscribe_orderbook`) as one ordered commit
//! pipeline.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::CoreError;
use crate::model::event::EventEnvelope;
use crate::wal::{LedgerRecord, Wal, WalRecord};

#[derive(Clone)]
pub struct Publisher {
    wal: Arc<Wal>,
    bus: Arc<Bus>,
}

impl Publisher {
    pub fn new(wal: Arc<Wal>, bus: Arc<Bus>) -> Self {
        Self { wal, bus }
    }

    /// Commit one matching step: the input command is appended to the WAL
    /// first — this is what a restart replays to rebuild the Book and
    /// Ledger — then, if it produced any events, the whole batch becomes
    /// visible to subscribers together, so no subscriber ever sees a Trade
    /// without its corresponding OrderUpdates/BookDelta/BalanceUpdates.
    pub fn commit(&self, symbol: &str, record: WalRecord, seq: u64, events: Vec<EventEnvelope>) -> Result<(), CoreError> {
        let ts_ns = now_ns();
        self.wal.append_command(symbol, seq, ts_ns, &record)?;
        if !events.is_empty() {
            debug!(symbol, count = events.len(), "committed matching step");
            self.bus.publish_batch(symbol, &events, ts_ns);
        }
        Ok(())
    }

    /// Broadcast-only path for events with no corresponding input command
    /// to persist — currently only `SymbolHalted`, which documents a halt
    /// rather than an operation a restart would need to replay.
    pub fn broadcast_only(&self, symbol: &str, events: Vec<EventEnvelope>) {
        if events.is_empty() {
            return;
        }
        let ts_ns = now_ns();
        self.bus.publish_batch(symbol, &events, ts_ns);
    }

    /// Rebuild one symbol's command history from its WAL on startup, before
    /// the gateway accepts traffic for it. The Book and Ledger are rebuilt
    /// by replaying these commands on every restart.
    pub fn replay_commands(&self, symbol: &str) -> Result<Vec<WalRecord>, CoreError> {
        match self.wal.replay_commands(symbol) {
            Ok(records) => Ok(records),
            Err(err) => {
                warn!(symbol, %err, "wal replay failed");
                Err(err)
            }
        }
    }

    /// Rebuild every deposit/withdrawal made through a `WalletAdapter`,
    /// replayed into the Ledger before any symbol's command log.
    pub fn replay_ledger(&self) -> Result<Vec<LedgerRecord>, CoreError> {
        match self.wal.replay_ledger() {
            Ok(records) => Ok(records),
            Err(err) => {
                warn!(%err, "wal ledger replay failed");
                Err(err)
            }
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
