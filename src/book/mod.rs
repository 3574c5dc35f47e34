//! Per-symbol matching task: owns one [`Book`] exclusively and drains an
//! MPSC queue in arrival order, single consumer per symbol. Cross-symbol
//! parallelism is unrestricted — each symbol gets its own task and its own
//! queue.

pub mod engine;
pub mod price_level;
pub mod stop_shelf;

pub use engine::{Book, MatchOutcome};
pub use stop_shelf::StopOrder;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::ledger::Ledger;
use crate::model::asset::SymbolConfig;
use crate::model::event::EventEnvelope;
use crate::model::order::Order;
use crate::publisher::Publisher;
use crate::wal::WalRecord;

enum Command {
    Submit {
        order: Order,
        reply: oneshot::Sender<Result<MatchOutcome, CoreError>>,
    },
    SubmitStop {
        stop: StopOrder,
        reply: oneshot::Sender<()>,
    },
    Cancel {
        order_id: Uuid,
        reply: oneshot::Sender<Result<Option<MatchOutcome>, CoreError>>,
    },
    SetMarkPrice {
        price: rust_decimal::Decimal,
    },
}

/// A cheaply-clonable handle the Gateway uses to talk to one symbol's
/// matching task. The task itself owns the only mutable reference to the
/// `Book`; this handle only ever sends messages to it.
#[derive(Clone)]
pub struct BookHandle {
    sender: mpsc::Sender<Command>,
}

impl BookHandle {
    pub async fn submit(&self, order: Order) -> Result<MatchOutcome, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Command::Submit { order, reply })
            .await
            .map_err(|_| CoreError::Inconsistent("symbol task is gone".into()))?;
        rx.await.map_err(|_| CoreError::Inconsistent("symbol task dropped reply".into()))?
    }

    pub async fn submit_stop(&self, stop: StopOrder) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Command::SubmitStop { stop, reply })
            .await
            .map_err(|_| CoreError::Inconsistent("symbol task is gone".into()))?;
        rx.await.map_err(|_| CoreError::Inconsistent("symbol task dropped reply".into()))
    }

    pub async fn cancel(&self, order_id: Uuid) -> Result<Option<MatchOutcome>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Command::Cancel { order_id, reply })
            .await
            .map_err(|_| CoreError::Inconsistent("symbol task is gone".into()))?;
        rx.await.map_err(|_| CoreError::Inconsistent("symbol task dropped reply".into()))?
    }

    pub async fn set_mark_price(&self, price: rust_decimal::Decimal) {
        let _ = self.sender.send(Command::SetMarkPrice { price }).await;
    }
}

/// Spawn one symbol's matching task against a fresh, empty `Book`. Used at
/// startup for a symbol with no prior command log.
pub fn spawn(config: SymbolConfig, ledger: Arc<Ledger>, publisher: Publisher) -> BookHandle {
    spawn_task(Book::new(config), ledger, publisher)
}

/// Rebuild one symbol's `Book` from its persisted command log, then spawn
/// the matching task on top of the reconstructed state. Submits and
/// cancels are replayed through the same `Book::submit`/`cancel` path a
/// live command would take (reserving against `ledger` first, exactly as
/// the Gateway would), so the resulting Book and Ledger balances are
/// identical to what they were at the last commit before the previous
/// process stopped. Returns the handle plus every match outcome produced
/// during replay so the caller can fold them into the Gateway's local
/// order cache via [`crate::gateway::Gateway::absorb_outcome`].
pub fn spawn_from_wal(
    config: SymbolConfig,
    ledger: Arc<Ledger>,
    publisher: Publisher,
    records: Vec<WalRecord>,
) -> (BookHandle, Vec<MatchOutcome>) {
    let mut book = Book::new(config.clone());
    let mut outcomes = Vec::new();
    let symbol = config.symbol.as_string();

    for record in records {
        match record {
            WalRecord::Submit(order) => {
                let asset = order.reserved_asset(&config.symbol).to_string();
                if let Err(err) = ledger.reserve(&order.user, &asset, order.reserved_remaining) {
                    error!(symbol, %err, "wal replay: reservation failed for a persisted order");
                    continue;
                }
                match book.submit(order, &ledger) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => error!(symbol, %err, "wal replay: submit failed"),
                }
            }
            WalRecord::SubmitStop(stop) => {
                let asset = stop.reserved_asset(&config.symbol).to_string();
                if let Err(err) = ledger.reserve(&stop.user, &asset, stop.reserved_remaining) {
                    error!(symbol, %err, "wal replay: reservation failed for a persisted stop order");
                    continue;
                }
                book.add_stop(stop);
            }
            WalRecord::Cancel(order_id) => match book.cancel(order_id, &ledger) {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => error!(symbol, %err, "wal replay: cancel failed"),
            },
            WalRecord::SetMarkPrice(price) => book.set_mark_price(price),
        }
    }

    (spawn_task(book, ledger, publisher), outcomes)
}

fn spawn_task(book: Book, ledger: Arc<Ledger>, publisher: Publisher) -> BookHandle {
    let (sender, receiver) = mpsc::channel(1024);
    let symbol = book.symbol();
    tokio::spawn(run(symbol, book, ledger, publisher, receiver));
    BookHandle { sender }
}

async fn run(
    symbol: String,
    mut book: Book,
    ledger: Arc<Ledger>,
    publisher: Publisher,
    mut receiver: mpsc::Receiver<Command>,
) {
    while let Some(cmd) = receiver.recv().await {
        if let Some(reason) = book.halt_reason().map(|r| r.to_string()) {
            reject_halted(cmd, &reason);
            continue;
        }
        match cmd {
            Command::Submit { order, reply } => {
                let record = WalRecord::Submit(order.clone());
                let result = book.submit(order, &ledger);
                handle_result(&symbol, &mut book, &publisher, record, result, reply);
            }
            Command::SubmitStop { stop, reply } => {
                let record = WalRecord::SubmitStop(stop.clone());
                book.add_stop(stop);
                let seq = book.allocate_seq();
                if let Err(err) = publisher.commit(&symbol, record, seq, Vec::new()) {
                    error!(symbol, %err, "publisher commit failed after stop submission");
                }
                let _ = reply.send(());
            }
            Command::Cancel { order_id, reply } => {
                let record = WalRecord::Cancel(order_id);
                let result = book.cancel(order_id, &ledger);
                match result {
                    Ok(outcome) => {
                        if let Some(outcome) = &outcome {
                            let seq = outcome.events.iter().map(|e| e.seq()).max().unwrap_or(0);
                            if let Err(err) = publisher.commit(&symbol, record, seq, outcome.events.clone()) {
                                error!(symbol, %err, "publisher commit failed after cancel");
                            }
                        }
                        let _ = reply.send(Ok(outcome));
                    }
                    Err(err) => {
                        if matches!(err, CoreError::Inconsistent(_)) {
                            halt(&symbol, &mut book, &publisher, &err);
                        }
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::SetMarkPrice { price } => {
                book.set_mark_price(price);
                let seq = book.allocate_seq();
                if let Err(err) = publisher.commit(&symbol, WalRecord::SetMarkPrice(price), seq, Vec::new()) {
                    error!(symbol, %err, "publisher commit failed after mark price update");
                }
            }
        }
    }
}

fn handle_result(
    symbol: &str,
    book: &mut Book,
    publisher: &Publisher,
    record: WalRecord,
    result: Result<MatchOutcome, CoreError>,
    reply: oneshot::Sender<Result<MatchOutcome, CoreError>>,
) {
    match result {
        Ok(outcome) => {
            let seq = outcome.events.iter().map(|e| e.seq()).max().unwrap_or(0);
            if let Err(err) = publisher.commit(symbol, record, seq, outcome.events.clone()) {
                error!(symbol, %err, "publisher commit failed after submit");
            }
            let _ = reply.send(Ok(outcome));
        }
        Err(err) => {
            if matches!(err, CoreError::Inconsistent(_)) {
                halt(symbol, book, publisher, &err);
            }
            let _ = reply.send(Err(err));
        }
    }
}

fn halt(symbol: &str, book: &mut Book, publisher: &Publisher, err: &CoreError) {
    warn!(symbol, %err, "symbol halted after inconsistent invariant");
    let seq = book.take_seq_for_halt();
    let event = EventEnvelope::SymbolHalted {
        seq,
        symbol: symbol.to_string(),
        reason: err.to_string(),
    };
    publisher.broadcast_only(symbol, vec![event]);
}

fn reject_halted(cmd: Command, reason: &str) {
    let err = CoreError::Inconsistent(format!("symbol halted: {reason}"));
    match cmd {
        Command::Submit { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Cancel { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::SubmitStop { reply, .. } => {
            let _ = reply.send(());
        }
        Command::SetMarkPrice { .. } => {}
    }
}
