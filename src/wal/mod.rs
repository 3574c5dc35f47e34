//! Append-only write-ahead log.
//!
//! A fixed record header plus a checksummed payload, replayed in full on
//! startup. Record layout: `{len:u32, seq:u64, ts_ns:u64, crc32:u32}`
//! followed by `len` bytes of bincode-encoded payload.
//!
//! Two kinds of log live behind this one file format: a per-symbol
//! `WalRecord` log of the *input commands* a matching task has accepted
//! (submit/cancel/mark-price), and one process-wide `LedgerRecord` log of
//! deposits/withdrawals made through a `WalletAdapter`. Replaying the
//! commands through `Book::submit`/`cancel`/`add_stop` against a ledger
//! already rebuilt from its own log reconstructs both structures
//! deterministically — the derived `EventEnvelope`s a matching step
//! produces are not themselves persisted, since they don't carry enough to
//! reconstruct a resting order's identity or reservation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::book::StopOrder;
use crate::error::CoreError;
use crate::model::order::Order;

const HEADER_LEN: usize = 4 + 8 + 8 + 4;

/// Reserved log key for the process-wide ledger log. Not a valid symbol
/// name (symbols always contain a base/quote pair), so it can't collide
/// with a real `.wal` file.
const LEDGER_LOG_KEY: &str = "_ledger";

/// The input command a symbol's matching task persists before acting on
/// it. Replaying these in file order against a fresh `Book` reproduces the
/// exact same sequence of matches (trade/cancel identity aside, neither of
/// which is part of Book or Ledger state), so it rebuilds the Book's
/// resting orders and seq counter, and drives the same ledger reservations
/// and settlements the original run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    Submit(Order),
    SubmitStop(StopOrder),
    Cancel(Uuid),
    SetMarkPrice(Decimal),
}

/// A deposit or withdrawal made through a `WalletAdapter`, persisted so a
/// restart can re-credit/re-debit the ledger before any symbol replays its
/// own command log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerRecord {
    Credit { user: String, asset: String, amount: Decimal },
    Debit { user: String, asset: String, amount: Decimal },
}

/// One append-only log file per key (a symbol name, or the reserved ledger
/// key), opened lazily on first write.
pub struct Wal {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
    ledger_seq: AtomicU64,
}

impl Wal {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
            ledger_seq: AtomicU64::new(0),
        })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.wal", key.replace('/', "_")))
    }

    fn with_file<R>(&self, key: &str, f: impl FnOnce(&mut File) -> io::Result<R>) -> Result<R, CoreError> {
        let mut files = self.files.lock();
        let file = match files.get_mut(key) {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.file_path(key))
                    .map_err(|e| CoreError::Inconsistent(format!("wal open {}: {}", key, e)))?;
                files.entry(key.to_string()).or_insert(file)
            }
        };
        f(file).map_err(|e| CoreError::Inconsistent(format!("wal write {}: {}", key, e)))
    }

    /// Append one record to `key`'s log. Fsync is intentionally not forced
    /// per write — a crash loses at most the tail of the log, recoverable
    /// by replay up to the last complete record.
    fn append_record<T: Serialize>(&self, key: &str, seq: u64, ts_ns: u64, record: &T) -> Result<(), CoreError> {
        let payload = bincode::serialize(record).map_err(|e| CoreError::Inconsistent(format!("wal encode: {}", e)))?;
        let crc = crc32fast::hash(&payload);
        self.with_file(key, |file| {
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&seq.to_le_bytes())?;
            file.write_all(&ts_ns.to_le_bytes())?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&payload)
        })
    }

    /// Replay every complete record for `key` in file order. A truncated
    /// trailing record (partial write at crash time) is silently dropped
    /// rather than treated as corruption.
    fn replay_records<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, CoreError> {
        let path = self.file_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|e| CoreError::Inconsistent(format!("wal replay open: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        loop {
            let mut header = [0u8; HEADER_LEN];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(CoreError::Inconsistent(format!("wal replay header: {}", e))),
            }
            let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            let _seq = u64::from_le_bytes(header[4..12].try_into().unwrap());
            let _ts_ns = u64::from_le_bytes(header[12..20].try_into().unwrap());
            let crc = u32::from_le_bytes(header[20..24].try_into().unwrap());

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(CoreError::Inconsistent(format!("wal replay payload: {}", e))),
            }
            if crc32fast::hash(&payload) != crc {
                break; // torn write at the tail; stop here rather than fail replay entirely
            }
            let record: T = bincode::deserialize(&payload)
                .map_err(|e| CoreError::Inconsistent(format!("wal replay decode: {}", e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Persist one symbol's command. `seq` orders the record within the
    /// file for inspection/monitoring; replay does not depend on it being
    /// contiguous.
    pub fn append_command(&self, symbol: &str, seq: u64, ts_ns: u64, record: &WalRecord) -> Result<(), CoreError> {
        self.append_record(symbol, seq, ts_ns, record)
    }

    /// Every command persisted for `symbol`, in arrival order.
    pub fn replay_commands(&self, symbol: &str) -> Result<Vec<WalRecord>, CoreError> {
        self.replay_records(symbol)
    }

    /// Persist one ledger mutation made through a `WalletAdapter`. Seq is
    /// allocated internally since deposits/withdrawals aren't scoped to any
    /// one symbol's matching task.
    pub fn append_ledger_record(&self, ts_ns: u64, record: &LedgerRecord) -> Result<(), CoreError> {
        let seq = self.ledger_seq.fetch_add(1, Ordering::SeqCst);
        self.append_record(LEDGER_LOG_KEY, seq, ts_ns, record)
    }

    /// Every deposit/withdrawal ever persisted, in arrival order.
    pub fn replay_ledger(&self) -> Result<Vec<LedgerRecord>, CoreError> {
        self.replay_records(LEDGER_LOG_KEY)
    }

    /// Every symbol with a persisted command log, for startup replay before
    /// any gateway traffic is accepted. Excludes the reserved ledger key.
    pub fn known_symbols(&self) -> io::Result<Vec<String>> {
        let mut symbols = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if name == LEDGER_LOG_KEY {
                    continue;
                }
                symbols.push(name.replace('_', "/"));
            }
        }
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::order::{OrderStatus, Side, TimeInForce};
    use rust_decimal_macros::dec;

    fn order(seq: u64) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            client_order_id: None,
            user: "a".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            order_type: crate::model::order::OrderType::Limit,
            qty: dec!(1.0),
            price: Some(dec!(100.0)),
            stop_price: None,
            post_only: false,
            reduce_only: false,
            time_in_force: TimeInForce::Gtc,
            quote_budget: None,
            created_seq: seq,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Open,
            reserved_remaining: dec!(100.0),
        }
    }

    #[test]
    fn append_then_replay_commands_round_trips() {
        let dir = std::env::temp_dir().join(format!("clob-wal-test-{}", Uuid::new_v4()));
        let wal = Wal::open(&dir).unwrap();
        wal.append_command("BTC/USDT", 1, 1, &WalRecord::Submit(order(1))).unwrap();
        wal.append_command("BTC/USDT", 2, 2, &WalRecord::Cancel(Uuid::new_v4())).unwrap();

        let replayed = wal.replay_commands("BTC/USDT").unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(matches!(replayed[0], WalRecord::Submit(_)));
        assert!(matches!(replayed[1], WalRecord::Cancel(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn replay_of_missing_symbol_is_empty() {
        let dir = std::env::temp_dir().join(format!("clob-wal-test-{}", Uuid::new_v4()));
        let wal = Wal::open(&dir).unwrap();
        assert!(wal.replay_commands("ETH/USDT").unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ledger_records_round_trip_and_stay_off_symbol_logs() {
        let dir = std::env::temp_dir().join(format!("clob-wal-test-{}", Uuid::new_v4()));
        let wal = Wal::open(&dir).unwrap();
        wal.append_ledger_record(
            1,
            &LedgerRecord::Credit {
                user: "alice".into(),
                asset: "USDT".into(),
                amount: dec!(100.0),
            },
        )
        .unwrap();

        let replayed = wal.replay_ledger().unwrap();
        assert_eq!(replayed.len(), 1);
        assert!(wal.replay_commands("BTC/USDT").unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
