//! JSON Lines trade exit log.
//!
//! Uses JSON Lines format (.jsonl):
//! - Each line is one complete `ExitRecord`
//! - Files rotate daily (`exits_YYYY-MM-DD.jsonl`) and are opened in append mode
//! - A torn last line only loses that line; it is skipped on reload
//!
//! Seen `(position_id, closed_at)` keys are rebuilt from every file on open,
//! so duplicate deliveries are dropped across restarts too.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;
use crate::store::{ExitRecord, TradeStore};

const FILE_PREFIX: &str = "exits_";
const FILE_SUFFIX: &str = ".jsonl";

/// Open daily file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
}

struct TradeLogInner {
    seen: HashSet<(String, i64)>,
    active_writer: Option<ActiveWriter>,
}

/// Append-only, idempotent exit log on disk.
pub struct JsonLinesTradeStore {
    base_dir: PathBuf,
    inner: Mutex<TradeLogInner>,
}

impl JsonLinesTradeStore {
    /// Open the log directory, creating it if needed, and load seen keys.
    pub fn open(base_dir: impl AsRef<Path>) -> PersistenceResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let mut seen = HashSet::new();
        for record in read_all(&base_dir)? {
            seen.insert(record.dedupe_key());
        }
        info!(dir = %base_dir.display(), exits = seen.len(), "Opened trade exit log");

        Ok(Self {
            base_dir,
            inner: Mutex::new(TradeLogInner {
                seen,
                active_writer: None,
            }),
        })
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("{FILE_PREFIX}{date}{FILE_SUFFIX}"))
    }
}

impl TradeStore for JsonLinesTradeStore {
    fn record_exit(&self, record: &ExitRecord) -> PersistenceResult<bool> {
        let mut inner = self.inner.lock();
        let key = record.dedupe_key();
        if inner.seen.contains(&key) {
            debug!(position_id = %record.position_id, "Exit already recorded, skipping");
            return Ok(false);
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let needs_rotation = inner
            .active_writer
            .as_ref()
            .is_some_and(|w| w.date != today);
        if needs_rotation {
            if let Some(mut old) = inner.active_writer.take() {
                if let Err(e) = old.writer.flush() {
                    warn!(?e, "Failed to flush trade log on rotation");
                }
            }
        }

        let active = match inner.active_writer.take() {
            Some(active) => active,
            None => {
                let path = self.file_for(&today);
                info!(path = %path.display(), "Opening trade exit log (append mode)");
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                ActiveWriter {
                    writer: BufWriter::new(file),
                    date: today,
                }
            }
        };
        let active = inner.active_writer.insert(active);

        let json = serde_json::to_string(record)?;
        writeln!(active.writer, "{json}")?;
        active.writer.flush()?;
        active.writer.get_ref().sync_data()?;

        inner.seen.insert(key);
        info!(
            position_id = %record.position_id,
            reason = %record.reason,
            realized_pnl = %record.realized_pnl,
            "Exit recorded"
        );
        Ok(true)
    }

    fn exits(&self) -> PersistenceResult<Vec<ExitRecord>> {
        // Hold the lock so no write interleaves with the read.
        let _guard = self.inner.lock();
        read_all(&self.base_dir)
    }
}

/// Read every exit record in `dir`, files in date order.
fn read_all(dir: &Path) -> PersistenceResult<Vec<ExitRecord>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
        })
        .collect();
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let reader = BufReader::new(File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExitRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable trade log line"
                ),
            }
        }
    }
    Ok(records)
}

impl Drop for JsonLinesTradeStore {
    fn drop(&mut self) {
        if let Some(active) = self.inner.get_mut().active_writer.as_mut() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Failed to flush trade log on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use vigil_core::{ExitReason, Price, Size};

    fn make_record(position_id: &str, second: u32) -> ExitRecord {
        ExitRecord {
            position_id: position_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            reason: ExitReason::TimeBasedStop,
            realized_pnl: dec!(-12.5),
            quantity: Size::new(dec!(1)),
            exit_price: Price::new(dec!(49000)),
            closed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap(),
        }
    }

    #[test]
    fn test_record_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonLinesTradeStore::open(temp_dir.path()).unwrap();

        assert!(store.record_exit(&make_record("BTCUSDT@1", 0)).unwrap());
        assert!(store.record_exit(&make_record("BTCUSDT@2", 0)).unwrap());

        let exits = store.exits().unwrap();
        assert_eq!(exits.len(), 2);
        assert_eq!(exits[0].position_id, "BTCUSDT@1");
        assert_eq!(exits[0].reason, ExitReason::TimeBasedStop);
    }

    #[test]
    fn test_duplicate_delivery_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonLinesTradeStore::open(temp_dir.path()).unwrap();
        let record = make_record("BTCUSDT@1", 0);

        assert!(store.record_exit(&record).unwrap());
        assert!(!store.record_exit(&record).unwrap());
        assert_eq!(store.exits().unwrap().len(), 1);

        // Same position, different close time is a distinct exit.
        assert!(store.record_exit(&make_record("BTCUSDT@1", 5)).unwrap());
    }

    #[test]
    fn test_dedupe_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let record = make_record("BTCUSDT@1", 0);
        {
            let store = JsonLinesTradeStore::open(temp_dir.path()).unwrap();
            store.record_exit(&record).unwrap();
        }

        let store = JsonLinesTradeStore::open(temp_dir.path()).unwrap();
        assert!(!store.record_exit(&record).unwrap());
        assert_eq!(store.exits().unwrap().len(), 1);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = JsonLinesTradeStore::open(temp_dir.path()).unwrap();
            store.record_exit(&make_record("BTCUSDT@1", 0)).unwrap();
        }
        let file = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .next()
            .unwrap()
            .path();
        let mut f = OpenOptions::new().append(true).open(file).unwrap();
        write!(f, "{{\"position_id\":\"ETH").unwrap();

        let store = JsonLinesTradeStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.exits().unwrap().len(), 1);
    }
}
