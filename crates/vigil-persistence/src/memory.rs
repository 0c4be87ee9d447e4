//! In-memory stores.
//!
//! `MemoryStateStore` loses everything on restart and reports
//! `is_durable() == false`; running the time stop on top of it is
//! non-compliant and logged as such at startup.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};

use crate::error::PersistenceResult;
use crate::store::{
    EntryTimeStore, ExitRecord, InitialRiskStore, PartialCloseMarker, PartialCloseStore, TradeStore,
};

/// Non-durable entry-time, initial-risk and partial-close store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entry_times: Mutex<BTreeMap<String, DateTime<Utc>>>,
    initial_risks: Mutex<BTreeMap<String, Decimal>>,
    partial_closes: Mutex<BTreeMap<String, PartialCloseMarker>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryTimeStore for MemoryStateStore {
    fn get(&self, symbol: &str) -> PersistenceResult<Option<DateTime<Utc>>> {
        Ok(self.entry_times.lock().get(symbol).copied())
    }

    fn put(&self, symbol: &str, entry_time: DateTime<Utc>) -> PersistenceResult<()> {
        self.entry_times.lock().insert(symbol.to_string(), entry_time);
        Ok(())
    }

    fn delete(&self, symbol: &str) -> PersistenceResult<()> {
        self.entry_times.lock().remove(symbol);
        Ok(())
    }

    fn entries(&self) -> PersistenceResult<Vec<(String, DateTime<Utc>)>> {
        Ok(self
            .entry_times
            .lock()
            .iter()
            .map(|(s, t)| (s.clone(), *t))
            .collect())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

impl InitialRiskStore for MemoryStateStore {
    fn get_risk(&self, symbol: &str) -> PersistenceResult<Option<Decimal>> {
        Ok(self.initial_risks.lock().get(symbol).copied())
    }

    fn put_risk(&self, symbol: &str, risk: Decimal) -> PersistenceResult<()> {
        self.initial_risks.lock().insert(symbol.to_string(), risk);
        Ok(())
    }

    fn delete_risk(&self, symbol: &str) -> PersistenceResult<()> {
        self.initial_risks.lock().remove(symbol);
        Ok(())
    }
}

impl PartialCloseStore for MemoryStateStore {
    fn get_marker(&self, symbol: &str) -> PersistenceResult<Option<PartialCloseMarker>> {
        Ok(self.partial_closes.lock().get(symbol).cloned())
    }

    fn put_marker(&self, symbol: &str, marker: PartialCloseMarker) -> PersistenceResult<()> {
        self.partial_closes.lock().insert(symbol.to_string(), marker);
        Ok(())
    }

    fn delete_marker(&self, symbol: &str) -> PersistenceResult<()> {
        self.partial_closes.lock().remove(symbol);
        Ok(())
    }
}

/// In-memory exit log with the same dedupe rule as the file log.
#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    inner: Mutex<(Vec<ExitRecord>, HashSet<(String, i64)>)>,
}

impl MemoryTradeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TradeStore for MemoryTradeStore {
    fn record_exit(&self, record: &ExitRecord) -> PersistenceResult<bool> {
        let mut inner = self.inner.lock();
        let (records, seen) = &mut *inner;
        if !seen.insert(record.dedupe_key()) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    fn exits(&self) -> PersistenceResult<Vec<ExitRecord>> {
        Ok(self.inner.lock().0.clone())
    }
}
