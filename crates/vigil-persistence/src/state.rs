//! File-backed entry-time, initial-risk and partial-close state.
//!
//! The whole state is one JSON document rewritten on every mutation with
//! the write-to-temp, fsync, rename pattern, so a crash leaves either the
//! previous or the new document on disk, never a torn one.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{PersistenceError, PersistenceResult};
use crate::store::{EntryTimeStore, InitialRiskStore, PartialCloseMarker, PartialCloseStore};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entry_times: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    initial_risks: BTreeMap<String, Decimal>,
    #[serde(default)]
    partial_closes: BTreeMap<String, PartialCloseMarker>,
}

/// Durable store for entry times, initial risks and partial close markers.
pub struct FileStateStore {
    path: PathBuf,
    state: Mutex<StateDocument>,
}

impl FileStateStore {
    /// Open (or create) the state file at `path`.
    ///
    /// A missing file starts empty. A file that exists but does not parse
    /// is an error; it is never silently replaced.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let doc: StateDocument =
                serde_json::from_str(&content).map_err(|e| PersistenceError::Corrupt {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            info!(
                path = %path.display(),
                entry_times = doc.entry_times.len(),
                initial_risks = doc.initial_risks.len(),
                partial_closes = doc.partial_closes.len(),
                "Loaded durable state"
            );
            doc
        } else {
            info!(path = %path.display(), "No state file, starting empty");
            StateDocument {
                version: STATE_VERSION,
                ..StateDocument::default()
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` and persist the result. The in-memory state is only
    /// replaced once the file write succeeded.
    fn update<F>(&self, mutate: F) -> PersistenceResult<()>
    where
        F: FnOnce(&mut StateDocument),
    {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        mutate(&mut next);
        next.version = STATE_VERSION;
        self.write_atomic(&next)?;
        *guard = next;
        Ok(())
    }

    fn write_atomic(&self, doc: &StateDocument) -> PersistenceResult<()> {
        let json = serde_json::to_string_pretty(doc)?;
        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        {
            let mut file = File::create(&temp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        // Persist the rename itself.
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }

        debug!(path = %self.path.display(), "State persisted");
        Ok(())
    }
}

impl EntryTimeStore for FileStateStore {
    fn get(&self, symbol: &str) -> PersistenceResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().entry_times.get(symbol).copied())
    }

    fn put(&self, symbol: &str, entry_time: DateTime<Utc>) -> PersistenceResult<()> {
        self.update(|doc| {
            doc.entry_times.insert(symbol.to_string(), entry_time);
        })
    }

    fn delete(&self, symbol: &str) -> PersistenceResult<()> {
        if !self.state.lock().entry_times.contains_key(symbol) {
            return Ok(());
        }
        self.update(|doc| {
            doc.entry_times.remove(symbol);
        })
    }

    fn entries(&self) -> PersistenceResult<Vec<(String, DateTime<Utc>)>> {
        Ok(self
            .state
            .lock()
            .entry_times
            .iter()
            .map(|(symbol, time)| (symbol.clone(), *time))
            .collect())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

impl InitialRiskStore for FileStateStore {
    fn get_risk(&self, symbol: &str) -> PersistenceResult<Option<Decimal>> {
        Ok(self.state.lock().initial_risks.get(symbol).copied())
    }

    fn put_risk(&self, symbol: &str, risk: Decimal) -> PersistenceResult<()> {
        self.update(|doc| {
            doc.initial_risks.insert(symbol.to_string(), risk);
        })
    }

    fn delete_risk(&self, symbol: &str) -> PersistenceResult<()> {
        if !self.state.lock().initial_risks.contains_key(symbol) {
            return Ok(());
        }
        self.update(|doc| {
            doc.initial_risks.remove(symbol);
        })
    }
}

impl PartialCloseStore for FileStateStore {
    fn get_marker(&self, symbol: &str) -> PersistenceResult<Option<PartialCloseMarker>> {
        Ok(self.state.lock().partial_closes.get(symbol).cloned())
    }

    fn put_marker(&self, symbol: &str, marker: PartialCloseMarker) -> PersistenceResult<()> {
        self.update(|doc| {
            doc.partial_closes.insert(symbol.to_string(), marker);
        })
    }

    fn delete_marker(&self, symbol: &str) -> PersistenceResult<()> {
        if !self.state.lock().partial_closes.contains_key(symbol) {
            return Ok(());
        }
        self.update(|doc| {
            doc.partial_closes.remove(symbol);
        })
    }
}

impl std::fmt::Debug for FileStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
