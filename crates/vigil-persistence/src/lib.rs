//! Durable state for vigil.
//!
//! - `EntryTimeStore`: when each open position was entered (drives the time stop)
//! - `InitialRiskStore`: each position's risk at first sighting (the loss ratio's denominator)
//! - `PartialCloseStore`: the one-shot partial profit lock marker per position
//! - `TradeStore`: append-only log of terminal exits
//!
//! `FileStateStore` and `JsonLinesTradeStore` survive restarts. The memory
//! implementations exist for tests and report themselves as non-durable.

pub mod error;
pub mod memory;
pub mod state;
pub mod store;
pub mod trades;

pub use error::{PersistenceError, PersistenceResult};
pub use memory::{MemoryStateStore, MemoryTradeStore};
pub use state::FileStateStore;
pub use store::{
    EntryTimeStore, ExitRecord, InitialRiskStore, MarkerState, PartialCloseMarker,
    PartialCloseStore, TradeStore,
};
pub use trades::JsonLinesTradeStore;
