//! Continuous position-risk control.
//!
//! Evaluates every open position on a fixed interval through an ordered
//! exit rule chain (P0..P7) plus an independently cooled portfolio margin
//! guard, and executes the resulting actions through the
//! `ExecutionCoordinator`.
//!
//! # Key Components
//!
//! - [`PositionRiskController`]: the monitor loop and action execution
//! - [`ExitRuleChain`] / [`ExitRule`]: ordered, first-match-wins exit rules
//! - [`PortfolioGuard`]: closes the worst position when aggregate margin is too high
//! - [`SignalSource`]: confidence / win probability / rebound / trend oracle
//! - [`ConfidenceHistory`]: per-symbol samples behind the confidence collapse rule
//! - [`Clock`]: wall-clock source (`ManualClock` in tests)

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod history;
pub mod portfolio;
pub mod rules;
pub mod signal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MonitorConfig, PortfolioConfig};
pub use controller::{CycleReport, PositionRiskController, RiskStores};
pub use error::{PositionError, PositionResult};
pub use history::{ConfidenceHistory, ConfidenceSample};
pub use portfolio::{Candidate, PortfolioGuard};
pub use rules::{ExitRule, ExitRuleChain, PartialProgress, RuleContext};
pub use signal::{SignalSnapshot, SignalSource, StaticSignalSource, Trend};
