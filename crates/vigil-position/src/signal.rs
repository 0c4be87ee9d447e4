//! Signal oracle consumed by the exit rules.
//!
//! How confidence, win probability, rebound probability and trend are
//! produced is outside this crate; the controller only samples them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use vigil_core::Direction;

/// Direction and strength (`[0, 1]`) of the current price trend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: Direction,
    pub strength: f64,
}

impl Trend {
    #[must_use]
    pub fn new(direction: Direction, strength: f64) -> Self {
        Self {
            direction,
            strength,
        }
    }
}

/// Per-symbol signal oracle. `None` means "no opinion".
#[cfg_attr(test, mockall::automock)]
pub trait SignalSource: Send + Sync {
    /// Current model confidence in `[0, 1]`.
    fn current_confidence(&self, symbol: &str) -> Option<f64>;

    /// Current win probability in `[0, 1]`.
    fn current_win_probability(&self, symbol: &str) -> Option<f64>;

    /// Probability that a losing position recovers.
    fn rebound_probability(&self, symbol: &str) -> Option<f64>;

    fn trend(&self, symbol: &str) -> Option<Trend>;
}

/// All signals of one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub win_probability: Option<f64>,
    #[serde(default)]
    pub rebound_probability: Option<f64>,
    #[serde(default)]
    pub trend: Option<Trend>,
}

/// Signal source whose values are set explicitly (paper mode, tests).
#[derive(Debug, Default)]
pub struct StaticSignalSource {
    signals: DashMap<String, SignalSnapshot>,
}

impl StaticSignalSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: &str, snapshot: SignalSnapshot) {
        self.signals.insert(symbol.to_string(), snapshot);
    }

    /// Update only the confidence of `symbol`.
    pub fn set_confidence(&self, symbol: &str, confidence: f64) {
        self.signals
            .entry(symbol.to_string())
            .or_default()
            .confidence = Some(confidence);
    }

    pub fn set_trend(&self, symbol: &str, trend: Trend) {
        self.signals.entry(symbol.to_string()).or_default().trend = Some(trend);
    }

    fn read<T>(&self, symbol: &str, field: impl Fn(&SignalSnapshot) -> Option<T>) -> Option<T> {
        self.signals.get(symbol).and_then(|s| field(s.value()))
    }
}

impl SignalSource for StaticSignalSource {
    fn current_confidence(&self, symbol: &str) -> Option<f64> {
        self.read(symbol, |s| s.confidence)
    }

    fn current_win_probability(&self, symbol: &str) -> Option<f64> {
        self.read(symbol, |s| s.win_probability)
    }

    fn rebound_probability(&self, symbol: &str) -> Option<f64> {
        self.read(symbol, |s| s.rebound_probability)
    }

    fn trend(&self, symbol: &str) -> Option<Trend> {
        self.read(symbol, |s| s.trend)
    }
}
