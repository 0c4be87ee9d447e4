//! Position monitor configuration.
//!
//! PnL-derived thresholds are `Decimal` (they are compared against exact
//! position arithmetic); signal thresholds are `f64` like the signals.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PositionError, PositionResult};

// ============================================================================
// MonitorConfig
// ============================================================================

/// Exit rule thresholds and the monitor cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between cycles. Default: 60.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Loss (fraction of initial risk) that forces a full close. Default: 0.99.
    #[serde(default = "default_loss_circuit_breaker_ratio")]
    pub loss_circuit_breaker_ratio: Decimal,

    /// Relative confidence / win probability drop that forces a close. Default: 0.20.
    #[serde(default = "default_confidence_drop_ratio")]
    pub confidence_drop_ratio: f64,
    /// How far back the drop is measured. Default: 300.
    #[serde(default = "default_confidence_lookback_secs")]
    pub confidence_lookback_secs: u64,

    /// Loss (fraction of initial risk) from which a hold may be granted. Default: 0.50.
    #[serde(default = "default_smart_hold_min_loss")]
    pub smart_hold_min_loss: Decimal,
    #[serde(default = "default_smart_hold_rebound_min")]
    pub smart_hold_rebound_min: f64,
    #[serde(default = "default_smart_hold_confidence_min")]
    pub smart_hold_confidence_min: f64,

    /// Confidence below which the entry thesis is considered gone. Default: 0.40.
    #[serde(default = "default_stale_thesis_confidence")]
    pub stale_thesis_confidence: f64,

    /// Confidence needed to stay in against the trend. Default: 0.60.
    #[serde(default = "default_counter_trend_confidence")]
    pub counter_trend_confidence: f64,

    /// ROE above which the stop is trailed. Default: 0.20.
    #[serde(default = "default_trailing_tp_threshold")]
    pub trailing_tp_threshold: Decimal,
    #[serde(default = "default_trailing_trend_strength")]
    pub trailing_trend_strength: f64,
    /// Share of the open gain the trailed stop locks in. Default: 0.5.
    #[serde(default = "default_trailing_lock_ratio")]
    pub trailing_lock_ratio: Decimal,

    /// ROE above which part of the position is closed once. Default: 0.60.
    #[serde(default = "default_partial_profit_threshold")]
    pub partial_profit_threshold: Decimal,
    #[serde(default = "default_partial_profit_fraction")]
    pub partial_profit_fraction: Decimal,

    /// Maximum holding time of a losing position. Default: 24.
    #[serde(default = "default_time_stop_hours")]
    pub time_stop_hours: u64,
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_loss_circuit_breaker_ratio() -> Decimal {
    Decimal::new(99, 2)
}

fn default_confidence_drop_ratio() -> f64 {
    0.20
}

fn default_confidence_lookback_secs() -> u64 {
    300
}

fn default_smart_hold_min_loss() -> Decimal {
    Decimal::new(50, 2)
}

fn default_smart_hold_rebound_min() -> f64 {
    0.70
}

fn default_smart_hold_confidence_min() -> f64 {
    0.65
}

fn default_stale_thesis_confidence() -> f64 {
    0.40
}

fn default_counter_trend_confidence() -> f64 {
    0.60
}

fn default_trailing_tp_threshold() -> Decimal {
    Decimal::new(20, 2)
}

fn default_trailing_trend_strength() -> f64 {
    0.60
}

fn default_trailing_lock_ratio() -> Decimal {
    Decimal::new(5, 1)
}

fn default_partial_profit_threshold() -> Decimal {
    Decimal::new(60, 2)
}

fn default_partial_profit_fraction() -> Decimal {
    Decimal::new(5, 1)
}

fn default_time_stop_hours() -> u64 {
    24
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            loss_circuit_breaker_ratio: default_loss_circuit_breaker_ratio(),
            confidence_drop_ratio: default_confidence_drop_ratio(),
            confidence_lookback_secs: default_confidence_lookback_secs(),
            smart_hold_min_loss: default_smart_hold_min_loss(),
            smart_hold_rebound_min: default_smart_hold_rebound_min(),
            smart_hold_confidence_min: default_smart_hold_confidence_min(),
            stale_thesis_confidence: default_stale_thesis_confidence(),
            counter_trend_confidence: default_counter_trend_confidence(),
            trailing_tp_threshold: default_trailing_tp_threshold(),
            trailing_trend_strength: default_trailing_trend_strength(),
            trailing_lock_ratio: default_trailing_lock_ratio(),
            partial_profit_threshold: default_partial_profit_threshold(),
            partial_profit_fraction: default_partial_profit_fraction(),
            time_stop_hours: default_time_stop_hours(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> PositionResult<()> {
        if self.monitor_interval_secs == 0 {
            return Err(PositionError::ConfigError(
                "monitor_interval_secs must be > 0".to_string(),
            ));
        }
        check_unit_decimal("loss_circuit_breaker_ratio", self.loss_circuit_breaker_ratio)?;
        check_unit_decimal("smart_hold_min_loss", self.smart_hold_min_loss)?;
        check_unit_decimal("trailing_lock_ratio", self.trailing_lock_ratio)?;
        check_unit_decimal("partial_profit_fraction", self.partial_profit_fraction)?;
        if self.smart_hold_min_loss >= self.loss_circuit_breaker_ratio {
            return Err(PositionError::ConfigError(format!(
                "smart_hold_min_loss ({}) must be below loss_circuit_breaker_ratio ({})",
                self.smart_hold_min_loss, self.loss_circuit_breaker_ratio
            )));
        }
        for (name, value) in [
            ("confidence_drop_ratio", self.confidence_drop_ratio),
            ("smart_hold_rebound_min", self.smart_hold_rebound_min),
            ("smart_hold_confidence_min", self.smart_hold_confidence_min),
            ("stale_thesis_confidence", self.stale_thesis_confidence),
            ("counter_trend_confidence", self.counter_trend_confidence),
            ("trailing_trend_strength", self.trailing_trend_strength),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PositionError::ConfigError(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.trailing_tp_threshold <= Decimal::ZERO
            || self.partial_profit_threshold <= Decimal::ZERO
        {
            return Err(PositionError::ConfigError(
                "gain thresholds must be > 0".to_string(),
            ));
        }
        if self.time_stop_hours == 0 {
            return Err(PositionError::ConfigError(
                "time_stop_hours must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    #[must_use]
    pub fn confidence_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.confidence_lookback_secs as i64)
    }

    #[must_use]
    pub fn time_stop(&self) -> chrono::Duration {
        chrono::Duration::hours(self.time_stop_hours as i64)
    }
}

/// Value must lie in `(0, 1]`.
fn check_unit_decimal(name: &str, value: Decimal) -> PositionResult<()> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(PositionError::ConfigError(format!(
            "{name} must be within (0, 1], got {value}"
        )));
    }
    Ok(())
}

// ============================================================================
// PortfolioConfig
// ============================================================================

/// Aggregate margin guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioConfig {
    #[serde(default = "default_portfolio_enabled")]
    pub enabled: bool,
    /// Margin in use over equity above which the worst position is closed. Default: 0.80.
    #[serde(default = "default_max_margin_ratio")]
    pub max_margin_ratio: Decimal,
    /// Minimum seconds between two forced closes. Default: 300.
    #[serde(default = "default_portfolio_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_portfolio_enabled() -> bool {
    true
}

fn default_max_margin_ratio() -> Decimal {
    Decimal::new(80, 2)
}

fn default_portfolio_cooldown_secs() -> u64 {
    300
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            enabled: default_portfolio_enabled(),
            max_margin_ratio: default_max_margin_ratio(),
            cooldown_secs: default_portfolio_cooldown_secs(),
        }
    }
}

impl PortfolioConfig {
    pub fn validate(&self) -> PositionResult<()> {
        if self.max_margin_ratio <= Decimal::ZERO {
            return Err(PositionError::ConfigError(
                "max_margin_ratio must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}
