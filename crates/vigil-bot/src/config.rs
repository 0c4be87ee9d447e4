//! Application configuration.
//!
//! Loaded from a TOML file and layered with `VIGIL__SECTION__KEY`
//! environment overrides. Every field has a default, so a partial file
//! (or an empty one) is valid.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use vigil_admission::{BreakerConfig, LimiterConfig};
use vigil_core::{Direction, Position, PositionStatus, Price, Size};
use vigil_executor::ExecutorConfig;
use vigil_position::{MonitorConfig, PortfolioConfig, SignalSnapshot, Trend};

use crate::error::{AppError, AppResult};

/// Environment override prefix (`VIGIL__MONITOR__TIME_STOP_HOURS=12`).
const ENV_PREFIX: &str = "VIGIL";

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Decisions are logged, never executed.
    #[default]
    Observation,
    /// Decisions are executed against the paper exchange.
    Paper,
}

/// Durable state locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Entry times and partial-close markers (JSON document).
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// Directory of daily exit logs (JSON Lines).
    #[serde(default = "default_trade_log_dir")]
    pub trade_log_dir: String,
}

fn default_state_path() -> String {
    "./data/state.json".to_string()
}

fn default_trade_log_dir() -> String {
    "./data/exits".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            trade_log_dir: default_trade_log_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Position seeded into the paper exchange at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPositionConfig {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profit: Decimal,
    /// Defaults to the entry price.
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    /// Defaults to startup time.
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
}

fn default_leverage() -> Decimal {
    Decimal::TEN
}

impl PaperPositionConfig {
    /// Build the seeded position; margin is `quantity * entry / leverage`.
    #[must_use]
    pub fn to_position(&self, now: DateTime<Utc>) -> Position {
        let quantity = Size::new(self.quantity);
        let entry_price = Price::new(self.entry_price);
        let margin_used = if self.leverage > Decimal::ZERO {
            quantity.notional(entry_price) / self.leverage
        } else {
            quantity.notional(entry_price)
        };
        Position {
            symbol: self.symbol.clone(),
            direction: self.direction,
            entry_price,
            quantity,
            leverage: self.leverage,
            stop_loss: Price::new(self.stop_loss),
            take_profit: Price::new(self.take_profit),
            margin_used,
            entry_time: self.entry_time.unwrap_or(now),
            status: PositionStatus::Open,
            mark_price: Price::new(self.mark_price.unwrap_or(self.entry_price)),
            realized_pnl: Decimal::ZERO,
        }
    }
}

/// Static signals of one symbol.
///
/// Kept as a list entry rather than a table keyed by symbol so that the
/// symbol survives key normalization in the config layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSignalConfig {
    pub symbol: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub win_probability: Option<f64>,
    #[serde(default)]
    pub rebound_probability: Option<f64>,
    #[serde(default)]
    pub trend: Option<Trend>,
}

impl PaperSignalConfig {
    #[must_use]
    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            confidence: self.confidence,
            win_probability: self.win_probability,
            rebound_probability: self.rebound_probability,
            trend: self.trend,
        }
    }
}

/// Paper exchange and signal seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_paper_equity")]
    pub equity: Decimal,
    #[serde(default)]
    pub positions: Vec<PaperPositionConfig>,
    #[serde(default)]
    pub signals: Vec<PaperSignalConfig>,
}

fn default_paper_equity() -> Decimal {
    Decimal::new(10_000, 0)
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            equity: default_paper_equity(),
            positions: Vec::new(),
            signals: Vec::new(),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mode: OperatingMode,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Seconds shutdown waits for in-flight exchange calls. Default: 10.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub paper: PaperConfig,
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            executor: ExecutorConfig::default(),
            monitor: MonitorConfig::default(),
            portfolio: PortfolioConfig::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            paper: PaperConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, then apply `VIGIL__*` environment overrides.
    pub fn from_file(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            return Err(AppError::Config(format!("config file not found: {path}")));
        }
        let settings = ::config::Config::builder()
            .add_source(::config::File::new(path, ::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no environment layer).
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.breaker.validate()?;
        self.limiter.validate()?;
        self.executor.validate()?;
        self.monitor.validate()?;
        self.portfolio.validate()?;
        if self.paper.equity <= Decimal::ZERO {
            return Err(AppError::Config("paper.equity must be > 0".to_string()));
        }
        for signal in &self.paper.signals {
            let values = [signal.confidence, signal.win_probability, signal.rebound_probability];
            if values.iter().flatten().any(|v| !(0.0..=1.0).contains(v)) {
                return Err(AppError::Config(format!(
                    "paper signals for {} must be within [0, 1]",
                    signal.symbol
                )));
            }
        }
        for seed in &self.paper.positions {
            if seed.quantity <= Decimal::ZERO || seed.entry_price <= Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "paper position {} needs positive quantity and entry_price",
                    seed.symbol
                )));
            }
        }
        Ok(())
    }

    pub fn is_observation_mode(&self) -> bool {
        self.mode == OperatingMode::Observation
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use vigil_core::OperationClass;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.is_observation_mode());
        assert!(config.validate().is_ok());
        assert_eq!(config.shutdown_grace_secs, 10);
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_sections_parse() {
        let config = AppConfig::from_toml(
            r#"
            mode = "paper"

            [breaker]
            warning_threshold = 2
            throttled_threshold = 4
            blocked_threshold = 5
            bypass_whitelist = ["close_position", "cancel_order"]

            [monitor]
            time_stop_hours = 6

            [[paper.positions]]
            symbol = "BTCUSDT"
            direction = "LONG"
            entry_price = 100
            quantity = 2
            stop_loss = 95

            [[paper.signals]]
            symbol = "BTCUSDT"
            confidence = 0.8
            trend = { direction = "SHORT", strength = 0.7 }
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, OperatingMode::Paper);
        assert_eq!(config.breaker.blocked_threshold, 5);
        assert_eq!(
            config.breaker.bypass_whitelist,
            vec![OperationClass::ClosePosition, OperationClass::CancelOrder]
        );
        assert_eq!(config.monitor.time_stop_hours, 6);
        assert_eq!(config.paper.positions.len(), 1);
        let signal = config.paper.signals[0].snapshot();
        assert_eq!(signal.confidence, Some(0.8));
        assert_eq!(signal.trend, Some(Trend::new(Direction::Short, 0.7)));
    }

    #[test]
    fn test_shipped_default_config() {
        let config = AppConfig::from_toml(include_str!("../../../config/default.toml")).unwrap();
        assert!(config.is_observation_mode());
        assert_eq!(config.breaker, BreakerConfig::default());
        assert_eq!(config.limiter, LimiterConfig::default());
        assert_eq!(config.executor, ExecutorConfig::default());
        assert_eq!(config.monitor, MonitorConfig::default());
        assert_eq!(config.portfolio, PortfolioConfig::default());
        assert_eq!(config.paper.positions[0].symbol, "BTCUSDT");
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [breaker]
            warning_threshold = 5
            throttled_threshold = 4
            blocked_threshold = 3
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_seed_position_margin() {
        let seed = PaperPositionConfig {
            symbol: "ETHUSDT".to_string(),
            direction: Direction::Short,
            entry_price: dec!(2000),
            quantity: dec!(1.5),
            leverage: dec!(10),
            stop_loss: dec!(2100),
            take_profit: Decimal::ZERO,
            mark_price: None,
            entry_time: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let position = seed.to_position(now);
        assert_eq!(position.margin_used, dec!(300));
        assert_eq!(position.mark_price, Price::new(dec!(2000)));
        assert_eq!(position.entry_time, now);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "mode = \"paper\"\n[limiter]\nrefill_rate = 2.5").unwrap();

        let config = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.mode, OperatingMode::Paper);
        assert_eq!(config.limiter.refill_rate, 2.5);
        assert_eq!(config.limiter.bucket_capacity, 10);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::from_file("/nonexistent/vigil.toml").is_err());
    }
}
