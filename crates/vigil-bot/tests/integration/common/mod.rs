//! Shared fixtures: a paper exchange behind a real coordinator, and a
//! risk controller whose state store lives in a temporary directory.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vigil_admission::{BreakerConfig, GradedCircuitBreaker, TokenBucketLimiter};
use vigil_core::{Direction, Position, PositionStatus, Price, Size};
use vigil_executor::{DynGateway, ExecutionCoordinator, ExecutorConfig, PaperExchange};
use vigil_persistence::{FileStateStore, MemoryTradeStore};
use vigil_position::{
    Clock, ManualClock, MonitorConfig, PortfolioConfig, PositionRiskController, RiskStores,
    SignalSource, StaticSignalSource,
};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Long 10 @ 100, stop 90 (initial risk 100), margin 100, entered at `start()`.
pub fn long_position(symbol: &str, mark: Decimal) -> Position {
    Position {
        symbol: symbol.to_string(),
        direction: Direction::Long,
        entry_price: Price::new(dec!(100)),
        quantity: Size::new(dec!(10)),
        leverage: dec!(10),
        stop_loss: Price::new(dec!(90)),
        take_profit: Price::ZERO,
        margin_used: dec!(100),
        entry_time: start(),
        status: PositionStatus::Open,
        mark_price: Price::new(mark),
        realized_pnl: Decimal::ZERO,
    }
}

/// Coordinator over `exchange` with an unconstrained limiter.
pub fn coordinator(
    exchange: &Arc<PaperExchange>,
    breaker: BreakerConfig,
) -> (Arc<GradedCircuitBreaker>, Arc<ExecutionCoordinator>) {
    let breaker = Arc::new(GradedCircuitBreaker::new(breaker).unwrap());
    let limiter = Arc::new(TokenBucketLimiter::new(100, 100.0).unwrap());
    let coordinator = Arc::new(
        ExecutionCoordinator::new(
            Arc::clone(exchange) as DynGateway,
            Arc::clone(&breaker),
            limiter,
            &ExecutorConfig::default(),
        )
        .unwrap(),
    );
    (breaker, coordinator)
}

/// Everything a controller needs except its state store, which is
/// (re)opened from `state_path` on every `controller()` call.
pub struct RiskRig {
    pub exchange: Arc<PaperExchange>,
    pub breaker: Arc<GradedCircuitBreaker>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub signals: Arc<StaticSignalSource>,
    pub trades: Arc<MemoryTradeStore>,
    pub clock: Arc<ManualClock>,
    pub state_path: PathBuf,
    _dir: TempDir,
}

impl RiskRig {
    pub fn new(positions: Vec<Position>) -> Self {
        Self::with_breaker(positions, BreakerConfig::default())
    }

    pub fn with_breaker(positions: Vec<Position>, breaker: BreakerConfig) -> Self {
        let exchange = Arc::new(PaperExchange::new(dec!(10_000)));
        for position in positions {
            exchange.open_position(position);
        }
        let (breaker, coordinator) = coordinator(&exchange, breaker);
        let dir = TempDir::new().unwrap();
        Self {
            exchange,
            breaker,
            coordinator,
            signals: Arc::new(StaticSignalSource::new()),
            trades: Arc::new(MemoryTradeStore::new()),
            clock: Arc::new(ManualClock::new(start())),
            state_path: dir.path().join("state.json"),
            _dir: dir,
        }
    }

    /// Open the state file.
    pub fn open_state(&self) -> Arc<FileStateStore> {
        Arc::new(FileStateStore::open(&self.state_path).unwrap())
    }

    /// Build a fresh controller, as a restarted process would.
    pub fn controller(&self) -> (PositionRiskController, Arc<FileStateStore>) {
        let state = self.open_state();
        let controller = PositionRiskController::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.signals) as Arc<dyn SignalSource>,
            RiskStores {
                entry_times: state.clone(),
                initial_risks: state.clone(),
                partials: state.clone(),
                trades: self.trades.clone(),
            },
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            MonitorConfig::default(),
            PortfolioConfig::default(),
        )
        .unwrap();
        controller.restore().unwrap();
        (controller, state)
    }
}
