//! Application wiring and lifecycle.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_admission::{GradedCircuitBreaker, TokenBucketLimiter};
use vigil_executor::{ExecutionCoordinator, PaperExchange};
use vigil_persistence::{FileStateStore, JsonLinesTradeStore};
use vigil_position::{PositionRiskController, RiskStores, StaticSignalSource, SystemClock};

use crate::config::AppConfig;
use crate::error::AppResult;

/// Main application.
pub struct Application {
    config: AppConfig,
    exchange: Arc<PaperExchange>,
    coordinator: Arc<ExecutionCoordinator>,
    controller: Arc<PositionRiskController>,
}

impl Application {
    /// Build every component from `config`.
    ///
    /// Opens the durable stores, so this fails if their paths are unusable.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let exchange = Arc::new(PaperExchange::new(config.paper.equity));
        let now = Utc::now();
        for seed in &config.paper.positions {
            exchange.open_position(seed.to_position(now));
        }

        let breaker = Arc::new(GradedCircuitBreaker::new(config.breaker.clone())?);
        let limiter = Arc::new(TokenBucketLimiter::from_config(&config.limiter)?);
        let coordinator = Arc::new(ExecutionCoordinator::new(
            exchange.clone(),
            breaker,
            limiter,
            &config.executor,
        )?);

        let state = Arc::new(FileStateStore::open(&config.persistence.state_path)?);
        let trades = Arc::new(JsonLinesTradeStore::open(
            &config.persistence.trade_log_dir,
        )?);
        let stores = RiskStores {
            entry_times: state.clone(),
            initial_risks: state.clone(),
            partials: state,
            trades,
        };

        let signals = Arc::new(StaticSignalSource::new());
        for seed in &config.paper.signals {
            signals.set(&seed.symbol, seed.snapshot());
        }

        let controller = PositionRiskController::new(
            coordinator.clone(),
            signals,
            stores,
            Arc::new(SystemClock),
            config.monitor.clone(),
            config.portfolio.clone(),
        )?
        .with_dry_run(config.is_observation_mode());

        info!(
            mode = ?config.mode,
            seeded_positions = config.paper.positions.len(),
            state_path = %config.persistence.state_path,
            "Application initialized"
        );

        Ok(Self {
            config,
            exchange,
            coordinator,
            controller: Arc::new(controller),
        })
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<PositionRiskController> {
        &self.controller
    }

    #[must_use]
    pub fn exchange(&self) -> &Arc<PaperExchange> {
        &self.exchange
    }

    /// Run until Ctrl+C.
    pub async fn run(self) -> AppResult<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, then stop gracefully.
    ///
    /// Shutdown cancels the monitor loop (an in-progress cycle finishes its
    /// current step), waits up to `shutdown_grace_secs` for in-flight
    /// exchange calls and aborts the loop if it is still running after that.
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        self.controller.restore()?;

        let token = CancellationToken::new();
        let controller = self.controller.clone();
        let loop_token = token.clone();
        let mut handle = tokio::spawn(async move { controller.run(loop_token).await });

        tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received");
            }
            result = &mut handle => {
                if let Err(e) = result {
                    error!(error = %e, "Position monitor task failed");
                }
                return Ok(());
            }
        }

        token.cancel();
        let grace = self.config.shutdown_grace();
        if !self.coordinator.inflight().drain(grace).await {
            warn!(
                inflight = self.coordinator.inflight().current(),
                "In-flight executions did not finish within the grace period"
            );
        }

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Position monitor task failed"),
            Err(_) => {
                warn!("Position monitor did not stop in time, aborting");
                handle.abort();
            }
        }

        info!("Application stopped");
        Ok(())
    }
}
