//! Execution coordinator.
//!
//! The single path through which exchange calls are made. For each
//! request it consults the circuit breaker, takes a rate limiter token,
//! calls the gateway with a per-call timeout and bounded retries, and
//! feeds the terminal outcome back into the breaker.
//!
//! Admission denial is a value (`ExecutionOutcome::Blocked`), never an error.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vigil_admission::{CircuitLevel, GradedCircuitBreaker, TokenBucketLimiter};
use vigil_core::{IdempotencyKey, OperationClass, OperationRequest, OrderSpec, Position, Price};
use vigil_core::{Balance, Priority};
use vigil_telemetry::Metrics;

use crate::config::ExecutorConfig;
use crate::error::{ExecutorResult, GatewayError, GatewayResult, RetryableKind};
use crate::gateway::{DynGateway, ExecutionReceipt};
use crate::inflight::InflightTracker;
use crate::retry::RetryPolicy;

// ============================================================================
// Payload / Outcome
// ============================================================================

/// What to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    PlaceOrder(OrderSpec),
    CancelOrder { order_id: String },
    AdjustProtection {
        symbol: String,
        stop_loss: Price,
        take_profit: Price,
    },
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Self::PlaceOrder(_) => "place_order",
            Self::CancelOrder { .. } => "cancel_order",
            Self::AdjustProtection { .. } => "adjust_protection",
        }
    }
}

/// Terminal result of one `execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success(ExecutionReceipt),
    /// Admission control denied the request; the exchange was not contacted.
    Blocked { level: CircuitLevel },
    /// Retryable errors on every attempt.
    RetryableFailure { error: GatewayError, attempts: u32 },
    /// Not retried.
    FatalFailure { error: GatewayError },
}

impl ExecutionOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub fn receipt(&self) -> Option<&ExecutionReceipt> {
        match self {
            Self::Success(receipt) => Some(receipt),
            _ => None,
        }
    }

    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Blocked { .. } => "blocked",
            Self::RetryableFailure { .. } => "retryable_failure",
            Self::FatalFailure { .. } => "fatal_failure",
        }
    }
}

/// Failure of a read-only query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Query blocked by circuit breaker ({level})")]
    Blocked { level: CircuitLevel },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

// ============================================================================
// ExecutionCoordinator
// ============================================================================

/// Sole writer of exchange-mutating calls.
pub struct ExecutionCoordinator {
    gateway: DynGateway,
    breaker: Arc<GradedCircuitBreaker>,
    limiter: Arc<TokenBucketLimiter>,
    policy: RetryPolicy,
    call_timeout: Duration,
    completed_cache_size: usize,
    /// Receipts of completed keys.
    completed: DashMap<IdempotencyKey, ExecutionReceipt>,
    inflight: Arc<InflightTracker>,
}

impl ExecutionCoordinator {
    /// Create a coordinator.
    ///
    /// # Arguments
    /// * `gateway` - Exchange collaborator
    /// * `breaker` - Shared circuit breaker
    /// * `limiter` - Shared rate limiter
    /// * `config` - Retry and timeout settings (validated here)
    pub fn new(
        gateway: DynGateway,
        breaker: Arc<GradedCircuitBreaker>,
        limiter: Arc<TokenBucketLimiter>,
        config: &ExecutorConfig,
    ) -> ExecutorResult<Self> {
        config.validate()?;
        Ok(Self {
            gateway,
            breaker,
            limiter,
            policy: RetryPolicy::from_config(config),
            call_timeout: config.call_timeout(),
            completed_cache_size: config.completed_cache_size,
            completed: DashMap::new(),
            inflight: Arc::new(InflightTracker::new()),
        })
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<GradedCircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn inflight(&self) -> &Arc<InflightTracker> {
        &self.inflight
    }

    /// Execute one exchange-mutating request.
    pub async fn execute(&self, request: OperationRequest, payload: Payload) -> ExecutionOutcome {
        let _inflight = self.inflight.enter();
        let class = request.operation_class;
        let key = request.idempotency_key.clone();

        if let Some(receipt) = self.completed.get(&key).map(|r| r.value().clone()) {
            debug!(key = %key, class = %class, "Idempotency key already completed, answering from cache");
            Metrics::execution_deduped(class.as_str(), "cache");
            return self.finish(class, ExecutionOutcome::Success(receipt));
        }

        let admission = self.breaker.can_proceed(request.priority, class);
        if !admission.allowed {
            info!(
                key = %key,
                class = %class,
                priority = %request.priority,
                level = %admission.level,
                "Execution blocked by circuit breaker"
            );
            return self.finish(class, ExecutionOutcome::Blocked {
                level: admission.level,
            });
        }
        if let Some(wait) = admission.wait_hint {
            debug!(class = %class, wait_ms = wait.as_millis() as u64, "Breaker throttled, waiting");
            tokio::time::sleep(wait).await;
        }

        let outcome = self.send_with_retries(&request, &payload).await;

        match &outcome {
            ExecutionOutcome::Success(receipt) => {
                self.breaker.record_success(class);
                self.remember(key, receipt.clone());
            }
            ExecutionOutcome::RetryableFailure { error, attempts } => {
                self.breaker.record_failure(class);
                warn!(
                    key = %request.idempotency_key,
                    class = %class,
                    payload = payload.kind(),
                    attempts,
                    error = %error,
                    "Execution failed after retries"
                );
            }
            ExecutionOutcome::FatalFailure { error } => {
                self.breaker.record_failure(class);
                error!(
                    key = %request.idempotency_key,
                    class = %class,
                    payload = payload.kind(),
                    error = %error,
                    "Execution failed (fatal)"
                );
            }
            ExecutionOutcome::Blocked { .. } => {}
        }

        self.finish(class, outcome)
    }

    /// Fetch open positions through the `query` admission path.
    ///
    /// Risk monitoring passes `Priority::Critical` so that a BLOCKED
    /// breaker never stops it from seeing the positions it must protect.
    pub async fn get_positions(&self, priority: Priority) -> Result<Vec<Position>, QueryError> {
        let gateway = Arc::clone(&self.gateway);
        self.query(priority, move || {
            let gateway = Arc::clone(&gateway);
            async move { gateway.get_positions().await }
        })
        .await
    }

    /// Fetch the account balance through the `query` admission path.
    pub async fn get_account_balance(&self, priority: Priority) -> Result<Balance, QueryError> {
        let gateway = Arc::clone(&self.gateway);
        self.query(priority, move || {
            let gateway = Arc::clone(&gateway);
            async move { gateway.get_account_balance().await }
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn send_with_retries(
        &self,
        request: &OperationRequest,
        payload: &Payload,
    ) -> ExecutionOutcome {
        let class = request.operation_class;
        let key = &request.idempotency_key;
        let mut attempt = 1;

        loop {
            if attempt > 1 {
                if let Some(receipt) = self.lookup_previous(class, key).await {
                    info!(key = %key, class = %class, attempt, "Earlier delivery already executed");
                    Metrics::execution_deduped(class.as_str(), "exchange");
                    return ExecutionOutcome::Success(receipt);
                }
            }

            self.limiter.acquire().await;
            let result = self
                .with_timeout(self.send_once(payload, key))
                .await;

            match result {
                Ok(receipt) => {
                    debug!(key = %key, class = %class, attempt, "Execution succeeded");
                    return ExecutionOutcome::Success(receipt);
                }
                Err(error) if !error.is_retryable() => {
                    return ExecutionOutcome::FatalFailure { error };
                }
                Err(error) if self.policy.can_retry(attempt) => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        key = %key,
                        class = %class,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retryable gateway error, backing off"
                    );
                    Metrics::execution_retry(class.as_str(), error.kind_str());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return ExecutionOutcome::RetryableFailure {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// Ask the gateway whether this key already executed.
    ///
    /// A failed lookup is treated as "not found"; the gateway still
    /// deduplicates the re-sent request by key.
    async fn lookup_previous(
        &self,
        class: OperationClass,
        key: &IdempotencyKey,
    ) -> Option<ExecutionReceipt> {
        if !class.is_mutating() {
            return None;
        }
        self.limiter.acquire().await;
        match self.with_timeout(self.gateway.find_order(key.clone())).await {
            Ok(found) => found,
            Err(error) => {
                warn!(key = %key, error = %error, "Idempotency lookup failed, re-sending with same key");
                None
            }
        }
    }

    async fn send_once(
        &self,
        payload: &Payload,
        key: &IdempotencyKey,
    ) -> GatewayResult<ExecutionReceipt> {
        match payload {
            Payload::PlaceOrder(spec) => {
                let mut spec = spec.clone();
                spec.idempotency_key = key.clone();
                self.gateway
                    .place_order(spec)
                    .await
                    .map(ExecutionReceipt::Filled)
            }
            Payload::CancelOrder { order_id } => {
                self.gateway
                    .cancel_order(order_id.clone(), key.clone())
                    .await?;
                Ok(ExecutionReceipt::Cancelled {
                    order_id: order_id.clone(),
                })
            }
            Payload::AdjustProtection {
                symbol,
                stop_loss,
                take_profit,
            } => {
                self.gateway
                    .amend_protection(symbol.clone(), *stop_loss, *take_profit, key.clone())
                    .await?;
                Ok(ExecutionReceipt::ProtectionAmended {
                    symbol: symbol.clone(),
                    stop_loss: *stop_loss,
                    take_profit: *take_profit,
                })
            }
        }
    }

    /// Bound a gateway call by `call_timeout`; expiry is a retryable timeout.
    async fn with_timeout<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::retryable(
                RetryableKind::Timeout,
                format!("no response within {}ms", self.call_timeout.as_millis()),
            )),
        }
    }

    /// Shared admission + retry path for read-only calls.
    async fn query<T, F, Fut>(&self, priority: Priority, call: F) -> Result<T, QueryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let class = OperationClass::Query;

        let admission = self.breaker.can_proceed(priority, class);
        if !admission.allowed {
            Metrics::execution_outcome(class.as_str(), "blocked");
            return Err(QueryError::Blocked {
                level: admission.level,
            });
        }
        if let Some(wait) = admission.wait_hint {
            tokio::time::sleep(wait).await;
        }

        let mut attempt = 1;
        let result = loop {
            self.limiter.acquire().await;
            match self.with_timeout(call()).await {
                Ok(value) => break Ok(value),
                Err(error) if error.is_retryable() && self.policy.can_retry(attempt) => {
                    let delay = self.policy.delay(attempt);
                    debug!(attempt, error = %error, delay_ms = delay.as_millis() as u64, "Query retry");
                    Metrics::execution_retry(class.as_str(), error.kind_str());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => break Err(error),
            }
        };

        match &result {
            Ok(_) => {
                self.breaker.record_success(class);
                Metrics::execution_outcome(class.as_str(), "success");
            }
            Err(error) => {
                self.breaker.record_failure(class);
                let label = if error.is_retryable() {
                    "retryable_failure"
                } else {
                    "fatal_failure"
                };
                Metrics::execution_outcome(class.as_str(), label);
            }
        }
        result.map_err(QueryError::from)
    }

    fn remember(&self, key: IdempotencyKey, receipt: ExecutionReceipt) {
        if self.completed_cache_size == 0 {
            return;
        }
        if self.completed.len() >= self.completed_cache_size {
            // Entries are not ordered; dropping the whole cache only costs
            // a find_order round trip on a later duplicate.
            self.completed.clear();
        }
        self.completed.insert(key, receipt);
    }

    fn finish(&self, class: OperationClass, outcome: ExecutionOutcome) -> ExecutionOutcome {
        Metrics::execution_outcome(class.as_str(), outcome.as_str());
        outcome
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .field("completed", &self.completed.len())
            .finish_non_exhaustive()
    }
}
