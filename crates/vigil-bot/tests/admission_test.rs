//! Admission control integration tests.
//!
//! The breaker and limiter in front of the paper exchange:
//! - BLOCKED denies ordinary traffic but admits emergency closes
//! - A quiet breaker resets after its timeout
//! - The limiter paces bursts at its refill rate

mod integration;
use integration::common::{coordinator, long_position};

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vigil_admission::{BreakerConfig, CircuitLevel, TokenBucketLimiter};
use vigil_core::{
    IdempotencyKey, OperationClass, OperationRequest, OrderSide, OrderSpec, Price, Priority, Size,
};
use vigil_executor::{ExecutionOutcome, PaperExchange, Payload};

fn global_breaker(warning: u32, throttled: u32, blocked: u32) -> BreakerConfig {
    BreakerConfig {
        per_class: false,
        ..BreakerConfig::with_thresholds(warning, throttled, blocked)
    }
}

fn close_order(key: IdempotencyKey) -> Payload {
    Payload::PlaceOrder(OrderSpec::reduce_only_market(
        "BTCUSDT",
        OrderSide::Sell,
        Size::new(dec!(10)),
        key,
    ))
}

#[tokio::test(start_paused = true)]
async fn test_blocked_breaker_admits_only_emergency_close() {
    let exchange = Arc::new(PaperExchange::new(dec!(10_000)));
    exchange.open_position(long_position("BTCUSDT", dec!(95)));
    let (breaker, coordinator) = coordinator(&exchange, global_breaker(2, 4, 5));

    for _ in 0..5 {
        breaker.record_failure(OperationClass::PlaceOrder);
    }
    assert_eq!(breaker.level(OperationClass::PlaceOrder), CircuitLevel::Blocked);

    let amend = coordinator
        .execute(
            OperationRequest::new(OperationClass::AdjustProtection, Priority::High),
            Payload::AdjustProtection {
                symbol: "BTCUSDT".to_string(),
                stop_loss: Price::new(dec!(96)),
                take_profit: Price::ZERO,
            },
        )
        .await;
    assert_eq!(
        amend,
        ExecutionOutcome::Blocked {
            level: CircuitLevel::Blocked
        }
    );

    let request = OperationRequest::new(OperationClass::ClosePosition, Priority::Critical);
    let key = request.idempotency_key.clone();
    let close = coordinator.execute(request, close_order(key)).await;

    assert!(close.is_success());
    assert!(exchange.position("BTCUSDT").is_none());
    assert_eq!(exchange.executed_orders().len(), 1);
    let bypasses = breaker.bypass_records();
    assert_eq!(bypasses.len(), 1);
    assert_eq!(bypasses[0].operation_class, OperationClass::ClosePosition);
    assert_eq!(bypasses[0].priority, Priority::Critical);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_resets_after_quiet_period() {
    let exchange = Arc::new(PaperExchange::new(dec!(10_000)));
    let (breaker, _) = coordinator(&exchange, global_breaker(2, 4, 5));

    for _ in 0..5 {
        breaker.record_failure(OperationClass::Query);
    }
    assert_eq!(breaker.level(OperationClass::Query), CircuitLevel::Blocked);
    assert!(!breaker.can_proceed(Priority::Normal, OperationClass::Query).allowed);
    assert!(
        breaker
            .can_proceed(Priority::Critical, OperationClass::ClosePosition)
            .allowed
    );

    tokio::time::advance(Duration::from_secs(299)).await;
    assert_eq!(breaker.level(OperationClass::Query), CircuitLevel::Blocked);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(breaker.level(OperationClass::Query), CircuitLevel::Normal);
    assert_eq!(breaker.failure_count(OperationClass::Query), 0);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_request_waits_before_sending() {
    let exchange = Arc::new(PaperExchange::new(dec!(10_000)));
    let (breaker, coordinator) = coordinator(&exchange, global_breaker(2, 4, 5));
    for _ in 0..4 {
        breaker.record_failure(OperationClass::Query);
    }

    let started = Instant::now();
    let positions = coordinator.get_positions(Priority::Normal).await.unwrap();

    assert!(positions.is_empty());
    assert!(started.elapsed() >= breaker.config().throttle_delay());
}

#[tokio::test(start_paused = true)]
async fn test_limiter_paces_at_refill_rate() {
    let limiter = TokenBucketLimiter::new(1, 4.0).unwrap();

    let started = Instant::now();
    limiter.acquire().await;
    assert!(started.elapsed() < Duration::from_millis(1));

    limiter.acquire().await;
    assert!(started.elapsed() >= Duration::from_millis(250));

    limiter.acquire().await;
    assert!(started.elapsed() >= Duration::from_millis(500));
}
