//! Order request/result and account types exchanged with the gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decimal::{Price, Size};
use crate::operation::IdempotencyKey;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order to be submitted to the exchange.
///
/// CRITICAL: the idempotency key travels with the order so that a retry
/// of a request that already executed server-side is recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Size,
    /// Limit price; `None` for a market order.
    pub limit_price: Option<Price>,
    pub reduce_only: bool,
    pub idempotency_key: IdempotencyKey,
}

impl OrderSpec {
    /// Reduce-only market order.
    pub fn reduce_only_market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Size,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            limit_price: None,
            reduce_only: true,
            idempotency_key,
        }
    }
}

/// Fill result returned by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult {
    /// Exchange-assigned order id.
    pub order_id: String,
    pub idempotency_key: IdempotencyKey,
    pub filled_quantity: Size,
    pub average_price: Price,
    /// PnL realized by this fill (zero for opening orders).
    pub realized_pnl: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Account balance snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Total account equity including unrealized PnL.
    pub equity: Decimal,
    /// Balance free for new margin.
    pub available: Decimal,
    /// Margin currently committed to open positions.
    pub margin_used: Decimal,
}

impl Balance {
    /// Fraction of equity committed as margin. `None` when equity is not positive.
    pub fn margin_ratio(&self) -> Option<Decimal> {
        if self.equity <= Decimal::ZERO {
            return None;
        }
        Some(self.margin_used / self.equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reduce_only_market_order() {
        let key = IdempotencyKey::new();
        let spec =
            OrderSpec::reduce_only_market("ETHUSDT", OrderSide::Sell, Size::new(dec!(2)), key.clone());
        assert!(spec.reduce_only);
        assert!(spec.limit_price.is_none());
        assert_eq!(spec.idempotency_key, key);
    }

    #[test]
    fn test_balance_margin_ratio() {
        let balance = Balance {
            equity: dec!(1000),
            available: dec!(200),
            margin_used: dec!(800),
        };
        assert_eq!(balance.margin_ratio(), Some(dec!(0.8)));

        let broke = Balance {
            equity: Decimal::ZERO,
            available: Decimal::ZERO,
            margin_used: dec!(10),
        };
        assert_eq!(broke.margin_ratio(), None);
    }
}
