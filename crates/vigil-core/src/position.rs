//! Open leveraged position as reported by the exchange.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decimal::{Price, Size};
use crate::order::OrderSide;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// 1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Side of the order that reduces a position in this direction.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    #[default]
    Open,
    Closing,
    Closed,
}

/// One open leveraged exchange position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Price,
    pub quantity: Size,
    pub leverage: Decimal,
    /// Current stop-loss; zero when none is set.
    pub stop_loss: Price,
    /// Current take-profit; zero when none is set.
    pub take_profit: Price,
    /// Margin committed to this position.
    pub margin_used: Decimal,
    /// When the position was opened. Immutable once recorded.
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub status: PositionStatus,
    /// Latest mark price reported with the snapshot.
    pub mark_price: Price,
    /// PnL already realized by partial closes.
    #[serde(default)]
    pub realized_pnl: Decimal,
}

impl Position {
    /// Stable identifier: symbol plus entry time in milliseconds.
    pub fn position_id(&self) -> String {
        format!("{}@{}", self.symbol, self.entry_time.timestamp_millis())
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open && self.quantity.is_positive()
    }

    /// Unrealized PnL at the snapshot's mark price.
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.mark_price.inner() - self.entry_price.inner())
            * self.quantity.inner()
            * self.direction.sign()
    }

    /// Realized plus unrealized PnL.
    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl()
    }

    /// Margin this snapshot stands to lose between entry and its stop-loss.
    ///
    /// Capped at `margin_used`; falls back to `margin_used` when no stop is set.
    /// Only the first snapshot of a position gives its initial risk: the
    /// stop trails and the quantity shrinks afterwards.
    pub fn risk_at_stop(&self) -> Decimal {
        if self.stop_loss.is_zero() {
            return self.margin_used;
        }
        let stop_loss_risk = self.entry_price.distance(self.stop_loss) * self.quantity.inner();
        if stop_loss_risk.is_zero() {
            return self.margin_used;
        }
        if self.margin_used.is_zero() {
            return stop_loss_risk;
        }
        stop_loss_risk.min(self.margin_used)
    }

    /// Realized-plus-unrealized PnL over `initial_risk` (-0.99 = lost 99% of risk).
    ///
    /// Returns `None` when `initial_risk` is not positive.
    pub fn loss_ratio(&self, initial_risk: Decimal) -> Option<Decimal> {
        if initial_risk <= Decimal::ZERO {
            return None;
        }
        Some(self.total_pnl() / initial_risk)
    }

    /// Return on margin of the unrealized PnL (0.2 = +20%).
    pub fn roe(&self) -> Option<Decimal> {
        if self.margin_used <= Decimal::ZERO {
            return None;
        }
        Some(self.unrealized_pnl() / self.margin_used)
    }
}
