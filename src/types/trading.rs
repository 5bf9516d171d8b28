#![allow(dead_code)]
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market identifier, e.g. `BTC/USDT` (linear) or `BTC/USD` (inverse).
/// The universe is configured at startup; symbols are never invented at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base_asset(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn quote_asset(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or("")
    }

    /// Exchange wire form without the separator, e.g. `BTCUSDT`.
    pub fn exchange_code(&self) -> String {
        self.0.replace('/', "")
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol(s.to_string())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// +1 for long, -1 for short; used in pnl arithmetic.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LONG" => Some(Side::Long),
            "SHORT" => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M5,
    M15,
    H1,
    D1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::H1 => "1h",
            TimeFrame::D1 => "1d",
        }
    }

    pub fn to_minutes(&self) -> i64 {
        match self {
            TimeFrame::M5 => 5,
            TimeFrame::M15 => 15,
            TimeFrame::H1 => 60,
            TimeFrame::D1 => 1440,
        }
    }

    pub fn bucket(&self) -> Duration {
        Duration::minutes(self.to_minutes())
    }

    /// Grace added on top of one bucket before a feed counts as stale.
    pub fn freshness_grace(&self) -> Duration {
        match self {
            TimeFrame::M5 | TimeFrame::M15 => Duration::seconds(30),
            TimeFrame::H1 | TimeFrame::D1 => Duration::minutes(2),
        }
    }

    pub fn all() -> [TimeFrame; 4] {
        [TimeFrame::M5, TimeFrame::M15, TimeFrame::H1, TimeFrame::D1]
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Quantity/notional accounting mode of an account. Linear accounts trade
/// USDT-margined contracts (quantity in base asset); inverse accounts trade
/// coin-margined contracts (quantity in contracts, margin and pnl in coin).
/// All pnl conditionals live here so Scorer/Entry/Exit stay branch-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Linear,
    Inverse,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Linear => "linear",
            MarginMode::Inverse => "inverse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linear" => Some(MarginMode::Linear),
            "inverse" => Some(MarginMode::Inverse),
            _ => None,
        }
    }

    /// Realized/unrealized pnl before fees.
    pub fn pnl(&self, side: Side, avg_entry: Decimal, price: Decimal, quantity: Decimal) -> Decimal {
        match self {
            MarginMode::Linear => (price - avg_entry) * quantity * side.sign(),
            MarginMode::Inverse => {
                if avg_entry.is_zero() || price.is_zero() {
                    return Decimal::ZERO;
                }
                quantity * (Decimal::ONE / avg_entry - Decimal::ONE / price) * side.sign()
            }
        }
    }

    /// Quantity for one batch given the configured position size.
    /// Linear: `position_size` is notional in USDT; inverse: contract count.
    pub fn quantity_for_size(&self, position_size: Decimal, price: Decimal) -> Decimal {
        match self {
            MarginMode::Linear => {
                if price.is_zero() {
                    Decimal::ZERO
                } else {
                    position_size / price
                }
            }
            MarginMode::Inverse => position_size,
        }
    }

    /// Initial margin locked by a fill.
    pub fn margin(&self, quantity: Decimal, price: Decimal, leverage: u32) -> Decimal {
        let lev = Decimal::from(leverage.max(1));
        match self {
            MarginMode::Linear => quantity * price / lev,
            MarginMode::Inverse => {
                if price.is_zero() {
                    Decimal::ZERO
                } else {
                    quantity / (price * lev)
                }
            }
        }
    }
}

impl fmt::Display for MarginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a position was closed. Persisted verbatim and surfaced in
/// notifications and optimizer aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TrailingHighProfit,
    TrailingMidProfit,
    QuickProfit,
    StagedTimeout1h,
    StagedTimeout2h,
    StagedTimeout3h,
    StagedTimeout4h,
    BreakEven,
    PlannedCloseTimeout,
    EntryFailed,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TrailingHighProfit => "trailing_high_profit",
            CloseReason::TrailingMidProfit => "trailing_mid_profit",
            CloseReason::QuickProfit => "quick_profit",
            CloseReason::StagedTimeout1h => "staged_timeout_1h",
            CloseReason::StagedTimeout2h => "staged_timeout_2h",
            CloseReason::StagedTimeout3h => "staged_timeout_3h",
            CloseReason::StagedTimeout4h => "staged_timeout_4h",
            CloseReason::BreakEven => "break_even",
            CloseReason::PlannedCloseTimeout => "planned_close_timeout",
            CloseReason::EntryFailed => "entry_failed",
            CloseReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "take_profit" => Some(CloseReason::TakeProfit),
            "stop_loss" => Some(CloseReason::StopLoss),
            "trailing_high_profit" => Some(CloseReason::TrailingHighProfit),
            "trailing_mid_profit" => Some(CloseReason::TrailingMidProfit),
            "quick_profit" => Some(CloseReason::QuickProfit),
            "staged_timeout_1h" => Some(CloseReason::StagedTimeout1h),
            "staged_timeout_2h" => Some(CloseReason::StagedTimeout2h),
            "staged_timeout_3h" => Some(CloseReason::StagedTimeout3h),
            "staged_timeout_4h" => Some(CloseReason::StagedTimeout4h),
            "break_even" => Some(CloseReason::BreakEven),
            "planned_close_timeout" => Some(CloseReason::PlannedCloseTimeout),
            "entry_failed" => Some(CloseReason::EntryFailed),
            "manual" => Some(CloseReason::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
