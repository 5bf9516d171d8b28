use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::component::ComponentMap;
use super::{CloseReason, MarginMode, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Building,
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Building => "building",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(PositionStatus::Building),
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, PositionStatus::Building | PositionStatus::Open)
    }
}

/// One executed entry batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFill {
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_at: DateTime<Utc>,
    pub forced: bool,
}

/// The central stateful entity. Created by the entry executor, mutated by
/// the entry executor and the exit monitor only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub account_id: i64,
    pub margin_mode: MarginMode,
    pub symbol: Symbol,
    pub side: Side,
    pub status: PositionStatus,
    pub signal_version: i64,
    pub entry_score: i32,
    pub components: ComponentMap,
    pub batch_plan: Vec<Decimal>,
    pub batch_filled: Vec<BatchFill>,
    pub entry_price: Option<Decimal>,
    pub avg_entry_price: Decimal,
    pub quantity: Decimal,
    pub margin: Decimal,
    pub leverage: u32,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub entry_signal_time: DateTime<Utc>,
    pub planned_close_time: Option<DateTime<Utc>>,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub max_profit_pct: Decimal,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new_building(
        account_id: i64,
        margin_mode: MarginMode,
        symbol: Symbol,
        side: Side,
        signal_version: i64,
        entry_score: i32,
        components: ComponentMap,
        batch_plan: Vec<Decimal>,
        leverage: u32,
        entry_signal_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id,
            margin_mode,
            symbol,
            side,
            status: PositionStatus::Building,
            signal_version,
            entry_score,
            components,
            batch_plan,
            batch_filled: Vec::new(),
            entry_price: None,
            avg_entry_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            margin: Decimal::ZERO,
            leverage,
            stop_loss_price: None,
            take_profit_price: None,
            entry_signal_time,
            planned_close_time: None,
            open_time: None,
            close_time: None,
            close_price: None,
            close_reason: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            max_profit_pct: Decimal::ZERO,
        }
    }

    /// Record a fill: extend `batch_filled`, grow quantity and margin, and
    /// refresh the size-weighted average entry.
    pub fn apply_fill(&mut self, fill: BatchFill) {
        if self.entry_price.is_none() {
            self.entry_price = Some(fill.price);
        }
        let filled_value: Decimal = self
            .batch_filled
            .iter()
            .map(|f| f.price * f.quantity)
            .sum::<Decimal>()
            + fill.price * fill.quantity;
        self.quantity += fill.quantity;
        self.margin += self.margin_mode.margin(fill.quantity, fill.price, self.leverage);
        self.batch_filled.push(fill);
        if !self.quantity.is_zero() {
            self.avg_entry_price = filled_value / self.quantity;
        }
    }

    pub fn mark_open(&mut self, at: DateTime<Utc>) {
        self.status = PositionStatus::Open;
        self.open_time = Some(at);
    }

    /// Signed price-move percentage relative to the average entry. This is
    /// the quantity all exit thresholds are expressed in, for both margin
    /// modes.
    pub fn price_move_pct(&self, price: Decimal) -> Decimal {
        if self.avg_entry_price.is_zero() {
            return Decimal::ZERO;
        }
        ((price - self.avg_entry_price) / self.avg_entry_price) * Decimal::from(100) * self.side.sign()
    }

    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.margin_mode.pnl(self.side, self.avg_entry_price, price, self.quantity)
    }

    /// Per-tick bookkeeping: unrealized pnl plus the monotonic profit peak.
    pub fn update_tick(&mut self, price: Decimal) {
        self.unrealized_pnl = self.pnl_at(price);
        let pct = self.price_move_pct(price);
        if pct > self.max_profit_pct {
            self.max_profit_pct = pct;
        }
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        let from = self.open_time.unwrap_or(self.entry_signal_time);
        (now - from).num_minutes()
    }

    /// Planned holding duration in minutes, if a planned close is set.
    pub fn planned_duration_minutes(&self) -> Option<i64> {
        self.planned_close_time
            .map(|t| (t - self.entry_signal_time).num_minutes())
    }

    pub fn close(&mut self, price: Decimal, reason: CloseReason, fees: Decimal, at: DateTime<Utc>) {
        self.realized_pnl = self.pnl_at(price) - fees;
        self.unrealized_pnl = Decimal::ZERO;
        self.status = PositionStatus::Closed;
        self.close_time = Some(at);
        self.close_price = Some(price);
        self.close_reason = Some(reason);
    }

    /// Protective prices must sit on the expected side of the entry.
    pub fn protective_prices_valid(&self) -> bool {
        let (Some(sl), Some(tp)) = (self.stop_loss_price, self.take_profit_price) else {
            return false;
        };
        match self.side {
            Side::Long => sl < self.avg_entry_price && tp > self.avg_entry_price,
            Side::Short => sl > self.avg_entry_price && tp < self.avg_entry_price,
        }
    }
}
