use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::component::{signal_pattern, ComponentMap};
use super::{Side, Symbol};

/// Volatility classification from the 24h range, used to widen or tighten
/// stop-loss / take-profit distances at (re)computation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolatilityProfile {
    Low,
    Medium,
    High,
}

impl VolatilityProfile {
    /// Range pct thresholds: < 2% low, < 5% medium, else high.
    pub fn from_range_pct(range_pct: Decimal) -> Self {
        if range_pct < Decimal::from(2) {
            VolatilityProfile::Low
        } else if range_pct < Decimal::from(5) {
            VolatilityProfile::Medium
        } else {
            VolatilityProfile::High
        }
    }

    /// Multiplier applied to SL/TP percentage distances.
    pub fn risk_multiplier(&self) -> Decimal {
        match self {
            VolatilityProfile::Low => Decimal::new(8, 1),    // 0.8
            VolatilityProfile::Medium => Decimal::ONE,
            VolatilityProfile::High => Decimal::new(13, 1),  // 1.3
        }
    }
}

/// The scorer's verdict for one symbol at one instant. Ephemeral: consumed
/// by admission and the entry executor, never persisted as-is.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: Symbol,
    pub side: Side,
    pub score: i32,
    pub components: ComponentMap,
    pub current_price: Decimal,
    pub funding_rate: Option<Decimal>,
    pub volatility: VolatilityProfile,
    pub signal_time: DateTime<Utc>,
}

impl Opportunity {
    pub fn signal_pattern(&self) -> String {
        signal_pattern(&self.components)
    }
}
