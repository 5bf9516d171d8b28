use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::Side;

/// Direction bias of a scoring component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    pub fn matches(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Bias::Bullish, Side::Long) | (Bias::Bearish, Side::Short) | (Bias::Neutral, _)
        )
    }

    pub fn conflicts(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (Bias::Bullish, Side::Short) | (Bias::Bearish, Side::Long)
        )
    }
}

/// The closed catalog of scoring components. Weights are configured per
/// component; the set itself never grows at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComponentId {
    #[serde(rename = "position_low")]
    PositionLow,
    #[serde(rename = "position_mid")]
    PositionMid,
    #[serde(rename = "position_high")]
    PositionHigh,
    #[serde(rename = "breakout_long")]
    BreakoutLong,
    #[serde(rename = "breakdown_short")]
    BreakdownShort,
    #[serde(rename = "volume_power_bull")]
    VolumePowerBull,
    #[serde(rename = "volume_power_bear")]
    VolumePowerBear,
    #[serde(rename = "volume_power_1h_bull")]
    VolumePower1hBull,
    #[serde(rename = "volume_power_1h_bear")]
    VolumePower1hBear,
    #[serde(rename = "trend_1h_bull")]
    Trend1hBull,
    #[serde(rename = "trend_1h_bear")]
    Trend1hBear,
    #[serde(rename = "trend_1d_bull")]
    Trend1dBull,
    #[serde(rename = "trend_1d_bear")]
    Trend1dBear,
    #[serde(rename = "momentum_down_3pct")]
    MomentumDown3Pct,
    #[serde(rename = "momentum_up_3pct")]
    MomentumUp3Pct,
    #[serde(rename = "consecutive_bull")]
    ConsecutiveBull,
    #[serde(rename = "consecutive_bear")]
    ConsecutiveBear,
    #[serde(rename = "volatility_high")]
    VolatilityHigh,
}

impl ComponentId {
    pub fn name(&self) -> &'static str {
        match self {
            ComponentId::PositionLow => "position_low",
            ComponentId::PositionMid => "position_mid",
            ComponentId::PositionHigh => "position_high",
            ComponentId::BreakoutLong => "breakout_long",
            ComponentId::BreakdownShort => "breakdown_short",
            ComponentId::VolumePowerBull => "volume_power_bull",
            ComponentId::VolumePowerBear => "volume_power_bear",
            ComponentId::VolumePower1hBull => "volume_power_1h_bull",
            ComponentId::VolumePower1hBear => "volume_power_1h_bear",
            ComponentId::Trend1hBull => "trend_1h_bull",
            ComponentId::Trend1hBear => "trend_1h_bear",
            ComponentId::Trend1dBull => "trend_1d_bull",
            ComponentId::Trend1dBear => "trend_1d_bear",
            ComponentId::MomentumDown3Pct => "momentum_down_3pct",
            ComponentId::MomentumUp3Pct => "momentum_up_3pct",
            ComponentId::ConsecutiveBull => "consecutive_bull",
            ComponentId::ConsecutiveBear => "consecutive_bear",
            ComponentId::VolatilityHigh => "volatility_high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|c| c.name() == s)
    }

    pub fn bias(&self) -> Bias {
        match self {
            ComponentId::PositionLow
            | ComponentId::BreakoutLong
            | ComponentId::VolumePowerBull
            | ComponentId::VolumePower1hBull
            | ComponentId::Trend1hBull
            | ComponentId::Trend1dBull
            | ComponentId::MomentumDown3Pct
            | ComponentId::ConsecutiveBull => Bias::Bullish,

            ComponentId::PositionHigh
            | ComponentId::BreakdownShort
            | ComponentId::VolumePowerBear
            | ComponentId::VolumePower1hBear
            | ComponentId::Trend1hBear
            | ComponentId::Trend1dBear
            | ComponentId::MomentumUp3Pct
            | ComponentId::ConsecutiveBear => Bias::Bearish,

            ComponentId::PositionMid | ComponentId::VolatilityHigh => Bias::Neutral,
        }
    }

    pub fn all() -> [ComponentId; 18] {
        [
            ComponentId::PositionLow,
            ComponentId::PositionMid,
            ComponentId::PositionHigh,
            ComponentId::BreakoutLong,
            ComponentId::BreakdownShort,
            ComponentId::VolumePowerBull,
            ComponentId::VolumePowerBear,
            ComponentId::VolumePower1hBull,
            ComponentId::VolumePower1hBear,
            ComponentId::Trend1hBull,
            ComponentId::Trend1hBear,
            ComponentId::Trend1dBull,
            ComponentId::Trend1dBear,
            ComponentId::MomentumDown3Pct,
            ComponentId::MomentumUp3Pct,
            ComponentId::ConsecutiveBull,
            ComponentId::ConsecutiveBear,
            ComponentId::VolatilityHigh,
        ]
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Component name → contributed weight, as carried on an opportunity or a
/// persisted position.
pub type ComponentMap = BTreeMap<ComponentId, i32>;

/// Canonical form used by the signal blacklist: sorted component names
/// joined with `+`. Matching against the blacklist is set-equality, so the
/// pattern of `{b, a}` and `{a, b}` is identical.
pub fn signal_pattern(components: &ComponentMap) -> String {
    let mut names: Vec<&str> = components.keys().map(|c| c.name()).collect();
    names.sort_unstable();
    names.join("+")
}

pub fn components_to_json(components: &ComponentMap) -> String {
    serde_json::to_string(components).unwrap_or_else(|_| "{}".to_string())
}

pub fn components_from_json(json: &str) -> ComponentMap {
    serde_json::from_str(json).unwrap_or_default()
}
