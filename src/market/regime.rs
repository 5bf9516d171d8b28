use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::Database;
use crate::market::MarketDataReader;
use crate::types::{Side, Symbol};

/// Majors used to classify the overall market.
const MAJORS: [&str; 5] = ["BTC/USDT", "ETH/USDT", "SOL/USDT", "BNB/USDT", "DOGE/USDT"];

const COMPUTE_INTERVAL_SECS: u64 = 300;
/// Persist every Nth computation (hourly at the 5-minute cadence).
const PERSIST_EVERY: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Bull,
    Bear,
    Neutral,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "bull",
            Regime::Bear => "bear",
            Regime::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bull" => Some(Regime::Bull),
            "bear" => Some(Regime::Bear),
            "neutral" => Some(Regime::Neutral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeBias {
    Long,
    Short,
    Balanced,
}

impl RegimeBias {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeBias::Long => "long",
            RegimeBias::Short => "short",
            RegimeBias::Balanced => "balanced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(RegimeBias::Long),
            "short" => Some(RegimeBias::Short),
            "balanced" => Some(RegimeBias::Balanced),
            _ => None,
        }
    }

    pub fn aligns_with(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (RegimeBias::Long, Side::Long) | (RegimeBias::Short, Side::Short)
        )
    }
}

/// Macro market classification derived from the majors every five minutes.
/// Consumed through the config snapshot to bias acceptance thresholds and
/// position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub captured_at: DateTime<Utc>,
    pub regime: Regime,
    pub strength: u8,
    pub bias: RegimeBias,
    pub position_adjustment_multiplier: Decimal,
    pub score_threshold_adjustment: i32,
}

impl RegimeSnapshot {
    pub fn neutral(at: DateTime<Utc>) -> Self {
        Self {
            captured_at: at,
            regime: Regime::Neutral,
            strength: 0,
            bias: RegimeBias::Balanced,
            position_adjustment_multiplier: Decimal::ONE,
            score_threshold_adjustment: 0,
        }
    }

    /// Threshold delta for one side: the aligned side gets the adjustment,
    /// the counter side gets its negation, balanced regimes change nothing.
    pub fn threshold_adjustment_for(&self, side: Side) -> i32 {
        match self.bias {
            RegimeBias::Balanced => 0,
            _ if self.bias.aligns_with(side) => self.score_threshold_adjustment,
            _ => -self.score_threshold_adjustment,
        }
    }

    /// Size multiplier for one side; only aligned entries are scaled.
    pub fn size_multiplier_for(&self, side: Side) -> Decimal {
        if self.bias.aligns_with(side) {
            self.position_adjustment_multiplier
        } else {
            Decimal::ONE
        }
    }
}

/// Classify from the average 24h change across the majors.
pub fn classify(avg_change_pct: Decimal, at: DateTime<Utc>) -> RegimeSnapshot {
    use rust_decimal::prelude::ToPrimitive;
    let strength = (avg_change_pct.abs() * dec!(20))
        .min(dec!(100))
        .trunc()
        .to_u8()
        .unwrap_or(0);

    let (regime, bias) = if avg_change_pct >= dec!(1.0) {
        (Regime::Bull, RegimeBias::Long)
    } else if avg_change_pct <= dec!(-1.0) {
        (Regime::Bear, RegimeBias::Short)
    } else {
        (Regime::Neutral, RegimeBias::Balanced)
    };

    let (multiplier, threshold_adj) = match regime {
        Regime::Neutral => (Decimal::ONE, 0),
        // Strong regimes loosen the aligned threshold and scale size up.
        _ if strength >= 50 => (dec!(1.2), -5),
        _ => (dec!(1.1), -3),
    };

    RegimeSnapshot {
        captured_at: at,
        regime,
        strength,
        bias,
        position_adjustment_multiplier: multiplier,
        score_threshold_adjustment: threshold_adj,
    }
}

/// Background task recomputing the regime every five minutes and persisting
/// it hourly. The config store picks the persisted row up on its next
/// refresh.
pub struct RegimeTracker {
    reader: Arc<MarketDataReader>,
    db: Arc<Database>,
}

impl RegimeTracker {
    pub fn new(reader: Arc<MarketDataReader>, db: Arc<Database>) -> Self {
        Self { reader, db }
    }

    pub async fn compute_once(&self, now: DateTime<Utc>) -> Result<RegimeSnapshot> {
        let mut changes = Vec::new();
        for major in MAJORS {
            let symbol = Symbol::from(major);
            match self.reader.daily_change_pct(&symbol).await {
                Ok(change) => changes.push(change),
                Err(e) => warn!("Regime: no 24h change for {}: {}", major, e),
            }
        }

        if changes.is_empty() {
            return Ok(RegimeSnapshot::neutral(now));
        }

        let avg = changes.iter().sum::<Decimal>() / Decimal::from(changes.len() as i64);
        Ok(classify(avg, now))
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(COMPUTE_INTERVAL_SECS));
        let mut cycles = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("Regime tracker shutting down");
                    return;
                }
            }

            let now = Utc::now();
            match self.compute_once(now).await {
                Ok(snapshot) => {
                    cycles += 1;
                    if cycles % PERSIST_EVERY == 1 {
                        if let Err(e) = self.db.insert_regime(&snapshot).await {
                            warn!("Failed to persist market regime: {}", e);
                        } else {
                            info!(
                                "Market regime: {} strength={} bias={}",
                                snapshot.regime.as_str(),
                                snapshot.strength,
                                snapshot.bias.as_str()
                            );
                        }
                    }
                }
                Err(e) => warn!("Regime computation failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_bull_bear_neutral() {
        let now = Utc::now();
        assert_eq!(classify(dec!(2.5), now).regime, Regime::Bull);
        assert_eq!(classify(dec!(-1.8), now).regime, Regime::Bear);
        assert_eq!(classify(dec!(0.4), now).regime, Regime::Neutral);
    }

    #[test]
    fn strength_scales_with_change() {
        let now = Utc::now();
        assert_eq!(classify(dec!(2.5), now).strength, 50);
        assert_eq!(classify(dec!(10), now).strength, 100);
        assert_eq!(classify(dec!(0.1), now).strength, 2);
    }

    #[test]
    fn threshold_adjustment_flips_for_counter_side() {
        let snap = classify(dec!(3), Utc::now());
        assert_eq!(snap.bias, RegimeBias::Long);
        assert_eq!(snap.threshold_adjustment_for(Side::Long), -5);
        assert_eq!(snap.threshold_adjustment_for(Side::Short), 5);
    }

    #[test]
    fn neutral_regime_is_inert() {
        let snap = RegimeSnapshot::neutral(Utc::now());
        assert_eq!(snap.threshold_adjustment_for(Side::Long), 0);
        assert_eq!(snap.size_multiplier_for(Side::Short), Decimal::ONE);
    }

    #[test]
    fn size_multiplier_only_for_aligned_side() {
        let snap = classify(dec!(3), Utc::now());
        assert_eq!(snap.size_multiplier_for(Side::Long), dec!(1.2));
        assert_eq!(snap.size_multiplier_for(Side::Short), Decimal::ONE);
    }
}
