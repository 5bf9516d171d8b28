use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Symbol, TimeFrame};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub timeframe: TimeFrame,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn change_pct(&self) -> Decimal {
        if self.open.is_zero() {
            return Decimal::ZERO;
        }
        ((self.close - self.open) / self.open) * Decimal::from(100)
    }

    /// Upper shadow as a percentage of close. Large upper shadows on recent
    /// hourly candles veto breakout entries.
    pub fn upper_shadow_pct(&self) -> Decimal {
        if self.close.is_zero() {
            return Decimal::ZERO;
        }
        ((self.high - self.close.max(self.open)) / self.close) * Decimal::from(100)
    }

    pub fn lower_shadow_pct(&self) -> Decimal {
        if self.close.is_zero() {
            return Decimal::ZERO;
        }
        ((self.close.min(self.open) - self.low) / self.close) * Decimal::from(100)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandleBuffer {
    pub candles: Vec<Candle>,
    pub max_size: usize,
}

impl CandleBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            candles: Vec::with_capacity(max_size),
            max_size,
        }
    }

    pub fn from_candles(candles: Vec<Candle>) -> Self {
        let max_size = candles.len().max(1);
        Self { candles, max_size }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() >= self.max_size {
            self.candles.remove(0);
        }
        self.candles.push(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn last_n(&self, n: usize) -> &[Candle] {
        let len = self.candles.len();
        if n >= len {
            &self.candles[..]
        } else {
            &self.candles[len - n..]
        }
    }

    pub fn highest_high(&self, n: usize) -> Option<Decimal> {
        self.last_n(n).iter().map(|c| c.high).max()
    }

    pub fn lowest_low(&self, n: usize) -> Option<Decimal> {
        self.last_n(n).iter().map(|c| c.low).min()
    }

    pub fn bullish_count(&self, n: usize) -> usize {
        self.last_n(n).iter().filter(|c| c.is_bullish()).count()
    }

    pub fn bearish_count(&self, n: usize) -> usize {
        self.last_n(n).iter().filter(|c| c.is_bearish()).count()
    }
}

/// One symbol's candles across all analysis timeframes, captured together at
/// scan time so the scorer sees a coherent view.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub m5: CandleBuffer,
    pub m15: CandleBuffer,
    pub h1: CandleBuffer,
    pub d1: CandleBuffer,
    pub funding_rate: Option<Decimal>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn buffer(&self, tf: TimeFrame) -> &CandleBuffer {
        match tf {
            TimeFrame::M5 => &self.m5,
            TimeFrame::M15 => &self.m15,
            TimeFrame::H1 => &self.h1,
            TimeFrame::D1 => &self.d1,
        }
    }

    /// Timeframes whose latest candle is older than one bucket plus grace.
    pub fn stale_timeframes(&self, now: DateTime<Utc>) -> Vec<TimeFrame> {
        TimeFrame::all()
            .into_iter()
            .filter(|tf| {
                match self.buffer(*tf).last() {
                    Some(c) => now - c.open_time > tf.bucket() + tf.freshness_grace(),
                    None => true,
                }
            })
            .collect()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.stale_timeframes(now).is_empty()
    }
}
