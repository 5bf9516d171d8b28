use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::store::ConfigSnapshot;
use crate::types::{
    Bias, CandleBuffer, ComponentId, ComponentMap, MarketSnapshot, Opportunity, Side,
    VolatilityProfile,
};

/// Revision of the scoring algorithm. Stamped onto positions; the
/// same-version duplicate gate keys on it so re-tuned signals may re-enter.
pub const SIGNAL_VERSION: i64 = 3;

/// Minimum hourly history before a symbol is scoreable at all.
const MIN_H1_CANDLES: usize = 24;

const POSITION_LOOKBACK_H1: usize = 72;
const TREND_LOOKBACK_H1: usize = 48;
const TREND_LOOKBACK_D1: usize = 30;
const CONSECUTIVE_LOOKBACK_H1: usize = 10;
const VOLUME_LOOKBACK: usize = 3;
const SWING_LOOKBACK_M15: usize = 20;

/// Score gap under which the volatility component still considers the race
/// undecided.
const VOLATILITY_MAX_GAP: i32 = 10;

/// Evaluate one symbol. Pure: identical candles + config snapshot yield an
/// identical verdict. Returns None when no side clears the acceptance bar.
pub fn evaluate(snapshot: &MarketSnapshot, price: Decimal, cfg: &ConfigSnapshot) -> Option<Opportunity> {
    if snapshot.h1.len() < MIN_H1_CANDLES || price <= Decimal::ZERO {
        return None;
    }

    let mut tally = Tally::default();

    // 1. Position percentile over the last 72 hourly candles.
    let pos = position_percentile(&snapshot.h1, price);
    if let Some(pos) = pos {
        if pos < dec!(0.30) {
            tally.add_biased(ComponentId::PositionLow, cfg);
        } else if pos > dec!(0.70) {
            tally.add_biased(ComponentId::PositionHigh, cfg);
        } else {
            // Neutral; ties go to long since nothing has scored yet.
            tally.add_neutral(ComponentId::PositionMid, cfg, true);
        }
    }

    // 2. 24h momentum (mean-reversion bias: a drop scores long).
    if let Some(change) = momentum_24h(snapshot) {
        if change <= dec!(-3) {
            tally.add_biased(ComponentId::MomentumDown3Pct, cfg);
        } else if change >= dec!(3) {
            tally.add_biased(ComponentId::MomentumUp3Pct, cfg);
        }
    }

    // 3. 1h trend share.
    match trend_1h(&snapshot.h1) {
        Some(Side::Long) => tally.add_biased(ComponentId::Trend1hBull, cfg),
        Some(Side::Short) => tally.add_biased(ComponentId::Trend1hBear, cfg),
        None => {}
    }

    // 4. 1d trend, symmetric 50% rule.
    match trend_1d(&snapshot.d1) {
        Some(Side::Long) => tally.add_biased(ComponentId::Trend1dBull, cfg),
        Some(Side::Short) => tally.add_biased(ComponentId::Trend1dBear, cfg),
        None => {}
    }

    // 5. Consecutive same-direction hourly candles with a moderate move.
    match consecutive_trend(&snapshot.h1) {
        Some(Side::Long) => tally.add_biased(ComponentId::ConsecutiveBull, cfg),
        Some(Side::Short) => tally.add_biased(ComponentId::ConsecutiveBear, cfg),
        None => {}
    }

    // 6. Volume power on 1h.
    let h1_power = volume_power(&snapshot.h1);
    match h1_power {
        Some(Side::Long) => tally.add_biased(ComponentId::VolumePower1hBull, cfg),
        Some(Side::Short) => tally.add_biased(ComponentId::VolumePower1hBear, cfg),
        None => {}
    }

    // 7. Dual-timeframe volume power: 15m and 1h agreeing.
    match (volume_power(&snapshot.m15), h1_power) {
        (Some(Side::Long), Some(Side::Long)) => tally.add_biased(ComponentId::VolumePowerBull, cfg),
        (Some(Side::Short), Some(Side::Short)) => tally.add_biased(ComponentId::VolumePowerBear, cfg),
        _ => {}
    }

    // 8. Volatility, credited to the leader only while the race is close.
    let range_pct = range_pct_24h(&snapshot.h1).unwrap_or(Decimal::ZERO);
    if range_pct > dec!(5) && (tally.score_long - tally.score_short).abs() <= VOLATILITY_MAX_GAP {
        tally.add_neutral(ComponentId::VolatilityHigh, cfg, false);
    }

    // 9. Breakout / breakdown with anti-FOMO confluence.
    if let Some(pos) = pos {
        if breakout_long_fires(snapshot, pos) {
            tally.add_biased(ComponentId::BreakoutLong, cfg);
        }
        if breakdown_short_fires(snapshot, pos) {
            tally.add_biased(ComponentId::BreakdownShort, cfg);
        }
    }

    let (side, score) = tally.verdict()?;

    let components = clean_components(&tally.components, side);
    if components.is_empty() {
        debug!("{}: component cleaning emptied the set, dropping", snapshot.symbol);
        return None;
    }

    if !acceptance(score, &components, cfg.acceptance_threshold(side)) {
        return None;
    }

    Some(Opportunity {
        symbol: snapshot.symbol.clone(),
        side,
        score,
        components,
        current_price: price,
        funding_rate: snapshot.funding_rate,
        volatility: VolatilityProfile::from_range_pct(range_pct),
        signal_time: snapshot.fetched_at,
    })
}

/// Running score with the order-sensitive neutral crediting.
#[derive(Debug, Default)]
struct Tally {
    score_long: i32,
    score_short: i32,
    components: ComponentMap,
}

impl Tally {
    fn add_biased(&mut self, component: ComponentId, cfg: &ConfigSnapshot) {
        match component.bias() {
            Bias::Bullish => {
                let w = cfg.weight(component, Side::Long);
                self.score_long += w;
                self.components.insert(component, w);
            }
            Bias::Bearish => {
                let w = cfg.weight(component, Side::Short);
                self.score_short += w;
                self.components.insert(component, w);
            }
            Bias::Neutral => unreachable!("neutral components go through add_neutral"),
        }
    }

    /// Credit a neutral component to the side currently leading.
    /// `tie_to_long` decides the dead-heat behavior: position_mid defaults
    /// long, volatility_high is skipped entirely.
    fn add_neutral(&mut self, component: ComponentId, cfg: &ConfigSnapshot, tie_to_long: bool) {
        let side = if self.score_long > self.score_short {
            Side::Long
        } else if self.score_short > self.score_long {
            Side::Short
        } else if tie_to_long {
            Side::Long
        } else {
            return;
        };
        let w = cfg.weight(component, side);
        match side {
            Side::Long => self.score_long += w,
            Side::Short => self.score_short += w,
        }
        self.components.insert(component, w);
    }

    /// Chosen side and its score. Score ties break to the side with more
    /// matching-bias components; a full tie yields nothing.
    fn verdict(&self) -> Option<(Side, i32)> {
        if self.score_long == 0 && self.score_short == 0 {
            return None;
        }
        if self.score_long > self.score_short {
            return Some((Side::Long, self.score_long));
        }
        if self.score_short > self.score_long {
            return Some((Side::Short, self.score_short));
        }
        let bulls = self.components.keys().filter(|c| c.bias() == Bias::Bullish).count();
        let bears = self.components.keys().filter(|c| c.bias() == Bias::Bearish).count();
        match bulls.cmp(&bears) {
            std::cmp::Ordering::Greater => Some((Side::Long, self.score_long)),
            std::cmp::Ordering::Less => Some((Side::Short, self.score_short)),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Keep only components whose bias matches the chosen side, plus neutrals.
/// Mandatory before emit: downstream consumers assume direction consistency.
pub fn clean_components(components: &ComponentMap, side: Side) -> ComponentMap {
    components
        .iter()
        .filter(|(c, _)| c.bias().matches(side))
        .map(|(c, w)| (*c, *w))
        .collect()
}

/// The acceptance gate: threshold plus the minimum-component rule.
/// `position_mid` alone is too weak an anchor, so it raises the floor to 3.
pub fn acceptance(score: i32, components: &ComponentMap, threshold: i32) -> bool {
    if score < threshold {
        return false;
    }
    let min_components = if components.contains_key(&ComponentId::PositionMid) {
        3
    } else {
        2
    };
    components.len() >= min_components
}

fn position_percentile(h1: &CandleBuffer, price: Decimal) -> Option<Decimal> {
    let high = h1.highest_high(POSITION_LOOKBACK_H1)?;
    let low = h1.lowest_low(POSITION_LOOKBACK_H1)?;
    if high == low {
        return None;
    }
    Some((price - low) / (high - low))
}

fn momentum_24h(snapshot: &MarketSnapshot) -> Option<Decimal> {
    if let Some(daily) = snapshot.d1.last() {
        return Some(daily.change_pct());
    }
    let hourly = snapshot.h1.last_n(24);
    let first = hourly.first()?;
    let last = hourly.last()?;
    if first.open.is_zero() {
        return None;
    }
    Some(((last.close - first.open) / first.open) * Decimal::from(100))
}

fn trend_1h(h1: &CandleBuffer) -> Option<Side> {
    let window = h1.last_n(TREND_LOOKBACK_H1);
    if window.is_empty() {
        return None;
    }
    let n = Decimal::from(window.len() as i64);
    let bullish = Decimal::from(window.iter().filter(|c| c.is_bullish()).count() as i64);
    let share = bullish / n;
    if share > dec!(0.625) {
        Some(Side::Long)
    } else if share < dec!(0.375) {
        Some(Side::Short)
    } else {
        None
    }
}

fn trend_1d(d1: &CandleBuffer) -> Option<Side> {
    let window = d1.last_n(TREND_LOOKBACK_D1);
    let bullish = window.iter().filter(|c| c.is_bullish()).count();
    let bearish = window.iter().filter(|c| c.is_bearish()).count();
    if bullish >= 15 {
        Some(Side::Long)
    } else if bearish >= 15 {
        Some(Side::Short)
    } else {
        None
    }
}

fn consecutive_trend(h1: &CandleBuffer) -> Option<Side> {
    let window = h1.last_n(CONSECUTIVE_LOOKBACK_H1);
    if window.len() < CONSECUTIVE_LOOKBACK_H1 {
        return None;
    }
    let bullish = window.iter().filter(|c| c.is_bullish()).count();
    let bearish = window.iter().filter(|c| c.is_bearish()).count();

    let first = window.first()?;
    let last = window.last()?;
    if first.open.is_zero() {
        return None;
    }
    let cumulative = (((last.close - first.open) / first.open) * Decimal::from(100)).abs();
    if cumulative >= dec!(8) {
        return None;
    }

    if bullish >= 7 {
        Some(Side::Long)
    } else if bearish >= 7 {
        Some(Side::Short)
    } else {
        None
    }
}

/// Directional quote-volume dominance over the last three candles.
fn volume_power(buffer: &CandleBuffer) -> Option<Side> {
    let window = buffer.last_n(VOLUME_LOOKBACK);
    if window.len() < VOLUME_LOOKBACK {
        return None;
    }
    let bull_volume: Decimal = window
        .iter()
        .filter(|c| c.is_bullish())
        .map(|c| c.quote_volume)
        .sum();
    let bear_volume: Decimal = window
        .iter()
        .filter(|c| c.is_bearish())
        .map(|c| c.quote_volume)
        .sum();

    let ratio = dec!(1.3);
    if bull_volume > bear_volume * ratio && bull_volume - bear_volume > Decimal::ZERO {
        Some(Side::Long)
    } else if bear_volume > bull_volume * ratio && bear_volume - bull_volume > Decimal::ZERO {
        Some(Side::Short)
    } else {
        None
    }
}

fn net_quote_volume(buffer: &CandleBuffer, n: usize) -> Decimal {
    buffer
        .last_n(n)
        .iter()
        .map(|c| {
            if c.is_bullish() {
                c.quote_volume
            } else if c.is_bearish() {
                -c.quote_volume
            } else {
                Decimal::ZERO
            }
        })
        .sum()
}

fn range_pct_24h(h1: &CandleBuffer) -> Option<Decimal> {
    let window = h1.last_n(24);
    if window.is_empty() {
        return None;
    }
    let high = window.iter().map(|c| c.high).max()?;
    let low = window.iter().map(|c| c.low).min()?;
    let mean: Decimal =
        window.iter().map(|c| c.close).sum::<Decimal>() / Decimal::from(window.len() as i64);
    if mean.is_zero() {
        return None;
    }
    Some(((high - low) / mean) * Decimal::from(100))
}

/// Breakout confluence plus the three anti-FOMO gates: no fresh hourly
/// upper shadow over 1.5%, not already 4-of-5 bullish dailies, and broad
/// daily participation (>= 18 of 30).
fn breakout_long_fires(snapshot: &MarketSnapshot, pos: Decimal) -> bool {
    if pos <= dec!(0.70) {
        return false;
    }
    if net_quote_volume(&snapshot.h1, VOLUME_LOOKBACK) <= Decimal::ZERO {
        return false;
    }

    let Some(last_m15) = snapshot.m15.last() else { return false };
    let m15 = &snapshot.m15;
    let prior = if m15.len() > 1 {
        &m15.candles[m15.len().saturating_sub(SWING_LOOKBACK_M15 + 1)..m15.len() - 1]
    } else {
        return false;
    };
    let Some(swing_high) = prior.iter().map(|c| c.high).max() else { return false };
    if last_m15.close <= swing_high {
        return false;
    }

    let shadow_veto = snapshot
        .h1
        .last_n(3)
        .iter()
        .any(|c| c.upper_shadow_pct() > dec!(1.5));
    if shadow_veto {
        return false;
    }
    if snapshot.d1.bullish_count(5) >= 4 {
        return false;
    }
    snapshot.d1.bullish_count(TREND_LOOKBACK_D1) >= 18
}

fn breakdown_short_fires(snapshot: &MarketSnapshot, pos: Decimal) -> bool {
    if pos >= dec!(0.30) {
        return false;
    }
    if net_quote_volume(&snapshot.h1, VOLUME_LOOKBACK) >= Decimal::ZERO {
        return false;
    }

    let Some(last_m15) = snapshot.m15.last() else { return false };
    let m15 = &snapshot.m15;
    let prior = if m15.len() > 1 {
        &m15.candles[m15.len().saturating_sub(SWING_LOOKBACK_M15 + 1)..m15.len() - 1]
    } else {
        return false;
    };
    let Some(swing_low) = prior.iter().map(|c| c.low).min() else { return false };
    if last_m15.close >= swing_low {
        return false;
    }

    let shadow_veto = snapshot
        .h1
        .last_n(3)
        .iter()
        .any(|c| c.lower_shadow_pct() > dec!(1.5));
    if shadow_veto {
        return false;
    }
    if snapshot.d1.bearish_count(5) >= 4 {
        return false;
    }
    snapshot.d1.bearish_count(TREND_LOOKBACK_D1) >= 18
}
