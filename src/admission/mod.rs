use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::store::ConfigSnapshot;
use crate::database::Database;
use crate::types::{ComponentId, MarketSnapshot, Opportunity, Side, TimeFrame};

/// Soft cap on concurrent same-direction positions per symbol.
pub const PER_DIRECTION_CAP: i64 = 3;

/// Structured rejection reason; logged one-line and, for blacklist hits,
/// counted in statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    TradingDisabled,
    SymbolRated,
    TradingBlacklisted,
    SignalBlacklisted { pattern: String },
    DirectionConflict { component: ComponentId },
    StaleData { timeframe: TimeFrame },
    Cooldown { remaining_secs: i64 },
    DuplicateSignal,
    AccountPositionCap { current: i64, max: usize },
    SymbolDirectionCap { current: i64 },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::TradingDisabled => "trading_disabled",
            RejectReason::SymbolRated => "symbol_rated",
            RejectReason::TradingBlacklisted => "trading_blacklisted",
            RejectReason::SignalBlacklisted { .. } => "signal_blacklisted",
            RejectReason::DirectionConflict { .. } => "direction_conflict",
            RejectReason::StaleData { .. } => "stale_data",
            RejectReason::Cooldown { .. } => "cooldown",
            RejectReason::DuplicateSignal => "duplicate_signal",
            RejectReason::AccountPositionCap { .. } => "account_position_cap",
            RejectReason::SymbolDirectionCap { .. } => "symbol_direction_cap",
        }
    }

    /// Blacklist rejections feed operator statistics; the rest are noise.
    pub fn counts_toward_stats(&self) -> bool {
        matches!(
            self,
            RejectReason::TradingBlacklisted | RejectReason::SignalBlacklisted { .. }
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SignalBlacklisted { pattern } => {
                write!(f, "signal_blacklisted({})", pattern)
            }
            RejectReason::DirectionConflict { component } => {
                write!(f, "direction_conflict({})", component)
            }
            RejectReason::StaleData { timeframe } => write!(f, "stale_data({})", timeframe),
            RejectReason::Cooldown { remaining_secs } => {
                write!(f, "cooldown({}s remaining)", remaining_secs)
            }
            RejectReason::AccountPositionCap { current, max } => {
                write!(f, "account_position_cap({}/{})", current, max)
            }
            RejectReason::SymbolDirectionCap { current } => {
                write!(f, "symbol_direction_cap({}/{})", current, PER_DIRECTION_CAP)
            }
            other => write!(f, "{}", other.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Accepted,
    Rejected(RejectReason),
}

/// The fixed-order invariant chain every opportunity passes before the
/// entry executor sees it. First failure wins.
pub struct AdmissionFilter {
    db: Arc<Database>,
    account_id: i64,
    max_open_positions: usize,
    cooldown: Duration,
    signal_version: i64,
}

impl AdmissionFilter {
    pub fn new(
        db: Arc<Database>,
        account_id: i64,
        max_open_positions: usize,
        cooldown_minutes: i64,
        signal_version: i64,
    ) -> Self {
        Self {
            db,
            account_id,
            max_open_positions,
            cooldown: Duration::minutes(cooldown_minutes),
            signal_version,
        }
    }

    pub async fn admit(
        &self,
        opportunity: &Opportunity,
        snapshot: &MarketSnapshot,
        cfg: &ConfigSnapshot,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome> {
        // 1. Global / per-account kill switch.
        if !cfg.trading_enabled(self.account_id) {
            return Ok(reject(RejectReason::TradingDisabled));
        }

        // 2. Symbol rating level 3 forbids opening.
        if cfg.symbol_rating_forbids(&opportunity.symbol) {
            return Ok(reject(RejectReason::SymbolRated));
        }

        // 3. Hard symbol exclusion.
        if cfg.is_symbol_blacklisted(&opportunity.symbol) {
            return Ok(reject(RejectReason::TradingBlacklisted));
        }

        // 4. Signal blacklist, set-equality on the sorted pattern.
        let pattern = opportunity.signal_pattern();
        if cfg.is_signal_blacklisted(&pattern, opportunity.side) {
            return Ok(reject(RejectReason::SignalBlacklisted { pattern }));
        }

        // 5. Direction consistency re-check after component cleaning.
        if let Some(component) = direction_conflict(opportunity) {
            return Ok(reject(RejectReason::DirectionConflict { component }));
        }

        // 6. Data freshness on every required timeframe.
        if let Some(timeframe) = snapshot.stale_timeframes(now).into_iter().next() {
            return Ok(reject(RejectReason::StaleData { timeframe }));
        }

        // 7. Cooldown after a close on the same (symbol, side).
        if let Some(closed_at) = self
            .db
            .last_close_time(self.account_id, &opportunity.symbol, opportunity.side)
            .await?
        {
            let elapsed = now - closed_at;
            if elapsed < self.cooldown {
                let remaining_secs = (self.cooldown - elapsed).num_seconds();
                return Ok(reject(RejectReason::Cooldown { remaining_secs }));
            }
        }

        // 8. Same-version duplicate; cross-version re-entries are allowed.
        if self
            .db
            .has_live_same_version(
                self.account_id,
                &opportunity.symbol,
                opportunity.side,
                self.signal_version,
            )
            .await?
        {
            return Ok(reject(RejectReason::DuplicateSignal));
        }

        // 9. Position caps: account-wide, then per-symbol-per-direction.
        let account_count = self.db.count_live_positions(self.account_id).await?;
        if account_count >= self.max_open_positions as i64 {
            return Ok(reject(RejectReason::AccountPositionCap {
                current: account_count,
                max: self.max_open_positions,
            }));
        }
        let direction_count = self
            .db
            .count_live_positions_for(self.account_id, &opportunity.symbol, opportunity.side)
            .await?;
        if direction_count >= PER_DIRECTION_CAP {
            return Ok(reject(RejectReason::SymbolDirectionCap {
                current: direction_count,
            }));
        }

        Ok(AdmissionOutcome::Accepted)
    }
}

fn reject(reason: RejectReason) -> AdmissionOutcome {
    debug!("Admission rejected: {}", reason);
    AdmissionOutcome::Rejected(reason)
}

/// A conflicting-bias component that survived cleaning is a bug upstream,
/// with two sanctioned exceptions: an overbought spike inside an oversold
/// bounce (LONG) and its mirror (SHORT).
fn direction_conflict(opportunity: &Opportunity) -> Option<ComponentId> {
    for component in opportunity.components.keys() {
        if !component.bias().conflicts(opportunity.side) {
            continue;
        }
        let excused = match (opportunity.side, component) {
            (Side::Long, ComponentId::MomentumUp3Pct) => {
                opportunity.components.contains_key(&ComponentId::PositionLow)
            }
            (Side::Short, ComponentId::MomentumDown3Pct) => {
                opportunity.components.contains_key(&ComponentId::PositionHigh)
            }
            _ => false,
        };
        if !excused {
            return Some(*component);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Settings;
    use crate::config::store::SignalBlacklistRow;
    use crate::types::{
        BatchFill, Candle, CandleBuffer, CloseReason, ComponentMap, MarginMode, Position, Symbol,
        VolatilityProfile,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn settings() -> Settings {
        Settings {
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            symbols_coin: vec![],
            scan_interval_seconds: 300,
            position_size: dec!(100),
            leverage: 5,
            max_open_positions: 10,
            cooldown_minutes: 15,
            trading_enabled: true,
            database_url: "sqlite::memory:".to_string(),
            batch_entry: Default::default(),
            smart_exit: Default::default(),
            adaptive: Default::default(),
            optimizer: Default::default(),
            exchange: Default::default(),
        }
    }

    fn cfg() -> ConfigSnapshot {
        ConfigSnapshot::bootstrap(&settings())
    }

    fn opportunity(symbol: &str, side: Side, components: &[(ComponentId, i32)]) -> Opportunity {
        let map: ComponentMap = components.iter().copied().collect();
        let score = components.iter().map(|(_, w)| w).sum();
        Opportunity {
            symbol: Symbol::from(symbol),
            side,
            score,
            components: map,
            current_price: dec!(100),
            funding_rate: None,
            volatility: VolatilityProfile::Medium,
            signal_time: Utc::now(),
        }
    }

    fn fresh_snapshot(symbol: &str, now: DateTime<Utc>) -> MarketSnapshot {
        let mk = |tf: TimeFrame, age: Duration| {
            CandleBuffer::from_candles(vec![Candle {
                symbol: Symbol::from(symbol),
                timeframe: tf,
                open_time: now - age,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: dec!(10),
                quote_volume: dec!(1000),
            }])
        };
        MarketSnapshot {
            symbol: Symbol::from(symbol),
            m5: mk(TimeFrame::M5, Duration::minutes(2)),
            m15: mk(TimeFrame::M15, Duration::minutes(7)),
            h1: mk(TimeFrame::H1, Duration::minutes(20)),
            d1: mk(TimeFrame::D1, Duration::hours(10)),
            funding_rate: None,
            fetched_at: now,
        }
    }

    async fn filter() -> (AdmissionFilter, Arc<Database>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.ensure_account(1, MarginMode::Linear, dec!(10000)).await.unwrap();
        let filter = AdmissionFilter::new(Arc::clone(&db), 1, 10, 15, 3);
        (filter, db)
    }

    fn long_opp() -> Opportunity {
        opportunity(
            "BTC/USDT",
            Side::Long,
            &[(ComponentId::PositionLow, 20), (ComponentId::Trend1hBull, 20)],
        )
    }

    #[tokio::test]
    async fn clean_opportunity_is_accepted() {
        let (filter, _db) = filter().await;
        let now = Utc::now();
        let outcome = filter
            .admit(&long_opp(), &fresh_snapshot("BTC/USDT", now), &cfg(), now)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);
    }

    #[tokio::test]
    async fn trading_disabled_rejects_everything() {
        let (filter, _db) = filter().await;
        let mut config = cfg();
        config.trading_enabled_default = false;
        let now = Utc::now();
        let outcome = filter
            .admit(&long_opp(), &fresh_snapshot("BTC/USDT", now), &config, now)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Rejected(RejectReason::TradingDisabled));
    }

    #[tokio::test]
    async fn stale_five_minute_candle_rejects() {
        let (filter, _db) = filter().await;
        let now = Utc::now();
        let mut snapshot = fresh_snapshot("BTC/USDT", now);
        snapshot.m5.candles[0].open_time = now - Duration::minutes(10);
        let outcome = filter.admit(&long_opp(), &snapshot, &cfg(), now).await.unwrap();
        assert_eq!(
            outcome,
            AdmissionOutcome::Rejected(RejectReason::StaleData { timeframe: TimeFrame::M5 })
        );
    }

    #[tokio::test]
    async fn cooldown_window_boundaries() {
        let (filter, db) = filter().await;
        let closed_at = Utc::now();

        // Close a SHORT on ETH/USDT at t0.
        let mut components = ComponentMap::new();
        components.insert(ComponentId::PositionHigh, 20);
        components.insert(ComponentId::Trend1hBear, 20);
        let mut p = Position::new_building(
            1,
            MarginMode::Linear,
            Symbol::from("ETH/USDT"),
            Side::Short,
            3,
            40,
            components,
            vec![dec!(1)],
            5,
            closed_at - Duration::hours(2),
        );
        p.apply_fill(BatchFill {
            price: dec!(100),
            quantity: dec!(1),
            filled_at: closed_at - Duration::hours(2),
            forced: false,
        });
        db.upsert_position(&p).await.unwrap();
        p.mark_open(closed_at - Duration::hours(2));
        p.close(dec!(99), CloseReason::TakeProfit, Decimal::ZERO, closed_at);
        db.close_position(&p, Decimal::ZERO).await.unwrap();

        let opp = opportunity(
            "ETH/USDT",
            Side::Short,
            &[(ComponentId::PositionHigh, 25), (ComponentId::Trend1hBear, 25)],
        );

        // 14:59 into the window: rejected with ~1s remaining.
        let at = closed_at + Duration::minutes(14) + Duration::seconds(59);
        let outcome = filter
            .admit(&opp, &fresh_snapshot("ETH/USDT", at), &cfg(), at)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(RejectReason::Cooldown { remaining_secs }) if remaining_secs <= 1
        ));

        // 15:01: accepted.
        let at = closed_at + Duration::minutes(15) + Duration::seconds(1);
        let outcome = filter
            .admit(&opp, &fresh_snapshot("ETH/USDT", at), &cfg(), at)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);

        // The LONG side never entered cooldown.
        let long = opportunity(
            "ETH/USDT",
            Side::Long,
            &[(ComponentId::PositionLow, 25), (ComponentId::Trend1hBull, 25)],
        );
        let at = closed_at + Duration::minutes(1);
        let outcome = filter
            .admit(&long, &fresh_snapshot("ETH/USDT", at), &cfg(), at)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);
    }

    #[tokio::test]
    async fn signal_blacklist_is_set_equality() {
        let (filter, _db) = filter().await;
        let mut config = cfg();
        config.signal_blacklist.push(SignalBlacklistRow {
            pattern: "breakdown_short+volatility_high".to_string(),
            side: Side::Short,
            reason: "loser pattern".to_string(),
        });
        let now = Utc::now();
        let snapshot = fresh_snapshot("BTC/USDT", now);

        let exact = opportunity(
            "BTC/USDT",
            Side::Short,
            &[(ComponentId::BreakdownShort, 25), (ComponentId::VolatilityHigh, 10)],
        );
        let outcome = filter.admit(&exact, &snapshot, &config, now).await.unwrap();
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected(RejectReason::SignalBlacklisted { .. })
        ));

        // A strict superset of the pattern must pass the blacklist gate.
        let superset = opportunity(
            "BTC/USDT",
            Side::Short,
            &[
                (ComponentId::BreakdownShort, 25),
                (ComponentId::VolatilityHigh, 10),
                (ComponentId::VolumePowerBear, 10),
            ],
        );
        let outcome = filter.admit(&superset, &snapshot, &config, now).await.unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);
    }

    #[tokio::test]
    async fn direction_conflict_detected_with_exceptions() {
        let (filter, _db) = filter().await;
        let now = Utc::now();
        let snapshot = fresh_snapshot("BTC/USDT", now);

        // Bearish momentum inside an oversold LONG is the sanctioned bounce.
        let bounce = opportunity(
            "BTC/USDT",
            Side::Long,
            &[(ComponentId::PositionLow, 20), (ComponentId::MomentumUp3Pct, 20)],
        );
        let outcome = filter.admit(&bounce, &snapshot, &cfg(), now).await.unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);

        // The same component without the oversold anchor is a conflict.
        let conflict = opportunity(
            "BTC/USDT",
            Side::Long,
            &[(ComponentId::Trend1hBull, 20), (ComponentId::MomentumUp3Pct, 20)],
        );
        let outcome = filter.admit(&conflict, &snapshot, &cfg(), now).await.unwrap();
        assert_eq!(
            outcome,
            AdmissionOutcome::Rejected(RejectReason::DirectionConflict {
                component: ComponentId::MomentumUp3Pct
            })
        );
    }

    #[tokio::test]
    async fn duplicate_same_version_rejected_cross_version_allowed() {
        let (filter, db) = filter().await;
        let now = Utc::now();

        let mut components = ComponentMap::new();
        components.insert(ComponentId::PositionLow, 20);
        components.insert(ComponentId::Trend1hBull, 20);
        let mut existing = Position::new_building(
            1,
            MarginMode::Linear,
            Symbol::from("BTC/USDT"),
            Side::Long,
            3,
            40,
            components,
            vec![dec!(1)],
            5,
            now,
        );
        existing.apply_fill(BatchFill {
            price: dec!(100),
            quantity: dec!(1),
            filled_at: now,
            forced: false,
        });
        db.upsert_position(&existing).await.unwrap();

        let outcome = filter
            .admit(&long_opp(), &fresh_snapshot("BTC/USDT", now), &cfg(), now)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Rejected(RejectReason::DuplicateSignal));

        // A filter running a newer signal version admits the same shape.
        let newer = AdmissionFilter::new(Arc::clone(&db), 1, 10, 15, 4);
        let outcome = newer
            .admit(&long_opp(), &fresh_snapshot("BTC/USDT", now), &cfg(), now)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);
    }

    #[tokio::test]
    async fn per_direction_cap_applies() {
        let (filter, db) = filter().await;
        let now = Utc::now();

        for version in 10..13 {
            let mut components = ComponentMap::new();
            components.insert(ComponentId::PositionLow, 20);
            let mut p = Position::new_building(
                1,
                MarginMode::Linear,
                Symbol::from("BTC/USDT"),
                Side::Long,
                version,
                40,
                components,
                vec![dec!(1)],
                5,
                now,
            );
            p.apply_fill(BatchFill {
                price: dec!(100),
                quantity: dec!(1),
                filled_at: now,
                forced: false,
            });
            db.upsert_position(&p).await.unwrap();
        }

        let outcome = filter
            .admit(&long_opp(), &fresh_snapshot("BTC/USDT", now), &cfg(), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AdmissionOutcome::Rejected(RejectReason::SymbolDirectionCap { current: 3 })
        );

        // The SHORT side on the same symbol is unaffected.
        let short = opportunity(
            "BTC/USDT",
            Side::Short,
            &[(ComponentId::PositionHigh, 25), (ComponentId::Trend1hBear, 25)],
        );
        let outcome = filter
            .admit(&short, &fresh_snapshot("BTC/USDT", now), &cfg(), now)
            .await
            .unwrap();
        assert_eq!(outcome, AdmissionOutcome::Accepted);
    }
}
