use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::settings::{parse_run_at, OptimizerSettings};
use crate::config::store::{ConfigStore, WEIGHT_MAX, WEIGHT_MIN};
use crate::database::Database;
use crate::notifications::{self, Notifier, Severity};
use crate::types::{signal_pattern, ComponentId, Position, Side, Symbol};

/// Minimum closed orders touching a component / symbol / pattern before the
/// optimizer acts on it.
const MIN_ORDERS: usize = 5;

const SL_WIDEN_STEP: Decimal = dec!(1.0);
const SL_MAX_PCT: Decimal = dec!(6.0);
const MULTIPLIER_FLOOR: Decimal = dec!(0.5);

/// One planned mutation, carrying everything needed for both the SQL write
/// and its optimization_history row.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Weight {
        component: ComponentId,
        side: Side,
        old_weight: i32,
        new_weight: i32,
        performance_score: Decimal,
    },
    WidenSymbolRisk {
        symbol: Symbol,
        old_sl_pct: Decimal,
        new_sl_pct: Decimal,
        old_multiplier: Decimal,
        new_multiplier: Decimal,
        win_rate: Decimal,
        total_pnl: Decimal,
    },
    TradingBlacklist {
        symbol: Symbol,
        total_pnl: Decimal,
        trades: usize,
    },
    ImproveRating {
        symbol: Symbol,
        old_level: i64,
        new_level: i64,
    },
    SignalBlacklist {
        pattern: String,
        side: Side,
        win_rate: Decimal,
        total_pnl: Decimal,
    },
}

impl Change {
    /// (change_type, target, param, old_value, new_value, reason)
    fn history_row(&self) -> (String, String, String, String, String, String) {
        match self {
            Change::Weight {
                component,
                side,
                old_weight,
                new_weight,
                performance_score,
            } => (
                "scoring_weight".to_string(),
                component.name().to_string(),
                match side {
                    Side::Long => "weight_long".to_string(),
                    Side::Short => "weight_short".to_string(),
                },
                old_weight.to_string(),
                new_weight.to_string(),
                format!("performance_score={}", performance_score),
            ),
            Change::WidenSymbolRisk {
                symbol,
                old_sl_pct,
                new_sl_pct,
                win_rate,
                total_pnl,
                ..
            } => (
                "symbol_risk".to_string(),
                symbol.to_string(),
                "sl_pct".to_string(),
                old_sl_pct.to_string(),
                new_sl_pct.to_string(),
                format!("win_rate={} total_pnl={}", win_rate, total_pnl),
            ),
            Change::TradingBlacklist { symbol, total_pnl, trades } => (
                "trading_blacklist".to_string(),
                symbol.to_string(),
                "active".to_string(),
                "0".to_string(),
                "1".to_string(),
                format!("total_pnl={} over {} trades", total_pnl, trades),
            ),
            Change::ImproveRating { symbol, old_level, new_level } => (
                "symbol_rating".to_string(),
                symbol.to_string(),
                "level".to_string(),
                old_level.to_string(),
                new_level.to_string(),
                "win_rate>=60% and positive pnl".to_string(),
            ),
            Change::SignalBlacklist { pattern, side, win_rate, total_pnl } => (
                "signal_blacklist".to_string(),
                pattern.clone(),
                side.as_str().to_string(),
                "0".to_string(),
                "1".to_string(),
                format!("win_rate={} total_pnl={}", win_rate, total_pnl),
            ),
        }
    }
}

#[derive(Debug)]
pub struct OptimizationReport {
    pub since: DateTime<Utc>,
    pub trades_analyzed: usize,
    pub changes: Vec<Change>,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
struct SymbolAggregate {
    trades: usize,
    wins: usize,
    total_pnl: Decimal,
}

impl SymbolAggregate {
    fn win_rate(&self) -> Decimal {
        if self.trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins as i64) / Decimal::from(self.trades as i64) * dec!(100)
    }
}

/// Weight deltas per the fixed policy. Everything clamps to [5, 30].
fn weight_delta(performance_score: Decimal) -> i32 {
    if performance_score > dec!(10) {
        3
    } else if performance_score > dec!(5) {
        2
    } else if performance_score < dec!(-10) {
        -3
    } else if performance_score < dec!(-5) {
        -2
    } else {
        0
    }
}

/// Pure planning pass over the closed set. The DB is only touched by
/// `apply`, so the whole policy is testable on constructed positions.
pub fn plan_changes(
    closed: &[Position],
    weights: &HashMap<ComponentId, (i32, i32)>,
    risk_sl: &HashMap<Symbol, Decimal>,
    multipliers: &HashMap<Symbol, Decimal>,
    ratings: &HashMap<Symbol, i64>,
    blacklisted: &dyn Fn(&Symbol) -> bool,
    pattern_blacklisted: &dyn Fn(&str, Side) -> bool,
) -> Vec<Change> {
    let mut changes = Vec::new();

    // (a) Scoring weights from per-position pnl attribution.
    let mut perf: HashMap<(ComponentId, Side), (Decimal, usize)> = HashMap::new();
    for position in closed {
        let total_weight: i32 = position.components.values().sum();
        if total_weight == 0 {
            continue;
        }
        for (component, weight) in &position.components {
            let contribution = position.realized_pnl * Decimal::from(*weight)
                / Decimal::from(total_weight);
            let entry = perf.entry((*component, position.side)).or_default();
            entry.0 += contribution;
            entry.1 += 1;
        }
    }

    let mut weight_changes: Vec<Change> = perf
        .into_iter()
        .filter(|(_, (_, orders))| *orders >= MIN_ORDERS)
        .filter_map(|((component, side), (score, _))| {
            let delta = weight_delta(score);
            if delta == 0 {
                return None;
            }
            let (weight_long, weight_short) = weights.get(&component).copied().unwrap_or((10, 10));
            let old_weight = match side {
                Side::Long => weight_long,
                Side::Short => weight_short,
            };
            let new_weight = (old_weight + delta).clamp(WEIGHT_MIN, WEIGHT_MAX);
            if new_weight == old_weight {
                return None;
            }
            Some(Change::Weight {
                component,
                side,
                old_weight,
                new_weight,
                performance_score: score,
            })
        })
        .collect();
    weight_changes.sort_by_key(|c| match c {
        Change::Weight { component, side, .. } => (component.name(), side.as_str()),
        _ => ("", ""),
    });
    changes.extend(weight_changes);

    // (b) Per-symbol risk parameters.
    let mut per_symbol: HashMap<Symbol, SymbolAggregate> = HashMap::new();
    for position in closed {
        let agg = per_symbol.entry(position.symbol.clone()).or_default();
        agg.trades += 1;
        if position.realized_pnl > Decimal::ZERO {
            agg.wins += 1;
        }
        agg.total_pnl += position.realized_pnl;
    }

    let mut symbols: Vec<&Symbol> = per_symbol.keys().collect();
    symbols.sort();
    for symbol in symbols {
        let agg = &per_symbol[symbol];
        if agg.trades < MIN_ORDERS {
            continue;
        }

        if agg.total_pnl < dec!(-500) && !blacklisted(symbol) {
            changes.push(Change::TradingBlacklist {
                symbol: symbol.clone(),
                total_pnl: agg.total_pnl,
                trades: agg.trades,
            });
            continue;
        }

        if agg.win_rate() < dec!(15) && agg.total_pnl < Decimal::ZERO {
            let old_sl = risk_sl.get(symbol).copied().unwrap_or(dec!(3.0));
            let new_sl = (old_sl + SL_WIDEN_STEP).min(SL_MAX_PCT);
            let old_multiplier = multipliers.get(symbol).copied().unwrap_or(Decimal::ONE);
            let new_multiplier = (old_multiplier / dec!(2)).max(MULTIPLIER_FLOOR);
            if new_sl != old_sl || new_multiplier != old_multiplier {
                changes.push(Change::WidenSymbolRisk {
                    symbol: symbol.clone(),
                    old_sl_pct: old_sl,
                    new_sl_pct: new_sl,
                    old_multiplier,
                    new_multiplier,
                    win_rate: agg.win_rate(),
                    total_pnl: agg.total_pnl,
                });
            }
        } else if agg.win_rate() >= dec!(60) && agg.total_pnl > dec!(50) {
            let old_level = ratings.get(symbol).copied().unwrap_or(0);
            if old_level > 0 {
                changes.push(Change::ImproveRating {
                    symbol: symbol.clone(),
                    old_level,
                    new_level: old_level - 1,
                });
            }
        }
    }

    // (c) Signal-blacklist additions per (pattern, side).
    let mut per_pattern: HashMap<(String, Side), SymbolAggregate> = HashMap::new();
    for position in closed {
        let pattern = signal_pattern(&position.components);
        let agg = per_pattern.entry((pattern, position.side)).or_default();
        agg.trades += 1;
        if position.realized_pnl > Decimal::ZERO {
            agg.wins += 1;
        }
        agg.total_pnl += position.realized_pnl;
    }

    let mut patterns: Vec<(&(String, Side), &SymbolAggregate)> = per_pattern.iter().collect();
    patterns.sort_by(|a, b| a.0.cmp(b.0));
    for ((pattern, side), agg) in patterns {
        if agg.trades < MIN_ORDERS || pattern_blacklisted(pattern, *side) {
            continue;
        }
        if agg.win_rate() < dec!(25) || agg.total_pnl <= dec!(-100) {
            changes.push(Change::SignalBlacklist {
                pattern: pattern.clone(),
                side: *side,
                win_rate: agg.win_rate(),
                total_pnl: agg.total_pnl,
            });
        }
    }

    changes
}

/// The daily adaptive job. Reads closed positions since the last run,
/// plans mutations, and either writes them in one transaction (appending
/// optimization history) or, in dry-run mode, writes the would-be diff to a
/// file and leaves the database untouched.
pub struct Optimizer {
    db: Arc<Database>,
    config: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
    settings: OptimizerSettings,
}

impl Optimizer {
    pub fn new(
        db: Arc<Database>,
        config: Arc<ConfigStore>,
        notifier: Arc<dyn Notifier>,
        settings: OptimizerSettings,
    ) -> Self {
        Self {
            db,
            config,
            notifier,
            settings,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<OptimizationReport> {
        let since = match self.db.last_optimized_at().await? {
            Some(t) => t,
            None => now - ChronoDuration::days(self.settings.lookback_days.max(1)),
        };
        let closed = self.db.positions_closed_since(since).await?;
        info!(
            "Optimizer: analyzing {} positions closed since {}",
            closed.len(),
            since
        );

        let weight_rows = self.db.load_scoring_weights().await?;
        let weights: HashMap<ComponentId, (i32, i32)> = weight_rows
            .iter()
            .map(|w| (w.component, (w.weight_long, w.weight_short)))
            .collect();

        let risk_rows = self.db.load_symbol_risk_params().await?;
        // Long-side SL drives the widening step; both sides move together.
        let risk_sl: HashMap<Symbol, Decimal> = risk_rows
            .iter()
            .map(|r| (r.symbol.clone(), r.long_sl_pct))
            .collect();
        let multipliers: HashMap<Symbol, Decimal> = risk_rows
            .iter()
            .map(|r| (r.symbol.clone(), r.position_multiplier))
            .collect();

        let rating_rows = self.db.load_symbol_ratings().await?;
        let ratings: HashMap<Symbol, i64> = rating_rows
            .iter()
            .map(|r| (r.symbol.clone(), r.level))
            .collect();

        let trading_blacklist = self.db.load_trading_blacklist().await?;
        let signal_blacklist = self.db.load_signal_blacklist().await?;

        let changes = plan_changes(
            &closed,
            &weights,
            &risk_sl,
            &multipliers,
            &ratings,
            &|symbol| trading_blacklist.contains(symbol),
            &|pattern, side| {
                signal_blacklist
                    .iter()
                    .any(|row| row.pattern == pattern && row.side == side)
            },
        );

        let report = OptimizationReport {
            since,
            trades_analyzed: closed.len(),
            changes,
            dry_run: self.settings.dry_run,
        };

        if self.settings.dry_run {
            self.write_dry_run_file(&report, now)?;
            self.notifier
                .send(
                    Severity::Info,
                    notifications::optimizer_summary(report.changes.len(), true),
                )
                .await;
            return Ok(report);
        }

        if let Err(e) = self.apply(&report.changes, now).await {
            self.write_error_file(&e, now);
            return Err(e);
        }

        // Only a committed transaction publishes a new snapshot.
        self.config.reload().await?;
        self.notifier
            .send(
                Severity::Info,
                notifications::optimizer_summary(report.changes.len(), false),
            )
            .await;
        Ok(report)
    }

    /// All mutations plus their history rows in a single transaction.
    async fn apply(&self, changes: &[Change], now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        let now_s = now.to_rfc3339();

        for change in changes {
            match change {
                Change::Weight { component, side, new_weight, performance_score, .. } => {
                    let column = match side {
                        Side::Long => "weight_long",
                        Side::Short => "weight_short",
                    };
                    let sql = format!(
                        "UPDATE scoring_weights SET {} = ?, performance_score = ?, last_adjusted = ? WHERE component_name = ?",
                        column
                    );
                    sqlx::query(&sql)
                        .bind(new_weight)
                        .bind(performance_score.to_string())
                        .bind(&now_s)
                        .bind(component.name())
                        .execute(&mut *tx)
                        .await?;
                }
                Change::WidenSymbolRisk {
                    symbol,
                    new_sl_pct,
                    new_multiplier,
                    win_rate,
                    total_pnl,
                    ..
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO symbol_risk_params (
                            symbol, long_tp_pct, long_sl_pct, short_tp_pct, short_sl_pct,
                            position_multiplier, win_rate, total_trades, total_pnl, last_optimized
                        ) VALUES (?, '5.0', ?, '4.0', ?, ?, ?, 0, ?, ?)
                        ON CONFLICT(symbol) DO UPDATE SET
                            long_sl_pct = excluded.long_sl_pct,
                            short_sl_pct = excluded.short_sl_pct,
                            position_multiplier = excluded.position_multiplier,
                            win_rate = excluded.win_rate,
                            total_pnl = excluded.total_pnl,
                            last_optimized = excluded.last_optimized
                        "#,
                    )
                    .bind(symbol.as_str())
                    .bind(new_sl_pct.to_string())
                    .bind(new_sl_pct.to_string())
                    .bind(new_multiplier.to_string())
                    .bind(win_rate.to_string())
                    .bind(total_pnl.to_string())
                    .bind(&now_s)
                    .execute(&mut *tx)
                    .await?;
                }
                Change::TradingBlacklist { symbol, total_pnl, trades } => {
                    sqlx::query(
                        r#"
                        INSERT INTO trading_blacklist (symbol, reason, active)
                        VALUES (?, ?, 1)
                        ON CONFLICT(symbol) DO UPDATE SET active = 1, reason = excluded.reason
                        "#,
                    )
                    .bind(symbol.as_str())
                    .bind(format!("optimizer: pnl {} over {} trades", total_pnl, trades))
                    .execute(&mut *tx)
                    .await?;
                }
                Change::ImproveRating { symbol, new_level, .. } => {
                    sqlx::query(
                        r#"
                        INSERT INTO symbol_ratings (symbol, level, total_pnl, hard_stop_count)
                        VALUES (?, ?, '0', 0)
                        ON CONFLICT(symbol) DO UPDATE SET level = excluded.level
                        "#,
                    )
                    .bind(symbol.as_str())
                    .bind(new_level)
                    .execute(&mut *tx)
                    .await?;
                }
                Change::SignalBlacklist { pattern, side, win_rate, total_pnl } => {
                    sqlx::query(
                        r#"
                        INSERT INTO signal_blacklist (signal_pattern, side, reason, active)
                        VALUES (?, ?, ?, 1)
                        ON CONFLICT(signal_pattern, side) DO UPDATE SET active = 1
                        "#,
                    )
                    .bind(pattern)
                    .bind(side.as_str())
                    .bind(format!("optimizer: win_rate {} total_pnl {}", win_rate, total_pnl))
                    .execute(&mut *tx)
                    .await?;
                }
            }

            let (change_type, target, param, old_value, new_value, reason) = change.history_row();
            sqlx::query(
                r#"
                INSERT INTO optimization_history (
                    optimized_at, change_type, target, param, old_value, new_value, reason
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&now_s)
            .bind(change_type)
            .bind(target)
            .bind(param)
            .bind(old_value)
            .bind(new_value)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
        }

        // Stamp the run itself so the next run's `since` moves forward even
        // when nothing changed.
        sqlx::query(
            r#"
            INSERT INTO optimization_history (
                optimized_at, change_type, target, param, old_value, new_value, reason
            ) VALUES (?, 'run', '-', '-', '-', '-', ?)
            "#,
        )
        .bind(&now_s)
        .bind(format!("{} changes applied", changes.len()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    fn write_dry_run_file(&self, report: &OptimizationReport, now: DateTime<Utc>) -> Result<()> {
        let path = format!(
            "{}/optimizer_dryrun_{}.txt",
            self.settings.report_dir,
            now.format("%Y%m%d_%H%M%S")
        );
        let mut body = format!(
            "Optimizer dry run at {}\nsince: {}\ntrades analyzed: {}\n\n",
            now, report.since, report.trades_analyzed
        );
        for change in &report.changes {
            let (change_type, target, param, old_value, new_value, reason) = change.history_row();
            body.push_str(&format!(
                "{} {} {}: {} -> {} ({})\n",
                change_type, target, param, old_value, new_value, reason
            ));
        }
        std::fs::write(&path, body).with_context(|| format!("writing dry-run diff {}", path))?;
        info!("Optimizer dry-run diff written to {}", path);
        Ok(())
    }

    fn write_error_file(&self, err: &anyhow::Error, now: DateTime<Utc>) {
        let path = format!(
            "{}/optimizer_ERROR_{}.txt",
            self.settings.report_dir,
            now.format("%Y%m%d_%H%M%S")
        );
        let body = format!("Optimizer failed at {}\n\n{:?}\n", now, err);
        if let Err(e) = std::fs::write(&path, body) {
            error!("Could not write optimizer error file {}: {}", path, e);
        }
    }

    /// Scheduled loop: sleep until the configured wall-clock time, run, and
    /// repeat daily.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Some((hour, minute)) = parse_run_at(&self.settings.run_at) else {
            error!("Optimizer disabled: bad run_at '{}'", self.settings.run_at);
            return;
        };

        loop {
            let now = Utc::now();
            let mut next = now
                .date_naive()
                .and_hms_opt(hour, minute, 0)
                .map(|t| t.and_utc())
                .unwrap_or(now + ChronoDuration::days(1));
            if next <= now {
                next += ChronoDuration::days(1);
            }
            let wait = (next - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(60));
            info!(
                "Optimizer scheduled for {} ({}s from now)",
                next,
                wait.as_secs()
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) => info!(
                            "Optimizer finished: {} changes ({} trades)",
                            report.changes.len(),
                            report.trades_analyzed
                        ),
                        Err(e) => warn!("Optimizer run failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Optimizer shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Settings;
    use crate::notifications::BufferedNotifier;
    use crate::types::{BatchFill, CloseReason, ComponentMap, MarginMode, PositionStatus};

    fn closed_position(
        symbol: &str,
        side: Side,
        components: &[(ComponentId, i32)],
        pnl: Decimal,
    ) -> Position {
        let now = Utc::now();
        let map: ComponentMap = components.iter().copied().collect();
        let mut p = Position::new_building(
            1,
            MarginMode::Linear,
            Symbol::from(symbol),
            side,
            3,
            40,
            map,
            vec![dec!(1)],
            5,
            now - ChronoDuration::hours(3),
        );
        p.apply_fill(BatchFill {
            price: dec!(100),
            quantity: dec!(1),
            filled_at: now - ChronoDuration::hours(3),
            forced: false,
        });
        p.mark_open(now - ChronoDuration::hours(3));
        p.status = PositionStatus::Closed;
        p.close_time = Some(now - ChronoDuration::hours(1));
        p.close_price = Some(dec!(100) + pnl);
        p.close_reason = Some(if pnl > Decimal::ZERO {
            CloseReason::TakeProfit
        } else {
            CloseReason::StopLoss
        });
        p.realized_pnl = pnl;
        p
    }

    fn no_blacklist() -> (impl Fn(&Symbol) -> bool, impl Fn(&str, Side) -> bool) {
        (|_: &Symbol| false, |_: &str, _: Side| false)
    }

    #[test]
    fn weight_bump_requires_five_orders() {
        let weights: HashMap<ComponentId, (i32, i32)> =
            [(ComponentId::PositionLow, (10, 10)), (ComponentId::Trend1hBull, (10, 10))]
                .into_iter()
                .collect();
        let comps = [(ComponentId::PositionLow, 10), (ComponentId::Trend1hBull, 10)];

        // Four profitable longs: below the order floor, no change.
        let four: Vec<Position> = (0..4)
            .map(|_| closed_position("BTC/USDT", Side::Long, &comps, dec!(60)))
            .collect();
        let (b, p) = no_blacklist();
        let changes = plan_changes(&four, &weights, &HashMap::new(), &HashMap::new(), &HashMap::new(), &b, &p);
        assert!(changes.iter().all(|c| !matches!(c, Change::Weight { .. })));

        // Five: each contributes 60 * 10/20 = 30, score 150 > 10 → +3.
        let five: Vec<Position> = (0..5)
            .map(|_| closed_position("BTC/USDT", Side::Long, &comps, dec!(60)))
            .collect();
        let changes = plan_changes(&five, &weights, &HashMap::new(), &HashMap::new(), &HashMap::new(), &b, &p);
        let weight_changes: Vec<&Change> = changes
            .iter()
            .filter(|c| matches!(c, Change::Weight { .. }))
            .collect();
        assert_eq!(weight_changes.len(), 2);
        for change in weight_changes {
            let Change::Weight { side, old_weight, new_weight, .. } = change else { unreachable!() };
            assert_eq!(*side, Side::Long);
            assert_eq!(*old_weight, 10);
            assert_eq!(*new_weight, 13);
        }
    }

    #[test]
    fn weight_deltas_follow_policy() {
        assert_eq!(weight_delta(dec!(11)), 3);
        assert_eq!(weight_delta(dec!(7)), 2);
        assert_eq!(weight_delta(dec!(3)), 0);
        assert_eq!(weight_delta(dec!(-3)), 0);
        assert_eq!(weight_delta(dec!(-7)), -2);
        assert_eq!(weight_delta(dec!(-11)), -3);
    }

    #[test]
    fn weight_clamps_at_bounds() {
        let weights: HashMap<ComponentId, (i32, i32)> =
            [(ComponentId::PositionLow, (29, 10))].into_iter().collect();
        let comps = [(ComponentId::PositionLow, 29)];
        let closed: Vec<Position> = (0..5)
            .map(|_| closed_position("BTC/USDT", Side::Long, &comps, dec!(100)))
            .collect();
        let (b, p) = no_blacklist();
        let changes = plan_changes(&closed, &weights, &HashMap::new(), &HashMap::new(), &HashMap::new(), &b, &p);
        let Some(Change::Weight { new_weight, .. }) =
            changes.iter().find(|c| matches!(c, Change::Weight { .. }))
        else {
            panic!("expected a weight change");
        };
        assert_eq!(*new_weight, 30);
    }

    #[test]
    fn losing_symbol_widens_stop_and_halves_multiplier() {
        let comps = [(ComponentId::PositionHigh, 10), (ComponentId::Trend1hBear, 10)];
        // 6 losers, 0 wins: win_rate 0 < 15, pnl -60.
        let closed: Vec<Position> = (0..6)
            .map(|_| closed_position("DOGE/USDT", Side::Short, &comps, dec!(-10)))
            .collect();
        let (b, p) = no_blacklist();
        let changes = plan_changes(&closed, &HashMap::new(), &HashMap::new(), &HashMap::new(), &HashMap::new(), &b, &p);

        let Some(Change::WidenSymbolRisk { new_sl_pct, new_multiplier, .. }) = changes
            .iter()
            .find(|c| matches!(c, Change::WidenSymbolRisk { .. }))
        else {
            panic!("expected a risk widening");
        };
        assert_eq!(*new_sl_pct, dec!(4.0));
        assert_eq!(*new_multiplier, dec!(0.5));
    }

    #[test]
    fn deep_loser_goes_to_trading_blacklist() {
        let comps = [(ComponentId::BreakdownShort, 25)];
        let closed: Vec<Position> = (0..6)
            .map(|_| closed_position("LUNA/USDT", Side::Short, &comps, dec!(-100)))
            .collect();
        let (b, p) = no_blacklist();
        let changes = plan_changes(&closed, &HashMap::new(), &HashMap::new(), &HashMap::new(), &HashMap::new(), &b, &p);
        assert!(changes
            .iter()
            .any(|c| matches!(c, Change::TradingBlacklist { symbol, .. } if symbol.as_str() == "LUNA/USDT")));
    }

    #[test]
    fn winner_improves_rating_one_level() {
        let comps = [(ComponentId::PositionLow, 10), (ComponentId::Trend1hBull, 10)];
        let mut closed: Vec<Position> = (0..4)
            .map(|_| closed_position("BTC/USDT", Side::Long, &comps, dec!(30)))
            .collect();
        closed.push(closed_position("BTC/USDT", Side::Long, &comps, dec!(-10)));
        closed.push(closed_position("BTC/USDT", Side::Long, &comps, dec!(-10)));
        // win_rate 4/6 = 66%, pnl +100.
        let ratings: HashMap<Symbol, i64> = [(Symbol::from("BTC/USDT"), 2)].into_iter().collect();
        let (b, p) = no_blacklist();
        let changes = plan_changes(&closed, &HashMap::new(), &HashMap::new(), &HashMap::new(), &ratings, &b, &p);
        assert!(changes
            .iter()
            .any(|c| matches!(c, Change::ImproveRating { old_level: 2, new_level: 1, .. })));
    }

    #[test]
    fn losing_pattern_lands_on_signal_blacklist_once() {
        let comps = [(ComponentId::BreakdownShort, 25), (ComponentId::VolatilityHigh, 10)];
        let mut closed: Vec<Position> = (0..4)
            .map(|_| closed_position("BTC/USDT", Side::Short, &comps, dec!(-10)))
            .collect();
        closed.push(closed_position("BTC/USDT", Side::Short, &comps, dec!(5)));
        // win_rate 20% < 25 with 5 trades.
        let (b, _) = no_blacklist();
        let changes = plan_changes(&closed, &HashMap::new(), &HashMap::new(), &HashMap::new(), &HashMap::new(), &b, &|_, _| false);
        assert!(changes.iter().any(|c| matches!(
            c,
            Change::SignalBlacklist { pattern, side: Side::Short, .. }
                if pattern == "breakdown_short+volatility_high"
        )));

        // Already blacklisted: not proposed again.
        let changes = plan_changes(
            &closed,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            &b,
            &|pattern, side| pattern == "breakdown_short+volatility_high" && side == Side::Short,
        );
        assert!(!changes.iter().any(|c| matches!(c, Change::SignalBlacklist { .. })));
    }

    // ---- end-to-end against the database ----

    fn settings() -> Settings {
        Settings {
            symbols: vec!["BTC/USDT".to_string()],
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

    async fn optimizer_with(dry_run: bool) -> (Optimizer, Arc<Database>, Arc<ConfigStore>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.ensure_account(1, MarginMode::Linear, dec!(10000)).await.unwrap();
        let config = Arc::new(ConfigStore::new(Arc::clone(&db), settings(), vec![1]));
        config.reload().await.unwrap();
        let mut opt_settings = OptimizerSettings::default();
        opt_settings.dry_run = dry_run;
        opt_settings.report_dir = std::env::temp_dir().to_string_lossy().to_string();
        let optimizer = Optimizer::new(
            Arc::clone(&db),
            Arc::clone(&config),
            BufferedNotifier::new(),
            opt_settings,
        );
        (optimizer, db, config)
    }

    async fn seed_losing_longs(db: &Database, n: usize) {
        let comps = [(ComponentId::PositionLow, 10), (ComponentId::Trend1hBull, 10)];
        for _ in 0..n {
            let p = closed_position("BTC/USDT", Side::Long, &comps, dec!(-20));
            db.upsert_position(&p).await.unwrap();
        }
    }

    #[tokio::test]
    async fn applied_changes_have_matching_history_rows() {
        let (optimizer, db, config) = optimizer_with(false).await;
        seed_losing_longs(&db, 6).await;

        let report = optimizer.run_once(Utc::now()).await.unwrap();
        assert!(!report.changes.is_empty());

        let history_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM optimization_history WHERE change_type != 'run'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(history_count, report.changes.len() as i64);

        // The snapshot was republished after commit: weight_long dropped
        // from 10 (each loser contributes -20/2 = -10, total -60 < -10 → -3).
        let snap = config.snapshot();
        assert_eq!(snap.weight(ComponentId::PositionLow, Side::Long), 7);
        assert_eq!(snap.weight(ComponentId::Trend1hBull, Side::Long), 7);
    }

    #[tokio::test]
    async fn second_run_over_same_set_changes_nothing() {
        let (optimizer, _db, _config) = optimizer_with(false).await;
        seed_losing_longs(&_db, 6).await;

        let first = optimizer.run_once(Utc::now()).await.unwrap();
        assert!(!first.changes.is_empty());

        // The run marker advanced `since`; the same closed set is not
        // re-analyzed.
        let second = optimizer.run_once(Utc::now()).await.unwrap();
        assert_eq!(second.trades_analyzed, 0);
        assert!(second.changes.is_empty());
    }

    #[tokio::test]
    async fn dry_run_touches_nothing_and_writes_diff() {
        let (optimizer, db, config) = optimizer_with(true).await;
        seed_losing_longs(&db, 6).await;

        let report = optimizer.run_once(Utc::now()).await.unwrap();
        assert!(report.dry_run);
        assert!(!report.changes.is_empty());

        let history_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM optimization_history")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(history_count, 0);

        config.reload().await.unwrap();
        assert_eq!(config.snapshot().weight(ComponentId::PositionLow, Side::Long), 10);
    }
}
