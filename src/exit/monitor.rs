use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::settings::SmartExitSettings;
use crate::config::store::ConfigStore;
use crate::database::Database;
use crate::exchange::{ExchangeClient, OrderRequest, PriceFeed};
use crate::notifications::{self, Notifier, Severity};
use crate::types::{CloseReason, Position, Side};

/// Staged loss-cutting ladder: (age minutes, tolerated drawdown pct).
/// The largest bucket at or under the position's age is binding.
const STAGED_TIMEOUTS: [(i64, Decimal, CloseReason); 4] = [
    (240, dec!(-1.0), CloseReason::StagedTimeout4h),
    (180, dec!(-1.5), CloseReason::StagedTimeout3h),
    (120, dec!(-2.0), CloseReason::StagedTimeout2h),
    (60, dec!(-2.5), CloseReason::StagedTimeout1h),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    Close(CloseReason),
    /// Grant the one-time extension past the planned close.
    Extend,
}

/// The priority-ordered exit rule ladder. Pure: all state comes in through
/// the position row, the price, the clock and the extension flag, so every
/// rule is directly testable.
pub struct ExitPolicy {
    settings: SmartExitSettings,
    min_holding_minutes: i64,
}

impl ExitPolicy {
    pub fn new(settings: SmartExitSettings, min_holding_minutes: i64) -> Self {
        Self {
            settings,
            min_holding_minutes,
        }
    }

    pub fn evaluate(
        &self,
        position: &Position,
        price: Decimal,
        now: DateTime<Utc>,
        extended: bool,
    ) -> ExitDecision {
        let pct = position.price_move_pct(price);
        let age = position.age_minutes(now);
        let peak = position.max_profit_pct.max(pct);

        // 1. Hard take-profit. Evaluated before the stop so a gap tick that
        // crosses both settles as a win.
        if let Some(tp) = position.take_profit_price {
            let crossed = match position.side {
                Side::Long => price >= tp,
                Side::Short => price <= tp,
            };
            if crossed {
                return ExitDecision::Close(CloseReason::TakeProfit);
            }
        }

        // 2. Hard stop-loss, gated by the minimum holding time.
        if let Some(sl) = position.stop_loss_price {
            let crossed = match position.side {
                Side::Long => price <= sl,
                Side::Short => price >= sl,
            };
            if crossed && age >= self.min_holding_minutes {
                return ExitDecision::Close(CloseReason::StopLoss);
            }
        }

        if self.settings.enabled {
            // 3./4. Trailing exits protect realized gains.
            let retrace = peak - pct;
            if peak >= self.settings.high_profit_trigger_pct
                && retrace >= self.settings.high_profit_retrace_pct
            {
                return ExitDecision::Close(CloseReason::TrailingHighProfit);
            }
            if peak >= self.settings.mid_profit_trigger_pct
                && peak < self.settings.high_profit_trigger_pct
                && retrace >= self.settings.mid_profit_retrace_pct
            {
                return ExitDecision::Close(CloseReason::TrailingMidProfit);
            }

            // 5. Modest profit late in the planned window: take it.
            if let Some(planned) = position.planned_duration_minutes() {
                let threshold =
                    Decimal::from(planned) * self.settings.quick_profit_age_fraction;
                if pct >= self.settings.quick_profit_pct && Decimal::from(age) >= threshold {
                    return ExitDecision::Close(CloseReason::QuickProfit);
                }
            }

            // 6. Staged timeout: tolerated drawdown tightens with age.
            for (minutes, limit, reason) in STAGED_TIMEOUTS {
                if age >= minutes {
                    if pct <= limit {
                        return ExitDecision::Close(reason);
                    }
                    break;
                }
            }

            // 7. Break-even catch: was in profit, now flat, out of time.
            if let Some(planned_close) = position.planned_close_time {
                if now >= planned_close
                    && position.max_profit_pct > self.settings.break_even_peak_pct
                    && pct >= self.settings.break_even_floor_pct
                    && pct <= self.settings.break_even_ceiling_pct
                {
                    return ExitDecision::Close(CloseReason::BreakEven);
                }
            }
        }

        // 8. Planned-close window: one extension, then an unconditional stop.
        if let Some(planned_close) = position.planned_close_time {
            if now > planned_close {
                return if extended {
                    ExitDecision::Close(CloseReason::PlannedCloseTimeout)
                } else {
                    ExitDecision::Extend
                };
            }
        }

        ExitDecision::Hold
    }
}

/// Everything one monitor task needs. Cloned per position.
#[derive(Clone)]
pub struct MonitorDeps {
    pub db: Arc<Database>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub feed: Arc<PriceFeed>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<ConfigStore>,
    pub settings: SmartExitSettings,
}

/// One cooperative task per open position. Reacts to price ticks from the
/// feed and to a watchdog timer so silent streams still get evaluated; ends
/// when the position closes or the cancel signal fires.
pub async fn run_monitor(position_id: String, deps: MonitorDeps, mut cancel: watch::Receiver<bool>) {
    let mut position = match deps.db.get_position(&position_id).await {
        Ok(Some(p)) if p.status.is_live() => p,
        Ok(_) => {
            debug!("Monitor {}: position gone or closed, exiting", position_id);
            return;
        }
        Err(e) => {
            warn!("Monitor {}: load failed: {}", position_id, e);
            return;
        }
    };

    let mut ticks = deps.feed.subscribe(&position.symbol);
    let mut watchdog =
        tokio::time::interval(Duration::from_secs(deps.settings.watchdog_seconds.max(1)));
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut extended = false;

    info!(
        "Monitor started: {} {} {} avg_entry={}",
        position.id, position.side, position.symbol, position.avg_entry_price
    );

    loop {
        let mut persist = false;
        let price = tokio::select! {
            tick = ticks.recv() => match tick {
                Ok(tick) => Some(tick.price),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Lagged receivers just pick up the latest price instead.
                    deps.feed.latest(&position.symbol).map(|t| t.price)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    ticks = deps.feed.subscribe(&position.symbol);
                    None
                }
            },
            _ = watchdog.tick() => {
                // Watchdog cadence doubles as the persistence cadence for
                // unrealized pnl and the profit peak.
                persist = true;
                deps.feed.latest(&position.symbol).map(|t| t.price)
            }
            _ = cancel.changed() => {
                let _ = deps.db.upsert_position(&position).await;
                debug!("Monitor {}: cancelled", position.id);
                return;
            }
        };

        let Some(price) = price else { continue };
        position.update_tick(price);
        if persist {
            if let Err(e) = deps.db.upsert_position(&position).await {
                warn!("Monitor {}: tick persist failed: {}", position.id, e);
            }
        }

        let snapshot = deps.config.snapshot();
        let min_holding = snapshot.adaptive_for(position.side).min_holding_minutes;
        let policy = ExitPolicy::new(deps.settings.clone(), min_holding);
        let now = Utc::now();

        match policy.evaluate(&position, price, now, extended) {
            ExitDecision::Hold => {}
            ExitDecision::Extend => {
                extended = true;
                let extension = ChronoDuration::minutes(deps.settings.extension_minutes);
                position.planned_close_time = position.planned_close_time.map(|t| t + extension);
                if let Err(e) = deps.db.upsert_position(&position).await {
                    warn!("Monitor {}: extension persist failed: {}", position.id, e);
                }
                info!(
                    "Monitor {}: planned close extended by {}min",
                    position.id, deps.settings.extension_minutes
                );
            }
            ExitDecision::Close(reason) => {
                match close_position(&deps, &mut position, price, reason, now).await {
                    Ok(true) => return,
                    Ok(false) => {
                        debug!("Monitor {}: already closed elsewhere, exiting", position.id);
                        return;
                    }
                    Err(e) => {
                        // Close failed (order or DB): keep monitoring, the
                        // next tick retries.
                        warn!("Monitor {}: close attempt failed: {}", position.id, e);
                    }
                }
            }
        }
    }
}

/// Close path: reduce-only market order, then the transactional DB close
/// (row + trade + account), then notification. Notification delivery is
/// fire-and-forget relative to trading state.
async fn close_position(
    deps: &MonitorDeps,
    position: &mut Position,
    price: Decimal,
    reason: CloseReason,
    now: DateTime<Utc>,
) -> Result<bool> {
    let order = OrderRequest::market(position.symbol.clone(), position.side, position.quantity)
        .closing();
    let fees = match deps.exchange.place_order(order).await {
        Ok(response) => response.fee,
        Err(e) => {
            anyhow::bail!("close order failed: {}", e);
        }
    };

    position.close(price, reason, fees, now);
    let closed = deps.db.close_position(position, fees).await?;
    if !closed {
        return Ok(false);
    }

    info!(
        "Position closed: {} {} {} pnl={} reason={}",
        position.id, position.side, position.symbol, position.realized_pnl, reason
    );
    let text = notifications::position_closed(
        &position.symbol,
        position.side,
        position.realized_pnl,
        reason,
    );
    let level = if position.realized_pnl < dec!(0) {
        Severity::Warning
    } else {
        Severity::Info
    };
    deps.notifier.send(level, text).await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Settings;
    use crate::exchange::{ExchangeError, MockExchangeClient, OrderResponse, PriceTick};
    use crate::notifications::BufferedNotifier;
    use crate::types::{BatchFill, ComponentId, ComponentMap, MarginMode, PositionStatus, Symbol};

    fn policy() -> ExitPolicy {
        ExitPolicy::new(SmartExitSettings::default(), 30)
    }

    fn open_long(entry: Decimal, opened_minutes_ago: i64, now: DateTime<Utc>) -> Position {
        let mut components = ComponentMap::new();
        components.insert(ComponentId::PositionLow, 20);
        components.insert(ComponentId::Trend1hBull, 20);
        let signal_time = now - ChronoDuration::minutes(opened_minutes_ago);
        let mut p = Position::new_building(
            1,
            MarginMode::Linear,
            Symbol::from("BTC/USDT"),
            Side::Long,
            3,
            40,
            components,
            vec![dec!(1)],
            5,
            signal_time,
        );
        p.apply_fill(BatchFill {
            price: entry,
            quantity: dec!(1),
            filled_at: signal_time,
            forced: false,
        });
        p.stop_loss_price = Some(entry * dec!(0.97));
        p.take_profit_price = Some(entry * dec!(1.05));
        p.planned_close_time = Some(signal_time + ChronoDuration::minutes(240));
        p.mark_open(signal_time);
        p
    }

    #[test]
    fn take_profit_beats_stop_loss_on_gap() {
        let now = Utc::now();
        let mut p = open_long(dec!(100), 120, now);
        // Pathological state after manual edits: SL above TP. A tick at 107
        // crosses both; priority must settle it as a take-profit.
        p.stop_loss_price = Some(dec!(110));
        p.take_profit_price = Some(dec!(105));
        assert_eq!(
            policy().evaluate(&p, dec!(107), now, false),
            ExitDecision::Close(CloseReason::TakeProfit)
        );
    }

    #[test]
    fn stop_loss_respects_min_holding() {
        let now = Utc::now();
        let young = open_long(dec!(100), 10, now);
        // Crossed but only 10 minutes old: held.
        assert_eq!(policy().evaluate(&young, dec!(96.5), now, false), ExitDecision::Hold);

        let seasoned = open_long(dec!(100), 45, now);
        assert_eq!(
            policy().evaluate(&seasoned, dec!(96.5), now, false),
            ExitDecision::Close(CloseReason::StopLoss)
        );
    }

    #[test]
    fn staged_timeout_scenario() {
        // LONG opened at 100 at t0; SL 97 / TP 105.
        let t0 = Utc::now();
        let mut p = open_long(dec!(100), 0, t0);
        p.open_time = Some(t0);

        // 11:00, price 99 (-1%): the 1h bucket tolerates down to -2.5%.
        let at_1h = t0 + ChronoDuration::minutes(60);
        assert_eq!(policy().evaluate(&p, dec!(99), at_1h, false), ExitDecision::Hold);

        // 11:30, price 97.4 (-2.6%): age past 1h, -2.6 <= -2.5 and the stop
        // at 97 is untouched.
        let at_90m = t0 + ChronoDuration::minutes(90);
        assert_eq!(
            policy().evaluate(&p, dec!(97.4), at_90m, false),
            ExitDecision::Close(CloseReason::StagedTimeout1h)
        );
    }

    #[test]
    fn staged_timeout_uses_largest_age_bucket() {
        let now = Utc::now();
        let p = open_long(dec!(100), 250, now);
        // At 4h10m a -1.2% drawdown breaches the -1.0% bucket even though
        // younger buckets would tolerate it.
        assert_eq!(
            policy().evaluate(&p, dec!(98.8), now, false),
            ExitDecision::Close(CloseReason::StagedTimeout4h)
        );
        // -0.9% survives.
        assert_eq!(policy().evaluate(&p, dec!(99.2), now, false), ExitDecision::Hold);
    }

    #[test]
    fn high_profit_trailing() {
        let now = Utc::now();
        let mut p = open_long(dec!(100), 60, now);
        p.update_tick(dec!(103.2)); // peak 3.2%
        assert_eq!(
            policy().evaluate(&p, dec!(102.6), now, false),
            ExitDecision::Close(CloseReason::TrailingHighProfit)
        );
        // A 0.3% retrace is within tolerance.
        assert_eq!(policy().evaluate(&p, dec!(102.9), now, false), ExitDecision::Hold);
    }

    #[test]
    fn mid_profit_trailing() {
        let now = Utc::now();
        let mut p = open_long(dec!(100), 60, now);
        p.update_tick(dec!(101.5)); // peak 1.5%
        assert_eq!(
            policy().evaluate(&p, dec!(101.05), now, false),
            ExitDecision::Close(CloseReason::TrailingMidProfit)
        );
        assert_eq!(policy().evaluate(&p, dec!(101.2), now, false), ExitDecision::Hold);
    }

    #[test]
    fn quick_profit_late_in_window() {
        let now = Utc::now();
        // 150 of 240 planned minutes is past the 60% mark.
        let p = open_long(dec!(100), 150, now);
        assert_eq!(
            policy().evaluate(&p, dec!(101.2), now, false),
            ExitDecision::Close(CloseReason::QuickProfit)
        );

        // Same profit at 40% of the window: held.
        let early = open_long(dec!(100), 96, now);
        assert_eq!(policy().evaluate(&early, dec!(101.2), now, false), ExitDecision::Hold);
    }

    #[test]
    fn break_even_catch_after_window() {
        let now = Utc::now();
        let mut p = open_long(dec!(100), 250, now);
        p.max_profit_pct = dec!(0.6);
        assert_eq!(
            policy().evaluate(&p, dec!(100.1), now, false),
            ExitDecision::Close(CloseReason::BreakEven)
        );

        // Never profitable: falls through to the extension instead.
        let mut never = open_long(dec!(100), 250, now);
        never.max_profit_pct = dec!(0.1);
        assert_eq!(policy().evaluate(&never, dec!(100.1), now, false), ExitDecision::Extend);
    }

    #[test]
    fn extension_granted_once_then_forced() {
        let now = Utc::now();
        let p = open_long(dec!(100), 250, now);
        // 250min > 240 planned; price flat-negative so no other rule fires.
        assert_eq!(policy().evaluate(&p, dec!(99.8), now, false), ExitDecision::Extend);
        assert_eq!(
            policy().evaluate(&p, dec!(99.8), now, true),
            ExitDecision::Close(CloseReason::PlannedCloseTimeout)
        );
    }

    #[test]
    fn short_positions_mirror() {
        let now = Utc::now();
        let mut p = open_long(dec!(100), 60, now);
        p.side = Side::Short;
        p.stop_loss_price = Some(dec!(103));
        p.take_profit_price = Some(dec!(96));
        assert_eq!(
            policy().evaluate(&p, dec!(95.5), now, false),
            ExitDecision::Close(CloseReason::TakeProfit)
        );
        assert_eq!(
            policy().evaluate(&p, dec!(103.5), now, false),
            ExitDecision::Close(CloseReason::StopLoss)
        );
    }

    // ---- monitor task integration ----

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

    async fn deps_with(exchange: MockExchangeClient) -> (MonitorDeps, Arc<Database>, Arc<PriceFeed>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.ensure_account(1, MarginMode::Linear, dec!(10000)).await.unwrap();
        let feed = PriceFeed::new();
        let config = Arc::new(ConfigStore::new(Arc::clone(&db), settings(), vec![1]));
        let deps = MonitorDeps {
            db: Arc::clone(&db),
            exchange: Arc::new(exchange),
            feed: Arc::clone(&feed),
            notifier: BufferedNotifier::new(),
            config,
            settings: SmartExitSettings::default(),
        };
        (deps, db, feed)
    }

    fn closing_exchange() -> MockExchangeClient {
        let mut exchange = MockExchangeClient::new();
        exchange.expect_place_order().returning(|request| {
            Ok(OrderResponse {
                ok: true,
                order_id: request.client_id.clone(),
                filled_price: dec!(105),
                filled_qty: request.quantity,
                fee: dec!(0.05),
                reason: None,
            })
        });
        exchange
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_closes_on_take_profit_tick() {
        let (deps, db, feed) = deps_with(closing_exchange()).await;
        let now = Utc::now();
        let p = open_long(dec!(100), 60, now);
        db.upsert_position(&p).await.unwrap();
        db.freeze_margin(1, p.margin).await.unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor(p.id.clone(), deps, cancel_rx));

        // Let the monitor subscribe, then gap through the take-profit.
        tokio::time::sleep(Duration::from_millis(50)).await;
        feed.publish(PriceTick {
            symbol: Symbol::from("BTC/USDT"),
            price: dec!(105.4),
            at: Utc::now(),
        });

        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("monitor should end after closing")
            .unwrap();

        let closed = db.get_position(&p.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
        // (105.4 - 100) * 1 - 0.05 fee
        assert_eq!(closed.realized_pnl, dec!(5.35));

        let account = db.get_account(1).await.unwrap();
        assert_eq!(account.balance, dec!(10005.35));
        assert_eq!(account.frozen_margin, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_watchdog_fires_without_ticks() {
        let (deps, db, feed) = deps_with(closing_exchange()).await;
        let now = Utc::now();
        let p = open_long(dec!(100), 60, now);
        db.upsert_position(&p).await.unwrap();

        // Latest price already past TP, but published before the monitor
        // subscribes - only the watchdog path can see it.
        feed.publish(PriceTick {
            symbol: Symbol::from("BTC/USDT"),
            price: dec!(106),
            at: Utc::now(),
        });

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor(p.id.clone(), deps, cancel_rx));

        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("watchdog should close the position")
            .unwrap();

        let closed = db.get_position(&p.id).await.unwrap().unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_cancellation_unwinds_cleanly() {
        let (deps, db, _feed) = deps_with(MockExchangeClient::new()).await;
        let now = Utc::now();
        let p = open_long(dec!(100), 10, now);
        db.upsert_position(&p).await.unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor(p.id.clone(), deps, cancel_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("cancel should end the monitor")
            .unwrap();

        // Still live: cancellation never closes positions.
        let live = db.get_position(&p.id).await.unwrap().unwrap();
        assert_eq!(live.status, PositionStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_close_order_keeps_monitoring() {
        let mut exchange = MockExchangeClient::new();
        let mut attempts = 0;
        exchange.expect_place_order().returning(move |request| {
            attempts += 1;
            if attempts == 1 {
                Err(ExchangeError::Rejected("busy".to_string()))
            } else {
                Ok(OrderResponse {
                    ok: true,
                    order_id: request.client_id.clone(),
                    filled_price: dec!(105.4),
                    filled_qty: request.quantity,
                    fee: dec!(0.05),
                    reason: None,
                })
            }
        });

        let (deps, db, feed) = deps_with(exchange).await;
        let now = Utc::now();
        let p = open_long(dec!(100), 60, now);
        db.upsert_position(&p).await.unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_monitor(p.id.clone(), deps, cancel_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        feed.publish(PriceTick {
            symbol: Symbol::from("BTC/USDT"),
            price: dec!(105.4),
            at: Utc::now(),
        });

        // First close attempt is rejected; the watchdog retries and wins.
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("retry should close eventually")
            .unwrap();

        let closed = db.get_position(&p.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
    }
}
