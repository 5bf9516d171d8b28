use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::settings::BatchEntrySettings;
use crate::config::store::ConfigSnapshot;
use crate::database::Database;
use crate::exchange::{ExchangeClient, ExchangeError, OrderRequest, OrderResponse, PriceFeed};
use crate::notifications::{self, Notifier, Severity};
use crate::types::{
    BatchFill, CloseReason, MarginMode, Opportunity, Position, Side, Symbol, TimeFrame,
    VolatilityProfile,
};

const ORDER_RETRIES: u32 = 2;
const ORDER_RETRY_BACKOFF_MS: u64 = 500;

/// Rolling window of live price samples with nearest-rank percentiles.
/// Float math is fine here: percentiles steer order placement, they are
/// never persisted.
#[derive(Debug)]
pub struct PriceSampler {
    window: ChronoDuration,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl PriceSampler {
    pub fn new(window_seconds: i64) -> Self {
        Self {
            window: ChronoDuration::seconds(window_seconds),
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, price: Decimal) {
        if let Some(p) = price.to_f64() {
            self.samples.push_back((at, p));
        }
        let horizon = at - self.window;
        while self
            .samples
            .front()
            .is_some_and(|(t, _)| *t < horizon)
        {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile, p in (0, 100].
    pub fn percentile(&self, p: f64) -> Option<Decimal> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().map(|(_, v)| *v).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, sorted.len()) - 1;
        Decimal::from_f64(sorted[idx])
    }
}

/// Batch-1 price gate: longs buy the low band, shorts sell the high band.
fn batch1_favorable(side: Side, price: Decimal, sampler: &PriceSampler) -> bool {
    match side {
        Side::Long => sampler.percentile(30.0).is_some_and(|p30| price <= p30),
        Side::Short => sampler.percentile(70.0).is_some_and(|p70| price >= p70),
    }
}

/// Batch-2 natural-fill band. May be empty, in which case only the soft
/// deadline fills the batch.
fn batch2_band(side: Side, avg_entry: Decimal, sampler: &PriceSampler) -> Option<(Decimal, Decimal)> {
    match side {
        Side::Long => Some((avg_entry * dec!(0.997), sampler.percentile(40.0)?)),
        Side::Short => Some((sampler.percentile(60.0)?, avg_entry * dec!(1.003))),
    }
}

fn batch3_band(side: Side, sampler: &PriceSampler) -> Option<(Decimal, Decimal)> {
    match side {
        Side::Long => Some((sampler.percentile(30.0)?, sampler.percentile(50.0)?)),
        Side::Short => Some((sampler.percentile(50.0)?, sampler.percentile(70.0)?)),
    }
}

fn within_band(price: Decimal, band: Option<(Decimal, Decimal)>) -> bool {
    band.is_some_and(|(lo, hi)| lo <= hi && price >= lo && price <= hi)
}

/// Price has run more than `threshold_pct` against the intended direction
/// since the signal: longs watch for a falling knife, shorts the mirror.
fn adverse_move(side: Side, signal_price: Decimal, price: Decimal, threshold_pct: Decimal) -> bool {
    if signal_price.is_zero() {
        return false;
    }
    let move_pct = ((price - signal_price) / signal_price) * Decimal::from(100);
    match side {
        Side::Long => move_pct < -threshold_pct,
        Side::Short => move_pct > threshold_pct,
    }
}

/// Protective prices from the configured percentages, widened or tightened
/// by the volatility profile.
pub fn protective_prices(
    side: Side,
    avg_entry: Decimal,
    cfg: &ConfigSnapshot,
    symbol: &Symbol,
    volatility: VolatilityProfile,
) -> (Decimal, Decimal) {
    let (sl_pct, tp_pct) = cfg.risk_percentages(symbol, side);
    let multiplier = volatility.risk_multiplier();
    let sl = sl_pct * multiplier / Decimal::from(100);
    let tp = tp_pct * multiplier / Decimal::from(100);
    match side {
        Side::Long => (avg_entry * (Decimal::ONE - sl), avg_entry * (Decimal::ONE + tp)),
        Side::Short => (avg_entry * (Decimal::ONE + sl), avg_entry * (Decimal::ONE - tp)),
    }
}

/// One staged entry: drives an accepted opportunity through three batches
/// inside the time window and hands back the open position's id, or None
/// when the entry aborted without creating one.
pub struct EntryExecutor {
    db: Arc<Database>,
    exchange: Arc<dyn ExchangeClient>,
    feed: Arc<PriceFeed>,
    notifier: Arc<dyn Notifier>,
    settings: BatchEntrySettings,
    account_id: i64,
    margin_mode: MarginMode,
    position_size: Decimal,
    leverage: u32,
    signal_version: i64,
}

impl EntryExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        exchange: Arc<dyn ExchangeClient>,
        feed: Arc<PriceFeed>,
        notifier: Arc<dyn Notifier>,
        settings: BatchEntrySettings,
        account_id: i64,
        margin_mode: MarginMode,
        position_size: Decimal,
        leverage: u32,
        signal_version: i64,
    ) -> Self {
        Self {
            db,
            exchange,
            feed,
            notifier,
            settings,
            account_id,
            margin_mode,
            position_size,
            leverage,
            signal_version,
        }
    }

    pub async fn execute(
        &self,
        opportunity: Opportunity,
        cfg: Arc<ConfigSnapshot>,
    ) -> Result<Option<String>> {
        let symbol = opportunity.symbol.clone();
        let side = opportunity.side;
        let total_size = self.position_size * cfg.size_multiplier(&symbol, side);
        if total_size <= Decimal::ZERO {
            debug!("{} {}: size multiplier zeroed the entry", symbol, side);
            return Ok(None);
        }

        info!(
            "Entry start: {} {} score={} pattern={}",
            side,
            symbol,
            opportunity.score,
            opportunity.signal_pattern()
        );

        let started = Instant::now();
        let mut sampler = PriceSampler::new(self.settings.sampling_window_seconds);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.sampling_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let deadlines: Vec<Duration> = self
            .settings
            .batch_deadlines_minutes
            .iter()
            .map(|m| Duration::from_secs(*m as u64 * 60))
            .collect();
        let window = Duration::from_secs(self.settings.time_window_minutes as u64 * 60);
        let batch_gap = Duration::from_secs(self.settings.min_batch_gap_minutes as u64 * 60);

        let mut position: Option<Position> = None;
        let mut batch_idx = 0usize;
        let mut last_fill_at: Option<Instant> = None;
        let batches = self.settings.batch_ratios.len();

        loop {
            ticker.tick().await;
            let elapsed = started.elapsed();

            let Some(tick) = self.feed.latest(&symbol) else {
                debug!("{}: no live price yet", symbol);
                continue;
            };
            let price = tick.price;
            sampler.push(Utc::now(), price);

            // Guard: runaway move before the first fill aborts the entry.
            if position.is_none()
                && adverse_move(side, opportunity.current_price, price, self.settings.abort_adverse_pct)
            {
                let text = notifications::entry_aborted(&symbol, side, "adverse move before batch 1");
                self.notifier.send(Severity::Warning, text).await;
                return Ok(None);
            }

            let deadline = deadlines.get(batch_idx).copied().unwrap_or(window);
            let past_deadline = elapsed >= deadline || elapsed >= window;

            let gap_ok = last_fill_at
                .map(|t| t.elapsed() >= batch_gap)
                .unwrap_or(true);

            let natural = match batch_idx {
                0 => {
                    sampler.len() >= self.settings.min_samples
                        && batch1_favorable(side, price, &sampler)
                        && self.pullback_confirmed(&symbol, side).await
                }
                1 => {
                    let avg = position.as_ref().map(|p| p.avg_entry_price).unwrap_or(price);
                    gap_ok && within_band(price, batch2_band(side, avg, &sampler))
                }
                _ => gap_ok && within_band(price, batch3_band(side, &sampler)),
            };

            // Forced fills still respect the inter-batch gap, except at the
            // hard window edge.
            let forced = past_deadline && (gap_ok || elapsed >= window);
            if !natural && !forced {
                continue;
            }

            let ratio = self.settings.batch_ratios[batch_idx];
            let quantity = self
                .margin_mode
                .quantity_for_size(total_size * ratio, price);
            if quantity <= Decimal::ZERO {
                warn!("{}: computed zero batch quantity, aborting entry", symbol);
                return self.fail_entry(position, &opportunity).await;
            }

            let required_margin = self.margin_mode.margin(quantity, price, self.leverage);
            let account = self.db.get_account(self.account_id).await?;
            if account.available() < required_margin {
                warn!(
                    "{}: insufficient available margin ({} < {})",
                    symbol,
                    account.available(),
                    required_margin
                );
                return self.fail_entry(position, &opportunity).await;
            }

            match self.place_batch_order(&symbol, side, quantity, price, forced).await? {
                Some(response) => {
                    let fill = BatchFill {
                        price: response.filled_price,
                        quantity: response.filled_qty,
                        filled_at: Utc::now(),
                        forced,
                    };

                    if position.is_none() {
                        position = Some(self.create_position(&opportunity));
                    }
                    let p = position.as_mut().expect("position exists");
                    let margin_before = p.margin;
                    p.apply_fill(fill);

                    // Planned close is fixed at the first fill and carried.
                    if batch_idx == 0 {
                        let max_holding = cfg.adaptive_for(side).max_holding_minutes;
                        p.planned_close_time = Some(
                            p.entry_signal_time + ChronoDuration::minutes(max_holding),
                        );
                    }

                    let (sl, tp) = protective_prices(
                        side,
                        p.avg_entry_price,
                        &cfg,
                        &symbol,
                        opportunity.volatility,
                    );
                    p.stop_loss_price = Some(sl);
                    p.take_profit_price = Some(tp);

                    self.db.upsert_position(p).await?;
                    self.db
                        .freeze_margin(self.account_id, p.margin - margin_before)
                        .await?;

                    let text = notifications::entry_batch_filled(
                        &symbol,
                        side,
                        batch_idx + 1,
                        response.filled_price,
                        forced,
                    );
                    self.notifier.send(Severity::Info, text).await;

                    batch_idx += 1;
                    last_fill_at = Some(Instant::now());

                    if batch_idx >= batches {
                        let p = position.as_mut().expect("filled position");
                        p.mark_open(Utc::now());
                        self.db.upsert_position(p).await?;
                        let text = notifications::entry_complete(
                            &symbol,
                            side,
                            p.avg_entry_price,
                            p.quantity,
                        );
                        self.notifier.send(Severity::Info, text).await;
                        info!(
                            "Entry complete: {} {} qty={} avg={}",
                            side, symbol, p.quantity, p.avg_entry_price
                        );
                        return Ok(Some(p.id.clone()));
                    }
                }
                None => {
                    // Order pipeline exhausted for this batch.
                    return self.fail_entry(position, &opportunity).await;
                }
            }
        }
    }

    fn create_position(&self, opportunity: &Opportunity) -> Position {
        Position::new_building(
            self.account_id,
            self.margin_mode,
            opportunity.symbol.clone(),
            opportunity.side,
            self.signal_version,
            opportunity.score,
            opportunity.components.clone(),
            self.settings.batch_ratios.clone(),
            self.leverage,
            opportunity.signal_time,
        )
    }

    /// K-line pullback confirmation: among the freshest 15m and 5m candles
    /// at least one closes against the entry direction.
    async fn pullback_confirmed(&self, symbol: &Symbol, side: Side) -> bool {
        let counter = |c: &crate::types::Candle| match side {
            Side::Long => c.is_bearish(),
            Side::Short => c.is_bullish(),
        };

        for (tf, depth) in [(TimeFrame::M15, 2u32), (TimeFrame::M5, 3u32)] {
            match self.exchange.fetch_candles(symbol, tf, depth).await {
                Ok(candles) if candles.iter().any(counter) => return true,
                Ok(_) => {}
                Err(e) => {
                    debug!("{}: pullback check fetch failed on {}: {}", symbol, tf, e);
                }
            }
        }
        false
    }

    /// Limit order at the observed price, two retries on rejection, then a
    /// market fallback. Ambiguous outcomes poll status before anything is
    /// re-submitted; a forced fill goes straight to market.
    async fn place_batch_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        forced: bool,
    ) -> Result<Option<OrderResponse>> {
        let mut attempts: Vec<OrderRequest> = Vec::new();
        if !forced {
            for _ in 0..=ORDER_RETRIES {
                attempts.push(OrderRequest::limit(symbol.clone(), side, quantity, price));
            }
        }
        attempts.push(OrderRequest::market(symbol.clone(), side, quantity));

        let total = attempts.len();
        for (i, request) in attempts.into_iter().enumerate() {
            let client_id = request.client_id.clone();
            match self.exchange.place_order(request).await {
                Ok(response) if response.filled_qty > Decimal::ZERO => {
                    return Ok(Some(response));
                }
                Ok(response) => {
                    debug!("{}: order {} accepted but unfilled", symbol, response.order_id);
                }
                Err(ExchangeError::Ambiguous(reason)) => {
                    warn!("{}: ambiguous order outcome ({}), polling status", symbol, reason);
                    tokio::time::sleep(Duration::from_millis(ORDER_RETRY_BACKOFF_MS)).await;
                    if let Ok(status) = self.exchange.order_status(symbol, &client_id).await {
                        if status.ok && status.filled_qty > Decimal::ZERO {
                            return Ok(Some(status));
                        }
                    }
                }
                Err(ExchangeError::Rejected(reason)) => {
                    warn!(
                        "{}: order rejected ({}) attempt {}/{}",
                        symbol,
                        reason,
                        i + 1,
                        total
                    );
                }
                Err(e) => {
                    warn!("{}: order error: {}", symbol, e);
                }
            }
            if i + 1 < total {
                tokio::time::sleep(Duration::from_millis(ORDER_RETRY_BACKOFF_MS)).await;
            }
        }
        Ok(None)
    }

    /// Entry failed after exhausting the order pipeline. With no fills there
    /// is nothing to keep: record the attempt as a closed `entry_failed` row.
    /// With partial fills the position opens as-is and the exit monitor
    /// takes it from here.
    async fn fail_entry(
        &self,
        position: Option<Position>,
        opportunity: &Opportunity,
    ) -> Result<Option<String>> {
        match position {
            None => {
                let mut p = self.create_position(opportunity);
                p.close(
                    opportunity.current_price,
                    CloseReason::EntryFailed,
                    Decimal::ZERO,
                    Utc::now(),
                );
                self.db.upsert_position(&p).await?;
                let text = notifications::entry_aborted(
                    &opportunity.symbol,
                    opportunity.side,
                    "all batch orders rejected",
                );
                self.notifier.send(Severity::Warning, text).await;
                Ok(None)
            }
            Some(mut p) => {
                warn!(
                    "{} {}: batch {} failed, opening with partial size {}",
                    p.side,
                    p.symbol,
                    p.batch_filled.len() + 1,
                    p.quantity
                );
                p.mark_open(Utc::now());
                self.db.upsert_position(&p).await?;
                Ok(Some(p.id.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Settings;
    use crate::exchange::MockExchangeClient;
    use crate::notifications::BufferedNotifier;
    use crate::types::{Candle, PositionStatus};

    fn sampler_with(prices: &[f64]) -> PriceSampler {
        let mut sampler = PriceSampler::new(300);
        let base = Utc::now();
        for (i, p) in prices.iter().enumerate() {
            sampler.push(
                base + ChronoDuration::seconds(i as i64),
                Decimal::from_f64(*p).unwrap(),
            );
        }
        sampler
    }

    #[test]
    fn percentiles_nearest_rank() {
        let sampler = sampler_with(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0, 107.0, 108.0, 109.0]);
        assert_eq!(sampler.percentile(30.0), Some(dec!(102)));
        assert_eq!(sampler.percentile(50.0), Some(dec!(104)));
        assert_eq!(sampler.percentile(70.0), Some(dec!(106)));
        assert_eq!(sampler.percentile(100.0), Some(dec!(109)));
    }

    #[test]
    fn sampler_prunes_outside_window() {
        let mut sampler = PriceSampler::new(60);
        let base = Utc::now();
        sampler.push(base, dec!(100));
        sampler.push(base + ChronoDuration::seconds(30), dec!(101));
        sampler.push(base + ChronoDuration::seconds(90), dec!(102));
        assert_eq!(sampler.len(), 2);
    }

    #[test]
    fn batch1_gate_by_side() {
        let sampler = sampler_with(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0, 107.0, 108.0, 109.0]);
        assert!(batch1_favorable(Side::Long, dec!(101), &sampler));
        assert!(!batch1_favorable(Side::Long, dec!(104), &sampler));
        assert!(batch1_favorable(Side::Short, dec!(108), &sampler));
        assert!(!batch1_favorable(Side::Short, dec!(104), &sampler));
    }

    #[test]
    fn batch2_band_can_be_empty() {
        let sampler = sampler_with(&[100.0; 10]);
        // avg_entry 101: lower bound 100.697 > p40 100 - empty band.
        let band = batch2_band(Side::Long, dec!(101), &sampler);
        assert!(!within_band(dec!(100), band));
        assert!(!within_band(dec!(100.7), band));
        // avg_entry 100: band [99.7, 100] contains the price.
        assert!(within_band(dec!(100), batch2_band(Side::Long, dec!(100), &sampler)));
    }

    #[test]
    fn adverse_move_direction() {
        assert!(adverse_move(Side::Long, dec!(100), dec!(97.9), dec!(2)));
        assert!(!adverse_move(Side::Long, dec!(100), dec!(98.1), dec!(2)));
        assert!(!adverse_move(Side::Long, dec!(100), dec!(103), dec!(2)));
        assert!(adverse_move(Side::Short, dec!(100), dec!(102.1), dec!(2)));
        assert!(!adverse_move(Side::Short, dec!(100), dec!(97), dec!(2)));
    }

    #[test]
    fn protective_prices_orientation_and_volatility() {
        let cfg = test_cfg();
        // Adaptive defaults: long sl 3%, tp 5%, medium volatility.
        let (sl, tp) = protective_prices(
            Side::Long,
            dec!(100),
            &cfg,
            &Symbol::from("BTC/USDT"),
            VolatilityProfile::Medium,
        );
        assert_eq!(sl, dec!(97));
        assert_eq!(tp, dec!(105));

        // High volatility widens both by 1.3x.
        let (sl, tp) = protective_prices(
            Side::Long,
            dec!(100),
            &cfg,
            &Symbol::from("BTC/USDT"),
            VolatilityProfile::High,
        );
        assert_eq!(sl, dec!(96.1));
        assert_eq!(tp, dec!(106.5));

        let (sl, tp) = protective_prices(
            Side::Short,
            dec!(100),
            &cfg,
            &Symbol::from("BTC/USDT"),
            VolatilityProfile::Medium,
        );
        assert!(sl > dec!(100) && tp < dec!(100));
    }

    // ---- end-to-end executor runs under paused time ----

    fn test_settings() -> Settings {
        Settings {
            symbols: vec!["BTC/USDT".to_string()],
            symbols_coin: vec![],
            scan_interval_seconds: 300,
            position_size: dec!(300),
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

    fn test_cfg() -> ConfigSnapshot {
        ConfigSnapshot::bootstrap(&test_settings())
    }

    fn bearish_m15(symbol: &Symbol) -> Candle {
        Candle {
            symbol: symbol.clone(),
            timeframe: TimeFrame::M15,
            open_time: Utc::now(),
            open: dec!(100.5),
            high: dec!(100.6),
            low: dec!(99.9),
            close: dec!(100),
            volume: dec!(5),
            quote_volume: dec!(500),
        }
    }

    fn long_opportunity(price: Decimal) -> Opportunity {
        let mut components = crate::types::ComponentMap::new();
        components.insert(crate::types::ComponentId::PositionLow, 20);
        components.insert(crate::types::ComponentId::Trend1hBull, 20);
        Opportunity {
            symbol: Symbol::from("BTC/USDT"),
            side: Side::Long,
            score: 40,
            components,
            current_price: price,
            funding_rate: None,
            volatility: VolatilityProfile::Medium,
            signal_time: Utc::now(),
        }
    }

    fn filling_exchange() -> MockExchangeClient {
        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_fetch_candles()
            .returning(|symbol, _, _| Ok(vec![bearish_m15(symbol)]));
        exchange.expect_place_order().returning(|request| {
            Ok(OrderResponse {
                ok: true,
                order_id: request.client_id.clone(),
                filled_price: request.price.unwrap_or(dec!(100)),
                filled_qty: request.quantity,
                fee: dec!(0.01),
                reason: None,
            })
        });
        exchange
    }

    async fn executor_with(
        exchange: MockExchangeClient,
    ) -> (EntryExecutor, Arc<Database>, Arc<PriceFeed>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.ensure_account(1, MarginMode::Linear, dec!(10000)).await.unwrap();
        let feed = PriceFeed::new();
        let executor = EntryExecutor::new(
            Arc::clone(&db),
            Arc::new(exchange),
            Arc::clone(&feed),
            BufferedNotifier::new(),
            BatchEntrySettings::default(),
            1,
            MarginMode::Linear,
            dec!(300),
            5,
            3,
        );
        (executor, db, feed)
    }

    fn publish(feed: &PriceFeed, price: Decimal) {
        feed.publish(crate::exchange::PriceTick {
            symbol: Symbol::from("BTC/USDT"),
            price,
            at: Utc::now(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn three_natural_batches_open_a_position() {
        let (executor, db, feed) = executor_with(filling_exchange()).await;
        publish(&feed, dec!(100));

        let id = executor
            .execute(long_opportunity(dec!(100)), Arc::new(test_cfg()))
            .await
            .unwrap()
            .expect("position id");

        let p = db.get_position(&id).await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.batch_filled.len(), 3);
        assert!(p.batch_filled.iter().all(|f| !f.forced));
        assert_eq!(p.avg_entry_price, dec!(100));
        // 300 USDT over three batches at 100 = 3 units.
        assert_eq!(p.quantity, dec!(3));
        assert!(p.planned_close_time.is_some());
        assert!(p.protective_prices_valid());

        let account = db.get_account(1).await.unwrap();
        assert_eq!(account.frozen_margin, p.margin);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch2_band_forces_at_soft_deadline() {
        let (executor, db, feed) = executor_with(filling_exchange()).await;
        publish(&feed, dec!(100));

        let feed_clone = Arc::clone(&feed);
        let handle = tokio::spawn(async move {
            // After batch 1 has had time to fill, drop the price below the
            // batch-2 band floor so no natural fill can happen.
            tokio::time::sleep(Duration::from_secs(150)).await;
            publish(&feed_clone, dec!(99));
        });

        let started = Instant::now();
        let id = executor
            .execute(long_opportunity(dec!(100)), Arc::new(test_cfg()))
            .await
            .unwrap()
            .expect("position id");
        handle.await.unwrap();

        let p = db.get_position(&id).await.unwrap().unwrap();
        assert_eq!(p.batch_filled.len(), 3);
        assert!(!p.batch_filled[0].forced);
        assert!(p.batch_filled[1].forced, "batch 2 must be a deadline fill");
        // The forced fill waited for the 20-minute soft deadline.
        assert!(started.elapsed() >= Duration::from_secs(20 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn adverse_move_aborts_without_a_position() {
        let (executor, db, feed) = executor_with(filling_exchange()).await;
        // 3% below the signal price before any fill.
        publish(&feed, dec!(97));

        let outcome = executor
            .execute(long_opportunity(dec!(100)), Arc::new(test_cfg()))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(db.live_position_ids(1).await.unwrap().is_empty());
        assert!(db
            .positions_closed_since(Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn total_order_failure_records_entry_failed() {
        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_fetch_candles()
            .returning(|symbol, _, _| Ok(vec![bearish_m15(symbol)]));
        exchange
            .expect_place_order()
            .returning(|_| Err(ExchangeError::Rejected("insufficient margin".to_string())));

        let (executor, db, feed) = executor_with(exchange).await;
        publish(&feed, dec!(100));

        let outcome = executor
            .execute(long_opportunity(dec!(100)), Arc::new(test_cfg()))
            .await
            .unwrap();
        assert!(outcome.is_none());

        let closed = db
            .positions_closed_since(Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason, Some(CloseReason::EntryFailed));
        assert_eq!(closed[0].realized_pnl, Decimal::ZERO);
        assert_eq!(closed[0].quantity, Decimal::ZERO);
    }
}
