use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::database::Database;
use crate::market::regime::RegimeSnapshot;
use crate::types::{ComponentId, Side, Symbol};

use super::settings::{AdaptiveSettings, AdaptiveSideSettings, Settings};

const REFRESH_INTERVAL_SECS: u64 = 60;
/// Base acceptance score before regime adjustment.
pub const BASE_SCORE_THRESHOLD: i32 = 35;

pub const WEIGHT_MIN: i32 = 5;
pub const WEIGHT_MAX: i32 = 30;
pub const DEFAULT_WEIGHT: i32 = 10;

#[derive(Debug, Clone)]
pub struct ScoringWeightRow {
    pub component: ComponentId,
    pub weight_long: i32,
    pub weight_short: i32,
    pub base_weight: i32,
    pub performance_score: Decimal,
}

#[derive(Debug, Clone)]
pub struct SymbolRiskParamsRow {
    pub symbol: Symbol,
    pub long_tp_pct: Decimal,
    pub long_sl_pct: Decimal,
    pub short_tp_pct: Decimal,
    pub short_sl_pct: Decimal,
    pub position_multiplier: Decimal,
    pub win_rate: Decimal,
    pub total_trades: i64,
    pub total_pnl: Decimal,
}

#[derive(Debug, Clone)]
pub struct SymbolRatingRow {
    pub symbol: Symbol,
    pub level: i64,
    pub total_pnl: Decimal,
    pub hard_stop_count: i64,
}

impl SymbolRatingRow {
    pub fn size_multiplier(&self) -> Decimal {
        match self.level {
            0 => Decimal::ONE,
            1 => dec!(0.25),
            2 => dec!(0.125),
            _ => Decimal::ZERO,
        }
    }

    pub fn forbids_opening(&self) -> bool {
        self.level >= 3
    }
}

#[derive(Debug, Clone)]
pub struct SignalBlacklistRow {
    pub pattern: String,
    pub side: Side,
    pub reason: String,
}

/// Immutable view of all hot-reloadable configuration. Scanners pin one
/// snapshot per iteration; the optimizer publishes a fresh one through
/// `ConfigStore::reload` after committing its mutations.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub weights: HashMap<ComponentId, ScoringWeightRow>,
    pub risk_params: HashMap<Symbol, SymbolRiskParamsRow>,
    pub ratings: HashMap<Symbol, SymbolRatingRow>,
    pub trading_blacklist: HashSet<Symbol>,
    pub signal_blacklist: Vec<SignalBlacklistRow>,
    pub adaptive: AdaptiveSettings,
    pub trading_enabled_default: bool,
    pub trading_control: HashMap<i64, bool>,
    pub regime: RegimeSnapshot,
    pub loaded_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn bootstrap(settings: &Settings) -> Self {
        Self {
            weights: HashMap::new(),
            risk_params: HashMap::new(),
            ratings: HashMap::new(),
            trading_blacklist: HashSet::new(),
            signal_blacklist: Vec::new(),
            adaptive: settings.adaptive.clone(),
            trading_enabled_default: settings.trading_enabled,
            trading_control: HashMap::new(),
            regime: RegimeSnapshot::neutral(Utc::now()),
            loaded_at: Utc::now(),
        }
    }

    pub fn weight(&self, component: ComponentId, side: Side) -> i32 {
        self.weights
            .get(&component)
            .map(|row| match side {
                Side::Long => row.weight_long,
                Side::Short => row.weight_short,
            })
            .unwrap_or(DEFAULT_WEIGHT)
            .clamp(WEIGHT_MIN, WEIGHT_MAX)
    }

    pub fn acceptance_threshold(&self, side: Side) -> i32 {
        BASE_SCORE_THRESHOLD + self.regime.threshold_adjustment_for(side)
    }

    pub fn adaptive_for(&self, side: Side) -> &AdaptiveSideSettings {
        match side {
            Side::Long => &self.adaptive.long,
            Side::Short => &self.adaptive.short,
        }
    }

    /// (stop-loss pct, take-profit pct) from per-symbol risk params if
    /// present, otherwise the adaptive side defaults.
    pub fn risk_percentages(&self, symbol: &Symbol, side: Side) -> (Decimal, Decimal) {
        if let Some(params) = self.risk_params.get(symbol) {
            match side {
                Side::Long => (params.long_sl_pct, params.long_tp_pct),
                Side::Short => (params.short_sl_pct, params.short_tp_pct),
            }
        } else {
            let adaptive = self.adaptive_for(side);
            (adaptive.stop_loss_pct, adaptive.take_profit_pct)
        }
    }

    /// Combined position-size multiplier: symbol rating x per-symbol risk
    /// multiplier x adaptive side multiplier x regime alignment.
    pub fn size_multiplier(&self, symbol: &Symbol, side: Side) -> Decimal {
        let rating = self
            .ratings
            .get(symbol)
            .map(|r| r.size_multiplier())
            .unwrap_or(Decimal::ONE);
        let risk = self
            .risk_params
            .get(symbol)
            .map(|p| p.position_multiplier)
            .unwrap_or(Decimal::ONE);
        rating * risk * self.adaptive_for(side).position_size_multiplier * self.regime.size_multiplier_for(side)
    }

    pub fn trading_enabled(&self, account_id: i64) -> bool {
        self.trading_control
            .get(&account_id)
            .copied()
            .unwrap_or(self.trading_enabled_default)
    }

    pub fn symbol_rating_forbids(&self, symbol: &Symbol) -> bool {
        self.ratings
            .get(symbol)
            .map(|r| r.forbids_opening())
            .unwrap_or(false)
    }

    pub fn is_symbol_blacklisted(&self, symbol: &Symbol) -> bool {
        self.trading_blacklist.contains(symbol)
    }

    /// Signal-blacklist check. Matching is set-equality on the sorted
    /// pattern string, never substring: `a+b` does not match `a+b+c`.
    pub fn is_signal_blacklisted(&self, pattern: &str, side: Side) -> bool {
        self.signal_blacklist
            .iter()
            .any(|row| row.side == side && row.pattern == pattern)
    }
}

/// Read-copy-update holder for the hot configuration. Readers clone an Arc
/// pointer; `reload` builds a complete snapshot off to the side and swaps it
/// in one write, so no reader ever observes a half-updated config.
pub struct ConfigStore {
    db: Arc<Database>,
    settings: Settings,
    account_ids: Vec<i64>,
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    notifier: Option<Arc<dyn crate::notifications::Notifier>>,
}

impl ConfigStore {
    pub fn new(db: Arc<Database>, settings: Settings, account_ids: Vec<i64>) -> Self {
        let bootstrap = Arc::new(ConfigSnapshot::bootstrap(&settings));
        Self {
            db,
            settings,
            account_ids,
            snapshot: RwLock::new(bootstrap),
            notifier: None,
        }
    }

    /// Attach a notifier so operator toggles of the kill switch are
    /// surfaced when a refresh picks them up.
    pub fn with_notifier(mut self, notifier: Arc<dyn crate::notifications::Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot.read().expect("config snapshot lock poisoned"))
    }

    /// Rebuild the snapshot from the database and publish it atomically.
    pub async fn reload(&self) -> Result<()> {
        let weights = self.db.load_scoring_weights().await?;
        let risk_params = self.db.load_symbol_risk_params().await?;
        let ratings = self.db.load_symbol_ratings().await?;
        let trading_blacklist = self.db.load_trading_blacklist().await?;
        let signal_blacklist = self.db.load_signal_blacklist().await?;

        let mut trading_control = HashMap::new();
        for account_id in &self.account_ids {
            if let Some(enabled) = self.db.trading_control(*account_id).await? {
                trading_control.insert(*account_id, enabled);
            }
        }

        let regime = self
            .db
            .latest_regime()
            .await?
            .unwrap_or_else(|| RegimeSnapshot::neutral(Utc::now()));

        let next = ConfigSnapshot {
            weights: weights.into_iter().map(|w| (w.component, w)).collect(),
            risk_params: risk_params
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
            ratings: ratings.into_iter().map(|r| (r.symbol.clone(), r)).collect(),
            trading_blacklist: trading_blacklist.into_iter().collect(),
            signal_blacklist,
            adaptive: self.settings.adaptive.clone(),
            trading_enabled_default: self.settings.trading_enabled,
            trading_control,
            regime,
            loaded_at: Utc::now(),
        };

        let previous = self.snapshot();
        *self.snapshot.write().expect("config snapshot lock poisoned") = Arc::new(next);

        if let Some(notifier) = &self.notifier {
            for account_id in &self.account_ids {
                let was = previous.trading_enabled(*account_id);
                let is = self.snapshot().trading_enabled(*account_id);
                if was != is {
                    notifier
                        .send(
                            crate::notifications::Severity::Warning,
                            crate::notifications::trading_toggled(*account_id, is),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Periodic refresh so operator edits land without waiting for the
    /// optimizer's explicit reload.
    pub async fn run_refresh(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(REFRESH_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!("Config refresh failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Config refresh task shutting down");
                    return;
                }
            }
        }
    }
}
