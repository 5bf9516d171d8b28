use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Startup configuration, read once from `config.toml` merged with
/// `PERP_BOT_*` environment variables. Everything mutable at runtime lives
/// in the database behind the config store instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Linear (USDT-margined) universe, e.g. "BTC/USDT".
    pub symbols: Vec<String>,
    /// Inverse (coin-margined) universe, e.g. "BTC/USD". Empty disables the
    /// inverse engine.
    #[serde(default)]
    pub symbols_coin: Vec<String>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    /// Target notional per position (USDT) for linear, contracts for coin.
    pub position_size: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub trading_enabled: bool,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub batch_entry: BatchEntrySettings,
    #[serde(default)]
    pub smart_exit: SmartExitSettings,
    #[serde(default)]
    pub adaptive: AdaptiveSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub exchange: ExchangeSettings,
}

fn default_scan_interval() -> u64 {
    300
}
fn default_leverage() -> u32 {
    5
}
fn default_max_open_positions() -> usize {
    10
}
fn default_cooldown_minutes() -> i64 {
    15
}
fn default_database_url() -> String {
    "sqlite:./perp_bot.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntrySettings {
    pub enabled: bool,
    pub batch_ratios: Vec<Decimal>,
    pub time_window_minutes: i64,
    /// Soft deadlines for batches 1..3, minutes from signal time.
    pub batch_deadlines_minutes: Vec<i64>,
    pub sampling_window_seconds: i64,
    pub sampling_interval_seconds: u64,
    pub min_samples: usize,
    /// Abort the whole entry if price runs this far against us before
    /// batch 1 fills.
    pub abort_adverse_pct: Decimal,
    pub min_batch_gap_minutes: i64,
}

impl Default for BatchEntrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_ratios: vec![dec!(0.3), dec!(0.3), dec!(0.4)],
            time_window_minutes: 30,
            batch_deadlines_minutes: vec![15, 20, 28],
            sampling_window_seconds: 300,
            sampling_interval_seconds: 10,
            min_samples: 10,
            abort_adverse_pct: dec!(2),
            min_batch_gap_minutes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartExitSettings {
    pub enabled: bool,
    pub high_profit_trigger_pct: Decimal,
    pub high_profit_retrace_pct: Decimal,
    pub mid_profit_trigger_pct: Decimal,
    pub mid_profit_retrace_pct: Decimal,
    pub quick_profit_pct: Decimal,
    pub quick_profit_age_fraction: Decimal,
    pub break_even_peak_pct: Decimal,
    pub break_even_floor_pct: Decimal,
    pub break_even_ceiling_pct: Decimal,
    pub extension_minutes: i64,
    pub watchdog_seconds: u64,
}

impl Default for SmartExitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            high_profit_trigger_pct: dec!(3.0),
            high_profit_retrace_pct: dec!(0.5),
            mid_profit_trigger_pct: dec!(1.0),
            mid_profit_retrace_pct: dec!(0.4),
            quick_profit_pct: dec!(1.0),
            quick_profit_age_fraction: dec!(0.6),
            break_even_peak_pct: dec!(0.3),
            break_even_floor_pct: dec!(-0.5),
            break_even_ceiling_pct: dec!(0.2),
            extension_minutes: 30,
            watchdog_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSideSettings {
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub min_holding_minutes: i64,
    pub max_holding_minutes: i64,
    pub position_size_multiplier: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    #[serde(default = "AdaptiveSettings::default_long")]
    pub long: AdaptiveSideSettings,
    #[serde(default = "AdaptiveSettings::default_short")]
    pub short: AdaptiveSideSettings,
}

impl AdaptiveSettings {
    fn default_long() -> AdaptiveSideSettings {
        AdaptiveSideSettings {
            stop_loss_pct: dec!(3.0),
            take_profit_pct: dec!(5.0),
            min_holding_minutes: 30,
            max_holding_minutes: 240,
            position_size_multiplier: dec!(1.0),
        }
    }

    fn default_short() -> AdaptiveSideSettings {
        AdaptiveSideSettings {
            stop_loss_pct: dec!(3.0),
            take_profit_pct: dec!(4.0),
            min_holding_minutes: 30,
            max_holding_minutes: 180,
            position_size_multiplier: dec!(1.0),
        }
    }
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            long: Self::default_long(),
            short: Self::default_short(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub enabled: bool,
    /// Wall-clock "HH:MM" run time.
    pub run_at: String,
    pub dry_run: bool,
    pub lookback_days: i64,
    /// Where dry-run diffs and ERROR files land.
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
}

fn default_report_dir() -> String {
    ".".to_string()
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            run_at: "02:00".to_string(),
            dry_run: false,
            lookback_days: 7,
            report_dir: default_report_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Token-bucket capacities per endpoint class, requests per second.
    #[serde(default = "default_market_rps")]
    pub market_data_rps: u32,
    #[serde(default = "default_order_rps")]
    pub order_rps: u32,
}

fn default_market_rps() -> u32 {
    10
}
fn default_order_rps() -> u32 {
    5
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.example-exchange.com".to_string(),
            ws_url: "wss://fstream.example-exchange.com/ws".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            market_data_rps: default_market_rps(),
            order_rps: default_order_rps(),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PERP_BOT").separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?
            .try_deserialize()
            .context("configuration did not match the expected schema")?;

        if let Err(errors) = settings.validate() {
            anyhow::bail!("invalid configuration: {}", errors.join(", "));
        }
        Ok(settings)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.is_empty() && self.symbols_coin.is_empty() {
            errors.push("at least one of symbols / symbols_coin must be non-empty".to_string());
        }
        if self.position_size <= Decimal::ZERO {
            errors.push("position_size must be > 0".to_string());
        }
        if self.leverage == 0 || self.leverage > 100 {
            errors.push("leverage must be between 1 and 100".to_string());
        }
        if self.max_open_positions == 0 {
            errors.push("max_open_positions must be > 0".to_string());
        }

        let ratio_sum: Decimal = self.batch_entry.batch_ratios.iter().sum();
        if self.batch_entry.batch_ratios.is_empty() || (ratio_sum - Decimal::ONE).abs() > dec!(0.001) {
            errors.push("batch_entry.batch_ratios must sum to 1.0".to_string());
        }
        if self.batch_entry.batch_deadlines_minutes.len() != self.batch_entry.batch_ratios.len() {
            errors.push("batch_entry.batch_deadlines_minutes must match batch_ratios length".to_string());
        }
        if self
            .batch_entry
            .batch_deadlines_minutes
            .last()
            .is_some_and(|last| *last > self.batch_entry.time_window_minutes)
        {
            errors.push("final batch deadline exceeds the entry time window".to_string());
        }

        if parse_run_at(&self.optimizer.run_at).is_none() {
            errors.push(format!("optimizer.run_at '{}' is not HH:MM", self.optimizer.run_at));
        }

        for side in [&self.adaptive.long, &self.adaptive.short] {
            if side.stop_loss_pct <= Decimal::ZERO || side.take_profit_pct <= Decimal::ZERO {
                errors.push("adaptive stop_loss_pct / take_profit_pct must be > 0".to_string());
            }
            if side.max_holding_minutes <= side.min_holding_minutes {
                errors.push("adaptive max_holding_minutes must exceed min_holding_minutes".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// "HH:MM" → (hour, minute).
pub fn parse_run_at(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
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
            batch_entry: BatchEntrySettings::default(),
            smart_exit: SmartExitSettings::default(),
            adaptive: AdaptiveSettings::default(),
            optimizer: OptimizerSettings::default(),
            exchange: ExchangeSettings::default(),
        }
    }

    #[test]
    fn default_settings_validate() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn batch_ratios_must_sum_to_one() {
        let mut s = base_settings();
        s.batch_entry.batch_ratios = vec![dec!(0.5), dec!(0.6)];
        s.batch_entry.batch_deadlines_minutes = vec![15, 20];
        let errors = s.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("sum to 1.0")));
    }

    #[test]
    fn run_at_parsing() {
        assert_eq!(parse_run_at("02:00"), Some((2, 0)));
        assert_eq!(parse_run_at("23:59"), Some((23, 59)));
        assert_eq!(parse_run_at("24:00"), None);
        assert_eq!(parse_run_at("0200"), None);
    }

    #[test]
    fn empty_universe_rejected() {
        let mut s = base_settings();
        s.symbols.clear();
        assert!(s.validate().is_err());
    }
}
