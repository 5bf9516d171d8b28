pub mod scanner;

pub use scanner::{ScanSummary, Scanner};

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::admission::AdmissionFilter;
use crate::config::settings::Settings;
use crate::config::store::ConfigStore;
use crate::database::Database;
use crate::entry::EntryExecutor;
use crate::exchange::{ExchangeClient, PriceFeed};
use crate::exit::monitor::{run_monitor, MonitorDeps};
use crate::exit::supervisor::{new_monitor_map, MonitorHandle, MonitorSpawner, Supervisor};
use crate::market::MarketDataReader;
use crate::notifications::Notifier;
use crate::scoring::SIGNAL_VERSION;
use crate::types::{MarginMode, Symbol};

/// Spawns real exit monitors for the supervisor.
struct EngineMonitorSpawner {
    deps: MonitorDeps,
}

impl MonitorSpawner for EngineMonitorSpawner {
    fn spawn(&self, position_id: String) -> MonitorHandle {
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_monitor(position_id, self.deps.clone(), cancel_rx));
        MonitorHandle { cancel, task }
    }
}

pub struct EngineHandles {
    pub scanner: JoinHandle<Result<()>>,
    pub supervisor: JoinHandle<()>,
}

/// One account's full Scanner/Entry/Monitor/Supervisor tree. The linear
/// and inverse engines are two instances of this struct sharing only the
/// price feed and market reader.
pub struct TradingEngine {
    pub account_id: i64,
    pub margin_mode: MarginMode,
    symbols: Vec<Symbol>,
    settings: Settings,
    db: Arc<Database>,
    exchange: Arc<dyn ExchangeClient>,
    reader: Arc<MarketDataReader>,
    feed: Arc<PriceFeed>,
    config: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
    initial_balance: Decimal,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: i64,
        margin_mode: MarginMode,
        symbols: Vec<Symbol>,
        settings: Settings,
        db: Arc<Database>,
        exchange: Arc<dyn ExchangeClient>,
        reader: Arc<MarketDataReader>,
        feed: Arc<PriceFeed>,
        config: Arc<ConfigStore>,
        notifier: Arc<dyn Notifier>,
        initial_balance: Decimal,
    ) -> Self {
        Self {
            account_id,
            margin_mode,
            symbols,
            settings,
            db,
            exchange,
            reader,
            feed,
            config,
            notifier,
            initial_balance,
        }
    }

    /// Bring the account tree up: reconcile account aggregates, register
    /// monitors for everything already live, then start the supervisor and
    /// the scanner.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<EngineHandles> {
        self.db
            .ensure_account(self.account_id, self.margin_mode, self.initial_balance)
            .await?;
        self.db.recompute_account_aggregates(self.account_id).await?;

        let monitors = new_monitor_map();
        let monitor_deps = MonitorDeps {
            db: Arc::clone(&self.db),
            exchange: Arc::clone(&self.exchange),
            feed: Arc::clone(&self.feed),
            notifier: Arc::clone(&self.notifier),
            config: Arc::clone(&self.config),
            settings: self.settings.smart_exit.clone(),
        };
        let spawner = Arc::new(EngineMonitorSpawner {
            deps: monitor_deps,
        });

        let supervisor = Supervisor::new(
            self.account_id,
            Arc::clone(&self.db),
            Arc::clone(&monitors),
            spawner,
            Arc::clone(&self.notifier),
            self.settings.smart_exit.extension_minutes,
        );
        let recovered = supervisor.register_startup_monitors().await?;
        if recovered > 0 {
            info!(
                "Account {}: recovered {} live positions at startup",
                self.account_id, recovered
            );
        }
        let supervisor_handle = tokio::spawn(supervisor.run(shutdown.clone()));

        let admission = Arc::new(AdmissionFilter::new(
            Arc::clone(&self.db),
            self.account_id,
            self.settings.max_open_positions,
            self.settings.cooldown_minutes,
            SIGNAL_VERSION,
        ));
        let entry = Arc::new(EntryExecutor::new(
            Arc::clone(&self.db),
            Arc::clone(&self.exchange),
            Arc::clone(&self.feed),
            Arc::clone(&self.notifier),
            self.settings.batch_entry.clone(),
            self.account_id,
            self.margin_mode,
            self.settings.position_size,
            self.settings.leverage,
            SIGNAL_VERSION,
        ));
        let scanner = Scanner::new(
            self.account_id,
            self.symbols.clone(),
            Arc::clone(&self.reader),
            Arc::clone(&self.feed),
            Arc::clone(&self.config),
            admission,
            entry,
            self.settings.scan_interval_seconds,
        );
        let scanner_handle = tokio::spawn(scanner.run(shutdown));

        info!(
            "Engine started: account {} ({}) with {} symbols",
            self.account_id,
            self.margin_mode,
            self.symbols.len()
        );
        Ok(EngineHandles {
            scanner: scanner_handle,
            supervisor: supervisor_handle,
        })
    }
}
