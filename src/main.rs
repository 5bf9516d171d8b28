mod admission;
mod config;
mod database;
mod engine;
mod entry;
mod exchange;
mod exit;
mod market;
mod notifications;
mod optimizer;
mod scoring;
mod types;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use config::settings::Settings;
use config::store::ConfigStore;
use database::Database;
use engine::TradingEngine;
use exchange::{FuturesRestClient, PriceFeed, PriceStream};
use market::regime::RegimeTracker;
use market::MarketDataReader;
use notifications::{BufferedNotifier, Notifier, Severity};
use optimizer::Optimizer;
use types::{MarginMode, Symbol};

const LINEAR_ACCOUNT_ID: i64 = 1;
const INVERSE_ACCOUNT_ID: i64 = 2;

const INITIAL_BALANCE: Decimal = dec!(10000);

#[derive(Parser)]
#[command(name = "perp-futures-bot")]
#[command(version = "0.1.0")]
#[command(about = "Autonomous perpetual-futures trading engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading engine (linear and, if configured, inverse)
    Run,
    /// Run the adaptive optimizer once and exit
    Optimize {
        /// Log the would-be diff to a file without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show account balances and live position counts
    Status,
}

fn main() {
    let exit_code = run_cli();
    std::process::exit(exit_code);
}

fn run_cli() -> i32 {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install tracing subscriber");
        return 1;
    }

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Fatal: {:#}", e);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Fatal: could not start runtime: {}", e);
            return 1;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Run => run_engine(settings).await,
            Commands::Optimize { dry_run } => run_optimizer_once(settings, dry_run).await,
            Commands::Status => show_status(settings).await,
        }
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {:#}", e);
            1
        }
    }
}

async fn run_engine(settings: Settings) -> Result<i32> {
    info!("Perp futures engine v0.1.0 starting");

    let db = Arc::new(Database::new(&settings.database_url).await?);
    let notifier: Arc<dyn Notifier> = BufferedNotifier::new();

    let mut account_ids = vec![LINEAR_ACCOUNT_ID];
    let inverse_enabled = !settings.symbols_coin.is_empty();
    if inverse_enabled {
        account_ids.push(INVERSE_ACCOUNT_ID);
    }

    let config = Arc::new(
        ConfigStore::new(Arc::clone(&db), settings.clone(), account_ids)
            .with_notifier(Arc::clone(&notifier)),
    );
    config.reload().await?;

    let exchange: Arc<dyn exchange::ExchangeClient> =
        Arc::new(FuturesRestClient::new(&settings.exchange));
    let reader = Arc::new(MarketDataReader::new(Arc::clone(&exchange)));

    let linear_symbols: Vec<Symbol> =
        settings.symbols.iter().map(|s| Symbol::new(s.clone())).collect();
    let inverse_symbols: Vec<Symbol> = settings
        .symbols_coin
        .iter()
        .map(|s| Symbol::new(s.clone()))
        .collect();

    // One stream feeds every engine; monitors subscribe per symbol.
    let feed = PriceFeed::new();
    let mut all_symbols = linear_symbols.clone();
    all_symbols.extend(inverse_symbols.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(
        PriceStream::new(settings.exchange.ws_url.clone(), all_symbols)
            .run(Arc::clone(&feed), shutdown_rx.clone()),
    );

    let regime = RegimeTracker::new(Arc::clone(&reader), Arc::clone(&db));
    tokio::spawn(regime.run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&config).run_refresh(shutdown_rx.clone()));

    if settings.optimizer.enabled {
        let optimizer = Optimizer::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&notifier),
            settings.optimizer.clone(),
        );
        tokio::spawn(optimizer.run(shutdown_rx.clone()));
    }

    let linear = TradingEngine::new(
        LINEAR_ACCOUNT_ID,
        MarginMode::Linear,
        linear_symbols,
        settings.clone(),
        Arc::clone(&db),
        Arc::clone(&exchange),
        Arc::clone(&reader),
        Arc::clone(&feed),
        Arc::clone(&config),
        Arc::clone(&notifier),
        INITIAL_BALANCE,
    );
    let mut handles = vec![linear.start(shutdown_rx.clone()).await?];

    if inverse_enabled {
        let inverse = TradingEngine::new(
            INVERSE_ACCOUNT_ID,
            MarginMode::Inverse,
            inverse_symbols,
            settings.clone(),
            Arc::clone(&db),
            Arc::clone(&exchange),
            Arc::clone(&reader),
            Arc::clone(&feed),
            Arc::clone(&config),
            Arc::clone(&notifier),
            INITIAL_BALANCE,
        );
        handles.push(inverse.start(shutdown_rx.clone()).await?);
    }

    notifier
        .send(Severity::Info, "Trading engine started".to_string())
        .await;
    info!("Engines running; press Ctrl+C to stop");

    let mut scanners: Vec<_> = handles.into_iter().map(|h| h.scanner).collect();
    let exit_code;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            exit_code = 0;
        }
        result = futures::future::select_all(&mut scanners) => {
            // A scanner only returns early on an unrecoverable runtime.
            let (outcome, _, _) = result;
            match outcome {
                Ok(Ok(())) => exit_code = 0,
                Ok(Err(e)) => {
                    error!("Unrecoverable: {:#}", e);
                    exit_code = 2;
                }
                Err(e) => {
                    error!("Unrecoverable: scanner task panicked: {}", e);
                    exit_code = 2;
                }
            }
        }
    }

    // Give tasks the grace window to unwind DB writes and sockets.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    info!("Shutdown complete");
    Ok(exit_code)
}

async fn run_optimizer_once(settings: Settings, dry_run: bool) -> Result<i32> {
    let db = Arc::new(Database::new(&settings.database_url).await?);
    let config = Arc::new(ConfigStore::new(
        Arc::clone(&db),
        settings.clone(),
        vec![LINEAR_ACCOUNT_ID, INVERSE_ACCOUNT_ID],
    ));
    config.reload().await?;

    let mut optimizer_settings = settings.optimizer.clone();
    optimizer_settings.dry_run = optimizer_settings.dry_run || dry_run;

    let optimizer = Optimizer::new(
        Arc::clone(&db),
        config,
        BufferedNotifier::new(),
        optimizer_settings,
    );
    let report = optimizer.run_once(chrono::Utc::now()).await?;

    println!(
        "Optimizer {}: {} trades analyzed since {}, {} changes",
        if report.dry_run { "dry run" } else { "run" },
        report.trades_analyzed,
        report.since,
        report.changes.len()
    );
    Ok(0)
}

async fn show_status(settings: Settings) -> Result<i32> {
    let db = Arc::new(Database::new(&settings.database_url).await?);

    println!("=== Accounts ===");
    for (account_id, label) in [(LINEAR_ACCOUNT_ID, "linear"), (INVERSE_ACCOUNT_ID, "inverse")] {
        match db.get_account(account_id).await {
            Ok(account) => {
                let live = db.live_position_ids(account_id).await?.len();
                let unrealized = db.sum_unrealized(account_id).await?;
                println!(
                    "account {} ({}): balance={} equity={} frozen_margin={} realized_pnl={} live_positions={}",
                    account_id,
                    label,
                    account.balance,
                    account.equity(unrealized),
                    account.frozen_margin,
                    account.realized_pnl_cum,
                    live
                );
            }
            Err(_) => println!("account {} ({}): not initialized", account_id, label),
        }
    }
    Ok(0)
}
