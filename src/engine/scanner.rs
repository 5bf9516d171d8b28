use anyhow::Result;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionFilter, AdmissionOutcome};
use crate::config::store::ConfigStore;
use crate::entry::EntryExecutor;
use crate::exchange::PriceFeed;
use crate::market::MarketDataReader;
use crate::scoring;
use crate::types::{MarketSnapshot, Side, Symbol};

/// Concurrent candle fetches per cycle; network I/O dominates scan cost.
const FETCH_CONCURRENCY: usize = 8;
/// Consecutive whole-cycle failures before the scanner gives up and the
/// process reports an unrecoverable runtime.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub scanned: usize,
    pub stale: usize,
    pub opportunities: usize,
    pub admitted: usize,
    pub rejected: HashMap<&'static str, usize>,
}

/// The per-account scan loop: every `scan_interval` seconds, pin a config
/// snapshot, walk the universe, score, admit, and hand accepted
/// opportunities to short-lived entry tasks.
pub struct Scanner {
    account_id: i64,
    symbols: Vec<Symbol>,
    reader: Arc<MarketDataReader>,
    feed: Arc<PriceFeed>,
    config: Arc<ConfigStore>,
    admission: Arc<AdmissionFilter>,
    entry: Arc<EntryExecutor>,
    scan_interval: Duration,
    /// (symbol, side) pairs with an entry task still in flight, so one
    /// signal cannot spawn twice before its first batch lands in the DB.
    in_flight: Arc<Mutex<HashSet<(Symbol, Side)>>>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: i64,
        symbols: Vec<Symbol>,
        reader: Arc<MarketDataReader>,
        feed: Arc<PriceFeed>,
        config: Arc<ConfigStore>,
        admission: Arc<AdmissionFilter>,
        entry: Arc<EntryExecutor>,
        scan_interval_seconds: u64,
    ) -> Self {
        Self {
            account_id,
            symbols,
            reader,
            feed,
            config,
            admission,
            entry,
            scan_interval: Duration::from_secs(scan_interval_seconds.max(1)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn scan_cycle(&self) -> Result<ScanSummary> {
        let cfg = self.config.snapshot();
        let now = Utc::now();
        let mut summary = ScanSummary::default();

        let mut fetches: FuturesUnordered<_> = FuturesUnordered::new();
        let mut pending = self.symbols.iter();
        for symbol in pending.by_ref().take(FETCH_CONCURRENCY) {
            fetches.push(self.fetch(symbol.clone()));
        }

        while let Some((symbol, snapshot)) = fetches.next().await {
            if let Some(next) = pending.next() {
                fetches.push(self.fetch(next.clone()));
            }

            summary.scanned += 1;
            let Some(snapshot) = snapshot else {
                summary.stale += 1;
                continue;
            };

            if !snapshot.is_fresh(now) {
                debug!("{}: stale candles, skipping this cycle", symbol);
                summary.stale += 1;
                continue;
            }

            let price = match self.feed.latest(&symbol) {
                Some(tick) => tick.price,
                None => match snapshot.m5.last() {
                    Some(c) => c.close,
                    None => continue,
                },
            };

            let Some(opportunity) = scoring::evaluate(&snapshot, price, cfg.as_ref()) else {
                continue;
            };
            summary.opportunities += 1;

            if self.is_in_flight(&opportunity.symbol, opportunity.side) {
                debug!("{} {}: entry already in flight", opportunity.side, opportunity.symbol);
                continue;
            }

            match self.admission.admit(&opportunity, &snapshot, cfg.as_ref(), now).await? {
                AdmissionOutcome::Accepted => {
                    summary.admitted += 1;
                    info!(
                        "Admitted: {} {} score={} pattern={}",
                        opportunity.side,
                        opportunity.symbol,
                        opportunity.score,
                        opportunity.signal_pattern()
                    );
                    self.spawn_entry(opportunity, Arc::clone(&cfg));
                }
                AdmissionOutcome::Rejected(reason) => {
                    // Blacklist hits feed operator statistics; the rest are
                    // one-line noise.
                    if reason.counts_toward_stats() {
                        info!(
                            "Rejected: {} {} - {}",
                            opportunity.side, opportunity.symbol, reason
                        );
                    } else {
                        debug!(
                            "Rejected: {} {} - {}",
                            opportunity.side, opportunity.symbol, reason
                        );
                    }
                    *summary.rejected.entry(reason.code()).or_default() += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn fetch(&self, symbol: Symbol) -> (Symbol, Option<MarketSnapshot>) {
        match self.reader.snapshot(&symbol).await {
            Ok(snapshot) => (symbol, Some(snapshot)),
            Err(e) => {
                warn!("{}: snapshot fetch failed: {}", symbol, e);
                (symbol, None)
            }
        }
    }

    fn is_in_flight(&self, symbol: &Symbol, side: Side) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .contains(&(symbol.clone(), side))
    }

    fn spawn_entry(&self, opportunity: crate::types::Opportunity, cfg: Arc<crate::config::store::ConfigSnapshot>) {
        let key = (opportunity.symbol.clone(), opportunity.side);
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(key.clone());

        let entry = Arc::clone(&self.entry);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let result = entry.execute(opportunity, cfg).await;
            in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&key);
            match result {
                Ok(Some(id)) => info!("Entry task finished: position {}", id),
                Ok(None) => debug!("Entry task finished without a position"),
                Err(e) => warn!("Entry task failed: {}", e),
            }
        });
    }

    /// Loop forever; an Err return means three consecutive cycles failed
    /// and the caller should treat the runtime as unrecoverable.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut failures = 0u32;

        loop {
            match self.scan_cycle().await {
                Ok(summary) => {
                    failures = 0;
                    info!(
                        "Scan cycle (account {}): {} scanned, {} stale, {} opportunities, {} admitted, rejections {:?}",
                        self.account_id,
                        summary.scanned,
                        summary.stale,
                        summary.opportunities,
                        summary.admitted,
                        summary.rejected
                    );
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Scan cycle failed (account {}, {}/{}): {}",
                        self.account_id, failures, MAX_CONSECUTIVE_FAILURES, e
                    );
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        anyhow::bail!(
                            "scanner for account {} failed {} consecutive cycles: {}",
                            self.account_id,
                            failures,
                            e
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.scan_interval) => {}
                _ = shutdown.changed() => {
                    info!("Scanner shutting down (account {})", self.account_id);
                    return Ok(());
                }
            }
        }
    }
}
