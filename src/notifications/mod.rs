#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::types::{CloseReason, Side, Symbol};

const MAX_BUFFERED: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Delivery is external; the engine only hands text to this seam. Slow
/// transports must not block trading paths, so implementations are expected
/// to be cheap and callers fire-and-forget.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, level: Severity, text: String);
}

/// Tracing-backed notifier; the default when no transport is wired up.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, level: Severity, text: String) {
        match level {
            Severity::Info => info!("[notify] {}", text),
            Severity::Warning => warn!("[notify] {}", text),
            Severity::Critical => error!("[notify] {}", text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub at: DateTime<Utc>,
    pub level: Severity,
    pub text: String,
}

/// Keeps the most recent events in memory for the operator surface while
/// also logging them.
pub struct BufferedNotifier {
    events: RwLock<Vec<NotificationEvent>>,
}

impl BufferedNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: RwLock::new(Vec::new()),
        })
    }

    pub async fn recent(&self, limit: usize) -> Vec<NotificationEvent> {
        let events = self.events.read().await;
        events.iter().take(limit).cloned().collect()
    }
}

#[async_trait]
impl Notifier for BufferedNotifier {
    async fn send(&self, level: Severity, text: String) {
        LogNotifier.send(level, text.clone()).await;

        let mut events = self.events.write().await;
        events.insert(
            0,
            NotificationEvent {
                at: Utc::now(),
                level,
                text,
            },
        );
        if events.len() > MAX_BUFFERED {
            events.truncate(MAX_BUFFERED);
        }
    }
}

// Message builders for the events the engine must surface.

pub fn entry_batch_filled(symbol: &Symbol, side: Side, batch: usize, price: Decimal, forced: bool) -> String {
    format!(
        "Entry batch {}/3 filled: {} {} @ {}{}",
        batch,
        side,
        symbol,
        price,
        if forced { " (forced)" } else { "" }
    )
}

pub fn entry_complete(symbol: &Symbol, side: Side, avg_entry: Decimal, quantity: Decimal) -> String {
    format!(
        "Position open: {} {} qty {} avg entry {}",
        side, symbol, quantity, avg_entry
    )
}

pub fn entry_aborted(symbol: &Symbol, side: Side, reason: &str) -> String {
    format!("Entry aborted: {} {} ({})", side, symbol, reason)
}

pub fn position_closed(symbol: &Symbol, side: Side, pnl: Decimal, reason: CloseReason) -> String {
    format!(
        "Position closed: {} {} pnl {} reason {}",
        side, symbol, pnl, reason
    )
}

pub fn supervisor_restart(account_id: i64, db_count: usize, monitor_count: usize, timed_out: usize) -> String {
    format!(
        "Supervisor restart (account {}): db={} monitors={} timed_out={}",
        account_id, db_count, monitor_count, timed_out
    )
}

pub fn optimizer_summary(changes: usize, dry_run: bool) -> String {
    if dry_run {
        format!("Optimizer dry-run complete: {} would-be changes", changes)
    } else {
        format!("Optimizer applied {} changes", changes)
    }
}

pub fn trading_toggled(account_id: i64, enabled: bool) -> String {
    format!(
        "Trading {} for account {}",
        if enabled { "enabled" } else { "disabled" },
        account_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn buffered_notifier_retains_most_recent_first() {
        let notifier = BufferedNotifier::new();
        notifier.send(Severity::Info, "first".to_string()).await;
        notifier.send(Severity::Warning, "second".to_string()).await;

        let recent = notifier.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "second");
        assert_eq!(recent[1].level, Severity::Info);
    }

    #[test]
    fn close_message_carries_reason() {
        let text = position_closed(
            &Symbol::from("BTC/USDT"),
            Side::Short,
            dec!(-12.5),
            CloseReason::StagedTimeout2h,
        );
        assert!(text.contains("staged_timeout_2h"));
        assert!(text.contains("SHORT"));
    }
}
