use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::notifications::{self, Notifier, Severity};

const TICK_SECONDS: u64 = 60;
const HEARTBEAT_EVERY_TICKS: u64 = 10;
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// A running exit-monitor task and its cancel handle.
pub struct MonitorHandle {
    pub cancel: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Monitor registry keyed by position id. The supervisor is the only
/// writer; everyone else only reads counts.
pub type MonitorMap = Arc<RwLock<HashMap<String, MonitorHandle>>>;

pub fn new_monitor_map() -> MonitorMap {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Spawner seam so the supervisor can be exercised without real monitors.
pub trait MonitorSpawner: Send + Sync {
    fn spawn(&self, position_id: String) -> MonitorHandle;
}

/// Reconciles the in-memory monitor set against the database once per
/// minute. The monitor map is best-effort state; any drift (a leaked
/// position, a panicked task, a missed registration) is healed here by
/// tearing the subsystem down and re-registering from the DB truth.
pub struct Supervisor {
    account_id: i64,
    db: Arc<Database>,
    monitors: MonitorMap,
    spawner: Arc<dyn MonitorSpawner>,
    notifier: Arc<dyn Notifier>,
    extension_minutes: i64,
    ticks: u64,
}

impl Supervisor {
    pub fn new(
        account_id: i64,
        db: Arc<Database>,
        monitors: MonitorMap,
        spawner: Arc<dyn MonitorSpawner>,
        notifier: Arc<dyn Notifier>,
        extension_minutes: i64,
    ) -> Self {
        Self {
            account_id,
            db,
            monitors,
            spawner,
            notifier,
            extension_minutes,
            ticks: 0,
        }
    }

    /// One reconciliation pass. Returns true when a restart was triggered.
    pub async fn tick(&mut self) -> Result<bool> {
        self.ticks += 1;
        let now = Utc::now();

        let db_ids = self.db.live_position_ids(self.account_id).await?;
        let db_set: HashSet<&String> = db_ids.iter().collect();

        // Prune finished handles; a monitor that closed its position exits
        // on its own and is not drift.
        {
            let mut monitors = self.monitors.write().await;
            monitors.retain(|_, handle| handle.is_running());
        }

        let mon_set: HashSet<String> = {
            let monitors = self.monitors.read().await;
            monitors.keys().cloned().collect()
        };
        let mon_refs: HashSet<&String> = mon_set.iter().collect();

        let timed_out = self
            .db
            .timed_out_position_ids(self.account_id, now, self.extension_minutes)
            .await?;

        if db_set != mon_refs || !timed_out.is_empty() {
            warn!(
                "Supervisor drift (account {}): db={} monitors={} timed_out={}",
                self.account_id,
                db_ids.len(),
                mon_set.len(),
                timed_out.len()
            );
            self.restart_all(&db_ids).await;

            let text = notifications::supervisor_restart(
                self.account_id,
                db_ids.len(),
                mon_set.len(),
                timed_out.len(),
            );
            self.notifier.send(Severity::Warning, text).await;
            return Ok(true);
        }

        if self.ticks % HEARTBEAT_EVERY_TICKS == 0 {
            info!(
                "Supervisor heartbeat (account {}): {} live positions, {} monitors",
                self.account_id,
                db_ids.len(),
                mon_set.len()
            );
        }
        Ok(false)
    }

    /// Cancel every monitor, wait briefly for graceful exits, then register
    /// a fresh monitor for every live position id.
    pub async fn restart_all(&self, db_ids: &[String]) {
        let old: Vec<(String, MonitorHandle)> = {
            let mut monitors = self.monitors.write().await;
            monitors.drain().collect()
        };

        for (id, handle) in old {
            let _ = handle.cancel.send(true);
            if tokio::time::timeout(CANCEL_GRACE, handle.task).await.is_err() {
                warn!("Monitor {} did not exit within grace period, dropping", id);
            }
        }

        let mut monitors = self.monitors.write().await;
        for id in db_ids {
            debug!("Supervisor: registering monitor for {}", id);
            monitors.insert(id.clone(), self.spawner.spawn(id.clone()));
        }
        info!(
            "Supervisor restart complete (account {}): {} monitors",
            self.account_id,
            monitors.len()
        );
    }

    /// Startup path: register monitors for everything live before the first
    /// scan, instead of waiting a supervisor interval to heal the gap.
    pub async fn register_startup_monitors(&self) -> Result<usize> {
        let db_ids = self.db.live_position_ids(self.account_id).await?;
        self.restart_all(&db_ids).await;
        Ok(db_ids.len())
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(TICK_SECONDS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Supervisor tick failed (account {}): {}", self.account_id, e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Supervisor shutting down (account {})", self.account_id);
                    let monitors = self.monitors.read().await;
                    for handle in monitors.values() {
                        let _ = handle.cancel.send(true);
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::BufferedNotifier;
    use crate::types::{
        BatchFill, ComponentId, ComponentMap, MarginMode, Position, Side, Symbol,
    };
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Spawns placeholder tasks that idle until cancelled.
    struct FakeSpawner;

    impl MonitorSpawner for FakeSpawner {
        fn spawn(&self, _position_id: String) -> MonitorHandle {
            let (cancel, mut cancel_rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                let _ = cancel_rx.changed().await;
            });
            MonitorHandle { cancel, task }
        }
    }

    async fn live_position(db: &Database, minutes_past_planned: Option<i64>) -> String {
        let now = Utc::now();
        let mut components = ComponentMap::new();
        components.insert(ComponentId::PositionLow, 20);
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
            now - ChronoDuration::hours(5),
        );
        p.apply_fill(BatchFill {
            price: dec!(100),
            quantity: dec!(1),
            filled_at: now - ChronoDuration::hours(5),
            forced: false,
        });
        p.mark_open(now - ChronoDuration::hours(5));
        p.planned_close_time =
            minutes_past_planned.map(|m| now - ChronoDuration::minutes(m));
        db.upsert_position(&p).await.unwrap();
        p.id
    }

    async fn supervisor() -> (Supervisor, Arc<Database>, MonitorMap, Arc<BufferedNotifier>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.ensure_account(1, MarginMode::Linear, dec!(10000)).await.unwrap();
        let monitors = new_monitor_map();
        let notifier = BufferedNotifier::new();
        let supervisor = Supervisor::new(
            1,
            Arc::clone(&db),
            Arc::clone(&monitors),
            Arc::new(FakeSpawner),
            notifier.clone(),
            30,
        );
        (supervisor, db, monitors, notifier)
    }

    #[tokio::test]
    async fn restart_on_monitor_map_drift() {
        let (mut supervisor, db, monitors, notifier) = supervisor().await;

        let id_a = live_position(&db, None).await;
        let id_b = live_position(&db, None).await;
        let id_c = live_position(&db, None).await;

        // Only one of the three is monitored.
        {
            let mut map = monitors.write().await;
            map.insert(id_a.clone(), FakeSpawner.spawn(id_a.clone()));
        }

        assert!(supervisor.tick().await.unwrap());

        let map = monitors.read().await;
        assert_eq!(map.len(), 3);
        for id in [&id_a, &id_b, &id_c] {
            assert!(map.contains_key(id), "monitor missing for {}", id);
            assert!(map[id].is_running());
        }

        let events = notifier.recent(10).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].text.contains("Supervisor restart"));
    }

    #[tokio::test]
    async fn cleared_map_is_fully_rebuilt() {
        let (mut supervisor, db, monitors, _notifier) = supervisor().await;
        let id_a = live_position(&db, None).await;
        let id_b = live_position(&db, None).await;

        // First tick registers both.
        assert!(supervisor.tick().await.unwrap());
        assert_eq!(monitors.read().await.len(), 2);

        // Simulate the map being wiped between heartbeats.
        {
            let mut map = monitors.write().await;
            for (_, handle) in map.drain() {
                let _ = handle.cancel.send(true);
            }
        }

        assert!(supervisor.tick().await.unwrap());
        let map = monitors.read().await;
        assert!(map.contains_key(&id_a) && map.contains_key(&id_b));
    }

    #[tokio::test]
    async fn matching_sets_do_not_restart() {
        let (mut supervisor, db, monitors, notifier) = supervisor().await;
        let _id = live_position(&db, None).await;

        assert!(supervisor.tick().await.unwrap());
        assert_eq!(monitors.read().await.len(), 1);

        // Second tick: map matches DB, no timeout - quiet.
        assert!(!supervisor.tick().await.unwrap());
        assert_eq!(notifier.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_position_forces_restart_even_when_sets_match() {
        let (mut supervisor, db, monitors, _notifier) = supervisor().await;
        // Planned close 45 minutes ago, extension 30: past the hard bound.
        let _id = live_position(&db, Some(45)).await;

        assert!(supervisor.tick().await.unwrap());
        assert_eq!(monitors.read().await.len(), 1);

        // Still timed out on the next tick: restarts again.
        assert!(supervisor.tick().await.unwrap());
    }

    #[tokio::test]
    async fn finished_monitor_of_closed_position_is_not_drift() {
        let (mut supervisor, db, monitors, _notifier) = supervisor().await;
        let id = live_position(&db, None).await;

        assert!(supervisor.tick().await.unwrap());

        // Position closes; its monitor task ends by itself.
        let mut p = db.get_position(&id).await.unwrap().unwrap();
        p.close(dec!(101), crate::types::CloseReason::TakeProfit, Decimal::ZERO, Utc::now());
        db.close_position(&p, Decimal::ZERO).await.unwrap();
        {
            let map = monitors.read().await;
            let _ = map[&id].cancel.send(true);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Pruned, not restarted.
        assert!(!supervisor.tick().await.unwrap());
        assert!(monitors.read().await.is_empty());
    }

    #[tokio::test]
    async fn startup_registration_covers_all_live_rows() {
        let (supervisor, db, monitors, _notifier) = supervisor().await;
        live_position(&db, None).await;
        live_position(&db, None).await;

        let count = supervisor.register_startup_monitors().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(monitors.read().await.len(), 2);
    }
}
