use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::config::store::{ScoringWeightRow, SignalBlacklistRow, SymbolRatingRow, SymbolRiskParamsRow};
use crate::market::regime::RegimeSnapshot;
use crate::types::{
    components_from_json, components_to_json, Account, BatchFill, CloseReason, MarginMode,
    Position, PositionStatus, Side, Symbol,
};

/// One row of the `trades` ledger, written when a position closes. The
/// optimizer aggregates these per component pattern and per symbol.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub id: String,
    pub position_id: String,
    pub account_id: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub close_reason: CloseReason,
    pub signal_pattern: String,
    pub holding_minutes: i64,
    pub closed_at: DateTime<Utc>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("Initializing SQLite database at: {}", db_url);

        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        db.seed_scoring_weights().await?;

        info!("Database initialized");
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                margin_mode TEXT NOT NULL,
                balance TEXT NOT NULL,
                frozen_margin TEXT NOT NULL DEFAULT '0',
                realized_pnl_cum TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                account_id INTEGER NOT NULL,
                margin_mode TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                signal_version INTEGER NOT NULL,
                entry_score INTEGER NOT NULL,
                components_json TEXT NOT NULL,
                batch_plan TEXT NOT NULL,
                batch_filled TEXT NOT NULL,
                entry_price TEXT,
                avg_entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                margin TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                stop_loss_price TEXT,
                take_profit_price TEXT,
                entry_signal_time TEXT NOT NULL,
                planned_close_time TEXT,
                open_time TEXT,
                close_time TEXT,
                close_price TEXT,
                close_reason TEXT,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                unrealized_pnl TEXT NOT NULL DEFAULT '0',
                max_profit_pct TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_positions_account_status
             ON positions(account_id, status, symbol, side)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_positions_planned_close
             ON positions(status, planned_close_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                close_reason TEXT NOT NULL,
                signal_pattern TEXT NOT NULL,
                holding_minutes INTEGER NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_closed_at ON trades(closed_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scoring_weights (
                component_name TEXT PRIMARY KEY,
                weight_long INTEGER NOT NULL,
                weight_short INTEGER NOT NULL,
                base_weight INTEGER NOT NULL,
                performance_score TEXT NOT NULL DEFAULT '0',
                last_adjusted TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scoring_weights_active ON scoring_weights(active)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbol_risk_params (
                symbol TEXT PRIMARY KEY,
                long_tp_pct TEXT NOT NULL,
                long_sl_pct TEXT NOT NULL,
                short_tp_pct TEXT NOT NULL,
                short_sl_pct TEXT NOT NULL,
                position_multiplier TEXT NOT NULL DEFAULT '1',
                win_rate TEXT NOT NULL DEFAULT '0',
                total_trades INTEGER NOT NULL DEFAULT 0,
                total_pnl TEXT NOT NULL DEFAULT '0',
                last_optimized TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_symbol_risk_params_symbol ON symbol_risk_params(symbol)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbol_ratings (
                symbol TEXT PRIMARY KEY,
                level INTEGER NOT NULL DEFAULT 0,
                total_pnl TEXT NOT NULL DEFAULT '0',
                hard_stop_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_blacklist (
                symbol TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_blacklist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_pattern TEXT NOT NULL,
                side TEXT NOT NULL,
                reason TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE(signal_pattern, side)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signal_blacklist_active ON signal_blacklist(active, side)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_regime (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                captured_at TEXT NOT NULL,
                regime TEXT NOT NULL,
                strength INTEGER NOT NULL,
                bias TEXT NOT NULL,
                position_adjustment_multiplier TEXT NOT NULL,
                score_threshold_adjustment INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS optimization_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                optimized_at TEXT NOT NULL,
                change_type TEXT NOT NULL,
                target TEXT NOT NULL,
                param TEXT NOT NULL,
                old_value TEXT NOT NULL,
                new_value TEXT NOT NULL,
                reason TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_control (
                account_id INTEGER NOT NULL,
                trading_type TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, trading_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert default weight rows (10/10) for every catalog component that
    /// does not have one yet.
    async fn seed_scoring_weights(&self) -> Result<()> {
        for component in crate::types::ComponentId::all() {
            sqlx::query(
                r#"
                INSERT INTO scoring_weights (component_name, weight_long, weight_short, base_weight)
                VALUES (?, 10, 10, 10)
                ON CONFLICT(component_name) DO NOTHING
                "#,
            )
            .bind(component.name())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- accounts

    pub async fn ensure_account(&self, id: i64, mode: MarginMode, initial_balance: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, margin_mode, balance, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(mode.as_str())
        .bind(initial_balance.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, id: i64) -> Result<Account> {
        let row = sqlx::query(
            "SELECT id, margin_mode, balance, frozen_margin, realized_pnl_cum FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Account {
            id: row.get("id"),
            margin_mode: MarginMode::parse(row.get("margin_mode"))
                .ok_or_else(|| anyhow!("bad margin_mode for account {}", id))?,
            balance: parse_decimal(row.get("balance"))?,
            frozen_margin: parse_decimal(row.get("frozen_margin"))?,
            realized_pnl_cum: parse_decimal(row.get("realized_pnl_cum"))?,
        })
    }

    /// Recompute `frozen_margin` from live position rows. Run at startup so a
    /// crash between a fill and its account write cannot leave drift behind.
    pub async fn recompute_account_aggregates(&self, account_id: i64) -> Result<()> {
        let rows = sqlx::query(
            "SELECT margin FROM positions WHERE account_id = ? AND status IN ('building', 'open')",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut frozen = Decimal::ZERO;
        for row in rows {
            frozen += parse_decimal(row.get("margin"))?;
        }

        sqlx::query("UPDATE accounts SET frozen_margin = ?, updated_at = ? WHERE id = ?")
            .bind(frozen.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sum of unrealized pnl across live positions, for equity reporting.
    pub async fn sum_unrealized(&self, account_id: i64) -> Result<Decimal> {
        let rows = sqlx::query(
            "SELECT unrealized_pnl FROM positions WHERE account_id = ? AND status IN ('building', 'open')",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            total += parse_decimal(row.get("unrealized_pnl"))?;
        }
        Ok(total)
    }

    pub async fn freeze_margin(&self, account_id: i64, delta: Decimal) -> Result<()> {
        let account = self.get_account(account_id).await?;
        sqlx::query("UPDATE accounts SET frozen_margin = ?, updated_at = ? WHERE id = ?")
            .bind((account.frozen_margin + delta).to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --------------------------------------------------------------- positions

    pub async fn upsert_position(&self, p: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, account_id, margin_mode, symbol, side, status, signal_version,
                entry_score, components_json, batch_plan, batch_filled,
                entry_price, avg_entry_price, quantity, margin, leverage,
                stop_loss_price, take_profit_price, entry_signal_time,
                planned_close_time, open_time, close_time, close_price,
                close_reason, realized_pnl, unrealized_pnl, max_profit_pct, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                batch_filled = excluded.batch_filled,
                entry_price = excluded.entry_price,
                avg_entry_price = excluded.avg_entry_price,
                quantity = excluded.quantity,
                margin = excluded.margin,
                stop_loss_price = excluded.stop_loss_price,
                take_profit_price = excluded.take_profit_price,
                planned_close_time = excluded.planned_close_time,
                open_time = excluded.open_time,
                close_time = excluded.close_time,
                close_price = excluded.close_price,
                close_reason = excluded.close_reason,
                realized_pnl = excluded.realized_pnl,
                unrealized_pnl = excluded.unrealized_pnl,
                max_profit_pct = excluded.max_profit_pct,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&p.id)
        .bind(p.account_id)
        .bind(p.margin_mode.as_str())
        .bind(p.symbol.as_str())
        .bind(p.side.as_str())
        .bind(p.status.as_str())
        .bind(p.signal_version)
        .bind(p.entry_score)
        .bind(components_to_json(&p.components))
        .bind(serde_json::to_string(&p.batch_plan)?)
        .bind(serde_json::to_string(&p.batch_filled)?)
        .bind(p.entry_price.map(|d| d.to_string()))
        .bind(p.avg_entry_price.to_string())
        .bind(p.quantity.to_string())
        .bind(p.margin.to_string())
        .bind(p.leverage as i64)
        .bind(p.stop_loss_price.map(|d| d.to_string()))
        .bind(p.take_profit_price.map(|d| d.to_string()))
        .bind(p.entry_signal_time.to_rfc3339())
        .bind(p.planned_close_time.map(|t| t.to_rfc3339()))
        .bind(p.open_time.map(|t| t.to_rfc3339()))
        .bind(p.close_time.map(|t| t.to_rfc3339()))
        .bind(p.close_price.map(|d| d.to_string()))
        .bind(p.close_reason.map(|r| r.as_str()))
        .bind(p.realized_pnl.to_string())
        .bind(p.unrealized_pnl.to_string())
        .bind(p.max_profit_pct.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(position_from_row).transpose()
    }

    /// Ids of building/open positions for one account; the supervisor's
    /// `db_set`.
    pub async fn live_position_ids(&self, account_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM positions WHERE account_id = ? AND status IN ('building', 'open')
             ORDER BY entry_signal_time ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// Ids past `planned_close_time + extension`, still live.
    pub async fn timed_out_position_ids(
        &self,
        account_id: i64,
        now: DateTime<Utc>,
        extension_minutes: i64,
    ) -> Result<Vec<String>> {
        let cutoff = now - chrono::Duration::minutes(extension_minutes);
        let rows = sqlx::query(
            "SELECT id FROM positions
             WHERE account_id = ? AND status IN ('building', 'open')
               AND planned_close_time IS NOT NULL AND planned_close_time < ?",
        )
        .bind(account_id)
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    pub async fn count_live_positions(&self, account_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM positions
             WHERE account_id = ? AND status IN ('building', 'open')",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    pub async fn count_live_positions_for(
        &self,
        account_id: i64,
        symbol: &Symbol,
        side: Side,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM positions
             WHERE account_id = ? AND symbol = ? AND side = ? AND status IN ('building', 'open')",
        )
        .bind(account_id)
        .bind(symbol.as_str())
        .bind(side.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    pub async fn has_live_same_version(
        &self,
        account_id: i64,
        symbol: &Symbol,
        side: Side,
        signal_version: i64,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM positions
             WHERE account_id = ? AND symbol = ? AND side = ? AND signal_version = ?
               AND status IN ('building', 'open')",
        )
        .bind(account_id)
        .bind(symbol.as_str())
        .bind(side.as_str())
        .bind(signal_version)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Close time of the most recently closed position on (symbol, side),
    /// for the cooldown gate.
    pub async fn last_close_time(
        &self,
        account_id: i64,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT close_time FROM positions
             WHERE account_id = ? AND symbol = ? AND side = ? AND status = 'closed'
               AND close_time IS NOT NULL
             ORDER BY close_time DESC LIMIT 1",
        )
        .bind(account_id)
        .bind(symbol.as_str())
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let s: String = row.get("close_time");
                Ok(Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    pub async fn positions_closed_since(&self, since: DateTime<Utc>) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status = 'closed' AND close_time >= ?
             ORDER BY close_time ASC",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(position_from_row).collect()
    }

    /// Transactionally close a position: guard against double-close, persist
    /// the closed row, append the trade, release margin and settle pnl on the
    /// account. Returns false when another writer closed the row first.
    pub async fn close_position(&self, p: &Position, fees: Decimal) -> Result<bool> {
        let close_time = p.close_time.ok_or_else(|| anyhow!("close_time not set"))?;
        let close_price = p.close_price.ok_or_else(|| anyhow!("close_price not set"))?;
        let close_reason = p.close_reason.ok_or_else(|| anyhow!("close_reason not set"))?;

        let mut tx = self.pool.begin().await?;

        let status_row = sqlx::query("SELECT status FROM positions WHERE id = ?")
            .bind(&p.id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(status_row) = status_row else {
            tx.rollback().await?;
            return Err(anyhow!("position {} not found", p.id));
        };
        let current: String = status_row.get("status");
        if current == "closed" {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE positions SET
                status = 'closed',
                close_time = ?, close_price = ?, close_reason = ?,
                realized_pnl = ?, unrealized_pnl = '0', max_profit_pct = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(close_time.to_rfc3339())
        .bind(close_price.to_string())
        .bind(close_reason.as_str())
        .bind(p.realized_pnl.to_string())
        .bind(p.max_profit_pct.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(&p.id)
        .execute(&mut *tx)
        .await?;

        let holding_minutes = p
            .open_time
            .map(|t| (close_time - t).num_minutes())
            .unwrap_or(0);

        sqlx::query(
            r#"
            INSERT INTO trades (
                id, position_id, account_id, symbol, side, entry_price, exit_price,
                quantity, pnl, fees, close_reason, signal_pattern, holding_minutes, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&p.id)
        .bind(p.account_id)
        .bind(p.symbol.as_str())
        .bind(p.side.as_str())
        .bind(p.avg_entry_price.to_string())
        .bind(close_price.to_string())
        .bind(p.quantity.to_string())
        .bind(p.realized_pnl.to_string())
        .bind(fees.to_string())
        .bind(close_reason.as_str())
        .bind(crate::types::signal_pattern(&p.components))
        .bind(holding_minutes)
        .bind(close_time.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let account_row = sqlx::query("SELECT balance, frozen_margin, realized_pnl_cum FROM accounts WHERE id = ?")
            .bind(p.account_id)
            .fetch_one(&mut *tx)
            .await?;
        let balance = parse_decimal(account_row.get("balance"))? + p.realized_pnl;
        let frozen = (parse_decimal(account_row.get("frozen_margin"))? - p.margin).max(Decimal::ZERO);
        let pnl_cum = parse_decimal(account_row.get("realized_pnl_cum"))? + p.realized_pnl;

        sqlx::query(
            "UPDATE accounts SET balance = ?, frozen_margin = ?, realized_pnl_cum = ?, updated_at = ? WHERE id = ?",
        )
        .bind(balance.to_string())
        .bind(frozen.to_string())
        .bind(pnl_cum.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(p.account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ------------------------------------------------------------ config rows

    pub async fn load_scoring_weights(&self) -> Result<Vec<ScoringWeightRow>> {
        let rows = sqlx::query(
            "SELECT component_name, weight_long, weight_short, base_weight, performance_score
             FROM scoring_weights WHERE active = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut weights = Vec::new();
        for row in rows {
            let name: String = row.get("component_name");
            let Some(component) = crate::types::ComponentId::parse(&name) else {
                continue;
            };
            weights.push(ScoringWeightRow {
                component,
                weight_long: row.get("weight_long"),
                weight_short: row.get("weight_short"),
                base_weight: row.get("base_weight"),
                performance_score: parse_decimal(row.get("performance_score"))?,
            });
        }
        Ok(weights)
    }

    pub async fn load_symbol_risk_params(&self) -> Result<Vec<SymbolRiskParamsRow>> {
        let rows = sqlx::query(
            "SELECT symbol, long_tp_pct, long_sl_pct, short_tp_pct, short_sl_pct,
                    position_multiplier, win_rate, total_trades, total_pnl
             FROM symbol_risk_params WHERE active = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut params = Vec::new();
        for row in rows {
            let symbol: String = row.get("symbol");
            params.push(SymbolRiskParamsRow {
                symbol: Symbol::new(symbol),
                long_tp_pct: parse_decimal(row.get("long_tp_pct"))?,
                long_sl_pct: parse_decimal(row.get("long_sl_pct"))?,
                short_tp_pct: parse_decimal(row.get("short_tp_pct"))?,
                short_sl_pct: parse_decimal(row.get("short_sl_pct"))?,
                position_multiplier: parse_decimal(row.get("position_multiplier"))?,
                win_rate: parse_decimal(row.get("win_rate"))?,
                total_trades: row.get("total_trades"),
                total_pnl: parse_decimal(row.get("total_pnl"))?,
            });
        }
        Ok(params)
    }

    pub async fn load_symbol_ratings(&self) -> Result<Vec<SymbolRatingRow>> {
        let rows = sqlx::query("SELECT symbol, level, total_pnl, hard_stop_count FROM symbol_ratings")
            .fetch_all(&self.pool)
            .await?;

        let mut ratings = Vec::new();
        for row in rows {
            let symbol: String = row.get("symbol");
            ratings.push(SymbolRatingRow {
                symbol: Symbol::new(symbol),
                level: row.get("level"),
                total_pnl: parse_decimal(row.get("total_pnl"))?,
                hard_stop_count: row.get("hard_stop_count"),
            });
        }
        Ok(ratings)
    }

    pub async fn load_trading_blacklist(&self) -> Result<Vec<Symbol>> {
        let rows = sqlx::query("SELECT symbol FROM trading_blacklist WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Symbol::new(r.get::<String, _>("symbol")))
            .collect())
    }

    pub async fn load_signal_blacklist(&self) -> Result<Vec<SignalBlacklistRow>> {
        let rows = sqlx::query("SELECT signal_pattern, side, reason FROM signal_blacklist WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::new();
        for row in rows {
            let side: String = row.get("side");
            let Some(side) = Side::parse(&side) else { continue };
            entries.push(SignalBlacklistRow {
                pattern: row.get("signal_pattern"),
                side,
                reason: row.get("reason"),
            });
        }
        Ok(entries)
    }

    /// Per-account kill switch, if an operator row exists.
    pub async fn trading_control(&self, account_id: i64) -> Result<Option<bool>> {
        let row = sqlx::query("SELECT enabled FROM trading_control WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("enabled") != 0))
    }

    pub async fn set_trading_control(&self, account_id: i64, trading_type: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_control (account_id, trading_type, enabled, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id, trading_type) DO UPDATE SET
                enabled = excluded.enabled, updated_at = excluded.updated_at
            "#,
        )
        .bind(account_id)
        .bind(trading_type)
        .bind(enabled as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------- regime

    pub async fn insert_regime(&self, r: &RegimeSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO market_regime (
                captured_at, regime, strength, bias,
                position_adjustment_multiplier, score_threshold_adjustment
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.captured_at.to_rfc3339())
        .bind(r.regime.as_str())
        .bind(r.strength as i64)
        .bind(r.bias.as_str())
        .bind(r.position_adjustment_multiplier.to_string())
        .bind(r.score_threshold_adjustment as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_regime(&self) -> Result<Option<RegimeSnapshot>> {
        let row = sqlx::query("SELECT * FROM market_regime ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let captured_at: String = row.get("captured_at");
        let regime: String = row.get("regime");
        let bias: String = row.get("bias");
        Ok(Some(RegimeSnapshot {
            captured_at: DateTime::parse_from_rfc3339(&captured_at)?.with_timezone(&Utc),
            regime: crate::market::regime::Regime::parse(&regime)
                .ok_or_else(|| anyhow!("bad regime value {}", regime))?,
            strength: row.get::<i64, _>("strength") as u8,
            bias: crate::market::regime::RegimeBias::parse(&bias)
                .ok_or_else(|| anyhow!("bad regime bias {}", bias))?,
            position_adjustment_multiplier: parse_decimal(row.get("position_adjustment_multiplier"))?,
            score_threshold_adjustment: row.get::<i64, _>("score_threshold_adjustment") as i32,
        }))
    }

    // -------------------------------------------------------------- optimizer

    pub async fn last_optimized_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(optimized_at) as last FROM optimization_history")
            .fetch_one(&self.pool)
            .await?;
        let last: Option<String> = row.get("last");
        match last {
            Some(s) => Ok(Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc))),
            None => Ok(None),
        }
    }
}

fn parse_decimal(s: String) -> Result<Decimal> {
    Decimal::from_str(&s).map_err(|e| anyhow!("bad decimal '{}': {}", s, e))
}

fn position_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Position> {
    let margin_mode: String = row.get("margin_mode");
    let side: String = row.get("side");
    let status: String = row.get("status");
    let components_json: String = row.get("components_json");
    let batch_plan: String = row.get("batch_plan");
    let batch_filled: String = row.get("batch_filled");
    let entry_signal_time: String = row.get("entry_signal_time");

    let parse_opt_decimal = |v: Option<String>| -> Option<Decimal> {
        v.and_then(|s| Decimal::from_str(&s).ok())
    };
    let parse_opt_time = |v: Option<String>| -> Option<DateTime<Utc>> {
        v.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
    };

    Ok(Position {
        id: row.get("id"),
        account_id: row.get("account_id"),
        margin_mode: MarginMode::parse(&margin_mode)
            .ok_or_else(|| anyhow!("bad margin_mode {}", margin_mode))?,
        symbol: Symbol::new(row.get::<String, _>("symbol")),
        side: Side::parse(&side).ok_or_else(|| anyhow!("bad side {}", side))?,
        status: PositionStatus::parse(&status).ok_or_else(|| anyhow!("bad status {}", status))?,
        signal_version: row.get("signal_version"),
        entry_score: row.get("entry_score"),
        components: components_from_json(&components_json),
        batch_plan: serde_json::from_str(&batch_plan).unwrap_or_default(),
        batch_filled: serde_json::from_str::<Vec<BatchFill>>(&batch_filled).unwrap_or_default(),
        entry_price: parse_opt_decimal(row.get("entry_price")),
        avg_entry_price: parse_decimal(row.get("avg_entry_price"))?,
        quantity: parse_decimal(row.get("quantity"))?,
        margin: parse_decimal(row.get("margin"))?,
        leverage: row.get::<i64, _>("leverage") as u32,
        stop_loss_price: parse_opt_decimal(row.get("stop_loss_price")),
        take_profit_price: parse_opt_decimal(row.get("take_profit_price")),
        entry_signal_time: DateTime::parse_from_rfc3339(&entry_signal_time)?.with_timezone(&Utc),
        planned_close_time: parse_opt_time(row.get("planned_close_time")),
        open_time: parse_opt_time(row.get("open_time")),
        close_time: parse_opt_time(row.get("close_time")),
        close_price: parse_opt_decimal(row.get("close_price")),
        close_reason: row
            .get::<Option<String>, _>("close_reason")
            .and_then(|s| CloseReason::parse(&s)),
        realized_pnl: parse_decimal(row.get("realized_pnl"))?,
        unrealized_pnl: parse_decimal(row.get("unrealized_pnl"))?,
        max_profit_pct: parse_decimal(row.get("max_profit_pct"))?,
    })
}
