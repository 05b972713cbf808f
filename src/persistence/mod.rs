//! Persistence Layer (C2): SQLite is the system of record; a JSON file tree
//! under `storage_dir` mirrors it for disaster recovery and for the
//! file-only fallback mode used when the database cannot be opened.
//!
//! Schema and connection handling follow the teacher's `VaultDb` pattern:
//! a single `Arc<Mutex<Connection>>`, WAL mode, `ON CONFLICT ... DO UPDATE`
//! upserts, and `prepare_cached` for the hot read paths.

pub mod json_mirror;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Position, Strategy, Trade, WalletSnapshot};

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening sqlite db at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("setting WAL journal mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Escape hatch for modules that own their own table (e.g. the
    /// supplemental document store) without growing this struct's surface
    /// for every such table.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS live_positions (
                id                TEXT PRIMARY KEY,
                position_id       TEXT NOT NULL,
                symbol            TEXT NOT NULL,
                trading_mode      TEXT NOT NULL,
                status            TEXT,
                wallet_id         TEXT,
                entry_price       REAL NOT NULL,
                quantity          REAL NOT NULL,
                entry_value       REAL NOT NULL,
                current_price     REAL,
                unrealized_pnl    REAL,
                stop_loss_price   REAL,
                take_profit_price REAL,
                trailing_stop_percent REAL,
                trailing_activated    INTEGER,
                peak_price        REAL,
                trough_price      REAL,
                time_exit_hours   REAL,
                exit_time         TEXT,
                analytics_json    TEXT NOT NULL DEFAULT '{}',
                created_date      TEXT NOT NULL,
                updated_date      TEXT NOT NULL,
                entry_timestamp   TEXT NOT NULL,
                last_price_update TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_position_id
                ON live_positions(position_id)
                WHERE status IS NULL OR status != 'deleted';
            CREATE INDEX IF NOT EXISTS idx_positions_symbol_mode
                ON live_positions(symbol, trading_mode, status);

            CREATE TABLE IF NOT EXISTS trades (
                id                TEXT PRIMARY KEY,
                position_id       TEXT NOT NULL,
                symbol            TEXT NOT NULL,
                side              TEXT NOT NULL,
                trading_mode      TEXT NOT NULL,
                strategy_name     TEXT NOT NULL,
                entry_price       REAL NOT NULL,
                exit_price        REAL NOT NULL,
                quantity          REAL NOT NULL,
                pnl_usdt          REAL NOT NULL,
                pnl_percent       REAL NOT NULL,
                commission        REAL NOT NULL DEFAULT 0,
                exit_reason       TEXT NOT NULL,
                entry_analytics_json TEXT NOT NULL DEFAULT '{}',
                exit_analytics_json  TEXT NOT NULL DEFAULT '{}',
                entry_timestamp   TEXT NOT NULL,
                exit_timestamp    TEXT NOT NULL,
                created_date      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_position_id ON trades(position_id);
            CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy_name, trading_mode);

            CREATE TABLE IF NOT EXISTS backtest_combinations (
                id                    TEXT PRIMARY KEY,
                strategy_name         TEXT NOT NULL,
                combination_signature TEXT,
                coin                  TEXT NOT NULL,
                timeframe             TEXT NOT NULL,
                success_rate          REAL NOT NULL DEFAULT 0,
                occurrences           INTEGER NOT NULL DEFAULT 0,
                profit_factor         REAL NOT NULL DEFAULT 0,
                regime_performance_json TEXT NOT NULL DEFAULT '{}',
                max_drawdown_percent  REAL NOT NULL DEFAULT 0,
                win_loss_ratio        REAL NOT NULL DEFAULT 0,
                consecutive_wins      INTEGER NOT NULL DEFAULT 0,
                consecutive_losses    INTEGER NOT NULL DEFAULT 0,
                avg_exit_time_hours   REAL NOT NULL DEFAULT 0,
                backtest_exit_reason_breakdown_json TEXT NOT NULL DEFAULT '{}',
                included_in_scanner      INTEGER NOT NULL DEFAULT 0,
                included_in_live_scanner INTEGER NOT NULL DEFAULT 0,
                is_event_driven_strategy INTEGER NOT NULL DEFAULT 0,
                live_json             TEXT NOT NULL DEFAULT '{}',
                created_date          TEXT NOT NULL,
                updated_date          TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_strategies_name_coin_tf
                ON backtest_combinations(strategy_name, coin, timeframe);

            CREATE TABLE IF NOT EXISTS wallet_config (
                id                  TEXT PRIMARY KEY,
                trading_mode        TEXT NOT NULL,
                wallet_id           TEXT,
                balances_json       TEXT NOT NULL DEFAULT '{}',
                total_realized_pnl  REAL NOT NULL DEFAULT 0,
                winning_count       INTEGER NOT NULL DEFAULT 0,
                losing_count        INTEGER NOT NULL DEFAULT 0,
                gross_profit        REAL NOT NULL DEFAULT 0,
                gross_loss          REAL NOT NULL DEFAULT 0,
                total_fees          REAL NOT NULL DEFAULT 0,
                updated_date        TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_mode_id
                ON wallet_config(trading_mode, COALESCE(wallet_id, ''));
            "#,
        )?;
        Ok(())
    }

    // ---- positions ----------------------------------------------------

    pub fn upsert_position(&self, p: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO live_positions (
                id, position_id, symbol, trading_mode, status, wallet_id,
                entry_price, quantity, entry_value, current_price, unrealized_pnl,
                stop_loss_price, take_profit_price, trailing_stop_percent, trailing_activated,
                peak_price, trough_price, time_exit_hours, exit_time, analytics_json,
                created_date, updated_date, entry_timestamp, last_price_update
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24
            )
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                current_price = excluded.current_price,
                unrealized_pnl = excluded.unrealized_pnl,
                stop_loss_price = excluded.stop_loss_price,
                take_profit_price = excluded.take_profit_price,
                trailing_stop_percent = excluded.trailing_stop_percent,
                trailing_activated = excluded.trailing_activated,
                peak_price = excluded.peak_price,
                trough_price = excluded.trough_price,
                time_exit_hours = excluded.time_exit_hours,
                exit_time = excluded.exit_time,
                analytics_json = excluded.analytics_json,
                updated_date = excluded.updated_date,
                last_price_update = excluded.last_price_update
            "#,
            params![
                p.id.to_string(),
                p.position_id,
                p.symbol,
                p.trading_mode.as_str(),
                p.status.as_str(),
                p.wallet_id,
                p.entry_price,
                p.quantity,
                p.entry_value,
                p.current_price,
                p.unrealized_pnl,
                p.stop_loss_price,
                p.take_profit_price,
                p.trailing_stop_percent,
                p.trailing_activated,
                p.peak_price,
                p.trough_price,
                p.time_exit_hours,
                p.exit_time.map(|t| t.to_rfc3339()),
                serde_json::to_string(&p.analytics)?,
                p.created_date.to_rfc3339(),
                p.updated_date.to_rfc3339(),
                p.entry_timestamp.to_rfc3339(),
                p.last_price_update.map(|t| t.to_rfc3339()),
            ],
        )?;
        drop(conn);

        // Visibility check: a fresh read-back by primary key, and by the
        // listing query the Gateway actually serves, must both see the row
        // we just wrote before this call returns success to the caller.
        std::thread::sleep(Duration::from_millis(50));
        let by_pk = self.get_position_by_id(p.id)?;
        anyhow::ensure!(by_pk.is_some(), "position {} not visible after write", p.id);
        let visible_in_listing = self
            .list_positions(Some(p.trading_mode.as_str()))?
            .into_iter()
            .any(|row| row.id == p.id);
        anyhow::ensure!(
            visible_in_listing,
            "position {} not visible in listing query after write",
            p.id
        );
        Ok(())
    }

    pub fn get_position_by_id(&self, id: Uuid) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM live_positions WHERE id = ?1")?;
        stmt.query_row(params![id.to_string()], row_to_position)
            .optional()
            .context("reading position by id")
    }

    pub fn get_position_by_position_id(&self, position_id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM live_positions WHERE position_id = ?1 AND (status IS NULL OR status != 'deleted')",
        )?;
        stmt.query_row(params![position_id], row_to_position)
            .optional()
            .context("reading position by position_id")
    }

    pub fn list_positions(&self, trading_mode: Option<&str>) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        if let Some(mode) = trading_mode {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM live_positions WHERE trading_mode = ?1 AND (status IS NULL OR status != 'deleted') ORDER BY entry_timestamp DESC",
            )?;
            let rows = stmt.query_map(params![mode], row_to_position)?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT * FROM live_positions WHERE status IS NULL OR status != 'deleted' ORDER BY entry_timestamp DESC",
            )?;
            let rows = stmt.query_map([], row_to_position)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    pub fn delete_position(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE live_positions SET status = 'deleted', updated_date = ?2 WHERE id = ?1",
            params![id.to_string(), chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// DB-fallback purge for the dust sweep when nothing turned up in the
    /// in-memory/query view: deletes any open position row for the pair
    /// directly and reports how many were affected.
    pub fn delete_open_positions_for_symbol(&self, symbol: &str, trading_mode: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE live_positions SET status = 'deleted', updated_date = ?3 WHERE symbol = ?1 AND trading_mode = ?2 AND status = 'open'",
            params![symbol, trading_mode, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(affected as u64)
    }

    // ---- trades ---------------------------------------------------------

    /// Inserts a trade, applying the Trade Ledger's dedup rule: if a row
    /// already exists with the same `position_id`, or (falling back) the
    /// same characteristic tuple, the existing row is merged with any new
    /// exit fields via `ON CONFLICT (id) DO UPDATE` and its id is returned.
    /// Returns `(id, was_new)`.
    pub fn upsert_trade(&self, t: &Trade) -> Result<(Uuid, bool)> {
        let conn = self.conn.lock();

        let existing_id = find_duplicate_trade(&conn, t)?;
        let row_id = existing_id.unwrap_or(t.id);
        let was_new = existing_id.is_none();

        conn.execute(
            r#"
            INSERT INTO trades (
                id, position_id, symbol, side, trading_mode, strategy_name,
                entry_price, exit_price, quantity, pnl_usdt, pnl_percent, commission,
                exit_reason, entry_analytics_json, exit_analytics_json,
                entry_timestamp, exit_timestamp, created_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                exit_price = excluded.exit_price,
                pnl_usdt = excluded.pnl_usdt,
                pnl_percent = excluded.pnl_percent,
                commission = excluded.commission,
                exit_reason = excluded.exit_reason,
                exit_analytics_json = excluded.exit_analytics_json,
                exit_timestamp = excluded.exit_timestamp
            "#,
            params![
                row_id.to_string(),
                t.position_id,
                t.symbol,
                match t.side {
                    crate::models::Side::Buy => "BUY",
                    crate::models::Side::Sell => "SELL",
                },
                t.trading_mode,
                t.strategy_name,
                t.entry_price,
                t.exit_price,
                t.quantity,
                t.pnl_usdt,
                t.pnl_percent,
                t.commission,
                t.exit_reason.as_str(),
                serde_json::to_string(&t.entry_analytics)?,
                serde_json::to_string(&t.exit_analytics)?,
                t.entry_timestamp.to_rfc3339(),
                t.exit_timestamp.to_rfc3339(),
                t.created_date.to_rfc3339(),
            ],
        )?;
        drop(conn);

        std::thread::sleep(Duration::from_millis(50));
        anyhow::ensure!(
            self.get_trade_by_id(row_id)?.is_some(),
            "trade {} not visible after write",
            row_id
        );
        Ok((row_id, was_new))
    }

    pub fn get_trade_by_id(&self, id: Uuid) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM trades WHERE id = ?1")?;
        stmt.query_row(params![id.to_string()], row_to_trade)
            .optional()
            .context("reading trade by id")
    }

    pub fn list_trades(&self, trading_mode: Option<&str>) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        if let Some(mode) = trading_mode {
            let mut stmt = conn
                .prepare_cached("SELECT * FROM trades WHERE trading_mode = ?1 ORDER BY exit_timestamp DESC")?;
            for row in stmt.query_map(params![mode], row_to_trade)? {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare_cached("SELECT * FROM trades ORDER BY exit_timestamp DESC")?;
            for row in stmt.query_map([], row_to_trade)? {
                out.push(row?);
            }
        }
        // Rows with non-finite P&L or a zero quantity are corrupt (most
        // likely a partially-written backtest import) and are filtered out
        // of every read path rather than surfaced to clients.
        Ok(out
            .into_iter()
            .filter(|t| t.quantity > 0.0 && t.pnl_usdt.is_finite() && t.pnl_percent.is_finite())
            .collect())
    }

    pub fn delete_trades_where_invalid(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM trades WHERE quantity <= 0 OR entry_price <= 0 OR exit_price <= 0",
            [],
        )?;
        Ok(deleted as u64)
    }

    /// Overwrites a trade's financial fields in place. Used by the
    /// `recalculate-pnl` maintenance operation once it has recomputed values
    /// that drift too far from what's stored.
    pub fn update_trade_financials(&self, id: Uuid, pnl_usdt: f64, pnl_percent: f64, commission: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET pnl_usdt = ?2, pnl_percent = ?3, commission = ?4 WHERE id = ?1",
            params![id.to_string(), pnl_usdt, pnl_percent, commission],
        )?;
        Ok(())
    }

    /// Overwrites a trade's `entry_price` in place. Used by the
    /// `fix-entry-prices` maintenance operation to repair rows imported with
    /// a missing or non-positive entry price.
    pub fn update_trade_entry_price(&self, id: Uuid, entry_price: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET entry_price = ?2 WHERE id = ?1",
            params![id.to_string(), entry_price],
        )?;
        Ok(())
    }

    pub fn delete_trades_by_ids(&self, ids: &[Uuid]) -> Result<u64> {
        let conn = self.conn.lock();
        let mut deleted = 0u64;
        for id in ids {
            deleted += conn.execute("DELETE FROM trades WHERE id = ?1", params![id.to_string()])? as u64;
        }
        Ok(deleted)
    }

    /// `/api/database/optimize-trades`: the six partial indexes the trade
    /// filter query (`symbol`, `trading_mode`, `exit_timestamp`, `trade_id`,
    /// `orderBy`) relies on, created idempotently. Returns how many index
    /// statements ran (always 6; `CREATE INDEX IF NOT EXISTS` is a no-op on
    /// a second call).
    pub fn ensure_trade_indexes(&self) -> Result<u64> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_trading_mode ON trades(trading_mode);
            CREATE INDEX IF NOT EXISTS idx_trades_exit_timestamp
                ON trades(exit_timestamp) WHERE exit_timestamp IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_trades_exit_reason ON trades(exit_reason);
            CREATE INDEX IF NOT EXISTS idx_trades_created_date ON trades(created_date);
            CREATE INDEX IF NOT EXISTS idx_trades_symbol_mode_exit
                ON trades(symbol, trading_mode, exit_timestamp);
            "#,
        )?;
        Ok(6)
    }

    // ---- strategies -------------------------------------------------------

    pub fn upsert_strategy(&self, s: &Strategy) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO backtest_combinations (
                id, strategy_name, combination_signature, coin, timeframe,
                success_rate, occurrences, profit_factor, regime_performance_json,
                max_drawdown_percent, win_loss_ratio, consecutive_wins, consecutive_losses,
                avg_exit_time_hours, backtest_exit_reason_breakdown_json,
                included_in_scanner, included_in_live_scanner, is_event_driven_strategy,
                live_json, created_date, updated_date
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
            ON CONFLICT(strategy_name, coin, timeframe) DO UPDATE SET
                success_rate = excluded.success_rate,
                occurrences = excluded.occurrences,
                profit_factor = excluded.profit_factor,
                regime_performance_json = excluded.regime_performance_json,
                max_drawdown_percent = excluded.max_drawdown_percent,
                win_loss_ratio = excluded.win_loss_ratio,
                consecutive_wins = excluded.consecutive_wins,
                consecutive_losses = excluded.consecutive_losses,
                avg_exit_time_hours = excluded.avg_exit_time_hours,
                backtest_exit_reason_breakdown_json = excluded.backtest_exit_reason_breakdown_json,
                included_in_scanner = excluded.included_in_scanner,
                included_in_live_scanner = excluded.included_in_live_scanner,
                is_event_driven_strategy = excluded.is_event_driven_strategy,
                live_json = excluded.live_json,
                updated_date = excluded.updated_date
            "#,
            params![
                s.id.to_string(),
                s.strategy_name,
                s.combination_signature,
                s.coin,
                s.timeframe,
                s.success_rate,
                s.occurrences as i64,
                s.profit_factor,
                s.regime_performance.to_string(),
                s.max_drawdown_percent,
                s.win_loss_ratio,
                s.consecutive_wins as i64,
                s.consecutive_losses as i64,
                s.avg_exit_time_hours,
                s.backtest_exit_reason_breakdown.to_string(),
                s.included_in_scanner as i64,
                s.included_in_live_scanner as i64,
                s.is_event_driven_strategy as i64,
                serde_json::to_string(&s.live)?,
                s.created_date.to_rfc3339(),
                s.updated_date.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_strategies(&self) -> Result<Vec<Strategy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT * FROM backtest_combinations ORDER BY strategy_name")?;
        let mut out = Vec::new();
        for row in stmt.query_map([], row_to_strategy)? {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_strategy(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM backtest_combinations WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    pub fn delete_strategies_by_ids(&self, ids: &[Uuid]) -> Result<u64> {
        let conn = self.conn.lock();
        let mut deleted = 0u64;
        for id in ids {
            deleted += conn.execute("DELETE FROM backtest_combinations WHERE id = ?1", params![id.to_string()])? as u64;
        }
        Ok(deleted)
    }

    // ---- wallet snapshots ---------------------------------------------

    pub fn upsert_wallet_snapshot(&self, w: &WalletSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO wallet_config (
                id, trading_mode, wallet_id, balances_json, total_realized_pnl,
                winning_count, losing_count, gross_profit, gross_loss, total_fees, updated_date
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
            ON CONFLICT(trading_mode, COALESCE(wallet_id, '')) DO UPDATE SET
                balances_json = excluded.balances_json,
                total_realized_pnl = excluded.total_realized_pnl,
                winning_count = excluded.winning_count,
                losing_count = excluded.losing_count,
                gross_profit = excluded.gross_profit,
                gross_loss = excluded.gross_loss,
                total_fees = excluded.total_fees,
                updated_date = excluded.updated_date
            "#,
            params![
                w.id.to_string(),
                w.trading_mode.as_str(),
                w.wallet_id,
                w.balances.to_string(),
                w.total_realized_pnl,
                w.winning_count as i64,
                w.losing_count as i64,
                w.gross_profit,
                w.gross_loss,
                w.total_fees,
                w.updated_date.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_wallet_snapshot(&self, trading_mode: &str, wallet_id: Option<&str>) -> Result<Option<WalletSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM wallet_config WHERE trading_mode = ?1 AND COALESCE(wallet_id, '') = COALESCE(?2, '')",
        )?;
        stmt.query_row(params![trading_mode, wallet_id], row_to_wallet_snapshot)
            .optional()
            .context("reading wallet snapshot")
    }
}

fn find_duplicate_trade(conn: &Connection, t: &Trade) -> Result<Option<Uuid>> {
    // Primary key: an exit already recorded for this position_id.
    let mut stmt = conn.prepare_cached("SELECT id FROM trades WHERE position_id = ?1 LIMIT 1")?;
    let by_position: Option<String> = stmt
        .query_row(params![t.position_id], |row| row.get(0))
        .optional()?;
    if let Some(id) = by_position {
        return Ok(Some(Uuid::parse_str(&id)?));
    }

    // Fallback: characteristic-tuple match, for a retry that regenerated
    // position_id. entry/exit price within 0.0001, quantity within 1e-6,
    // exact trading_mode, and entry_timestamp within a 1s window around the
    // new trade's own entry_timestamp snapped to the nearest 2s grid point
    // (absorbs sub-second jitter from repeated client-side serialization).
    let mut stmt = conn.prepare_cached(
        r#"SELECT id, entry_timestamp FROM trades
           WHERE symbol = ?1 AND strategy_name = ?2 AND trading_mode = ?3
             AND ABS(entry_price - ?4) < 0.0001
             AND ABS(exit_price - ?5) < 0.0001
             AND ABS(quantity - ?6) < 0.000001
             AND exit_timestamp IS NOT NULL"#,
    )?;
    let grid_bucket = two_second_grid_bucket(t.entry_timestamp);
    let mut rows = stmt.query(params![
        t.symbol,
        t.strategy_name,
        t.trading_mode,
        t.entry_price,
        t.exit_price,
        t.quantity,
    ])?;
    while let Some(row) = rows.next()? {
        let candidate_ts: String = row.get(1)?;
        let candidate_epoch = parse_dt(&candidate_ts)?.timestamp();
        if (candidate_epoch - grid_bucket).abs() <= 1 {
            let id: String = row.get(0)?;
            return Ok(Some(Uuid::parse_str(&id)?));
        }
    }
    Ok(None)
}

/// Snaps a timestamp to the nearest 2-second grid point, in epoch seconds.
fn two_second_grid_bucket(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ((ts.timestamp() as f64 / 2.0).round() as i64) * 2
}

fn parse_dt(s: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_dt_opt(s: Option<String>) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn row_to_position(row: &Row) -> rusqlite::Result<Position> {
    use crate::models::{EntryAnalytics, PositionStatus, TradingMode};

    let analytics_json: String = row.get("analytics_json")?;
    let analytics: EntryAnalytics = serde_json::from_str(&analytics_json).unwrap_or_default();
    let trading_mode_str: String = row.get("trading_mode")?;
    let status_str: Option<String> = row.get("status")?;

    Ok(Position {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).map_err(bad_uuid)?,
        position_id: row.get("position_id")?,
        symbol: row.get("symbol")?,
        trading_mode: TradingMode::parse(&trading_mode_str).unwrap_or(TradingMode::Testnet),
        status: PositionStatus::from_nullable(status_str.as_deref()),
        wallet_id: row.get("wallet_id")?,
        entry_price: row.get("entry_price")?,
        quantity: row.get("quantity")?,
        entry_value: row.get("entry_value")?,
        current_price: row.get("current_price")?,
        unrealized_pnl: row.get("unrealized_pnl")?,
        stop_loss_price: row.get("stop_loss_price")?,
        take_profit_price: row.get("take_profit_price")?,
        trailing_stop_percent: row.get("trailing_stop_percent")?,
        trailing_activated: row.get("trailing_activated")?,
        peak_price: row.get("peak_price")?,
        trough_price: row.get("trough_price")?,
        time_exit_hours: row.get("time_exit_hours")?,
        exit_time: parse_dt_opt(row.get("exit_time")?)?,
        analytics,
        created_date: parse_dt(&row.get::<_, String>("created_date")?)?,
        updated_date: parse_dt(&row.get::<_, String>("updated_date")?)?,
        entry_timestamp: parse_dt(&row.get::<_, String>("entry_timestamp")?)?,
        last_price_update: parse_dt_opt(row.get("last_price_update")?)?,
    })
}

fn row_to_trade(row: &Row) -> rusqlite::Result<Trade> {
    use crate::models::{EntryAnalytics, ExitAnalytics, ExitReason, Side};

    let side_str: String = row.get("side")?;
    let side = if side_str.eq_ignore_ascii_case("SELL") {
        Side::Sell
    } else {
        Side::Buy
    };
    let entry_analytics: EntryAnalytics =
        serde_json::from_str(&row.get::<_, String>("entry_analytics_json")?).unwrap_or_default();
    let exit_analytics: ExitAnalytics =
        serde_json::from_str(&row.get::<_, String>("exit_analytics_json")?).unwrap_or_default();

    Ok(Trade {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).map_err(bad_uuid)?,
        position_id: row.get("position_id")?,
        symbol: row.get("symbol")?,
        side,
        trading_mode: row.get("trading_mode")?,
        strategy_name: row.get("strategy_name")?,
        entry_price: row.get("entry_price")?,
        exit_price: row.get("exit_price")?,
        quantity: row.get("quantity")?,
        pnl_usdt: row.get("pnl_usdt")?,
        pnl_percent: row.get("pnl_percent")?,
        commission: row.get("commission")?,
        exit_reason: ExitReason::parse(&row.get::<_, String>("exit_reason")?),
        entry_analytics,
        exit_analytics,
        entry_timestamp: parse_dt(&row.get::<_, String>("entry_timestamp")?)?,
        exit_timestamp: parse_dt(&row.get::<_, String>("exit_timestamp")?)?,
        created_date: parse_dt(&row.get::<_, String>("created_date")?)?,
    })
}

fn row_to_strategy(row: &Row) -> rusqlite::Result<Strategy> {
    use crate::models::LiveStrategyStats;

    let live: LiveStrategyStats =
        serde_json::from_str(&row.get::<_, String>("live_json")?).unwrap_or_default();
    let regime_performance: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>("regime_performance_json")?).unwrap_or_default();
    let backtest_exit_reason_breakdown: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>("backtest_exit_reason_breakdown_json")?)
            .unwrap_or_default();

    Ok(Strategy {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).map_err(bad_uuid)?,
        strategy_name: row.get("strategy_name")?,
        combination_signature: row.get("combination_signature")?,
        coin: row.get("coin")?,
        timeframe: row.get("timeframe")?,
        success_rate: row.get("success_rate")?,
        occurrences: row.get::<_, i64>("occurrences")? as u64,
        profit_factor: row.get("profit_factor")?,
        regime_performance,
        max_drawdown_percent: row.get("max_drawdown_percent")?,
        win_loss_ratio: row.get("win_loss_ratio")?,
        consecutive_wins: row.get::<_, i64>("consecutive_wins")? as u64,
        consecutive_losses: row.get::<_, i64>("consecutive_losses")? as u64,
        avg_exit_time_hours: row.get("avg_exit_time_hours")?,
        backtest_exit_reason_breakdown,
        included_in_scanner: row.get::<_, i64>("included_in_scanner")? != 0,
        included_in_live_scanner: row.get::<_, i64>("included_in_live_scanner")? != 0,
        is_event_driven_strategy: row.get::<_, i64>("is_event_driven_strategy")? != 0,
        live,
        created_date: parse_dt(&row.get::<_, String>("created_date")?)?,
        updated_date: parse_dt(&row.get::<_, String>("updated_date")?)?,
    })
}

fn row_to_wallet_snapshot(row: &Row) -> rusqlite::Result<WalletSnapshot> {
    use crate::models::TradingMode;
    let trading_mode_str: String = row.get("trading_mode")?;
    let balances: serde_json::Value =
        serde_json::from_str(&row.get::<_, String>("balances_json")?).unwrap_or_default();
    Ok(WalletSnapshot {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).map_err(bad_uuid)?,
        trading_mode: TradingMode::parse(&trading_mode_str).unwrap_or(TradingMode::Testnet),
        wallet_id: row.get("wallet_id")?,
        balances,
        total_realized_pnl: row.get("total_realized_pnl")?,
        winning_count: row.get::<_, i64>("winning_count")? as u64,
        losing_count: row.get::<_, i64>("losing_count")? as u64,
        gross_profit: row.get("gross_profit")?,
        gross_loss: row.get("gross_loss")?,
        total_fees: row.get("total_fees")?,
        updated_date: parse_dt(&row.get::<_, String>("updated_date")?)?,
    })
}

fn bad_uuid(e: uuid::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAnalytics, ExitAnalytics, ExitReason, PositionStatus, Side, TradingMode};
    use chrono::Utc;

    fn sample_position() -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            position_id: format!("pos-{}", Uuid::new_v4()),
            symbol: "BTC/USDT".into(),
            trading_mode: TradingMode::Testnet,
            status: PositionStatus::Open,
            wallet_id: None,
            entry_price: 50_000.0,
            quantity: 0.01,
            entry_value: 500.0,
            current_price: None,
            unrealized_pnl: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_percent: None,
            trailing_activated: None,
            peak_price: None,
            trough_price: None,
            time_exit_hours: Some(24.0),
            exit_time: None,
            analytics: EntryAnalytics::default(),
            created_date: now,
            updated_date: now,
            entry_timestamp: now,
            last_price_update: None,
        }
    }

    fn sample_trade(position_id: &str) -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v4(),
            position_id: position_id.to_string(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            trading_mode: "testnet".into(),
            strategy_name: "Momentum Breakout".into(),
            entry_price: 50_000.0,
            exit_price: 51_000.0,
            quantity: 0.01,
            pnl_usdt: 10.0,
            pnl_percent: 2.0,
            commission: 0.5,
            exit_reason: ExitReason::TakeProfit,
            entry_analytics: EntryAnalytics::default(),
            exit_analytics: ExitAnalytics::default(),
            entry_timestamp: now,
            exit_timestamp: now,
            created_date: now,
        }
    }

    #[test]
    fn position_round_trips_through_sqlite() {
        let db = Db::open_in_memory().unwrap();
        let p = sample_position();
        db.upsert_position(&p).unwrap();
        let back = db.get_position_by_id(p.id).unwrap().unwrap();
        assert_eq!(back.position_id, p.position_id);
        assert_eq!(back.entry_price, p.entry_price);
        assert_eq!(back.time_exit_hours, p.time_exit_hours);
    }

    #[test]
    fn duplicate_trade_by_position_id_does_not_insert_twice() {
        let db = Db::open_in_memory().unwrap();
        let t1 = sample_trade("pos-dedup-1");
        let (id1, new1) = db.upsert_trade(&t1).unwrap();
        assert!(new1);

        let mut t2 = sample_trade("pos-dedup-1");
        t2.exit_price = 52_000.0;
        let (id2, new2) = db.upsert_trade(&t2).unwrap();
        assert_eq!(id1, id2);
        assert!(!new2);

        let stored = db.get_trade_by_id(id1).unwrap().unwrap();
        assert_eq!(stored.exit_price, 52_000.0);
    }

    #[test]
    fn duplicate_trade_by_characteristic_tuple_is_caught_without_shared_position_id() {
        let db = Db::open_in_memory().unwrap();
        let t1 = sample_trade("pos-a");
        db.upsert_trade(&t1).unwrap();

        let mut t2 = sample_trade("pos-b");
        t2.entry_timestamp = t1.entry_timestamp;
        let (_, is_new) = db.upsert_trade(&t2).unwrap();
        assert!(!is_new, "same symbol/strategy/side/entry should dedup");
    }

    #[test]
    fn invalid_trades_are_excluded_from_listing() {
        let db = Db::open_in_memory().unwrap();
        let mut bad = sample_trade("pos-bad");
        bad.quantity = 0.0;
        db.upsert_trade(&bad).unwrap();
        let good = sample_trade("pos-good");
        db.upsert_trade(&good).unwrap();

        let trades = db.list_trades(None).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].position_id, "pos-good");
    }
}
