//! Trade Ledger (C3): the append-mostly record of closed trades. Writes are
//! idempotent under the dedup rule in [`crate::persistence::Db::upsert_trade`];
//! this module adds the P&L sanity check, the fire-and-forget strategy
//! refresh trigger, and the read-side filtering the Gateway serves through.

use anyhow::Result;
use std::sync::Arc;

use crate::error::CoreError;
use crate::models::Trade;
use crate::persistence::Db;
use crate::strategy::StrategyAggregator;

pub struct TradeLedger {
    db: Db,
    strategy_aggregator: Arc<StrategyAggregator>,
}

impl TradeLedger {
    pub fn new(db: Db, strategy_aggregator: Arc<StrategyAggregator>) -> Self {
        Self {
            db,
            strategy_aggregator,
        }
    }

    /// Records a trade. If the P&L on the row disagrees with what the entry
    /// and exit prices imply by more than a cent, the stored value is
    /// replaced with the recomputed one rather than rejecting the write —
    /// clients are trusted for context, not arithmetic.
    pub async fn record_trade(&self, mut trade: Trade) -> Result<(uuid::Uuid, bool), CoreError> {
        let expected = trade.expected_pnl_usdt();
        if (expected - trade.pnl_usdt).abs() > 0.01 {
            tracing::warn!(
                position_id = %trade.position_id,
                submitted = trade.pnl_usdt,
                recomputed = expected,
                "trade pnl_usdt disagreed with entry/exit prices, recomputing"
            );
            trade.pnl_usdt = expected;
        }

        let (id, was_new) = self.db.upsert_trade(&trade).map_err(CoreError::Persistence)?;

        if was_new {
            // Fire-and-forget: the Gateway response must not wait on KPI
            // recomputation, and a failure here must not fail the insert.
            let aggregator = self.strategy_aggregator.clone();
            let strategy_name = trade.strategy_name.clone();
            tokio::spawn(async move {
                if let Err(e) = aggregator.refresh_strategy(&strategy_name).await {
                    tracing::warn!(error = %e, strategy_name, "post-insert strategy refresh failed");
                }
            });
        }

        Ok((id, was_new))
    }

    pub fn list_trades(&self, trading_mode: Option<&str>) -> Result<Vec<Trade>, CoreError> {
        self.db.list_trades(trading_mode).map_err(CoreError::Persistence)
    }

    /// Bulk import path used for backtest result ingestion; each row still
    /// goes through the same dedup rule as a single insert. `saved` counts
    /// genuinely new rows, `updated` counts rows merged into an existing
    /// dedup match via the `ON CONFLICT DO UPDATE` exit-field merge.
    pub async fn bulk_insert(&self, trades: Vec<Trade>) -> Result<BulkInsertReport, CoreError> {
        let mut report = BulkInsertReport::default();
        for trade in trades {
            match self.record_trade(trade).await {
                Ok((_, true)) => report.saved += 1,
                Ok((_, false)) => report.updated += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Drops rows whose quantity or prices are non-positive; used by the
    /// `/api/trades/clean-invalid` maintenance endpoint.
    pub fn delete_invalid_trades(&self) -> Result<u64, CoreError> {
        self.db.delete_trades_where_invalid().map_err(CoreError::Persistence)
    }

    /// Walks every trade with a valid exit (`exit_timestamp` set, prices and
    /// quantity positive) and recomputes `pnl_usdt`/`pnl_percent`/commission
    /// from entry/exit price and quantity with a 0.1% commission on each
    /// side, rewriting the row whenever the recomputed P&L drifts more than
    /// 0.01 from what's stored.
    pub fn recalculate_pnl(&self) -> Result<u64, CoreError> {
        let trades = self.db.list_trades(None).map_err(CoreError::Persistence)?;
        let mut updated = 0u64;
        for t in trades {
            if t.entry_price <= 0.0 || t.exit_price <= 0.0 || t.quantity <= 0.0 {
                continue;
            }
            let entry_value = t.entry_price * t.quantity;
            let exit_value = t.exit_price * t.quantity;
            let commission = 0.001 * entry_value + 0.001 * exit_value;
            let gross_pnl = (t.exit_price - t.entry_price) * t.quantity * t.side.direction();
            let recomputed_pnl = gross_pnl - commission;
            let recomputed_pct = if entry_value != 0.0 { recomputed_pnl / entry_value * 100.0 } else { 0.0 };

            if (recomputed_pnl - t.pnl_usdt).abs() > 0.01 {
                self.db
                    .update_trade_financials(t.id, recomputed_pnl, recomputed_pct, commission)
                    .map_err(CoreError::Persistence)?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Scans for trades sharing a `position_id` — a dedup miss from before
    /// the characteristic-tuple fallback existed, or a manual DB edit — and
    /// removes every row but the earliest-created one.
    pub fn remove_duplicate_trades(&self) -> Result<u64, CoreError> {
        let mut trades = self.db.list_trades(None).map_err(CoreError::Persistence)?;
        trades.sort_by_key(|t| t.created_date);

        let mut seen = std::collections::HashSet::new();
        let mut doomed = Vec::new();
        for t in trades {
            if !seen.insert(t.position_id.clone()) {
                doomed.push(t.id);
            }
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        self.db.delete_trades_by_ids(&doomed).map_err(CoreError::Persistence)
    }

    /// Repairs trades imported with a non-positive `entry_price` by
    /// inverting the P&L formula: `entry_price = exit_price - (pnl_usdt +
    /// commission) / (quantity * direction)`. Rows where that still doesn't
    /// yield a positive price are left alone and reported as unfixed.
    pub fn fix_entry_prices(&self) -> Result<u64, CoreError> {
        let trades = self.db.list_trades(None).map_err(CoreError::Persistence)?;
        let mut fixed = 0u64;
        for t in trades {
            if t.entry_price > 0.0 || t.quantity <= 0.0 {
                continue;
            }
            let direction = t.side.direction();
            let implied_entry = t.exit_price - (t.pnl_usdt + t.commission) / (t.quantity * direction);
            if implied_entry > 0.0 {
                self.db
                    .update_trade_entry_price(t.id, implied_entry)
                    .map_err(CoreError::Persistence)?;
                fixed += 1;
            }
        }
        Ok(fixed)
    }

    pub fn delete_trades_by_ids(&self, ids: &[uuid::Uuid]) -> Result<u64, CoreError> {
        self.db.delete_trades_by_ids(ids).map_err(CoreError::Persistence)
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BulkInsertReport {
    pub saved: u64,
    pub updated: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAnalytics, ExitAnalytics, ExitReason, Side};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_trade() -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v4(),
            position_id: format!("pos-{}", Uuid::new_v4()),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            trading_mode: "testnet".into(),
            strategy_name: "Momentum Breakout".into(),
            entry_price: 50_000.0,
            exit_price: 51_000.0,
            quantity: 0.01,
            pnl_usdt: 999.0, // deliberately wrong, should be recomputed
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

    #[tokio::test]
    async fn bad_submitted_pnl_is_silently_recomputed() {
        let db = Db::open_in_memory().unwrap();
        let aggregator = Arc::new(StrategyAggregator::new(db.clone()));
        let ledger = TradeLedger::new(db.clone(), aggregator);

        let trade = sample_trade();
        let expected = trade.expected_pnl_usdt();
        let (id, was_new) = ledger.record_trade(trade).await.unwrap();
        assert!(was_new);

        let stored = db.get_trade_by_id(id).unwrap().unwrap();
        assert!((stored.pnl_usdt - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn bulk_insert_of_zero_rows_reports_zero() {
        let db = Db::open_in_memory().unwrap();
        let aggregator = Arc::new(StrategyAggregator::new(db.clone()));
        let ledger = TradeLedger::new(db, aggregator);

        let report = ledger.bulk_insert(vec![]).await.unwrap();
        assert_eq!(report.saved, 0);
        assert_eq!(report.updated, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn recalculate_pnl_rewrites_drifted_rows() {
        let db = Db::open_in_memory().unwrap();
        let aggregator = Arc::new(StrategyAggregator::new(db.clone()));
        let ledger = TradeLedger::new(db.clone(), aggregator);

        let mut trade = sample_trade();
        trade.entry_price = 3800.0;
        trade.quantity = 0.01;
        trade.commission = 0.5;
        trade.exit_price = 3850.0;
        trade.pnl_usdt = trade.expected_pnl_usdt();
        let (id, _) = ledger.record_trade(trade).await.unwrap();

        db.update_trade_financials(id, 0.0, 0.0, 0.0).unwrap();

        let updated = ledger.recalculate_pnl().unwrap();
        assert_eq!(updated, 1);

        let stored = db.get_trade_by_id(id).unwrap().unwrap();
        let expected_commission = 0.001 * 3800.0 * 0.01 + 0.001 * 3850.0 * 0.01;
        let expected_pnl = (3850.0 - 3800.0) * 0.01 - expected_commission;
        assert!((stored.pnl_usdt - expected_pnl).abs() < 0.01);
        assert!((stored.commission - expected_commission).abs() < 1e-9);
    }

    #[tokio::test]
    async fn remove_duplicate_trades_is_a_noop_with_unique_position_ids() {
        let db = Db::open_in_memory().unwrap();
        let aggregator = Arc::new(StrategyAggregator::new(db.clone()));
        let ledger = TradeLedger::new(db.clone(), aggregator);

        ledger.record_trade(sample_trade()).await.unwrap();
        let mut other = sample_trade();
        other.position_id = format!("pos-{}", Uuid::new_v4());
        ledger.record_trade(other).await.unwrap();

        // upsert_trade's own dedup rule means two rows can never legitimately
        // share a position_id in the table; remove_duplicate_trades is a
        // backstop for pre-dedup-fallback history, so the common case is 0.
        let removed = ledger.remove_duplicate_trades().unwrap();
        assert_eq!(removed, 0);
    }
}
