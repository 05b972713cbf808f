//! Strategy Aggregator (C6): derives live KPIs from the trade ledger as a
//! pure function of its rows, excluding anything tagged `trading_mode =
//! "backtest"`. Triggered both fire-and-forget after a trade insert and on
//! a periodic batched scan from the Supervisor.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::models::{ExitReasonBreakdownEntry, LiveStrategyStats, Strategy, Trade};
use crate::persistence::Db;

pub struct StrategyAggregator {
    db: Db,
}

impl StrategyAggregator {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Recomputes and stores the live KPIs for a single strategy name.
    pub async fn refresh_strategy(&self, strategy_name: &str) -> Result<()> {
        let normalized = Strategy::normalize_name(strategy_name);
        let trades = self.db.list_trades(None)?;
        let live_trades: Vec<&Trade> = trades
            .iter()
            .filter(|t| !t.is_backtest() && Strategy::normalize_name(&t.strategy_name) == normalized)
            .collect();

        if live_trades.is_empty() {
            return Ok(());
        }

        let strategies = self.db.list_strategies()?;
        let existing = strategies
            .into_iter()
            .find(|s| Strategy::normalize_name(&s.strategy_name) == normalized);

        let mut strategy = existing.unwrap_or_else(|| blank_strategy(&normalized, &live_trades));
        let live_stats = derive_live_stats(&live_trades, strategy.success_rate);
        strategy.live = live_stats;
        strategy.updated_date = chrono::Utc::now();

        self.db.upsert_strategy(&strategy)?;
        Ok(())
    }

    /// Periodic batched scan: recomputes every strategy name present in the
    /// live (non-backtest) trade set. Run every `strategy_refresh_interval`
    /// from the Supervisor rather than per-trade, so a quiet minute doesn't
    /// do redundant work across strategies nobody is actively trading.
    pub async fn refresh_all(&self) -> Result<usize> {
        let trades = self.db.list_trades(None)?;
        let mut names: Vec<String> = trades
            .iter()
            .filter(|t| !t.is_backtest())
            .map(|t| Strategy::normalize_name(&t.strategy_name))
            .collect();
        names.sort();
        names.dedup();

        for name in &names {
            self.refresh_strategy(name).await?;
        }
        Ok(names.len())
    }
}

fn blank_strategy(normalized_name: &str, trades: &[&Trade]) -> Strategy {
    let first = trades.first();
    Strategy {
        id: uuid::Uuid::new_v4(),
        strategy_name: normalized_name.to_string(),
        combination_signature: None,
        coin: first.map(|t| t.symbol.clone()).unwrap_or_default(),
        timeframe: "unknown".to_string(),
        success_rate: 0.0,
        occurrences: 0,
        profit_factor: 0.0,
        regime_performance: serde_json::json!({}),
        max_drawdown_percent: 0.0,
        win_loss_ratio: 0.0,
        consecutive_wins: 0,
        consecutive_losses: 0,
        avg_exit_time_hours: 0.0,
        backtest_exit_reason_breakdown: serde_json::json!({}),
        included_in_scanner: false,
        included_in_live_scanner: false,
        is_event_driven_strategy: false,
        live: LiveStrategyStats::default(),
        created_date: chrono::Utc::now(),
        updated_date: chrono::Utc::now(),
    }
}

/// Pure function: live trade rows in, KPI bundle out. No I/O, fully unit
/// testable. `backtest_success_rate` is the strategy's stored
/// `success_rate` (from its backtest run), used to derive
/// `performance_gap_percent`.
pub fn derive_live_stats(trades: &[&Trade], backtest_success_rate: f64) -> LiveStrategyStats {
    let occurrences = trades.len() as u64;
    let wins: Vec<&&Trade> = trades.iter().filter(|t| t.pnl_usdt > 0.0).collect();
    let losses: Vec<&&Trade> = trades.iter().filter(|t| t.pnl_usdt < 0.0).collect();

    let live_success_rate = if occurrences > 0 {
        wins.len() as f64 / occurrences as f64 * 100.0
    } else {
        0.0
    };

    // Gross profit/loss and everything derived from them run on pnl_percent,
    // not pnl_usdt — KPIs stay comparable across trades of different size.
    let gross_profit: f64 = wins.iter().map(|t| t.pnl_percent).sum();
    let gross_loss: f64 = losses.iter().map(|t| t.pnl_percent.abs()).sum();

    // Profit factor is undefined (mathematically infinite) with zero losses
    // and at least one win; collapsed to 999 so clients rendering a bounded
    // gauge don't choke on `inf`.
    let live_profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        999.0
    } else {
        0.0
    };

    let avg_win_pct = if !wins.is_empty() {
        gross_profit / wins.len() as f64
    } else {
        0.0
    };
    let avg_loss_pct = if !losses.is_empty() {
        gross_loss / losses.len() as f64
    } else {
        0.0
    };
    let live_win_loss_ratio = if avg_loss_pct > 0.0 {
        avg_win_pct / avg_loss_pct
    } else if avg_win_pct > 0.0 {
        999.0
    } else {
        0.0
    };

    let live_avg_price_move = if occurrences > 0 {
        trades.iter().map(|t| t.pnl_percent).sum::<f64>() / occurrences as f64
    } else {
        0.0
    };

    let live_max_drawdown_percent = max_drawdown_percent(&losses);

    let mut breakdown: BTreeMap<String, ExitReasonBreakdownEntry> = BTreeMap::new();
    for t in trades {
        let entry = breakdown.entry(t.exit_reason.as_str().to_string()).or_default();
        entry.count += 1;
    }
    for entry in breakdown.values_mut() {
        entry.percentage = entry.count as f64 / occurrences.max(1) as f64 * 100.0;
    }
    for (reason, entry) in breakdown.iter_mut() {
        let matching: Vec<f64> = trades
            .iter()
            .filter(|t| t.exit_reason.as_str() == reason)
            .map(|t| t.pnl_usdt)
            .collect();
        entry.avg_pnl = if !matching.is_empty() {
            matching.iter().sum::<f64>() / matching.len() as f64
        } else {
            0.0
        };
    }

    let last_live_trade_date = trades.iter().map(|t| t.exit_timestamp).max();

    LiveStrategyStats {
        live_success_rate,
        live_occurrences: occurrences,
        live_avg_price_move,
        live_profit_factor,
        live_max_drawdown_percent,
        live_win_loss_ratio,
        live_gross_profit_total: gross_profit,
        live_gross_loss_total: gross_loss,
        performance_gap_percent: live_success_rate - backtest_success_rate,
        live_exit_reason_breakdown: breakdown,
        last_live_trade_date,
    }
}

/// Worst single-trade loss, as the largest `|pnl_percent|` among losing
/// trades. Not an equity-curve drawdown — the live book is sized per-trade,
/// not compounded, so peak-to-trough has no meaning here.
fn max_drawdown_percent(losses: &[&&Trade]) -> f64 {
    losses
        .iter()
        .map(|t| t.pnl_percent.abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAnalytics, ExitAnalytics, ExitReason, Side};
    use chrono::Utc;
    use uuid::Uuid;

    fn trade(pnl: f64, exit_reason: ExitReason) -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v4(),
            position_id: format!("p-{}", Uuid::new_v4()),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            trading_mode: "testnet".into(),
            strategy_name: "Breakout".into(),
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            quantity: 1.0,
            pnl_usdt: pnl,
            pnl_percent: pnl,
            commission: 0.0,
            exit_reason,
            entry_analytics: EntryAnalytics::default(),
            exit_analytics: ExitAnalytics::default(),
            entry_timestamp: now,
            exit_timestamp: now,
            created_date: now,
        }
    }

    #[test]
    fn profit_factor_with_zero_losses_collapses_to_999() {
        let trades = vec![trade(10.0, ExitReason::TakeProfit), trade(5.0, ExitReason::TakeProfit)];
        let refs: Vec<&Trade> = trades.iter().collect();
        let stats = derive_live_stats(&refs, 0.0);
        assert_eq!(stats.live_profit_factor, 999.0);
    }

    #[test]
    fn success_rate_and_gross_totals_are_consistent() {
        let trades = vec![
            trade(10.0, ExitReason::TakeProfit),
            trade(-4.0, ExitReason::StopLoss),
        ];
        let refs: Vec<&Trade> = trades.iter().collect();
        let stats = derive_live_stats(&refs, 0.0);
        assert_eq!(stats.live_success_rate, 50.0);
        assert_eq!(stats.live_gross_profit_total, 10.0);
        assert_eq!(stats.live_gross_loss_total, 4.0);
        assert!((stats.live_profit_factor - 2.5).abs() < 1e-9);
        assert!((stats.live_win_loss_ratio - 2.5).abs() < 1e-9);
        assert_eq!(stats.live_max_drawdown_percent, 4.0);
    }

    #[test]
    fn performance_gap_is_live_minus_backtest_success_rate() {
        let trades = vec![
            trade(10.0, ExitReason::TakeProfit),
            trade(-4.0, ExitReason::StopLoss),
        ];
        let refs: Vec<&Trade> = trades.iter().collect();
        let stats = derive_live_stats(&refs, 70.0);
        assert!((stats.performance_gap_percent - (50.0 - 70.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_trade_set_yields_zeroed_stats() {
        let stats = derive_live_stats(&[], 0.0);
        assert_eq!(stats.live_occurrences, 0);
        assert_eq!(stats.live_success_rate, 0.0);
        assert_eq!(stats.live_profit_factor, 0.0);
    }
}
