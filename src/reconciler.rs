//! Reconciler (C5): the four housekeeping passes that keep the position
//! table honest against reality — wallet-state recompute, dust virtual-close,
//! ghost-position purge, and invalid-trade cleanup.

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use crate::config::Config;
use crate::ledger::TradeLedger;
use crate::market_data::{plausibility_band, MarketDataFetcher};
use crate::models::{ExitReason, Position, PositionStatus, Side, Trade, TradingMode, WalletSnapshot};
use crate::persistence::Db;

pub struct Reconciler {
    db: Db,
    market_data: std::sync::Arc<MarketDataFetcher>,
    config: Config,
}

impl Reconciler {
    pub fn new(db: Db, market_data: std::sync::Arc<MarketDataFetcher>, config: Config) -> Self {
        Self {
            db,
            market_data,
            config,
        }
    }

    /// Recomputes a wallet snapshot's aggregate fields from the trade
    /// ledger, so a manual edit to `trades` (or an earlier partial failure)
    /// doesn't leave the wallet summary stale. Pure aggregation over the
    /// non-backtest trade rows for the given trading mode.
    pub fn recompute_wallet_state(&self, trading_mode: TradingMode, wallet_id: Option<&str>) -> Result<WalletSnapshot> {
        let trades = self.db.list_trades(Some(trading_mode.as_str()))?;
        let live: Vec<&Trade> = trades.iter().filter(|t| !t.is_backtest()).collect();

        let winning_count = live.iter().filter(|t| t.pnl_usdt > 0.0).count() as u64;
        let losing_count = live.iter().filter(|t| t.pnl_usdt < 0.0).count() as u64;
        let gross_profit: f64 = live.iter().filter(|t| t.pnl_usdt > 0.0).map(|t| t.pnl_usdt).sum();
        let gross_loss: f64 = live.iter().filter(|t| t.pnl_usdt < 0.0).map(|t| t.pnl_usdt.abs()).sum();
        let total_fees: f64 = live.iter().map(|t| t.commission).sum();
        let total_realized_pnl: f64 = live.iter().map(|t| t.pnl_usdt).sum();

        let existing = self.db.get_wallet_snapshot(trading_mode.as_str(), wallet_id)?;
        let snapshot = WalletSnapshot {
            id: existing.map(|s| s.id).unwrap_or_else(Uuid::new_v4),
            trading_mode,
            wallet_id: wallet_id.map(str::to_string),
            balances: serde_json::json!({}),
            total_realized_pnl,
            winning_count,
            losing_count,
            gross_profit,
            gross_loss,
            total_fees,
            updated_date: Utc::now(),
        };
        self.db.upsert_wallet_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    /// Virtually closes open positions for `(symbol, trading_mode)`: each one
    /// is booked as a Trade at a trusted price and then removed, regardless
    /// of how small its notional is — the caller decides a position is dust,
    /// this just executes the close (§4.5.2). The plausibility bands in
    /// [`crate::market_data`] gate which fetched price is trusted enough to
    /// close against; an out-of-band fetch falls back to `entry_price`, and
    /// only if that too is out of band does the position get skipped.
    pub async fn dust_virtual_close_sweep(
        &self,
        trade_ledger: &TradeLedger,
        symbol: &str,
        trading_mode: TradingMode,
    ) -> Result<Vec<String>> {
        let positions: Vec<Position> = self
            .db
            .list_positions(Some(trading_mode.as_str()))?
            .into_iter()
            .filter(|p| p.status == PositionStatus::Open && p.symbol == symbol)
            .collect();

        if positions.is_empty() {
            let affected = self
                .db
                .delete_open_positions_for_symbol(symbol, trading_mode.as_str())?;
            if affected > 0 {
                tracing::info!(symbol, affected, "dust sweep found no in-memory positions, fell back to DB delete");
            }
            return Ok(Vec::new());
        }

        let fetched_price = match self.market_data.get_price(symbol, trading_mode.as_str()).await {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(symbol, error = %e, "dust sweep price fetch failed");
                None
            }
        };

        let mut closed = Vec::new();
        for position in positions {
            let close_price = match resolve_close_price(fetched_price, position.entry_price, symbol) {
                Some(p) => p,
                None => {
                    tracing::error!(symbol, position_id = %position.position_id, "no in-band price available, skipping dust close");
                    continue;
                }
            };

            let entry_value = position.entry_price * position.quantity;
            let exit_value = close_price * position.quantity;
            let commission = 0.001 * entry_value + 0.001 * exit_value;
            let gross_pnl = (close_price - position.entry_price) * position.quantity;
            let net_pnl = gross_pnl - commission;
            let pnl_percent = if entry_value != 0.0 { net_pnl / entry_value * 100.0 } else { 0.0 };

            let trade = Trade {
                id: Uuid::new_v4(),
                position_id: position.position_id.clone(),
                symbol: position.symbol.clone(),
                side: Side::Buy,
                trading_mode: trading_mode.as_str().to_string(),
                strategy_name: "dust_virtual_close".to_string(),
                entry_price: position.entry_price,
                exit_price: close_price,
                quantity: position.quantity,
                pnl_usdt: net_pnl,
                pnl_percent,
                commission,
                exit_reason: ExitReason::DustVirtualClose,
                entry_analytics: position.analytics.clone(),
                exit_analytics: Default::default(),
                entry_timestamp: position.entry_timestamp,
                exit_timestamp: Utc::now(),
                created_date: Utc::now(),
            };
            trade_ledger.record_trade(trade).await.ok();
            self.db.delete_position(position.id)?;
            closed.push(position.position_id);
        }
        Ok(closed)
    }

    /// Purges positions whose on-exchange balance no longer backs them: a
    /// position is a "ghost" when the free balance of its base asset has
    /// fallen below `quantity * threshold` (0.01 testnet / 0.05 mainnet,
    /// looser on testnet since faucet-funded symbols get swept elsewhere
    /// faster than real balances drain). Each ghost is booked as a 100%-loss
    /// Trade, then the Position row is removed (§4.5.3).
    pub async fn ghost_position_purge(&self, trading_mode: TradingMode, trade_ledger: &TradeLedger) -> Result<GhostPurgeReport> {
        let threshold = match trading_mode {
            TradingMode::Testnet => self.config.ghost_purge_threshold_testnet,
            TradingMode::Mainnet => self.config.ghost_purge_threshold_mainnet,
        };

        let positions: Vec<Position> = self
            .db
            .list_positions(Some(trading_mode.as_str()))?
            .into_iter()
            .filter(|p| p.status == PositionStatus::Open)
            .collect();

        let balances = self.market_data.get_account_balances(trading_mode.as_str()).await?;

        let mut ghost_positions = Vec::new();
        let mut legitimate_positions = Vec::new();
        for position in positions {
            let asset = base_asset(&position.symbol);
            let free = free_balance(&balances, asset);
            if free < position.quantity * threshold {
                let trade = Trade {
                    id: Uuid::new_v4(),
                    position_id: position.position_id.clone(),
                    symbol: position.symbol.clone(),
                    side: Side::Buy,
                    trading_mode: trading_mode.as_str().to_string(),
                    strategy_name: "ghost_position_purge".to_string(),
                    entry_price: position.entry_price,
                    exit_price: position.entry_price,
                    quantity: position.quantity,
                    pnl_usdt: -position.entry_value,
                    pnl_percent: -100.0,
                    commission: 0.0,
                    exit_reason: ExitReason::GhostPositionPurge,
                    entry_analytics: position.analytics.clone(),
                    exit_analytics: Default::default(),
                    entry_timestamp: position.entry_timestamp,
                    exit_timestamp: Utc::now(),
                    created_date: Utc::now(),
                };
                trade_ledger.record_trade(trade).await.ok();
                self.db.delete_position(position.id)?;
                ghost_positions.push(position.position_id);
            } else {
                legitimate_positions.push(position.position_id);
            }
        }

        Ok(GhostPurgeReport {
            purged: ghost_positions.len() as u64,
            ghost_positions,
            legitimate_positions,
        })
    }

    /// Deletes trades with non-positive prices or quantity, which can only
    /// arise from a corrupted backtest import or a manual DB edit.
    pub fn cleanup_invalid_trades(&self) -> Result<u64> {
        self.db.delete_trades_where_invalid()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GhostPurgeReport {
    pub purged: u64,
    pub ghost_positions: Vec<String>,
    pub legitimate_positions: Vec<String>,
}

/// Picks the price to close a dust position at: the fetched price if it
/// passes the plausibility band, else `entry_price` if that passes instead.
/// Unknown symbols have no band, so any fetched price is accepted.
fn resolve_close_price(fetched: Option<f64>, entry_price: f64, symbol: &str) -> Option<f64> {
    let in_band = |price: f64| match plausibility_band(symbol) {
        Some((min, max)) => price >= min && price <= max,
        None => true,
    };
    if let Some(price) = fetched {
        if in_band(price) {
            return Some(price);
        }
    }
    if in_band(entry_price) {
        return Some(entry_price);
    }
    None
}

/// Strips the quote currency off a `BASE/QUOTE` or `BASEQUOTE` symbol to get
/// the asset Binance account balances are keyed by.
fn base_asset(symbol: &str) -> &str {
    if let Some((base, _)) = symbol.split_once('/') {
        return base;
    }
    for quote in ["USDT", "BUSD", "USDC", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    symbol
}

/// Reads the `free` balance for `asset` out of Binance's `/api/v3/account`
/// response shape (`{balances: [{asset, free, locked}, ...]}`).
fn free_balance(account: &serde_json::Value, asset: &str) -> f64 {
    account
        .get("balances")
        .and_then(|b| b.as_array())
        .into_iter()
        .flatten()
        .find(|entry| entry.get("asset").and_then(|a| a.as_str()) == Some(asset))
        .and_then(|entry| entry.get("free"))
        .and_then(|f| f.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAnalytics, TradingMode};

    fn sample_position(position_id: &str, entry_value: f64, quantity: f64) -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            position_id: position_id.to_string(),
            symbol: "BTC/USDT".into(),
            trading_mode: TradingMode::Testnet,
            status: PositionStatus::Open,
            wallet_id: None,
            entry_price: entry_value / quantity,
            quantity,
            entry_value,
            current_price: None,
            unrealized_pnl: None,
            stop_loss_price: None,
            take_profit_price: None,
            trailing_stop_percent: None,
            trailing_activated: None,
            peak_price: None,
            trough_price: None,
            time_exit_hours: None,
            exit_time: None,
            analytics: EntryAnalytics::default(),
            created_date: now,
            updated_date: now,
            entry_timestamp: now,
            last_price_update: None,
        }
    }

    #[test]
    fn wallet_recompute_with_no_trades_is_all_zero() {
        let db = Db::open_in_memory().unwrap();
        let config = test_config();
        let market_data = std::sync::Arc::new(MarketDataFetcher::new(config.clone()));
        let reconciler = Reconciler::new(db, market_data, config);

        let snapshot = reconciler
            .recompute_wallet_state(TradingMode::Testnet, None)
            .unwrap();
        assert_eq!(snapshot.total_realized_pnl, 0.0);
        assert_eq!(snapshot.winning_count, 0);
    }

    #[test]
    fn invalid_trades_are_removed_by_cleanup() {
        let db = Db::open_in_memory().unwrap();
        let config = test_config();
        let market_data = std::sync::Arc::new(MarketDataFetcher::new(config.clone()));
        let reconciler = Reconciler::new(db.clone(), market_data, config);

        let mut bad = sample_trade();
        bad.entry_price = -1.0;
        db.upsert_trade(&bad).unwrap();

        let deleted = reconciler.cleanup_invalid_trades().unwrap();
        assert_eq!(deleted, 1);
    }

    fn sample_trade() -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v4(),
            position_id: "p1".into(),
            symbol: "BTC/USDT".into(),
            side: Side::Buy,
            trading_mode: "testnet".into(),
            strategy_name: "s".into(),
            entry_price: 1.0,
            exit_price: 1.0,
            quantity: 1.0,
            pnl_usdt: 0.0,
            pnl_percent: 0.0,
            commission: 0.0,
            exit_reason: ExitReason::Manual,
            entry_analytics: EntryAnalytics::default(),
            exit_analytics: Default::default(),
            entry_timestamp: now,
            exit_timestamp: now,
            created_date: now,
        }
    }

    fn test_config() -> Config {
        Config::load(&crate::config::Cli {
            port: None,
            db_path: None,
            storage_dir: None,
        })
        .unwrap()
    }
}
