//! Core domain types: positions, trades, strategies, wallet snapshots, and
//! the small enums that discipline their state machines.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Testnet,
    Mainnet,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Testnet => "testnet",
            TradingMode::Mainnet => "mainnet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "testnet" => Some(TradingMode::Testnet),
            "mainnet" => Some(TradingMode::Mainnet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Deleted,
}

impl PositionStatus {
    /// Null `status` on an old row is treated as `open` for backward compat (§4.4).
    pub fn from_nullable(s: Option<&str>) -> Self {
        match s.map(|s| s.to_ascii_lowercase()) {
            Some(ref v) if v == "closed" => PositionStatus::Closed,
            Some(ref v) if v == "deleted" => PositionStatus::Deleted,
            _ => PositionStatus::Open,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for a long (BUY) position, -1 for a short (SELL) position; used in
    /// the P&L formula's `direction` term.
    pub fn direction(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Timeout,
    Manual,
    DustVirtualClose,
    GhostPositionPurge,
    Unknown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Timeout => "timeout",
            ExitReason::Manual => "manual",
            ExitReason::DustVirtualClose => "dust_virtual_close",
            ExitReason::GhostPositionPurge => "ghost_position_purge",
            ExitReason::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "take_profit" => ExitReason::TakeProfit,
            "stop_loss" => ExitReason::StopLoss,
            "timeout" => ExitReason::Timeout,
            "manual" => ExitReason::Manual,
            "dust_virtual_close" => ExitReason::DustVirtualClose,
            "ghost_position_purge" => ExitReason::GhostPositionPurge,
            _ => ExitReason::Unknown,
        }
    }
}

/// Analytics captured at position-open time; copied verbatim onto the Trade
/// row at close so a closed trade still carries the context it was opened
/// under. The client computes all of these; the core only stores and reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryAnalytics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fear_greed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conviction_breakdown: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_support: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_resistance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_to_day_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_to_day_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_vs_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub position_id: String,
    pub symbol: String,
    pub trading_mode: TradingMode,
    pub status: PositionStatus,
    pub wallet_id: Option<String>,

    pub entry_price: f64,
    pub quantity: f64,
    pub entry_value: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: Option<f64>,

    #[serde(default)]
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub trailing_stop_percent: Option<f64>,
    #[serde(default)]
    pub trailing_activated: Option<bool>,
    #[serde(default)]
    pub peak_price: Option<f64>,
    #[serde(default)]
    pub trough_price: Option<f64>,

    #[serde(default)]
    pub time_exit_hours: Option<f64>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub analytics: EntryAnalytics,

    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub entry_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_price_update: Option<DateTime<Utc>>,
}

impl Position {
    /// `exit_time = entry_timestamp + time_exit_hours`. Null if either input
    /// is missing (§4.4).
    pub fn compute_exit_time(&self) -> Option<DateTime<Utc>> {
        let hours = self.time_exit_hours?;
        let millis = (hours * 3_600_000.0).round() as i64;
        Some(self.entry_timestamp + ChronoDuration::milliseconds(millis))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitAnalytics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime_at_exit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility_at_exit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fear_greed_at_exit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfe: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mae: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_profit_usdt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_profit_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_loss_usdt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_loss_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_to_sl_at_exit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_to_tp_at_exit: Option<f64>,
    #[serde(default)]
    pub sl_hit: bool,
    #[serde(default)]
    pub tp_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_slippage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_slippage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_profit_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_loss_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_win_rate_at_entry: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_wins_at_entry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_losses_at_entry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similar_trades_count_at_entry: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    /// `testnet` / `mainnet` for live trades, `backtest` for rows originating
    /// from a backtest run; the Strategy Aggregator excludes the latter.
    pub trading_mode: String,
    pub strategy_name: String,

    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl_usdt: f64,
    pub pnl_percent: f64,
    pub commission: f64,

    pub exit_reason: ExitReason,

    #[serde(flatten)]
    pub entry_analytics: EntryAnalytics,
    #[serde(flatten)]
    pub exit_analytics: ExitAnalytics,

    pub entry_timestamp: DateTime<Utc>,
    pub exit_timestamp: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
}

impl Trade {
    pub fn is_backtest(&self) -> bool {
        self.trading_mode.eq_ignore_ascii_case("backtest")
    }

    /// `pnl_usdt = (exit - entry) * quantity * direction - commission`.
    pub fn expected_pnl_usdt(&self) -> f64 {
        (self.exit_price - self.entry_price) * self.quantity * self.side.direction()
            - self.commission
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitReasonBreakdownEntry {
    pub count: u64,
    pub percentage: f64,
    pub avg_pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveStrategyStats {
    pub live_success_rate: f64,
    pub live_occurrences: u64,
    pub live_avg_price_move: f64,
    pub live_profit_factor: f64,
    pub live_max_drawdown_percent: f64,
    pub live_win_loss_ratio: f64,
    pub live_gross_profit_total: f64,
    pub live_gross_loss_total: f64,
    pub performance_gap_percent: f64,
    pub live_exit_reason_breakdown: std::collections::BTreeMap<String, ExitReasonBreakdownEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_live_trade_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: Uuid,
    pub strategy_name: String,
    #[serde(default)]
    pub combination_signature: Option<String>,
    pub coin: String,
    pub timeframe: String,

    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub occurrences: u64,
    #[serde(default)]
    pub profit_factor: f64,
    #[serde(default)]
    pub regime_performance: Value,
    #[serde(default)]
    pub max_drawdown_percent: f64,
    #[serde(default)]
    pub win_loss_ratio: f64,
    #[serde(default)]
    pub consecutive_wins: u64,
    #[serde(default)]
    pub consecutive_losses: u64,
    #[serde(default)]
    pub avg_exit_time_hours: f64,
    #[serde(default)]
    pub backtest_exit_reason_breakdown: Value,

    #[serde(default)]
    pub included_in_scanner: bool,
    #[serde(default)]
    pub included_in_live_scanner: bool,
    #[serde(default)]
    pub is_event_driven_strategy: bool,

    #[serde(default, flatten)]
    pub live: LiveStrategyStats,

    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

impl Strategy {
    /// Strip a trailing ` (REGIME)` suffix so regime-variants collide under
    /// one strategy name (§4.6).
    pub fn normalize_name(raw: &str) -> String {
        let trimmed = raw.trim();
        if let Some(open) = trimmed.rfind(" (") {
            if trimmed.ends_with(')') {
                return trimmed[..open].trim().to_string();
            }
        }
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub id: Uuid,
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub wallet_id: Option<String>,
    #[serde(default)]
    pub balances: Value,
    pub total_realized_pnl: f64,
    pub winning_count: u64,
    pub losing_count: u64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub total_fees: f64,
    pub updated_date: DateTime<Utc>,
}

/// The one response shape every Gateway endpoint returns (§4.7, §6.1).
#[derive(Debug, Clone, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_time_zero_hours_equals_entry() {
        let entry = Utc::now();
        let p = sample_position(entry, Some(0.0));
        assert_eq!(p.compute_exit_time(), Some(entry));
    }

    #[test]
    fn exit_time_missing_hours_is_none() {
        let p = sample_position(Utc::now(), None);
        assert_eq!(p.compute_exit_time(), None);
    }

    #[test]
    fn strategy_name_strips_trailing_regime_suffix() {
        assert_eq!(
            Strategy::normalize_name("Momentum Breakout (BULL)"),
            "Momentum Breakout"
        );
        assert_eq!(Strategy::normalize_name("Momentum Breakout"), "Momentum Breakout");
    }

    #[test]
    fn position_status_null_is_open() {
        assert_eq!(PositionStatus::from_nullable(None), PositionStatus::Open);
        assert_eq!(
            PositionStatus::from_nullable(Some("closed")),
            PositionStatus::Closed
        );
    }

    fn sample_position(entry_timestamp: DateTime<Utc>, time_exit_hours: Option<f64>) -> Position {
        Position {
            id: Uuid::new_v4(),
            position_id: "p1".into(),
            symbol: "BTC/USDT".into(),
            trading_mode: TradingMode::Testnet,
            status: PositionStatus::Open,
            wallet_id: None,
            entry_price: 50000.0,
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
            time_exit_hours,
            exit_time: None,
            analytics: EntryAnalytics::default(),
            created_date: entry_timestamp,
            updated_date: entry_timestamp,
            entry_timestamp,
            last_price_update: None,
        }
    }
}
