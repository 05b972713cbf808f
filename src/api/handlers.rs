use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{ApiEnvelope, Position, PositionStatus, Trade, TradingMode};

use super::AppState;

// ---- health -------------------------------------------------------------

pub async fn health() -> Json<ApiEnvelope<serde_json::Value>> {
    Json(ApiEnvelope::ok(serde_json::json!({"status": "ok"})))
}

// ---- positions ------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListPositionsQuery {
    pub trading_mode: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<String>,
}

pub async fn list_positions(
    State(state): State<AppState>,
    Query(q): Query<ListPositionsQuery>,
) -> CoreResult<Json<ApiEnvelope<Vec<Position>>>> {
    let status = q.status.as_deref().map(|s| match s {
        "closed" => PositionStatus::Closed,
        "deleted" => PositionStatus::Deleted,
        _ => PositionStatus::Open,
    });
    let rows = state
        .positions
        .filter(q.trading_mode.as_deref(), q.symbol.as_deref(), status)?;
    Ok(Json(ApiEnvelope::ok(rows)))
}

#[derive(Deserialize, Default)]
pub struct FilterPositionsBody {
    pub trading_mode: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<String>,
}

/// Entity-style alias for `list_positions`: same merge-rule read, filters
/// taken from the request body instead of query params.
pub async fn filter_positions(
    State(state): State<AppState>,
    Json(body): Json<FilterPositionsBody>,
) -> CoreResult<Json<ApiEnvelope<Vec<Position>>>> {
    let status = body.status.as_deref().map(|s| match s {
        "closed" => PositionStatus::Closed,
        "deleted" => PositionStatus::Deleted,
        _ => PositionStatus::Open,
    });
    let rows = state
        .positions
        .filter(body.trading_mode.as_deref(), body.symbol.as_deref(), status)?;
    Ok(Json(ApiEnvelope::ok(rows)))
}

pub async fn get_position(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<ApiEnvelope<Position>>> {
    let pos = state
        .positions
        .get(id)?
        .ok_or_else(|| CoreError::NotFound(format!("position {id}")))?;
    Ok(Json(ApiEnvelope::ok(pos)))
}

pub async fn create_position(
    State(state): State<AppState>,
    Json(position): Json<Position>,
) -> CoreResult<Json<ApiEnvelope<Position>>> {
    let created = state.positions.create(position).await?;
    Ok(Json(ApiEnvelope::ok(created)))
}

#[derive(Deserialize)]
pub struct UpdatePositionBody {
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub trailing_activated: Option<bool>,
    pub peak_price: Option<f64>,
    pub trough_price: Option<f64>,
    pub time_exit_hours: Option<f64>,
    pub status: Option<String>,
}

pub async fn update_position(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdatePositionBody>,
) -> CoreResult<Json<ApiEnvelope<Position>>> {
    let updated = state
        .positions
        .update(id, |p| {
            if let Some(v) = body.current_price {
                p.current_price = Some(v);
            }
            if let Some(v) = body.unrealized_pnl {
                p.unrealized_pnl = Some(v);
            }
            if let Some(v) = body.stop_loss_price {
                p.stop_loss_price = Some(v);
            }
            if let Some(v) = body.take_profit_price {
                p.take_profit_price = Some(v);
            }
            if let Some(v) = body.trailing_activated {
                p.trailing_activated = Some(v);
            }
            if let Some(v) = body.peak_price {
                p.peak_price = Some(v);
            }
            if let Some(v) = body.trough_price {
                p.trough_price = Some(v);
            }
            if let Some(v) = body.time_exit_hours {
                p.time_exit_hours = Some(v);
            }
            if let Some(ref status) = body.status {
                p.status = match status.as_str() {
                    "closed" => PositionStatus::Closed,
                    "deleted" => PositionStatus::Deleted,
                    _ => PositionStatus::Open,
                };
            }
            p.last_price_update = Some(chrono::Utc::now());
        })
        .await?;
    Ok(Json(ApiEnvelope::ok(updated)))
}

pub async fn delete_position(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<ApiEnvelope<()>>> {
    state.positions.delete(id).await?;
    Ok(Json(ApiEnvelope::ok(())))
}

// ---- trades --------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListTradesQuery {
    pub trading_mode: Option<String>,
}

pub async fn list_trades(
    State(state): State<AppState>,
    Query(q): Query<ListTradesQuery>,
) -> CoreResult<Json<ApiEnvelope<Vec<Trade>>>> {
    let rows = state.ledger.list_trades(q.trading_mode.as_deref())?;
    Ok(Json(ApiEnvelope::ok(rows)))
}

pub async fn create_trade(
    State(state): State<AppState>,
    Json(trade): Json<Trade>,
) -> CoreResult<Json<serde_json::Value>> {
    let (id, was_new) = state.ledger.record_trade(trade).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": {"id": id, "inserted": was_new},
    })))
}

#[derive(Deserialize)]
pub struct BulkTradesBody {
    pub trades: Vec<Trade>,
}

pub async fn bulk_create_trades(
    State(state): State<AppState>,
    Json(body): Json<BulkTradesBody>,
) -> CoreResult<Json<ApiEnvelope<crate::ledger::BulkInsertReport>>> {
    let report = state.ledger.bulk_insert(body.trades).await?;
    Ok(Json(ApiEnvelope::ok(report)))
}

/// `/api/database/optimize-trades`: creates the partial indexes the trade
/// filters in §6.1 rely on, idempotently.
pub async fn optimize_trades(State(state): State<AppState>) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let created = state.db.ensure_trade_indexes().map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"indexesEnsured": created}))))
}

/// `/api/trades/clean-invalid`: drops rows with non-positive prices or
/// quantity, which can only arise from a corrupted backtest import or a
/// manual DB edit.
pub async fn clean_invalid_trades(State(state): State<AppState>) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let deleted = state.ledger.delete_invalid_trades()?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"deleted": deleted}))))
}

/// `/api/trades/recalculate-pnl`: §4.3's recompute pass.
pub async fn recalculate_pnl(State(state): State<AppState>) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let updated_count = state.ledger.recalculate_pnl()?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"updatedCount": updated_count}))))
}

/// `/api/trades/remove-duplicates`: backstop dedup pass over rows already in
/// the table (e.g. imported before the characteristic-tuple fallback
/// existed).
pub async fn remove_duplicate_trades(State(state): State<AppState>) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let removed = state.ledger.remove_duplicate_trades()?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"removed": removed}))))
}

/// `/api/trades/fix-entry-prices`: repairs rows with a non-positive
/// `entry_price` by inverting the P&L formula.
pub async fn fix_entry_prices(State(state): State<AppState>) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let fixed = state.ledger.fix_entry_prices()?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"fixed": fixed}))))
}

#[derive(Deserialize)]
pub struct DeleteTradesByIdsBody {
    #[serde(rename = "tradeIds")]
    pub trade_ids: Vec<Uuid>,
}

/// `/api/trades/delete-by-ids`.
pub async fn delete_trades_by_ids(
    State(state): State<AppState>,
    Json(body): Json<DeleteTradesByIdsBody>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let deleted = state.ledger.delete_trades_by_ids(&body.trade_ids)?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"deleted": deleted}))))
}

// ---- strategies ------------------------------------------------------------

pub async fn list_strategies(
    State(state): State<AppState>,
) -> CoreResult<Json<ApiEnvelope<Vec<crate::models::Strategy>>>> {
    let rows = state.db.list_strategies().map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(rows)))
}

pub async fn refresh_strategies(State(state): State<AppState>) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let count = state
        .strategies
        .refresh_all()
        .await
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"refreshed": count}))))
}

// ---- backtest combinations (`/api/backtestCombinations`) -------------------

/// Backtest combinations are the same `Strategy` row the aggregator writes
/// live stats onto; this is the raw CRUD surface over that table.
pub async fn list_backtest_combinations(
    State(state): State<AppState>,
) -> CoreResult<Json<ApiEnvelope<Vec<crate::models::Strategy>>>> {
    let rows = state.db.list_strategies().map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(rows)))
}

pub async fn create_backtest_combination(
    State(state): State<AppState>,
    Json(strategy): Json<crate::models::Strategy>,
) -> CoreResult<Json<ApiEnvelope<crate::models::Strategy>>> {
    state.db.upsert_strategy(&strategy).map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(strategy)))
}

#[derive(Deserialize)]
pub struct BulkStrategiesBody {
    pub combinations: Vec<crate::models::Strategy>,
}

pub async fn bulk_create_backtest_combinations(
    State(state): State<AppState>,
    Json(body): Json<BulkStrategiesBody>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let mut saved = 0u64;
    for strategy in &body.combinations {
        state.db.upsert_strategy(strategy).map_err(CoreError::Persistence)?;
        saved += 1;
    }
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"saved": saved}))))
}

pub async fn update_backtest_combination(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut strategy): Json<crate::models::Strategy>,
) -> CoreResult<Json<ApiEnvelope<crate::models::Strategy>>> {
    strategy.id = id;
    strategy.updated_date = chrono::Utc::now();
    state.db.upsert_strategy(&strategy).map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(strategy)))
}

pub async fn delete_backtest_combination(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> CoreResult<Json<ApiEnvelope<()>>> {
    state.db.delete_strategy(id).map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(())))
}

#[derive(Deserialize)]
pub struct DeleteStrategiesBody {
    pub ids: Vec<Uuid>,
}

pub async fn delete_backtest_combinations(
    State(state): State<AppState>,
    Json(body): Json<DeleteStrategiesBody>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let deleted = state.db.delete_strategies_by_ids(&body.ids).map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({"deleted": deleted}))))
}

// ---- market data passthrough -----------------------------------------------

#[derive(Deserialize)]
pub struct PriceQuery {
    pub symbol: String,
    pub trading_mode: Option<String>,
}

pub async fn get_price(
    State(state): State<AppState>,
    Query(q): Query<PriceQuery>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let mode = q.trading_mode.as_deref().unwrap_or("testnet");
    let price = state.market_data.get_price(&q.symbol, mode).await?;
    Ok(Json(ApiEnvelope::ok(
        serde_json::json!({"symbol": q.symbol, "price": price}),
    )))
}

#[derive(Deserialize)]
pub struct PricesBatchQuery {
    pub symbols: String,
    pub trading_mode: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(untagged)]
pub enum PriceOutcome {
    Ok { price: f64 },
    Err { error: String },
}

pub async fn get_prices_batch(
    State(state): State<AppState>,
    Query(q): Query<PricesBatchQuery>,
) -> Json<ApiEnvelope<HashMap<String, PriceOutcome>>> {
    let mode = q.trading_mode.as_deref().unwrap_or("testnet");
    let symbols: Vec<String> = q.symbols.split(',').map(|s| s.trim().to_string()).collect();
    let prices = state.market_data.get_prices_batch(&symbols, mode).await;
    let out = prices
        .into_iter()
        .map(|(symbol, result)| {
            let outcome = match result {
                Ok(price) => PriceOutcome::Ok { price },
                Err(error) => PriceOutcome::Err { error },
            };
            (symbol, outcome)
        })
        .collect();
    Json(ApiEnvelope::ok(out))
}

#[derive(Deserialize)]
pub struct KlinesQuery {
    pub symbol: String,
    pub interval: String,
    pub limit: Option<u32>,
    pub trading_mode: Option<String>,
}

pub async fn get_klines(
    State(state): State<AppState>,
    Query(q): Query<KlinesQuery>,
) -> CoreResult<Json<ApiEnvelope<Vec<crate::market_data::Kline>>>> {
    let mode = q.trading_mode.as_deref().unwrap_or("testnet");
    let klines = state
        .market_data
        .get_klines(&q.symbol, &q.interval, q.limit.unwrap_or(100), mode)
        .await?;
    Ok(Json(ApiEnvelope::ok(klines)))
}

#[derive(Deserialize)]
pub struct ExchangeInfoQuery {
    pub trading_mode: Option<String>,
}

pub async fn get_exchange_info(
    State(state): State<AppState>,
    Query(q): Query<ExchangeInfoQuery>,
) -> CoreResult<Json<ApiEnvelope<HashMap<String, crate::market_data::SymbolFilters>>>> {
    let mode = q.trading_mode.as_deref().unwrap_or("testnet");
    let info = state.market_data.get_exchange_info(mode).await?;
    Ok(Json(ApiEnvelope::ok(info)))
}

// ---- reconciliation --------------------------------------------------------

#[derive(Deserialize)]
pub struct TradingModeQuery {
    pub trading_mode: String,
}

pub async fn recompute_wallet(
    State(state): State<AppState>,
    Query(q): Query<TradingModeQuery>,
) -> CoreResult<Json<ApiEnvelope<crate::models::WalletSnapshot>>> {
    let mode = TradingMode::parse(&q.trading_mode)
        .ok_or_else(|| CoreError::Validation(vec!["invalid trading_mode".to_string()]))?;
    let snapshot = state
        .reconciler
        .recompute_wallet_state(mode, None)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(snapshot)))
}

/// `POST /api/functions/reconcileWalletState` `{mode}` — same recompute as
/// `recompute_wallet`, addressed by the spec's §6.1 functions path instead
/// of the query-string form the original `/api/reconcile/wallet` route uses.
pub async fn reconcile_wallet_state(
    State(state): State<AppState>,
    Json(body): Json<ReconcileWalletStateBody>,
) -> CoreResult<Json<ApiEnvelope<crate::models::WalletSnapshot>>> {
    let mode = TradingMode::parse(&body.mode)
        .ok_or_else(|| CoreError::Validation(vec!["invalid mode".to_string()]))?;
    let snapshot = state
        .reconciler
        .recompute_wallet_state(mode, None)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(snapshot)))
}

#[derive(Deserialize)]
pub struct ReconcileWalletStateBody {
    pub mode: String,
}

#[derive(Deserialize)]
pub struct WalletReconciliationBody {
    pub action: String,
    pub symbol: String,
    pub mode: String,
}

/// `POST /api/functions/walletReconciliation` `{action:'virtualCloseDustPositions', symbol, mode}`.
pub async fn wallet_reconciliation(
    State(state): State<AppState>,
    Json(body): Json<WalletReconciliationBody>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    if body.action != "virtualCloseDustPositions" {
        return Err(CoreError::Validation(vec![format!("unknown action {}", body.action)]));
    }
    let mode = TradingMode::parse(&body.mode)
        .ok_or_else(|| CoreError::Validation(vec!["invalid mode".to_string()]))?;
    let closed = state
        .reconciler
        .dust_virtual_close_sweep(&state.ledger, &body.symbol, mode)
        .await
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(serde_json::json!({
        "virtualClosed": closed.len(),
        "closedPositions": closed,
    }))))
}

#[derive(Deserialize)]
pub struct PurgeGhostPositionsBody {
    pub mode: String,
    #[serde(rename = "walletId")]
    pub wallet_id: Option<String>,
}

/// `POST /api/functions/purgeGhostPositions` `{mode, walletId?}`.
pub async fn purge_ghost_positions(
    State(state): State<AppState>,
    Json(body): Json<PurgeGhostPositionsBody>,
) -> CoreResult<Json<ApiEnvelope<crate::reconciler::GhostPurgeReport>>> {
    let mode = TradingMode::parse(&body.mode)
        .ok_or_else(|| CoreError::Validation(vec!["invalid mode".to_string()]))?;
    let _ = body.wallet_id; // positions aren't currently partitioned by wallet_id in storage
    let report = state
        .reconciler
        .ghost_position_purge(mode, &state.ledger)
        .await
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(report)))
}

// ---- supplemental document-backed entities --------------------------------

pub async fn get_scan_settings(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> CoreResult<Json<ApiEnvelope<Option<serde_json::Value>>>> {
    let value = state
        .documents
        .get("scan_settings", &key)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(value)))
}

pub async fn put_scan_settings(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> CoreResult<Json<ApiEnvelope<()>>> {
    state
        .documents
        .put("scan_settings", &key, &body)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(())))
}

pub async fn get_wallet_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> CoreResult<Json<ApiEnvelope<Option<serde_json::Value>>>> {
    let value = state
        .documents
        .get("wallet_config", &key)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(value)))
}

pub async fn put_wallet_config(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> CoreResult<Json<ApiEnvelope<()>>> {
    state
        .documents
        .put("wallet_config", &key, &body)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(())))
}

/// Lists every document in `collection`, newest writes included, no ordering
/// guarantee beyond what SQLite returns — these collections are small
/// dashboards snapshots, not paged feeds.
async fn list_documents(state: &AppState, collection: &str) -> CoreResult<Json<ApiEnvelope<Vec<serde_json::Value>>>> {
    let rows = state.documents.list(collection).map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(rows)))
}

/// Stores `body` under a freshly minted id, injecting `"id"` into the
/// document the way the Gateway's other entity-create routes do.
async fn create_document(
    state: &AppState,
    collection: &str,
    mut body: serde_json::Value,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    let id = Uuid::new_v4().to_string();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("id".to_string(), serde_json::Value::String(id.clone()));
    }
    state
        .documents
        .put(collection, &id, &body)
        .map_err(CoreError::Persistence)?;
    Ok(Json(ApiEnvelope::ok(body)))
}

pub async fn list_wallet_summaries(
    State(state): State<AppState>,
) -> CoreResult<Json<ApiEnvelope<Vec<serde_json::Value>>>> {
    list_documents(&state, "wallet_summaries").await
}

pub async fn create_wallet_summary(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    create_document(&state, "wallet_summaries", body).await
}

pub async fn list_central_wallet_states(
    State(state): State<AppState>,
) -> CoreResult<Json<ApiEnvelope<Vec<serde_json::Value>>>> {
    list_documents(&state, "central_wallet_states").await
}

pub async fn create_central_wallet_state(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    create_document(&state, "central_wallet_states", body).await
}

pub async fn list_historical_performance(
    State(state): State<AppState>,
) -> CoreResult<Json<ApiEnvelope<Vec<serde_json::Value>>>> {
    list_documents(&state, "historical_performance").await
}

pub async fn create_historical_performance(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> CoreResult<Json<ApiEnvelope<serde_json::Value>>> {
    create_document(&state, "historical_performance", body).await
}
