use axum::{
    middleware as axum_mw,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::middleware::{logging::request_logging, rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer}};

use super::{handlers, AppState};

pub fn build_router(state: AppState) -> Router {
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    let api = Router::new()
        .route("/health", get(handlers::health))
        // positions: §6.1 names the collection `LivePosition`; `/api/positions`
        // is kept as the case-insensitive adapter's resolved form, aliased to
        // the literal `/api/livePositions` path some callers send directly.
        .route("/api/positions", get(handlers::list_positions).post(handlers::create_position))
        .route("/api/livePositions", get(handlers::list_positions).post(handlers::create_position))
        .route(
            "/api/positions/:id",
            get(handlers::get_position)
                .patch(handlers::update_position)
                .delete(handlers::delete_position),
        )
        .route(
            "/api/livePositions/:id",
            get(handlers::get_position)
                .patch(handlers::update_position)
                .delete(handlers::delete_position),
        )
        .route("/api/entities/LivePosition/filter", post(handlers::filter_positions))
        .route("/api/trades", get(handlers::list_trades).post(handlers::create_trade))
        .route("/api/trades/bulk", post(handlers::bulk_create_trades))
        .route("/api/trades/bulkCreate", post(handlers::bulk_create_trades))
        .route("/api/trades/recalculate-pnl", post(handlers::recalculate_pnl))
        .route("/api/trades/clean-invalid", post(handlers::clean_invalid_trades))
        .route("/api/trades/remove-duplicates", post(handlers::remove_duplicate_trades))
        .route("/api/trades/fix-entry-prices", post(handlers::fix_entry_prices))
        .route("/api/trades/delete-by-ids", post(handlers::delete_trades_by_ids))
        // `/api/db/optimize-trades` is kept as an alias of the spec's
        // `/api/database/optimize-trades` name for callers still on the old path.
        .route("/api/db/optimize-trades", post(handlers::optimize_trades))
        .route("/api/database/optimize-trades", post(handlers::optimize_trades))
        .route("/api/strategies", get(handlers::list_strategies))
        .route("/api/strategies/refresh", post(handlers::refresh_strategies))
        .route(
            "/api/backtestCombinations",
            get(handlers::list_backtest_combinations).post(handlers::create_backtest_combination),
        )
        .route("/api/backtestCombinations/bulkCreate", post(handlers::bulk_create_backtest_combinations))
        .route("/api/backtestCombinations/refresh-live-performance", post(handlers::refresh_strategies))
        .route("/api/backtestCombinations/delete-by-ids", post(handlers::delete_backtest_combinations))
        .route(
            "/api/backtestCombinations/:id",
            put(handlers::update_backtest_combination)
                .delete(handlers::delete_backtest_combination),
        )
        .route("/api/market-data/price", get(handlers::get_price))
        .route("/api/market-data/prices-batch", get(handlers::get_prices_batch))
        .route("/api/market-data/klines", get(handlers::get_klines))
        .route("/api/market-data/exchange-info", get(handlers::get_exchange_info))
        .route("/api/reconcile/wallet", post(handlers::recompute_wallet))
        .route("/api/functions/reconcileWalletState", post(handlers::reconcile_wallet_state))
        .route("/api/functions/walletReconciliation", post(handlers::wallet_reconciliation))
        .route("/api/functions/purgeGhostPositions", post(handlers::purge_ghost_positions))
        .route(
            "/api/walletSummaries",
            get(handlers::list_wallet_summaries).post(handlers::create_wallet_summary),
        )
        .route(
            "/api/centralWalletStates",
            get(handlers::list_central_wallet_states).post(handlers::create_central_wallet_state),
        )
        .route(
            "/api/historicalPerformance",
            get(handlers::list_historical_performance).post(handlers::create_historical_performance),
        )
        .route(
            "/api/scan-settings/:key",
            get(handlers::get_scan_settings).put(handlers::put_scan_settings),
        )
        .route(
            "/api/wallet-config/:key",
            get(handlers::get_wallet_config).put(handlers::put_wallet_config),
        )
        .with_state(state.clone())
        .layer(axum_mw::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    api
}
