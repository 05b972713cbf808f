//! Request Gateway (C7): the HTTP surface over the core. Handlers stay thin
//! — validation and state mutation live in the component modules; a handler's
//! job is extracting the request, calling one component method, and wrapping
//! the result in [`crate::models::ApiEnvelope`].

pub mod handlers;
pub mod routes;

pub use routes::build_router;

use crate::ledger::TradeLedger;
use crate::market_data::MarketDataFetcher;
use crate::positions::PositionManager;
use crate::reconciler::Reconciler;
use crate::strategy::StrategyAggregator;
use crate::{config::Config, entities::SharedDocumentStore, persistence::Db};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub market_data: Arc<MarketDataFetcher>,
    pub positions: Arc<PositionManager>,
    pub ledger: Arc<TradeLedger>,
    pub strategies: Arc<StrategyAggregator>,
    pub reconciler: Arc<Reconciler>,
    pub documents: SharedDocumentStore,
}
