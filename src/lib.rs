//! Sentinel trading-state backend.
//!
//! Exposes the core modules so integration tests under `tests/` can build
//! an `AppState` and drive the HTTP surface directly via `tower::ServiceExt`.

pub mod api;
pub mod config;
pub mod entities;
pub mod error;
pub mod ledger;
pub mod market_data;
pub mod middleware;
pub mod models;
pub mod persistence;
pub mod positions;
pub mod reconciler;
pub mod strategy;
pub mod supervisor;
