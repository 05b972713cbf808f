//! Crate-wide error taxonomy.
//!
//! `CoreError` names the kinds of failure the trading-state engine can
//! surface to the Gateway (§7 of the design). Internal plumbing still moves
//! errors around as `anyhow::Error`; handlers convert into `CoreError` at the
//! boundary so the HTTP envelope can pick the right status code.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    /// Not really an error: the dedup rule in the Trade Ledger fired. Carries
    /// the row that already exists so the caller can treat the call as a
    /// successful no-op.
    #[error("duplicate")]
    Duplicate(serde_json::Value),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("rate limited")]
    RateLimited,

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match &self {
            CoreError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({"success": false, "error": self.to_string(), "errors": errors}),
            ),
            CoreError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                json!({"success": false, "error": self.to_string()}),
            ),
            CoreError::Duplicate(existing) => {
                return (
                    StatusCode::OK,
                    Json(json!({"success": true, "data": existing, "duplicate": true})),
                )
                    .into_response();
            }
            CoreError::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                json!({"success": false, "error": msg}),
            ),
            CoreError::RateLimited => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"success": false, "error": "rate limited upstream"}),
            ),
            CoreError::Persistence(err) => {
                tracing::error!(error = %err, "persistence error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"success": false, "error": "internal storage error"}),
                )
            }
            CoreError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"success": false, "error": msg}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
