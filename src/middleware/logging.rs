//! Request logging middleware.
//!
//! Every request through the Gateway gets one structured log line: method,
//! path, status, latency. `/health` is excluded since the Supervisor's own
//! readiness probe would otherwise dominate the log at idle.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Span};

const HEALTH_CHECK_PATH: &str = "/health";

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if path == HEALTH_CHECK_PATH {
        return next.run(request).await;
    }

    let start = Instant::now();
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %addr.ip(),
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let _guard = span.enter();

    let response = next.run(request).await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status();

    Span::current().record("status", status.as_u16());
    Span::current().record("latency_ms", latency_ms);

    log_outcome(&method, &path, status, latency_ms, Some(addr));
    response
}

fn log_outcome(
    method: &axum::http::Method,
    path: &str,
    status: StatusCode,
    latency_ms: u64,
    client_ip: Option<SocketAddr>,
) {
    if status.is_server_error() {
        warn!(
            %method,
            path,
            status = status.as_u16(),
            latency_ms,
            client_ip = client_ip.map(|a| a.ip().to_string()),
            "request failed (5xx)"
        );
    } else if status.is_client_error() {
        info!(
            %method,
            path,
            status = status.as_u16(),
            latency_ms,
            "request rejected (4xx)"
        );
    } else {
        info!(%method, path, status = status.as_u16(), latency_ms, "request completed");
    }
}
