pub mod error;
pub mod health;
pub mod v1;

use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::controller::AppState;

pub use error::ApiError;

pub fn router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.cfg.server.request_timeout_secs);
    Router::new()
        .nest("/api/v1", v1::router(state))
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
                .layer(timeout_layer(timeout)),
        )
        .layer(TraceLayer::new_for_http())
}

/// Requests still running after `timeout` are answered with 408.
fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}
