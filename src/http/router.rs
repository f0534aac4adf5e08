//! Router configuration for the HTTP API.
//!
//! Sets up all routes and middleware (CORS, compression, tracing, the
//! request deadline) and produces the axum router ready for serving.

use std::time::Duration;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::error::AppError;
use super::handlers;
use super::state::AppState;
use super::ws;

/// Handlers inherit this deadline; longer queries fail with
/// `deadline_exceeded` and no partial result.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

async fn enforce_deadline(request: Request, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_DEADLINE, next.run(request)).await {
        Ok(response) => response,
        Err(_) => AppError::DeadlineExceeded.into_response(),
    }
}

/// Create the application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/anomalies", get(handlers::list_anomalies))
        .route("/anomalies/stats", get(handlers::anomaly_stats))
        .route("/anomalies/detect", post(handlers::trigger_detection))
        .route("/anomalies/{anomaly_id}", get(handlers::get_anomaly))
        .route(
            "/anomalies/{anomaly_id}/resolve",
            post(handlers::resolve_anomaly),
        )
        .route("/feeds/positions/{line}", get(handlers::line_positions))
        .route("/feeds/status", get(handlers::feed_status))
        .route("/stations", get(handlers::list_stations))
        .route("/health/live", get(handlers::health_live))
        .route("/health/ready", get(handlers::health_ready))
        .route("/ws", get(ws::ws_upgrade))
        .route("/ws/connections", get(ws::connection_stats))
        .layer(middleware::from_fn(enforce_deadline))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
