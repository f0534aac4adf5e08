//! HTTP handlers for the REST API.
//!
//! Each handler corresponds to one endpoint and delegates to the store,
//! catalog or detector; aggregation for the stats endpoint lives in
//! [`super::dto`].

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::catalog::{BoundingBox, Station};
use crate::store::{AnomalyQuery, TrainPosition};

use super::dto::{
    aggregate_stats, freshness_horizon, AnomalyListQuery, AnomalyListResponse,
    AnomalyStatsResponse, DetectResponse, FeedStatusResponse, LiveResponse, ReadyResponse,
    StationsQuery, StatsQuery, MAX_PAGE_SIZE,
};
use super::error::AppError;
use super::state::AppState;

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

fn parse_unix(name: &str, value: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp(value, 0)
        .ok_or_else(|| AppError::BadRequest(format!("{name} is not a valid unix timestamp")))
}

// ============================================================================
// Anomalies
// ============================================================================

/// GET /anomalies
pub async fn list_anomalies(
    State(state): State<AppState>,
    Query(query): Query<AnomalyListQuery>,
) -> HandlerResult<AnomalyListResponse> {
    let until = match query.end {
        Some(end) => parse_unix("end", end)?,
        None => Utc::now(),
    };
    let since = match query.start {
        Some(start) => parse_unix("start", start)?,
        None => until - Duration::hours(24),
    };
    if since > until {
        return Err(AppError::BadRequest("start is after end".to_string()));
    }
    let page = state
        .store
        .query_anomalies(&AnomalyQuery {
            line: query.line,
            station_id: query.station,
            severity_min: query.severity_min,
            since,
            until,
            page: query.page.max(1),
            page_size: query.page_size.clamp(1, MAX_PAGE_SIZE),
        })
        .await?;
    Ok(Json(page.into()))
}

/// GET /anomalies/stats
pub async fn anomaly_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> HandlerResult<AnomalyStatsResponse> {
    let hours = query.hours.clamp(1, 168);
    let until = Utc::now();
    let since = until - Duration::hours(hours as i64);
    let page = state
        .store
        .query_anomalies(&AnomalyQuery::range(since, until))
        .await?;
    Ok(Json(aggregate_stats(&page.anomalies)))
}

/// POST /anomalies/detect — operator-initiated one-shot scoring tick.
pub async fn trigger_detection(State(state): State<AppState>) -> HandlerResult<DetectResponse> {
    let (run_id, summary) = state.detector.trigger_detection().await?;
    Ok(Json(DetectResponse {
        triggered: true,
        run_id,
        anomalies: summary.anomalies,
        model_cold: summary.model_cold,
    }))
}

/// GET /anomalies/{anomaly_id}
pub async fn get_anomaly(
    State(state): State<AppState>,
    Path(anomaly_id): Path<String>,
) -> HandlerResult<crate::store::Anomaly> {
    let anomaly_id = Uuid::parse_str(&anomaly_id)
        .map_err(|_| AppError::BadRequest(format!("invalid anomaly id {anomaly_id:?}")))?;
    let anomaly = state
        .store
        .get_anomaly(anomaly_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("anomaly {anomaly_id}")))?;
    Ok(Json(anomaly))
}

/// POST /anomalies/{anomaly_id}/resolve
pub async fn resolve_anomaly(
    State(state): State<AppState>,
    Path(anomaly_id): Path<String>,
) -> HandlerResult<crate::store::Anomaly> {
    let anomaly_id = Uuid::parse_str(&anomaly_id)
        .map_err(|_| AppError::BadRequest(format!("invalid anomaly id {anomaly_id:?}")))?;
    let anomaly = state
        .store
        .resolve_anomaly(anomaly_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("anomaly {anomaly_id}")))?;
    Ok(Json(anomaly))
}

// ============================================================================
// Feeds
// ============================================================================

/// GET /feeds/positions/{line} — most recent snapshot per trip.
pub async fn line_positions(
    State(state): State<AppState>,
    Path(line): Path<String>,
) -> HandlerResult<Vec<TrainPosition>> {
    Ok(Json(state.store.latest_positions_for_line(&line).await?))
}

/// GET /feeds/status — recent run history across feeds.
pub async fn feed_status(State(state): State<AppState>) -> HandlerResult<FeedStatusResponse> {
    let last_runs = state
        .store
        .recent_feed_runs(state.config.ingest.feeds.len().max(1) * 3)
        .await?;
    let horizon = freshness_horizon(state.config.ingest.update_interval_s);
    let fresh = last_runs
        .iter()
        .any(|run| Utc::now() - run.finished_at <= horizon);
    Ok(Json(FeedStatusResponse {
        status: if fresh { "ok" } else { "stale" }.to_string(),
        last_runs,
    }))
}

// ============================================================================
// Stations
// ============================================================================

fn parse_bbox(raw: &str) -> Result<BoundingBox, AppError> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| AppError::BadRequest("bbox must be four numbers".to_string()))?;
    if parts.len() != 4 {
        return Err(AppError::BadRequest(
            "bbox must be min_lat,min_lon,max_lat,max_lon".to_string(),
        ));
    }
    Ok(BoundingBox {
        min_lat: parts[0],
        min_lon: parts[1],
        max_lat: parts[2],
        max_lon: parts[3],
    })
}

/// GET /stations
pub async fn list_stations(
    State(state): State<AppState>,
    Query(query): Query<StationsQuery>,
) -> HandlerResult<Vec<Station>> {
    let bbox = query.bbox.as_deref().map(parse_bbox).transpose()?;
    let stations = state
        .catalog
        .stations_in_bounds(bbox)
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(stations))
}

// ============================================================================
// Health
// ============================================================================

/// GET /health/live — is the process up.
pub async fn health_live() -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "ok".to_string(),
    })
}

/// GET /health/ready — catalog loaded, store reachable, ingest fresh.
pub async fn health_ready(State(state): State<AppState>) -> HandlerResult<ReadyResponse> {
    let store_ok = state.store.health_check().await.unwrap_or(false);
    let horizon = freshness_horizon(state.config.ingest.update_interval_s);
    let ingest_fresh = match state.store.latest_feed_run_at().await {
        Ok(Some(at)) => Utc::now() - at <= horizon,
        _ => false,
    };
    let catalog_ok = state.catalog.station_count() > 0 || state.catalog.routes().count() > 0;
    let ready = store_ok && ingest_fresh && catalog_ok;
    Ok(Json(ReadyResponse {
        status: if ready { "ok" } else { "unavailable" }.to_string(),
        catalog: catalog_ok,
        store: store_ok,
        ingest_fresh,
        models: state.detector.status(),
    }))
}
