//! Request and response shapes for the REST API.
//!
//! Persisted records (anomalies, feed runs, positions, stations) already
//! derive `Serialize` and go over the wire as-is; this module holds the
//! query parameter structs and the aggregate responses.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::DetectorStatus;
use crate::store::{Anomaly, AnomalyPage, FeedRun};

/// Query parameters for `GET /anomalies`. `start`/`end` are unix
/// seconds; the range defaults to the trailing 24 hours.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnomalyListQuery {
    pub line: Option<String>,
    pub station: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub severity_min: Option<f64>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyListResponse {
    pub anomalies: Vec<Anomaly>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl From<AnomalyPage> for AnomalyListResponse {
    fn from(page: AnomalyPage) -> Self {
        Self {
            anomalies: page.anomalies,
            total: page.total,
            page: page.page,
            page_size: page.page_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_stats_hours")]
    pub hours: u32,
}

fn default_stats_hours() -> u32 {
    24
}

/// One hour of the anomaly trend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub hour: DateTime<Utc>,
    pub count: u64,
    pub avg_severity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityDistribution {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyStatsResponse {
    pub total_today: u64,
    pub total_active: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_line: BTreeMap<String, u64>,
    pub severity_distribution: SeverityDistribution,
    pub trend_24h: Vec<TrendPoint>,
}

/// Derive the stats aggregate from the anomalies in the window.
/// Severity buckets: low [0, 0.4), medium [0.4, 0.7), high [0.7, 1].
pub fn aggregate_stats(anomalies: &[Anomaly]) -> AnomalyStatsResponse {
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_line: BTreeMap<String, u64> = BTreeMap::new();
    let mut severity = SeverityDistribution::default();
    let mut active = 0u64;
    let mut trend: BTreeMap<DateTime<Utc>, (u64, f64)> = BTreeMap::new();

    for anomaly in anomalies {
        *by_type.entry(anomaly.kind.as_str().to_string()).or_default() += 1;
        if let Some(line) = &anomaly.line {
            *by_line.entry(line.clone()).or_default() += 1;
        }
        if anomaly.severity < 0.4 {
            severity.low += 1;
        } else if anomaly.severity < 0.7 {
            severity.medium += 1;
        } else {
            severity.high += 1;
        }
        if !anomaly.resolved {
            active += 1;
        }
        let hour = anomaly
            .detected_at
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(anomaly.detected_at);
        let entry = trend.entry(hour).or_default();
        entry.0 += 1;
        entry.1 += anomaly.severity;
    }

    AnomalyStatsResponse {
        total_today: anomalies.len() as u64,
        total_active: active,
        by_type,
        by_line,
        severity_distribution: severity,
        trend_24h: trend
            .into_iter()
            .map(|(hour, (count, severity_sum))| TrendPoint {
                hour,
                count,
                avg_severity: severity_sum / count.max(1) as f64,
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResponse {
    pub triggered: bool,
    pub run_id: uuid::Uuid,
    pub anomalies: usize,
    pub model_cold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStatusResponse {
    /// "ok" when any feed ran recently, otherwise "stale".
    pub status: String,
    pub last_runs: Vec<FeedRun>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StationsQuery {
    /// `min_lat,min_lon,max_lat,max_lon`.
    pub bbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    pub catalog: bool,
    pub store: bool,
    pub ingest_fresh: bool,
    pub models: DetectorStatus,
}

/// Staleness horizon for readiness and feed status.
pub fn freshness_horizon(update_interval_s: u64) -> Duration {
    Duration::seconds((2 * update_interval_s) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AnomalyKind;
    use uuid::Uuid;

    fn anomaly(severity: f64, resolved: bool, minutes_ago: i64) -> Anomaly {
        Anomaly {
            anomaly_id: Uuid::new_v4(),
            detected_at: Utc::now() - Duration::minutes(minutes_ago),
            station_id: Some("635".to_string()),
            route_id: Some("6".to_string()),
            line: Some("6".to_string()),
            kind: AnomalyKind::HeadwayOutlier,
            severity,
            model_name: "isolation_forest".to_string(),
            model_version: 1,
            features: Default::default(),
            resolved,
            resolved_at: None,
        }
    }

    #[test]
    fn severity_buckets_follow_the_contract() {
        let anomalies = vec![
            anomaly(0.0, false, 1),
            anomaly(0.39, false, 2),
            anomaly(0.4, false, 3),
            anomaly(0.69, false, 4),
            anomaly(0.7, true, 5),
            anomaly(1.0, false, 6),
        ];
        let stats = aggregate_stats(&anomalies);
        assert_eq!(stats.severity_distribution.low, 2);
        assert_eq!(stats.severity_distribution.medium, 2);
        assert_eq!(stats.severity_distribution.high, 2);
        assert_eq!(stats.total_today, 6);
        assert_eq!(stats.total_active, 5);
        assert_eq!(stats.by_type["headway_outlier"], 6);
        assert_eq!(stats.by_line["6"], 6);
    }

    #[test]
    fn trend_groups_by_hour() {
        let mut anomalies = vec![anomaly(0.5, false, 1), anomaly(0.7, false, 2)];
        anomalies.push(anomaly(0.9, false, 120));
        let stats = aggregate_stats(&anomalies);
        assert_eq!(stats.trend_24h.iter().map(|p| p.count).sum::<u64>(), 3);
        assert!(stats.trend_24h.len() >= 2);
        for point in &stats.trend_24h {
            assert!((0.0..=1.0).contains(&point.avg_severity));
        }
    }
}
