//! Persisted record types owned by the state store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feed::TrainStatus;

/// Outcome of one fetch-and-decode attempt for one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRunStatus {
    Ok,
    TransportError,
    DecodeError,
    /// Some entities were dropped; surviving positions were emitted.
    Partial,
}

impl FeedRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedRunStatus::Ok => "ok",
            FeedRunStatus::TransportError => "transport_error",
            FeedRunStatus::DecodeError => "decode_error",
            FeedRunStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(FeedRunStatus::Ok),
            "transport_error" => Some(FeedRunStatus::TransportError),
            "decode_error" => Some(FeedRunStatus::DecodeError),
            "partial" => Some(FeedRunStatus::Partial),
            _ => None,
        }
    }
}

/// One record per fetch attempt per feed. Immutable once written; the
/// store assigns the monotonic `run_id` on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRun {
    #[serde(default)]
    pub run_id: i64,
    pub feed_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities_seen: u32,
    pub alerts_seen: u32,
    pub status: FeedRunStatus,
    pub duration_ms: i64,
    /// Entities dropped when `status` is partial.
    pub skipped: u32,
}

/// One observed train position with its computed features, the row shape
/// of the time-partitioned positions table. `stop_id` is the stop the
/// observation pertains to and part of the dedup key
/// `(trip_id, stop_id, observed_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainPosition {
    pub trip_id: String,
    pub route_id: String,
    /// Line grouping derived from the route.
    pub line: String,
    pub direction: u8,
    pub stop_id: String,
    pub observed_at: DateTime<Utc>,
    pub current_stop_id: Option<String>,
    pub next_stop_id: Option<String>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub current_status: TrainStatus,
    pub delay_seconds: Option<i32>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub headway_s: Option<f64>,
    pub dwell_s: Option<f64>,
    pub schedule_adherence: Option<f64>,
}

/// The learned-baseline deviation classes the detector emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HeadwayOutlier,
    DwellOutlier,
    DelaySpike,
    SequenceReconstruction,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::HeadwayOutlier => "headway_outlier",
            AnomalyKind::DwellOutlier => "dwell_outlier",
            AnomalyKind::DelaySpike => "delay_spike",
            AnomalyKind::SequenceReconstruction => "sequence_reconstruction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "headway_outlier" => Some(AnomalyKind::HeadwayOutlier),
            "dwell_outlier" => Some(AnomalyKind::DwellOutlier),
            "delay_spike" => Some(AnomalyKind::DelaySpike),
            "sequence_reconstruction" => Some(AnomalyKind::SequenceReconstruction),
            _ => None,
        }
    }
}

/// A detected operational anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub station_id: Option<String>,
    pub route_id: Option<String>,
    /// Line grouping, derived from the route at creation time.
    pub line: Option<String>,
    pub kind: AnomalyKind,
    /// In [0, 1]; higher is more anomalous.
    pub severity: f64,
    pub model_name: String,
    pub model_version: i64,
    /// Input features that triggered the detection.
    pub features: BTreeMap<String, f64>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Versioned, opaque serialized model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    /// Monotonic per name, assigned by the store.
    pub version: i64,
    pub trained_at: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub hyperparams: BTreeMap<String, f64>,
    pub training_window_hours: u32,
}

/// Filter for position range queries.
#[derive(Debug, Clone, Default)]
pub struct PositionQuery {
    pub line: Option<String>,
    pub station_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Filter for paged anomaly queries.
#[derive(Debug, Clone)]
pub struct AnomalyQuery {
    pub line: Option<String>,
    pub station_id: Option<String>,
    pub severity_min: Option<f64>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

impl AnomalyQuery {
    pub fn range(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            line: None,
            station_id: None,
            severity_min: None,
            since,
            until,
            page: 1,
            page_size: usize::MAX,
        }
    }

    pub(crate) fn matches(&self, anomaly: &Anomaly) -> bool {
        if let Some(line) = &self.line {
            if anomaly.line.as_deref() != Some(line.as_str()) {
                return false;
            }
        }
        if let Some(station) = &self.station_id {
            if anomaly.station_id.as_deref() != Some(station.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.severity_min {
            if anomaly.severity < min {
                return false;
            }
        }
        anomaly.detected_at >= self.since && anomaly.detected_at <= self.until
    }
}

/// One page of anomalies, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyPage {
    pub anomalies: Vec<Anomaly>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}
