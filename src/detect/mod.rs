//! Anomaly detection: ensemble scoring and the training loop.
//!
//! The detector owns the loaded model instances and scores feature
//! frames after every ingest cycle; the sequence model is evaluated per
//! line on its own cadence. Anomalies are persisted first and published
//! to the bus only after the durable write succeeds, so subscribers only
//! ever see durable anomalies.

pub mod autoencoder;
pub mod isolation_forest;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::DetectConfig;
use crate::features::welford::RollingStats;
use crate::features::{FeatureFrame, LineTick};
use crate::metrics::MonitorMetrics;
use crate::store::{
    Anomaly, AnomalyKind, PositionQuery, SharedStore, StoreError, TrainPosition,
};

pub use autoencoder::Autoencoder;
pub use isolation_forest::IsolationForest;

pub const OUTLIER_MODEL: &str = "isolation_forest";
pub const SEQUENCE_MODEL: &str = "sequence_autoencoder";

/// Sequence model input features per step: headway, delay, dwell means.
const SEQUENCE_FEATURES: usize = 3;

/// Minimum frames before the outlier model will fit.
const MIN_OUTLIER_SAMPLES: usize = 50;

/// Minimum flattened sequences before the sequence model will fit.
const MIN_SEQUENCE_SAMPLES: usize = 8;

/// Fixed training seed; determinism matters more than tree diversity
/// across retrains.
const TRAIN_SEED: u64 = 42;

const TRAIN_EPOCHS: usize = 50;

/// Names of the outlier model's input vector, in order.
pub const OUTLIER_FEATURES: [&str; 7] = [
    "headway_s",
    "dwell_s",
    "delay_s",
    "headway_z",
    "dwell_z",
    "hour",
    "is_rush_hour",
];

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("insufficient training data: {0}")]
    InsufficientData(String),
    #[error("model error: {0}")]
    Model(String),
}

/// Lifecycle of one model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    Absent,
    Training,
    Ready,
    Refreshing,
}

struct ModelSlot<M> {
    phase: ModelPhase,
    model: Option<Arc<M>>,
    version: i64,
}

impl<M> ModelSlot<M> {
    fn empty() -> Self {
        Self {
            phase: ModelPhase::Absent,
            model: None,
            version: 0,
        }
    }

    /// Phase while a (re)train is in flight.
    fn begin_training(&mut self) {
        self.phase = if self.model.is_some() {
            ModelPhase::Refreshing
        } else {
            ModelPhase::Training
        };
    }

    /// On failure the previous model, if any, stays live.
    fn fail_training(&mut self) {
        self.phase = if self.model.is_some() {
            ModelPhase::Ready
        } else {
            ModelPhase::Absent
        };
    }

    fn install(&mut self, model: Arc<M>, version: i64) {
        self.model = Some(model);
        self.version = version;
        self.phase = ModelPhase::Ready;
    }
}

/// Per-model phase and version, surfaced by `/health/ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub phase: ModelPhase,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub outlier: ModelStatus,
    pub sequence: ModelStatus,
}

/// Result of one scoring pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub frames_scored: usize,
    pub anomalies: usize,
    pub suppressed: usize,
    /// True when a model was absent and its scores were skipped.
    pub model_cold: bool,
}

struct SuppressEntry {
    anomaly_id: Uuid,
    last_seen: DateTime<Utc>,
}

pub struct Detector {
    cfg: DetectConfig,
    store: SharedStore,
    bus: Arc<EventBus>,
    metrics: Arc<MonitorMetrics>,
    outlier: RwLock<ModelSlot<IsolationForest>>,
    sequence: RwLock<ModelSlot<Autoencoder>>,
    /// Recent per-line tick aggregates, newest last.
    line_series: Mutex<HashMap<String, VecDeque<[f64; 3]>>>,
    last_sequence_eval: Mutex<HashMap<String, DateTime<Utc>>>,
    suppress: Mutex<HashMap<(String, AnomalyKind), SuppressEntry>>,
}

impl Detector {
    pub fn new(
        cfg: DetectConfig,
        store: SharedStore,
        bus: Arc<EventBus>,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        Self {
            cfg,
            store,
            bus,
            metrics,
            outlier: RwLock::new(ModelSlot::empty()),
            sequence: RwLock::new(ModelSlot::empty()),
            line_series: Mutex::new(HashMap::new()),
            last_sequence_eval: Mutex::new(HashMap::new()),
            suppress: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> DetectorStatus {
        let outlier = self.outlier.read();
        let sequence = self.sequence.read();
        DetectorStatus {
            outlier: ModelStatus {
                phase: outlier.phase,
                version: outlier.version,
            },
            sequence: ModelStatus {
                phase: sequence.phase,
                version: sequence.version,
            },
        }
    }

    /// Cold start: load the latest artifacts, or train when none exist.
    pub async fn ensure_models(&self) {
        let mut need_training = false;
        match self.store.get_latest_artifact(OUTLIER_MODEL).await {
            Ok(Some(artifact)) => match serde_json::from_slice::<IsolationForest>(&artifact.payload)
            {
                Ok(model) => {
                    self.outlier.write().install(Arc::new(model), artifact.version);
                    info!(version = artifact.version, "outlier model loaded");
                }
                Err(e) => {
                    warn!(error = %e, "stored outlier artifact unreadable");
                    need_training = true;
                }
            },
            Ok(None) => need_training = true,
            Err(e) => warn!(error = %e, "artifact lookup failed"),
        }
        match self.store.get_latest_artifact(SEQUENCE_MODEL).await {
            Ok(Some(artifact)) => match serde_json::from_slice::<Autoencoder>(&artifact.payload) {
                Ok(model) => {
                    self.sequence.write().install(Arc::new(model), artifact.version);
                    info!(version = artifact.version, "sequence model loaded");
                }
                Err(e) => {
                    warn!(error = %e, "stored sequence artifact unreadable");
                    need_training = true;
                }
            },
            Ok(None) => need_training = true,
            Err(e) => warn!(error = %e, "artifact lookup failed"),
        }
        if need_training {
            if let Err(e) = self.train_models(Utc::now()).await {
                // Normal on a fresh deployment: no history yet.
                info!(error = %e, "cold-start training deferred");
            }
        }
    }

    /// Score one ingest cycle's frames with the outlier model.
    pub async fn score_frames(&self, frames: &[FeatureFrame]) -> DetectionSummary {
        let mut summary = DetectionSummary {
            frames_scored: frames.len(),
            ..Default::default()
        };
        let (model, version) = {
            let slot = self.outlier.read();
            match &slot.model {
                Some(model) => (Arc::clone(model), slot.version),
                None => {
                    summary.model_cold = true;
                    return summary;
                }
            }
        };

        for frame in frames {
            let vector = outlier_vector(frame);
            let score = model.score(&vector);
            if score < model.threshold() {
                continue;
            }
            let kind = classify_frame(frame);
            let anomaly = Anomaly {
                anomaly_id: Uuid::new_v4(),
                detected_at: frame.observed_at,
                station_id: Some(frame.stop_id.clone()),
                route_id: Some(frame.route_id.clone()),
                line: Some(frame.line.clone()),
                kind,
                severity: score.clamp(0.0, 1.0),
                model_name: OUTLIER_MODEL.to_string(),
                model_version: version,
                features: OUTLIER_FEATURES
                    .iter()
                    .map(|name| name.to_string())
                    .zip(vector.iter().copied())
                    .collect(),
                resolved: false,
                resolved_at: None,
            };
            self.emit(anomaly, &mut summary).await;
        }
        summary
    }

    /// Feed one tick's per-line aggregates and evaluate the sequence
    /// model for lines whose cadence has elapsed.
    pub async fn sequence_tick(
        &self,
        ticks: &BTreeMap<String, LineTick>,
        now: DateTime<Utc>,
    ) -> DetectionSummary {
        let mut summary = DetectionSummary::default();
        {
            let mut series = self.line_series.lock();
            for (line, tick) in ticks {
                let buffer = series.entry(line.clone()).or_default();
                buffer.push_back([tick.headway_mean, tick.delay_mean, tick.dwell_mean]);
                while buffer.len() > self.cfg.sequence_length {
                    buffer.pop_front();
                }
            }
        }

        let (model, version) = {
            let slot = self.sequence.read();
            match &slot.model {
                Some(model) => (Arc::clone(model), slot.version),
                None => {
                    summary.model_cold = true;
                    return summary;
                }
            }
        };

        let due: Vec<(String, Vec<f64>)> = {
            let series = self.line_series.lock();
            let last_eval = self.last_sequence_eval.lock();
            series
                .iter()
                .filter(|(_, buffer)| buffer.len() >= model.sequence_length())
                .filter(|(line, _)| {
                    last_eval
                        .get(*line)
                        .map(|&t| now - t >= Duration::seconds(self.cfg.sequence_tick_s as i64))
                        .unwrap_or(true)
                })
                .map(|(line, buffer)| {
                    let flattened: Vec<f64> = buffer
                        .iter()
                        .rev()
                        .take(model.sequence_length())
                        .rev()
                        .flatten()
                        .copied()
                        .collect();
                    (line.clone(), flattened)
                })
                .collect()
        };
        {
            let mut last_eval = self.last_sequence_eval.lock();
            for (line, _) in &due {
                last_eval.insert(line.clone(), now);
            }
        }

        for (line, sequence) in due {
            summary.frames_scored += 1;
            let error = match model.reconstruction_error(&sequence) {
                Ok(error) => error,
                Err(e) => {
                    warn!(line = %line, error = %e, "sequence evaluation failed");
                    continue;
                }
            };
            if !model.is_anomalous(error) {
                continue;
            }
            let mut features = BTreeMap::new();
            features.insert("reconstruction_error".to_string(), error);
            features.insert("threshold".to_string(), model.threshold());
            let anomaly = Anomaly {
                anomaly_id: Uuid::new_v4(),
                detected_at: now,
                station_id: None,
                route_id: None,
                line: Some(line),
                kind: AnomalyKind::SequenceReconstruction,
                severity: model.severity(error),
                model_name: SEQUENCE_MODEL.to_string(),
                model_version: version,
                features,
                resolved: false,
                resolved_at: None,
            };
            self.emit(anomaly, &mut summary).await;
        }
        summary
    }

    /// Persist then publish, with duplicate suppression per
    /// `(station|route, kind)` inside the configured window.
    async fn emit(&self, anomaly: Anomaly, summary: &mut DetectionSummary) {
        let suppress_key = (
            anomaly
                .station_id
                .clone()
                .or_else(|| anomaly.route_id.clone())
                .or_else(|| anomaly.line.clone())
                .unwrap_or_default(),
            anomaly.kind,
        );
        let window = Duration::seconds(self.cfg.suppress_window_s);

        let existing = {
            let mut suppress = self.suppress.lock();
            match suppress.get_mut(&suppress_key) {
                Some(entry) if anomaly.detected_at - entry.last_seen <= window => {
                    entry.last_seen = anomaly.detected_at;
                    Some(entry.anomaly_id)
                }
                _ => None,
            }
        };

        if let Some(anomaly_id) = existing {
            match self.store.raise_severity(anomaly_id, anomaly.severity).await {
                Ok(()) => {
                    summary.suppressed += 1;
                    self.metrics.record_suppressed();
                    return;
                }
                Err(StoreError::NotFound { .. }) => {
                    // The suppressed row was purged; fall through and insert.
                    self.suppress.lock().remove(&suppress_key);
                }
                Err(e) => {
                    warn!(error = %e, "severity raise failed");
                    return;
                }
            }
        }

        // Durability before fan-out: subscribers only see stored rows.
        if let Err(e) = self.store.insert_anomaly(&anomaly).await {
            warn!(anomaly_id = %anomaly.anomaly_id, error = %e, "anomaly write failed, not publishing");
            return;
        }
        self.suppress.lock().insert(
            suppress_key,
            SuppressEntry {
                anomaly_id: anomaly.anomaly_id,
                last_seen: anomaly.detected_at,
            },
        );
        let slow = self.bus.publish_anomaly(&anomaly);
        if !slow.is_empty() {
            self.metrics.record_slow_consumers(slow.len() as u64);
        }
        self.metrics.record_anomaly();
        summary.anomalies += 1;
    }

    /// Operator-initiated one-shot scoring over the recent window.
    pub async fn trigger_detection(&self) -> Result<(Uuid, DetectionSummary), DetectError> {
        let run_id = Uuid::new_v4();
        let since = Utc::now() - Duration::hours(1);
        let rows = self
            .store
            .query_positions(&PositionQuery {
                since: Some(since),
                ..Default::default()
            })
            .await?;
        let frames = training_frames(&rows);
        let summary = self.score_frames(&frames).await;
        info!(run_id = %run_id, frames = frames.len(), anomalies = summary.anomalies, "manual detection run");
        Ok((run_id, summary))
    }

    /// Fit both models on the training window and atomically swap them
    /// in. A failed fit keeps the current models.
    pub async fn train_models(&self, now: DateTime<Utc>) -> Result<(), DetectError> {
        self.outlier.write().begin_training();
        self.sequence.write().begin_training();

        let since = now - Duration::hours(self.cfg.training_window_hours as i64);
        let rows = match self
            .store
            .query_positions(&PositionQuery {
                since: Some(since),
                ..Default::default()
            })
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.outlier.write().fail_training();
                self.sequence.write().fail_training();
                self.metrics.record_training_failure();
                return Err(e.into());
            }
        };

        let frames = training_frames(&rows);
        let contamination = self.cfg.contamination;
        let sequence_length = self.cfg.sequence_length;
        let hidden = self.cfg.hidden_size;
        let tick_seconds = self.cfg.sequence_tick_s.max(1);

        // CPU-bound fit off the async workers.
        let fit = tokio::task::spawn_blocking(move || {
            let vectors: Vec<Vec<f64>> =
                frames.iter().map(|f| outlier_vector(f).to_vec()).collect();
            let outlier = if vectors.len() >= MIN_OUTLIER_SAMPLES {
                IsolationForest::train(&vectors, contamination, TRAIN_SEED)
            } else {
                Err(format!(
                    "{} frames, need {MIN_OUTLIER_SAMPLES}",
                    vectors.len()
                ))
            };

            let series = build_line_series(&frames, tick_seconds);
            let mut sequences = Vec::new();
            for ticks in series.values() {
                if ticks.len() > sequence_length {
                    for window in ticks.windows(sequence_length) {
                        sequences.push(window.iter().flatten().copied().collect::<Vec<f64>>());
                    }
                }
            }
            let sequence = if sequences.len() >= MIN_SEQUENCE_SAMPLES {
                Autoencoder::train(
                    &sequences,
                    sequence_length,
                    SEQUENCE_FEATURES,
                    hidden,
                    TRAIN_EPOCHS,
                    TRAIN_SEED,
                )
            } else {
                Err(format!(
                    "{} sequences, need {MIN_SEQUENCE_SAMPLES}",
                    sequences.len()
                ))
            };
            (outlier, sequence)
        })
        .await
        .map_err(|e| DetectError::Model(format!("training task failed: {e}")))?;

        let (outlier_fit, sequence_fit) = fit;
        let mut failures = Vec::new();

        match outlier_fit {
            Ok((model, report)) => {
                let payload = serde_json::to_vec(&model)
                    .map_err(|e| DetectError::Model(e.to_string()))?;
                let mut hyperparams = BTreeMap::new();
                hyperparams.insert("contamination".to_string(), contamination);
                hyperparams.insert("threshold".to_string(), report.threshold);
                hyperparams.insert("train_samples".to_string(), report.train_samples as f64);
                let artifact = self
                    .store
                    .put_model_artifact(
                        OUTLIER_MODEL,
                        payload,
                        hyperparams,
                        self.cfg.training_window_hours,
                    )
                    .await?;
                self.outlier
                    .write()
                    .install(Arc::new(model), artifact.version);
                info!(
                    version = artifact.version,
                    samples = report.train_samples,
                    threshold = report.threshold,
                    "outlier model trained"
                );
            }
            Err(e) => {
                self.outlier.write().fail_training();
                failures.push(format!("{OUTLIER_MODEL}: {e}"));
            }
        }

        match sequence_fit {
            Ok((model, report)) => {
                let payload = serde_json::to_vec(&model)
                    .map_err(|e| DetectError::Model(e.to_string()))?;
                let mut hyperparams = BTreeMap::new();
                hyperparams.insert("sequence_length".to_string(), sequence_length as f64);
                hyperparams.insert("hidden_size".to_string(), hidden as f64);
                hyperparams.insert("threshold".to_string(), report.threshold);
                hyperparams.insert("train_samples".to_string(), report.train_samples as f64);
                let artifact = self
                    .store
                    .put_model_artifact(
                        SEQUENCE_MODEL,
                        payload,
                        hyperparams,
                        self.cfg.training_window_hours,
                    )
                    .await?;
                self.sequence
                    .write()
                    .install(Arc::new(model), artifact.version);
                info!(
                    version = artifact.version,
                    samples = report.train_samples,
                    "sequence model trained"
                );
            }
            Err(e) => {
                self.sequence.write().fail_training();
                failures.push(format!("{SEQUENCE_MODEL}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            self.metrics.record_training_failure();
            Err(DetectError::InsufficientData(failures.join("; ")))
        }
    }
}

/// The outlier model's numeric input vector.
pub fn outlier_vector(frame: &FeatureFrame) -> [f64; 7] {
    [
        frame.headway_s.unwrap_or(0.0),
        frame.dwell_s.unwrap_or(0.0),
        frame.delay_s,
        frame.headway_z.unwrap_or(0.0),
        frame.dwell_z.unwrap_or(0.0),
        frame.hour as f64,
        if frame.is_rush_hour { 1.0 } else { 0.0 },
    ]
}

/// Attribute the dominant deviation: z-scores past 2 sigma or a delay
/// past five minutes; largest exceedance wins.
pub fn classify_frame(frame: &FeatureFrame) -> AnomalyKind {
    let headway = frame.headway_z.map(|z| z.abs() / 2.0).unwrap_or(0.0);
    let dwell = frame.dwell_z.map(|z| z.abs() / 2.0).unwrap_or(0.0);
    let delay = frame.delay_s.abs() / 300.0;

    let mut kind = AnomalyKind::HeadwayOutlier;
    let mut best = headway;
    if dwell > best {
        kind = AnomalyKind::DwellOutlier;
        best = dwell;
    }
    if delay > best {
        kind = AnomalyKind::DelaySpike;
    }
    kind
}

/// Rebuild feature frames from stored positions, recomputing the rolling
/// z-scores the store does not persist. Rows may arrive in any order.
pub fn training_frames(rows: &[TrainPosition]) -> Vec<FeatureFrame> {
    let mut sorted: Vec<&TrainPosition> = rows.iter().collect();
    sorted.sort_by_key(|r| r.observed_at);

    type Key = (String, String, u8);
    let mut headway_stats: HashMap<Key, RollingStats> = HashMap::new();
    let mut dwell_stats: HashMap<Key, RollingStats> = HashMap::new();

    let mut frames = Vec::with_capacity(sorted.len());
    for row in sorted {
        let key = (row.line.clone(), row.stop_id.clone(), row.direction);
        let h_stats = headway_stats.entry(key.clone()).or_default();
        let headway_z = row.headway_s.and_then(|h| h_stats.zscore(h));
        let (mean, stdev) = (h_stats.mean(), h_stats.stdev());
        if let Some(h) = row.headway_s {
            h_stats.push(h);
        }
        let d_stats = dwell_stats.entry(key).or_default();
        let dwell_z = row.dwell_s.and_then(|d| d_stats.zscore(d));
        if let Some(d) = row.dwell_s {
            d_stats.push(d);
        }

        let delay_s = row.delay_seconds.map(f64::from).unwrap_or(0.0);
        use chrono::{Datelike, Timelike};
        frames.push(FeatureFrame {
            trip_id: row.trip_id.clone(),
            route_id: row.route_id.clone(),
            line: row.line.clone(),
            direction: row.direction,
            stop_id: row.stop_id.clone(),
            observed_at: row.observed_at,
            headway_s: row.headway_s,
            dwell_s: row.dwell_s,
            delay_s,
            schedule_adherence: row
                .schedule_adherence
                .unwrap_or((delay_s / 600.0).clamp(-1.0, 1.0)),
            rolling_headway_mean: mean,
            rolling_headway_stdev: stdev,
            headway_z,
            dwell_z,
            hour: row.observed_at.hour(),
            day_of_week: row.observed_at.weekday().num_days_from_monday(),
            is_rush_hour: {
                let hour = row.observed_at.hour();
                row.observed_at.weekday().num_days_from_monday() < 5
                    && ((7..=10).contains(&hour) || (17..=20).contains(&hour))
            },
        });
    }
    frames
}

/// Bucket frames into per-line tick aggregates for sequence training.
pub fn build_line_series(
    frames: &[FeatureFrame],
    tick_seconds: u64,
) -> BTreeMap<String, Vec<[f64; 3]>> {
    type Acc = (f64, usize, f64, usize, f64, usize);
    let mut buckets: BTreeMap<(String, i64), Acc> = BTreeMap::new();
    for frame in frames {
        let bucket = frame.observed_at.timestamp() / tick_seconds.max(1) as i64;
        let acc = buckets.entry((frame.line.clone(), bucket)).or_default();
        if let Some(h) = frame.headway_s {
            acc.0 += h;
            acc.1 += 1;
        }
        acc.2 += frame.delay_s;
        acc.3 += 1;
        if let Some(d) = frame.dwell_s {
            acc.4 += d;
            acc.5 += 1;
        }
    }

    let mut series: BTreeMap<String, Vec<[f64; 3]>> = BTreeMap::new();
    for ((line, _), (h, hn, d, dn, w, wn)) in buckets {
        series.entry(line).or_default().push([
            if hn > 0 { h / hn as f64 } else { 0.0 },
            if dn > 0 { d / dn as f64 } else { 0.0 },
            if wn > 0 { w / wn as f64 } else { 0.0 },
        ]);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscriptionFilter;
    use crate::feed::TrainStatus;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn cfg() -> DetectConfig {
        DetectConfig {
            contamination: 0.05,
            sequence_length: 6,
            hidden_size: 16,
            retrain_hour_utc: 3,
            training_window_hours: 168,
            sequence_tick_s: 0,
            suppress_window_s: 300,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn position(trip: &str, observed: i64, headway: f64, delay: i32) -> TrainPosition {
        TrainPosition {
            trip_id: trip.to_string(),
            route_id: "6".to_string(),
            line: "6".to_string(),
            direction: 1,
            stop_id: "635N".to_string(),
            observed_at: at(observed),
            current_stop_id: None,
            next_stop_id: Some("635N".to_string()),
            arrival_time: Some(at(observed)),
            departure_time: None,
            current_status: TrainStatus::Incoming,
            delay_seconds: Some(delay),
            lat: None,
            lon: None,
            headway_s: Some(headway),
            dwell_s: Some(35.0),
            schedule_adherence: Some(delay as f64 / 600.0),
        }
    }

    async fn seeded_detector() -> (Arc<Detector>, SharedStore, Arc<EventBus>) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let bus = EventBus::new(16);
        let detector = Arc::new(Detector::new(
            cfg(),
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::new(MonitorMetrics::new()),
        ));

        // A week-long-ish baseline of healthy headways.
        let mut rows = Vec::new();
        for i in 0..600i64 {
            let jitter = (i % 7 - 3) * 10;
            rows.push(position(
                &format!("t{i}"),
                i * 60,
                (180 + jitter) as f64,
                (i % 5 * 15) as i32,
            ));
        }
        store.insert_positions(&rows).await.unwrap();
        detector.train_models(at(700 * 60)).await.unwrap();
        (detector, store, bus)
    }

    fn outlier_frame(observed: i64) -> FeatureFrame {
        FeatureFrame {
            trip_id: "tx".to_string(),
            route_id: "6".to_string(),
            line: "6".to_string(),
            direction: 1,
            stop_id: "635N".to_string(),
            observed_at: at(observed),
            headway_s: Some(900.0),
            dwell_s: Some(35.0),
            delay_s: 600.0,
            schedule_adherence: 1.0,
            rolling_headway_mean: 180.0,
            rolling_headway_stdev: 30.0,
            headway_z: Some(24.0),
            dwell_z: Some(0.1),
            hour: 8,
            day_of_week: 1,
            is_rush_hour: true,
        }
    }

    #[tokio::test]
    async fn cold_detector_reports_model_cold_and_never_blocks() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let detector = Detector::new(
            cfg(),
            Arc::clone(&store),
            EventBus::new(4),
            Arc::new(MonitorMetrics::new()),
        );
        let summary = detector.score_frames(&[outlier_frame(0)]).await;
        assert!(summary.model_cold);
        assert_eq!(summary.anomalies, 0);
        assert_eq!(detector.status().outlier.phase, ModelPhase::Absent);
    }

    #[tokio::test]
    async fn training_swaps_models_and_stores_artifacts() {
        let (detector, store, _) = seeded_detector().await;
        let status = detector.status();
        assert_eq!(status.outlier.phase, ModelPhase::Ready);
        assert_eq!(status.sequence.phase, ModelPhase::Ready);
        assert_eq!(status.outlier.version, 1);

        assert!(store
            .get_latest_artifact(OUTLIER_MODEL)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_latest_artifact(SEQUENCE_MODEL)
            .await
            .unwrap()
            .is_some());

        // Retrain bumps versions monotonically.
        detector.train_models(at(800 * 60)).await.unwrap();
        assert_eq!(detector.status().outlier.version, 2);
    }

    #[tokio::test]
    async fn outlier_is_emitted_durable_then_published() {
        let (detector, store, bus) = seeded_detector().await;
        let mut sub = bus.subscribe(SubscriptionFilter::default()).unwrap();

        let summary = detector.score_frames(&[outlier_frame(700 * 60)]).await;
        assert_eq!(summary.anomalies, 1);

        let page = store
            .query_anomalies(&crate::store::AnomalyQuery::range(at(0), at(800 * 60)))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let stored = &page.anomalies[0];
        assert!((0.0..=1.0).contains(&stored.severity));
        assert_eq!(stored.kind, AnomalyKind::HeadwayOutlier);
        assert_eq!(stored.station_id.as_deref(), Some("635N"));
        assert_eq!(stored.features["headway_s"], 900.0);

        // Causality: the referenced artifact version exists.
        assert!(store
            .get_artifact(&stored.model_name, stored.model_version)
            .await
            .unwrap()
            .is_some());

        // Published after the durable write.
        let message = sub.receiver.recv().await.unwrap();
        assert_eq!(message.kind, "anomaly");
    }

    #[tokio::test]
    async fn duplicates_inside_window_raise_severity_in_place() {
        let (detector, store, _) = seeded_detector().await;

        let first = detector.score_frames(&[outlier_frame(700 * 60)]).await;
        assert_eq!(first.anomalies, 1);
        // Same station and kind 120 seconds later.
        let second = detector.score_frames(&[outlier_frame(700 * 60 + 120)]).await;
        assert_eq!(second.anomalies, 0);
        assert_eq!(second.suppressed, 1);

        let page = store
            .query_anomalies(&crate::store::AnomalyQuery::range(at(0), at(800 * 60)))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn normal_frames_stay_quiet() {
        let (detector, store, _) = seeded_detector().await;
        let mut frame = outlier_frame(700 * 60);
        frame.headway_s = Some(180.0);
        frame.delay_s = 15.0;
        frame.schedule_adherence = 0.025;
        frame.headway_z = Some(0.1);
        let summary = detector.score_frames(&[frame]).await;
        assert_eq!(summary.anomalies, 0);
        let page = store
            .query_anomalies(&crate::store::AnomalyQuery::range(at(0), at(800 * 60)))
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn sequence_tick_flags_reconstruction_failures() {
        let (detector, store, _) = seeded_detector().await;

        // Six healthy ticks then six disrupted ones.
        for i in 0..12 {
            let mut ticks = BTreeMap::new();
            let disrupted = i >= 6;
            ticks.insert(
                "6".to_string(),
                LineTick {
                    headway_mean: if disrupted { 900.0 } else { 180.0 },
                    delay_mean: if disrupted { 700.0 } else { 20.0 },
                    dwell_mean: if disrupted { 200.0 } else { 35.0 },
                    frames: 10,
                },
            );
            detector.sequence_tick(&ticks, at(700 * 60 + i * 60)).await;
        }

        let page = store
            .query_anomalies(&crate::store::AnomalyQuery::range(at(0), at(900 * 60)))
            .await
            .unwrap();
        let sequence_anomalies: Vec<_> = page
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::SequenceReconstruction)
            .collect();
        assert!(!sequence_anomalies.is_empty());
        assert!(sequence_anomalies
            .iter()
            .all(|a| (0.0..=1.0).contains(&a.severity)));
        assert_eq!(sequence_anomalies[0].line.as_deref(), Some("6"));
    }

    #[test]
    fn classification_prefers_the_dominant_signal() {
        let mut frame = outlier_frame(0);
        assert_eq!(classify_frame(&frame), AnomalyKind::HeadwayOutlier);

        frame.headway_z = Some(0.5);
        frame.dwell_z = Some(8.0);
        frame.delay_s = 60.0;
        assert_eq!(classify_frame(&frame), AnomalyKind::DwellOutlier);

        frame.dwell_z = Some(0.5);
        frame.delay_s = 1500.0;
        assert_eq!(classify_frame(&frame), AnomalyKind::DelaySpike);
    }

    #[test]
    fn line_series_buckets_by_tick() {
        let rows: Vec<TrainPosition> =
            (0..10).map(|i| position(&format!("t{i}"), i * 30, 180.0, 0)).collect();
        let frames = training_frames(&rows);
        let series = build_line_series(&frames, 60);
        let ticks = series.get("6").unwrap();
        // 10 observations 30s apart cover 5 one-minute buckets.
        assert_eq!(ticks.len(), 5);
        assert!((ticks[1][0] - 180.0).abs() < 1e-9);
    }
}
