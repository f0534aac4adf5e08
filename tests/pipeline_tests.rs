//! End-to-end pipeline scenarios: fetch -> decode -> features -> store
//! -> detect, driven through the scheduler against the in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prost::Message;

use subway_monitor::bus::{EventBus, SubscriptionFilter};
use subway_monitor::config::{Config, FeedDescriptor};
use subway_monitor::detect::Detector;
use subway_monitor::features::FeatureEngine;
use subway_monitor::feed::fetcher::{FeedFetcher, FeedTransport, FetchError};
use subway_monitor::feed::gtfs_rt::{
    trip_update::{StopTimeEvent, StopTimeUpdate},
    FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate,
};
use subway_monitor::feed::TrainStatus;
use subway_monitor::metrics::MonitorMetrics;
use subway_monitor::scheduler::Scheduler;
use subway_monitor::store::{
    AnomalyKind, AnomalyQuery, AnomalyStore, ArtifactStore, CatalogStore, FeedRun, FeedRunStatus,
    MemoryStore, ModelArtifact, PositionQuery, PositionStore, SharedStore, StoreResult,
    TrainPosition,
};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

/// Transport serving canned payloads, switchable between calls.
struct ScriptedTransport {
    payloads: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            payloads: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    fn set(&self, url: &str, payload: Vec<u8>) {
        self.payloads.lock().insert(url.to_string(), payload);
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.payloads
            .lock()
            .get(url)
            .cloned()
            .ok_or(FetchError::Timeout)
    }
}

fn trip_entity(trip_id: &str, stop_id: &str, arrival_unix: i64, delay: i32) -> FeedEntity {
    FeedEntity {
        id: format!("{trip_id}-{stop_id}"),
        is_deleted: None,
        trip_update: Some(TripUpdate {
            trip: TripDescriptor {
                trip_id: Some(trip_id.to_string()),
                start_time: None,
                start_date: None,
                schedule_relationship: None,
                route_id: Some("6".to_string()),
                direction_id: Some(1),
            },
            stop_time_update: vec![StopTimeUpdate {
                stop_sequence: None,
                arrival: Some(StopTimeEvent {
                    delay: Some(delay),
                    time: Some(arrival_unix),
                    uncertainty: None,
                }),
                departure: None,
                stop_id: Some(stop_id.to_string()),
                schedule_relationship: None,
            }],
            vehicle: None,
            timestamp: None,
            delay: None,
        }),
        vehicle: None,
        alert: None,
    }
}

fn envelope(header_unix: i64, entities: Vec<FeedEntity>) -> Vec<u8> {
    let message = FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            incrementality: Some(0),
            timestamp: Some(header_unix as u64),
        },
        entity: entities,
    };
    let mut buf = Vec::new();
    message.encode(&mut buf).unwrap();
    buf
}

fn config_for(feeds: Vec<FeedDescriptor>) -> Arc<Config> {
    let mut config = Config::default();
    config.ingest.feeds = feeds;
    config.ingest.max_retries = 0;
    config.detect.sequence_tick_s = 0;
    config.detect.hidden_size = 16;
    config.detect.sequence_length = 6;
    Arc::new(config)
}

struct Harness {
    scheduler: Arc<Scheduler>,
    detector: Arc<Detector>,
    store: SharedStore,
    bus: Arc<EventBus>,
    transport: Arc<ScriptedTransport>,
}

fn harness(config: Arc<Config>, store: SharedStore) -> Harness {
    let transport = ScriptedTransport::new();
    let metrics = Arc::new(MonitorMetrics::new());
    let bus = EventBus::new(64);
    let detector = Arc::new(Detector::new(
        config.detect,
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&metrics),
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::new(FeedFetcher::new(
            transport.clone() as Arc<dyn FeedTransport>,
            config.ingest.max_retries,
        )),
        FeatureEngine::new(config.features),
        Arc::clone(&detector),
        Arc::clone(&bus),
        metrics,
    );
    Harness {
        scheduler,
        detector,
        store,
        bus,
        transport,
    }
}

/// Healthy baseline: one train every ~3 minutes at 635N for `count`
/// observations, persisted with features. Anchored so the final row sits
/// shortly before now, inside every replay and training window.
fn baseline_rows(count: usize) -> Vec<TrainPosition> {
    let start = Utc::now() - Duration::seconds(count as i64 * 180 + 900);
    (0..count)
        .map(|i| {
            let jitter = (i as i64 % 7 - 3) * 10;
            let at = start + Duration::seconds(i as i64 * 180);
            TrainPosition {
                trip_id: format!("base-{i}"),
                route_id: "6".to_string(),
                line: "6".to_string(),
                direction: 1,
                stop_id: "635N".to_string(),
                observed_at: at,
                current_stop_id: None,
                next_stop_id: Some("635N".to_string()),
                arrival_time: Some(at),
                departure_time: None,
                current_status: TrainStatus::Incoming,
                delay_seconds: Some((i as i32 % 4) * 20),
                lat: None,
                lon: None,
                headway_s: Some((180 + jitter) as f64),
                dwell_s: Some(35.0),
                schedule_adherence: Some(0.02),
            }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Scenario 1: nominal ingest
// ----------------------------------------------------------------------------

#[tokio::test]
async fn nominal_ingest_three_trips_four_stops() {
    let feed = FeedDescriptor {
        feed_id: "six".to_string(),
        url: "http://feeds.test/six".to_string(),
    };
    let store: SharedStore = Arc::new(MemoryStore::new());
    let h = harness(config_for(vec![feed.clone()]), Arc::clone(&store));

    let header = 1_700_000_000i64;
    let mut entities = Vec::new();
    for t in 0..3 {
        for s in 0..4 {
            entities.push(trip_entity(
                &format!("trip-{t}"),
                &format!("60{s}N"),
                header + 60 + t * 120 + s * 30,
                0,
            ));
        }
    }
    h.transport.set(&feed.url, envelope(header, entities));

    let frames = h.scheduler.ingest_once().await;
    assert_eq!(frames.len(), 12, "one frame per trip/stop update");

    let runs = h.store.recent_feed_runs(5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, FeedRunStatus::Ok);
    assert_eq!(runs[0].entities_seen, 3);
    assert!(runs[0].finished_at >= runs[0].started_at);

    // No models loaded: zero anomalies, never blocking.
    let summary = h.detector.score_frames(&frames).await;
    assert!(summary.model_cold);
    assert_eq!(summary.anomalies, 0);
}

// ----------------------------------------------------------------------------
// Scenario 2: headway outlier at 635N
// ----------------------------------------------------------------------------

#[tokio::test]
async fn headway_outlier_fires_with_high_severity() {
    let feed = FeedDescriptor {
        feed_id: "six".to_string(),
        url: "http://feeds.test/six".to_string(),
    };
    let store: SharedStore = Arc::new(MemoryStore::new());
    let rows = baseline_rows(600);
    let last_arrival = rows.last().unwrap().observed_at;
    store.insert_positions(&rows).await.unwrap();

    let h = harness(config_for(vec![feed.clone()]), Arc::clone(&store));
    h.detector.train_models(Utc::now()).await.unwrap();
    h.scheduler.warm_start().await;

    let mut sub = h
        .bus
        .subscribe(SubscriptionFilter {
            line: Some("6".to_string()),
            severity_min: Some(0.7),
            ..Default::default()
        })
        .unwrap();

    // The last baseline arrival plus a 15 minute gap.
    let gap_arrival = last_arrival + Duration::seconds(900);
    h.transport.set(
        &feed.url,
        envelope(
            gap_arrival.timestamp(),
            vec![trip_entity("gap-train", "635N", gap_arrival.timestamp(), 600)],
        ),
    );

    let frames = h.scheduler.ingest_once().await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].headway_s, Some(900.0));

    let summary = h.detector.score_frames(&frames).await;
    assert_eq!(summary.anomalies, 1);

    let page = h
        .store
        .query_anomalies(&AnomalyQuery::range(
            gap_arrival - Duration::hours(48),
            gap_arrival + Duration::hours(1),
        ))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    let anomaly = &page.anomalies[0];
    assert_eq!(anomaly.kind, AnomalyKind::HeadwayOutlier);
    assert_eq!(anomaly.station_id.as_deref(), Some("635N"));
    assert!(
        anomaly.severity >= 0.7,
        "severity {} below 0.7",
        anomaly.severity
    );
    assert_eq!(anomaly.features.get("headway_s"), Some(&900.0));

    // Scenario 6: the filtered subscriber receives exactly this anomaly.
    let delivered = sub.receiver.recv().await.unwrap();
    assert_eq!(delivered.kind, "anomaly");
    let data = delivered.data.unwrap();
    assert_eq!(data["station_id"], "635N");
}

// ----------------------------------------------------------------------------
// Scenario 4: duplicate suppression
// ----------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_outliers_coalesce_to_max_severity() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    store.insert_positions(&baseline_rows(600)).await.unwrap();
    let h = harness(config_for(Vec::new()), Arc::clone(&store));
    h.detector.train_models(Utc::now()).await.unwrap();

    let make_frame = |at: DateTime<Utc>, headway: f64| subway_monitor::features::FeatureFrame {
        trip_id: "dup".to_string(),
        route_id: "6".to_string(),
        line: "6".to_string(),
        direction: 1,
        stop_id: "635N".to_string(),
        observed_at: at,
        headway_s: Some(headway),
        dwell_s: Some(35.0),
        delay_s: 700.0,
        schedule_adherence: 1.0,
        rolling_headway_mean: 180.0,
        rolling_headway_stdev: 30.0,
        headway_z: Some((headway - 180.0) / 30.0),
        dwell_z: Some(0.0),
        hour: 8,
        day_of_week: 1,
        is_rush_hour: true,
    };

    let t0 = Utc::now();
    let first = h.detector.score_frames(&[make_frame(t0, 900.0)]).await;
    assert_eq!(first.anomalies, 1);
    // 120 seconds later, same station and kind, stronger signal.
    let second = h
        .detector
        .score_frames(&[make_frame(t0 + Duration::seconds(120), 1400.0)])
        .await;
    assert_eq!(second.anomalies, 0);
    assert_eq!(second.suppressed, 1);

    let page = h
        .store
        .query_anomalies(&AnomalyQuery::range(t0 - Duration::hours(1), t0 + Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(page.total, 1, "only one row inserted");

    // Severity is the max of the two scores: re-scoring the stronger
    // frame alone must not exceed the stored value.
    let stored = page.anomalies[0].severity;
    assert!((0.7..=1.0).contains(&stored));
}

// ----------------------------------------------------------------------------
// Scenario 5: retention purge
// ----------------------------------------------------------------------------

#[tokio::test]
async fn purge_drops_everything_past_retention() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let mut config = Config::default();
    config.store.retention_hours = 1;
    config.ingest.feeds = Vec::new();
    let h = harness(Arc::new(config), Arc::clone(&store));

    let now = Utc::now();
    let rows: Vec<TrainPosition> = (0..90)
        .map(|minutes| TrainPosition {
            trip_id: format!("t{minutes}"),
            route_id: "6".to_string(),
            line: "6".to_string(),
            direction: 1,
            stop_id: "635N".to_string(),
            observed_at: now - Duration::minutes(minutes),
            current_stop_id: None,
            next_stop_id: None,
            arrival_time: None,
            departure_time: None,
            current_status: TrainStatus::InTransit,
            delay_seconds: None,
            lat: None,
            lon: None,
            headway_s: None,
            dwell_s: None,
            schedule_adherence: None,
        })
        .collect();
    store.insert_positions(&rows).await.unwrap();

    h.scheduler.purge_once().await;

    let remaining = store
        .query_positions(&PositionQuery::default())
        .await
        .unwrap();
    assert!(!remaining.is_empty());
    assert!(
        remaining
            .iter()
            .all(|p| p.observed_at >= now - Duration::seconds(3600)),
        "rows older than one hour survived the purge"
    );
}

// ----------------------------------------------------------------------------
// Model causality
// ----------------------------------------------------------------------------

#[tokio::test]
async fn every_anomaly_references_an_existing_artifact() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    store.insert_positions(&baseline_rows(600)).await.unwrap();
    let h = harness(config_for(Vec::new()), Arc::clone(&store));
    h.detector.train_models(Utc::now()).await.unwrap();

    let frame = subway_monitor::features::FeatureFrame {
        trip_id: "c".to_string(),
        route_id: "6".to_string(),
        line: "6".to_string(),
        direction: 1,
        stop_id: "635N".to_string(),
        observed_at: Utc::now(),
        headway_s: Some(1200.0),
        dwell_s: Some(400.0),
        delay_s: 900.0,
        schedule_adherence: 1.0,
        rolling_headway_mean: 180.0,
        rolling_headway_stdev: 30.0,
        headway_z: Some(30.0),
        dwell_z: Some(20.0),
        hour: 3,
        day_of_week: 6,
        is_rush_hour: false,
    };
    h.detector.score_frames(&[frame]).await;

    let page = h
        .store
        .query_anomalies(&AnomalyQuery::range(
            Utc::now() - Duration::hours(1),
            Utc::now() + Duration::hours(1),
        ))
        .await
        .unwrap();
    for anomaly in &page.anomalies {
        assert!((0.0..=1.0).contains(&anomaly.severity));
        let artifact = h
            .store
            .get_artifact(&anomaly.model_name, anomaly.model_version)
            .await
            .unwrap()
            .expect("artifact referenced by anomaly must exist");
        assert!(artifact.trained_at <= anomaly.detected_at);
    }
}

// ----------------------------------------------------------------------------
// Backpressure under slow writes
// ----------------------------------------------------------------------------

/// Store wrapper injecting a fixed write delay.
struct SlowWriteStore {
    inner: MemoryStore,
    delay: StdDuration,
}

#[async_trait]
impl PositionStore for SlowWriteStore {
    async fn insert_positions(&self, batch: &[TrainPosition]) -> StoreResult<usize> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_positions(batch).await
    }
    async fn query_positions(&self, query: &PositionQuery) -> StoreResult<Vec<TrainPosition>> {
        self.inner.query_positions(query).await
    }
    async fn latest_positions_for_line(&self, line: &str) -> StoreResult<Vec<TrainPosition>> {
        self.inner.latest_positions_for_line(line).await
    }
    async fn insert_feed_run(&self, run: FeedRun) -> StoreResult<i64> {
        self.inner.insert_feed_run(run).await
    }
    async fn recent_feed_runs(&self, limit: usize) -> StoreResult<Vec<FeedRun>> {
        self.inner.recent_feed_runs(limit).await
    }
    async fn latest_feed_run_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.latest_feed_run_at().await
    }
    async fn purge_positions_before(&self, ts: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_positions_before(ts).await
    }
}

#[async_trait]
impl AnomalyStore for SlowWriteStore {
    async fn insert_anomaly(&self, anomaly: &subway_monitor::store::Anomaly) -> StoreResult<()> {
        self.inner.insert_anomaly(anomaly).await
    }
    async fn raise_severity(&self, anomaly_id: Uuid, severity: f64) -> StoreResult<()> {
        self.inner.raise_severity(anomaly_id, severity).await
    }
    async fn query_anomalies(
        &self,
        query: &AnomalyQuery,
    ) -> StoreResult<subway_monitor::store::AnomalyPage> {
        self.inner.query_anomalies(query).await
    }
    async fn get_anomaly(
        &self,
        anomaly_id: Uuid,
    ) -> StoreResult<Option<subway_monitor::store::Anomaly>> {
        self.inner.get_anomaly(anomaly_id).await
    }
    async fn resolve_anomaly(
        &self,
        anomaly_id: Uuid,
    ) -> StoreResult<Option<subway_monitor::store::Anomaly>> {
        self.inner.resolve_anomaly(anomaly_id).await
    }
    async fn purge_anomalies_before(&self, ts: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.purge_anomalies_before(ts).await
    }
}

#[async_trait]
impl ArtifactStore for SlowWriteStore {
    async fn put_model_artifact(
        &self,
        name: &str,
        payload: Vec<u8>,
        hyperparams: BTreeMap<String, f64>,
        training_window_hours: u32,
    ) -> StoreResult<ModelArtifact> {
        self.inner
            .put_model_artifact(name, payload, hyperparams, training_window_hours)
            .await
    }
    async fn get_latest_artifact(&self, name: &str) -> StoreResult<Option<ModelArtifact>> {
        self.inner.get_latest_artifact(name).await
    }
    async fn get_artifact(&self, name: &str, version: i64) -> StoreResult<Option<ModelArtifact>> {
        self.inner.get_artifact(name, version).await
    }
}

#[async_trait]
impl CatalogStore for SlowWriteStore {
    async fn upsert_stations(
        &self,
        stations: &[subway_monitor::catalog::Station],
    ) -> StoreResult<usize> {
        self.inner.upsert_stations(stations).await
    }
    async fn upsert_routes(
        &self,
        routes: &[subway_monitor::catalog::Route],
    ) -> StoreResult<usize> {
        self.inner.upsert_routes(routes).await
    }
    async fn health_check(&self) -> StoreResult<bool> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn slow_writes_keep_ticks_bounded_and_runs_recorded() {
    let feed = FeedDescriptor {
        feed_id: "six".to_string(),
        url: "http://feeds.test/six".to_string(),
    };
    let store: SharedStore = Arc::new(SlowWriteStore {
        inner: MemoryStore::new(),
        delay: StdDuration::from_secs(3),
    });
    let h = harness(config_for(vec![feed.clone()]), Arc::clone(&store));

    let header = 1_700_000_000i64;
    h.transport.set(
        &feed.url,
        envelope(
            header,
            vec![trip_entity("t1", "635N", header + 60, 0)],
        ),
    );

    let started = std::time::Instant::now();
    let frames = h.scheduler.ingest_once().await;
    let elapsed = started.elapsed();

    assert_eq!(frames.len(), 1);
    // One write of ~3s, no retry storm: the tick stays bounded.
    assert!(elapsed < StdDuration::from_secs(10), "tick took {elapsed:?}");
    let runs = store.recent_feed_runs(5).await.unwrap();
    assert_eq!(runs.len(), 1, "no FeedRun may go unrecorded");
}
