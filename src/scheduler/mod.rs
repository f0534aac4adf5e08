//! Orchestration of the recurrent work: ingest ticks, detection ticks,
//! the nightly retrain, the retention purge and graceful shutdown.
//!
//! Feeds are fetched in parallel each tick with per-feed serialization: a
//! tick that overlaps an in-flight fetch for the same feed skips it and
//! counts an `overlap`. Detection fires on ingest completion, coalescing
//! completions within one second. Backpressure follows the store's p95
//! write latency: past the high watermark the per-tick batch halves, past
//! the drop watermark the slowest feeds are shed for the tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::{Config, FeedDescriptor};
use crate::detect::Detector;
use crate::features::{aggregate_by_line, FeatureEngine, FeatureFrame};
use crate::feed::decoder::{decode_feed, DecodedFeed};
use crate::feed::fetcher::FeedFetcher;
use crate::feed::types::TripEvent;
use crate::metrics::MonitorMetrics;
use crate::store::{FeedRun, FeedRunStatus, PositionQuery, SharedStore, TrainPosition};

/// Default per-tick row budget before backpressure kicks in.
const DEFAULT_BATCH_LIMIT: usize = 5000;
const MIN_BATCH_LIMIT: usize = 64;

/// Coalescing window for detection after ingest completions.
const DETECTION_COALESCE: std::time::Duration = std::time::Duration::from_secs(1);

/// Grace period for draining in-flight fetches on shutdown.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

pub struct Scheduler {
    config: Arc<Config>,
    store: SharedStore,
    fetcher: Arc<FeedFetcher>,
    engine: Mutex<FeatureEngine>,
    detector: Arc<Detector>,
    bus: Arc<EventBus>,
    metrics: Arc<MonitorMetrics>,
    in_flight: Mutex<HashSet<String>>,
    /// Last observed fetch+decode duration per feed, for shedding order.
    feed_durations: Mutex<HashMap<String, i64>>,
    batch_limit: AtomicUsize,
    training: AtomicBool,
    last_retrain_day: Mutex<Option<NaiveDate>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        store: SharedStore,
        fetcher: Arc<FeedFetcher>,
        engine: FeatureEngine,
        detector: Arc<Detector>,
        bus: Arc<EventBus>,
        metrics: Arc<MonitorMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            fetcher,
            engine: Mutex::new(engine),
            detector,
            bus,
            metrics,
            in_flight: Mutex::new(HashSet::new()),
            feed_durations: Mutex::new(HashMap::new()),
            batch_limit: AtomicUsize::new(DEFAULT_BATCH_LIMIT),
            training: AtomicBool::new(false),
            last_retrain_day: Mutex::new(None),
        })
    }

    /// Rebuild the feature windows from stored positions; called once at
    /// startup before the first tick.
    pub async fn warm_start(&self) {
        let horizon = self.engine.lock().window_horizon();
        let since = Utc::now() - horizon;
        match self
            .store
            .query_positions(&PositionQuery {
                since: Some(since),
                ..Default::default()
            })
            .await
        {
            Ok(rows) => {
                info!(rows = rows.len(), "feature windows warmed from store");
                self.engine.lock().warm_start(&rows);
            }
            Err(e) => warn!(error = %e, "warm start skipped"),
        }
    }

    /// One full ingest tick: all feeds in parallel, per-feed overlap
    /// skip, shedding under drop-watermark pressure. Returns the frames
    /// produced this tick.
    pub async fn ingest_once(self: &Arc<Self>) -> Vec<FeatureFrame> {
        let shed = self.shed_set();
        let mut tasks: JoinSet<Vec<FeatureFrame>> = JoinSet::new();

        for feed in &self.config.ingest.feeds {
            if shed.contains(&feed.feed_id) {
                self.metrics.record_shedding();
                warn!(feed_id = %feed.feed_id, "ingest_shedding: skipping decode under write pressure");
                continue;
            }
            {
                let mut in_flight = self.in_flight.lock();
                if !in_flight.insert(feed.feed_id.clone()) {
                    self.metrics.record_overlap();
                    info!(feed_id = %feed.feed_id, "overlap: fetch already in flight, skipping tick");
                    continue;
                }
            }
            let this = Arc::clone(self);
            let feed = feed.clone();
            tasks.spawn(async move {
                let frames = this.ingest_feed(&feed).await;
                this.in_flight.lock().remove(&feed.feed_id);
                frames
            });
        }

        let mut frames = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(feed_frames) => frames.extend(feed_frames),
                Err(e) => error!(error = %e, "ingest task panicked"),
            }
        }
        self.metrics.record_frames(frames.len() as u64);
        frames
    }

    /// Fetch, decode and persist one feed; a FeedRun is recorded in every
    /// case.
    async fn ingest_feed(&self, feed: &FeedDescriptor) -> Vec<FeatureFrame> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut run = FeedRun {
            run_id: 0,
            feed_id: feed.feed_id.clone(),
            started_at,
            finished_at: started_at,
            entities_seen: 0,
            alerts_seen: 0,
            status: FeedRunStatus::Ok,
            duration_ms: 0,
            skipped: 0,
        };

        let frames = match self.fetcher.fetch(feed).await {
            Err(err) => {
                warn!(feed_id = %feed.feed_id, error = %err, "transport failure");
                run.status = FeedRunStatus::TransportError;
                Vec::new()
            }
            Ok(bytes) => match decode_feed(&bytes) {
                Err(err) => {
                    warn!(feed_id = %feed.feed_id, error = %err, "decode failure");
                    run.status = FeedRunStatus::DecodeError;
                    Vec::new()
                }
                Ok(decoded) => {
                    run.entities_seen = decoded.entities_seen;
                    run.alerts_seen = decoded.alerts_seen;
                    run.skipped = decoded.skipped;
                    if decoded.is_partial() {
                        run.status = FeedRunStatus::Partial;
                    }
                    self.process_decoded(feed, &decoded).await
                }
            },
        };

        run.finished_at = Utc::now();
        run.duration_ms = clock.elapsed().as_millis() as i64;
        self.feed_durations
            .lock()
            .insert(feed.feed_id.clone(), run.duration_ms);
        if let Err(e) = self.store.insert_feed_run(run).await {
            error!(feed_id = %feed.feed_id, error = %e, "feed run not recorded");
        }
        frames
    }

    /// Run decoded records through the feature engine and persist the
    /// position rows with their computed features.
    async fn process_decoded(&self, feed: &FeedDescriptor, decoded: &DecodedFeed) -> Vec<FeatureFrame> {
        let (mut frames, mut rows) = {
            let mut engine = self.engine.lock();
            for vehicle in &decoded.vehicles {
                engine.process_vehicle(vehicle);
            }
            let mut frames = Vec::new();
            let mut rows = Vec::new();
            for event in &decoded.trips {
                if let Some(frame) = engine.process_trip(event) {
                    rows.push(position_row(event, &frame));
                    frames.push(frame);
                }
            }
            (frames, rows)
        };

        let limit = self.adjust_batch_limit();
        if rows.len() > limit {
            warn!(
                feed_id = %feed.feed_id,
                dropped = rows.len() - limit,
                limit,
                "batch truncated under write pressure"
            );
            rows.truncate(limit);
            frames.truncate(limit);
        }
        if rows.is_empty() {
            return frames;
        }

        let write_started = Instant::now();
        let mut attempt_result = self.store.insert_positions(&rows).await;
        if let Err(err) = &attempt_result {
            if err.is_retryable() {
                self.metrics.record_store_retry();
                attempt_result = self.store.insert_positions(&rows).await;
            }
        }
        self.metrics.record_write_latency(write_started.elapsed());

        if let Err(e) = attempt_result {
            let batch_id = uuid::Uuid::new_v4();
            error!(
                feed_id = %feed.feed_id,
                batch_id = %batch_id,
                rows = rows.len(),
                error = %e,
                "position batch lost after retry"
            );
            return Vec::new();
        }
        frames
    }

    /// Feeds to shed this tick: the slowest half, when the drop
    /// watermark is breached.
    fn shed_set(&self) -> HashSet<String> {
        let p95 = self.metrics.write_p95_ms();
        if p95 <= self.config.store.write_drop_watermark_ms as f64 {
            return HashSet::new();
        }
        let durations = self.feed_durations.lock();
        let mut ranked: Vec<(&String, &i64)> = durations.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));
        ranked
            .iter()
            .take(self.config.ingest.feeds.len() / 2)
            .map(|(id, _)| (*id).clone())
            .collect()
    }

    /// Halve the batch budget past the high watermark, recover toward
    /// the default once it clears. Returns the current budget.
    fn adjust_batch_limit(&self) -> usize {
        let p95 = self.metrics.write_p95_ms();
        let current = self.batch_limit.load(Ordering::Relaxed);
        let next = if p95 > self.config.store.write_high_watermark_ms as f64 {
            (current / 2).max(MIN_BATCH_LIMIT)
        } else {
            (current.saturating_mul(2)).min(DEFAULT_BATCH_LIMIT)
        };
        if next != current {
            info!(from = current, to = next, p95_ms = p95, "ingest batch budget adjusted");
            self.batch_limit.store(next, Ordering::Relaxed);
        }
        next
    }

    /// Purge rows past the retention horizon; called once per minute.
    pub async fn purge_once(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.store.retention_hours as i64);
        match self.store.purge_positions_before(cutoff).await {
            Ok(purged) if purged > 0 => info!(purged, "positions purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "position purge failed"),
        }
        match self.store.purge_anomalies_before(cutoff).await {
            Ok(purged) if purged > 0 => info!(purged, "anomalies purged"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "anomaly purge failed"),
        }
    }

    /// Kick the nightly retrain when the configured UTC hour arrives and
    /// it has not run today. Trainings never overlap.
    pub fn maybe_retrain(self: &Arc<Self>) {
        let now = Utc::now();
        if now.hour() != self.config.detect.retrain_hour_utc {
            return;
        }
        {
            let last = self.last_retrain_day.lock();
            if *last == Some(now.date_naive()) {
                return;
            }
        }
        if self.training.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.last_retrain_day.lock() = Some(now.date_naive());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("nightly retrain starting");
            if let Err(e) = this.detector.train_models(Utc::now()).await {
                warn!(error = %e, "training_failed");
            }
            this.training.store(false, Ordering::SeqCst);
        });
    }

    /// Main loop; returns after a graceful drain when `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<FeatureFrame>>();
        let detection = tokio::spawn(detection_loop(
            Arc::clone(&self.detector),
            frame_rx,
            shutdown.clone(),
        ));

        let mut ingest = tokio::time::interval(self.config.update_interval());
        ingest.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval(std::time::Duration::from_secs(60));
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retrain_check = tokio::time::interval(std::time::Duration::from_secs(60));

        info!(
            feeds = self.config.ingest.feeds.len(),
            interval_s = self.config.ingest.update_interval_s,
            "scheduler running"
        );
        loop {
            tokio::select! {
                _ = ingest.tick() => {
                    let this = Arc::clone(&self);
                    let tx = frame_tx.clone();
                    tokio::spawn(async move {
                        let frames = this.ingest_once().await;
                        if !frames.is_empty() {
                            let _ = tx.send(frames);
                        }
                    });
                }
                _ = purge.tick() => self.purge_once().await,
                _ = retrain_check.tick() => self.maybe_retrain(),
                _ = shutdown.changed() => break,
            }
        }

        info!("shutdown: draining in-flight fetches");
        let drain_started = Instant::now();
        while !self.in_flight.lock().is_empty() && drain_started.elapsed() < SHUTDOWN_GRACE {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        drop(frame_tx);
        let _ = detection.await;
        self.bus.close_all();
        info!("scheduler stopped");
    }
}

/// Score ingest completions, coalescing bursts within one second.
async fn detection_loop(
    detector: Arc<Detector>,
    mut frames_rx: mpsc::UnboundedReceiver<Vec<FeatureFrame>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut frames = tokio::select! {
            received = frames_rx.recv() => match received {
                Some(frames) => frames,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        let coalesce = tokio::time::sleep(DETECTION_COALESCE);
        tokio::pin!(coalesce);
        loop {
            tokio::select! {
                more = frames_rx.recv() => match more {
                    Some(extra) => frames.extend(extra),
                    None => break,
                },
                _ = &mut coalesce => break,
            }
        }

        let now = Utc::now();
        let summary = detector.score_frames(&frames).await;
        let ticks = aggregate_by_line(&frames);
        let sequence = detector.sequence_tick(&ticks, now).await;
        if summary.anomalies + sequence.anomalies > 0 {
            info!(
                frames = frames.len(),
                anomalies = summary.anomalies + sequence.anomalies,
                suppressed = summary.suppressed + sequence.suppressed,
                "detection tick"
            );
        }
    }
}

/// Persisted row for one trip observation with its computed features.
fn position_row(event: &TripEvent, frame: &FeatureFrame) -> TrainPosition {
    TrainPosition {
        trip_id: event.trip_id.clone(),
        route_id: event.route_id.clone(),
        line: frame.line.clone(),
        direction: event.direction,
        stop_id: event.stop_id.clone(),
        observed_at: event.observed_at,
        current_stop_id: None,
        next_stop_id: Some(event.stop_id.clone()),
        arrival_time: event.arrival_time,
        departure_time: event.departure_time,
        current_status: crate::feed::TrainStatus::InTransit,
        delay_seconds: event
            .delay_seconds
            .or(Some(frame.delay_s as i32)),
        lat: None,
        lon: None,
        headway_s: frame.headway_s,
        dwell_s: frame.dwell_s,
        schedule_adherence: Some(frame.schedule_adherence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;
    use crate::feed::fetcher::{FeedTransport, FetchError};
    use crate::feed::gtfs_rt::{
        trip_update::{StopTimeEvent, StopTimeUpdate},
        FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use prost::Message;

    struct StaticTransport {
        payloads: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl FeedTransport for StaticTransport {
        async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.payloads
                .get(url)
                .cloned()
                .ok_or(FetchError::Timeout)
        }
    }

    fn payload(trips: usize, stops_per_trip: usize, header_ts: u64) -> Vec<u8> {
        let entities: Vec<FeedEntity> = (0..trips)
            .map(|t| FeedEntity {
                id: format!("e{t}"),
                is_deleted: None,
                trip_update: Some(TripUpdate {
                    trip: TripDescriptor {
                        trip_id: Some(format!("trip-{t}")),
                        start_time: None,
                        start_date: None,
                        schedule_relationship: None,
                        route_id: Some("6".to_string()),
                        direction_id: Some(1),
                    },
                    stop_time_update: (0..stops_per_trip)
                        .map(|s| StopTimeUpdate {
                            stop_sequence: Some(s as u32),
                            arrival: Some(StopTimeEvent {
                                delay: Some(0),
                                time: Some(header_ts as i64 + (s as i64 + 1) * 90),
                                uncertainty: None,
                            }),
                            departure: None,
                            stop_id: Some(format!("63{s}N")),
                            schedule_relationship: None,
                        })
                        .collect(),
                    vehicle: None,
                    timestamp: None,
                    delay: None,
                }),
                vehicle: None,
                alert: None,
            })
            .collect();
        let message = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: Some(0),
                timestamp: Some(header_ts),
            },
            entity: entities,
        };
        let mut buf = Vec::new();
        message.encode(&mut buf).unwrap();
        buf
    }

    fn test_config(feeds: Vec<FeedDescriptor>) -> Arc<Config> {
        let mut config = Config::default();
        config.ingest.feeds = feeds;
        Arc::new(config)
    }

    fn scheduler_with(
        transport: Arc<dyn FeedTransport>,
        config: Arc<Config>,
        store: SharedStore,
    ) -> Arc<Scheduler> {
        let metrics = Arc::new(MonitorMetrics::new());
        let bus = EventBus::new(config.ws.max_connections);
        let detector = Arc::new(Detector::new(
            config.detect,
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&metrics),
        ));
        Scheduler::new(
            config.clone(),
            store,
            Arc::new(FeedFetcher::new(transport, config.ingest.max_retries)),
            FeatureEngine::new(FeatureConfig {
                headway_window_minutes: 30,
                rolling_window_hours: 1,
            }),
            detector,
            bus,
            metrics,
        )
    }

    #[tokio::test]
    async fn nominal_ingest_produces_frames_and_one_ok_run() {
        let feed = FeedDescriptor {
            feed_id: "six".to_string(),
            url: "http://feeds.example/six".to_string(),
        };
        let mut payloads = HashMap::new();
        payloads.insert(feed.url.clone(), payload(3, 4, 1_700_000_000));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let scheduler = scheduler_with(
            Arc::new(StaticTransport { payloads }),
            test_config(vec![feed]),
            Arc::clone(&store),
        );

        let frames = scheduler.ingest_once().await;
        assert_eq!(frames.len(), 12);

        let runs = store.recent_feed_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, FeedRunStatus::Ok);
        assert_eq!(runs[0].entities_seen, 3);

        let rows = store
            .query_positions(&PositionQuery::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 12);
    }

    #[tokio::test]
    async fn replayed_payload_adds_no_rows() {
        let feed = FeedDescriptor {
            feed_id: "six".to_string(),
            url: "http://feeds.example/six".to_string(),
        };
        let mut payloads = HashMap::new();
        payloads.insert(feed.url.clone(), payload(3, 4, 1_700_000_000));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let scheduler = scheduler_with(
            Arc::new(StaticTransport { payloads }),
            test_config(vec![feed]),
            Arc::clone(&store),
        );

        let first = scheduler.ingest_once().await;
        assert_eq!(first.len(), 12);
        let second = scheduler.ingest_once().await;
        assert!(second.is_empty());

        let rows = store
            .query_positions(&PositionQuery::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 12);
        // Both attempts recorded.
        assert_eq!(store.recent_feed_runs(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_and_isolated() {
        let good = FeedDescriptor {
            feed_id: "six".to_string(),
            url: "http://feeds.example/six".to_string(),
        };
        let bad = FeedDescriptor {
            feed_id: "ace".to_string(),
            url: "http://feeds.example/ace".to_string(),
        };
        let mut payloads = HashMap::new();
        payloads.insert(good.url.clone(), payload(2, 2, 1_700_000_000));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.ingest.feeds = vec![good, bad];
        config.ingest.max_retries = 0;
        let scheduler = scheduler_with(
            Arc::new(StaticTransport { payloads }),
            Arc::new(config),
            Arc::clone(&store),
        );

        let frames = scheduler.ingest_once().await;
        assert_eq!(frames.len(), 4);

        let runs = store.recent_feed_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        let by_feed: HashMap<&str, FeedRunStatus> = runs
            .iter()
            .map(|r| (r.feed_id.as_str(), r.status))
            .collect();
        assert_eq!(by_feed["six"], FeedRunStatus::Ok);
        assert_eq!(by_feed["ace"], FeedRunStatus::TransportError);
    }

    #[tokio::test]
    async fn purge_enforces_retention() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.store.retention_hours = 1;
        config.ingest.feeds = Vec::new();
        let scheduler = scheduler_with(
            Arc::new(StaticTransport {
                payloads: HashMap::new(),
            }),
            Arc::new(config),
            Arc::clone(&store),
        );

        let now = Utc::now();
        let mut rows = Vec::new();
        for minutes in 0..90 {
            rows.push(TrainPosition {
                trip_id: format!("t{minutes}"),
                route_id: "6".to_string(),
                line: "6".to_string(),
                direction: 1,
                stop_id: "635N".to_string(),
                observed_at: now - chrono::Duration::minutes(minutes),
                current_stop_id: None,
                next_stop_id: None,
                arrival_time: None,
                departure_time: None,
                current_status: crate::feed::TrainStatus::InTransit,
                delay_seconds: None,
                lat: None,
                lon: None,
                headway_s: None,
                dwell_s: None,
                schedule_adherence: None,
            });
        }
        store.insert_positions(&rows).await.unwrap();

        scheduler.purge_once().await;
        let remaining = store
            .query_positions(&PositionQuery::default())
            .await
            .unwrap();
        assert!(!remaining.is_empty());
        assert!(remaining
            .iter()
            .all(|p| p.observed_at >= now - chrono::Duration::hours(1)));
    }

    #[tokio::test]
    async fn batch_limit_halves_under_pressure_and_recovers() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let scheduler = scheduler_with(
            Arc::new(StaticTransport {
                payloads: HashMap::new(),
            }),
            test_config(Vec::new()),
            Arc::clone(&store),
        );

        // Inject slow writes past the high watermark.
        for _ in 0..20 {
            scheduler
                .metrics
                .record_write_latency(std::time::Duration::from_millis(900));
        }
        let limit = scheduler.adjust_batch_limit();
        assert!(limit < DEFAULT_BATCH_LIMIT);
        let lower = scheduler.adjust_batch_limit();
        assert!(lower <= limit);
    }
}
