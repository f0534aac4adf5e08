//! Sliding-window feature computation.
//!
//! The engine maintains per-`(line, stop, direction)` shards of recent
//! observations in two horizons (the headway window and the rolling
//! statistics window) and emits one [`FeatureFrame`] per trip update. The
//! math here is pure and synchronous; all I/O stays with the caller.
//!
//! Windows are ephemeral: a restart rebuilds them by replaying stored
//! positions newer than [`FeatureEngine::window_horizon`].

pub mod welford;

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::line_for_route;
use crate::config::FeatureConfig;
use crate::feed::{TrainStatus, TripEvent, VehicleEvent};
use crate::store::TrainPosition;

use welford::RollingStats;

/// Hard cap on entries per shard window; oldest evicted first.
const WINDOW_CAP: usize = 512;

/// Seconds of delay that saturate schedule adherence at ±1.
const ADHERENCE_SCALE_S: f64 = 600.0;

/// The feature vector computed for one trip/stop observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub trip_id: String,
    pub route_id: String,
    pub line: String,
    pub direction: u8,
    pub stop_id: String,
    pub observed_at: DateTime<Utc>,
    /// Elapsed seconds since the previous train served this stop in the
    /// same direction; absent outside the headway window.
    pub headway_s: Option<f64>,
    pub dwell_s: Option<f64>,
    /// Zero when the feed reports nothing and no schedule is known.
    pub delay_s: f64,
    /// clamp(delay / 600) into [-1, 1].
    pub schedule_adherence: f64,
    /// Baseline statistics over the rolling window, before this frame.
    pub rolling_headway_mean: f64,
    pub rolling_headway_stdev: f64,
    pub headway_z: Option<f64>,
    pub dwell_z: Option<f64>,
    pub hour: u32,
    /// Monday = 0.
    pub day_of_week: u32,
    pub is_rush_hour: bool,
}

/// Per-line aggregates of one ingest tick, one step of the sequence
/// model's input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineTick {
    pub headway_mean: f64,
    pub delay_mean: f64,
    pub dwell_mean: f64,
    pub frames: usize,
}

/// Average the tick's frames per line for the sequence model.
pub fn aggregate_by_line(frames: &[FeatureFrame]) -> BTreeMap<String, LineTick> {
    let mut sums: BTreeMap<String, (f64, f64, f64, usize, usize, usize)> = BTreeMap::new();
    for frame in frames {
        let entry = sums.entry(frame.line.clone()).or_default();
        if let Some(h) = frame.headway_s {
            entry.0 += h;
            entry.3 += 1;
        }
        entry.1 += frame.delay_s;
        if let Some(d) = frame.dwell_s {
            entry.2 += d;
            entry.4 += 1;
        }
        entry.5 += 1;
    }
    sums.into_iter()
        .map(|(line, (h, d, w, hn, wn, n))| {
            (
                line,
                LineTick {
                    headway_mean: if hn > 0 { h / hn as f64 } else { 0.0 },
                    delay_mean: if n > 0 { d / n as f64 } else { 0.0 },
                    dwell_mean: if wn > 0 { w / wn as f64 } else { 0.0 },
                    frames: n,
                },
            )
        })
        .collect()
}

/// A bounded sliding window of timestamped values with running stats.
#[derive(Debug, Default)]
struct ValueWindow {
    values: VecDeque<(DateTime<Utc>, f64)>,
    stats: RollingStats,
}

impl ValueWindow {
    fn evict(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(t, v)) = self.values.front() {
            if t < cutoff || self.values.len() > WINDOW_CAP {
                self.values.pop_front();
                self.stats.remove(v);
            } else {
                break;
            }
        }
    }

    fn push(&mut self, at: DateTime<Utc>, value: f64, window: Duration) {
        self.evict(at - window);
        self.values.push_back((at, value));
        self.stats.push(value);
        if self.values.len() > WINDOW_CAP {
            if let Some((_, v)) = self.values.pop_front() {
                self.stats.remove(v);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    /// Recent service times at this (stop, direction), ascending.
    arrivals: VecDeque<DateTime<Utc>>,
    headways: ValueWindow,
    dwells: ValueWindow,
}

impl Shard {
    /// Latest prior arrival strictly before `at`.
    fn previous_arrival(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.arrivals.iter().rev().find(|&&t| t < at).copied()
    }

    fn record_arrival(&mut self, at: DateTime<Utc>, window: Duration) {
        while self
            .arrivals
            .front()
            .map(|&t| t < at - window)
            .unwrap_or(false)
        {
            self.arrivals.pop_front();
        }
        // Keep ascending order under slightly out-of-order trips.
        let pos = self.arrivals.partition_point(|&t| t <= at);
        self.arrivals.insert(pos, at);
        if self.arrivals.len() > WINDOW_CAP {
            self.arrivals.pop_front();
        }
    }
}

type ShardKey = (String, String, u8);

/// Sliding-window feature engine; single writer, no interior I/O.
pub struct FeatureEngine {
    cfg: FeatureConfig,
    shards: HashMap<ShardKey, Shard>,
    /// Last emitted `observed_at` per (trip, stop); enforces idempotence
    /// and per-key monotonicity.
    last_emitted: HashMap<(String, String), DateTime<Utc>>,
    /// Vehicle status per trip: (status, since, stop at that status).
    vehicle_state: HashMap<String, (TrainStatus, DateTime<Utc>, Option<String>)>,
    /// Dwell observed from a vehicle status transition, consumed by the
    /// trip's next frame at the same stop.
    pending_dwell: HashMap<String, (String, f64)>,
}

impl FeatureEngine {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self {
            cfg,
            shards: HashMap::new(),
            last_emitted: HashMap::new(),
            vehicle_state: HashMap::new(),
            pending_dwell: HashMap::new(),
        }
    }

    fn headway_window(&self) -> Duration {
        Duration::minutes(self.cfg.headway_window_minutes as i64)
    }

    fn rolling_window(&self) -> Duration {
        Duration::hours(self.cfg.rolling_window_hours as i64)
    }

    /// The widest window; restarts replay stored positions newer than this.
    pub fn window_horizon(&self) -> Duration {
        self.headway_window().max(self.rolling_window())
    }

    /// Compute the feature frame for one trip event. Returns `None` for
    /// replayed or out-of-order observations, which keeps the pipeline
    /// idempotent under at-least-once ingest.
    pub fn process_trip(&mut self, event: &TripEvent) -> Option<FeatureFrame> {
        let service_time = event.arrival_time.or(event.departure_time)?;

        let key = (event.trip_id.clone(), event.stop_id.clone());
        if let Some(&last) = self.last_emitted.get(&key) {
            if event.observed_at <= last {
                return None;
            }
        }
        self.last_emitted.insert(key, event.observed_at);
        self.prune_emitted(event.observed_at);

        let line = line_for_route(&event.route_id);
        let shard_key = (line.clone(), event.stop_id.clone(), event.direction);
        let headway_window = self.headway_window();
        let rolling_window = self.rolling_window();
        let shard = self.shards.entry(shard_key).or_default();

        let headway_s = shard
            .previous_arrival(service_time)
            .map(|prev| (service_time - prev).num_seconds() as f64)
            .filter(|&h| h > 0.0 && h <= headway_window.num_seconds() as f64);
        shard.record_arrival(service_time, headway_window);

        let dwell_s = match (event.arrival_time, event.departure_time) {
            (Some(arrival), Some(departure)) if departure >= arrival => {
                Some((departure - arrival).num_seconds() as f64)
            }
            _ => self
                .pending_dwell
                .remove(&event.trip_id)
                .filter(|(stop, _)| *stop == event.stop_id)
                .map(|(_, dwell)| dwell),
        };

        let delay_s = event
            .delay_seconds
            .map(f64::from)
            .or_else(|| {
                match (event.arrival_time, event.scheduled_arrival) {
                    (Some(observed), Some(scheduled)) => {
                        Some((observed - scheduled).num_seconds() as f64)
                    }
                    _ => None,
                }
            })
            .unwrap_or(0.0);
        let schedule_adherence = (delay_s / ADHERENCE_SCALE_S).clamp(-1.0, 1.0);

        // Baseline first: the z-score measures deviation from the window
        // before this observation joins it.
        shard.headways.evict(service_time - rolling_window);
        let rolling_headway_mean = shard.headways.stats.mean();
        let rolling_headway_stdev = shard.headways.stats.stdev();
        let headway_z = headway_s.and_then(|h| shard.headways.stats.zscore(h));
        if let Some(h) = headway_s {
            shard.headways.push(service_time, h, rolling_window);
        }

        shard.dwells.evict(service_time - rolling_window);
        let dwell_z = dwell_s.and_then(|d| shard.dwells.stats.zscore(d));
        if let Some(d) = dwell_s {
            shard.dwells.push(service_time, d, rolling_window);
        }

        let local = event.observed_at;
        Some(FeatureFrame {
            trip_id: event.trip_id.clone(),
            route_id: event.route_id.clone(),
            line,
            direction: event.direction,
            stop_id: event.stop_id.clone(),
            observed_at: event.observed_at,
            headway_s,
            dwell_s,
            delay_s,
            schedule_adherence,
            rolling_headway_mean,
            rolling_headway_stdev,
            headway_z,
            dwell_z,
            hour: local.hour(),
            day_of_week: local.weekday().num_days_from_monday(),
            is_rush_hour: is_rush_hour(local),
        })
    }

    /// Track vehicle status transitions; an `at_stop -> in_transit`
    /// transition yields the dwell for the trip's next frame at that stop.
    pub fn process_vehicle(&mut self, event: &VehicleEvent) {
        let previous = self.vehicle_state.get(&event.trip_id).cloned();
        if let Some((_, since, _)) = &previous {
            if event.observed_at < *since {
                return;
            }
        }
        if let Some((TrainStatus::AtStop, since, Some(stop))) = previous {
            if event.current_status == TrainStatus::InTransit {
                let dwell = (event.observed_at - since).num_seconds();
                if dwell > 0 {
                    self.pending_dwell
                        .insert(event.trip_id.clone(), (stop, dwell as f64));
                }
            }
        }
        // Status unchanged keeps the original transition time.
        let unchanged = matches!(
            self.vehicle_state.get(&event.trip_id),
            Some((status, _, _)) if *status == event.current_status
        );
        if !unchanged {
            self.vehicle_state.insert(
                event.trip_id.clone(),
                (
                    event.current_status,
                    event.observed_at,
                    event.current_stop_id.clone(),
                ),
            );
        }
    }

    /// Rebuild windows from stored positions without emitting frames.
    /// Rows must be in ascending `observed_at` order.
    pub fn warm_start(&mut self, rows: &[TrainPosition]) {
        let headway_window = self.headway_window();
        let rolling_window = self.rolling_window();
        for row in rows {
            self.last_emitted
                .insert((row.trip_id.clone(), row.stop_id.clone()), row.observed_at);
            let shard_key = (row.line.clone(), row.stop_id.clone(), row.direction);
            let shard = self.shards.entry(shard_key).or_default();
            let service_time = row.arrival_time.unwrap_or(row.observed_at);
            shard.record_arrival(service_time, headway_window);
            if let Some(h) = row.headway_s {
                shard.headways.push(service_time, h, rolling_window);
            }
            if let Some(d) = row.dwell_s {
                shard.dwells.push(service_time, d, rolling_window);
            }
        }
    }

    /// Bound the idempotence map: entries older than the widest window
    /// can never shadow a live observation again.
    fn prune_emitted(&mut self, now: DateTime<Utc>) {
        if self.last_emitted.len() < 4 * WINDOW_CAP * self.shards.len().max(1) {
            return;
        }
        let horizon = now - self.window_horizon();
        self.last_emitted.retain(|_, &mut t| t >= horizon);
    }
}

/// Weekday 07:00–10:59 and 17:00–20:59 UTC-local hours.
fn is_rush_hour(at: DateTime<Utc>) -> bool {
    let hour = at.hour();
    let weekday = at.weekday().num_days_from_monday() < 5;
    weekday && ((7..=10).contains(&hour) || (17..=20).contains(&hour))
}
