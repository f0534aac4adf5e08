//! In-memory store backend.
//!
//! The default backend for tests and local development. Positions are
//! kept in a `BTreeMap` keyed by `(observed_at, trip_id, stop_id)` so
//! range queries and retention purges are ordered scans, mirroring the
//! time-partitioned layout of the persistent backend.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::catalog::{Route, Station};

use super::error::{StoreError, StoreResult};
use super::records::{
    Anomaly, AnomalyPage, AnomalyQuery, FeedRun, ModelArtifact, PositionQuery, TrainPosition,
};
use super::{AnomalyStore, ArtifactStore, CatalogStore, PositionStore};

type PositionKey = (i64, String, String);

#[derive(Default)]
pub struct MemoryStore {
    positions: RwLock<BTreeMap<PositionKey, TrainPosition>>,
    feed_runs: RwLock<Vec<FeedRun>>,
    next_run_id: AtomicI64,
    anomalies: RwLock<HashMap<Uuid, Anomaly>>,
    artifacts: RwLock<HashMap<String, Vec<ModelArtifact>>>,
    stations: RwLock<HashMap<String, Station>>,
    routes: RwLock<HashMap<String, Route>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_run_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn key(position: &TrainPosition) -> PositionKey {
        (
            position.observed_at.timestamp(),
            position.trip_id.clone(),
            position.stop_id.clone(),
        )
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert_positions(&self, batch: &[TrainPosition]) -> StoreResult<usize> {
        let mut positions = self.positions.write();
        let mut inserted = 0;
        for position in batch {
            let key = Self::key(position);
            if let std::collections::btree_map::Entry::Vacant(entry) = positions.entry(key) {
                entry.insert(position.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn query_positions(&self, query: &PositionQuery) -> StoreResult<Vec<TrainPosition>> {
        let positions = self.positions.read();
        let lower = query
            .since
            .map(|t| Bound::Included((t.timestamp(), String::new(), String::new())))
            .unwrap_or(Bound::Unbounded);
        let mut out = Vec::new();
        for (_, position) in positions.range((lower, Bound::Unbounded)) {
            if let Some(until) = query.until {
                if position.observed_at > until {
                    break;
                }
            }
            if let Some(line) = &query.line {
                if &position.line != line {
                    continue;
                }
            }
            if let Some(station) = &query.station_id {
                if &position.stop_id != station {
                    continue;
                }
            }
            out.push(position.clone());
            if let Some(limit) = query.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn latest_positions_for_line(&self, line: &str) -> StoreResult<Vec<TrainPosition>> {
        let positions = self.positions.read();
        let mut latest: HashMap<&str, &TrainPosition> = HashMap::new();
        for position in positions.values() {
            if position.line != line {
                continue;
            }
            match latest.get(position.trip_id.as_str()) {
                Some(existing) if existing.observed_at >= position.observed_at => {}
                _ => {
                    latest.insert(position.trip_id.as_str(), position);
                }
            }
        }
        let mut out: Vec<TrainPosition> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.trip_id.cmp(&b.trip_id));
        Ok(out)
    }

    async fn insert_feed_run(&self, mut run: FeedRun) -> StoreResult<i64> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        run.run_id = run_id;
        self.feed_runs.write().push(run);
        Ok(run_id)
    }

    async fn recent_feed_runs(&self, limit: usize) -> StoreResult<Vec<FeedRun>> {
        let runs = self.feed_runs.read();
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }

    async fn latest_feed_run_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.feed_runs.read().iter().map(|r| r.finished_at).max())
    }

    async fn purge_positions_before(&self, ts: DateTime<Utc>) -> StoreResult<u64> {
        let cutoff = (ts.timestamp(), String::new(), String::new());
        let mut positions = self.positions.write();
        let keep = positions.split_off(&cutoff);
        let purged = positions.len() as u64;
        *positions = keep;
        drop(positions);

        let mut runs = self.feed_runs.write();
        let before = runs.len();
        runs.retain(|r| r.started_at >= ts);
        Ok(purged + (before - runs.len()) as u64)
    }
}

#[async_trait]
impl AnomalyStore for MemoryStore {
    async fn insert_anomaly(&self, anomaly: &Anomaly) -> StoreResult<()> {
        let mut anomalies = self.anomalies.write();
        if anomalies.contains_key(&anomaly.anomaly_id) {
            return Err(StoreError::conflict(format!(
                "anomaly {} already exists",
                anomaly.anomaly_id
            )));
        }
        anomalies.insert(anomaly.anomaly_id, anomaly.clone());
        Ok(())
    }

    async fn raise_severity(&self, anomaly_id: Uuid, severity: f64) -> StoreResult<()> {
        let mut anomalies = self.anomalies.write();
        let anomaly = anomalies
            .get_mut(&anomaly_id)
            .ok_or_else(|| StoreError::not_found(format!("anomaly {anomaly_id}")))?;
        anomaly.severity = anomaly.severity.max(severity);
        Ok(())
    }

    async fn query_anomalies(&self, query: &AnomalyQuery) -> StoreResult<AnomalyPage> {
        let anomalies = self.anomalies.read();
        let mut matched: Vec<Anomaly> = anomalies
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

        let total = matched.len();
        let page = query.page.max(1);
        let start = (page - 1).saturating_mul(query.page_size);
        let anomalies = if start >= total || query.page_size == 0 {
            Vec::new()
        } else {
            matched
                .into_iter()
                .skip(start)
                .take(query.page_size)
                .collect()
        };
        Ok(AnomalyPage {
            anomalies,
            total,
            page,
            page_size: query.page_size,
        })
    }

    async fn get_anomaly(&self, anomaly_id: Uuid) -> StoreResult<Option<Anomaly>> {
        Ok(self.anomalies.read().get(&anomaly_id).cloned())
    }

    async fn resolve_anomaly(&self, anomaly_id: Uuid) -> StoreResult<Option<Anomaly>> {
        let mut anomalies = self.anomalies.write();
        Ok(anomalies.get_mut(&anomaly_id).map(|anomaly| {
            anomaly.resolved = true;
            anomaly.resolved_at = Some(Utc::now());
            anomaly.clone()
        }))
    }

    async fn purge_anomalies_before(&self, ts: DateTime<Utc>) -> StoreResult<u64> {
        let mut anomalies = self.anomalies.write();
        let before = anomalies.len();
        anomalies.retain(|_, a| a.detected_at >= ts);
        Ok((before - anomalies.len()) as u64)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put_model_artifact(
        &self,
        name: &str,
        payload: Vec<u8>,
        hyperparams: std::collections::BTreeMap<String, f64>,
        training_window_hours: u32,
    ) -> StoreResult<ModelArtifact> {
        let mut artifacts = self.artifacts.write();
        let versions = artifacts.entry(name.to_string()).or_default();
        let version = versions.last().map(|a| a.version + 1).unwrap_or(1);
        let artifact = ModelArtifact {
            name: name.to_string(),
            version,
            trained_at: Utc::now(),
            payload,
            hyperparams,
            training_window_hours,
        };
        versions.push(artifact.clone());
        Ok(artifact)
    }

    async fn get_latest_artifact(&self, name: &str) -> StoreResult<Option<ModelArtifact>> {
        Ok(self
            .artifacts
            .read()
            .get(name)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn get_artifact(&self, name: &str, version: i64) -> StoreResult<Option<ModelArtifact>> {
        Ok(self
            .artifacts
            .read()
            .get(name)
            .and_then(|versions| versions.iter().find(|a| a.version == version).cloned()))
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert_stations(&self, incoming: &[Station]) -> StoreResult<usize> {
        let mut stations = self.stations.write();
        let mut inserted = 0;
        for station in incoming {
            stations.entry(station.stop_id.clone()).or_insert_with(|| {
                inserted += 1;
                station.clone()
            });
        }
        Ok(inserted)
    }

    async fn upsert_routes(&self, incoming: &[Route]) -> StoreResult<usize> {
        let mut routes = self.routes.write();
        let mut inserted = 0;
        for route in incoming {
            routes.entry(route.route_id.clone()).or_insert_with(|| {
                inserted += 1;
                route.clone()
            });
        }
        Ok(inserted)
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(true)
    }
}
