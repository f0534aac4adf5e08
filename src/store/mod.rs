//! State store: append-only, time-partitioned persistence.
//!
//! The store is defined by concern-split async traits so backends can be
//! swapped: [`memory::MemoryStore`] is the in-process default used by
//! tests and local development, [`sqlite::SqliteStore`] persists to
//! SQLite. The store exclusively owns the persisted records of
//! [`FeedRun`], position history, [`Anomaly`] and [`ModelArtifact`];
//! retention is enforced by the scheduler calling the purge operations.

pub mod error;
pub mod memory;
pub mod records;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::catalog::{Route, Station};

pub use error::{ErrorContext, StoreError, StoreResult};
pub use memory::MemoryStore;
pub use records::{
    Anomaly, AnomalyKind, AnomalyPage, AnomalyQuery, FeedRun, FeedRunStatus, ModelArtifact,
    PositionQuery, TrainPosition,
};
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStore;

/// Time-partitioned positions and feed-run history.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Bulk insert; duplicates on `(trip_id, stop_id, observed_at)` are
    /// silently ignored. Returns the number of rows actually inserted.
    async fn insert_positions(&self, batch: &[TrainPosition]) -> StoreResult<usize>;

    /// Ordered (ascending `observed_at`) position range query.
    async fn query_positions(&self, query: &PositionQuery) -> StoreResult<Vec<TrainPosition>>;

    /// Most recent position per trip on the given line.
    async fn latest_positions_for_line(&self, line: &str) -> StoreResult<Vec<TrainPosition>>;

    /// Append one run record; the store assigns and returns the monotonic
    /// run id.
    async fn insert_feed_run(&self, run: FeedRun) -> StoreResult<i64>;

    /// Most recent runs, newest first, across all feeds.
    async fn recent_feed_runs(&self, limit: usize) -> StoreResult<Vec<FeedRun>>;

    /// Finish time of the most recent run of any feed, for readiness.
    async fn latest_feed_run_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// Drop positions and feed runs older than `ts`. Returns rows purged.
    async fn purge_positions_before(&self, ts: DateTime<Utc>) -> StoreResult<u64>;
}

/// Persisted anomaly records.
#[async_trait]
pub trait AnomalyStore: Send + Sync {
    /// Insert one anomaly; unique on `anomaly_id`.
    async fn insert_anomaly(&self, anomaly: &Anomaly) -> StoreResult<()>;

    /// Raise an existing anomaly's severity in place (duplicate
    /// suppression). Missing ids are a `NotFound` error.
    async fn raise_severity(&self, anomaly_id: Uuid, severity: f64) -> StoreResult<()>;

    /// Paged filtered query, newest first.
    async fn query_anomalies(&self, query: &AnomalyQuery) -> StoreResult<AnomalyPage>;

    async fn get_anomaly(&self, anomaly_id: Uuid) -> StoreResult<Option<Anomaly>>;

    /// Mark resolved; returns the updated record if it exists.
    async fn resolve_anomaly(&self, anomaly_id: Uuid) -> StoreResult<Option<Anomaly>>;

    async fn purge_anomalies_before(&self, ts: DateTime<Utc>) -> StoreResult<u64>;
}

/// Versioned model artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a new artifact under `name`, assigning the next version.
    async fn put_model_artifact(
        &self,
        name: &str,
        payload: Vec<u8>,
        hyperparams: BTreeMap<String, f64>,
        training_window_hours: u32,
    ) -> StoreResult<ModelArtifact>;

    async fn get_latest_artifact(&self, name: &str) -> StoreResult<Option<ModelArtifact>>;

    async fn get_artifact(&self, name: &str, version: i64) -> StoreResult<Option<ModelArtifact>>;
}

/// The relational catalog mirror (stations and routes).
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Idempotent upsert: existing rows win, new rows are inserted.
    /// Returns the number of rows inserted.
    async fn upsert_stations(&self, stations: &[Station]) -> StoreResult<usize>;

    /// Same conflict policy as [`CatalogStore::upsert_stations`].
    async fn upsert_routes(&self, routes: &[Route]) -> StoreResult<usize>;

    /// Cheap reachability probe for readiness.
    async fn health_check(&self) -> StoreResult<bool>;
}

/// The full store contract the application is wired against.
pub trait FullStore: PositionStore + AnomalyStore + ArtifactStore + CatalogStore {}

impl<T: PositionStore + AnomalyStore + ArtifactStore + CatalogStore> FullStore for T {}

/// Shared handle threaded through the components.
pub type SharedStore = Arc<dyn FullStore>;
