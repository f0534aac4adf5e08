//! SQLite store backend.
//!
//! Uses the sqlx runtime API against an embedded SQLite database. The
//! schema is created idempotently on startup; timestamps are stored as
//! unix seconds and the feature/hyperparameter maps as JSON text.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::catalog::{Route, Station};
use crate::feed::TrainStatus;

use super::error::{ErrorContext, StoreError, StoreResult};
use super::records::{
    Anomaly, AnomalyKind, AnomalyPage, AnomalyQuery, FeedRun, FeedRunStatus, ModelArtifact,
    PositionQuery, TrainPosition,
};
use super::{AnomalyStore, ArtifactStore, CatalogStore, PositionStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database and ensure the schema exists.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        // An in-memory database exists per connection; a larger pool
        // would hand out empty databases, and a reaped idle connection
        // would drop the data. Pin one connection forever in that mode.
        let memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if memory { 1 } else { 5 })
            .min_connections(if memory { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::connection(format!("{database_url}: {e}")))?;

        let store = Self { pool };
        store.create_schema().await?;
        info!(url = %database_url, "sqlite store ready");
        Ok(store)
    }

    /// Idempotent schema creation; safe on every startup.
    async fn create_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS train_positions (
                trip_id            TEXT    NOT NULL,
                route_id           TEXT    NOT NULL,
                line               TEXT    NOT NULL,
                direction          INTEGER NOT NULL,
                stop_id            TEXT    NOT NULL,
                observed_at        INTEGER NOT NULL,
                current_stop_id    TEXT,
                next_stop_id       TEXT,
                arrival_time       INTEGER,
                departure_time     INTEGER,
                current_status     TEXT    NOT NULL,
                delay_seconds      INTEGER,
                lat                REAL,
                lon                REAL,
                headway_s          REAL,
                dwell_s            REAL,
                schedule_adherence REAL,
                PRIMARY KEY (trip_id, stop_id, observed_at)
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_positions_line_time
                ON train_positions (line, observed_at);",
            "CREATE INDEX IF NOT EXISTS idx_positions_station_time
                ON train_positions (stop_id, observed_at);",
            r#"
            CREATE TABLE IF NOT EXISTS feed_runs (
                run_id        INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id       TEXT    NOT NULL,
                started_at    INTEGER NOT NULL,
                finished_at   INTEGER NOT NULL,
                entities_seen INTEGER NOT NULL,
                alerts_seen   INTEGER NOT NULL,
                status        TEXT    NOT NULL,
                duration_ms   INTEGER NOT NULL,
                skipped       INTEGER NOT NULL DEFAULT 0
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_feed_runs_feed_time
                ON feed_runs (feed_id, started_at);",
            r#"
            CREATE TABLE IF NOT EXISTS anomalies (
                anomaly_id    TEXT PRIMARY KEY,
                detected_at   INTEGER NOT NULL,
                station_id    TEXT,
                route_id      TEXT,
                line          TEXT,
                kind          TEXT    NOT NULL,
                severity      REAL    NOT NULL,
                model_name    TEXT    NOT NULL,
                model_version INTEGER NOT NULL,
                features      TEXT    NOT NULL,
                resolved      INTEGER NOT NULL DEFAULT 0,
                resolved_at   INTEGER
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_anomalies_detected
                ON anomalies (detected_at);",
            "CREATE INDEX IF NOT EXISTS idx_anomalies_station_time
                ON anomalies (station_id, detected_at);",
            r#"
            CREATE TABLE IF NOT EXISTS stations (
                stop_id       TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                lat           REAL NOT NULL,
                lon           REAL NOT NULL,
                parent_id     TEXT,
                routes_served TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                route_id     TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                color        TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS model_artifacts (
                name                  TEXT    NOT NULL,
                version               INTEGER NOT NULL,
                trained_at            INTEGER NOT NULL,
                payload               BLOB    NOT NULL,
                hyperparams           TEXT    NOT NULL,
                training_window_hours INTEGER NOT NULL,
                PRIMARY KEY (name, version)
            );
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx(e, "create_schema"))?;
        }
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error, operation: &str) -> StoreError {
    let context = ErrorContext::new(operation);
    match &err {
        sqlx::Error::PoolTimedOut => StoreError::Timeout {
            message: err.to_string(),
            context: context.retryable(),
        },
        sqlx::Error::Io(_) => StoreError::Connection {
            message: err.to_string(),
            context: context.retryable(),
        },
        sqlx::Error::Database(db) if db.message().contains("UNIQUE") => StoreError::Conflict {
            message: err.to_string(),
            context,
        },
        _ => StoreError::Query {
            message: err.to_string(),
            context,
        },
    }
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn dt(unix: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(unix, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn opt_dt(unix: Option<i64>) -> Option<DateTime<Utc>> {
    unix.map(dt)
}

fn row_to_position(row: &SqliteRow) -> TrainPosition {
    TrainPosition {
        trip_id: row.get("trip_id"),
        route_id: row.get("route_id"),
        line: row.get("line"),
        direction: row.get::<i64, _>("direction") as u8,
        stop_id: row.get("stop_id"),
        observed_at: dt(row.get("observed_at")),
        current_stop_id: row.get("current_stop_id"),
        next_stop_id: row.get("next_stop_id"),
        arrival_time: opt_dt(row.get("arrival_time")),
        departure_time: opt_dt(row.get("departure_time")),
        current_status: TrainStatus::parse(row.get::<String, _>("current_status").as_str())
            .unwrap_or(TrainStatus::InTransit),
        delay_seconds: row.get::<Option<i64>, _>("delay_seconds").map(|v| v as i32),
        lat: row.get("lat"),
        lon: row.get("lon"),
        headway_s: row.get("headway_s"),
        dwell_s: row.get("dwell_s"),
        schedule_adherence: row.get("schedule_adherence"),
    }
}

fn row_to_feed_run(row: &SqliteRow) -> FeedRun {
    FeedRun {
        run_id: row.get("run_id"),
        feed_id: row.get("feed_id"),
        started_at: dt(row.get("started_at")),
        finished_at: dt(row.get("finished_at")),
        entities_seen: row.get::<i64, _>("entities_seen") as u32,
        alerts_seen: row.get::<i64, _>("alerts_seen") as u32,
        status: FeedRunStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(FeedRunStatus::DecodeError),
        duration_ms: row.get("duration_ms"),
        skipped: row.get::<i64, _>("skipped") as u32,
    }
}

fn row_to_anomaly(row: &SqliteRow) -> StoreResult<Anomaly> {
    let anomaly_id: String = row.get("anomaly_id");
    let anomaly_id = Uuid::parse_str(&anomaly_id)
        .map_err(|e| StoreError::internal(format!("bad anomaly id {anomaly_id}: {e}")))?;
    let kind: String = row.get("kind");
    let features: String = row.get("features");
    Ok(Anomaly {
        anomaly_id,
        detected_at: dt(row.get("detected_at")),
        station_id: row.get("station_id"),
        route_id: row.get("route_id"),
        line: row.get("line"),
        kind: AnomalyKind::parse(&kind)
            .ok_or_else(|| StoreError::internal(format!("bad anomaly kind {kind}")))?,
        severity: row.get("severity"),
        model_name: row.get("model_name"),
        model_version: row.get("model_version"),
        features: serde_json::from_str(&features).unwrap_or_default(),
        resolved: row.get::<i64, _>("resolved") != 0,
        resolved_at: opt_dt(row.get("resolved_at")),
    })
}

fn row_to_artifact(row: &SqliteRow) -> ModelArtifact {
    let hyperparams: String = row.get("hyperparams");
    ModelArtifact {
        name: row.get("name"),
        version: row.get("version"),
        trained_at: dt(row.get("trained_at")),
        payload: row.get("payload"),
        hyperparams: serde_json::from_str(&hyperparams).unwrap_or_default(),
        training_window_hours: row.get::<i64, _>("training_window_hours") as u32,
    }
}

#[async_trait]
impl PositionStore for SqliteStore {
    async fn insert_positions(&self, batch: &[TrainPosition]) -> StoreResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx(e, "insert_positions"))?;
        let mut inserted = 0usize;
        for p in batch {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO train_positions (
                    trip_id, route_id, line, direction, stop_id, observed_at,
                    current_stop_id, next_stop_id, arrival_time, departure_time,
                    current_status, delay_seconds, lat, lon,
                    headway_s, dwell_s, schedule_adherence
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.trip_id)
            .bind(&p.route_id)
            .bind(&p.line)
            .bind(p.direction as i64)
            .bind(&p.stop_id)
            .bind(ts(p.observed_at))
            .bind(&p.current_stop_id)
            .bind(&p.next_stop_id)
            .bind(p.arrival_time.map(ts))
            .bind(p.departure_time.map(ts))
            .bind(p.current_status.as_str())
            .bind(p.delay_seconds.map(|v| v as i64))
            .bind(p.lat)
            .bind(p.lon)
            .bind(p.headway_s)
            .bind(p.dwell_s)
            .bind(p.schedule_adherence)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(e, "insert_positions"))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx(e, "insert_positions"))?;
        Ok(inserted)
    }

    async fn query_positions(&self, query: &PositionQuery) -> StoreResult<Vec<TrainPosition>> {
        let mut sql = String::from("SELECT * FROM train_positions WHERE 1=1");
        if query.line.is_some() {
            sql.push_str(" AND line = ?");
        }
        if query.station_id.is_some() {
            sql.push_str(" AND stop_id = ?");
        }
        if query.since.is_some() {
            sql.push_str(" AND observed_at >= ?");
        }
        if query.until.is_some() {
            sql.push_str(" AND observed_at <= ?");
        }
        sql.push_str(" ORDER BY observed_at ASC");
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql);
        if let Some(line) = &query.line {
            q = q.bind(line);
        }
        if let Some(station) = &query.station_id {
            q = q.bind(station);
        }
        if let Some(since) = query.since {
            q = q.bind(ts(since));
        }
        if let Some(until) = query.until {
            q = q.bind(ts(until));
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "query_positions"))?;
        Ok(rows.iter().map(row_to_position).collect())
    }

    async fn latest_positions_for_line(&self, line: &str) -> StoreResult<Vec<TrainPosition>> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM train_positions p
            JOIN (
                SELECT trip_id, MAX(observed_at) AS max_at
                FROM train_positions WHERE line = ? GROUP BY trip_id
            ) latest
              ON p.trip_id = latest.trip_id AND p.observed_at = latest.max_at
            WHERE p.line = ?
            ORDER BY p.trip_id
            "#,
        )
        .bind(line)
        .bind(line)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "latest_positions_for_line"))?;
        Ok(rows.iter().map(row_to_position).collect())
    }

    async fn insert_feed_run(&self, run: FeedRun) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO feed_runs (
                feed_id, started_at, finished_at, entities_seen, alerts_seen,
                status, duration_ms, skipped
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.feed_id)
        .bind(ts(run.started_at))
        .bind(ts(run.finished_at))
        .bind(run.entities_seen as i64)
        .bind(run.alerts_seen as i64)
        .bind(run.status.as_str())
        .bind(run.duration_ms)
        .bind(run.skipped as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "insert_feed_run"))?;
        Ok(result.last_insert_rowid())
    }

    async fn recent_feed_runs(&self, limit: usize) -> StoreResult<Vec<FeedRun>> {
        let rows = sqlx::query("SELECT * FROM feed_runs ORDER BY run_id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "recent_feed_runs"))?;
        Ok(rows.iter().map(row_to_feed_run).collect())
    }

    async fn latest_feed_run_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(finished_at) AS latest FROM feed_runs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "latest_feed_run_at"))?;
        Ok(opt_dt(row.get("latest")))
    }

    async fn purge_positions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let positions = sqlx::query("DELETE FROM train_positions WHERE observed_at < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "purge_positions_before"))?;
        let runs = sqlx::query("DELETE FROM feed_runs WHERE started_at < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "purge_positions_before"))?;
        Ok(positions.rows_affected() + runs.rows_affected())
    }
}

#[async_trait]
impl AnomalyStore for SqliteStore {
    async fn insert_anomaly(&self, anomaly: &Anomaly) -> StoreResult<()> {
        let features = serde_json::to_string(&anomaly.features)
            .map_err(|e| StoreError::internal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO anomalies (
                anomaly_id, detected_at, station_id, route_id, line, kind,
                severity, model_name, model_version, features, resolved, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(anomaly.anomaly_id.to_string())
        .bind(ts(anomaly.detected_at))
        .bind(&anomaly.station_id)
        .bind(&anomaly.route_id)
        .bind(&anomaly.line)
        .bind(anomaly.kind.as_str())
        .bind(anomaly.severity)
        .bind(&anomaly.model_name)
        .bind(anomaly.model_version)
        .bind(features)
        .bind(anomaly.resolved as i64)
        .bind(anomaly.resolved_at.map(ts))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "insert_anomaly"))?;
        Ok(())
    }

    async fn raise_severity(&self, anomaly_id: Uuid, severity: f64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE anomalies SET severity = MAX(severity, ?) WHERE anomaly_id = ?",
        )
        .bind(severity)
        .bind(anomaly_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "raise_severity"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("anomaly {anomaly_id}")));
        }
        Ok(())
    }

    async fn query_anomalies(&self, query: &AnomalyQuery) -> StoreResult<AnomalyPage> {
        let mut conditions = String::from("detected_at >= ? AND detected_at <= ?");
        if query.line.is_some() {
            conditions.push_str(" AND line = ?");
        }
        if query.station_id.is_some() {
            conditions.push_str(" AND station_id = ?");
        }
        if query.severity_min.is_some() {
            conditions.push_str(" AND severity >= ?");
        }

        let count_sql = format!("SELECT COUNT(*) AS n FROM anomalies WHERE {conditions}");
        let mut count_query = sqlx::query(&count_sql)
            .bind(ts(query.since))
            .bind(ts(query.until));
        if let Some(line) = &query.line {
            count_query = count_query.bind(line);
        }
        if let Some(station) = &query.station_id {
            count_query = count_query.bind(station);
        }
        if let Some(min) = query.severity_min {
            count_query = count_query.bind(min);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "query_anomalies"))?
            .get("n");

        let page = query.page.max(1);
        let page_size = query.page_size.min(i64::MAX as usize);
        let offset = (page - 1).saturating_mul(page_size);
        let page_sql = format!(
            "SELECT * FROM anomalies WHERE {conditions}
             ORDER BY detected_at DESC LIMIT ? OFFSET ?"
        );
        let mut page_query = sqlx::query(&page_sql)
            .bind(ts(query.since))
            .bind(ts(query.until));
        if let Some(line) = &query.line {
            page_query = page_query.bind(line);
        }
        if let Some(station) = &query.station_id {
            page_query = page_query.bind(station);
        }
        if let Some(min) = query.severity_min {
            page_query = page_query.bind(min);
        }
        let rows = page_query
            .bind(page_size as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "query_anomalies"))?;

        let anomalies = rows
            .iter()
            .map(row_to_anomaly)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(AnomalyPage {
            anomalies,
            total: total as usize,
            page,
            page_size: query.page_size,
        })
    }

    async fn get_anomaly(&self, anomaly_id: Uuid) -> StoreResult<Option<Anomaly>> {
        let row = sqlx::query("SELECT * FROM anomalies WHERE anomaly_id = ?")
            .bind(anomaly_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "get_anomaly"))?;
        row.as_ref().map(row_to_anomaly).transpose()
    }

    async fn resolve_anomaly(&self, anomaly_id: Uuid) -> StoreResult<Option<Anomaly>> {
        let result = sqlx::query(
            "UPDATE anomalies SET resolved = 1, resolved_at = ? WHERE anomaly_id = ?",
        )
        .bind(ts(Utc::now()))
        .bind(anomaly_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "resolve_anomaly"))?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_anomaly(anomaly_id).await
    }

    async fn purge_anomalies_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM anomalies WHERE detected_at < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "purge_anomalies_before"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn put_model_artifact(
        &self,
        name: &str,
        payload: Vec<u8>,
        hyperparams: BTreeMap<String, f64>,
        training_window_hours: u32,
    ) -> StoreResult<ModelArtifact> {
        let hyperparams_json = serde_json::to_string(&hyperparams)
            .map_err(|e| StoreError::internal(e.to_string()))?;
        let trained_at = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx(e, "put_model_artifact"))?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS latest FROM model_artifacts WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx(e, "put_model_artifact"))?;
        let version: i64 = row.get::<i64, _>("latest") + 1;

        sqlx::query(
            r#"
            INSERT INTO model_artifacts (
                name, version, trained_at, payload, hyperparams, training_window_hours
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(version)
        .bind(ts(trained_at))
        .bind(&payload)
        .bind(&hyperparams_json)
        .bind(training_window_hours as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx(e, "put_model_artifact"))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx(e, "put_model_artifact"))?;

        Ok(ModelArtifact {
            name: name.to_string(),
            version,
            trained_at,
            payload,
            hyperparams,
            training_window_hours,
        })
    }

    async fn get_latest_artifact(&self, name: &str) -> StoreResult<Option<ModelArtifact>> {
        let row = sqlx::query(
            "SELECT * FROM model_artifacts WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx(e, "get_latest_artifact"))?;
        Ok(row.as_ref().map(row_to_artifact))
    }

    async fn get_artifact(&self, name: &str, version: i64) -> StoreResult<Option<ModelArtifact>> {
        let row = sqlx::query("SELECT * FROM model_artifacts WHERE name = ? AND version = ?")
            .bind(name)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "get_artifact"))?;
        Ok(row.as_ref().map(row_to_artifact))
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn upsert_stations(&self, stations: &[Station]) -> StoreResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx(e, "upsert_stations"))?;
        let mut inserted = 0usize;
        for station in stations {
            let routes = serde_json::to_string(&station.routes_served)
                .map_err(|e| StoreError::internal(e.to_string()))?;
            let result = sqlx::query(
                r#"
                INSERT INTO stations (stop_id, name, lat, lon, parent_id, routes_served)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (stop_id) DO NOTHING
                "#,
            )
            .bind(&station.stop_id)
            .bind(&station.name)
            .bind(station.lat)
            .bind(station.lon)
            .bind(&station.parent_id)
            .bind(routes)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(e, "upsert_stations"))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx(e, "upsert_stations"))?;
        Ok(inserted)
    }

    async fn upsert_routes(&self, routes: &[Route]) -> StoreResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx(e, "upsert_routes"))?;
        let mut inserted = 0usize;
        for route in routes {
            let result = sqlx::query(
                r#"
                INSERT INTO routes (route_id, display_name, color)
                VALUES (?, ?, ?)
                ON CONFLICT (route_id) DO NOTHING
                "#,
            )
            .bind(&route.route_id)
            .bind(&route.display_name)
            .bind(&route.color)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(e, "upsert_routes"))?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(|e| map_sqlx(e, "upsert_routes"))?;
        Ok(inserted)
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 AS one")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx(e, "health_check"))?;
        Ok(row.get::<i64, _>("one") == 1)
    }
}
