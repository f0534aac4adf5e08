//! Immutable configuration snapshot for the monitor.
//!
//! Every knob is read once from the environment at startup with a sensible
//! default; the resulting [`Config`] is cloned into the components that
//! need it and never mutated afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One upstream GTFS-realtime feed to poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedDescriptor {
    /// Short identifier, e.g. "ace" or "bdfm".
    pub feed_id: String,
    /// Absolute URL of the protobuf endpoint.
    pub url: String,
}

/// Feed ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Feeds polled every tick.
    pub feeds: Vec<FeedDescriptor>,
    /// Seconds between ingest ticks.
    pub update_interval_s: u64,
    /// Per-fetch timeout in seconds.
    pub timeout_s: u64,
    /// Retry attempts per fetch before the run is recorded as failed.
    pub max_retries: u32,
}

/// Feature engine window settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Sliding window for headway computation, minutes.
    pub headway_window_minutes: u32,
    /// Rolling statistics window, hours.
    pub rolling_window_hours: u32,
}

/// Detector and training settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Expected fraction of outliers in training data.
    pub contamination: f64,
    /// Sequence model input length (feed ticks per sequence).
    pub sequence_length: usize,
    /// Widest autoencoder hidden layer.
    pub hidden_size: usize,
    /// UTC hour for the nightly retrain.
    pub retrain_hour_utc: u32,
    /// Hours of history used for training.
    pub training_window_hours: u32,
    /// Minimum seconds between sequence-model evaluations per line.
    pub sequence_tick_s: u64,
    /// Window during which repeated anomalies at the same key coalesce.
    pub suppress_window_s: i64,
}

/// Websocket / event bus settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WsConfig {
    /// Heartbeat period, seconds.
    pub heartbeat_interval_s: u64,
    /// Maximum concurrent subscribers.
    pub max_connections: usize,
}

/// Storage and backpressure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite connection string (`sqlite::memory:` or a file path URL).
    pub database_url: String,
    /// Rows older than this are purged.
    pub retention_hours: u32,
    /// p95 write latency above which ingest halves its batch size, ms.
    pub write_high_watermark_ms: u64,
    /// p95 write latency above which ingest sheds the slowest feeds, ms.
    pub write_drop_watermark_ms: u64,
}

/// Central configuration for the subway monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind host for the HTTP server.
    pub host: String,
    /// Bind port for the HTTP server.
    pub port: u16,
    /// Path to the zipped GTFS static bundle.
    pub gtfs_static_path: String,
    pub ingest: IngestConfig,
    pub features: FeatureConfig,
    pub detect: DetectConfig,
    pub ws: WsConfig,
    pub store: StoreConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// The MTA feed set polled when `FEED_URLS` is not configured.
const DEFAULT_FEEDS: &[(&str, &str)] = &[
    ("1234567", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs"),
    ("ace", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-ace"),
    ("bdfm", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-bdfm"),
    ("g", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-g"),
    ("jz", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-jz"),
    ("l", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-l"),
    ("nqrw", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-nqrw"),
    ("si", "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2Fgtfs-si"),
];

impl Config {
    /// Build the configuration from environment variables.
    ///
    /// `FEED_URLS` is a comma-separated list of `feed_id=url` pairs;
    /// malformed pairs are ignored. All other keys fall back to the
    /// documented defaults when unset or unparseable.
    pub fn from_env() -> Self {
        let feeds = match std::env::var("FEED_URLS") {
            Ok(raw) => {
                let parsed: Vec<FeedDescriptor> = raw
                    .split(',')
                    .filter_map(|pair| {
                        let (id, url) = pair.split_once('=')?;
                        let (id, url) = (id.trim(), url.trim());
                        if id.is_empty() || url.is_empty() {
                            return None;
                        }
                        Some(FeedDescriptor {
                            feed_id: id.to_string(),
                            url: url.to_string(),
                        })
                    })
                    .collect();
                if parsed.is_empty() {
                    Self::default_feeds()
                } else {
                    parsed
                }
            }
            Err(_) => Self::default_feeds(),
        };

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8080),
            gtfs_static_path: std::env::var("GTFS_STATIC_PATH")
                .unwrap_or_else(|_| "data/gtfs_static.zip".to_string()),
            ingest: IngestConfig {
                feeds,
                update_interval_s: env_parse("FEED_UPDATE_INTERVAL", 30),
                timeout_s: env_parse("FEED_TIMEOUT", 10),
                max_retries: env_parse("MAX_RETRIES", 3),
            },
            features: FeatureConfig {
                headway_window_minutes: env_parse("HEADWAY_WINDOW_MINUTES", 30),
                rolling_window_hours: env_parse("ROLLING_WINDOW_HOURS", 1),
            },
            detect: DetectConfig {
                contamination: env_parse("ANOMALY_CONTAMINATION", 0.05f64).clamp(0.01, 0.2),
                sequence_length: env_parse("LSTM_SEQUENCE_LENGTH", 24),
                hidden_size: env_parse("LSTM_HIDDEN_SIZE", 128),
                retrain_hour_utc: env_parse("MODEL_RETRAIN_HOUR", 3).min(23),
                training_window_hours: env_parse("TRAINING_WINDOW_HOURS", 168),
                sequence_tick_s: env_parse("SEQUENCE_TICK_SECONDS", 60),
                suppress_window_s: env_parse("SUPPRESS_WINDOW_S", 300),
            },
            ws: WsConfig {
                heartbeat_interval_s: env_parse("WS_HEARTBEAT_INTERVAL", 30),
                max_connections: env_parse("WS_MAX_CONNECTIONS", 1000),
            },
            store: StoreConfig {
                database_url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite::memory:".to_string()),
                retention_hours: env_parse("RETENTION_HOURS", 168),
                write_high_watermark_ms: env_parse("WRITE_HIGH_WATERMARK_MS", 500),
                write_drop_watermark_ms: env_parse("WRITE_DROP_WATERMARK_MS", 2000),
            },
        }
    }

    fn default_feeds() -> Vec<FeedDescriptor> {
        DEFAULT_FEEDS
            .iter()
            .map(|(id, url)| FeedDescriptor {
                feed_id: (*id).to_string(),
                url: (*url).to_string(),
            })
            .collect()
    }

    /// Per-fetch timeout as a [`Duration`].
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest.timeout_s)
    }

    /// Ingest tick period as a [`Duration`].
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.ingest.update_interval_s)
    }
}

impl Default for Config {
    fn default() -> Self {
        // Default snapshot independent of process environment, used by
        // tests and as documentation of every default value.
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            gtfs_static_path: "data/gtfs_static.zip".to_string(),
            ingest: IngestConfig {
                feeds: Self::default_feeds(),
                update_interval_s: 30,
                timeout_s: 10,
                max_retries: 3,
            },
            features: FeatureConfig {
                headway_window_minutes: 30,
                rolling_window_hours: 1,
            },
            detect: DetectConfig {
                contamination: 0.05,
                sequence_length: 24,
                hidden_size: 128,
                retrain_hour_utc: 3,
                training_window_hours: 168,
                sequence_tick_s: 60,
                suppress_window_s: 300,
            },
            ws: WsConfig {
                heartbeat_interval_s: 30,
                max_connections: 1000,
            },
            store: StoreConfig {
                database_url: "sqlite::memory:".to_string(),
                retention_hours: 168,
                write_high_watermark_ms: 500,
                write_drop_watermark_ms: 2000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.ingest.update_interval_s, 30);
        assert_eq!(cfg.ingest.timeout_s, 10);
        assert_eq!(cfg.ingest.max_retries, 3);
        assert_eq!(cfg.features.headway_window_minutes, 30);
        assert_eq!(cfg.detect.sequence_length, 24);
        assert_eq!(cfg.detect.hidden_size, 128);
        assert_eq!(cfg.detect.retrain_hour_utc, 3);
        assert_eq!(cfg.store.retention_hours, 168);
        assert_eq!(cfg.ws.max_connections, 1000);
    }

    #[test]
    fn default_feed_set_is_nonempty() {
        let cfg = Config::default();
        assert!(cfg.ingest.feeds.len() >= 8);
        assert!(cfg.ingest.feeds.iter().any(|f| f.feed_id == "ace"));
    }
}
