//! # Subway Monitor
//!
//! Real-time operational-anomaly detection for a large urban transit
//! network. The crate ingests vendor GTFS-realtime feeds, derives
//! per-train and per-station time-series features, scores them against an
//! ensemble of learned baselines, persists the resulting anomalies and
//! fans them out to subscribed clients.
//!
//! ## Architecture
//!
//! Data flows one direction through the components:
//!
//! ```text
//! fetcher -> decoder -> store (positions) -> features -> detect
//!                                                          |
//!                         ws subscribers <- bus <- store (anomalies)
//! ```
//!
//! Control flow is owned by [`scheduler`]: ingest ticks, detection ticks,
//! the nightly retrain and the retention purge. Components receive their
//! collaborators through constructors; the only process-wide state is the
//! immutable [`config::Config`] snapshot and the loaded [`catalog`].
//!
//! - [`catalog`]: static stations and routes from the GTFS bundle
//! - [`feed`]: feed fetching and protobuf decoding into canonical records
//! - [`store`]: append-only time-partitioned persistence (repository pattern)
//! - [`features`]: sliding-window headway / dwell / delay features
//! - [`detect`]: isolation-forest + autoencoder ensemble and training loop
//! - [`bus`]: in-process pub/sub for durable anomalies
//! - [`http`]: REST API and the `/ws` push channel
//! - [`scheduler`]: recurrent ticks and graceful shutdown

pub mod bus;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod features;
pub mod feed;
pub mod metrics;
pub mod scheduler;
pub mod store;

#[cfg(feature = "http-server")]
pub mod http;
