//! Feed ingestion: fetching and decoding of GTFS-realtime feeds.
//!
//! [`fetcher`] pulls raw protobuf bytes from the vendor endpoints with
//! retry and backoff; [`decoder`] turns them into the canonical records of
//! [`types`]. Both are pure with respect to the store: recording the
//! resulting [`crate::store::FeedRun`] is the scheduler's job.

pub mod decoder;
pub mod fetcher;
pub mod gtfs_rt;
pub mod types;

pub use decoder::{decode_feed, DecodedFeed};
pub use fetcher::{FeedFetcher, FetchError};
pub use types::{TrainStatus, TripEvent, VehicleEvent};
