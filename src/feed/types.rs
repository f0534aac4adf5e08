//! Canonical in-memory event model produced by the decoder.
//!
//! These are the tagged variants the rest of the pipeline consumes;
//! nothing downstream of the decoder touches protobuf types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a train currently is relative to its next stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStatus {
    AtStop,
    InTransit,
    Incoming,
}

impl TrainStatus {
    /// Map the GTFS-RT `VehicleStopStatus` enum value.
    pub fn from_stop_status(raw: i32) -> Self {
        match raw {
            0 => TrainStatus::Incoming,
            1 => TrainStatus::AtStop,
            _ => TrainStatus::InTransit,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrainStatus::AtStop => "at_stop",
            TrainStatus::InTransit => "in_transit",
            TrainStatus::Incoming => "incoming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "at_stop" => Some(TrainStatus::AtStop),
            "in_transit" => Some(TrainStatus::InTransit),
            "incoming" => Some(TrainStatus::Incoming),
            _ => None,
        }
    }
}

/// One stop-level prediction extracted from a trip update.
///
/// Keyed by `(trip_id, route_id)`; one event is emitted per
/// `stop_time_update` carrying at least one of the two event times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    pub trip_id: String,
    pub route_id: String,
    /// 0 = south/west, 1 = north/east.
    pub direction: u8,
    pub stop_id: String,
    /// Envelope header timestamp; ordering key for the whole pipeline.
    pub observed_at: DateTime<Utc>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    /// Vendor-reported delay when present.
    pub delay_seconds: Option<i32>,
    /// Scheduled arrival when the static schedule knows this stop.
    pub scheduled_arrival: Option<DateTime<Utc>>,
}

/// A decoded vehicle position snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleEvent {
    pub trip_id: String,
    pub route_id: String,
    pub direction: u8,
    pub current_stop_id: Option<String>,
    pub current_status: TrainStatus,
    pub observed_at: DateTime<Utc>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_status_mapping() {
        assert_eq!(TrainStatus::from_stop_status(0), TrainStatus::Incoming);
        assert_eq!(TrainStatus::from_stop_status(1), TrainStatus::AtStop);
        assert_eq!(TrainStatus::from_stop_status(2), TrainStatus::InTransit);
        // Unknown values degrade to in-transit rather than failing the entity.
        assert_eq!(TrainStatus::from_stop_status(7), TrainStatus::InTransit);
    }
}
