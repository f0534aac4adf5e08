//! Protobuf feed decoding into the canonical event model.
//!
//! Decoding is tolerant at the entity level: an entity missing required
//! fields is skipped and counted, and the feed as a whole is reported as
//! partial. Only an unparseable envelope (or an unrecognized version tag)
//! fails the run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;

use super::gtfs_rt;
use super::types::{TrainStatus, TripEvent, VehicleEvent};

/// Envelope-level decode failure; entity-level problems never produce this.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf envelope unparseable: {0}")]
    Envelope(#[from] prost::DecodeError),
    #[error("unrecognized gtfs-realtime version {0:?}")]
    UnsupportedVersion(String),
    #[error("feed header carries no timestamp")]
    MissingTimestamp,
}

/// Everything extracted from one feed payload.
#[derive(Debug, Clone)]
pub struct DecodedFeed {
    /// Envelope header timestamp.
    pub observed_at: DateTime<Utc>,
    pub trips: Vec<TripEvent>,
    pub vehicles: Vec<VehicleEvent>,
    /// Entities present in the envelope, valid or not.
    pub entities_seen: u32,
    pub alerts_seen: u32,
    /// Entities dropped for missing required fields.
    pub skipped: u32,
}

impl DecodedFeed {
    /// True when at least one entity had to be dropped.
    pub fn is_partial(&self) -> bool {
        self.skipped > 0
    }
}

/// Decode a raw protobuf payload into canonical records.
///
/// Within one payload, the later `observed_at` wins for records sharing a
/// `(trip_id, stop_id)` key.
pub fn decode_feed(bytes: &[u8]) -> Result<DecodedFeed, DecodeError> {
    let message = gtfs_rt::FeedMessage::decode(bytes)?;

    let version = message.header.gtfs_realtime_version.as_str();
    if version != "1.0" && version != "2.0" {
        return Err(DecodeError::UnsupportedVersion(version.to_string()));
    }
    let header_ts = message
        .header
        .timestamp
        .and_then(|t| DateTime::from_timestamp(t as i64, 0))
        .ok_or(DecodeError::MissingTimestamp)?;

    let mut trips: HashMap<(String, String), TripEvent> = HashMap::new();
    let mut vehicles: Vec<VehicleEvent> = Vec::new();
    let mut alerts_seen = 0u32;
    let mut skipped = 0u32;
    let entities_seen = message.entity.len() as u32;

    for entity in &message.entity {
        if entity.is_deleted.unwrap_or(false) {
            continue;
        }
        if entity.alert.is_some() {
            alerts_seen += 1;
            continue;
        }
        if let Some(trip_update) = &entity.trip_update {
            match decode_trip_update(trip_update, header_ts) {
                Some(events) => {
                    for event in events {
                        let key = (event.trip_id.clone(), event.stop_id.clone());
                        match trips.get(&key) {
                            Some(existing) if existing.observed_at > event.observed_at => {}
                            _ => {
                                trips.insert(key, event);
                            }
                        }
                    }
                }
                None => skipped += 1,
            }
        } else if let Some(vehicle) = &entity.vehicle {
            match decode_vehicle(vehicle, header_ts) {
                Some(event) => vehicles.push(event),
                None => skipped += 1,
            }
        }
    }

    let mut trips: Vec<TripEvent> = trips.into_values().collect();
    trips.sort_by(|a, b| {
        (a.trip_id.as_str(), a.stop_id.as_str()).cmp(&(b.trip_id.as_str(), b.stop_id.as_str()))
    });

    Ok(DecodedFeed {
        observed_at: header_ts,
        trips,
        vehicles,
        entities_seen,
        alerts_seen,
        skipped,
    })
}

/// One trip update fans out into one event per usable stop_time_update.
/// Returns `None` when the descriptor lacks its identity fields.
fn decode_trip_update(
    update: &gtfs_rt::TripUpdate,
    header_ts: DateTime<Utc>,
) -> Option<Vec<TripEvent>> {
    let trip_id = update.trip.trip_id.clone()?;
    let route_id = update.trip.route_id.clone()?;
    let direction = update.trip.direction_id.map(|d| d.min(1) as u8).unwrap_or(0);
    let observed_at = update
        .timestamp
        .and_then(|t| DateTime::from_timestamp(t as i64, 0))
        .unwrap_or(header_ts);

    let mut events = Vec::new();
    for stu in &update.stop_time_update {
        let Some(stop_id) = stu.stop_id.clone() else {
            continue;
        };
        let arrival_time = event_time(stu.arrival.as_ref());
        let departure_time = event_time(stu.departure.as_ref());
        if arrival_time.is_none() && departure_time.is_none() {
            continue;
        }
        let delay_seconds = stu
            .arrival
            .as_ref()
            .and_then(|e| e.delay)
            .or(update.delay);
        // StopTimeEvent delays are relative to schedule, so an absolute
        // time plus a delay pins the scheduled arrival.
        let scheduled_arrival = match (arrival_time, delay_seconds) {
            (Some(at), Some(d)) => Some(at - chrono::Duration::seconds(d as i64)),
            _ => None,
        };
        events.push(TripEvent {
            trip_id: trip_id.clone(),
            route_id: route_id.clone(),
            direction,
            stop_id,
            observed_at,
            arrival_time,
            departure_time,
            delay_seconds,
            scheduled_arrival,
        });
    }
    Some(events)
}

fn decode_vehicle(
    vehicle: &gtfs_rt::VehiclePosition,
    header_ts: DateTime<Utc>,
) -> Option<VehicleEvent> {
    let trip = vehicle.trip.as_ref()?;
    let trip_id = trip.trip_id.clone()?;
    let route_id = trip.route_id.clone()?;
    let observed_at = vehicle
        .timestamp
        .and_then(|t| DateTime::from_timestamp(t as i64, 0))
        .unwrap_or(header_ts);

    Some(VehicleEvent {
        trip_id,
        route_id,
        direction: trip.direction_id.map(|d| d.min(1) as u8).unwrap_or(0),
        current_stop_id: vehicle.stop_id.clone(),
        current_status: TrainStatus::from_stop_status(
            vehicle.current_status.unwrap_or(gtfs_rt::VehicleStopStatus::InTransitTo as i32),
        ),
        observed_at,
        lat: vehicle.position.as_ref().map(|p| p.latitude as f64),
        lon: vehicle.position.as_ref().map(|p| p.longitude as f64),
    })
}

fn event_time(event: Option<&gtfs_rt::trip_update::StopTimeEvent>) -> Option<DateTime<Utc>> {
    event
        .and_then(|e| e.time)
        .and_then(|t| DateTime::from_timestamp(t, 0))
}
