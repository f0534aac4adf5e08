//! GTFS-realtime protobuf messages.
//!
//! Hand-declared `prost` messages for the subset of the public
//! `gtfs-realtime.proto` this service reads: the feed envelope, trip
//! updates, vehicle positions and alert presence. Field tags follow the
//! published proto; unknown fields are skipped by prost on decode, so
//! feeds carrying extensions decode cleanly.

/// The envelope: one header plus a list of entities.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeedMessage {
    #[prost(message, required, tag = "1")]
    pub header: FeedHeader,
    #[prost(message, repeated, tag = "2")]
    pub entity: ::prost::alloc::vec::Vec<FeedEntity>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeedHeader {
    /// "1.0" or "2.0".
    #[prost(string, required, tag = "1")]
    pub gtfs_realtime_version: ::prost::alloc::string::String,
    #[prost(enumeration = "Incrementality", optional, tag = "2")]
    pub incrementality: ::core::option::Option<i32>,
    /// Snapshot time, unix seconds.
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: ::core::option::Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Incrementality {
    FullDataset = 0,
    Differential = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeedEntity {
    #[prost(string, required, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(bool, optional, tag = "2")]
    pub is_deleted: ::core::option::Option<bool>,
    #[prost(message, optional, tag = "3")]
    pub trip_update: ::core::option::Option<TripUpdate>,
    #[prost(message, optional, tag = "4")]
    pub vehicle: ::core::option::Option<VehiclePosition>,
    #[prost(message, optional, tag = "5")]
    pub alert: ::core::option::Option<Alert>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TripUpdate {
    #[prost(message, required, tag = "1")]
    pub trip: TripDescriptor,
    #[prost(message, repeated, tag = "2")]
    pub stop_time_update: ::prost::alloc::vec::Vec<trip_update::StopTimeUpdate>,
    #[prost(message, optional, tag = "3")]
    pub vehicle: ::core::option::Option<VehicleDescriptor>,
    #[prost(uint64, optional, tag = "4")]
    pub timestamp: ::core::option::Option<u64>,
    #[prost(int32, optional, tag = "5")]
    pub delay: ::core::option::Option<i32>,
}

pub mod trip_update {
    /// Arrival or departure estimate for one stop.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StopTimeEvent {
        /// Seconds relative to schedule; negative means early.
        #[prost(int32, optional, tag = "1")]
        pub delay: ::core::option::Option<i32>,
        /// Absolute time, unix seconds.
        #[prost(int64, optional, tag = "2")]
        pub time: ::core::option::Option<i64>,
        #[prost(int32, optional, tag = "3")]
        pub uncertainty: ::core::option::Option<i32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StopTimeUpdate {
        #[prost(uint32, optional, tag = "1")]
        pub stop_sequence: ::core::option::Option<u32>,
        #[prost(message, optional, tag = "2")]
        pub arrival: ::core::option::Option<StopTimeEvent>,
        #[prost(message, optional, tag = "3")]
        pub departure: ::core::option::Option<StopTimeEvent>,
        #[prost(string, optional, tag = "4")]
        pub stop_id: ::core::option::Option<::prost::alloc::string::String>,
        #[prost(int32, optional, tag = "5")]
        pub schedule_relationship: ::core::option::Option<i32>,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TripDescriptor {
    #[prost(string, optional, tag = "1")]
    pub trip_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub start_time: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub start_date: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(int32, optional, tag = "4")]
    pub schedule_relationship: ::core::option::Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub route_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint32, optional, tag = "6")]
    pub direction_id: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VehicleDescriptor {
    #[prost(string, optional, tag = "1")]
    pub id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub label: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub license_plate: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VehiclePosition {
    #[prost(message, optional, tag = "1")]
    pub trip: ::core::option::Option<TripDescriptor>,
    #[prost(message, optional, tag = "2")]
    pub position: ::core::option::Option<Position>,
    #[prost(uint32, optional, tag = "3")]
    pub current_stop_sequence: ::core::option::Option<u32>,
    #[prost(enumeration = "VehicleStopStatus", optional, tag = "4")]
    pub current_status: ::core::option::Option<i32>,
    #[prost(uint64, optional, tag = "5")]
    pub timestamp: ::core::option::Option<u64>,
    #[prost(string, optional, tag = "7")]
    pub stop_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "8")]
    pub vehicle: ::core::option::Option<VehicleDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VehicleStopStatus {
    IncomingAt = 0,
    StoppedAt = 1,
    InTransitTo = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(float, required, tag = "1")]
    pub latitude: f32,
    #[prost(float, required, tag = "2")]
    pub longitude: f32,
    #[prost(float, optional, tag = "3")]
    pub bearing: ::core::option::Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub speed: ::core::option::Option<f32>,
}

/// Service alerts are counted but not interpreted; every field of the
/// published Alert message is treated as unknown and skipped on decode.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Alert {}
