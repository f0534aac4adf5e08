//! Static transit catalog: stations and routes from the GTFS bundle.
//!
//! Loaded once at startup from the zipped schedule bundle and read-only
//! afterwards, so lookups need no locking. Child stops (platform-level
//! entries with a `parent_station`) are rolled up into their parent; the
//! parent is the only analytics unit ever surfaced.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// A transit route as published in `routes.txt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub display_name: String,
    /// Hex color without the leading `#`, empty when unpublished.
    pub color: String,
}

/// A station (parent stop) as published in `stops.txt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub stop_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Set for child stops only; such stops are never analytics units.
    pub parent_id: Option<String>,
    pub routes_served: BTreeSet<String>,
}

/// Geographic query window, degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Neither stops.txt nor routes.txt could be read; fatal at startup.
    #[error("catalog missing: no usable stops.txt or routes.txt in {path}")]
    Missing { path: String },
    #[error("bundle unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle corrupt: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("csv malformed: {0}")]
    Csv(#[from] csv::Error),
}

/// Immutable station/route catalog.
pub struct Catalog {
    stations: HashMap<String, Station>,
    child_to_parent: HashMap<String, String>,
    routes: HashMap<String, Route>,
    skipped: u32,
}

impl Catalog {
    /// Load the catalog from a zipped GTFS bundle.
    ///
    /// `stops.txt` and `routes.txt` are required in the sense that the
    /// load fails only when neither yields any rows. A partially invalid
    /// row is skipped and counted, never fatal. When `trips.txt` and
    /// `stop_times.txt` are present they are used to derive
    /// `routes_served` per station; otherwise the sets stay empty.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path).map_err(|_| CatalogError::Missing {
            path: path.display().to_string(),
        })?;
        let mut archive = zip::ZipArchive::new(file)?;

        let mut skipped = 0u32;
        let raw_stations = match archive.by_name("stops.txt") {
            Ok(entry) => parse_stops(entry, &mut skipped)?,
            Err(zip::result::ZipError::FileNotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let routes = match archive.by_name("routes.txt") {
            Ok(entry) => parse_routes(entry, &mut skipped)?,
            Err(zip::result::ZipError::FileNotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if raw_stations.is_empty() && routes.is_empty() {
            return Err(CatalogError::Missing {
                path: path.display().to_string(),
            });
        }

        let mut catalog = Self::from_rows(raw_stations, routes, skipped);
        catalog.derive_routes_served(&mut archive);

        info!(
            stations = catalog.stations.len(),
            child_stops = catalog.child_to_parent.len(),
            routes = catalog.routes.len(),
            skipped = catalog.skipped,
            "catalog loaded"
        );
        Ok(catalog)
    }

    fn from_rows(raw_stations: Vec<Station>, routes: Vec<Route>, skipped: u32) -> Self {
        let mut stations: HashMap<String, Station> = HashMap::new();
        let mut child_to_parent: HashMap<String, String> = HashMap::new();

        for station in &raw_stations {
            if let Some(parent) = &station.parent_id {
                child_to_parent.insert(station.stop_id.clone(), parent.clone());
            } else {
                stations.insert(station.stop_id.clone(), station.clone());
            }
        }
        // A child whose parent row is absent still needs an analytics
        // unit; promote the parent id with the child's coordinates.
        for station in &raw_stations {
            if let Some(parent) = &station.parent_id {
                stations.entry(parent.clone()).or_insert_with(|| Station {
                    stop_id: parent.clone(),
                    name: station.name.clone(),
                    lat: station.lat,
                    lon: station.lon,
                    parent_id: None,
                    routes_served: BTreeSet::new(),
                });
            }
        }

        Self {
            stations,
            child_to_parent,
            routes: routes
                .into_iter()
                .map(|r| (r.route_id.clone(), r))
                .collect(),
            skipped,
        }
    }

    /// Join trips.txt and stop_times.txt into per-station route sets.
    fn derive_routes_served(&mut self, archive: &mut zip::ZipArchive<File>) {
        let trip_routes: HashMap<String, String> = match archive.by_name("trips.txt") {
            Ok(entry) => match parse_trip_routes(entry) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "trips.txt unreadable, routes_served left empty");
                    return;
                }
            },
            Err(_) => return,
        };
        let pairs = match archive.by_name("stop_times.txt") {
            Ok(entry) => match parse_stop_trip_pairs(entry) {
                Ok(pairs) => pairs,
                Err(e) => {
                    warn!(error = %e, "stop_times.txt unreadable, routes_served left empty");
                    return;
                }
            },
            Err(_) => return,
        };

        for (stop_id, trip_id) in pairs {
            let Some(route_id) = trip_routes.get(&trip_id) else {
                continue;
            };
            let unit = self
                .child_to_parent
                .get(&stop_id)
                .cloned()
                .unwrap_or(stop_id);
            if let Some(station) = self.stations.get_mut(&unit) {
                station.routes_served.insert(route_id.clone());
            }
        }
    }

    /// Look up the analytics station for a stop id, rolling child stops
    /// up to their parent.
    pub fn lookup_station(&self, stop_id: &str) -> Option<&Station> {
        let unit = self
            .child_to_parent
            .get(stop_id)
            .map(String::as_str)
            .unwrap_or(stop_id);
        self.stations.get(unit)
    }

    /// The analytics unit id for a stop, if the catalog knows it.
    pub fn resolve_analytics_station(&self, stop_id: &str) -> Option<&str> {
        self.lookup_station(stop_id).map(|s| s.stop_id.as_str())
    }

    pub fn lookup_route(&self, route_id: &str) -> Option<&Route> {
        self.routes.get(route_id)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Stations inside the window; the whole set when `bbox` is `None`.
    pub fn stations_in_bounds(&self, bbox: Option<BoundingBox>) -> Vec<&Station> {
        let mut out: Vec<&Station> = self
            .stations
            .values()
            .filter(|s| bbox.map(|b| b.contains(s.lat, s.lon)).unwrap_or(true))
            .collect();
        out.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));
        out
    }

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    /// Rows dropped during load.
    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

/// Route → line grouping used for per-line analytics: express variants
/// collapse onto their local service, the Broadway services share one
/// group, everything else is its own lowercase line.
pub fn line_for_route(route_id: &str) -> String {
    match route_id {
        "6X" => "6".to_string(),
        "7X" => "7".to_string(),
        "N" | "Q" | "R" | "W" => "nqrw".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_stops<R: Read>(reader: R, skipped: &mut u32) -> Result<Vec<Station>, CatalogError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let idx = |name: &str| headers.iter().position(|h| h == name);

    let (Some(idx_id), Some(idx_lat), Some(idx_lon)) =
        (idx("stop_id"), idx("stop_lat"), idx("stop_lon"))
    else {
        // Header row unusable: every data row would be skipped anyway.
        return Ok(Vec::new());
    };
    let idx_name = idx("stop_name");
    let idx_parent = idx("parent_station");

    let mut stations = Vec::new();
    for result in rdr.records() {
        let Ok(record) = result else {
            *skipped += 1;
            continue;
        };
        let stop_id = record.get(idx_id).unwrap_or("").trim().to_string();
        let lat = record.get(idx_lat).and_then(|s| s.trim().parse::<f64>().ok());
        let lon = record.get(idx_lon).and_then(|s| s.trim().parse::<f64>().ok());
        let (Some(lat), Some(lon)) = (lat, lon) else {
            *skipped += 1;
            continue;
        };
        if stop_id.is_empty() {
            *skipped += 1;
            continue;
        }
        stations.push(Station {
            name: idx_name
                .and_then(|i| record.get(i))
                .and_then(non_empty)
                .unwrap_or_else(|| format!("Station {stop_id}")),
            stop_id,
            lat,
            lon,
            parent_id: idx_parent.and_then(|i| record.get(i)).and_then(non_empty),
            routes_served: BTreeSet::new(),
        });
    }
    Ok(stations)
}

fn parse_routes<R: Read>(reader: R, skipped: &mut u32) -> Result<Vec<Route>, CatalogError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let idx = |name: &str| headers.iter().position(|h| h == name);

    let Some(idx_id) = idx("route_id") else {
        return Ok(Vec::new());
    };
    let idx_short = idx("route_short_name");
    let idx_long = idx("route_long_name");
    let idx_color = idx("route_color");

    let mut routes = Vec::new();
    for result in rdr.records() {
        let Ok(record) = result else {
            *skipped += 1;
            continue;
        };
        let route_id = record.get(idx_id).unwrap_or("").trim().to_string();
        if route_id.is_empty() {
            *skipped += 1;
            continue;
        }
        let display_name = idx_short
            .and_then(|i| record.get(i))
            .and_then(non_empty)
            .or_else(|| idx_long.and_then(|i| record.get(i)).and_then(non_empty))
            .unwrap_or_else(|| route_id.clone());
        routes.push(Route {
            route_id,
            display_name,
            color: idx_color
                .and_then(|i| record.get(i))
                .and_then(non_empty)
                .unwrap_or_default(),
        });
    }
    Ok(routes)
}

fn parse_trip_routes<R: Read>(reader: R) -> Result<HashMap<String, String>, csv::Error> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let idx_trip = headers.iter().position(|h| h == "trip_id");
    let idx_route = headers.iter().position(|h| h == "route_id");
    let (Some(idx_trip), Some(idx_route)) = (idx_trip, idx_route) else {
        return Ok(HashMap::new());
    };

    let mut map = HashMap::new();
    for record in rdr.records().flatten() {
        let trip = record.get(idx_trip).unwrap_or("").trim();
        let route = record.get(idx_route).unwrap_or("").trim();
        if !trip.is_empty() && !route.is_empty() {
            map.insert(trip.to_string(), route.to_string());
        }
    }
    Ok(map)
}

fn parse_stop_trip_pairs<R: Read>(reader: R) -> Result<Vec<(String, String)>, csv::Error> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let idx_trip = headers.iter().position(|h| h == "trip_id");
    let idx_stop = headers.iter().position(|h| h == "stop_id");
    let (Some(idx_trip), Some(idx_stop)) = (idx_trip, idx_stop) else {
        return Ok(Vec::new());
    };

    let mut pairs = Vec::new();
    for record in rdr.records().flatten() {
        let trip = record.get(idx_trip).unwrap_or("").trim();
        let stop = record.get(idx_stop).unwrap_or("").trim();
        if !trip.is_empty() && !stop.is_empty() {
            pairs.push((stop.to_string(), trip.to_string()));
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_bundle(files: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(tmp.reopen().unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        tmp
    }

    const STOPS: &str = "\
stop_id,stop_name,stop_lat,stop_lon,parent_station
635,14 St-Union Sq,40.7347,-73.9900,
635N,14 St-Union Sq,40.7347,-73.9900,635
635S,14 St-Union Sq,40.7347,-73.9900,635
bad-row,No Coordinates,,,
R20,Union Sq NQRW,40.7356,-73.9906,
";

    const ROUTES: &str = "\
route_id,route_short_name,route_long_name,route_color
6,6,Lexington Av Local,00933C
N,N,Broadway Express,FCCC0A
";

    #[test]
    fn loads_and_rolls_up_children() {
        let bundle = write_bundle(&[("stops.txt", STOPS), ("routes.txt", ROUTES)]);
        let catalog = Catalog::load(bundle.path()).unwrap();

        // Child resolves to the parent analytics unit.
        assert_eq!(catalog.lookup_station("635N").unwrap().stop_id, "635");
        assert_eq!(catalog.resolve_analytics_station("635S"), Some("635"));
        // Parents and standalone stops survive; children are not units.
        assert_eq!(catalog.station_count(), 2);
        assert_eq!(catalog.skipped(), 1);
        assert_eq!(catalog.lookup_route("6").unwrap().color, "00933C");
    }

    #[test]
    fn bbox_filters_stations() {
        let bundle = write_bundle(&[("stops.txt", STOPS), ("routes.txt", ROUTES)]);
        let catalog = Catalog::load(bundle.path()).unwrap();

        let all = catalog.stations_in_bounds(None);
        assert_eq!(all.len(), 2);

        let none = catalog.stations_in_bounds(Some(BoundingBox {
            min_lat: 41.0,
            min_lon: -74.0,
            max_lat: 42.0,
            max_lon: -73.0,
        }));
        assert!(none.is_empty());
    }

    #[test]
    fn missing_both_tables_is_fatal() {
        let bundle = write_bundle(&[("agency.txt", "agency_id\nmta\n")]);
        assert!(matches!(
            Catalog::load(bundle.path()),
            Err(CatalogError::Missing { .. })
        ));
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.zip");
        assert!(matches!(
            Catalog::load(&path),
            Err(CatalogError::Missing { .. })
        ));
    }

    #[test]
    fn routes_served_derived_when_trip_tables_present() {
        let trips = "trip_id,route_id,service_id\nt1,6,wk\nt2,N,wk\n";
        let stop_times =
            "trip_id,stop_id,stop_sequence\nt1,635N,1\nt2,R20,1\nt2,635S,2\n";
        let bundle = write_bundle(&[
            ("stops.txt", STOPS),
            ("routes.txt", ROUTES),
            ("trips.txt", trips),
            ("stop_times.txt", stop_times),
        ]);
        let catalog = Catalog::load(bundle.path()).unwrap();

        let union_sq = catalog.lookup_station("635").unwrap();
        assert!(union_sq.routes_served.contains("6"));
        assert!(union_sq.routes_served.contains("N"));
        let r20 = catalog.lookup_station("R20").unwrap();
        assert_eq!(r20.routes_served.len(), 1);
    }

    #[test]
    fn deterministic_station_set() {
        let bundle = write_bundle(&[("stops.txt", STOPS), ("routes.txt", ROUTES)]);
        let a = Catalog::load(bundle.path()).unwrap();
        let b = Catalog::load(bundle.path()).unwrap();
        let ids = |c: &Catalog| {
            let mut v: Vec<String> = c
                .stations_in_bounds(None)
                .iter()
                .map(|s| s.stop_id.clone())
                .collect();
            v.sort();
            v
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn line_grouping_collapses_variants() {
        assert_eq!(line_for_route("6X"), "6");
        assert_eq!(line_for_route("7X"), "7");
        assert_eq!(line_for_route("N"), "nqrw");
        assert_eq!(line_for_route("W"), "nqrw");
        assert_eq!(line_for_route("L"), "l");
    }
}
