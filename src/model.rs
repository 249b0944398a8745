//! Planner data model: locations, measurements, routes and day segments.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::polyline::Polyline;

/// Identifier of a location in the planning input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationId(pub u32);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A point on the globe in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Both components are finite and inside the valid degree ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Fixed-precision text form used in cache keys.
    pub fn key(&self) -> String {
        format!("{:.6},{:.6}", self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Unresolved,
    Resolved,
    Failed,
}

/// A stop to visit, identified by its raw address.
///
/// Coordinates are present only once the location is resolved. Resolution
/// never mutates a location in place; it produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    id: LocationId,
    address: String,
    coordinates: Option<Coordinates>,
    status: ResolutionStatus,
}

impl Location {
    pub fn unresolved(id: LocationId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            coordinates: None,
            status: ResolutionStatus::Unresolved,
        }
    }

    pub fn resolved(id: LocationId, address: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id,
            address: address.into(),
            coordinates: Some(Coordinates::new(lat, lon)),
            status: ResolutionStatus::Resolved,
        }
    }

    pub fn id(&self) -> LocationId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> ResolutionStatus {
        self.status
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match self.status {
            ResolutionStatus::Resolved => self.coordinates,
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.coordinates().is_some()
    }

    /// Resolved to coordinates inside the valid latitude/longitude ranges.
    pub fn is_routable(&self) -> bool {
        self.coordinates().is_some_and(|coordinates| coordinates.is_valid())
    }

    /// Returns the resolved form of an unresolved location.
    ///
    /// Already resolved locations are returned unchanged.
    pub fn with_coordinates(&self, coordinates: Coordinates) -> Self {
        if self.is_resolved() {
            return self.clone();
        }
        Self {
            id: self.id,
            address: self.address.clone(),
            coordinates: Some(coordinates),
            status: ResolutionStatus::Resolved,
        }
    }

    pub fn into_failed(self) -> Self {
        Self {
            coordinates: None,
            status: ResolutionStatus::Failed,
            ..self
        }
    }
}

/// How the traveller moves between stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    #[default]
    Driving,
    Walking,
    Cycling,
}

impl TravelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TravelMode::Driving => "driving",
            TravelMode::Walking => "walking",
            TravelMode::Cycling => "cycling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    #[default]
    Provider,
    /// Straight-line estimate used when the provider was unavailable.
    Estimated,
}

/// Travel distance and duration between two points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub distance_km: f64,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Polyline>,
    #[serde(default)]
    pub source: MeasurementSource,
}

impl Measurement {
    pub fn new(distance_km: f64, duration_secs: f64) -> Self {
        Self {
            distance_km,
            duration_secs,
            geometry: None,
            source: MeasurementSource::Provider,
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn with_geometry(mut self, geometry: Polyline) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn estimated(mut self) -> Self {
        self.source = MeasurementSource::Estimated;
        self
    }

    /// The same measurement travelled in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            geometry: self.geometry.as_ref().map(Polyline::reversed),
            ..self.clone()
        }
    }

    pub fn is_usable(&self) -> bool {
        self.distance_km.is_finite()
            && self.distance_km >= 0.0
            && self.duration_secs.is_finite()
            && self.duration_secs >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    NearestNeighbor,
    #[default]
    TwoOpt,
    Mst,
    /// Runs nearest neighbor plus 2-opt and reports the other tours' lengths.
    Compare,
}

/// An ordered visiting sequence produced by the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    stops: Vec<LocationId>,
    closed: bool,
    leg_distances: Vec<Option<f64>>,
    leg_durations: Vec<Option<f64>>,
    total_distance_km: f64,
    total_duration_secs: f64,
    unresolved_legs: usize,
    strategy: Strategy,
    generated_at: u64,
}

impl Route {
    /// Builds a route; `legs` must hold one entry per consecutive pair of
    /// `path()` (including the return leg of a closed route).
    pub fn new(
        stops: Vec<LocationId>,
        closed: bool,
        legs: Vec<Option<(f64, f64)>>,
        strategy: Strategy,
    ) -> Self {
        let leg_distances: Vec<Option<f64>> = legs.iter().map(|leg| leg.map(|(d, _)| d)).collect();
        let leg_durations: Vec<Option<f64>> = legs.iter().map(|leg| leg.map(|(_, t)| t)).collect();
        let total_distance_km = leg_distances.iter().flatten().sum();
        let total_duration_secs = leg_durations.iter().flatten().sum();
        let unresolved_legs = leg_distances.iter().filter(|leg| leg.is_none()).count();

        Self {
            stops,
            closed,
            leg_distances,
            leg_durations,
            total_distance_km,
            total_duration_secs,
            unresolved_legs,
            strategy,
            generated_at: unix_now(),
        }
    }

    /// Visit order, each location once, depot first.
    pub fn stops(&self) -> &[LocationId] {
        &self.stops
    }

    /// Travelled sequence: the stops, plus the depot again for a closed route.
    pub fn path(&self) -> Vec<LocationId> {
        let mut path = self.stops.clone();
        if self.closed && self.stops.len() > 1 {
            path.push(self.stops[0]);
        }
        path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn leg_distances(&self) -> &[Option<f64>] {
        &self.leg_distances
    }

    pub fn leg_durations(&self) -> &[Option<f64>] {
        &self.leg_durations
    }

    pub fn total_distance_km(&self) -> f64 {
        self.total_distance_km
    }

    pub fn total_duration_secs(&self) -> f64 {
        self.total_duration_secs
    }

    /// Number of legs whose distance could not be measured.
    pub fn unresolved_legs(&self) -> usize {
        self.unresolved_legs
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Unix timestamp (seconds) of route construction.
    pub fn generated_at(&self) -> u64 {
        self.generated_at
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}

/// One travel day: a contiguous slice of a route's path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySegment {
    pub day: usize,
    pub stops: Vec<LocationId>,
    pub distance_km: f64,
    pub duration_secs: f64,
    /// The segment exceeds the daily cap because of a single leg.
    pub over_limit: bool,
}

impl DaySegment {
    pub(crate) fn new(day: usize, first: LocationId) -> Self {
        Self {
            day,
            stops: vec![first],
            distance_km: 0.0,
            duration_secs: 0.0,
            over_limit: false,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
