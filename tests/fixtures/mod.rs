//! Test fixtures for tour-planner.
//!
//! Provides realistic test data and mock providers:
//! - Real Polish towns (from OpenStreetMap)
//! - A counting travel provider with scripted failures and latency
//! - A gazetteer geocoder backed by the town list
//! - A fixed-matrix provider for solver tests

#![allow(dead_code)]

pub mod polish_towns;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tour_planner::haversine::HaversineProvider;
use tour_planner::matrix::{DistanceMatrix, MatrixOutcome};
use tour_planner::model::{Coordinates, Location, LocationId, Measurement, TravelMode};
use tour_planner::traits::{DistanceMatrixProvider, Geocoder, ProviderError, TravelProvider};

pub use polish_towns::*;

/// Resolved locations for `places`, numbered from 1 in list order.
pub fn locations(places: &[Place]) -> Vec<Location> {
    places
        .iter()
        .enumerate()
        .map(|(index, place)| Location::resolved(LocationId(index as u32 + 1), place.name, place.lat, place.lon))
        .collect()
}

/// Unresolved locations carrying only the place names.
pub fn addresses(places: &[Place]) -> Vec<Location> {
    places
        .iter()
        .enumerate()
        .map(|(index, place)| Location::unresolved(LocationId(index as u32 + 1), place.name))
        .collect()
}

// ============================================================================
// Travel provider
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behaviour {
    Healthy,
    /// Fails with a 503 this many times before answering.
    FlakyFor(usize),
    /// Never finds a route.
    Unroutable,
}

/// Straight-line travel provider that counts its calls.
pub struct CountingProvider {
    calls: AtomicUsize,
    remaining_failures: AtomicUsize,
    behaviour: Behaviour,
    latency: Duration,
}

impl CountingProvider {
    pub fn new(behaviour: Behaviour) -> Self {
        let remaining = match behaviour {
            Behaviour::FlakyFor(n) => n,
            _ => 0,
        };
        Self {
            calls: AtomicUsize::new(0),
            remaining_failures: AtomicUsize::new(remaining),
            behaviour,
            latency: Duration::ZERO,
        }
    }

    pub fn healthy() -> Self {
        Self::new(Behaviour::Healthy)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TravelProvider for CountingProvider {
    fn measure(&self, from: Coordinates, to: Coordinates, mode: TravelMode) -> Result<Measurement, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        match self.behaviour {
            Behaviour::Unroutable => Err(ProviderError::NotFound("no route between points".to_string())),
            Behaviour::FlakyFor(_) => {
                let failed = self
                    .remaining_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    Err(ProviderError::Server {
                        status: 503,
                        message: "Service Unavailable".to_string(),
                    })
                } else {
                    Ok(HaversineProvider::default().estimate(from, to, mode))
                }
            }
            Behaviour::Healthy => Ok(HaversineProvider::default().estimate(from, to, mode)),
        }
    }
}

// ============================================================================
// Geocoder
// ============================================================================

/// Geocoder that knows the fixture towns and nothing else.
#[derive(Default)]
pub struct Gazetteer {
    calls: AtomicUsize,
}

impl Gazetteer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for Gazetteer {
    fn resolve(&self, address: &str) -> Result<Coordinates, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        find(address)
            .map(|place| Coordinates::new(place.lat, place.lon))
            .ok_or_else(|| ProviderError::NotFound(format!("no match for '{}'", address)))
    }
}

// ============================================================================
// Matrix provider
// ============================================================================

/// Serves a precomputed matrix and counts requests.
pub struct FixedMatrix {
    distance: Box<dyn Fn(usize, usize) -> Option<f64> + Send + Sync>,
    calls: AtomicUsize,
}

impl FixedMatrix {
    pub fn new<F>(distance: F) -> Self
    where
        F: Fn(usize, usize) -> Option<f64> + Send + Sync + 'static,
    {
        Self {
            distance: Box::new(distance),
            calls: AtomicUsize::new(0),
        }
    }

    /// Euclidean distances between planar points, indexed like the
    /// id-sorted locations.
    pub fn planar(points: Vec<(f64, f64)>) -> Self {
        Self::new(move |i, j| {
            let (dx, dy) = (points[i].0 - points[j].0, points[i].1 - points[j].1);
            Some((dx * dx + dy * dy).sqrt())
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DistanceMatrixProvider for FixedMatrix {
    fn matrix_for(&self, locations: &[Location], _mode: TravelMode) -> MatrixOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ids = locations.iter().map(Location::id).collect();
        MatrixOutcome {
            matrix: DistanceMatrix::from_fn(ids, |i, j| (self.distance)(i, j)),
            failures: Vec::new(),
        }
    }
}
