//! Tour solver: turns resolved locations into an ordered route.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::error::PlannerError;
use crate::matrix::{DistanceMatrix, LookupFailure};
use crate::model::{Location, LocationId, ResolutionStatus, Route, Strategy, TravelMode};
use crate::traits::DistanceMatrixProvider;
use crate::tsp::{self, TwoOptBudget};

pub const TOUR_NAMESPACE: &str = "tour";
pub const TOUR_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    pub strategy: Strategy,
    /// Fixed first stop. Defaults to the lowest location id.
    pub depot: Option<LocationId>,
    /// Whether the tour returns to the depot at the end.
    pub closed: bool,
    pub mode: TravelMode,
    /// Maximum full 2-opt scans.
    pub max_passes: usize,
    /// Wall-clock bound of the 2-opt phase.
    pub time_budget_secs: Option<u64>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::TwoOpt,
            depot: None,
            closed: true,
            mode: TravelMode::Driving,
            max_passes: 1_000,
            time_budget_secs: Some(300),
        }
    }
}

impl SolveOptions {
    fn budget(&self) -> TwoOptBudget {
        TwoOptBudget {
            max_passes: self.max_passes,
            time_limit: self.time_budget_secs.map(Duration::from_secs),
        }
    }
}

/// A location left out of routing because it has no usable coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedLocation {
    pub id: LocationId,
    pub address: String,
    pub status: ResolutionStatus,
}

/// Tour lengths of every strategy on the same matrix, in kilometers.
///
/// `None` marks a tour that uses an unresolved pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyComparison {
    pub nearest_neighbor_km: Option<f64>,
    pub two_opt_km: Option<f64>,
    pub mst_km: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub route: Route,
    pub excluded: Vec<ExcludedLocation>,
    pub lookup_failures: Vec<LookupFailure>,
    pub comparison: Option<StrategyComparison>,
    /// 2-opt stopped on its budget; the route is best-effort.
    pub budget_exhausted: bool,
}

impl Solution {
    /// The route relies on distances that could not be resolved.
    pub fn is_partial(&self) -> bool {
        self.route.unresolved_legs() > 0 || !self.lookup_failures.is_empty()
    }
}

/// Orders `locations` into a route with the selected strategy.
///
/// Locations without resolved, in-range coordinates are excluded and
/// reported. With
/// fewer than two routable locations the trivial route is returned without
/// querying `provider`. Otherwise the full matrix is obtained first, and
/// only then does construction and improvement begin.
pub fn solve<M>(
    locations: &[Location],
    provider: &M,
    options: &SolveOptions,
) -> Result<Solution, PlannerError>
where
    M: DistanceMatrixProvider,
{
    solve_with_cache(locations, provider, options, None)
}

/// Like [`solve`], but reuses a tour stored in `cache` when the routed
/// coordinates, the matrix and the options are all unchanged.
pub fn solve_cached<M>(
    locations: &[Location],
    provider: &M,
    options: &SolveOptions,
    cache: &CacheStore,
) -> Result<Solution, PlannerError>
where
    M: DistanceMatrixProvider,
{
    solve_with_cache(locations, provider, options, Some(cache))
}

fn solve_with_cache<M>(
    locations: &[Location],
    provider: &M,
    options: &SolveOptions,
    cache: Option<&CacheStore>,
) -> Result<Solution, PlannerError>
where
    M: DistanceMatrixProvider,
{
    let mut seen = HashSet::new();
    for location in locations {
        if !seen.insert(location.id()) {
            return Err(PlannerError::InvalidInput(format!(
                "duplicate location id {}",
                location.id()
            )));
        }
    }

    let (mut routable, unroutable): (Vec<&Location>, Vec<&Location>) =
        locations.iter().partition(|location| location.is_routable());
    routable.sort_by_key(|location| location.id());

    let excluded: Vec<ExcludedLocation> = unroutable
        .iter()
        .map(|location| ExcludedLocation {
            id: location.id(),
            address: location.address().to_string(),
            status: location.status(),
        })
        .collect();
    for location in &excluded {
        warn!(id = %location.id, address = %location.address, "location excluded from routing");
    }

    if let Some(depot) = options.depot {
        if !seen.contains(&depot) {
            return Err(PlannerError::InvalidInput(format!(
                "depot {} is not among the locations",
                depot
            )));
        }
        if excluded.iter().any(|location| location.id == depot) {
            return Err(PlannerError::InvalidInput(format!(
                "depot {} is not routable",
                depot
            )));
        }
    }

    if routable.len() < 2 {
        let stops: Vec<LocationId> = routable.iter().map(|location| location.id()).collect();
        debug!(stops = stops.len(), "trivial route");
        return Ok(Solution {
            route: Route::new(stops, false, Vec::new(), options.strategy),
            excluded,
            lookup_failures: Vec::new(),
            comparison: None,
            budget_exhausted: false,
        });
    }

    let routable: Vec<Location> = routable.into_iter().cloned().collect();
    let outcome = provider.matrix_for(&routable, options.mode);
    let matrix = outcome.matrix;
    let expected: Vec<LocationId> = routable.iter().map(Location::id).collect();
    if matrix.ids() != expected.as_slice() {
        return Err(PlannerError::InvalidInput(
            "distance matrix does not match the requested locations".to_string(),
        ));
    }

    let start = match options.depot {
        Some(depot) => matrix.index_of(depot).unwrap_or(0),
        None => 0,
    };

    let closed = options.closed;
    let key = cache.map(|_| tour_key(&routable, &matrix, options, start));
    let cached = match (cache, &key) {
        (Some(cache), Some(key)) => cache.get::<CachedTour>(key).and_then(|cached| {
            let tour = cached.into_tour(&matrix, start);
            if tour.is_none() {
                warn!(key = %key, "cached tour does not fit the matrix");
                cache.invalidate(key);
            }
            tour
        }),
        _ => None,
    };

    let Tour {
        order: tour,
        comparison,
        budget_exhausted,
    } = match cached {
        Some(tour) => {
            debug!(stops = tour.order.len(), "tour served from cache");
            tour
        }
        None => {
            let tour = compute_tour(&matrix, start, options);
            if let (Some(cache), Some(key)) = (cache, &key) {
                // Budget-limited tours depend on timing and are not reused.
                if !tour.budget_exhausted {
                    let stored = CachedTour::from_tour(&matrix, &tour);
                    if let Err(err) = cache.put(key, &stored, None) {
                        warn!(error = %err, "tour not cached");
                    }
                }
            }
            tour
        }
    };

    if budget_exhausted {
        warn!("2-opt budget exhausted, returning best-effort tour");
    }

    let route = route_from_tour(&matrix, &tour, closed, options.strategy);
    info!(
        stops = route.len(),
        distance_km = route.total_distance_km(),
        unresolved_legs = route.unresolved_legs(),
        strategy = ?options.strategy,
        "route solved"
    );

    Ok(Solution {
        route,
        excluded,
        lookup_failures: outcome.failures,
        comparison,
        budget_exhausted,
    })
}

struct Tour {
    order: Vec<usize>,
    comparison: Option<StrategyComparison>,
    budget_exhausted: bool,
}

/// A finished tour as stored in the cache, by location id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedTour {
    stops: Vec<LocationId>,
    comparison: Option<StrategyComparison>,
}

impl CachedTour {
    fn from_tour(matrix: &DistanceMatrix, tour: &Tour) -> Self {
        Self {
            stops: tour.order.iter().map(|&index| matrix.ids()[index]).collect(),
            comparison: tour.comparison.clone(),
        }
    }

    /// Maps the stored ids back to matrix indices; `None` unless they form a
    /// tour of this matrix starting at `start`.
    fn into_tour(self, matrix: &DistanceMatrix, start: usize) -> Option<Tour> {
        let order = self
            .stops
            .iter()
            .map(|id| matrix.index_of(*id))
            .collect::<Option<Vec<usize>>>()?;
        let distinct: HashSet<usize> = order.iter().copied().collect();
        let complete = order.len() == matrix.len() && distinct.len() == order.len();
        if !complete || order.first() != Some(&start) {
            return None;
        }
        Some(Tour {
            order,
            comparison: self.comparison,
            budget_exhausted: false,
        })
    }
}

/// Cache key of a solved tour: a digest of the routed coordinates, the
/// matrix contents and every option that shapes the result.
fn tour_key(
    routable: &[Location],
    matrix: &DistanceMatrix,
    options: &SolveOptions,
    start: usize,
) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    for location in routable {
        hasher.update(&location.id().0.to_le_bytes());
        if let Some(coordinates) = location.coordinates() {
            hasher.update(coordinates.key().as_bytes());
        }
    }
    for from in 0..matrix.len() {
        for to in 0..matrix.len() {
            hasher.update(&matrix.cost(from, to).to_bits().to_le_bytes());
        }
    }
    let settings = format!(
        "{:?}|{}|{}|{}",
        options.strategy, options.closed, start, options.max_passes
    );
    hasher.update(settings.as_bytes());

    CacheKey::new(TOUR_NAMESPACE, TOUR_SCHEMA_VERSION, hasher.finalize().to_hex().to_string())
}

fn compute_tour(matrix: &DistanceMatrix, start: usize, options: &SolveOptions) -> Tour {
    let closed = options.closed;
    match options.strategy {
        Strategy::NearestNeighbor => Tour {
            order: tsp::nearest_neighbor(matrix, start),
            comparison: None,
            budget_exhausted: false,
        },
        Strategy::Mst => Tour {
            order: tsp::mst_preorder(matrix, start),
            comparison: None,
            budget_exhausted: false,
        },
        Strategy::TwoOpt => {
            let seed = tsp::nearest_neighbor(matrix, start);
            let improved = tsp::two_opt(matrix, seed, closed, options.budget());
            Tour {
                order: improved.tour,
                comparison: None,
                budget_exhausted: improved.exhausted,
            }
        }
        Strategy::Compare => {
            let seed = tsp::nearest_neighbor(matrix, start);
            let nearest_neighbor_km = finite(tsp::tour_length(matrix, &seed, closed));
            let improved = tsp::two_opt(matrix, seed, closed, options.budget());
            let mst = tsp::mst_preorder(matrix, start);

            let report = StrategyComparison {
                nearest_neighbor_km,
                two_opt_km: finite(tsp::tour_length(matrix, &improved.tour, closed)),
                mst_km: finite(tsp::tour_length(matrix, &mst, closed)),
            };
            info!(
                nearest_neighbor_km = ?report.nearest_neighbor_km,
                two_opt_km = ?report.two_opt_km,
                mst_km = ?report.mst_km,
                "strategy comparison"
            );
            Tour {
                order: improved.tour,
                comparison: Some(report),
                budget_exhausted: improved.exhausted,
            }
        }
    }
}

fn route_from_tour(
    matrix: &DistanceMatrix,
    tour: &[usize],
    closed: bool,
    strategy: Strategy,
) -> Route {
    let mut path = tour.to_vec();
    if closed && tour.len() > 1 {
        path.push(tour[0]);
    }

    let legs = path
        .windows(2)
        .map(|leg| {
            matrix
                .get(leg[0], leg[1])
                .map(|measurement| (measurement.distance_km, measurement.duration_secs))
        })
        .collect();
    let stops = tour.iter().map(|&index| matrix.ids()[index]).collect();

    Route::new(stops, closed, legs, strategy)
}

fn finite(length: f64) -> Option<f64> {
    length.is_finite().then_some(length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> DistanceMatrix {
        DistanceMatrix::from_fn(vec![LocationId(1), LocationId(2), LocationId(3)], |_, _| Some(5.0))
    }

    fn cached(stops: &[u32]) -> CachedTour {
        CachedTour {
            stops: stops.iter().copied().map(LocationId).collect(),
            comparison: None,
        }
    }

    #[test]
    fn test_cached_tour_maps_ids_to_indices() {
        let tour = cached(&[1, 3, 2]).into_tour(&matrix(), 0).unwrap();
        assert_eq!(tour.order, vec![0, 2, 1]);
        assert!(!tour.budget_exhausted);
    }

    #[test]
    fn test_cached_tour_must_fit_the_matrix() {
        assert!(cached(&[1, 2, 9]).into_tour(&matrix(), 0).is_none());
        assert!(cached(&[1, 2]).into_tour(&matrix(), 0).is_none());
        assert!(cached(&[1, 2, 2]).into_tour(&matrix(), 0).is_none());
        assert!(cached(&[2, 1, 3]).into_tour(&matrix(), 0).is_none());
    }

    #[test]
    fn test_tour_key_depends_on_options() {
        let locations = vec![
            Location::resolved(LocationId(1), "a", 50.0, 16.0),
            Location::resolved(LocationId(2), "b", 50.1, 16.1),
            Location::resolved(LocationId(3), "c", 50.2, 16.2),
        ];
        let open = SolveOptions {
            closed: false,
            ..SolveOptions::default()
        };

        let key = tour_key(&locations, &matrix(), &SolveOptions::default(), 0);
        assert_eq!(key.namespace(), TOUR_NAMESPACE);
        assert_eq!(key, tour_key(&locations, &matrix(), &SolveOptions::default(), 0));
        assert_ne!(key, tour_key(&locations, &matrix(), &open, 0));
        assert_ne!(key, tour_key(&locations, &matrix(), &SolveOptions::default(), 1));
    }
}
