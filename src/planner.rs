//! End-to-end pipeline: resolve addresses, order the stops, split into days.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{CacheStats, CacheStore};
use crate::config::PlannerConfig;
use crate::error::PlannerError;
use crate::geocode::{GeocodeConfig, ResolutionFailure, Resolver};
use crate::matrix::LookupFailure;
use crate::model::{DaySegment, Location, Route};
use crate::nominatim::NominatimClient;
use crate::oracle::{DistanceOracle, OracleConfig};
use crate::osrm::OsrmClient;
use crate::partition::{self, ConstraintViolation};
use crate::solver::{self, ExcludedLocation, SolveOptions, StrategyComparison};
use crate::traits::{Geocoder, TravelProvider};

/// Everything a renderer needs to present a planned tour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub route: Route,
    pub days: Vec<DaySegment>,
    pub violations: Vec<ConstraintViolation>,
    pub excluded: Vec<ExcludedLocation>,
    pub resolution_failures: Vec<ResolutionFailure>,
    pub lookup_failures: Vec<LookupFailure>,
    pub comparison: Option<StrategyComparison>,
    pub budget_exhausted: bool,
    pub cache: CacheStats,
}

impl Plan {
    /// Some locations or distances could not be resolved.
    pub fn is_partial(&self) -> bool {
        !self.excluded.is_empty() || !self.lookup_failures.is_empty() || self.route.unresolved_legs() > 0
    }
}

pub struct Planner<G, P> {
    resolver: Resolver<G>,
    oracle: DistanceOracle<P>,
    cache: Arc<CacheStore>,
    options: SolveOptions,
    max_daily_distance_km: f64,
}

impl Planner<NominatimClient, OsrmClient> {
    /// Planner backed by Nominatim and OSRM with the file cache described in
    /// `config`.
    pub fn from_config(config: &PlannerConfig) -> Result<Self, PlannerError> {
        config.validate()?;
        let geocoder = NominatimClient::new(config.nominatim.clone())
            .map_err(|err| PlannerError::Config(format!("cannot build geocoding client: {}", err)))?;
        let router = OsrmClient::new(config.osrm.clone())
            .map_err(|err| PlannerError::Config(format!("cannot build routing client: {}", err)))?;
        let cache = Arc::new(CacheStore::open(config.cache.clone())?);
        Self::new(geocoder, router, cache, config)
    }
}

impl<G, P> Planner<G, P>
where
    G: Geocoder,
    P: TravelProvider + Sync,
{
    pub fn new(
        geocoder: G,
        provider: P,
        cache: Arc<CacheStore>,
        config: &PlannerConfig,
    ) -> Result<Self, PlannerError> {
        config.validate()?;
        if config.offline {
            info!("offline mode: answering from the cache only");
        }

        let geocode = GeocodeConfig {
            offline: config.geocode.offline || config.offline,
            ..config.geocode.clone()
        };
        let distances = OracleConfig {
            offline: config.oracle.offline || config.offline,
            ..config.oracle.clone()
        };
        let resolver = Resolver::new(geocoder, Arc::clone(&cache), geocode);
        let oracle = DistanceOracle::new(provider, Arc::clone(&cache), distances)?;
        cache.register_schema(solver::TOUR_NAMESPACE, solver::TOUR_SCHEMA_VERSION);

        Ok(Self {
            resolver,
            oracle,
            cache,
            options: config.solve.clone(),
            max_daily_distance_km: config.max_daily_distance_km,
        })
    }

    pub fn resolver(&self) -> &Resolver<G> {
        &self.resolver
    }

    pub fn oracle(&self) -> &DistanceOracle<P> {
        &self.oracle
    }

    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    /// Resolves, orders and partitions `locations`.
    ///
    /// Unresolvable addresses and pairs do not fail the plan; they are
    /// reported next to the partial result.
    pub fn plan(&self, locations: &[Location]) -> Result<Plan, PlannerError> {
        let resolution = self.resolver.resolve_all(locations);
        let solution =
            solver::solve_cached(&resolution.locations, &self.oracle, &self.options, &self.cache)?;
        let partition = partition::partition(&solution.route, self.max_daily_distance_km)?;

        if let Err(err) = self.cache.flush() {
            warn!(error = %err, "cache save after planning failed");
        }

        info!(
            stops = solution.route.len(),
            days = partition.days.len(),
            distance_km = solution.route.total_distance_km(),
            excluded = solution.excluded.len(),
            "tour planned"
        );

        Ok(Plan {
            route: solution.route,
            days: partition.days,
            violations: partition.violations,
            excluded: solution.excluded,
            resolution_failures: resolution.failures,
            lookup_failures: solution.lookup_failures,
            comparison: solution.comparison,
            budget_exhausted: solution.budget_exhausted,
            cache: self.cache.stats(),
        })
    }
}
