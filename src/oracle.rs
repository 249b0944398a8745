//! Distance oracle: cached, retried travel measurements between locations.

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::error::PlannerError;
use crate::haversine::HaversineProvider;
use crate::matrix::{DistanceMatrix, LookupFailure, MatrixOutcome};
use crate::model::{Coordinates, Location, Measurement, TravelMode};
use crate::retry::{RetryError, RetryPolicy};
use crate::traits::{DistanceMatrixProvider, ProviderError, TravelProvider};

pub const DISTANCE_NAMESPACE: &str = "distance";
pub const DISTANCE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Treat A→B and B→A as the same measurement (one lookup, one entry).
    pub symmetric: bool,
    /// Upper bound on parallel provider lookups during matrix population.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Replace exhausted lookups with a flagged straight-line estimate.
    pub direct_fallback: bool,
    /// TTL of distance entries; `None` uses the store default.
    pub ttl_secs: Option<u64>,
    /// Answer from the cache only; a miss is unavailable and the provider is
    /// never called.
    pub offline: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            symmetric: true,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            direct_fallback: false,
            ttl_secs: None,
            offline: false,
        }
    }
}

pub struct DistanceOracle<P> {
    provider: P,
    cache: Arc<CacheStore>,
    config: OracleConfig,
    fallback: HaversineProvider,
    pool: rayon::ThreadPool,
}

impl<P: TravelProvider> DistanceOracle<P> {
    pub fn new(
        provider: P,
        cache: Arc<CacheStore>,
        config: OracleConfig,
    ) -> Result<Self, PlannerError> {
        cache.register_schema(DISTANCE_NAMESPACE, DISTANCE_SCHEMA_VERSION);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency.max(1))
            .thread_name(|index| format!("distance-worker-{}", index))
            .build()?;

        Ok(Self {
            provider,
            cache,
            config,
            fallback: HaversineProvider::default(),
            pool,
        })
    }

    pub fn with_fallback(mut self, fallback: HaversineProvider) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Cache key of a lookup, and whether the key stores the pair in the
    /// opposite direction.
    ///
    /// With the symmetric policy the two coordinates are ordered before the
    /// key is built so both directions share one entry.
    pub fn cache_key(
        &self,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> (CacheKey, bool) {
        let (from_key, to_key) = (from.key(), to.key());
        let reversed = self.config.symmetric && from_key > to_key;
        let (first, second) = if reversed {
            (to_key, from_key)
        } else {
            (from_key, to_key)
        };
        let key = CacheKey::new(
            DISTANCE_NAMESPACE,
            DISTANCE_SCHEMA_VERSION,
            format!("{}/{}|{}", mode.as_str(), first, second),
        );
        (key, reversed)
    }

    /// Travel distance and duration from `a` to `b`.
    ///
    /// Served from the cache when possible; a miss calls the provider under
    /// the retry policy and stores the result before returning it. In
    /// offline mode a miss fails as unavailable instead.
    pub fn distance(
        &self,
        a: &Location,
        b: &Location,
        mode: TravelMode,
    ) -> Result<Measurement, PlannerError> {
        let from = resolved_coordinates(a)?;
        let to = resolved_coordinates(b)?;

        if a.id() == b.id() || from == to {
            return Ok(Measurement::zero());
        }

        let (key, reversed) = self.cache_key(from, to, mode);
        let (query_from, query_to) = if reversed { (to, from) } else { (from, to) };
        let ttl = self.config.ttl_secs.map(Duration::from_secs);

        let result = if self.config.offline {
            self.cache
                .get::<Measurement>(&key)
                .ok_or_else(|| PlannerError::LookupUnavailable {
                    operation: format!("distance {} -> {}", a.id(), b.id()),
                    attempts: 0,
                    last_error: ProviderError::Transport("offline and not cached".to_string()),
                })
        } else {
            self.cache
                .get_or_try_insert_with(&key, ttl, || self.lookup(a, b, query_from, query_to, mode))
        };

        match result {
            Ok(measurement) if reversed => Ok(measurement.reversed()),
            Ok(measurement) => Ok(measurement),
            Err(err) if err.is_unavailable() && self.config.direct_fallback => {
                warn!(from = %a.id(), to = %b.id(), error = %err, "using straight-line estimate");
                Ok(self.fallback.estimate(from, to, mode).estimated())
            }
            Err(err) => Err(err),
        }
    }

    fn lookup(
        &self,
        a: &Location,
        b: &Location,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> Result<Measurement, PlannerError> {
        let operation = format!("distance {} -> {}", a.id(), b.id());
        debug!(operation = %operation, mode = mode.as_str(), "distance cache miss");

        let outcome = self.config.retry.run(&operation, |_| {
            let measurement = self.provider.measure(from, to, mode)?;
            if measurement.is_usable() {
                Ok(measurement)
            } else {
                Err(ProviderError::InvalidRequest(format!(
                    "unusable measurement {:?}",
                    measurement
                )))
            }
        });

        outcome.map_err(|err| match err {
            RetryError::Permanent(last_error) => PlannerError::LocationUnresolvable {
                id: None,
                address: format!("{} -> {}", a.address(), b.address()),
                reason: last_error.to_string(),
            },
            RetryError::Exhausted { attempts, last_error } => PlannerError::LookupUnavailable {
                operation,
                attempts,
                last_error,
            },
        })
    }
}

impl<P: TravelProvider + Sync> DistanceOracle<P> {
    /// Measures every required pair of `locations`, in parallel up to
    /// `max_concurrency` lookups.
    ///
    /// Returns only after every lookup has finished. Failed pairs stay empty
    /// in the matrix and are listed in the outcome.
    pub fn matrix(&self, locations: &[Location], mode: TravelMode) -> MatrixOutcome {
        let n = locations.len();
        let symmetric = self.config.symmetric;
        let mut matrix = DistanceMatrix::new(locations.iter().map(Location::id).collect(), symmetric);

        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .filter(|&(i, j)| if symmetric { i < j } else { i != j })
            .collect();

        let results: Vec<(usize, usize, Result<Measurement, PlannerError>)> = self.pool.install(|| {
            pairs
                .par_iter()
                .map(|&(i, j)| (i, j, self.distance(&locations[i], &locations[j], mode)))
                .collect()
        });

        let mut failures = Vec::new();
        for (i, j, result) in results {
            let inserted = result.and_then(|measurement| matrix.insert(i, j, measurement));
            if let Err(err) = inserted {
                failures.push(LookupFailure::from_error(locations[i].id(), locations[j].id(), &err));
            }
        }

        if failures.is_empty() {
            info!(locations = n, lookups = pairs.len(), "distance matrix complete");
        } else {
            warn!(
                locations = n,
                lookups = pairs.len(),
                failed = failures.len(),
                "distance matrix is partial"
            );
        }

        MatrixOutcome { matrix, failures }
    }
}

impl<P: TravelProvider + Sync> DistanceMatrixProvider for DistanceOracle<P> {
    fn matrix_for(&self, locations: &[Location], mode: TravelMode) -> MatrixOutcome {
        self.matrix(locations, mode)
    }
}

fn resolved_coordinates(location: &Location) -> Result<Coordinates, PlannerError> {
    let coordinates = location
        .coordinates()
        .ok_or_else(|| PlannerError::LocationUnresolvable {
            id: Some(location.id()),
            address: location.address().to_string(),
            reason: "location has no resolved coordinates".to_string(),
        })?;

    if coordinates.is_valid() {
        Ok(coordinates)
    } else {
        Err(PlannerError::LocationUnresolvable {
            id: Some(location.id()),
            address: location.address().to_string(),
            reason: format!("invalid coordinates {}", coordinates.key()),
        })
    }
}
