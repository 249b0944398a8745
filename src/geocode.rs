//! Address resolution with a persistent cache in front of a `Geocoder`.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::error::PlannerError;
use crate::matrix::LookupFailureKind;
use crate::model::{Coordinates, Location, LocationId};
use crate::retry::{RetryError, RetryPolicy};
use crate::traits::{Geocoder, ProviderError};

pub const GEOCODE_NAMESPACE: &str = "geocode";
pub const GEOCODE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub retry: RetryPolicy,
    /// Minimum spacing between two geocoder requests.
    pub min_interval_ms: u64,
    /// TTL of geocode entries; `None` uses the store default.
    pub ttl_secs: Option<u64>,
    /// Resolve from the cache only; uncached addresses fail as unavailable.
    pub offline: bool,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 2_000,
                multiplier: 1.0,
                ..RetryPolicy::default()
            },
            min_interval_ms: 1_000,
            ttl_secs: None,
            offline: false,
        }
    }
}

/// What the cache remembers about an address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum GeocodeRecord {
    Found { lat: f64, lon: f64 },
    NotFound { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    pub id: LocationId,
    pub address: String,
    pub kind: LookupFailureKind,
    pub message: String,
}

/// Outcome of resolving a batch of locations.
///
/// `locations` keeps the input order; entries that could not be resolved
/// come back with `Failed` status and are described in `failures`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub locations: Vec<Location>,
    pub failures: Vec<ResolutionFailure>,
}

impl Resolution {
    pub fn resolved_count(&self) -> usize {
        self.locations.iter().filter(|location| location.is_resolved()).count()
    }
}

/// Lowercases, trims and collapses whitespace so spelling variants of the
/// same address share a cache entry.
pub fn normalize_address(address: &str) -> String {
    address
        .split(',')
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
        .to_lowercase()
}

pub struct Resolver<G> {
    geocoder: G,
    cache: Arc<CacheStore>,
    config: GeocodeConfig,
    last_request: Mutex<Option<Instant>>,
}

impl<G: Geocoder> Resolver<G> {
    pub fn new(geocoder: G, cache: Arc<CacheStore>, config: GeocodeConfig) -> Self {
        cache.register_schema(GEOCODE_NAMESPACE, GEOCODE_SCHEMA_VERSION);
        Self {
            geocoder,
            cache,
            config,
            last_request: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn cache_key(address: &str) -> CacheKey {
        CacheKey::new(GEOCODE_NAMESPACE, GEOCODE_SCHEMA_VERSION, normalize_address(address))
    }

    /// Returns the resolved form of `location`.
    ///
    /// Resolved locations are returned as they are. Addresses the geocoder
    /// reported as unknown are remembered and fail without a new request.
    pub fn resolve(&self, location: &Location) -> Result<Location, PlannerError> {
        if location.is_resolved() {
            return Ok(location.clone());
        }

        let unresolvable = |reason: String| PlannerError::LocationUnresolvable {
            id: Some(location.id()),
            address: location.address().to_string(),
            reason,
        };

        let normalized = normalize_address(location.address());
        if normalized.is_empty() {
            return Err(unresolvable("empty address".to_string()));
        }

        let key = Self::cache_key(location.address());
        let ttl = self.config.ttl_secs.map(Duration::from_secs);
        let record = if self.config.offline {
            self.cache
                .get::<GeocodeRecord>(&key)
                .ok_or_else(|| PlannerError::LookupUnavailable {
                    operation: format!("geocode '{}'", location.address()),
                    attempts: 0,
                    last_error: ProviderError::Transport("offline and not cached".to_string()),
                })?
        } else {
            self.cache
                .get_or_try_insert_with(&key, ttl, || self.lookup(location.address()))?
        };

        match record {
            GeocodeRecord::Found { lat, lon } => {
                let coordinates = Coordinates::new(lat, lon);
                if coordinates.is_valid() {
                    Ok(location.with_coordinates(coordinates))
                } else {
                    Err(unresolvable(format!("invalid coordinates {}", coordinates.key())))
                }
            }
            GeocodeRecord::NotFound { reason } => Err(unresolvable(reason)),
        }
    }

    /// Resolves every location in order, one request at a time.
    pub fn resolve_all(&self, locations: &[Location]) -> Resolution {
        let mut resolution = Resolution::default();

        for location in locations {
            match self.resolve(location) {
                Ok(resolved) => resolution.locations.push(resolved),
                Err(err) => {
                    warn!(id = %location.id(), address = location.address(), error = %err, "address not resolved");
                    let kind = if err.is_unavailable() {
                        LookupFailureKind::Unavailable
                    } else {
                        LookupFailureKind::Unresolvable
                    };
                    resolution.failures.push(ResolutionFailure {
                        id: location.id(),
                        address: location.address().to_string(),
                        kind,
                        message: err.to_string(),
                    });
                    resolution.locations.push(location.clone().into_failed());
                }
            }
        }

        info!(
            locations = locations.len(),
            resolved = resolution.resolved_count(),
            failed = resolution.failures.len(),
            "addresses resolved"
        );
        resolution
    }

    fn lookup(&self, address: &str) -> Result<GeocodeRecord, PlannerError> {
        let operation = format!("geocode '{}'", address);
        debug!(operation = %operation, "geocode cache miss");

        let outcome = self.config.retry.run(&operation, |_| {
            self.pace();
            self.geocoder.resolve(address)
        });

        match outcome {
            Ok(coordinates) => Ok(GeocodeRecord::Found {
                lat: coordinates.lat,
                lon: coordinates.lon,
            }),
            Err(RetryError::Permanent(ProviderError::NotFound(reason))) => Ok(GeocodeRecord::NotFound { reason }),
            Err(RetryError::Permanent(err)) => Err(PlannerError::LocationUnresolvable {
                id: None,
                address: address.to_string(),
                reason: err.to_string(),
            }),
            Err(RetryError::Exhausted { attempts, last_error }) => Err(PlannerError::LookupUnavailable {
                operation,
                attempts,
                last_error,
            }),
        }
    }

    /// Sleeps until `min_interval_ms` has passed since the previous request.
    fn pace(&self) {
        let interval = Duration::from_millis(self.config.min_interval_ms);
        let mut last = self.last_request.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gazetteer {
        calls: AtomicUsize,
    }

    impl Geocoder for Gazetteer {
        fn resolve(&self, address: &str) -> Result<Coordinates, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match address.trim().to_lowercase().as_str() {
                "kłodzko" => Ok(Coordinates::new(50.4346, 16.6614)),
                _ => Err(ProviderError::NotFound(format!("no match for '{}'", address))),
            }
        }
    }

    fn resolver() -> Resolver<Gazetteer> {
        let config = GeocodeConfig {
            retry: RetryPolicy::immediate(3),
            min_interval_ms: 0,
            ttl_secs: None,
            offline: false,
        };
        let gazetteer = Gazetteer {
            calls: AtomicUsize::new(0),
        };
        Resolver::new(gazetteer, Arc::new(CacheStore::in_memory()), config)
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("  Rynek 1 ,Kłodzko  "), "rynek 1, kłodzko");
        assert_eq!(normalize_address("RYNEK   1,  KŁODZKO"), "rynek 1, kłodzko");
        assert_eq!(normalize_address(" , "), "");
    }

    #[test]
    fn test_resolves_and_caches() {
        let resolver = resolver();
        let location = Location::unresolved(LocationId(1), "Kłodzko");

        let first = resolver.resolve(&location).unwrap();
        let second = resolver.resolve(&Location::unresolved(LocationId(2), " KŁODZKO ")).unwrap();

        assert!(first.is_resolved());
        assert_eq!(first.coordinates(), second.coordinates());
        assert_eq!(resolver.geocoder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_found_is_remembered() {
        let resolver = resolver();
        let location = Location::unresolved(LocationId(1), "Atlantis");

        assert!(resolver.resolve(&location).unwrap_err().is_unresolvable());
        assert!(resolver.resolve(&location).unwrap_err().is_unresolvable());
        assert_eq!(resolver.geocoder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolved_location_is_not_queried() {
        let resolver = resolver();
        let location = Location::resolved(LocationId(1), "Atlantis", 10.0, 10.0);
        assert_eq!(resolver.resolve(&location).unwrap(), location);
        assert_eq!(resolver.geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolve_all_keeps_order_and_reports_failures() {
        let resolver = resolver();
        let locations = vec![
            Location::unresolved(LocationId(3), "Atlantis"),
            Location::unresolved(LocationId(1), "Kłodzko"),
            Location::unresolved(LocationId(2), "   "),
        ];

        let resolution = resolver.resolve_all(&locations);
        let ids: Vec<LocationId> = resolution.locations.iter().map(Location::id).collect();
        assert_eq!(ids, vec![LocationId(3), LocationId(1), LocationId(2)]);
        assert_eq!(resolution.resolved_count(), 1);
        assert_eq!(resolution.failures.len(), 2);
        assert!(resolution
            .failures
            .iter()
            .all(|failure| failure.kind == LookupFailureKind::Unresolvable));
    }

    #[test]
    fn test_offline_resolves_only_from_cache() {
        let online = resolver();
        online.resolve(&Location::unresolved(LocationId(1), "Kłodzko")).unwrap();

        let offline = Resolver::new(
            Gazetteer {
                calls: AtomicUsize::new(0),
            },
            Arc::clone(&online.cache),
            GeocodeConfig {
                offline: true,
                ..online.config.clone()
            },
        );

        let known = offline.resolve(&Location::unresolved(LocationId(1), "kłodzko")).unwrap();
        assert!(known.is_resolved());
        let unknown = offline.resolve(&Location::unresolved(LocationId(2), "Nysa")).unwrap_err();
        assert!(unknown.is_unavailable());
        assert_eq!(offline.geocoder.calls.load(Ordering::SeqCst), 0);
    }
}
