mod fixtures;

use std::sync::Arc;

use fixtures::{addresses, CountingProvider, Gazetteer, CITIES, KLODZKO_VALLEY};
use tempfile::TempDir;
use tour_planner::cache::{CacheConfig, CacheStore};
use tour_planner::config::PlannerConfig;
use tour_planner::geocode::GeocodeConfig;
use tour_planner::model::{Location, LocationId, Strategy};
use tour_planner::planner::Planner;
use tour_planner::retry::RetryPolicy;

fn test_config() -> PlannerConfig {
    let mut config = PlannerConfig::default();
    config.geocode = GeocodeConfig {
        retry: RetryPolicy::immediate(2),
        min_interval_ms: 0,
        ttl_secs: None,
        offline: false,
    };
    config.oracle.retry = RetryPolicy::immediate(2);
    config.cache = CacheConfig::in_memory();
    config
}

#[test]
fn smoke_plan_across_poland() {
    let config = test_config();
    let provider = CountingProvider::healthy();
    let planner = Planner::new(Gazetteer::default(), &provider, Arc::new(CacheStore::in_memory()), &config).unwrap();

    let mut stops = addresses(CITIES);
    stops.push(Location::unresolved(LocationId(99), "Atlantis"));

    let plan = planner.plan(&stops).unwrap();

    assert_eq!(plan.route.len(), CITIES.len());
    assert_eq!(plan.excluded.len(), 1);
    assert_eq!(plan.excluded[0].id, LocationId(99));
    assert_eq!(plan.resolution_failures.len(), 1);
    assert!(plan.lookup_failures.is_empty());

    // A closed tour of the country does not fit in one 1000 km day.
    assert!(plan.route.total_distance_km() > 1000.0);
    assert!(plan.days.len() >= 2);
    assert!(plan.violations.is_empty());
    let walked: Vec<LocationId> = plan.days.iter().flat_map(|day| day.stops.iter().copied()).collect();
    assert_eq!(walked, plan.route.path());

    let n = CITIES.len();
    assert_eq!(provider.calls(), n * (n - 1) / 2);
}

#[test]
fn smoke_second_plan_is_served_from_cache() {
    let config = test_config();
    let provider = CountingProvider::healthy();
    let geocoder = Gazetteer::default();
    let planner = Planner::new(&geocoder, &provider, Arc::new(CacheStore::in_memory()), &config).unwrap();

    let stops = addresses(KLODZKO_VALLEY);
    let first = planner.plan(&stops).unwrap();
    let (geocodes, lookups) = (geocoder.calls(), provider.calls());
    let second = planner.plan(&stops).unwrap();

    assert_eq!(geocoder.calls(), geocodes);
    assert_eq!(provider.calls(), lookups);
    assert_eq!(first.route.stops(), second.route.stops());
    assert_eq!(second.days.len(), 1);
    assert!(second.cache.hits > 0);
}

#[test]
fn smoke_cache_persists_between_runs() {
    let dir = TempDir::new().unwrap();
    let config = test_config();
    let stops = addresses(KLODZKO_VALLEY);

    let geocoder = Gazetteer::default();
    {
        let cache = Arc::new(CacheStore::open(CacheConfig::in_dir(dir.path())).unwrap());
        let planner = Planner::new(&geocoder, CountingProvider::healthy(), cache, &config).unwrap();
        planner.plan(&stops).unwrap();
    }
    assert_eq!(geocoder.calls(), KLODZKO_VALLEY.len());

    let provider = CountingProvider::healthy();
    let cache = Arc::new(CacheStore::open(CacheConfig::in_dir(dir.path())).unwrap());
    let planner = Planner::new(&geocoder, &provider, cache, &config).unwrap();
    let plan = planner.plan(&stops).unwrap();

    assert_eq!(geocoder.calls(), KLODZKO_VALLEY.len());
    assert_eq!(provider.calls(), 0);
    assert_eq!(plan.route.len(), KLODZKO_VALLEY.len());
}

#[test]
fn smoke_compare_strategy_report() {
    let mut config = test_config();
    config.solve.strategy = Strategy::Compare;
    let planner = Planner::new(
        Gazetteer::default(),
        CountingProvider::healthy(),
        Arc::new(CacheStore::in_memory()),
        &config,
    )
    .unwrap();

    let plan = planner.plan(&addresses(CITIES)).unwrap();
    let comparison = plan.comparison.clone().unwrap();
    assert!(comparison.two_opt_km.unwrap() <= comparison.nearest_neighbor_km.unwrap() + 1e-9);
    assert!(comparison.mst_km.is_some());

    let json = serde_json::to_string(&plan).unwrap();
    assert!(json.contains("\"comparison\""));
}

#[test]
fn smoke_offline_plan_uses_only_the_cache() {
    let dir = TempDir::new().unwrap();
    let stops = addresses(KLODZKO_VALLEY);
    {
        let cache = Arc::new(CacheStore::open(CacheConfig::in_dir(dir.path())).unwrap());
        let planner =
            Planner::new(Gazetteer::default(), CountingProvider::healthy(), cache, &test_config())
                .unwrap();
        planner.plan(&stops).unwrap();
    }

    let mut config = test_config();
    config.offline = true;
    let geocoder = Gazetteer::default();
    let provider = CountingProvider::healthy();
    let cache = Arc::new(CacheStore::open(CacheConfig::in_dir(dir.path())).unwrap());
    let planner = Planner::new(&geocoder, &provider, cache, &config).unwrap();

    let mut extended = stops.clone();
    extended.push(Location::unresolved(LocationId(99), "Nysa"));
    let plan = planner.plan(&extended).unwrap();

    assert_eq!(plan.route.len(), KLODZKO_VALLEY.len());
    assert_eq!(plan.excluded.len(), 1);
    assert_eq!(plan.resolution_failures.len(), 1);
    assert_eq!(geocoder.calls(), 0);
    assert_eq!(provider.calls(), 0);
}
