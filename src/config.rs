//! Planner configuration, loadable from a JSON file.
//!
//! Every section falls back to its production defaults, so a file only needs
//! to mention the values it changes.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::PlannerError;
use crate::geocode::GeocodeConfig;
use crate::nominatim::NominatimConfig;
use crate::oracle::OracleConfig;
use crate::osrm::OsrmConfig;
use crate::solver::SolveOptions;

pub const DEFAULT_MAX_DAILY_DISTANCE_KM: f64 = 1_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub osrm: OsrmConfig,
    pub nominatim: NominatimConfig,
    pub oracle: OracleConfig,
    pub geocode: GeocodeConfig,
    pub cache: CacheConfig,
    pub solve: SolveOptions,
    pub max_daily_distance_km: f64,
    /// Serve geocoding and distances from the cache only.
    pub offline: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            osrm: OsrmConfig::default(),
            nominatim: NominatimConfig::default(),
            oracle: OracleConfig::default(),
            geocode: GeocodeConfig::default(),
            cache: CacheConfig::default(),
            solve: SolveOptions::default(),
            max_daily_distance_km: DEFAULT_MAX_DAILY_DISTANCE_KM,
            offline: false,
        }
    }
}

impl PlannerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, PlannerError> {
        let text = fs::read_to_string(path)
            .map_err(|err| PlannerError::Config(format!("cannot read {}: {}", path.display(), err)))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, PlannerError> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| PlannerError::Config(format!("invalid config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlannerError> {
        if !(self.max_daily_distance_km.is_finite() && self.max_daily_distance_km > 0.0) {
            return Err(PlannerError::Config(format!(
                "max_daily_distance_km must be positive, got {}",
                self.max_daily_distance_km
            )));
        }
        if self.oracle.max_concurrency == 0 {
            return Err(PlannerError::Config("oracle.max_concurrency must be at least 1".to_string()));
        }
        if self.oracle.retry.max_attempts == 0 || self.geocode.retry.max_attempts == 0 {
            return Err(PlannerError::Config("retry max_attempts must be at least 1".to_string()));
        }
        if self.osrm.base_urls.is_empty() {
            return Err(PlannerError::Config("osrm.base_urls is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Strategy, TravelMode};

    #[test]
    fn test_defaults() {
        let config = PlannerConfig::default();
        assert_eq!(config.max_daily_distance_km, 1000.0);
        assert_eq!(config.oracle.max_concurrency, 4);
        assert_eq!(config.oracle.retry.max_attempts, 3);
        assert_eq!(config.geocode.retry.max_attempts, 5);
        assert_eq!(config.osrm.timeout_secs, 45);
        assert_eq!(config.cache.auto_save_every, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = PlannerConfig::from_json_str(
            r#"{
                "max_daily_distance_km": 650,
                "solve": { "strategy": "compare", "mode": "cycling" },
                "oracle": { "direct_fallback": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_daily_distance_km, 650.0);
        assert_eq!(config.solve.strategy, Strategy::Compare);
        assert_eq!(config.solve.mode, TravelMode::Cycling);
        assert!(config.solve.closed);
        assert!(config.oracle.direct_fallback);
        assert!(config.oracle.symmetric);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = PlannerConfig::from_json_str(r#"{ "max_daily_distance_km": -5 }"#).unwrap_err();
        assert!(matches!(err, PlannerError::Config(_)));

        let err = PlannerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, PlannerError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = PlannerConfig::from_json_file(Path::new("/nonexistent/planner.json")).unwrap_err();
        assert!(matches!(err, PlannerError::Config(_)));
    }
}
