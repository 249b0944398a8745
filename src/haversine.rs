//! Straight-line travel provider.
//!
//! Uses great-circle distance and an assumed speed to estimate travel time.
//! Less accurate than road routing but always available, so it backs the
//! oracle's fallback mode and offline planning.

use crate::model::{Coordinates, Measurement, TravelMode};
use crate::traits::{ProviderError, TravelProvider};

/// Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone)]
pub struct HaversineProvider {
    pub driving_speed_kmh: f64,
    pub cycling_speed_kmh: f64,
    pub walking_speed_kmh: f64,
}

impl Default for HaversineProvider {
    fn default() -> Self {
        Self {
            driving_speed_kmh: 60.0,
            cycling_speed_kmh: 15.0,
            walking_speed_kmh: 5.0,
        }
    }
}

impl HaversineProvider {
    pub fn new(driving_speed_kmh: f64) -> Self {
        Self {
            driving_speed_kmh,
            ..Self::default()
        }
    }

    fn speed_kmh(&self, mode: TravelMode) -> f64 {
        match mode {
            TravelMode::Driving => self.driving_speed_kmh,
            TravelMode::Cycling => self.cycling_speed_kmh,
            TravelMode::Walking => self.walking_speed_kmh,
        }
    }

    /// Straight-line estimate between two points.
    pub fn estimate(&self, from: Coordinates, to: Coordinates, mode: TravelMode) -> Measurement {
        let km = haversine_km(from, to);
        let speed = self.speed_kmh(mode);
        let seconds = if speed > 0.0 { km / speed * 3600.0 } else { 0.0 };
        Measurement::new(km, seconds.round())
    }
}

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let lat1_rad = from.lat.to_radians();
    let lat2_rad = to.lat.to_radians();
    let delta_lat = (to.lat - from.lat).to_radians();
    let delta_lon = (to.lon - from.lon).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

impl TravelProvider for HaversineProvider {
    fn measure(
        &self,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> Result<Measurement, ProviderError> {
        if !from.is_valid() || !to.is_valid() {
            return Err(ProviderError::InvalidRequest(format!(
                "invalid coordinates {} -> {}",
                from.key(),
                to.key()
            )));
        }
        Ok(self.estimate(from, to, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WARSAW: Coordinates = Coordinates::new(52.2297, 21.0122);
    const KRAKOW: Coordinates = Coordinates::new(50.0647, 19.9450);

    #[test]
    fn test_haversine_same_point() {
        assert!(haversine_km(WARSAW, WARSAW) < 0.001, "Same point should have ~0 distance");
    }

    #[test]
    fn test_haversine_known_distance() {
        // Warsaw to Kraków is roughly 250 km as the crow flies.
        let dist = haversine_km(WARSAW, KRAKOW);
        assert!(dist > 240.0 && dist < 260.0, "Warsaw to Kraków should be ~252km, got {}", dist);
    }

    #[test]
    fn test_haversine_symmetric() {
        assert_eq!(haversine_km(WARSAW, KRAKOW), haversine_km(KRAKOW, WARSAW));
    }

    #[test]
    fn test_reasonable_travel_time() {
        let provider = HaversineProvider::new(40.0);
        let from = Coordinates::new(0.0, 0.0);
        let to = Coordinates::new(0.0, 10.0 / 111.195);
        // ~10 km at 40 km/h = 900 seconds
        let measurement = provider.estimate(from, to, TravelMode::Driving);
        assert!((measurement.duration_secs - 900.0).abs() <= 1.0);
    }

    #[test]
    fn test_rejects_invalid_coordinates() {
        let provider = HaversineProvider::default();
        let result = provider.measure(Coordinates::new(120.0, 0.0), WARSAW, TravelMode::Driving);
        assert!(matches!(result, Err(ProviderError::InvalidRequest(_))));
    }
}
