//! Real Polish towns for realistic test fixtures.
//!
//! Coordinates are town centres taken from OpenStreetMap.

/// A named place with coordinates.
#[derive(Debug, Clone)]
pub struct Place {
    pub name: &'static str,
    pub lat: f64,
    pub lon: f64,
}

impl Place {
    pub const fn new(name: &'static str, lat: f64, lon: f64) -> Self {
        Self { name, lat, lon }
    }
}

// ============================================================================
// Kłodzko Valley (short legs, fits in one day)
// ============================================================================

pub const KLODZKO_VALLEY: &[Place] = &[
    Place::new("Kłodzko", 50.4346, 16.6614),
    Place::new("Nowa Ruda", 50.5800, 16.5014),
    Place::new("Polanica-Zdrój", 50.4083, 16.5131),
    Place::new("Kudowa-Zdrój", 50.4430, 16.2431),
    Place::new("Bystrzyca Kłodzka", 50.2980, 16.6519),
    Place::new("Lądek-Zdrój", 50.3445, 16.8797),
];

// ============================================================================
// Major cities (long legs, several days under a 1000 km cap)
// ============================================================================

pub const CITIES: &[Place] = &[
    Place::new("Warszawa", 52.2297, 21.0122),
    Place::new("Kraków", 50.0647, 19.9450),
    Place::new("Wrocław", 51.1079, 17.0385),
    Place::new("Poznań", 52.4064, 16.9252),
    Place::new("Gdańsk", 54.3520, 18.6466),
    Place::new("Szczecin", 53.4285, 14.5528),
    Place::new("Białystok", 53.1325, 23.1688),
    Place::new("Rzeszów", 50.0412, 21.9991),
];

pub fn find(name: &str) -> Option<&'static Place> {
    KLODZKO_VALLEY
        .iter()
        .chain(CITIES.iter())
        .find(|place| place.name.to_lowercase() == name.trim().to_lowercase())
}
