//! Route geometry as a decoded coordinate sequence.
//!
//! Providers hand out geometries in the compact encoded polyline format;
//! they are decoded once at the boundary and cached in decoded form so the
//! map renderer can draw each leg.

use serde::{Deserialize, Serialize};

/// A polyline representing a leg's geometry as (latitude, longitude) points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    points: Vec<(f64, f64)>,
}

impl Polyline {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn into_points(self) -> Vec<(f64, f64)> {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The same geometry walked from its last point to its first.
    pub fn reversed(&self) -> Self {
        let mut points = self.points.clone();
        points.reverse();
        Self { points }
    }

    /// Decodes an encoded polyline with the given precision (5 for OSRM).
    ///
    /// Returns `None` when the input is truncated or contains characters
    /// outside the encoding alphabet.
    pub fn decode(encoded: &str, precision: u32) -> Option<Self> {
        let factor = 10f64.powi(precision as i32);
        let bytes = encoded.as_bytes();
        let mut index = 0;
        let mut lat: i64 = 0;
        let mut lon: i64 = 0;
        let mut points = Vec::new();

        while index < bytes.len() {
            lat += decode_value(bytes, &mut index)?;
            lon += decode_value(bytes, &mut index)?;
            points.push((lat as f64 / factor, lon as f64 / factor));
        }

        Some(Self { points })
    }
}

fn decode_value(bytes: &[u8], index: &mut usize) -> Option<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes.get(*index)?;
        if !(63..127).contains(&byte) {
            return None;
        }
        *index += 1;

        let chunk = (byte - 63) as i64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
        if shift > 60 {
            return None;
        }
    }

    Some(if result & 1 == 1 { !(result >> 1) } else { result >> 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reference_polyline() {
        // Reference example from the encoded polyline format description.
        let polyline = Polyline::decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@", 5).unwrap();
        let expected = [(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)];

        assert_eq!(polyline.points().len(), 3);
        for (actual, expected) in polyline.points().iter().zip(expected.iter()) {
            assert!((actual.0 - expected.0).abs() < 1e-9);
            assert!((actual.1 - expected.1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_decode_truncated_input() {
        assert!(Polyline::decode("_p~iF~ps|", 5).is_none());
    }

    #[test]
    fn test_decode_empty() {
        let polyline = Polyline::decode("", 5).unwrap();
        assert!(polyline.is_empty());
    }

    #[test]
    fn test_reversed() {
        let polyline = Polyline::new(vec![(1.0, 2.0), (3.0, 4.0)]);
        assert_eq!(polyline.reversed().into_points(), vec![(3.0, 4.0), (1.0, 2.0)]);
    }
}
