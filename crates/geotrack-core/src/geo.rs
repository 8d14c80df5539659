//! # Geodesy Helpers
//!
//! Distance between two fixes, used by the displacement filter.

/// Mean Earth radius (IUGG), meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance between two WGS84 points, in meters.
///
/// Haversine is accurate to well under 0.5% at any distance, far below the
/// accuracy radius of a consumer GNSS fix.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_point_is_zero() {
        assert_eq!(haversine_m(45.0, 5.0, 45.0, 5.0), 0.0);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn test_short_hop() {
        // ~100 m north
        let d = haversine_m(48.8566, 2.3522, 48.8575, 2.3522);
        assert!((d - 100.0).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_crosses_antimeridian() {
        let d = haversine_m(0.0, 179.9, 0.0, -179.9);
        assert!(d < 25_000.0, "got {d}");
    }
}
