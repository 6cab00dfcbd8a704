//! Great-circle distance and speed over the WGS-84 sphere.

use crate::model::Coords;

/// Mean Earth radius, meters (WGS-84 spherical approximation).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Haversine great-circle distance between two points, in meters.
/// Symmetric; `distance(a, a) == 0`.
pub fn distance(a: Coords, b: Coords) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();

    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().asin();
    EARTH_RADIUS_METERS * c
}

/// Speed in m/s given a distance and elapsed time. Returns 0 for a
/// non-positive time delta rather than dividing by zero or going negative.
pub fn speed(distance_m: f64, dt_s: f64) -> f64 {
    if dt_s <= 0.0 {
        0.0
    } else {
        distance_m / dt_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn distance_to_self_is_zero() {
        let p = Coords::new(28.6129, 77.2295);
        assert_eq!(distance(p, p), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Coords::new(28.6129, 77.2295);
        let b = Coords::new(28.6132, 77.2298);
        assert_eq!(distance(a, b), distance(b, a));
    }

    #[test]
    fn distance_matches_known_scenario_b() {
        // Scenario B from the spec: ~46 m apart.
        let a = Coords::new(28.6129, 77.2295);
        let b = Coords::new(28.6132, 77.2298);
        let d = distance(a, b);
        assert!((40.0..55.0).contains(&d), "expected ~46m, got {d}");
    }

    #[test]
    fn distance_matches_known_scenario_c() {
        // Scenario C from the spec: ~3 m apart (below stop threshold).
        let a = Coords::new(28.6129, 77.2295);
        let b = Coords::new(28.612915, 77.229512);
        let d = distance(a, b);
        assert!(d < 5.0, "expected <5m, got {d}");
    }

    #[test]
    fn triangle_inequality_holds_within_1m_tolerance() {
        let a = Coords::new(28.6129, 77.2295);
        let b = Coords::new(28.62, 77.24);
        let c = Coords::new(28.63, 77.21);
        let direct = distance(a, c);
        let via_b = distance(a, b) + distance(b, c);
        assert!(direct <= via_b + 1.0);
    }

    #[test]
    fn speed_is_zero_for_nonpositive_dt() {
        assert_eq!(speed(100.0, 0.0), 0.0);
        assert_eq!(speed(100.0, -5.0), 0.0);
    }

    #[test]
    fn speed_divides_distance_by_time() {
        assert_relative_eq!(speed(100.0, 10.0), 10.0);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn symmetric_for_any_points(
                lat1 in -80.0f64..80.0, lon1 in -179.0f64..179.0,
                lat2 in -80.0f64..80.0, lon2 in -179.0f64..179.0,
            ) {
                let a = Coords::new(lat1, lon1);
                let b = Coords::new(lat2, lon2);
                prop_assert!((distance(a, b) - distance(b, a)).abs() < 1e-6);
            }

            #[test]
            fn triangle_inequality_for_nearby_points(
                lat in 10.0f64..50.0, lon in 10.0f64..50.0,
                dlat1 in -0.05f64..0.05, dlon1 in -0.05f64..0.05,
                dlat2 in -0.05f64..0.05, dlon2 in -0.05f64..0.05,
            ) {
                let a = Coords::new(lat, lon);
                let b = Coords::new(lat + dlat1, lon + dlon1);
                let c = Coords::new(lat + dlat1 + dlat2, lon + dlon1 + dlon2);
                let direct = distance(a, c);
                let via_b = distance(a, b) + distance(b, c);
                prop_assert!(direct <= via_b + 1.0);
            }
        }
    }
}
