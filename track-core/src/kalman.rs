//! Per-device Kalman smoother.
//!
//! Models latitude and longitude as two independent 1-D random walks, sharing
//! a single scalar error covariance per device. State lives in a concurrent
//! per-device map — jobs for distinct devices never contend with each other
//! here, only same-device jobs serialize on their one entry.
//!
//! Not durable by design: a process restart behaves exactly like a
//! staleness-triggered reset for every device.

use dashmap::DashMap;

use crate::model::{Coords, DeviceId};

#[derive(Debug, Clone, Copy)]
struct AxisState {
    lat: f64,
    lon: f64,
    /// Shared scalar error covariance for both axes.
    p: f64,
}

/// Tunable noise parameters for the smoother.
#[derive(Debug, Clone, Copy)]
pub struct KalmanParams {
    /// Process noise.
    pub q: f64,
    /// Measurement noise.
    pub r: f64,
}

impl Default for KalmanParams {
    fn default() -> Self {
        Self { q: 0.001, r: 5.0 }
    }
}

/// A concurrent map of per-device Kalman state.
pub struct KalmanSmoother {
    params: KalmanParams,
    state: DashMap<DeviceId, AxisState>,
}

impl KalmanSmoother {
    pub fn new(params: KalmanParams) -> Self {
        Self {
            params,
            state: DashMap::new(),
        }
    }

    /// Smooth one observation for `device_id`.
    ///
    /// The first call for a device initializes state to the observation
    /// unchanged (no smoothing yet) with `P := 1.0`. Every subsequent call
    /// predicts, computes the Kalman gain, and updates both the estimate and
    /// the shared covariance once.
    pub fn filter(&self, device_id: &str, z: Coords) -> Coords {
        use dashmap::mapref::entry::Entry;

        match self.state.entry(device_id.to_string()) {
            Entry::Vacant(slot) => {
                // First observation for this device: nothing to smooth against yet.
                slot.insert(AxisState { lat: z.lat, lon: z.lon, p: 1.0 });
                z
            }
            Entry::Occupied(mut slot) => {
                let prev = *slot.get();
                let p_pred = prev.p + self.params.q;
                let k = p_pred / (p_pred + self.params.r);

                let new_lat = prev.lat + k * (z.lat - prev.lat);
                let new_lon = prev.lon + k * (z.lon - prev.lon);
                let new_p = (1.0 - k) * p_pred;

                *slot.get_mut() = AxisState {
                    lat: new_lat,
                    lon: new_lon,
                    p: new_p,
                };

                Coords::new(new_lat, new_lon)
            }
        }
    }

    /// Discard state for one device. The next `filter` call for it behaves
    /// exactly like a first observation.
    pub fn reset(&self, device_id: &str) {
        self.state.remove(device_id);
    }

    /// Discard all device state.
    pub fn clear_all(&self) {
        self.state.clear();
    }
}

impl Default for KalmanSmoother {
    fn default() -> Self {
        Self::new(KalmanParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn first_observation_is_returned_unchanged() {
        let s = KalmanSmoother::default();
        let z = Coords::new(28.6129, 77.2295);
        let out = s.filter("device-1", z);
        assert_eq!(out, z);
    }

    #[test]
    fn second_observation_is_smoothed_toward_measurement() {
        let s = KalmanSmoother::default();
        s.filter("device-1", Coords::new(28.6129, 77.2295));
        let out = s.filter("device-1", Coords::new(28.6132, 77.2298));

        // Smoothed estimate should lie strictly between the two observations
        // on each axis (a random-walk Kalman update never overshoots).
        assert!(out.lat > 28.6129 && out.lat < 28.6132);
        assert!(out.lon > 77.2295 && out.lon < 77.2298);
    }

    #[test]
    fn reset_makes_next_filter_behave_as_first() {
        let s = KalmanSmoother::default();
        s.filter("device-1", Coords::new(28.6129, 77.2295));
        s.reset("device-1");

        let z = Coords::new(12.0, 34.0);
        let out = s.filter("device-1", z);
        assert_eq!(out, z);
    }

    #[test]
    fn devices_are_independent() {
        let s = KalmanSmoother::default();
        s.filter("device-a", Coords::new(10.0, 10.0));
        let out_b = s.filter("device-b", Coords::new(20.0, 20.0));
        assert_eq!(out_b, Coords::new(20.0, 20.0));
    }

    #[test]
    fn identical_sequences_are_deterministic() {
        let s1 = KalmanSmoother::default();
        let s2 = KalmanSmoother::default();
        let obs = [
            Coords::new(28.6129, 77.2295),
            Coords::new(28.6132, 77.2298),
            Coords::new(28.6140, 77.2310),
        ];
        for o in obs {
            let a = s1.filter("d", o);
            let b = s2.filter("d", o);
            assert_relative_eq!(a.lat, b.lat);
            assert_relative_eq!(a.lon, b.lon);
        }
    }

    #[test]
    fn clear_all_resets_every_device() {
        let s = KalmanSmoother::default();
        s.filter("device-a", Coords::new(10.0, 10.0));
        s.filter("device-b", Coords::new(20.0, 20.0));
        s.clear_all();

        let z = Coords::new(1.0, 1.0);
        assert_eq!(s.filter("device-a", z), z);
    }
}
