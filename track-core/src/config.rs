//! Process-level configuration, loaded from the environment with the same
//! "parse or fall back to default" posture the reference worker uses for its
//! own env-driven settings — a malformed value never panics the process.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Below this distance, a sample coalesces into its predecessor. Meters.
    pub stop_threshold_meters: f64,
    /// Gap above this since the last processed sample triggers a filter reset. Seconds.
    pub max_last_location_age_seconds: f64,
    /// Trailing window size (including the current point) fed to the map matcher.
    pub osrm_context_points: usize,
    /// Minimum matching confidence required to accept map-matched coordinates.
    pub osrm_min_confidence: f64,
    /// Kalman process noise.
    pub kalman_q: f64,
    /// Kalman measurement noise.
    pub kalman_r: f64,
    /// Parallel job-queue workers.
    pub worker_concurrency: usize,
    /// Job-start rate cap, starts per second, process-wide.
    pub queue_rate_limit: u32,
    /// Base URL of the OSRM-compatible map-matching service.
    pub osrm_base_url: Option<String>,
    /// Bound on a single map-match HTTP call.
    pub osrm_request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stop_threshold_meters: 5.0,
            max_last_location_age_seconds: 300.0,
            osrm_context_points: 10,
            osrm_min_confidence: 0.5,
            kalman_q: 0.001,
            kalman_r: 5.0,
            worker_concurrency: 10,
            queue_rate_limit: 100,
            osrm_base_url: None,
            osrm_request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from the process environment, defaulting any key
    /// that is absent or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stop_threshold_meters: env_f64("STOP_THRESHOLD_METERS", defaults.stop_threshold_meters),
            max_last_location_age_seconds: env_f64(
                "MAX_LAST_LOCATION_AGE_SECONDS",
                defaults.max_last_location_age_seconds,
            ),
            osrm_context_points: env_usize("OSRM_CONTEXT_POINTS", defaults.osrm_context_points),
            osrm_min_confidence: env_f64("OSRM_MIN_CONFIDENCE", defaults.osrm_min_confidence),
            kalman_q: env_f64("KALMAN_Q", defaults.kalman_q),
            kalman_r: env_f64("KALMAN_R", defaults.kalman_r),
            worker_concurrency: env_usize("WORKER_CONCURRENCY", defaults.worker_concurrency),
            queue_rate_limit: env_u32("QUEUE_RATE_LIMIT", defaults.queue_rate_limit),
            osrm_base_url: std::env::var("OSRM_BASE_URL").ok().filter(|s| !s.is_empty()),
            osrm_request_timeout: defaults.osrm_request_timeout,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = Config::default();
        assert_eq!(c.stop_threshold_meters, 5.0);
        assert_eq!(c.max_last_location_age_seconds, 300.0);
        assert_eq!(c.osrm_context_points, 10);
        assert_eq!(c.osrm_min_confidence, 0.5);
        assert_eq!(c.kalman_q, 0.001);
        assert_eq!(c.kalman_r, 5.0);
        assert_eq!(c.worker_concurrency, 10);
        assert_eq!(c.queue_rate_limit, 100);
    }

    #[test]
    fn malformed_env_value_falls_back_to_default() {
        std::env::set_var("KALMAN_Q", "not-a-number");
        let c = Config::from_env();
        assert_eq!(c.kalman_q, 0.001);
        std::env::remove_var("KALMAN_Q");
    }
}
