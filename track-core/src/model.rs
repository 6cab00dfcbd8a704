//! The data model shared by every stage of the pipeline: `RawSample` as
//! received, `ProcessedSample` as emitted, and the coordinate/metadata types
//! threaded between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque device identity. All per-device state (Kalman, storage ordering)
/// is keyed by this.
pub type DeviceId = String;

/// Opaque trip identity, resolved upstream of the core and passed through.
pub type TripId = String;

/// A point on the WGS-84 sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lon: f64,
}

impl Coords {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True if either component is outside its valid range or non-finite.
    pub fn is_invalid(&self) -> bool {
        !self.lat.is_finite()
            || !self.lon.is_finite()
            || !(-90.0..=90.0).contains(&self.lat)
            || !(-180.0..=180.0).contains(&self.lon)
    }
}

/// Pass-through, mostly-opaque metadata attached to a raw sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

/// An as-received GPS measurement. Written once at ingestion, read once by
/// the processor, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub id: Uuid,
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<TripId>,
    pub timestamp: DateTime<Utc>,
    pub coords: Coords,
    #[serde(default)]
    pub metadata: RawMetadata,
}

/// How a processed sample's coordinates were derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    /// The device's very first sample — coords are the raw, unsmoothed values.
    RawFirst,
    /// Kalman-smoothed; map-matching was skipped, declined, or not confident enough.
    Kalman,
    /// Map-matched onto the road network at or above the confidence gate.
    Osrm,
    /// Map-matching errored; fell back to the Kalman-smoothed estimate.
    KalmanFallback,
}

/// Metadata derived by the processor and attached to an emitted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMetadata {
    pub distance: f64,
    pub time_diff_seconds: f64,
    pub speed: f64,
    pub processing_method: ProcessingMethod,
    pub matching_confidence: f64,
    pub processed_at: DateTime<Utc>,
    pub raw_sample_id: Uuid,
    /// Set and advanced only on stop-coalesced samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_count: Option<u64>,
}

/// An emitted, cleaned, road-snapped measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedSample {
    pub id: Uuid,
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<TripId>,
    pub timestamp: DateTime<Utc>,
    pub coords: Coords,
    pub metadata: ProcessedMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_sample_omits_absent_optional_fields_on_the_wire() {
        let sample = ProcessedSample {
            id: Uuid::new_v4(),
            device_id: "device-1".to_string(),
            trip_id: None,
            timestamp: Utc::now(),
            coords: Coords::new(28.6129, 77.2295),
            metadata: ProcessedMetadata {
                distance: 12.5,
                time_diff_seconds: 5.0,
                speed: 2.5,
                processing_method: ProcessingMethod::Kalman,
                matching_confidence: 0.0,
                processed_at: Utc::now(),
                raw_sample_id: Uuid::new_v4(),
                last_seen: None,
                stop_count: None,
            },
        };

        let json = serde_json::to_value(&sample).unwrap();
        assert!(json.get("trip_id").is_none());
        assert!(json["metadata"].get("last_seen").is_none());

        let round_tripped: ProcessedSample = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped.coords, sample.coords);
    }
}
