//! The track processor: the per-job state machine that turns one raw sample
//! into zero or one processed samples.
//!
//! Invoked once per job by the queue with a `rawSampleId`. Jobs for distinct
//! devices may run fully in parallel; jobs for the same device may race —
//! this is tolerated, not locked against. Each run classifies strictly
//! against whatever `findLatestProcessed` returns at the moment it reads it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ProcessorError;
use crate::geo;
use crate::kalman::KalmanSmoother;
use crate::mapmatch::{MapMatcher, MatchInput};
use crate::model::{ProcessedMetadata, ProcessedSample, ProcessingMethod};
use crate::queue::{JobFailure, JobHandler};
use crate::store::SampleStore;

/// Ties the three capability ports together into the classification
/// algorithm. Holds no per-job state of its own beyond the shared Kalman map.
pub struct TrackProcessor {
    store: Arc<dyn SampleStore>,
    matcher: Arc<dyn MapMatcher>,
    kalman: Arc<KalmanSmoother>,
    config: Config,
}

impl TrackProcessor {
    pub fn new(
        store: Arc<dyn SampleStore>,
        matcher: Arc<dyn MapMatcher>,
        kalman: Arc<KalmanSmoother>,
        config: Config,
    ) -> Self {
        Self { store, matcher, kalman, config }
    }

    /// Run the classification algorithm for one raw sample. Idempotent
    /// enough to tolerate at-least-once delivery: a re-run against an
    /// unchanged device head reclassifies the same way.
    pub async fn process(&self, raw_sample_id: Uuid) -> Result<(), ProcessorError> {
        let raw = self
            .store
            .get_raw(raw_sample_id)
            .await?
            .ok_or(ProcessorError::SampleNotFound(raw_sample_id))?;

        if raw.coords.is_invalid() {
            return Err(ProcessorError::InvariantViolation(format!(
                "raw sample {} has invalid coords {:?}",
                raw.id, raw.coords
            )));
        }

        let last = self.store.find_latest_processed(&raw.device_id).await?;

        let Some(last) = last else {
            self.emit_first_point(&raw).await?;
            return Ok(());
        };

        let delta_t = (raw.timestamp - last.timestamp).num_milliseconds() as f64 / 1000.0;

        if delta_t < 0.0 {
            debug!(device_id = %raw.device_id, raw_sample_id = %raw_sample_id, "out-of-order sample skipped");
            return Ok(());
        }

        let age_since_last = (Utc::now() - last.timestamp).num_milliseconds() as f64 / 1000.0;
        if age_since_last > self.config.max_last_location_age_seconds {
            self.emit_stale_gap(&raw, &last, delta_t).await?;
            return Ok(());
        }

        let d = geo::distance(last.coords, raw.coords);

        if d < self.config.stop_threshold_meters {
            self.store
                .update_processed_metadata(last.id, raw.timestamp, 1)
                .await?;
            debug!(device_id = %raw.device_id, last_id = %last.id, "stop-coalesced");
            return Ok(());
        }

        self.emit_move(&raw, delta_t, d).await
    }

    async fn emit_first_point(&self, raw: &crate::model::RawSample) -> Result<(), ProcessorError> {
        let now = Utc::now();
        let sample = ProcessedSample {
            id: Uuid::new_v4(),
            device_id: raw.device_id.clone(),
            trip_id: raw.trip_id.clone(),
            timestamp: raw.timestamp,
            coords: raw.coords,
            metadata: ProcessedMetadata {
                distance: 0.0,
                time_diff_seconds: 0.0,
                speed: 0.0,
                processing_method: ProcessingMethod::RawFirst,
                matching_confidence: 0.0,
                processed_at: now,
                raw_sample_id: raw.id,
                last_seen: None,
                stop_count: None,
            },
        };
        self.store.insert_processed(sample).await?;
        info!(device_id = %raw.device_id, raw_sample_id = %raw.id, "first point for device");
        Ok(())
    }

    async fn emit_stale_gap(
        &self,
        raw: &crate::model::RawSample,
        last: &ProcessedSample,
        delta_t: f64,
    ) -> Result<(), ProcessorError> {
        self.kalman.reset(&raw.device_id);
        let d = geo::distance(last.coords, raw.coords);
        let now = Utc::now();
        let sample = ProcessedSample {
            id: Uuid::new_v4(),
            device_id: raw.device_id.clone(),
            trip_id: raw.trip_id.clone(),
            timestamp: raw.timestamp,
            coords: raw.coords,
            metadata: ProcessedMetadata {
                distance: d,
                time_diff_seconds: delta_t,
                speed: geo::speed(d, delta_t),
                processing_method: ProcessingMethod::RawFirst,
                matching_confidence: 0.0,
                processed_at: now,
                raw_sample_id: raw.id,
                last_seen: None,
                stop_count: None,
            },
        };
        self.store.insert_processed(sample).await?;
        warn!(device_id = %raw.device_id, raw_sample_id = %raw.id, "stale gap, kalman state reset");
        Ok(())
    }

    async fn emit_move(
        &self,
        raw: &crate::model::RawSample,
        delta_t: f64,
        d: f64,
    ) -> Result<(), ProcessorError> {
        let smoothed = self.kalman.filter(&raw.device_id, raw.coords);

        let window = self.config.osrm_context_points.saturating_sub(1);
        let mut recent = self
            .store
            .find_recent_processed(&raw.device_id, window)
            .await?;
        recent.reverse(); // oldest-first

        let mut context: Vec<MatchInput> = recent
            .iter()
            .map(|p| MatchInput {
                coords: p.coords,
                timestamp_unix: p.timestamp.timestamp(),
                accuracy: None,
            })
            .collect();
        context.push(MatchInput {
            coords: smoothed,
            timestamp_unix: raw.timestamp.timestamp(),
            accuracy: raw.metadata.accuracy,
        });

        let (final_coords, method, confidence) = if context.len() >= 3 {
            match self.matcher.match_points(&context).await {
                Ok(matched) => {
                    let tail = matched.last().expect("context is non-empty");
                    if tail.confidence >= self.config.osrm_min_confidence {
                        (tail.coords, ProcessingMethod::Osrm, tail.confidence)
                    } else {
                        (smoothed, ProcessingMethod::Kalman, tail.confidence)
                    }
                }
                Err(err) => {
                    warn!(device_id = %raw.device_id, error = %err, "map matcher failed, falling back to kalman");
                    (smoothed, ProcessingMethod::KalmanFallback, 0.0)
                }
            }
        } else {
            (smoothed, ProcessingMethod::Kalman, 0.0)
        };

        let now = Utc::now();
        let sample = ProcessedSample {
            id: Uuid::new_v4(),
            device_id: raw.device_id.clone(),
            trip_id: raw.trip_id.clone(),
            timestamp: raw.timestamp,
            coords: final_coords,
            metadata: ProcessedMetadata {
                distance: d,
                time_diff_seconds: delta_t,
                speed: geo::speed(d, delta_t),
                processing_method: method,
                matching_confidence: confidence,
                processed_at: now,
                raw_sample_id: raw.id,
                last_seen: None,
                stop_count: None,
            },
        };
        self.store.insert_processed(sample).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for TrackProcessor {
    async fn handle(&self, raw_sample_id: Uuid) -> Result<(), JobFailure> {
        self.process(raw_sample_id).await.map_err(|err| {
            if err.is_retriable() {
                JobFailure::retriable(err.to_string())
            } else {
                JobFailure::permanent(err.to_string())
            }
        })
    }
}
