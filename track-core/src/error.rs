//! Error taxonomy for the track-processing pipeline.
//!
//! The kinds here mirror the failure table in the design doc: storage and
//! input-absent faults are retriable and escape the worker to the job queue;
//! map-matcher faults never escape — the processor absorbs them as a
//! `kalman_fallback` outcome.

use thiserror::Error;
use uuid::Uuid;

/// Failures raised while processing a single job.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The raw sample referenced by the job id does not exist in storage.
    #[error("raw sample {0} not found")]
    SampleNotFound(Uuid),

    /// A storage read or write failed transiently.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A value violated a core invariant (NaN coordinate, negative distance).
    /// Non-retriable: the job is dropped, not retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ProcessorError {
    /// Whether the job queue should retry this failure.
    ///
    /// Only input-absent and storage-transient faults are retriable; an
    /// invariant violation will never succeed on replay.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProcessorError::InvariantViolation(_))
    }
}

/// Failures raised by a `SampleStore` implementation.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Failures raised by a `MapMatcher` implementation.
///
/// None of these are retried or propagated by the processor — every variant
/// is absorbed into the `kalman_fallback` path at the call site.
#[derive(Debug, Error)]
pub enum MapMatchError {
    #[error("map matcher unreachable: {0}")]
    Unreachable(String),
    #[error("map matcher timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("map matcher returned an unparseable response: {0}")]
    Malformed(String),
}

/// Failures raised by the job queue binding itself (enqueue-time, not job-time).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is draining, no new jobs accepted")]
    Draining,
}
