//! Device-agnostic GPS track processing: Kalman smoothing, OSRM-compatible
//! map-matching, a job-queue worker pool, and the storage ports they share.
//!
//! The ingestion HTTP surface, auth, and durable storage backends are out of
//! scope for this crate — it exposes the ports (`SampleStore`, `MapMatcher`,
//! `JobHandler`) a host process wires up, plus in-memory reference
//! implementations of each.

pub mod config;
pub mod error;
pub mod geo;
pub mod kalman;
pub mod mapmatch;
pub mod model;
pub mod processor;
pub mod queue;
pub mod store;

pub use config::Config;
pub use error::{MapMatchError, ProcessorError, QueueError, StoreError};
pub use kalman::{KalmanParams, KalmanSmoother};
pub use mapmatch::{FakeMapMatcher, MapMatcher as MapMatcherPort, MatchInput, MatchedPoint, OsrmClient};
pub use model::{
    Coords, DeviceId, ProcessedMetadata, ProcessedSample, ProcessingMethod, RawMetadata, RawSample,
    TripId,
};
pub use processor::TrackProcessor;
pub use queue::{JobFailure, JobHandler, JobQueue, JobOutcome, QueueConfig};
pub use store::{InMemoryStore, Page, PageQuery, SampleStore};
