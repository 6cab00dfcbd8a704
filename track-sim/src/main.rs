//! Scenario-driving load harness for track-core.
//!
//! Drives the Rust API directly, in-process — there is no HTTP ingestion
//! surface in this workspace, so the harness talks to `TrackProcessor`
//! exactly the way a worker's job handler would, just without a real queue
//! in front of it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::info;
use uuid::Uuid;

use track_core::mapmatch::{FakeMapMatcher, MapMatcher};
use track_core::model::{Coords, RawMetadata, RawSample};
use track_core::{Config, InMemoryStore, KalmanSmoother, SampleStore, TrackProcessor};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Scenario {
    /// A single device's very first sample.
    FirstPoint,
    /// Steady forward motion, well above the stop threshold each tick.
    Move,
    /// A device that stays within a few meters of its last fix.
    StopCoalesce,
    /// A long silent gap between two samples for the same device.
    StaleGap,
    /// A sample that arrives timestamped before the device's last one.
    OutOfOrder,
    /// Motion with the map matcher wired to always fail.
    MapMatcherDown,
    /// Run every scenario in sequence.
    All,
}

#[derive(Parser, Debug)]
#[command(name = "track-sim", about = "Drives track-core through canned GPS scenarios")]
struct Args {
    /// Which scenario to run.
    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
    /// Number of synthetic devices for the `move` scenario.
    #[arg(long, default_value_t = 3)]
    devices: u32,
    /// Number of ticks to advance each device through.
    #[arg(long, default_value_t = 20)]
    ticks: u32,
    /// Map-matcher confidence to report when a scenario exercises matching.
    #[arg(long, default_value_t = 0.9)]
    match_confidence: f64,
    /// RNG seed, for reproducible runs.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Scenario::FirstPoint => "first-point",
            Scenario::Move => "move",
            Scenario::StopCoalesce => "stop-coalesce",
            Scenario::StaleGap => "stale-gap",
            Scenario::OutOfOrder => "out-of-order",
            Scenario::MapMatcherDown => "map-matcher-down",
            Scenario::All => "all",
        };
        write!(f, "{s}")
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    processor: TrackProcessor,
}

impl Harness {
    fn new(matcher: Arc<dyn MapMatcher>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let kalman = Arc::new(KalmanSmoother::default());
        let config = Config::default();
        let processor = TrackProcessor::new(store.clone(), matcher, kalman, config);
        Self { store, processor }
    }

    async fn drive(&self, device_id: &str, ts: DateTime<Utc>, coords: Coords, accuracy: Option<f64>) {
        let sample = RawSample {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            trip_id: None,
            timestamp: ts,
            coords,
            metadata: RawMetadata { accuracy, speed: None, heading: None },
        };
        let id = sample.id;
        self.store.insert_raw(sample).await.unwrap();
        self.processor.process(id).await.unwrap();

        let latest = self.store.find_latest_processed(device_id).await.unwrap();
        match latest {
            Some(p) => info!(
                device_id,
                method = ?p.metadata.processing_method,
                confidence = p.metadata.matching_confidence,
                lat = p.coords.lat,
                lon = p.coords.lon,
                "tick processed"
            ),
            None => info!(device_id, "tick coalesced into previous stop"),
        }
    }
}

async fn run_first_point() {
    info!("== scenario: first-point ==");
    let harness = Harness::new(Arc::new(FakeMapMatcher::confident(0.9)));
    harness.drive("sim-device-1", Utc::now(), Coords::new(28.6129, 77.2295), None).await;
}

async fn run_move(devices: u32, ticks: u32, confidence: f64, seed: u64) {
    info!("== scenario: move ==");
    let harness = Harness::new(Arc::new(FakeMapMatcher::confident(confidence)));
    let mut rng = StdRng::seed_from_u64(seed);
    let jitter = Normal::new(0.0, 0.0003).unwrap();

    for d in 0..devices {
        let device_id = format!("sim-device-{d}");
        let mut lat = 28.6129 + d as f64 * 0.01;
        let mut lon = 77.2295 + d as f64 * 0.01;
        let t0 = Utc::now();

        for tick in 0..ticks {
            lat += 0.001 + jitter.sample(&mut rng);
            lon += 0.001 + jitter.sample(&mut rng);
            let ts = t0 + chrono::Duration::seconds(30 * tick as i64);
            harness.drive(&device_id, ts, Coords::new(lat, lon), Some(10.0)).await;
        }
    }
}

async fn run_stop_coalesce() {
    info!("== scenario: stop-coalesce ==");
    let harness = Harness::new(Arc::new(FakeMapMatcher::confident(0.9)));
    let t0 = Utc::now();
    harness.drive("sim-device-stop", t0, Coords::new(28.6129, 77.2295), None).await;
    for i in 1..6 {
        let ts = t0 + chrono::Duration::seconds(5 * i);
        // Sub-meter jitter around the same spot: stays under the 5m stop threshold.
        harness
            .drive("sim-device-stop", ts, Coords::new(28.612901, 77.229501), None)
            .await;
    }
}

async fn run_stale_gap() {
    info!("== scenario: stale-gap ==");
    let harness = Harness::new(Arc::new(FakeMapMatcher::confident(0.9)));
    let t0 = Utc::now() - chrono::Duration::seconds(1000);
    harness.drive("sim-device-stale", t0, Coords::new(28.6129, 77.2295), None).await;
    harness
        .drive("sim-device-stale", t0 + chrono::Duration::seconds(10), Coords::new(28.7, 77.3), None)
        .await;
}

async fn run_out_of_order() {
    info!("== scenario: out-of-order ==");
    let harness = Harness::new(Arc::new(FakeMapMatcher::confident(0.9)));
    let t0 = Utc::now();
    harness.drive("sim-device-ooo", t0, Coords::new(28.6129, 77.2295), None).await;
    harness
        .drive(
            "sim-device-ooo",
            t0 - chrono::Duration::seconds(10),
            Coords::new(28.62, 77.23),
            None,
        )
        .await;
}

async fn run_map_matcher_down(ticks: u32) {
    info!("== scenario: map-matcher-down ==");
    let harness = Harness::new(Arc::new(FakeMapMatcher::unreachable()));
    let t0 = Utc::now();
    let mut lat = 28.6129;
    let mut lon = 77.2295;
    for tick in 0..ticks.max(4) {
        lat += 0.001;
        lon += 0.001;
        let ts = t0 + chrono::Duration::seconds(30 * tick as i64);
        harness
            .drive("sim-device-down", ts, Coords::new(lat, lon), Some(10.0))
            .await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "track_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    info!(scenario = %args.scenario, devices = args.devices, ticks = args.ticks, "starting scenario harness");

    match args.scenario {
        Scenario::FirstPoint => run_first_point().await,
        Scenario::Move => run_move(args.devices, args.ticks, args.match_confidence, args.seed).await,
        Scenario::StopCoalesce => run_stop_coalesce().await,
        Scenario::StaleGap => run_stale_gap().await,
        Scenario::OutOfOrder => run_out_of_order().await,
        Scenario::MapMatcherDown => run_map_matcher_down(args.ticks).await,
        Scenario::All => {
            run_first_point().await;
            run_move(args.devices, args.ticks, args.match_confidence, args.seed).await;
            run_stop_coalesce().await;
            run_stale_gap().await;
            run_out_of_order().await;
            run_map_matcher_down(args.ticks).await;
        }
    }

    // Give the tracing subscriber a moment to flush the last events.
    tokio::time::sleep(Duration::from_millis(10)).await;
}
