//! Terrastream headless streaming demo.
//!
//! Walks a player east across procedurally generated terrain and logs what
//! the streamer loads, evicts and keeps resident. GPU buffers live on the
//! headless device, so no graphics driver is needed.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p terrastream-demo -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod terrain;

use std::sync::Arc;

use terrastream_gpu::HeadlessDevice;
use terrastream_world::{EventKind, PositionUpdate, StreamEvent, StreamingConfig, TileStreamer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::terrain::ProceduralTerrain;

/// Heightmap edge length served by the procedural backend.
const RASTER_SIZE: u32 = 128;

/// Run cleanup every this many steps.
const CLEANUP_INTERVAL: u32 = 10;

/// Walk parameters (from CLI or defaults).
#[derive(Debug, Clone)]
struct DemoParams {
    lat: f64,
    lng: f64,
    radius: u32,
    preload: u32,
    workers: usize,
    steps: u32,
    step_deg: f64,
    memory_warning_mb: f64,
}

impl Default for DemoParams {
    fn default() -> Self {
        Self {
            lat: 46.5,
            lng: 8.0,
            radius: 1,
            preload: 2,
            workers: 4,
            steps: 40,
            step_deg: 0.002,
            memory_warning_mb: 256.0,
        }
    }
}

impl DemoParams {
    /// Parse walk parameters from command line arguments.
    fn from_args() -> Self {
        let mut params = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i + 1 < args.len() {
            let value = &args[i + 1];
            let parsed = match args[i].as_str() {
                "--lat" => value.parse().map(|v| params.lat = v).is_ok(),
                "--lng" => value.parse().map(|v| params.lng = v).is_ok(),
                "--radius" => value.parse().map(|v| params.radius = v).is_ok(),
                "--preload" => value.parse().map(|v| params.preload = v).is_ok(),
                "--workers" => value.parse().map(|v| params.workers = v).is_ok(),
                "--steps" => value.parse().map(|v| params.steps = v).is_ok(),
                "--step-deg" => value.parse().map(|v| params.step_deg = v).is_ok(),
                "--memory-warning-mb" => value.parse().map(|v| params.memory_warning_mb = v).is_ok(),
                _ => false,
            };
            i += if parsed { 2 } else { 1 };
        }

        params
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let params = DemoParams::from_args();
    info!(?params, "Starting streaming demo");

    let config = StreamingConfig::default()
        .with_preload_distance(params.preload)
        .with_mesh_workers(params.workers)
        .with_memory_warning_mb(params.memory_warning_mb);
    let max_buffer_age = config.allocator.max_buffer_age;
    let terrain = Arc::new(ProceduralTerrain::new(
        config.meters_per_degree,
        config.meters_per_tile,
        RASTER_SIZE,
    ));

    let mut streamer = TileStreamer::new(
        Arc::new(HeadlessDevice::new()),
        terrain.clone(),
        terrain,
        config,
    );
    streamer.on(EventKind::Error, |event| {
        if let StreamEvent::Error(error) = event {
            warn!(tile = ?error.tile_id, kind = ?error.kind, retryable = error.retryable, "{}", error.message);
        }
    });
    streamer.on(EventKind::PerformanceUpdate, |event| {
        if let StreamEvent::PerformanceUpdate(sample) = event {
            info!(
                batch = sample.batch_size,
                resident = sample.tiles_resident,
                avg_mesh_ms = sample.average_mesh_time.as_secs_f64() * 1000.0,
                gpu_mb = sample.memory_usage_mb,
                "Performance"
            );
        }
    });
    streamer.initialize()?;

    let report = streamer.load_initial_grid(params.lat, params.lng, params.radius)?;
    info!(
        loaded = report.loaded,
        failed = report.failed,
        elapsed_ms = report.elapsed.as_millis(),
        "Initial grid ready"
    );

    let mut lng = params.lng;
    for step in 1..=params.steps {
        lng += params.step_deg;
        match streamer.update_player_position(params.lat, lng)? {
            PositionUpdate::Streamed(report) => info!(
                step,
                loaded = report.loaded,
                evicted = report.evicted.len(),
                "Restreamed"
            ),
            PositionUpdate::BelowThreshold { distance_deg } => {
                info!(step, distance_deg, "Below restream threshold");
            }
        }

        if step % CLEANUP_INTERVAL == 0 {
            let destroyed = streamer.cleanup_unused_buffers(max_buffer_age);
            let status = streamer.current_status();
            info!(
                step,
                tiles = status.tiles_loaded,
                gpu_mb = status.memory_usage_mb,
                workers = status.total_workers,
                destroyed,
                "Status"
            );
        }
    }

    let visible = streamer.visible_tiles();
    let memory = streamer.memory_stats();
    info!(
        visible = visible.len(),
        pooled_vertex = memory.gpu.vertex.available_count,
        pooled_index = memory.gpu.index.available_count,
        reuse_hits = memory.gpu.vertex.reuse_hits + memory.gpu.index.reuse_hits,
        "Walk complete"
    );

    streamer.destroy();
    Ok(())
}

fn print_help() {
    eprintln!(
        "Terrastream headless streaming demo

USAGE:
    cargo run -p terrastream-demo -- [OPTIONS]

OPTIONS:
    --lat <DEG>                Start latitude (default: 46.5)
    --lng <DEG>                Start longitude (default: 8.0)
    --radius <N>               Initial grid radius in tiles (default: 1)
    --preload <N>              Preload distance in tiles (default: 2)
    --workers <N>              Mesh worker threads, 0 for fallback (default: 4)
    --steps <N>                Number of walk steps (default: 40)
    --step-deg <DEG>           Longitude advanced per step (default: 0.002)
    --memory-warning-mb <MB>   GPU memory warning level (default: 256)
    -h, --help                 Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                   Set log level (e.g., info, debug, trace)"
    );
}
