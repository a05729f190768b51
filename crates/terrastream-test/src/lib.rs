//! Test harness for the Terrastream engine.
//!
//! Provides an in-memory tile backend and raster fetcher with call
//! accounting and failure injection, so the streaming pipeline can be
//! exercised without a network.

pub mod harness;

pub use harness::{Elevation, SyntheticRasterFetcher, SyntheticTileProvider};

use terrastream_core::constants::{METERS_PER_DEGREE, METERS_PER_TILE};

/// Grid geometry shared by the synthetic backend and the streamer under test.
#[derive(Debug, Clone, Copy)]
pub struct GridLayout {
    pub meters_per_degree: f64,
    pub meters_per_tile: f64,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self {
            meters_per_degree: METERS_PER_DEGREE,
            meters_per_tile: METERS_PER_TILE,
        }
    }
}

impl GridLayout {
    /// Edge length of one tile in degrees.
    pub fn tile_deg(&self) -> f64 {
        self.meters_per_tile / self.meters_per_degree
    }
}

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
