//! Streaming configuration.

use serde::{Deserialize, Serialize};
use terrastream_core::constants::{METERS_PER_DEGREE, METERS_PER_TILE, MOVEMENT_THRESHOLD_DEG};
use terrastream_gpu::AllocatorConfig;
use terrastream_mesh::MeshPoolConfig;

/// Configuration for tile streaming behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Radius in tiles within which tiles are preloaded.
    pub preload_distance: u32,
    /// Movement in degrees that triggers a restream.
    pub movement_threshold_deg: f64,
    /// Planar meters per degree used for distance conversion.
    pub meters_per_degree: f64,
    /// Ground meters covered by one tile.
    pub meters_per_tile: f64,
    /// Target mesh samples per axis.
    pub mesh_resolution: u32,
    /// Threads used for raster downloads.
    pub fetch_threads: usize,
    /// Emit a memory warning when pooled GPU memory exceeds this many MiB.
    pub memory_warning_mb: Option<f64>,
    /// Mesh worker pool settings.
    pub mesh: MeshPoolConfig,
    /// GPU buffer pool settings.
    pub allocator: AllocatorConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            preload_distance: 2,
            movement_threshold_deg: MOVEMENT_THRESHOLD_DEG,
            meters_per_degree: METERS_PER_DEGREE,
            meters_per_tile: METERS_PER_TILE,
            mesh_resolution: 64,
            fetch_threads: 4,
            memory_warning_mb: None,
            mesh: MeshPoolConfig::default(),
            allocator: AllocatorConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Set the preload distance in tiles.
    pub fn with_preload_distance(mut self, tiles: u32) -> Self {
        self.preload_distance = tiles;
        self
    }

    /// Set the mesh resolution.
    pub fn with_mesh_resolution(mut self, resolution: u32) -> Self {
        self.mesh_resolution = resolution;
        self
    }

    /// Set the number of fetch threads.
    pub fn with_fetch_threads(mut self, threads: usize) -> Self {
        self.fetch_threads = threads;
        self
    }

    /// Set the number of mesh workers.
    pub fn with_mesh_workers(mut self, workers: usize) -> Self {
        self.mesh.worker_count = workers;
        self
    }

    /// Set the memory warning threshold.
    pub fn with_memory_warning_mb(mut self, mb: f64) -> Self {
        self.memory_warning_mb = Some(mb);
        self
    }

    /// Set the GPU buffer pool settings.
    pub fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    /// Tile distance beyond which resident tiles are evicted.
    pub fn eviction_distance(&self) -> f64 {
        f64::from(self.preload_distance) * 2.0
    }
}
