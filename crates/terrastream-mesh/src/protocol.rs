//! Worker RPC contract.
//!
//! Payload fields mirror the mesh-generation message contract and must stay
//! stable. The envelope adds a protocol version and a coordinator-assigned
//! task id so late results of abandoned tasks can be recognized and dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use terrastream_core::TileId;

/// Version of the worker message envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Floats per vertex: position (3), normal (3), uv (2).
pub const VERTEX_STRIDE: usize = 8;

/// World-space height of a full-scale (255) elevation sample.
pub const HEIGHT_SCALE: f32 = 50.0;

/// World-space X/Z offset of a tile's mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldOffset {
    pub x: f32,
    pub z: f32,
}

/// Request to mesh one heightmap.
#[derive(Clone, Debug)]
pub struct MeshRequest {
    pub tile_id: TileId,
    /// RGBA pixels; red channel is elevation.
    pub heightmap_data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Target samples per axis.
    pub resolution: u32,
    pub world_position: WorldOffset,
}

/// Vertex/index data of one tile mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    /// Interleaved `[px, py, pz, nx, ny, nz, u, v]` per vertex.
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshData {
    /// Position of vertex `i`.
    pub fn position(&self, i: usize) -> [f32; 3] {
        let v = &self.vertices[i * VERTEX_STRIDE..];
        [v[0], v[1], v[2]]
    }

    /// Normal of vertex `i`.
    pub fn normal(&self, i: usize) -> [f32; 3] {
        let v = &self.vertices[i * VERTEX_STRIDE + 3..];
        [v[0], v[1], v[2]]
    }

    /// Texture coordinate of vertex `i`.
    pub fn uv(&self, i: usize) -> [f32; 2] {
        let v = &self.vertices[i * VERTEX_STRIDE + 6..];
        [v[0], v[1]]
    }

    /// Size of the vertex data in bytes.
    pub fn vertex_bytes(&self) -> u64 {
        std::mem::size_of_val(self.vertices.as_slice()) as u64
    }

    /// Size of the index data in bytes.
    pub fn index_bytes(&self) -> u64 {
        std::mem::size_of_val(self.indices.as_slice()) as u64
    }
}

/// Result of one mesh request.
#[derive(Clone, Debug)]
pub struct MeshResponse {
    pub tile_id: TileId,
    pub success: bool,
    pub mesh_data: Option<MeshData>,
    pub error: Option<String>,
    pub processing_time: Duration,
}

impl MeshResponse {
    /// Processing time in milliseconds.
    pub fn processing_time_ms(&self) -> f64 {
        self.processing_time.as_secs_f64() * 1000.0
    }
}

/// Coordinator-assigned task id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Message from the coordinator to a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Process {
        version: u32,
        task: TaskId,
        request: MeshRequest,
    },
    Shutdown,
}

/// Message from a worker to the coordinator.
#[derive(Debug)]
pub enum WorkerEvent {
    Ready {
        worker: usize,
        version: u32,
    },
    Finished {
        worker: usize,
        version: u32,
        task: TaskId,
        response: MeshResponse,
    },
}
