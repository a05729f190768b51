//! Resident tile record.

use std::time::Instant;

use glam::Vec3;
use terrastream_core::{GeoCoord, HeightmapRaster, TileDescriptor, TileId};
use terrastream_gpu::BufferHandle;
use terrastream_mesh::MeshData;

/// GPU buffers backing a ready tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileBuffers {
    pub vertex: BufferHandle,
    pub index: BufferHandle,
    /// Bytes written to the vertex buffer.
    pub vertex_bytes: u64,
    /// Bytes written to the index buffer.
    pub index_bytes: u64,
}

/// Stage of a tile in the loading pipeline.
///
/// Each stage carries exactly the data that exists at that point, so a tile
/// cannot claim GPU buffers without a mesh or a mesh without a raster.
#[derive(Clone, Debug)]
pub enum TileStage {
    /// Heightmap download in flight.
    Fetching,
    /// Raster decoded, mesh requested.
    MeshGenerating { raster: HeightmapRaster },
    /// Mesh built, buffers being written.
    GpuUploading {
        raster: HeightmapRaster,
        mesh: MeshData,
    },
    /// Fully loaded and renderable.
    Ready {
        raster: HeightmapRaster,
        mesh: MeshData,
        buffers: TileBuffers,
    },
}

impl TileStage {
    /// Short stage name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::MeshGenerating { .. } => "mesh-generating",
            Self::GpuUploading { .. } => "gpu-uploading",
            Self::Ready { .. } => "ready",
        }
    }
}

/// A tile tracked by the streamer.
#[derive(Clone, Debug)]
pub struct Tile {
    pub id: TileId,
    pub descriptor: TileDescriptor,
    /// World-space origin of the tile mesh.
    pub world_position: Vec3,
    pub stage: TileStage,
    /// Load generation; fetch results tagged with another epoch are stale.
    pub epoch: u64,
    /// Last time the tile was handed to the renderer.
    pub last_access: Instant,
}

impl Tile {
    /// Create a tile whose raster fetch has just been issued.
    pub fn new(descriptor: TileDescriptor, epoch: u64) -> Self {
        Self {
            id: descriptor.id,
            world_position: descriptor.id.world_position(),
            descriptor,
            stage: TileStage::Fetching,
            epoch,
            last_access: Instant::now(),
        }
    }

    /// Geographic center of the tile.
    #[inline]
    pub fn center(&self) -> GeoCoord {
        self.descriptor.center
    }

    /// Whether the full pipeline has completed.
    pub fn is_loaded(&self) -> bool {
        matches!(self.stage, TileStage::Ready { .. })
    }

    /// Whether a mesh request is outstanding.
    pub fn is_generating_mesh(&self) -> bool {
        matches!(self.stage, TileStage::MeshGenerating { .. })
    }

    /// Whether GPU buffers exist for this tile.
    pub fn gpu_resources_created(&self) -> bool {
        matches!(self.stage, TileStage::Ready { .. })
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.stage, TileStage::Fetching)
    }

    pub fn raster(&self) -> Option<&HeightmapRaster> {
        match &self.stage {
            TileStage::Fetching => None,
            TileStage::MeshGenerating { raster }
            | TileStage::GpuUploading { raster, .. }
            | TileStage::Ready { raster, .. } => Some(raster),
        }
    }

    pub fn mesh(&self) -> Option<&MeshData> {
        match &self.stage {
            TileStage::GpuUploading { mesh, .. } | TileStage::Ready { mesh, .. } => Some(mesh),
            _ => None,
        }
    }

    pub fn buffers(&self) -> Option<TileBuffers> {
        match &self.stage {
            TileStage::Ready { buffers, .. } => Some(*buffers),
            _ => None,
        }
    }

    /// Move from `Fetching` to `MeshGenerating`.
    ///
    /// Returns `false` and leaves the tile untouched from any other stage.
    pub fn begin_meshing(&mut self, raster: HeightmapRaster) -> bool {
        if !self.is_fetching() {
            return false;
        }
        self.stage = TileStage::MeshGenerating { raster };
        true
    }

    /// Move from `MeshGenerating` to `GpuUploading`.
    pub fn begin_upload(&mut self, mesh: MeshData) -> bool {
        match std::mem::replace(&mut self.stage, TileStage::Fetching) {
            TileStage::MeshGenerating { raster } => {
                self.stage = TileStage::GpuUploading { raster, mesh };
                true
            }
            other => {
                self.stage = other;
                false
            }
        }
    }

    /// Move from `GpuUploading` to `Ready`.
    pub fn mark_ready(&mut self, buffers: TileBuffers) -> bool {
        match std::mem::replace(&mut self.stage, TileStage::Fetching) {
            TileStage::GpuUploading { raster, mesh } => {
                self.stage = TileStage::Ready {
                    raster,
                    mesh,
                    buffers,
                };
                true
            }
            other => {
                self.stage = other;
                false
            }
        }
    }

    /// Record a render access.
    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
    }

    /// CPU-side bytes held by the raster and mesh.
    pub fn memory_usage(&self) -> usize {
        let raster = self.raster().map_or(0, HeightmapRaster::byte_len);
        let mesh = self
            .mesh()
            .map_or(0, |m| (m.vertex_bytes() + m.index_bytes()) as usize);
        std::mem::size_of::<Self>() + raster + mesh
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use terrastream_gpu::{AllocatorConfig, BufferAllocator, HeadlessDevice};

    fn descriptor(x: i32, y: i32) -> TileDescriptor {
        TileDescriptor {
            id: TileId::new(x, y),
            center: GeoCoord::new(0.0, 0.0),
            filename: format!("{x}_{y}.png"),
            backend_url: format!("test://{x}/{y}"),
            cached: false,
        }
    }

    fn raster() -> HeightmapRaster {
        HeightmapRaster::from_elevations(&[0; 4], 2, 2).unwrap()
    }

    fn buffers() -> TileBuffers {
        let mut allocator =
            BufferAllocator::new(Arc::new(HeadlessDevice::new()), AllocatorConfig::default());
        TileBuffers {
            vertex: allocator.allocate_vertex_buffer(128).unwrap(),
            index: allocator.allocate_index_buffer(24).unwrap(),
            vertex_bytes: 128,
            index_bytes: 24,
        }
    }

    #[test]
    fn new_tile_is_fetching() {
        let tile = Tile::new(descriptor(2, -1), 7);
        assert!(tile.is_fetching());
        assert!(!tile.is_loaded());
        assert!(!tile.gpu_resources_created());
        assert_eq!(tile.epoch, 7);
        assert_eq!(tile.world_position, TileId::new(2, -1).world_position());
    }

    #[test]
    fn stages_advance_in_order() {
        let mut tile = Tile::new(descriptor(0, 0), 1);

        assert!(tile.begin_meshing(raster()));
        assert!(tile.is_generating_mesh());
        assert!(tile.raster().is_some());

        assert!(tile.begin_upload(MeshData::default()));
        assert!(tile.mesh().is_some());
        assert!(tile.buffers().is_none());

        let ready = buffers();
        assert!(tile.mark_ready(ready));
        assert!(tile.is_loaded());
        assert!(tile.gpu_resources_created());
        assert_eq!(tile.buffers(), Some(ready));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut tile = Tile::new(descriptor(0, 0), 1);
        assert!(!tile.begin_upload(MeshData::default()));
        assert!(!tile.mark_ready(buffers()));
        assert!(tile.is_fetching());

        assert!(tile.begin_meshing(raster()));
        assert!(!tile.begin_meshing(raster()));
        assert!(!tile.mark_ready(buffers()));
        assert!(tile.is_generating_mesh());
    }
}
