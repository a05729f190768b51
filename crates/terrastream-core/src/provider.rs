//! Collaborator traits for the tile backend and raster decoding.
//!
//! Both are called from worker threads as well as the orchestrating thread,
//! so implementations must be `Send + Sync`.

use crate::coords::{GeoCoord, TileId};
use crate::error::Result;
use crate::types::{HeightmapRaster, TileDescriptor};

/// Incremental result of a streaming request.
#[derive(Clone, Debug, Default)]
pub struct TileStreamUpdate {
    /// Tiles that entered the preload area.
    pub new_tiles: Vec<TileDescriptor>,
    /// Tiles the backend considers out of range.
    pub removed_tiles: Vec<TileId>,
}

/// Source of tile descriptors.
pub trait TileProvider: Send + Sync {
    /// Descriptors for the `(2 * radius + 1)^2` grid centered on `center`.
    fn tile_grid(&self, center: GeoCoord, radius: u32) -> Result<Vec<TileDescriptor>>;

    /// Descriptors for tiles entering the preload area after moving from
    /// `previous` to `current`.
    fn stream_tiles(
        &self,
        current: GeoCoord,
        previous: GeoCoord,
        preload_distance: u32,
    ) -> Result<TileStreamUpdate>;
}

/// Downloads and decodes a heightmap raster.
pub trait RasterFetcher: Send + Sync {
    /// Fetch the raster at `url`.
    fn fetch_raster(&self, url: &str) -> Result<HeightmapRaster>;
}
