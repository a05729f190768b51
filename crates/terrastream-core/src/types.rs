//! Tile descriptor and raster types exchanged with collaborators.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::RASTER_CHANNELS;
use crate::coords::{GeoCoord, TileId};
use crate::error::{Error, Result};

/// Descriptor of one tile as returned by the tile backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileDescriptor {
    /// Stable id (grid coordinates).
    pub id: TileId,
    /// Geographic center of the tile.
    pub center: GeoCoord,
    /// Raster filename on the backend.
    pub filename: String,
    /// URL the heightmap raster is fetched from.
    pub backend_url: String,
    /// Whether the backend already had the raster cached.
    pub cached: bool,
}

impl TileDescriptor {
    /// URL of this tile's heightmap raster.
    #[inline]
    pub fn raster_url(&self) -> &str {
        &self.backend_url
    }
}

/// Heightmap raster in RGBA layout.
///
/// The red channel encodes elevation normalized to `0..=255`. Pixel data is
/// immutable once decoded and shared by reference count, so handing it to a
/// mesh worker never copies it.
#[derive(Clone, Debug)]
pub struct HeightmapRaster {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl HeightmapRaster {
    /// Create a raster, validating that the byte length matches RGBA dimensions.
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32) -> Result<Self> {
        let raster = Self {
            data: data.into(),
            width,
            height,
        };
        raster.validate()?;
        Ok(raster)
    }

    /// Build an RGBA raster from one elevation byte per pixel.
    pub fn from_elevations(elevations: &[u8], width: u32, height: u32) -> Result<Self> {
        let data: Vec<u8> = elevations
            .iter()
            .flat_map(|&e| [e, e, e, u8::MAX])
            .collect();
        Self::new(data, width, height)
    }

    /// Check that the raster is non-empty and its byte length matches its dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidData(format!(
                "raster has zero extent ({}x{})",
                self.width, self.height
            )));
        }
        let expected = self.width as usize * self.height as usize * RASTER_CHANNELS;
        if self.data.len() != expected {
            return Err(Error::InvalidData(format!(
                "raster byte length {} does not match {}x{} RGBA ({expected})",
                self.data.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    /// Elevation byte (red channel) at pixel `(x, y)`.
    #[inline]
    pub fn elevation(&self, x: u32, y: u32) -> u8 {
        self.data[(y as usize * self.width as usize + x as usize) * RASTER_CHANNELS]
    }

    /// Size of the pixel data in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
