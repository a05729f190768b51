//! Core types and traits for the Terrastream engine.
//!
//! This crate provides the foundational types used throughout the engine:
//! - Geographic and tile-grid coordinate systems
//! - Planar distance helpers used for restreaming and eviction
//! - Tile descriptors and heightmap rasters
//! - Collaborator traits for the tile backend and raster decoding

pub mod coords;
pub mod error;
pub mod provider;
pub mod types;

pub use coords::{GeoCoord, TileId};
pub use error::{Error, Result};
pub use provider::{RasterFetcher, TileProvider, TileStreamUpdate};
pub use types::{HeightmapRaster, TileDescriptor};

/// Engine-wide constants
pub mod constants {
    /// Approximate meters spanned by one degree of latitude or longitude.
    pub const METERS_PER_DEGREE: f64 = 111_320.0;
    /// Approximate ground size of one tile, in meters.
    pub const METERS_PER_TILE: f64 = 1_000.0;
    /// Player movement (in degrees) that triggers a restream, roughly 100 m.
    pub const MOVEMENT_THRESHOLD_DEG: f64 = 0.001;
    /// Edge length of one tile in world units.
    pub const TILE_WORLD_SIZE: f32 = 100.0;
    /// Bytes per raster pixel (RGBA).
    pub const RASTER_CHANNELS: usize = 4;
}
