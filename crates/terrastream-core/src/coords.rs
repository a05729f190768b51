//! Coordinate systems for the tile grid.
//!
//! Distances are planar: latitude and longitude deltas are treated as
//! orthogonal axes of equal length. This holds up at sub-10 km scale and is
//! used for both the restream trigger and eviction.

use std::fmt;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::constants::TILE_WORLD_SIZE;

/// Geographic coordinate in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    pub lat: f64,
    pub lng: f64,
}

impl GeoCoord {
    /// Create a new geographic coordinate
    #[inline]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Planar distance to `other` in degrees.
    #[inline]
    pub fn planar_distance_deg(self, other: Self) -> f64 {
        let d_lat = self.lat - other.lat;
        let d_lng = self.lng - other.lng;
        d_lat.hypot(d_lng)
    }

    /// Planar distance to `other` in meters, using a fixed meters-per-degree factor.
    #[inline]
    pub fn planar_distance_m(self, other: Self, meters_per_degree: f64) -> f64 {
        self.planar_distance_deg(other) * meters_per_degree
    }

    /// Planar distance to `other` expressed in tile-grid units.
    #[inline]
    pub fn tile_distance(self, other: Self, meters_per_degree: f64, meters_per_tile: f64) -> f64 {
        self.planar_distance_m(other, meters_per_degree) / meters_per_tile
    }

    /// Offset this coordinate by whole tiles.
    pub fn offset_tiles(self, dx: i32, dy: i32, meters_per_degree: f64, meters_per_tile: f64) -> Self {
        let tile_deg = meters_per_tile / meters_per_degree;
        Self::new(
            self.lat + f64::from(dy) * tile_deg,
            self.lng + f64::from(dx) * tile_deg,
        )
    }
}

impl fmt::Display for GeoCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// Stable tile key derived from integer grid coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub x: i32,
    pub y: i32,
}

impl TileId {
    /// Create a new tile id
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// World-space origin of this tile (X/Z plane, Y up).
    #[inline]
    pub fn world_position(self) -> Vec3 {
        Vec3::new(
            self.x as f32 * TILE_WORLD_SIZE,
            0.0,
            self.y as f32 * TILE_WORLD_SIZE,
        )
    }

    /// Chebyshev distance in grid cells.
    #[inline]
    pub fn grid_distance(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile_{}_{}", self.x, self.y)
    }
}
