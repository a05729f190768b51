//! Resident tile table.

use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::RwLock;
use terrastream_core::{GeoCoord, TileId};

use crate::tile::Tile;

/// All tiles the streamer currently tracks, keyed by id.
///
/// Provides thread-safe access to tiles via `RwLock`.
#[derive(Default)]
pub struct TileTable {
    tiles: RwLock<HashMap<TileId, Tile>>,
}

impl TileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a tile is tracked.
    pub fn contains(&self, id: TileId) -> bool {
        self.tiles.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.read().is_empty()
    }

    /// Insert or replace a tile.
    pub fn insert(&self, tile: Tile) {
        self.tiles.write().insert(tile.id, tile);
    }

    pub fn remove(&self, id: TileId) -> Option<Tile> {
        self.tiles.write().remove(&id)
    }

    /// All tracked tile ids.
    pub fn ids(&self) -> Vec<TileId> {
        self.tiles.read().keys().copied().collect()
    }

    /// Ids and centers of all tracked tiles.
    pub fn centers(&self) -> Vec<(TileId, GeoCoord)> {
        self.tiles
            .read()
            .values()
            .map(|tile| (tile.id, tile.center()))
            .collect()
    }

    /// Execute a function with read access to a tile.
    ///
    /// Returns `None` if the tile isn't tracked.
    pub fn with_tile<F, R>(&self, id: TileId, f: F) -> Option<R>
    where
        F: FnOnce(&Tile) -> R,
    {
        self.tiles.read().get(&id).map(f)
    }

    /// Execute a function with write access to a tile.
    ///
    /// Returns `None` if the tile isn't tracked.
    pub fn with_tile_mut<F, R>(&self, id: TileId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Tile) -> R,
    {
        self.tiles.write().get_mut(&id).map(f)
    }

    /// Number of tiles that completed the full pipeline.
    pub fn ready_count(&self) -> usize {
        self.tiles.read().values().filter(|t| t.is_loaded()).count()
    }

    /// Refresh the access time of every ready tile and collect `f` over them.
    pub fn touch_ready<F, R>(&self, now: Instant, mut f: F) -> Vec<R>
    where
        F: FnMut(&Tile) -> R,
    {
        let mut tiles = self.tiles.write();
        tiles
            .values_mut()
            .filter(|tile| tile.is_loaded())
            .map(|tile| {
                tile.touch(now);
                f(tile)
            })
            .collect()
    }

    /// CPU-side memory held by all tiles.
    pub fn memory_usage(&self) -> usize {
        self.tiles.read().values().map(Tile::memory_usage).sum()
    }
}
