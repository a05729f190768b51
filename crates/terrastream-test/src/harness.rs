//! Synthetic collaborators for streaming tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use terrastream_core::{
    Error, GeoCoord, HeightmapRaster, RasterFetcher, Result, TileDescriptor, TileId, TileProvider,
    TileStreamUpdate,
};
use tracing::trace;

use crate::GridLayout;

/// Raster URL of a synthetic tile.
pub fn tile_url(id: TileId) -> String {
    format!("synthetic://{}/{}", id.x, id.y)
}

/// Tile backend that lays tiles on a regular lat/lng grid.
///
/// Tile `(x, y)` covers longitudes `[x, x + 1) * tile_deg` and latitudes
/// `[y, y + 1) * tile_deg`.
#[derive(Default)]
pub struct SyntheticTileProvider {
    grid: GridLayout,
    grid_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    failing: AtomicBool,
    requested: Mutex<Vec<TileId>>,
}

impl SyntheticTileProvider {
    pub fn new(grid: GridLayout) -> Self {
        Self {
            grid,
            ..Self::default()
        }
    }

    /// Tile containing `coord`.
    pub fn tile_at(&self, coord: GeoCoord) -> TileId {
        let deg = self.grid.tile_deg();
        TileId::new(
            (coord.lng / deg).floor() as i32,
            (coord.lat / deg).floor() as i32,
        )
    }

    /// Geographic center of a tile.
    pub fn center_of(&self, id: TileId) -> GeoCoord {
        let deg = self.grid.tile_deg();
        GeoCoord::new(
            (f64::from(id.y) + 0.5) * deg,
            (f64::from(id.x) + 0.5) * deg,
        )
    }

    pub fn descriptor(&self, id: TileId) -> TileDescriptor {
        TileDescriptor {
            id,
            center: self.center_of(id),
            filename: format!("{}_{}.png", id.x, id.y),
            backend_url: tile_url(id),
            cached: false,
        }
    }

    /// Make every subsequent query fail with a network error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `tile_grid` calls served.
    pub fn grid_calls(&self) -> usize {
        self.grid_calls.load(Ordering::SeqCst)
    }

    /// Number of `stream_tiles` calls served.
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Total backend round trips.
    pub fn network_calls(&self) -> usize {
        self.grid_calls() + self.stream_calls()
    }

    /// Every tile id handed out, in order.
    pub fn requested(&self) -> Vec<TileId> {
        self.requested.lock().clone()
    }

    fn area(&self, center: GeoCoord, radius: u32) -> Vec<TileId> {
        let c = self.tile_at(center);
        let r = radius as i32;
        (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| TileId::new(c.x + dx, c.y + dy)))
            .collect()
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Network("synthetic backend unavailable".to_string()));
        }
        Ok(())
    }

    fn hand_out(&self, ids: &[TileId]) -> Vec<TileDescriptor> {
        self.requested.lock().extend_from_slice(ids);
        ids.iter().map(|&id| self.descriptor(id)).collect()
    }
}

impl TileProvider for SyntheticTileProvider {
    fn tile_grid(&self, center: GeoCoord, radius: u32) -> Result<Vec<TileDescriptor>> {
        self.grid_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.hand_out(&self.area(center, radius)))
    }

    fn stream_tiles(
        &self,
        current: GeoCoord,
        previous: GeoCoord,
        preload_distance: u32,
    ) -> Result<TileStreamUpdate> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;

        let now: HashSet<TileId> = self.area(current, preload_distance).into_iter().collect();
        let before: HashSet<TileId> = self.area(previous, preload_distance).into_iter().collect();

        let mut entering: Vec<TileId> = now.difference(&before).copied().collect();
        entering.sort_unstable();
        let mut removed_tiles: Vec<TileId> = before.difference(&now).copied().collect();
        removed_tiles.sort_unstable();

        Ok(TileStreamUpdate {
            new_tiles: self.hand_out(&entering),
            removed_tiles,
        })
    }
}

/// Elevation pattern produced by [`SyntheticRasterFetcher`].
#[derive(Debug, Clone, Copy)]
pub enum Elevation {
    Flat(u8),
    /// Rises linearly from 0 to 255 along +x.
    RampX,
}

#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
    opened: Condvar,
}

#[derive(Default)]
struct Concurrency {
    running: usize,
    peak: usize,
}

/// Raster fetcher that serves generated heightmaps.
pub struct SyntheticRasterFetcher {
    size: u32,
    elevation: Elevation,
    calls: Mutex<HashMap<String, usize>>,
    concurrency: Mutex<HashMap<String, Concurrency>>,
    failing: Mutex<HashSet<String>>,
    corrupt: Mutex<HashSet<String>>,
    gate: Gate,
}

/// Marks one fetch of a URL as running until dropped.
struct Running<'a> {
    fetcher: &'a SyntheticRasterFetcher,
    url: &'a str,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.fetcher.concurrency.lock().get_mut(self.url) {
            entry.running -= 1;
        }
    }
}

impl SyntheticRasterFetcher {
    /// Serve flat `size x size` rasters.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            elevation: Elevation::Flat(128),
            calls: Mutex::new(HashMap::new()),
            concurrency: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            corrupt: Mutex::new(HashSet::new()),
            gate: Gate::default(),
        }
    }

    pub fn with_elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = elevation;
        self
    }

    /// Fail fetches of `id` with a network error.
    pub fn fail_tile(&self, id: TileId) {
        self.failing.lock().insert(tile_url(id));
    }

    /// Serve a raster whose byte length doesn't match its dimensions for `id`.
    pub fn corrupt_tile(&self, id: TileId) {
        self.corrupt.lock().insert(tile_url(id));
    }

    /// Block every fetch until [`release`](Self::release) is called.
    pub fn hold(&self) {
        *self.gate.closed.lock() = true;
    }

    /// Let blocked and future fetches through.
    pub fn release(&self) {
        *self.gate.closed.lock() = false;
        self.gate.opened.notify_all();
    }

    /// Fetch count for one tile.
    pub fn calls_for(&self, id: TileId) -> usize {
        self.calls.lock().get(&tile_url(id)).copied().unwrap_or(0)
    }

    /// Fetch count over all tiles.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Highest fetch count of any single tile.
    pub fn max_calls_per_tile(&self) -> usize {
        self.calls.lock().values().copied().max().unwrap_or(0)
    }

    /// Fetches of `id` running right now.
    pub fn running_for(&self, id: TileId) -> usize {
        self.concurrency
            .lock()
            .get(&tile_url(id))
            .map_or(0, |entry| entry.running)
    }

    /// Most fetches of `id` ever running at the same time.
    pub fn peak_concurrent_for(&self, id: TileId) -> usize {
        self.concurrency
            .lock()
            .get(&tile_url(id))
            .map_or(0, |entry| entry.peak)
    }

    fn start_running<'a>(&'a self, url: &'a str) -> Running<'a> {
        let mut concurrency = self.concurrency.lock();
        let entry = concurrency.entry(url.to_string()).or_default();
        entry.running += 1;
        entry.peak = entry.peak.max(entry.running);
        Running { fetcher: self, url }
    }

    fn elevations(&self) -> Vec<u8> {
        let n = self.size as usize;
        match self.elevation {
            Elevation::Flat(e) => vec![e; n * n],
            Elevation::RampX => (0..n * n)
                .map(|i| ((i % n) * 255 / (n - 1).max(1)) as u8)
                .collect(),
        }
    }
}

impl RasterFetcher for SyntheticRasterFetcher {
    fn fetch_raster(&self, url: &str) -> Result<HeightmapRaster> {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        let _running = self.start_running(url);

        {
            let mut closed = self.gate.closed.lock();
            while *closed {
                self.gate.opened.wait(&mut closed);
            }
        }

        trace!("Serving synthetic raster {url}");
        if self.failing.lock().contains(url) {
            return Err(Error::Network(format!("connection reset fetching {url}")));
        }
        if self.corrupt.lock().contains(url) {
            return Ok(HeightmapRaster {
                data: vec![0u8; 3].into(),
                width: self.size,
                height: self.size,
            });
        }
        HeightmapRaster::from_elevations(&self.elevations(), self.size, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_centered_on_the_tile_under_the_coordinate() {
        let provider = SyntheticTileProvider::default();
        let center = provider.center_of(TileId::new(4, -2));
        let grid = provider.tile_grid(center, 1).unwrap();

        assert_eq!(grid.len(), 9);
        assert!(grid.iter().all(|d| d.id.grid_distance(TileId::new(4, -2)) <= 1));
        assert_eq!(provider.tile_at(center), TileId::new(4, -2));
    }

    #[test]
    fn stream_returns_only_entering_tiles() {
        let provider = SyntheticTileProvider::default();
        let from = provider.center_of(TileId::new(0, 0));
        let to = provider.center_of(TileId::new(1, 0));

        let update = provider.stream_tiles(to, from, 1).unwrap();
        let ids: Vec<_> = update.new_tiles.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![TileId::new(2, -1), TileId::new(2, 0), TileId::new(2, 1)]);
        assert_eq!(update.removed_tiles.len(), 3);
    }

    #[test]
    fn fetcher_counts_and_fails_per_tile() {
        let fetcher = SyntheticRasterFetcher::new(4);
        fetcher.fail_tile(TileId::new(1, 1));

        assert!(fetcher.fetch_raster(&tile_url(TileId::new(0, 0))).is_ok());
        assert!(fetcher.fetch_raster(&tile_url(TileId::new(1, 1))).is_err());
        assert_eq!(fetcher.total_calls(), 2);
        assert_eq!(fetcher.calls_for(TileId::new(1, 1)), 1);
    }

    #[test]
    fn concurrent_fetches_are_tracked_per_tile() {
        let fetcher = std::sync::Arc::new(SyntheticRasterFetcher::new(4));
        let id = TileId::new(0, 0);
        fetcher.hold();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let fetcher = std::sync::Arc::clone(&fetcher);
                std::thread::spawn(move || fetcher.fetch_raster(&tile_url(id)).is_ok())
            })
            .collect();
        while fetcher.running_for(id) < 2 {
            std::thread::yield_now();
        }
        fetcher.release();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(fetcher.running_for(id), 0);
        assert_eq!(fetcher.peak_concurrent_for(id), 2);
        assert_eq!(fetcher.peak_concurrent_for(TileId::new(1, 0)), 0);
    }

    #[test]
    fn corrupt_rasters_fail_validation() {
        let fetcher = SyntheticRasterFetcher::new(4);
        fetcher.corrupt_tile(TileId::new(0, 0));
        let raster = fetcher.fetch_raster(&tile_url(TileId::new(0, 0))).unwrap();
        assert!(raster.validate().is_err());
    }

    #[test]
    fn ramp_rises_along_x() {
        let fetcher = SyntheticRasterFetcher::new(4).with_elevation(Elevation::RampX);
        let raster = fetcher.fetch_raster("synthetic://0/0").unwrap();
        assert_eq!(raster.elevation(0, 0), 0);
        assert_eq!(raster.elevation(3, 0), 255);
        assert_eq!(raster.elevation(3, 2), 255);
    }
}
