//! Procedural tile backend.

use std::f64::consts::TAU;

use hashbrown::HashSet;
use terrastream_core::{
    Error, GeoCoord, HeightmapRaster, RasterFetcher, Result, TileDescriptor, TileId, TileProvider,
    TileStreamUpdate,
};

/// Serves tiles and rolling-hill heightmaps without a network.
pub struct ProceduralTerrain {
    tile_deg: f64,
    raster_size: u32,
}

impl ProceduralTerrain {
    pub fn new(meters_per_degree: f64, meters_per_tile: f64, raster_size: u32) -> Self {
        Self {
            tile_deg: meters_per_tile / meters_per_degree,
            raster_size: raster_size.max(2),
        }
    }

    fn tile_at(&self, coord: GeoCoord) -> TileId {
        TileId::new(
            (coord.lng / self.tile_deg).floor() as i32,
            (coord.lat / self.tile_deg).floor() as i32,
        )
    }

    fn descriptor(&self, id: TileId) -> TileDescriptor {
        TileDescriptor {
            id,
            center: GeoCoord::new(
                (f64::from(id.y) + 0.5) * self.tile_deg,
                (f64::from(id.x) + 0.5) * self.tile_deg,
            ),
            filename: format!("{}_{}.png", id.x, id.y),
            backend_url: format!("procedural://{}/{}", id.x, id.y),
            cached: true,
        }
    }

    fn area(&self, center: GeoCoord, radius: u32) -> HashSet<TileId> {
        let c = self.tile_at(center);
        let r = radius as i32;
        (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| TileId::new(c.x + dx, c.y + dy)))
            .collect()
    }

    /// Elevation in `0..=1` at a continuous tile-space position.
    fn elevation(x: f64, y: f64) -> f64 {
        let hills = (x * TAU * 0.35).sin() * (y * TAU * 0.25).cos();
        let ridges = ((x + y) * TAU * 0.9).sin() * 0.25;
        ((hills + ridges) * 0.4 + 0.5).clamp(0.0, 1.0)
    }
}

fn parse_url(url: &str) -> Result<TileId> {
    let coords = url
        .strip_prefix("procedural://")
        .ok_or_else(|| Error::NotFound(url.to_string()))?;
    let (x, y) = coords
        .split_once('/')
        .ok_or_else(|| Error::InvalidData(format!("malformed tile url {url}")))?;
    let parse = |s: &str| {
        s.parse::<i32>()
            .map_err(|e| Error::InvalidData(format!("{url}: {e}")))
    };
    Ok(TileId::new(parse(x)?, parse(y)?))
}

impl TileProvider for ProceduralTerrain {
    fn tile_grid(&self, center: GeoCoord, radius: u32) -> Result<Vec<TileDescriptor>> {
        let mut ids: Vec<_> = self.area(center, radius).into_iter().collect();
        ids.sort_unstable();
        Ok(ids.into_iter().map(|id| self.descriptor(id)).collect())
    }

    fn stream_tiles(
        &self,
        current: GeoCoord,
        previous: GeoCoord,
        preload_distance: u32,
    ) -> Result<TileStreamUpdate> {
        let now = self.area(current, preload_distance);
        let before = self.area(previous, preload_distance);

        let mut entering: Vec<_> = now.difference(&before).copied().collect();
        entering.sort_unstable();
        Ok(TileStreamUpdate {
            new_tiles: entering.into_iter().map(|id| self.descriptor(id)).collect(),
            removed_tiles: before.difference(&now).copied().collect(),
        })
    }
}

impl RasterFetcher for ProceduralTerrain {
    fn fetch_raster(&self, url: &str) -> Result<HeightmapRaster> {
        let id = parse_url(url)?;
        let n = self.raster_size;
        let step = 1.0 / f64::from(n - 1);

        let elevations: Vec<u8> = (0..n)
            .flat_map(|py| (0..n).map(move |px| (px, py)))
            .map(|(px, py)| {
                let x = f64::from(id.x) + f64::from(px) * step;
                let y = f64::from(id.y) + f64::from(py) * step;
                (Self::elevation(x, y) * 255.0).round() as u8
            })
            .collect();

        HeightmapRaster::from_elevations(&elevations, n, n)
    }
}
