//! Heightmap mesh construction.

use std::time::Instant;

use glam::Vec3;
use terrastream_core::constants::{RASTER_CHANNELS, TILE_WORLD_SIZE};

use crate::error::{MeshError, Result};
use crate::protocol::{MeshData, MeshRequest, MeshResponse, HEIGHT_SCALE, VERTEX_STRIDE};

/// Samples per axis used by the in-process fallback.
pub const FALLBACK_RESOLUTION: u32 = 16;

/// Read-only view of the elevation channel.
struct Heightfield<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl Heightfield<'_> {
    fn from_request(request: &MeshRequest) -> Result<Heightfield<'_>> {
        if request.width < 2 || request.height < 2 {
            return Err(MeshError::InvalidInput(format!(
                "heightmap {}x{} is smaller than 2x2",
                request.width, request.height
            )));
        }
        if request.resolution < 2 {
            return Err(MeshError::InvalidInput(format!(
                "resolution {} is below 2",
                request.resolution
            )));
        }
        let expected = request.width as usize * request.height as usize * RASTER_CHANNELS;
        if request.heightmap_data.len() != expected {
            return Err(MeshError::InvalidInput(format!(
                "heightmap has {} bytes, expected {expected}",
                request.heightmap_data.len()
            )));
        }
        Ok(Heightfield {
            data: &request.heightmap_data,
            width: request.width,
            height: request.height,
        })
    }

    /// World-space height at pixel `(x, y)`.
    #[inline]
    fn height_at(&self, x: u32, y: u32) -> f32 {
        let i = (y as usize * self.width as usize + x as usize) * RASTER_CHANNELS;
        f32::from(self.data[i]) / 255.0 * HEIGHT_SCALE
    }

    /// Surface normal at pixel `(x, y)` from central differences.
    fn normal_at(&self, x: u32, y: u32) -> Vec3 {
        let spacing_x = TILE_WORLD_SIZE / (self.width - 1) as f32;
        let spacing_z = TILE_WORLD_SIZE / (self.height - 1) as f32;

        let (x0, x1) = (x.saturating_sub(1), (x + 1).min(self.width - 1));
        let (y0, y1) = (y.saturating_sub(1), (y + 1).min(self.height - 1));

        let dh_dx = (self.height_at(x1, y) - self.height_at(x0, y)) / ((x1 - x0) as f32 * spacing_x);
        let dh_dz = (self.height_at(x, y1) - self.height_at(x, y0)) / ((y1 - y0) as f32 * spacing_z);

        Vec3::new(-dh_dx, 1.0, -dh_dz).normalize()
    }
}

/// Pixel index of sample `i` out of `samples` across `extent` pixels.
#[inline]
fn sample_pixel(i: u32, samples: u32, extent: u32) -> u32 {
    let step = (extent - 1) as f32 / (samples - 1) as f32;
    ((i as f32 * step).round() as u32).min(extent - 1)
}

/// Two triangles per quad over a `cols x rows` vertex grid.
fn grid_indices(cols: u32, rows: u32) -> Vec<u32> {
    let mut indices = Vec::with_capacity(((cols - 1) * (rows - 1) * 6) as usize);
    for j in 0..rows - 1 {
        for i in 0..cols - 1 {
            let a = j * cols + i;
            let b = a + 1;
            let c = a + cols;
            let d = c + 1;
            indices.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }
    indices
}

fn grid_mesh(
    request: &MeshRequest,
    field: &Heightfield<'_>,
    cols: u32,
    rows: u32,
    smooth_normals: bool,
) -> MeshData {
    let origin = request.world_position;
    let mut vertices = Vec::with_capacity((cols * rows) as usize * VERTEX_STRIDE);

    for j in 0..rows {
        let v = j as f32 / (rows - 1) as f32;
        let py = sample_pixel(j, rows, field.height);
        for i in 0..cols {
            let u = i as f32 / (cols - 1) as f32;
            let px = sample_pixel(i, cols, field.width);

            let normal = if smooth_normals {
                field.normal_at(px, py)
            } else {
                Vec3::Y
            };

            vertices.extend_from_slice(&[
                origin.x + u * TILE_WORLD_SIZE,
                field.height_at(px, py),
                origin.z + v * TILE_WORLD_SIZE,
                normal.x,
                normal.y,
                normal.z,
                u,
                v,
            ]);
        }
    }

    let indices = grid_indices(cols, rows);
    MeshData {
        vertex_count: cols * rows,
        index_count: indices.len() as u32,
        vertices,
        indices,
    }
}

/// Build the full-quality mesh for a heightmap.
///
/// The grid has `min(resolution, width) x min(resolution, height)` vertices
/// with normals from central-difference height gradients.
pub fn build_mesh(request: &MeshRequest) -> Result<MeshData> {
    let field = Heightfield::from_request(request)?;
    let cols = request.resolution.min(field.width);
    let rows = request.resolution.min(field.height);
    Ok(grid_mesh(request, &field, cols, rows, true))
}

/// Build the simplified mesh used when no worker is available.
///
/// This is not output-identical to [`build_mesh`]: the grid is capped at
/// [`FALLBACK_RESOLUTION`] samples per axis and every normal points straight up.
pub fn build_fallback_mesh(request: &MeshRequest) -> Result<MeshData> {
    let field = Heightfield::from_request(request)?;
    let cap = request.resolution.min(FALLBACK_RESOLUTION);
    let cols = cap.min(field.width);
    let rows = cap.min(field.height);
    Ok(grid_mesh(request, &field, cols, rows, false))
}

/// Run `build` and wrap the outcome in a response.
pub(crate) fn respond(request: &MeshRequest, build: fn(&MeshRequest) -> Result<MeshData>) -> MeshResponse {
    let start = Instant::now();
    let outcome = build(request);
    let processing_time = start.elapsed();
    match outcome {
        Ok(mesh) => MeshResponse {
            tile_id: request.tile_id,
            success: true,
            mesh_data: Some(mesh),
            error: None,
            processing_time,
        },
        Err(e) => MeshResponse {
            tile_id: request.tile_id,
            success: false,
            mesh_data: None,
            error: Some(e.to_string()),
            processing_time,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorldOffset;
    use approx::assert_abs_diff_eq;
    use terrastream_core::TileId;

    fn request(elevations: &[u8], width: u32, height: u32, resolution: u32) -> MeshRequest {
        let data: Vec<u8> = elevations.iter().flat_map(|&e| [e, e, e, 255]).collect();
        MeshRequest {
            tile_id: TileId::new(0, 0),
            heightmap_data: data.into(),
            width,
            height,
            resolution,
            world_position: WorldOffset::default(),
        }
    }

    fn flat(size: u32, elevation: u8, resolution: u32) -> MeshRequest {
        request(&vec![elevation; (size * size) as usize], size, size, resolution)
    }

    #[test]
    fn flat_heightmap_has_up_normals_and_constant_height() {
        let mesh = build_mesh(&flat(32, 128, 16)).unwrap();
        assert_eq!(mesh.vertex_count, 16 * 16);
        assert_eq!(mesh.vertices.len(), 16 * 16 * VERTEX_STRIDE);

        let expected_y = 128.0 / 255.0 * HEIGHT_SCALE;
        for i in 0..mesh.vertex_count as usize {
            let [nx, ny, nz] = mesh.normal(i);
            assert_abs_diff_eq!(nx, 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(ny, 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(nz, 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(mesh.position(i)[1], expected_y, epsilon = 1e-5);
        }
    }

    #[test]
    fn vertex_count_is_capped_by_raster_size() {
        let mesh = build_mesh(&flat(8, 0, 64)).unwrap();
        assert_eq!(mesh.vertex_count, 8 * 8);

        let wide = request(&vec![0; 20 * 4], 20, 4, 10);
        let mesh = build_mesh(&wide).unwrap();
        assert_eq!(mesh.vertex_count, 10 * 4);
    }

    #[test]
    fn index_list_is_two_triangles_per_quad() {
        let mesh = build_mesh(&flat(4, 0, 4)).unwrap();
        assert_eq!(mesh.index_count, 3 * 3 * 6);
        assert_eq!(&mesh.indices[..6], &[0, 4, 1, 1, 4, 5]);
        assert!(mesh.indices.iter().all(|&i| i < mesh.vertex_count));
    }

    #[test]
    fn uvs_span_unit_square() {
        let mesh = build_mesh(&flat(5, 0, 5)).unwrap();
        assert_eq!(mesh.uv(0), [0.0, 0.0]);
        assert_eq!(mesh.uv(mesh.vertex_count as usize - 1), [1.0, 1.0]);
    }

    #[test]
    fn positions_are_offset_by_world_position() {
        let mut req = flat(3, 0, 3);
        req.world_position = WorldOffset { x: 200.0, z: -100.0 };
        let mesh = build_mesh(&req).unwrap();

        assert_abs_diff_eq!(mesh.position(0)[0], 200.0);
        assert_abs_diff_eq!(mesh.position(0)[2], -100.0);
        let last = mesh.position(8);
        assert_abs_diff_eq!(last[0], 200.0 + TILE_WORLD_SIZE);
        assert_abs_diff_eq!(last[2], -100.0 + TILE_WORLD_SIZE);
    }

    #[test]
    fn slope_tilts_normals_against_gradient() {
        // Elevation increases along +x.
        let size = 8u32;
        let elevations: Vec<u8> = (0..size * size).map(|i| ((i % size) * 30) as u8).collect();
        let mesh = build_mesh(&request(&elevations, size, size, size)).unwrap();

        for i in 0..mesh.vertex_count as usize {
            let [nx, ny, nz] = mesh.normal(i);
            assert!(nx < 0.0);
            assert!(ny > 0.0);
            assert_abs_diff_eq!(nz, 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(nx * nx + ny * ny + nz * nz, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn invalid_input_is_rejected() {
        assert!(build_mesh(&request(&[0; 3], 3, 1, 4)).is_err());
        assert!(build_mesh(&flat(4, 0, 1)).is_err());

        let mut bad_len = flat(4, 0, 4);
        bad_len.heightmap_data = vec![0u8; 7].into();
        assert!(matches!(build_mesh(&bad_len), Err(MeshError::InvalidInput(_))));
    }

    #[test]
    fn fallback_is_coarser_and_flat_shaded() {
        let size = 64u32;
        let elevations: Vec<u8> = (0..size * size).map(|i| ((i % size) * 4) as u8).collect();
        let req = request(&elevations, size, size, 64);

        let full = build_mesh(&req).unwrap();
        let fallback = build_fallback_mesh(&req).unwrap();

        assert_eq!(full.vertex_count, 64 * 64);
        assert_eq!(fallback.vertex_count, FALLBACK_RESOLUTION * FALLBACK_RESOLUTION);
        for i in 0..fallback.vertex_count as usize {
            assert_eq!(fallback.normal(i), [0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn respond_reports_failures() {
        let response = respond(&flat(4, 0, 1), build_mesh);
        assert!(!response.success);
        assert!(response.mesh_data.is_none());
        assert!(response.error.is_some());

        let response = respond(&flat(4, 0, 4), build_mesh);
        assert!(response.success);
        assert_eq!(response.mesh_data.unwrap().vertex_count, 16);
    }
}
