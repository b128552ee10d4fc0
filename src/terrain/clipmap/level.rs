//! One clipmap level: a toroidal `N x N` vertex ring and its strip indices.
//!
//! World coordinates below are in finest-sample units. Level `n` places a
//! vertex every `2^n` units, and its window origin is snapped to a multiple of
//! `2^(n+1)` so it sits on the grid of the next coarser level.

use std::sync::Arc;

use glam::Vec3;

use super::culling::{Aabb, FrustumPlanes};
use super::vertex::ClipmapVertex;
use crate::core::ring_index::RingIndex;
use crate::error::{ClipmapError, ClipmapResult};
use crate::terrain::config::is_valid_clip_side;
use crate::terrain::level_chain::ChainRef;
use crate::terrain::terrain_cache::TerrainGridCache;
use crate::terrain::tiling::Region;

/// Counters from one index rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub emitted: u32,
    pub culled: u32,
}

pub struct ClipLevel {
    level: u32,
    cache: Arc<TerrainGridCache>,
    clip_side: i32,
    ring: RingIndex,
    vertex_distance: i32,
    frame_size: i32,
    frame_distance: i32,
    clip_region: Region,
    intersection_region: Region,
    vertices: Vec<ClipmapVertex>,
    indices: Vec<u32>,
    /// World transform of local coordinates, height scale on y
    scale: Vec3,
    height_range: (f32, f32),
    culling_enabled: bool,
    last_eye: Option<(i32, i32)>,
    initialized: bool,
    stats: BlockStats,
}

impl ClipLevel {
    pub fn new(level: u32, cache: Arc<TerrainGridCache>, clip_side: u32, scale: Vec3) -> ClipmapResult<Self> {
        if !is_valid_clip_side(clip_side) {
            return Err(ClipmapError::configuration(format!(
                "clip side size {} must be 2^k - 1 and at least 7",
                clip_side
            )));
        }
        if level >= 30 {
            return Err(ClipmapError::configuration(format!("level {} is out of range", level)));
        }
        let n = clip_side as i32;
        let vertex_distance = 1i32 << level;
        let frame_size = (n + 1) / 4;
        let span = (n - 1) * vertex_distance;
        let height_range = cache.height_range();
        let index_capacity = 4 * (3 * frame_size * frame_size + n * n / 2 + 4 * frame_size - 10);

        Ok(Self {
            level,
            cache,
            clip_side: n,
            ring: RingIndex::new(clip_side),
            vertex_distance,
            frame_size,
            frame_distance: (frame_size - 1) * vertex_distance,
            clip_region: Region::new(level, 0, 0, span, span),
            intersection_region: Region::new(level, 0, 0, n * vertex_distance, n * vertex_distance),
            vertices: vec![ClipmapVertex::default(); (n * n) as usize],
            indices: Vec::with_capacity(index_capacity.max(0) as usize),
            scale,
            height_range,
            culling_enabled: true,
            last_eye: None,
            initialized: false,
            stats: BlockStats::default(),
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn cache(&self) -> &Arc<TerrainGridCache> {
        &self.cache
    }

    pub fn clip_side(&self) -> u32 {
        self.clip_side as u32
    }

    pub fn vertex_distance(&self) -> i32 {
        self.vertex_distance
    }

    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    pub fn clip_region(&self) -> Region {
        self.clip_region
    }

    pub fn intersection_region(&self) -> Region {
        self.intersection_region
    }

    pub fn vertices(&self) -> &[ClipmapVertex] {
        &self.vertices
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        ClipmapVertex::as_bytes(&self.vertices)
    }

    /// Triangle strip indices from the last rebuild
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn block_stats(&self) -> BlockStats {
        self.stats
    }

    pub fn is_ready(&self) -> bool {
        self.cache.is_valid()
    }

    pub fn set_height_range(&mut self, min: f32, max: f32) {
        self.height_range = (min, max);
    }

    pub fn height_range(&self) -> (f32, f32) {
        self.height_range
    }

    pub fn culling_enabled(&self) -> bool {
        self.culling_enabled
    }

    pub fn set_culling_enabled(&mut self, enabled: bool) {
        self.culling_enabled = enabled;
    }

    /// Vertex at level sample `(x, z)`, wherever the ring currently keeps it
    pub fn vertex_at(&self, x: i32, z: i32) -> ClipmapVertex {
        self.vertices[self.ring.linear(x, z)]
    }

    /// Force the next vertex update to refill the whole ring
    pub fn mark_stale(&mut self) {
        self.initialized = false;
    }

    /// Window origin for an eye at local `(cx, cz)`, snapped to the coarser grid
    pub fn snapped_origin(&self, cx: i32, cz: i32) -> (i32, i32) {
        let double = 2 * self.vertex_distance;
        let half = (self.clip_side + 1) * self.vertex_distance / 2;
        let snap = |value: i32| value + double - value.rem_euclid(double);
        (snap(cx - half), snap(cz - half))
    }

    /// Re-center the cache window without touching vertices. Used for levels
    /// that load in the background before they become visible.
    pub fn update_cache(&self, cx: i32, cz: i32) {
        let (x, z) = self.snapped_origin(cx, cz);
        self.position_cache(x, z);
    }

    fn position_cache(&self, x: i32, z: i32) {
        let center = self.clip_side / 2;
        self.cache
            .set_current_position(x / self.vertex_distance + center, z / self.vertex_distance + center);
    }

    /// Move the window to follow the eye and refresh the newly exposed
    /// L-shaped border. Returns the number of vertices written.
    pub fn update_vertices(&mut self, cx: i32, cz: i32, coarser: &[Arc<TerrainGridCache>]) -> usize {
        if self.initialized && self.last_eye == Some((cx, cz)) {
            return 0;
        }
        self.last_eye = Some((cx, cz));

        let (old_x, old_z) = (self.clip_region.x, self.clip_region.y);
        let (x, z) = self.snapped_origin(cx, cz);
        self.clip_region.set_origin(x, z);
        self.intersection_region.set_origin(x, z);
        self.position_cache(x, z);

        if !self.initialized {
            self.initialized = true;
            return self.regenerate(coarser);
        }
        let dx = (x - old_x) / self.vertex_distance;
        let dz = (z - old_z) / self.vertex_distance;
        self.refresh_border(dx, dz, coarser)
    }

    /// Refill every vertex from the cache
    pub fn regenerate(&mut self, coarser: &[Arc<TerrainGridCache>]) -> usize {
        let xmin = self.clip_region.left() / self.vertex_distance;
        let zmin = self.clip_region.top() / self.vertex_distance;
        self.refresh(xmin, zmin, self.clip_side, self.clip_side, coarser)
    }

    /// Refill level samples `[x, x + width) x [y, y + height)`
    pub fn refresh(&mut self, x: i32, y: i32, width: i32, height: i32, coarser: &[Arc<TerrainGridCache>]) -> usize {
        if width <= 0 || height <= 0 {
            return 0;
        }
        let chain = ChainRef::new(self.cache.as_ref(), coarser);
        chain.update_region(&mut self.vertices, x, y, width, height);
        (width * height) as usize
    }

    fn refresh_border(&mut self, dx: i32, dz: i32, coarser: &[Arc<TerrainGridCache>]) -> usize {
        if dx == 0 && dz == 0 {
            return 0;
        }
        let limit = self.clip_side - 1;
        let dx = dx.clamp(-limit, limit);
        let dz = dz.clamp(-limit, limit);

        let xmin = self.clip_region.left() / self.vertex_distance;
        let xmax = self.clip_region.right() / self.vertex_distance;
        let zmin = self.clip_region.top() / self.vertex_distance;
        let zmax = self.clip_region.bottom() / self.vertex_distance;
        let full = xmax - xmin + 1;

        let mut written = 0;
        if dz > 0 {
            if dx > 0 {
                written += self.refresh(xmax - dx, zmin, dx + 1, zmax - zmin - dz + 1, coarser);
            } else if dx < 0 {
                written += self.refresh(xmin, zmin, -dx + 1, zmax - zmin - dz + 1, coarser);
            }
            written += self.refresh(xmin, zmax - dz, full, dz + 1, coarser);
        } else {
            if dx > 0 {
                written += self.refresh(xmax - dx, zmin - dz, dx + 1, zmax - zmin + dz + 1, coarser);
            } else if dx < 0 {
                written += self.refresh(xmin, zmin - dz, -dx + 1, zmax - zmin + dz + 1, coarser);
            }
            if dz < 0 {
                written += self.refresh(xmin, zmin, full, -dz + 1, coarser);
            }
        }
        written
    }

    /// Rebuild the strip indices. `finer` is the next finer visible level; the
    /// finest visible level passes `None` and fills the center hole itself.
    pub fn update_indices(&mut self, finer: Option<&ClipLevel>, frustum: Option<&FrustumPlanes>) {
        self.indices.clear();
        self.stats = BlockStats::default();
        let frustum = frustum.filter(|_| self.culling_enabled);

        let l = self.clip_region.left();
        let r = self.clip_region.right();
        let t = self.clip_region.top();
        let b = self.clip_region.bottom();
        let f = self.frame_distance;
        let vd = self.vertex_distance;
        let dvd = 2 * vd;

        let mut blocks = vec![
            // Ring blocks, row by row
            (l, l + f, t, t + f),
            (l + f, l + 2 * f, t, t + f),
            (r - 2 * f, r - f, t, t + f),
            (r - f, r, t, t + f),
            (l, l + f, t + f, t + 2 * f),
            (r - f, r, t + f, t + 2 * f),
            (l, l + f, b - 2 * f, b - f),
            (r - f, r, b - 2 * f, b - f),
            (l, l + f, b - f, b),
            (l + f, l + 2 * f, b - f, b),
            (r - 2 * f, r - f, b - f, b),
            (r - f, r, b - f, b),
            // Fixups
            (l + 2 * f, l + 2 * f + dvd, t, t + f),
            (l, l + f, t + 2 * f, t + 2 * f + dvd),
            (r - f, r, t + 2 * f, t + 2 * f + dvd),
            (l + 2 * f, l + 2 * f + dvd, b - f, b),
        ];

        match finer {
            Some(finer) => {
                let finer_region = finer.clip_region();
                let left = (finer_region.x - self.clip_region.x) / vd == self.frame_size;
                let upper = (finer_region.y - self.clip_region.y) / vd == self.frame_size;
                match (left, upper) {
                    (true, true) => {
                        blocks.push((l + f, r - f, t + f, t + f + vd));
                        blocks.push((l + f, l + f + vd, t + f + vd, b - f));
                    }
                    (true, false) => {
                        blocks.push((l + f, l + f + vd, t + f, b - f - vd));
                        blocks.push((l + f, r - f, b - f - vd, b - f));
                    }
                    (false, true) => {
                        blocks.push((l + f, r - f, t + f, t + f + vd));
                        blocks.push((r - f - vd, r - f, t + f + vd, b - f));
                    }
                    (false, false) => {
                        blocks.push((r - f - vd, r - f, t + f, b - f - vd));
                        blocks.push((l + f, r - f, b - f - vd, b - f));
                    }
                }
            }
            None => {
                let mid = self.frame_size * vd;
                let (il, it) = (l + f, t + f);
                blocks.push((il, il + mid, it, it + mid));
                blocks.push((il + mid, r - f, it, it + mid));
                blocks.push((il, il + mid, it + mid, b - f));
                blocks.push((il + mid, r - f, it + mid, b - f));
            }
        }

        for (left, right, top, bottom) in blocks {
            self.fill_block(left, right, top, bottom, frustum);
        }
    }

    fn block_bounds(&self, left: i32, right: i32, top: i32, bottom: i32) -> Aabb {
        let (min, max) = self.height_range;
        let hs = self.scale.y;
        let center = Vec3::new(
            (left + right) as f32 * 0.5,
            (max + min) * hs * 0.5,
            (top + bottom) as f32 * 0.5,
        );
        let extent = Vec3::new(
            (right - left) as f32 * 0.5,
            (max - min) * hs * 0.5,
            (bottom - top) as f32 * 0.5,
        );
        Aabb::new(center, extent).scaled(Vec3::new(self.scale.x, 1.0, self.scale.z))
    }

    fn fill_block(&mut self, left: i32, right: i32, top: i32, bottom: i32, frustum: Option<&FrustumPlanes>) {
        if let Some(frustum) = frustum {
            if !frustum.intersects_aabb(&self.block_bounds(left, right, top, bottom)) {
                self.stats.culled += 1;
                return;
            }
        }
        self.stats.emitted += 1;

        let n = self.clip_side;
        let vd = self.vertex_distance;
        let left = left.div_euclid(vd).rem_euclid(n);
        let right = right.div_euclid(vd).rem_euclid(n);
        let top = top.div_euclid(vd).rem_euclid(n);
        let bottom = bottom.div_euclid(vd).rem_euclid(n);

        if bottom < top {
            for z in top..n - 1 {
                self.fill_row(left, right, z, z + 1);
            }
            self.fill_row(left, right, n - 1, 0);
            for z in 0..bottom {
                self.fill_row(left, right, z, z + 1);
            }
        } else {
            for z in top..bottom {
                self.fill_row(left, right, z, z + 1);
            }
        }
    }

    /// One strip between rows `z` and `z1`, wrapping columns when `start > end`
    fn fill_row(&mut self, start: i32, end: i32, z: i32, z1: i32) {
        let n = self.clip_side;
        self.add_index(start, z1);
        if start <= end {
            for x in start..=end {
                self.add_index(x, z1);
                self.add_index(x, z);
            }
        } else {
            for x in (start..n).chain(0..=end) {
                self.add_index(x, z1);
                self.add_index(x, z);
            }
        }
        self.add_index(end, z);
    }

    fn add_index(&mut self, x: i32, z: i32) {
        self.indices.push((x + z * self.clip_side) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tile_pool::TilePool;
    use crate::terrain::config::TerrainConfiguration;
    use crate::terrain::grid_cache::{GridCacheParams, TaskState};
    use crate::terrain::source::{InMemoryTerrainSource, TerrainSource};
    use crate::terrain::tiling::Tile;
    use glam::Mat4;

    const SIDE: u32 = 15;

    fn height(x: usize, z: usize) -> f32 {
        (x * 3 + z * 7) as f32
    }

    fn level_over_plane(level: u32) -> ClipLevel {
        let config = TerrainConfiguration::new(1, 8, Vec3::ONE, (0.0, 10_000.0));
        let source: Arc<dyn TerrainSource> = Arc::new(InMemoryTerrainSource::from_fn(64, config, height).unwrap());
        let pool = Arc::new(TilePool::new(1).unwrap());
        let params = GridCacheParams::new(7, 8, level, 0).with_vertex_distance(1 << level);
        let cache = Arc::new(TerrainGridCache::new(params, source, pool, SIDE));
        for y in 0..7 {
            for x in 0..7 {
                assert_eq!(cache.copy_tile_data(Tile::new(x, y), x, y), TaskState::Finished);
            }
        }
        ClipLevel::new(level, cache, SIDE, Vec3::ONE).unwrap()
    }

    #[test]
    fn test_rejects_bad_clip_side() {
        let level = level_over_plane(0);
        let cache = Arc::clone(level.cache());
        assert!(ClipLevel::new(0, Arc::clone(&cache), 16, Vec3::ONE).is_err());
        assert!(ClipLevel::new(0, cache, 3, Vec3::ONE).is_err());
    }

    #[test]
    fn test_frame_constants() {
        let level = level_over_plane(1);
        assert_eq!(level.vertex_distance(), 2);
        assert_eq!(level.frame_size(), 4);
        assert_eq!(level.clip_region().width, 28);
        assert_eq!(level.intersection_region().width, 30);
    }

    #[test]
    fn test_origin_nests_in_coarser_window() {
        let fine = level_over_plane(0);
        let coarse = level_over_plane(1);
        for cx in -20..20 {
            for cz in [-9, 0, 13] {
                let (fx, fz) = fine.snapped_origin(cx, cz);
                let (kx, kz) = coarse.snapped_origin(cx, cz);
                assert_eq!(fx.rem_euclid(2), 0);
                assert_eq!(kx.rem_euclid(4), 0);
                let offset_x = (fx - kx) / 2;
                let offset_z = (fz - kz) / 2;
                assert!(offset_x == 3 || offset_x == 4, "x offset {}", offset_x);
                assert!(offset_z == 3 || offset_z == 4, "z offset {}", offset_z);
            }
        }
    }

    #[test]
    fn test_vertices_follow_source() {
        let mut level = level_over_plane(0);
        let written = level.update_vertices(30, 30, &[]);
        assert_eq!(written, (SIDE * SIDE) as usize);

        let region = level.clip_region();
        for (x, z) in [(region.left(), region.top()), (region.right(), region.bottom()), (30, 28)] {
            let vertex = level.vertex_at(x, z);
            assert_eq!(vertex.position, [x as f32, height(x as usize, z as usize), z as f32]);
            // No coarser level: blend height equals own height
            assert_eq!(vertex.coarse_height, vertex.height());
        }
    }

    #[test]
    fn test_stationary_eye_skips_update() {
        let mut level = level_over_plane(0);
        level.update_vertices(30, 30, &[]);
        assert_eq!(level.update_vertices(30, 30, &[]), 0);
        level.mark_stale();
        assert_eq!(level.update_vertices(30, 30, &[]), (SIDE * SIDE) as usize);
    }

    #[test]
    fn test_refresh_is_bounded_by_movement() {
        let mut level = level_over_plane(0);
        level.update_vertices(30, 30, &[]);

        // Two samples along x exposes a three column strip
        assert_eq!(level.update_vertices(32, 30, &[]), 3 * SIDE as usize);
        // Diagonal move writes an L of two strips
        assert_eq!(level.update_vertices(30, 32, &[]), 3 * (SIDE as usize - 2) + 3 * SIDE as usize);

        let region = level.clip_region();
        for z in region.top()..=region.bottom() {
            for x in region.left()..=region.right() {
                assert_eq!(level.vertex_at(x, z).height(), height(x as usize, z as usize));
            }
        }
    }

    #[test]
    fn test_index_count_without_culling() {
        let mut level = level_over_plane(0);
        level.update_vertices(30, 30, &[]);
        level.update_indices(None, None);

        // 12 ring blocks, 4 fixups and 4 center patches
        assert_eq!(level.block_stats(), BlockStats { emitted: 20, culled: 0 });
        assert_eq!(level.index_count(), 640);
        assert!(level.indices().iter().all(|&i| i < SIDE * SIDE));
    }

    #[test]
    fn test_stitch_replaces_center_patches() {
        let mut fine = level_over_plane(0);
        let mut coarse = level_over_plane(1);
        fine.update_vertices(30, 30, &[]);
        coarse.update_vertices(30, 30, &[]);
        coarse.update_indices(Some(&fine), None);

        assert_eq!(coarse.block_stats().emitted, 18);
        assert_eq!(coarse.index_count(), 360 + 88 + 62);
    }

    #[test]
    fn test_culling_drops_blocks_behind_camera() {
        let mut level = level_over_plane(0);
        level.set_height_range(0.0, 10.0);
        level.update_vertices(30, 30, &[]);

        let eye = Vec3::new(30.0, 50.0, 30.0);
        let away = Mat4::perspective_rh(45f32.to_radians(), 1.0, 0.1, 1000.0)
            * Mat4::look_at_rh(eye, eye + Vec3::Y, Vec3::Z);
        level.update_indices(None, Some(&FrustumPlanes::from_view_proj(away)));
        assert_eq!(level.index_count(), 0);
        assert_eq!(level.block_stats().culled, 20);

        let down = Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 5000.0)
            * Mat4::look_at_rh(Vec3::new(30.0, 2000.0, 30.0), Vec3::new(30.0, 0.0, 30.0), Vec3::Z);
        level.update_indices(None, Some(&FrustumPlanes::from_view_proj(down)));
        assert_eq!(level.block_stats().emitted, 20);

        level.set_culling_enabled(false);
        level.update_indices(None, Some(&FrustumPlanes::from_view_proj(away)));
        assert_eq!(level.index_count(), 640);
    }
}
