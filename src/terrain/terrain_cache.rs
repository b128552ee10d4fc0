//! Height grid cache with coarser-level fallback.
//!
//! Samples are addressed in the cache's own level units: sample `(x, z)` of
//! level `n` sits at `(x, z) * 2^n` finest units, so the coarser level holds
//! the same point at `(x / 2, z / 2)`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::ring_index::{floor_div, RingIndex};
use crate::core::tile_pool::{CancelToken, TilePool};
use crate::terrain::clipmap::vertex::ClipmapVertex;
use crate::terrain::grid_cache::{
    GridCacheCore, GridCacheParams, SlotGrid, SourceSlots, TaskState, TileStore, WindowChange,
};
use crate::terrain::level_chain::ChainRef;
use crate::terrain::source::TerrainSource;
use crate::terrain::tiling::Tile;

pub struct TerrainGridCache {
    core: GridCacheCore,
    store: Arc<SourceSlots<dyn TerrainSource>>,
    height_range: (f32, f32),
    height_scale: f32,
    destination: RingIndex,
    vertex_distance: i32,
}

impl TerrainGridCache {
    /// `destination_size` is the side of the vertex ring this cache fills
    pub fn new(
        params: GridCacheParams,
        source: Arc<dyn TerrainSource>,
        pool: Arc<TilePool>,
        destination_size: u32,
    ) -> Self {
        let configuration = source.configuration();
        let slots = SlotGrid::new(params.cache_size, params.tile_size, 1, 0.0f32);
        let store = Arc::new(SourceSlots::new(source, params.data_level, slots));
        let vertex_distance = params.vertex_distance;
        let core = GridCacheCore::new(params, Arc::clone(&store) as Arc<dyn TileStore>, pool);
        Self {
            core,
            store,
            height_range: configuration.height_range,
            height_scale: configuration.scale.y,
            destination: RingIndex::new(destination_size),
            vertex_distance,
        }
    }

    pub fn core(&self) -> &GridCacheCore {
        &self.core
    }

    pub fn vertex_distance(&self) -> i32 {
        self.vertex_distance
    }

    pub fn set_current_position(&self, x: i32, y: i32) -> Option<WindowChange> {
        self.core.set_current_position(x, y)
    }

    pub fn check_for_updates(&self) -> usize {
        self.core.check_for_updates()
    }

    pub fn handle_update_requests(&self) -> Option<HashSet<Tile>> {
        self.core.handle_update_requests()
    }

    pub fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    /// Load `source` into slot `(dest_x, dest_y)` on the calling thread
    pub fn copy_tile_data(&self, source: Tile, dest_x: i32, dest_y: i32) -> TaskState {
        self.store
            .copy_tile_data(source, Tile::new(dest_x, dest_y), &CancelToken::new())
    }

    pub fn get_valid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Option<HashSet<Tile>> {
        self.store.valid_tiles(x, y, width, height).unwrap_or_else(|err| {
            log::warn!("level {}: valid tile query failed: {}", self.core.level(), err);
            None
        })
    }

    pub fn get_invalid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Option<HashSet<Tile>> {
        self.store.invalid_tiles(x, y, width, height).unwrap_or_else(|err| {
            log::warn!("level {}: invalid tile query failed: {}", self.core.level(), err);
            None
        })
    }

    /// Height returned when no level has data
    pub fn default_height(&self) -> f32 {
        self.height_range.0 * self.height_scale
    }

    pub fn height_range(&self) -> (f32, f32) {
        self.height_range
    }

    /// Scaled height from this level alone; `None` when its slot is not loaded
    pub fn local_height(&self, x: i32, z: i32) -> Option<f32> {
        let (min, max) = self.height_range;
        self.store.slots().read(x, z, |sample| {
            let raw = sample[0];
            if raw < min || raw > max {
                min * self.height_scale
            } else {
                raw * self.height_scale
            }
        })
    }

    fn is_loaded_at(&self, x: i32, z: i32) -> bool {
        self.store.slots().covers(x, z)
    }
}

fn lerp(t: f32, a: f32, b: f32) -> f32 {
    a + (b - a) * t
}

impl<'a> ChainRef<'a, TerrainGridCache> {
    /// Height at an integer sample, degrading to coarser levels when this one
    /// has no data and `try_parent` is set
    pub fn get_height(&self, x: i32, z: i32, try_parent: bool) -> f32 {
        if let Some(height) = self.local_height(x, z) {
            return height;
        }
        match self.parent() {
            Some(parent) if try_parent => {
                if x.rem_euclid(2) == 0 && z.rem_euclid(2) == 0 {
                    parent.get_height(x / 2, z / 2, true)
                } else {
                    parent.get_sub_height(x as f32 / 2.0, z as f32 / 2.0, true)
                }
            }
            _ => self.default_height(),
        }
    }

    /// Bilinear height at a fractional sample position
    pub fn get_sub_height(&self, x: f32, z: f32, try_parent: bool) -> f32 {
        let col = x.floor();
        let row = z.floor();
        let (cx, cz) = (col as i32, row as i32);

        if !self.is_loaded_at(cx, cz) {
            return match self.parent() {
                Some(parent) if try_parent => parent.get_sub_height(x / 2.0, z / 2.0, true),
                _ => self.default_height(),
            };
        }

        let fx = x - col;
        let fz = z - row;
        let top_left = self.get_height(cx, cz, try_parent);
        let top_right = self.get_height(cx + 1, cz, try_parent);
        let bottom_left = self.get_height(cx, cz + 1, try_parent);
        let bottom_right = self.get_height(cx + 1, cz + 1, try_parent);
        lerp(fz, lerp(fx, top_left, top_right), lerp(fx, bottom_left, bottom_right))
    }

    /// Height the coarser level gives at sample `(x, z)` of this level
    fn coarse_height(&self, x: i32, z: i32, fallback: f32) -> f32 {
        let Some(parent) = self.parent() else {
            return fallback;
        };
        let x1 = floor_div(x, 2);
        let mut z1 = floor_div(z, 2);
        let on_grid_x = x.rem_euclid(2) == 0;
        let on_grid_z = z.rem_euclid(2) == 0;
        if on_grid_x && on_grid_z {
            return parent.get_height(x1, z1, true);
        }

        let (mut x2, mut z2) = (x1, z1);
        match (on_grid_x, on_grid_z) {
            (false, true) => x2 += 1,
            (true, false) => z2 += 1,
            _ => {
                // Diagonal midpoint: sample the anti-diagonal pair
                x2 += 1;
                z1 += 1;
            }
        }
        (parent.get_height(x1, z1, true) + parent.get_height(x2, z2, true)) * 0.5
    }

    /// Write `width x height` samples starting at `(source_x, source_y)` into
    /// the vertex ring, each with its coarse-level blend height
    pub fn update_region(
        &self,
        destination: &mut [ClipmapVertex],
        source_x: i32,
        source_y: i32,
        width: i32,
        height: i32,
    ) {
        let vd = self.vertex_distance as f32;
        for z in 0..height {
            let current_z = source_y + z;
            for x in 0..width {
                let current_x = source_x + x;
                let index = self.destination.linear(current_x, current_z);
                let Some(vertex) = destination.get_mut(index) else {
                    continue;
                };
                let h = self.get_height(current_x, current_z, true);
                let w = self.coarse_height(current_x, current_z, h);
                *vertex = ClipmapVertex::new(current_x as f32 * vd, h, current_z as f32 * vd, w);
            }
        }
    }
}
