//! Color grid cache with coarser-level fallback.
//!
//! Colors travel as packed `0xRRGGBBAA` integers. Sources without alpha store
//! three bytes per texel and read back with alpha 0.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::ring_index::RingIndex;
use crate::core::tile_pool::{CancelToken, TilePool};
use crate::terrain::grid_cache::{
    GridCacheCore, GridCacheParams, SlotGrid, SourceSlots, TaskState, TileStore, WindowChange,
};
use crate::terrain::level_chain::ChainRef;
use crate::terrain::source::TextureSource;
use crate::terrain::tiling::Tile;

/// Packed RGBA helpers
pub mod color {
    pub fn pack(r: u8, g: u8, b: u8, a: u8) -> u32 {
        (r as u32) << 24 | (g as u32) << 16 | (b as u32) << 8 | a as u32
    }

    pub fn unpack(color: u32) -> [u8; 4] {
        color.to_be_bytes()
    }

    /// Per-channel linear blend, truncating toward zero
    pub fn lerp(t: f32, a: u32, b: u32) -> u32 {
        let a = unpack(a);
        let b = unpack(b);
        let mut out = [0u8; 4];
        for (channel, (ca, cb)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
            let value = *ca as f32 + (*cb as f32 - *ca as f32) * t;
            *channel = value.clamp(0.0, 255.0) as u8;
        }
        u32::from_be_bytes(out)
    }
}

pub struct TextureGridCache {
    core: GridCacheCore,
    store: Arc<SourceSlots<dyn TextureSource>>,
    channels: usize,
    destination: RingIndex,
}

impl TextureGridCache {
    /// `destination_size` is the side of the texture slice this cache fills
    pub fn new(
        params: GridCacheParams,
        source: Arc<dyn TextureSource>,
        pool: Arc<TilePool>,
        destination_size: u32,
    ) -> Self {
        let channels = source.configuration().channels();
        let slots = SlotGrid::new(params.cache_size, params.tile_size, channels, 0u8);
        let store = Arc::new(SourceSlots::new(source, params.data_level, slots));
        let core = GridCacheCore::new(params, Arc::clone(&store) as Arc<dyn TileStore>, pool);
        Self {
            core,
            store,
            channels,
            destination: RingIndex::new(destination_size),
        }
    }

    pub fn core(&self) -> &GridCacheCore {
        &self.core
    }

    /// Bytes per texel, 3 or 4
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn destination_size(&self) -> usize {
        self.destination.size()
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
            log::warn!("texture level {}: valid tile query failed: {}", self.core.level(), err);
            None
        })
    }

    pub fn get_invalid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Option<HashSet<Tile>> {
        self.store.invalid_tiles(x, y, width, height).unwrap_or_else(|err| {
            log::warn!("texture level {}: invalid tile query failed: {}", self.core.level(), err);
            None
        })
    }

    /// Packed color from this level alone; `None` when its slot is not loaded
    pub fn local_color(&self, x: i32, z: i32) -> Option<u32> {
        self.store.slots().read(x, z, |texel| {
            let alpha = texel.get(3).copied().unwrap_or(0);
            color::pack(texel[0], texel[1], texel[2], alpha)
        })
    }
}

impl<'a> ChainRef<'a, TextureGridCache> {
    /// Color at an integer texel, degrading to coarser levels when this one
    /// has no data and `try_parent` is set
    pub fn get_color(&self, x: i32, z: i32, try_parent: bool) -> u32 {
        if let Some(color) = self.local_color(x, z) {
            return color;
        }
        match self.parent() {
            Some(parent) if try_parent => {
                if x.rem_euclid(2) == 0 && z.rem_euclid(2) == 0 {
                    parent.get_color(x / 2, z / 2, true)
                } else {
                    parent.get_sub_color(x as f32 / 2.0, z as f32 / 2.0, true)
                }
            }
            _ => 0,
        }
    }

    /// Bilinear color at a fractional texel position
    pub fn get_sub_color(&self, x: f32, z: f32, try_parent: bool) -> u32 {
        let col = x.floor();
        let row = z.floor();
        let (cx, cz) = (col as i32, row as i32);

        if !self.store.slots().covers(cx, cz) {
            return match self.parent() {
                Some(parent) if try_parent => parent.get_sub_color(x / 2.0, z / 2.0, true),
                _ => 0,
            };
        }

        let fx = x - col;
        let fz = z - row;
        let top = color::lerp(
            fx,
            self.get_color(cx, cz, try_parent),
            self.get_color(cx + 1, cz, try_parent),
        );
        let bottom = color::lerp(
            fx,
            self.get_color(cx, cz + 1, try_parent),
            self.get_color(cx + 1, cz + 1, try_parent),
        );
        color::lerp(fz, top, bottom)
    }

    /// Copy texels at their own toroidal position in the slice
    pub fn update_region(&self, destination: &mut [u8], source_x: i32, source_y: i32, width: i32, height: i32) {
        self.update_region_to(destination, source_x, source_y, source_x, source_y, width, height);
    }

    /// Copy `width x height` texels from `(source_x, source_y)` to the slice
    /// position `(dest_x, dest_y)`, wrapping rows and columns
    #[allow(clippy::too_many_arguments)]
    pub fn update_region_to(
        &self,
        destination: &mut [u8],
        source_x: i32,
        source_y: i32,
        dest_x: i32,
        dest_y: i32,
        width: i32,
        height: i32,
    ) {
        let channels = self.channels;
        let side = self.destination.size();
        if width <= 0 || height <= 0 || destination.len() < side * side * channels {
            return;
        }
        let mut row = vec![0u8; width as usize * channels];
        for z in 0..height {
            for x in 0..width {
                let rgba = color::unpack(self.get_color(source_x + x, source_y + z, true));
                let index = x as usize * channels;
                row[index..index + channels].copy_from_slice(&rgba[..channels]);
            }

            let row_start = self.destination.wrap(dest_y + z) * side * channels;
            let (first, second) = self.destination.split(dest_x, width as usize);
            let first_len = first.len() * channels;
            destination[row_start + first.start * channels..row_start + first.end * channels]
                .copy_from_slice(&row[..first_len]);
            if let Some(second) = second {
                destination[row_start + second.start * channels..row_start + second.end * channels]
                    .copy_from_slice(&row[first_len..first_len + second.len() * channels]);
            }
        }
    }
}
