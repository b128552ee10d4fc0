//! CPU side of a texture clipmap: one toroidal color slice per level.
//!
//! Texel `(x, y)` of level `n` always lives at slice cell
//! `(x mod size, y mod size)`. Moving the anchor only rewrites the rows and
//! columns that scrolled into view, and every rewritten rectangle is queued as
//! a [`TextureUpdate`] for whoever owns the GPU texture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glam::{Vec2, Vec3};

use crate::core::double_buffer::Mailbox;
use crate::core::ring_index::RingIndex;
use crate::core::throttle::Throttle;
use crate::error::{ClipmapError, ClipmapResult};
use crate::terrain::config::{ClipmapSettings, TextureConfiguration};
use crate::terrain::level_chain::LevelChain;
use crate::terrain::texture_cache::TextureGridCache;
use crate::terrain::tiling::{propagate_regions, Region};

/// Slice rectangle that changed since the last [`TextureClipmap::take_updates`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureUpdate {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

struct LevelData {
    /// Anchor texel, the window center
    x: i32,
    y: i32,
    initialized: bool,
    slice: Vec<u8>,
}

pub struct TextureClipmap {
    caches: LevelChain<TextureGridCache>,
    mailbox: Arc<Mailbox<Region>>,
    ring: RingIndex,
    texture_size: i32,
    channels: usize,
    scale: f32,
    texture_levels: usize,
    levels: Vec<LevelData>,
    visible_levels: usize,
    min_visible_level: usize,
    enabled: Arc<AtomicBool>,
    slice_offsets: Vec<[f32; 2]>,
    updates: Vec<TextureUpdate>,
    mailbox_throttle: Throttle,
    refresh_throttle: Throttle,
}

impl TextureClipmap {
    /// `caches[0]` is the finest level. Every cache must fill slices of
    /// `texture_size` texels.
    pub fn new(
        caches: LevelChain<TextureGridCache>,
        texture_size: u32,
        configuration: &TextureConfiguration,
        settings: &ClipmapSettings,
    ) -> ClipmapResult<Self> {
        if caches.is_empty() {
            return Err(ClipmapError::configuration("texture clipmap needs at least one level"));
        }
        if texture_size < 2 || texture_size % 2 != 0 {
            return Err(ClipmapError::configuration(format!(
                "texture size must be even, got {}",
                texture_size
            )));
        }
        configuration.validate()?;

        let channels = configuration.channels();
        let mailbox = Arc::new(Mailbox::new());
        for cache in caches.iter() {
            if cache.destination_size() != texture_size as usize || cache.channels() != channels {
                return Err(ClipmapError::configuration(format!(
                    "texture level {} does not match a {} texel, {} channel slice",
                    cache.core().level(),
                    texture_size,
                    channels
                )));
            }
            cache.core().attach_mailbox(Arc::clone(&mailbox));
        }

        let valid_levels = caches.len();
        let texture_levels = valid_levels.next_power_of_two();
        let scale = configuration.texture_density * texture_size as f32 / 128.0;
        let slice_len = (texture_size as usize).pow(2) * channels;
        let levels = (0..valid_levels)
            .map(|_| LevelData {
                x: 0,
                y: 0,
                initialized: false,
                slice: vec![0; slice_len],
            })
            .collect();

        log::info!(
            "texture clipmap: size {}, {} levels, texture depth {}",
            texture_size,
            valid_levels,
            texture_levels
        );

        Ok(Self {
            caches,
            mailbox,
            ring: RingIndex::new(texture_size),
            texture_size: texture_size as i32,
            channels,
            scale,
            texture_levels,
            levels,
            visible_levels: 0,
            min_visible_level: 0,
            enabled: Arc::new(AtomicBool::new(true)),
            slice_offsets: vec![[0.0; 2]; texture_levels],
            updates: Vec::new(),
            mailbox_throttle: Throttle::from_millis(settings.mailbox_interval_ms),
            refresh_throttle: Throttle::from_millis(settings.refresh_interval_ms),
        })
    }

    pub fn caches(&self) -> &LevelChain<TextureGridCache> {
        &self.caches
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<Region>> {
        &self.mailbox
    }

    pub fn texture_size(&self) -> u32 {
        self.texture_size as u32
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Depth of the backing 3D texture, the level count rounded up to a power of two
    pub fn texture_levels(&self) -> usize {
        self.texture_levels
    }

    pub fn valid_levels(&self) -> usize {
        self.levels.len()
    }

    /// Finest level currently shown
    pub fn visible_levels(&self) -> usize {
        self.visible_levels
    }

    pub fn min_visible_level(&self) -> usize {
        self.min_visible_level
    }

    pub fn set_min_visible_level(&mut self, level: usize) {
        self.min_visible_level = level.min(self.levels.len() - 1);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    /// Slice bytes of `level`, `size * size * channels` row-major
    pub fn slice(&self, level: usize) -> Option<&[u8]> {
        self.levels.get(level).map(|data| data.slice.as_slice())
    }

    /// Per-level texture coordinate shift, `texture_levels()` entries
    pub fn slice_offsets(&self) -> &[[f32; 2]] {
        &self.slice_offsets
    }

    /// Anchor texel of `level`
    pub fn anchor(&self, level: usize) -> Option<(i32, i32)> {
        self.levels.get(level).map(|data| (data.x, data.y))
    }

    /// Drain the rectangles rewritten since the last call
    pub fn take_updates(&mut self) -> Vec<TextureUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// Finest-level texel position of a world-space eye
    pub fn texel_position(&self, eye: Vec3) -> Vec2 {
        Vec2::new(eye.x, eye.z) * (self.texture_size as f32 / (self.scale * 128.0))
    }

    /// Packed RGBA color under world `(x, z)`, blended from the finest data
    /// available
    pub fn color_at(&self, x: f32, z: f32) -> u32 {
        let texel = self.texel_position(Vec3::new(x, 0.0, z));
        match self.caches.level(0) {
            Some(finest) => finest.get_sub_color(texel.x, texel.y, true),
            None => 0,
        }
    }

    fn anchor_for(texel: Vec2, unit: usize) -> (Vec2, i32, i32) {
        let position = texel / (1u32 << unit) as f32;
        (position, position.x.floor() as i32, position.y.floor() as i32)
    }

    /// Follow a world-space eye position. `elapsed` feeds the refresh and
    /// mailbox throttles.
    pub fn update(&mut self, eye: Vec3, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        let texel = self.texel_position(eye);
        let count = self.levels.len();

        if let Some(unit) = (self.min_visible_level..count).find(|&unit| {
            self.caches.get(unit).is_some_and(|cache| cache.is_valid())
        }) {
            self.visible_levels = unit;
        }

        let refresh = self.refresh_throttle.tick(elapsed);
        if refresh {
            for unit in 0..self.visible_levels {
                let (_, ox, oy) = Self::anchor_for(texel, unit);
                // Hidden slices go stale and are refilled once shown again
                self.levels[unit].initialized = false;
                if let Some(cache) = self.caches.get(unit) {
                    cache.set_current_position(ox, oy);
                }
            }
        }

        for unit in (self.visible_levels..count).rev() {
            let (position, ox, oy) = Self::anchor_for(texel, unit);
            let data = &self.levels[unit];
            if !data.initialized || data.x != ox || data.y != oy {
                if let Some(cache) = self.caches.get(unit) {
                    cache.set_current_position(ox, oy);
                }
                self.update_level(unit, ox, oy);
            }
            if refresh {
                if let Some(cache) = self.caches.get(unit) {
                    cache.handle_update_requests();
                }
            }

            let shift = Vec2::new(ox.rem_euclid(2) as f32, oy.rem_euclid(2) as f32);
            let offset = Vec2::new(
                self.ring.wrap(ox - self.texture_size / 2) as f32,
                self.ring.wrap(oy - self.texture_size / 2) as f32,
            );
            let value = (Vec2::new(position.x.rem_euclid(2.0), position.y.rem_euclid(2.0)) - shift + offset)
                / self.texture_size as f32;
            self.slice_offsets[unit] = value.to_array();
        }

        self.update_from_mailbox(elapsed);
    }

    /// Rewrite every visible slice around its current anchor
    pub fn regenerate(&mut self) {
        let size = self.texture_size;
        for unit in (self.visible_levels..self.levels.len()).rev() {
            let (x, y) = (self.levels[unit].x, self.levels[unit].y);
            self.copy_region(unit, x - size / 2, y - size / 2, size, size);
        }
    }

    fn update_level(&mut self, unit: usize, x: i32, y: i32) {
        let size = self.texture_size;
        let data = &mut self.levels[unit];
        let (dx, dy) = (x - data.x, y - data.y);
        let full = !data.initialized || dx.abs() >= size || dy.abs() >= size;
        data.x = x;
        data.y = y;
        data.initialized = true;

        let sx = x - size / 2;
        let sy = y - size / 2;
        if full {
            self.copy_region(unit, sx, sy, size, size);
            return;
        }
        if dx > 0 {
            self.copy_region(unit, sx + size - dx, sy, dx, size);
        } else if dx < 0 {
            self.copy_region(unit, sx, sy, -dx, size);
        }
        if dy > 0 {
            self.copy_region(unit, sx, sy + size - dy, size, dy);
        } else if dy < 0 {
            self.copy_region(unit, sx, sy, size, -dy);
        }
    }

    fn copy_region(&mut self, unit: usize, x: i32, y: i32, width: i32, height: i32) {
        if width <= 0 || height <= 0 {
            return;
        }
        let Some(chain) = self.caches.level(unit) else {
            return;
        };
        chain.update_region(&mut self.levels[unit].slice, x, y, width, height);

        let (cols, cols_wrapped) = self.ring.split(x, width as usize);
        let (rows, rows_wrapped) = self.ring.split(y, height as usize);
        for cols in std::iter::once(cols).chain(cols_wrapped) {
            for rows in std::iter::once(rows.clone()).chain(rows_wrapped.clone()) {
                self.updates.push(TextureUpdate {
                    level: unit as u32,
                    x: cols.start as u32,
                    y: rows.start as u32,
                    width: cols.len() as u32,
                    height: rows.len() as u32,
                });
            }
        }
    }

    fn window(&self, unit: usize) -> Option<Region> {
        let data = self.levels.get(unit)?;
        let half = self.texture_size / 2;
        Some(Region::new(
            unit as u32,
            data.x - half,
            data.y - half,
            self.texture_size,
            self.texture_size,
        ))
    }

    fn update_from_mailbox(&mut self, elapsed: Duration) {
        if !self.mailbox_throttle.tick(elapsed) {
            return;
        }

        let posted = self.mailbox.switch_and_get();
        if posted.is_empty() {
            return;
        }
        let visible = self.visible_levels as u32;
        let regions = propagate_regions(
            posted,
            |level| self.window(level as usize),
            |region| {
                Region::new(
                    region.level - 1,
                    region.x * 2,
                    region.y * 2,
                    region.width * 2,
                    region.height * 2,
                )
            },
        );
        log::trace!("texture clipmap: {} regions from mailbox", regions.len());
        for region in regions.into_iter().filter(|region| region.level >= visible) {
            if !self.levels[region.level as usize].initialized {
                continue;
            }
            self.copy_region(region.level as usize, region.x, region.y, region.width, region.height);
        }
    }
}
