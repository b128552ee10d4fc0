//! Tile source contracts and the bundled in-memory / procedural sources
//!
//! Data levels count upward toward detail: level `level_count - 1` is the
//! finest and each level below it halves the resolution. A source answers
//! whole tiles of `tile_size * tile_size` samples, row-major.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};

use glam::Vec3;

use crate::error::{ClipmapError, ClipmapResult, SourceError};
use crate::terrain::config::{TerrainConfiguration, TextureConfiguration};
use crate::terrain::tiling::Tile;

/// Backing store of height tiles. Calls may block.
pub trait TerrainSource: Send + Sync {
    fn configuration(&self) -> TerrainConfiguration;

    /// Tiles that exist inside the window; `None` when the source cannot tell
    fn get_valid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError>;

    /// Tiles that changed since the last query; `None` when the source cannot tell
    fn get_invalid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError>;

    fn get_tile(&self, level: u32, tile: Tile) -> Result<Vec<f32>, SourceError>;
}

/// Backing store of color tiles, 3 or 4 bytes per texel. Calls may block.
pub trait TextureSource: Send + Sync {
    fn configuration(&self) -> TextureConfiguration;

    fn get_valid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError>;

    fn get_invalid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError>;

    fn get_tile(&self, level: u32, tile: Tile) -> Result<Vec<u8>, SourceError>;
}

/// Square sample array served as a point-sampled pyramid with change tracking
struct SamplePyramid<T> {
    side: usize,
    channels: usize,
    level_count: u32,
    tile_size: u32,
    samples: RwLock<Vec<T>>,
    dirty: Mutex<Vec<HashSet<Tile>>>,
}

impl<T: Copy> SamplePyramid<T> {
    fn new(side: usize, channels: usize, level_count: u32, tile_size: u32, samples: Vec<T>) -> ClipmapResult<Self> {
        if side == 0 || samples.len() != side * side * channels {
            return Err(ClipmapError::configuration(format!(
                "expected {} samples for side {}, got {}",
                side * side * channels,
                side,
                samples.len()
            )));
        }
        if level_count == 0 || level_count > 31 || tile_size == 0 {
            return Err(ClipmapError::configuration("invalid level count or tile size"));
        }
        Ok(Self {
            side,
            channels,
            level_count,
            tile_size,
            samples: RwLock::new(samples),
            dirty: Mutex::new(vec![HashSet::new(); level_count as usize]),
        })
    }

    /// Finest samples per sample at `level`
    fn step(&self, level: u32) -> usize {
        1usize << (self.level_count - 1 - level.min(self.level_count - 1))
    }

    /// Tiles per side at `level`
    fn tiles_per_side(&self, level: u32) -> i32 {
        let samples = self.side.div_ceil(self.step(level));
        samples.div_ceil(self.tile_size as usize) as i32
    }

    fn contains(&self, level: u32, tile: Tile) -> bool {
        let n = self.tiles_per_side(level);
        level < self.level_count && tile.x >= 0 && tile.y >= 0 && tile.x < n && tile.y < n
    }

    fn tile(&self, level: u32, tile: Tile) -> Result<Vec<T>, SourceError> {
        if !self.contains(level, tile) {
            return Err(SourceError::not_found(level, tile.x, tile.y));
        }
        let step = self.step(level);
        let ts = self.tile_size as usize;
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::with_capacity(ts * ts * self.channels);
        for j in 0..ts {
            let sy = ((tile.y as usize * ts + j) * step).min(self.side - 1);
            for i in 0..ts {
                let sx = ((tile.x as usize * ts + i) * step).min(self.side - 1);
                let base = (sy * self.side + sx) * self.channels;
                out.extend_from_slice(&samples[base..base + self.channels]);
            }
        }
        Ok(out)
    }

    fn valid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32) -> HashSet<Tile> {
        Tile::block(x, y, width, height)
            .filter(|t| self.contains(level, *t))
            .collect()
    }

    fn take_invalid(&self, level: u32, x: i32, y: i32, width: u32, height: u32) -> HashSet<Tile> {
        let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = dirty.get_mut(level as usize) else {
            return HashSet::new();
        };
        let taken: HashSet<Tile> = set
            .iter()
            .filter(|t| t.x >= x && t.y >= y && t.x < x + width as i32 && t.y < y + height as i32)
            .copied()
            .collect();
        for tile in &taken {
            set.remove(tile);
        }
        taken
    }

    /// Flag every tile, on every level, touching the finest-sample rectangle
    fn mark_dirty(&self, x: i32, y: i32, width: i32, height: i32) {
        if width <= 0 || height <= 0 {
            return;
        }
        let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        for level in 0..self.level_count {
            let span = (self.tile_size as usize * self.step(level)) as i32;
            let min = Tile::containing(x, y, span);
            let max = Tile::containing(x + width - 1, y + height - 1, span);
            let set = &mut dirty[level as usize];
            for ty in min.y..=max.y {
                for tx in min.x..=max.x {
                    set.insert(Tile::new(tx, ty));
                }
            }
        }
    }

    fn update<F>(&self, x: usize, y: usize, width: usize, height: usize, mut f: F)
    where
        F: FnMut(usize, usize, &mut [T]),
    {
        let x_end = (x + width).min(self.side);
        let y_end = (y + height).min(self.side);
        if x >= x_end || y >= y_end {
            return;
        }
        {
            let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);
            for sy in y..y_end {
                for sx in x..x_end {
                    let base = (sy * self.side + sx) * self.channels;
                    f(sx, sy, &mut samples[base..base + self.channels]);
                }
            }
        }
        self.mark_dirty(x as i32, y as i32, (x_end - x) as i32, (y_end - y) as i32);
    }
}

/// Height field held in memory, served at every level by point sampling
pub struct InMemoryTerrainSource {
    configuration: TerrainConfiguration,
    pyramid: SamplePyramid<f32>,
}

impl InMemoryTerrainSource {
    pub fn new(side: usize, heights: Vec<f32>, configuration: TerrainConfiguration) -> ClipmapResult<Self> {
        configuration.validate()?;
        let pyramid = SamplePyramid::new(
            side,
            1,
            configuration.level_count,
            configuration.tile_size,
            heights,
        )?;
        Ok(Self {
            configuration,
            pyramid,
        })
    }

    /// Build the height field from `f(x, z)` over the finest samples
    pub fn from_fn<F>(side: usize, configuration: TerrainConfiguration, f: F) -> ClipmapResult<Self>
    where
        F: Fn(usize, usize) -> f32,
    {
        let mut heights = Vec::with_capacity(side * side);
        for z in 0..side {
            for x in 0..side {
                heights.push(f(x, z));
            }
        }
        Self::new(side, heights, configuration)
    }

    pub fn side(&self) -> usize {
        self.pyramid.side
    }

    /// Raw finest-level height at `(x, z)`
    pub fn height(&self, x: usize, z: usize) -> Option<f32> {
        if x >= self.pyramid.side || z >= self.pyramid.side {
            return None;
        }
        let samples = self.pyramid.samples.read().unwrap_or_else(PoisonError::into_inner);
        samples.get(z * self.pyramid.side + x).copied()
    }

    /// Rewrite heights in a finest-sample rectangle and flag the covering tiles
    pub fn update_heights<F>(&self, x: usize, z: usize, width: usize, height: usize, mut f: F)
    where
        F: FnMut(usize, usize, f32) -> f32,
    {
        let (min, max) = self.configuration.height_range;
        self.pyramid.update(x, z, width, height, |sx, sz, sample| {
            sample[0] = f(sx, sz, sample[0]).clamp(min, max);
        });
    }

    pub fn mark_dirty(&self, x: i32, z: i32, width: i32, height: i32) {
        self.pyramid.mark_dirty(x, z, width, height);
    }
}

impl TerrainSource for InMemoryTerrainSource {
    fn configuration(&self) -> TerrainConfiguration {
        self.configuration.clone()
    }

    fn get_valid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(Some(self.pyramid.valid_tiles(level, x, y, width, height)))
    }

    fn get_invalid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(Some(self.pyramid.take_invalid(level, x, y, width, height)))
    }

    fn get_tile(&self, level: u32, tile: Tile) -> Result<Vec<f32>, SourceError> {
        self.pyramid.tile(level, tile)
    }
}

/// Unbounded analytic height field
pub struct ProceduralTerrainSource {
    configuration: TerrainConfiguration,
    amplitude: f32,
    frequency: f32,
}

impl ProceduralTerrainSource {
    pub fn new(level_count: u32, tile_size: u32, scale: Vec3) -> Self {
        Self::with_shape(level_count, tile_size, scale, 10.0, 0.1)
    }

    pub fn with_shape(level_count: u32, tile_size: u32, scale: Vec3, amplitude: f32, frequency: f32) -> Self {
        let amplitude = amplitude.abs().max(f32::EPSILON);
        Self {
            configuration: TerrainConfiguration::new(
                level_count,
                tile_size,
                scale,
                (-2.0 * amplitude, 2.0 * amplitude),
            ),
            amplitude,
            frequency,
        }
    }

    /// Height at a finest-level sample position
    pub fn sample(&self, x: f32, z: f32) -> f32 {
        (x * self.frequency).sin() * self.amplitude + (z * self.frequency).cos() * self.amplitude
    }
}

impl TerrainSource for ProceduralTerrainSource {
    fn configuration(&self) -> TerrainConfiguration {
        self.configuration.clone()
    }

    fn get_valid_tiles(&self, _: u32, _: i32, _: i32, _: u32, _: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(None)
    }

    fn get_invalid_tiles(&self, _: u32, _: i32, _: i32, _: u32, _: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(None)
    }

    fn get_tile(&self, level: u32, tile: Tile) -> Result<Vec<f32>, SourceError> {
        if level >= self.configuration.level_count {
            return Err(SourceError::not_found(level, tile.x, tile.y));
        }
        let ts = self.configuration.tile_size as i32;
        let step = (1i64 << (self.configuration.level_count - 1 - level)) as f32;
        let mut heights = Vec::with_capacity((ts * ts) as usize);
        for j in 0..ts {
            for i in 0..ts {
                let x = (tile.x * ts + i) as f32 * step;
                let z = (tile.y * ts + j) as f32 * step;
                heights.push(self.sample(x, z));
            }
        }
        Ok(heights)
    }
}

/// RGB(A) image held in memory, served at every level by point sampling
pub struct InMemoryTextureSource {
    configuration: TextureConfiguration,
    pyramid: SamplePyramid<u8>,
}

impl InMemoryTextureSource {
    pub fn new(side: usize, texels: Vec<u8>, configuration: TextureConfiguration) -> ClipmapResult<Self> {
        configuration.validate()?;
        let pyramid = SamplePyramid::new(
            side,
            configuration.channels(),
            configuration.level_count,
            configuration.tile_size,
            texels,
        )?;
        Ok(Self {
            configuration,
            pyramid,
        })
    }

    /// Repaint a finest-texel rectangle and flag the covering tiles
    pub fn paint<F>(&self, x: usize, y: usize, width: usize, height: usize, mut f: F)
    where
        F: FnMut(usize, usize, &mut [u8]),
    {
        self.pyramid.update(x, y, width, height, |sx, sy, texel| f(sx, sy, texel));
    }

    pub fn mark_dirty(&self, x: i32, y: i32, width: i32, height: i32) {
        self.pyramid.mark_dirty(x, y, width, height);
    }
}

impl TextureSource for InMemoryTextureSource {
    fn configuration(&self) -> TextureConfiguration {
        self.configuration.clone()
    }

    fn get_valid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(Some(self.pyramid.valid_tiles(level, x, y, width, height)))
    }

    fn get_invalid_tiles(
        &self,
        level: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(Some(self.pyramid.take_invalid(level, x, y, width, height)))
    }

    fn get_tile(&self, level: u32, tile: Tile) -> Result<Vec<u8>, SourceError> {
        self.pyramid.tile(level, tile)
    }
}

/// Unbounded analytic color field
pub struct ProceduralTextureSource {
    configuration: TextureConfiguration,
}

impl ProceduralTextureSource {
    pub fn new(level_count: u32, tile_size: u32, use_alpha: bool) -> Self {
        Self {
            configuration: TextureConfiguration {
                level_count,
                tile_size,
                use_alpha,
                texture_density: 1.0,
            },
        }
    }

    /// RGBA color at a finest-level texel position
    pub fn sample(&self, x: f32, y: f32) -> [u8; 4] {
        let r = (((x * 0.01).sin() * 0.5 + 0.5) * 255.0) as u8;
        let g = (((y * 0.01).cos() * 0.5 + 0.5) * 255.0) as u8;
        let b = (((x * 0.02 + y * 0.02).sin() * 0.5 + 0.5) * 255.0) as u8;
        [r, g, b, 255]
    }
}

impl TextureSource for ProceduralTextureSource {
    fn configuration(&self) -> TextureConfiguration {
        self.configuration.clone()
    }

    fn get_valid_tiles(&self, _: u32, _: i32, _: i32, _: u32, _: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(None)
    }

    fn get_invalid_tiles(&self, _: u32, _: i32, _: i32, _: u32, _: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(None)
    }

    fn get_tile(&self, level: u32, tile: Tile) -> Result<Vec<u8>, SourceError> {
        if level >= self.configuration.level_count {
            return Err(SourceError::not_found(level, tile.x, tile.y));
        }
        let ts = self.configuration.tile_size as i32;
        let channels = self.configuration.channels();
        let step = (1i64 << (self.configuration.level_count - 1 - level)) as f32;
        let mut texels = Vec::with_capacity((ts * ts) as usize * channels);
        for j in 0..ts {
            for i in 0..ts {
                let x = (tile.x * ts + i) as f32 * step;
                let y = (tile.y * ts + j) as f32 * step;
                texels.extend_from_slice(&self.sample(x, y)[..channels]);
            }
        }
        Ok(texels)
    }
}
