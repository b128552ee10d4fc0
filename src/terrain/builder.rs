//! Assemble a [`ClipmapTerrain`] from sources and settings.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::core::tile_pool::TilePool;
use crate::error::ClipmapResult;
use crate::terrain::clipmap::{ClipLevel, TextureClipmap};
use crate::terrain::clipmap_terrain::ClipmapTerrain;
use crate::terrain::config::ClipmapSettings;
use crate::terrain::grid_cache::GridCacheParams;
use crate::terrain::level_chain::LevelChain;
use crate::terrain::source::{TerrainSource, TextureSource};
use crate::terrain::terrain_cache::TerrainGridCache;
use crate::terrain::texture_cache::TextureGridCache;

pub struct TerrainBuilder {
    source: Arc<dyn TerrainSource>,
    textures: Vec<Arc<dyn TextureSource>>,
    settings: ClipmapSettings,
    maintenance: bool,
}

/// Level counts derived from what a source offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPlan {
    pub count: u32,
    /// Coarsest data level used
    pub base: u32,
}

impl LevelPlan {
    pub fn new(source_levels: u32, max_levels: u32) -> Self {
        let count = source_levels.min(max_levels);
        Self {
            count,
            base: source_levels.saturating_sub(count),
        }
    }

    /// Source level feeding geometry level `level`, 0 being the finest
    pub fn data_level(&self, level: u32) -> u32 {
        self.base + self.count - 1 - level
    }
}

impl TerrainBuilder {
    pub fn new(source: Arc<dyn TerrainSource>, settings: ClipmapSettings) -> Self {
        Self {
            source,
            textures: Vec::new(),
            settings,
            maintenance: true,
        }
    }

    /// Read settings from a JSON file
    pub fn from_settings_file<P: AsRef<Path>>(source: Arc<dyn TerrainSource>, path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let settings = ClipmapSettings::from_json_file(path)
            .with_context(|| format!("failed to load clipmap settings from {}", path.display()))?;
        Ok(Self::new(source, settings))
    }

    /// Add a texture clipmap over `source`. May be called more than once.
    pub fn with_texture_source(mut self, source: Arc<dyn TextureSource>) -> Self {
        self.textures.push(source);
        self
    }

    /// Start the maintenance thread on build, on by default
    pub fn with_maintenance(mut self, enabled: bool) -> Self {
        self.maintenance = enabled;
        self
    }

    pub fn settings(&self) -> &ClipmapSettings {
        &self.settings
    }

    pub fn build(self) -> ClipmapResult<ClipmapTerrain> {
        let settings = self.settings;
        settings.validate()?;
        let configuration = self.source.configuration();
        configuration.validate()?;

        let plan = LevelPlan::new(configuration.level_count, settings.max_levels);
        let clip_side = settings.clip_side_size;
        let tile_size = configuration.tile_size;
        let cache_size = settings.cache_size_for(clip_side, tile_size);
        log::info!(
            "terrain: {} of {} source levels from data level {}, clip side {}, cache {}x{} tiles of {}",
            plan.count,
            configuration.level_count,
            plan.base,
            clip_side,
            cache_size,
            cache_size,
            tile_size
        );

        let pool = Arc::new(TilePool::new(settings.worker_threads)?);
        let mut levels = Vec::with_capacity(plan.count as usize);
        for level in 0..plan.count {
            let params = GridCacheParams::new(cache_size, tile_size, level, plan.data_level(level))
                .with_settings(&settings)
                .with_vertex_distance(1 << level);
            let cache = Arc::new(TerrainGridCache::new(
                params,
                Arc::clone(&self.source),
                Arc::clone(&pool),
                clip_side,
            ));
            levels.push(ClipLevel::new(level, cache, clip_side, configuration.scale)?);
        }

        let mut textures = Vec::with_capacity(self.textures.len());
        for source in &self.textures {
            textures.push(build_texture(source, &settings, &pool)?);
        }

        let start = self.maintenance;
        let mut terrain = ClipmapTerrain::new(levels, pool, settings)?;
        for texture in textures {
            terrain.add_texture_clipmap(texture);
        }
        if start {
            terrain.start_maintenance()?;
        }
        Ok(terrain)
    }
}

fn build_texture(
    source: &Arc<dyn TextureSource>,
    settings: &ClipmapSettings,
    pool: &Arc<TilePool>,
) -> ClipmapResult<TextureClipmap> {
    let configuration = source.configuration();
    configuration.validate()?;
    let plan = LevelPlan::new(configuration.level_count, settings.max_texture_levels);
    let texture_size = settings.texture_size;
    let cache_size = settings.cache_size_for(texture_size, configuration.tile_size);
    log::info!(
        "texture: {} levels from data level {}, slice {}x{}, cache {}x{} tiles of {}",
        plan.count,
        plan.base,
        texture_size,
        texture_size,
        cache_size,
        cache_size,
        configuration.tile_size
    );

    let caches = (0..plan.count)
        .map(|level| {
            let params = GridCacheParams::new(cache_size, configuration.tile_size, level, plan.data_level(level))
                .with_settings(settings);
            Arc::new(TextureGridCache::new(
                params,
                Arc::clone(source),
                Arc::clone(pool),
                texture_size,
            ))
        })
        .collect();
    TextureClipmap::new(LevelChain::new(caches), texture_size, &configuration, settings)
}
