//! Per-frame driver of the geometry clipmap and its texture clipmaps.
//!
//! `ClipmapTerrain` owns the clip levels (finest first), the level chain of
//! their caches and the mailbox every terrain cache posts completed regions
//! to. Tile submission runs on a separate maintenance thread so the update
//! path only reads validity flags and drains finished work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use glam::{Mat4, Vec2, Vec3};

use crate::core::double_buffer::Mailbox;
use crate::core::throttle::Throttle;
use crate::core::tile_pool::TilePool;
use crate::error::{ClipmapError, ClipmapResult};
use crate::terrain::clipmap::{Aabb, ClipLevel, FrustumPlanes, TextureClipmap};
use crate::terrain::config::ClipmapSettings;
use crate::terrain::level_chain::LevelChain;
use crate::terrain::picker::{self, DEFAULT_MAX_CHECKS};
use crate::terrain::terrain_cache::TerrainGridCache;
use crate::terrain::texture_cache::TextureGridCache;
use crate::terrain::tiling::{propagate_regions, Region};

/// Camera input of one update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    /// Eye position in world units
    pub eye: Vec3,
    /// Enables block culling when present
    pub view_proj: Option<Mat4>,
}

impl ViewState {
    pub fn new(eye: Vec3) -> Self {
        Self { eye, view_proj: None }
    }

    pub fn with_view_proj(mut self, view_proj: Mat4) -> Self {
        self.view_proj = Some(view_proj);
        self
    }
}

/// What one [`ClipmapTerrain::update`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub visible_levels: usize,
    pub vertices_written: usize,
    pub regions_applied: usize,
}

type TextureCaches = (Arc<AtomicBool>, Vec<Arc<TextureGridCache>>);

/// Caches visited by the maintenance thread
struct MaintenanceState {
    running: AtomicBool,
    terrain: Vec<Arc<TerrainGridCache>>,
    textures: Mutex<Vec<TextureCaches>>,
}

impl MaintenanceState {
    /// Coarse levels first so fallback data arrives before detail
    fn run_pass(&self) -> usize {
        let mut submitted: usize = self.terrain.iter().rev().map(|cache| cache.check_for_updates()).sum();
        let textures = self.textures.lock().unwrap_or_else(PoisonError::into_inner);
        for (enabled, caches) in textures.iter() {
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            submitted += caches.iter().rev().map(|cache| cache.check_for_updates()).sum::<usize>();
        }
        submitted
    }
}

pub struct ClipmapTerrain {
    levels: Vec<ClipLevel>,
    chain: LevelChain<TerrainGridCache>,
    mailbox: Arc<Mailbox<Region>>,
    textures: Vec<TextureClipmap>,
    settings: ClipmapSettings,
    scale: Vec3,
    height_range: (f32, f32),
    visible_levels: usize,
    min_visible_level: usize,
    culling_enabled: bool,
    refresh: Throttle,
    mailbox_throttle: Throttle,
    pool: Arc<TilePool>,
    last_eye: Option<(i32, i32)>,
    shared: Arc<MaintenanceState>,
    maintenance: Option<JoinHandle<()>>,
}

impl ClipmapTerrain {
    /// `levels[i]` must be geometry level `i`, each over its own cache.
    pub fn new(levels: Vec<ClipLevel>, pool: Arc<TilePool>, settings: ClipmapSettings) -> ClipmapResult<Self> {
        let Some(finest) = levels.first() else {
            return Err(ClipmapError::configuration("terrain needs at least one clip level"));
        };
        for (index, level) in levels.iter().enumerate() {
            if level.level() as usize != index {
                return Err(ClipmapError::configuration(format!(
                    "clip level {} found at position {}",
                    level.level(),
                    index
                )));
            }
        }

        let height_range = finest.height_range();
        let scale = finest.scale();
        let mailbox = Arc::new(Mailbox::new());
        let caches: Vec<Arc<TerrainGridCache>> = levels.iter().map(|level| Arc::clone(level.cache())).collect();
        for cache in &caches {
            cache.core().attach_mailbox(Arc::clone(&mailbox));
        }

        let mut levels = levels;
        for level in &mut levels {
            level.set_culling_enabled(settings.culling_enabled);
        }
        let count = levels.len();
        let min_visible_level = (settings.min_visible_level as usize).min(count - 1);

        Ok(Self {
            levels,
            chain: LevelChain::new(caches.clone()),
            mailbox,
            textures: Vec::new(),
            scale,
            height_range,
            visible_levels: count - 1,
            min_visible_level,
            culling_enabled: settings.culling_enabled,
            refresh: Throttle::from_millis(settings.refresh_interval_ms),
            mailbox_throttle: Throttle::from_millis(settings.mailbox_interval_ms),
            pool,
            last_eye: None,
            shared: Arc::new(MaintenanceState {
                running: AtomicBool::new(false),
                terrain: caches,
                textures: Mutex::new(Vec::new()),
            }),
            maintenance: None,
            settings,
        })
    }

    pub fn levels(&self) -> &[ClipLevel] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&ClipLevel> {
        self.levels.get(index)
    }

    pub fn chain(&self) -> &LevelChain<TerrainGridCache> {
        &self.chain
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<Region>> {
        &self.mailbox
    }

    pub fn pool(&self) -> &Arc<TilePool> {
        &self.pool
    }

    pub fn settings(&self) -> &ClipmapSettings {
        &self.settings
    }

    /// World units per sample along x/z, height multiplier on y
    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    /// Finest level currently drawn; everything finer is still loading
    pub fn visible_levels(&self) -> usize {
        self.visible_levels
    }

    pub fn min_visible_level(&self) -> usize {
        self.min_visible_level
    }

    pub fn set_min_visible_level(&mut self, level: usize) {
        self.min_visible_level = level.min(self.levels.len() - 1);
    }

    pub fn culling_enabled(&self) -> bool {
        self.culling_enabled
    }

    pub fn set_culling_enabled(&mut self, enabled: bool) {
        self.culling_enabled = enabled;
        for level in &mut self.levels {
            level.set_culling_enabled(enabled);
        }
    }

    pub fn height_range(&self) -> (f32, f32) {
        self.height_range
    }

    /// Raw height bounds used for block culling
    pub fn set_height_range(&mut self, min: f32, max: f32) {
        self.height_range = (min, max);
        for level in &mut self.levels {
            level.set_height_range(min, max);
        }
    }

    /// True once the finest allowed level has data
    pub fn is_ready(&self) -> bool {
        self.levels
            .get(self.min_visible_level)
            .is_some_and(|level| level.is_ready())
    }

    pub fn texture_clipmaps(&self) -> &[TextureClipmap] {
        &self.textures
    }

    pub fn texture_clipmaps_mut(&mut self) -> &mut [TextureClipmap] {
        &mut self.textures
    }

    /// Attach a texture clipmap; its caches join the maintenance passes.
    pub fn add_texture_clipmap(&mut self, texture: TextureClipmap) {
        let entry = (texture.enabled_flag(), texture.caches().to_vec());
        self.shared
            .textures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        self.textures.push(texture);
    }

    fn to_local(&self, world: Vec3) -> Vec3 {
        Vec3::new(world.x / self.scale.x, world.y, world.z / self.scale.z)
    }

    /// Follow the camera: pick the visible range, move and refresh vertex
    /// rings, apply posted regions and rebuild strip indices.
    pub fn update(&mut self, view: &ViewState, elapsed: Duration) -> UpdateStats {
        let local = self.to_local(view.eye);
        let (cx, cz) = (local.x as i32, local.z as i32);
        let count = self.levels.len();

        if let Some(visible) = (self.min_visible_level..count).find(|&i| self.levels[i].is_ready()) {
            if visible != self.visible_levels {
                log::debug!("visible levels {} -> {}", self.visible_levels, visible);
            }
            self.visible_levels = visible;
        }
        let visible = self.visible_levels;

        // Hidden rings are refilled from scratch once they show again
        for level in &mut self.levels[..visible] {
            level.mark_stale();
        }

        let first = self.last_eye.is_none();
        self.last_eye = Some((cx, cz));
        if self.refresh.tick(elapsed) || first {
            for level in &self.levels[visible..] {
                level.cache().handle_update_requests();
            }
            for level in &self.levels[..visible] {
                level.update_cache(cx, cz);
            }
        }

        let mut stats = UpdateStats {
            visible_levels: visible,
            ..UpdateStats::default()
        };
        for index in (visible..count).rev() {
            stats.vertices_written += self.levels[index].update_vertices(cx, cz, self.chain.coarser_than(index));
        }

        if self.mailbox_throttle.tick(elapsed) {
            let (regions, written) = self.update_from_mailbox();
            stats.regions_applied = regions;
            stats.vertices_written += written;
        }

        let frustum = view.view_proj.map(FrustumPlanes::from_view_proj);
        for index in (visible..count).rev() {
            let (finer, rest) = self.levels.split_at_mut(index);
            let finer = if index > visible { finer.last() } else { None };
            rest[0].update_indices(finer, frustum.as_ref());
        }

        for texture in &mut self.textures {
            texture.update(view.eye, elapsed);
        }
        stats
    }

    /// Re-sample every posted region still inside a visible window. Returns
    /// regions applied and vertices written.
    fn update_from_mailbox(&mut self) -> (usize, usize) {
        let posted = self.mailbox.switch_and_get();
        if posted.is_empty() {
            return (0, 0);
        }
        let levels = &self.levels;
        let regions = propagate_regions(
            posted,
            |level| levels.get(level as usize).map(|clip| clip.intersection_region()),
            |region| region.with_level(region.level - 1),
        );

        let visible = self.visible_levels as u32;
        let mut applied = 0;
        let mut written = 0;
        for region in regions.into_iter().filter(|region| region.level >= visible) {
            let index = region.level as usize;
            let vd = self.levels[index].vertex_distance();
            written += self.levels[index].refresh(
                region.x.div_euclid(vd),
                region.y.div_euclid(vd),
                region.width / vd,
                region.height / vd,
                self.chain.coarser_than(index),
            );
            applied += 1;
        }
        log::trace!("applied {} mailbox regions, {} vertices", applied, written);
        (applied, written)
    }

    /// Refill every visible ring and texture slice from the caches
    pub fn regenerate(&mut self) -> usize {
        let mut written = 0;
        for index in (self.visible_levels..self.levels.len()).rev() {
            written += self.levels[index].regenerate(self.chain.coarser_than(index));
        }
        for texture in &mut self.textures {
            texture.regenerate();
        }
        written
    }

    /// World height under `(x, z)` from the finest data loaded
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        match self.chain.level(0) {
            Some(finest) => finest.get_sub_height(x / self.scale.x, z / self.scale.z, true),
            None => self.height_range.0 * self.scale.y,
        }
    }

    /// Where a world-space ray first meets the terrain within `max_distance`.
    /// Cells are walked at the vertex spacing of the finest visible level
    /// covering each point.
    pub fn pick(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<Vec3> {
        let cell = Vec2::new(self.scale.x, self.scale.z);
        let spacing_at = |point: Vec3| {
            let x = (point.x / self.scale.x).floor() as i32;
            let z = (point.z / self.scale.z).floor() as i32;
            let vd = self.levels[self.visible_levels..]
                .iter()
                .find(|level| level.clip_region().contains_point(x, z))
                .or(self.levels.last())
                .map_or(1, |level| level.vertex_distance());
            cell * vd as f32
        };
        picker::trace(origin, direction, max_distance, DEFAULT_MAX_CHECKS, spacing_at, |x, z| {
            self.height_at(x, z)
        })
    }

    /// World bounds of the coarsest window
    pub fn world_extent(&self) -> Option<Aabb> {
        let region = self.levels.last()?.clip_region();
        let (min, max) = self.height_range;
        let center = Vec3::new(
            (region.left() + region.right()) as f32 * 0.5,
            (min + max) * 0.5 * self.scale.y,
            (region.top() + region.bottom()) as f32 * 0.5,
        );
        let extent = Vec3::new(
            region.width as f32 * 0.5,
            (max - min) * 0.5 * self.scale.y,
            region.height as f32 * 0.5,
        );
        Some(Aabb::new(center, extent).scaled(Vec3::new(self.scale.x, 1.0, self.scale.z)))
    }

    /// One maintenance pass on the calling thread. Returns tasks submitted.
    pub fn run_maintenance_pass(&self) -> usize {
        self.shared.run_pass()
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance.is_some()
    }

    /// Start the background thread that submits tile loads
    pub fn start_maintenance(&mut self) -> ClipmapResult<()> {
        if self.maintenance.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let interval = Duration::from_millis(self.settings.maintenance_interval_ms);
        let handle = thread::Builder::new()
            .name("terrain-cache-maintenance".to_string())
            .spawn(move || {
                while shared.running.load(Ordering::SeqCst) {
                    shared.run_pass();
                    thread::park_timeout(interval);
                }
            });
        match handle {
            Ok(handle) => {
                log::debug!("maintenance thread started, interval {:?}", interval);
                self.maintenance = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    fn stop_maintenance(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.maintenance.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::warn!("maintenance thread panicked");
            }
        }
    }

    /// Stop maintenance, cancel every tracked load and join the workers
    pub fn shutdown(&mut self) {
        self.stop_maintenance();
        for cache in self.chain.iter() {
            cache.core().shutdown();
        }
        for texture in &self.textures {
            for cache in texture.caches().iter() {
                cache.core().shutdown();
            }
        }
        self.pool.shutdown();
    }
}

impl Drop for ClipmapTerrain {
    fn drop(&mut self) {
        self.shutdown();
    }
}
