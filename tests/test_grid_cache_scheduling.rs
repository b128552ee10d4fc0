//! Grid cache scheduling against scripted tile sources
//!
//! Covers window diffs on movement, terminal errors, requeue of sources that
//! are not ready, the one-load-per-slot guarantee while loads block, the
//! valid tile locator and edits that land during a fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use glam::Vec3;
use terrain_clipmap::core::TilePool;
use terrain_clipmap::terrain::{
    ClipmapSettings, GridCacheParams, InMemoryTerrainSource, TaskState, TerrainConfiguration, TerrainGridCache,
    TerrainSource, Tile, UnknownTilePolicy,
};
use terrain_clipmap::SourceError;

const TILE: u32 = 32;
const WAIT: Duration = Duration::from_secs(10);

type Script = Box<dyn Fn(Tile, usize) -> Result<f32, SourceError> + Send + Sync>;

/// Source answering from a script of `(tile, call index) -> height`
struct ScriptedSource {
    script: Script,
    calls: Mutex<HashMap<Tile, usize>>,
    gate: Option<(Mutex<bool>, Condvar)>,
    active: Mutex<HashMap<Tile, usize>>,
    max_active_per_tile: AtomicUsize,
    valid: Mutex<Option<HashSet<Tile>>>,
    valid_queries: AtomicUsize,
    changed: Mutex<HashSet<Tile>>,
}

impl ScriptedSource {
    fn new(script: impl Fn(Tile, usize) -> Result<f32, SourceError> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(HashMap::new()),
            gate: None,
            active: Mutex::new(HashMap::new()),
            max_active_per_tile: AtomicUsize::new(0),
            valid: Mutex::new(None),
            valid_queries: AtomicUsize::new(0),
            changed: Mutex::new(HashSet::new()),
        }
    }

    fn gated(script: impl Fn(Tile, usize) -> Result<f32, SourceError> + Send + Sync + 'static) -> Self {
        Self {
            gate: Some((Mutex::new(false), Condvar::new())),
            ..Self::new(script)
        }
    }

    fn open_gate(&self) {
        if let Some((open, cv)) = &self.gate {
            *open.lock().unwrap() = true;
            cv.notify_all();
        }
    }

    fn wait_gate(&self) {
        if let Some((open, cv)) = &self.gate {
            let mut guard = open.lock().unwrap();
            while !*guard {
                guard = cv.wait(guard).unwrap();
            }
        }
    }

    fn calls(&self, tile: Tile) -> usize {
        self.calls.lock().unwrap().get(&tile).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Answer valid tile queries with `tiles`, `None` meaning unknown
    fn set_valid(&self, tiles: Option<HashSet<Tile>>) {
        *self.valid.lock().unwrap() = tiles;
    }

    fn valid_queries(&self) -> usize {
        self.valid_queries.load(Ordering::SeqCst)
    }

    fn mark_changed(&self, tile: Tile) {
        self.changed.lock().unwrap().insert(tile);
    }
}

impl TerrainSource for ScriptedSource {
    fn configuration(&self) -> TerrainConfiguration {
        TerrainConfiguration::new(1, TILE, Vec3::ONE, (0.0, 1000.0))
    }

    fn get_valid_tiles(&self, _: u32, _: i32, _: i32, _: u32, _: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        self.valid_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.valid.lock().unwrap().clone())
    }

    fn get_invalid_tiles(&self, _: u32, _: i32, _: i32, _: u32, _: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        Ok(Some(std::mem::take(&mut *self.changed.lock().unwrap())))
    }

    fn get_tile(&self, _level: u32, tile: Tile) -> Result<Vec<f32>, SourceError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(tile).or_default();
            *count += 1;
            *count - 1
        };
        {
            let mut active = self.active.lock().unwrap();
            let running = active.entry(tile).or_default();
            *running += 1;
            self.max_active_per_tile.fetch_max(*running, Ordering::SeqCst);
        }

        self.wait_gate();
        let result = (self.script)(tile, call).map(|height| vec![height; (TILE * TILE) as usize]);

        *self.active.lock().unwrap().entry(tile).or_default() -= 1;
        result
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn cache_over(source: &Arc<ScriptedSource>, pool: &Arc<TilePool>) -> TerrainGridCache {
    cache_with(source, pool, GridCacheParams::new(5, TILE, 0, 0))
}

fn cache_with(source: &Arc<ScriptedSource>, pool: &Arc<TilePool>, params: GridCacheParams) -> TerrainGridCache {
    let source: Arc<dyn TerrainSource> = Arc::clone(source) as Arc<dyn TerrainSource>;
    TerrainGridCache::new(params, source, Arc::clone(pool), 127)
}

fn wait_for_state(cache: &TerrainGridCache, tile: Tile, state: TaskState) {
    let deadline = Instant::now() + WAIT;
    while cache.core().task_state(tile) != Some(state) {
        assert!(Instant::now() < deadline, "tile {:?} never reached {:?}", tile, state);
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn states(cache: &TerrainGridCache) -> HashMap<Tile, TaskState> {
    cache
        .core()
        .debug_tiles()
        .into_iter()
        .map(|snapshot| (snapshot.source, snapshot.state))
        .collect()
}

#[test]
fn test_window_move_keeps_overlapping_tiles() {
    init_logging();
    let source = Arc::new(ScriptedSource::new(|tile, _| Ok((tile.x + 10 * tile.y) as f32 + 100.0)));
    let pool = Arc::new(TilePool::new(2).unwrap());
    let cache = cache_over(&source, &pool);

    let change = cache.set_current_position(16, 16).unwrap();
    assert_eq!(change.center, Tile::new(0, 0));
    assert_eq!(change.added.len(), 25);
    assert!(change.cancelled.is_empty());
    // Same tile again is a no-op
    assert!(cache.set_current_position(20, 30).is_none());

    assert_eq!(cache.check_for_updates(), 25);
    assert!(pool.wait_idle(WAIT));
    assert!(cache.is_valid());
    assert!(states(&cache).values().all(|state| *state == TaskState::Finished));

    let change = cache.set_current_position(48, 16).unwrap();
    assert_eq!(change.center, Tile::new(1, 0));
    assert_eq!(change.added, (-2..=2).map(|y| Tile::new(3, y)).collect::<Vec<_>>());
    assert_eq!(change.cancelled, (-2..=2).map(|y| Tile::new(-2, y)).collect::<Vec<_>>());

    let after = states(&cache);
    assert_eq!(after.len(), 25);
    let kept: Vec<_> = after.iter().filter(|(tile, _)| tile.x < 3).collect();
    assert_eq!(kept.len(), 20);
    assert!(kept.iter().all(|(_, state)| **state == TaskState::Finished));
    assert_eq!(cache.core().pending_tiles().len(), 5);

    // Column x = 3 reuses the slots of column x = -2
    assert_eq!(cache.core().dest_for(Tile::new(3, 0)), cache.core().dest_for(Tile::new(-2, 0)));
    assert_eq!(cache.check_for_updates(), 5);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(source.total_calls(), 30);
    assert_eq!(source.calls(Tile::new(1, 1)), 1);
}

#[test]
fn test_source_error_is_not_retried() {
    init_logging();
    let broken = Tile::new(0, 0);
    let source = Arc::new(ScriptedSource::new(move |tile, _| {
        if tile == broken {
            Err(SourceError::failed("disk on fire"))
        } else {
            Ok(1.0)
        }
    }));
    let pool = Arc::new(TilePool::new(2).unwrap());
    let cache = cache_over(&source, &pool);

    cache.set_current_position(0, 0);
    assert_eq!(cache.check_for_updates(), 25);
    assert!(pool.wait_idle(WAIT));

    assert_eq!(cache.core().task_state(broken), Some(TaskState::Error));
    assert_eq!(cache.check_for_updates(), 0);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(source.calls(broken), 1);
    // The rest of the window still loaded
    assert!(cache.is_valid());
    assert_eq!(cache.core().task_state(Tile::new(1, 0)), Some(TaskState::Finished));
}

#[test]
fn test_not_ready_tile_is_requeued() {
    init_logging();
    let slow = Tile::new(1, 1);
    let source = Arc::new(ScriptedSource::new(move |tile, call| {
        if tile == slow && call < 2 {
            Err(SourceError::NotReady)
        } else {
            Ok(5.0)
        }
    }));
    let pool = Arc::new(TilePool::new(1).unwrap());
    let cache = cache_over(&source, &pool);

    cache.set_current_position(0, 0);
    assert_eq!(cache.check_for_updates(), 25);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(cache.core().task_state(slow), Some(TaskState::Requeue));

    assert_eq!(cache.check_for_updates(), 1);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(cache.core().task_state(slow), Some(TaskState::Requeue));

    assert_eq!(cache.check_for_updates(), 1);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(cache.core().task_state(slow), Some(TaskState::Finished));
    assert_eq!(source.calls(slow), 3);
    assert_eq!(cache.check_for_updates(), 0);
}

#[test]
fn test_blocked_loads_are_never_duplicated() {
    init_logging();
    let source = Arc::new(ScriptedSource::gated(|_, _| Ok(2.0)));
    let pool = Arc::new(TilePool::new(4).unwrap());
    let cache = cache_over(&source, &pool);

    cache.set_current_position(0, 0);
    assert_eq!(cache.check_for_updates(), 25);
    // Workers are parked on the gate; further passes find nothing new
    for _ in 0..5 {
        assert_eq!(cache.check_for_updates(), 0);
    }
    assert!(!cache.is_valid());

    source.open_gate();
    assert!(pool.wait_idle(WAIT));
    assert!(cache.is_valid());
    assert_eq!(source.max_active_per_tile.load(Ordering::SeqCst), 1);
    assert_eq!(source.total_calls(), 25);
    for tile in Tile::block(-2, -2, 5, 5) {
        assert_eq!(source.calls(tile), 1, "tile {:?}", tile);
    }
}

#[test]
fn test_cancelled_window_drops_queued_work() {
    init_logging();
    let source = Arc::new(ScriptedSource::gated(|_, _| Ok(3.0)));
    let pool = Arc::new(TilePool::new(1).unwrap());
    let cache = cache_over(&source, &pool);

    cache.set_current_position(0, 0);
    assert_eq!(cache.check_for_updates(), 25);
    // Jump far away: every old task is cancelled and its queued job purged
    let change = cache.set_current_position(100 * TILE as i32, 0).unwrap();
    assert_eq!(change.cancelled.len(), 25);
    assert!(pool.stats().queued < 25);

    source.open_gate();
    assert!(pool.wait_idle(WAIT));
    // At most the one job already running reached the source
    assert!(source.total_calls() <= 1);
    assert!(!cache.is_valid());
}

#[test]
fn test_locator_defers_tiles_until_offered() {
    init_logging();
    let source = Arc::new(ScriptedSource::new(|_, _| Ok(4.0)));
    // Column x = 2 is missing from the source index
    source.set_valid(Some(Tile::block(-10, -10, 21, 21).filter(|tile| tile.x != 2).collect()));
    let pool = Arc::new(TilePool::new(2).unwrap());
    let cache = cache_over(&source, &pool);

    cache.set_current_position(16, 16);
    assert_eq!(cache.check_for_updates(), 20);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(source.valid_queries(), 1);
    assert_eq!(cache.core().task_state(Tile::new(2, 0)), Some(TaskState::Init));
    assert_eq!(cache.core().pending_tiles(), (-2..=2).map(|y| Tile::new(2, y)).collect::<Vec<_>>());

    // No drift: the old answer still refuses them
    assert_eq!(cache.check_for_updates(), 0);
    assert_eq!(source.valid_queries(), 1);

    source.set_valid(Some(Tile::block(-10, -10, 21, 21).collect()));
    // Two tiles of drift reuses the answer: only columns 3 and 4 load
    cache.set_current_position(2 * TILE as i32 + 16, 16);
    assert_eq!(cache.check_for_updates(), 10);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(source.valid_queries(), 1);

    // Three tiles re-queries and the deferred column finally loads
    cache.set_current_position(3 * TILE as i32 + 16, 16);
    assert_eq!(cache.check_for_updates(), 10);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(source.valid_queries(), 2);
    assert!(cache.core().pending_tiles().is_empty());
    assert!(cache.core().debug_tiles().iter().all(|snapshot| snapshot.state == TaskState::Finished));
    assert_eq!(source.calls(Tile::new(2, 0)), 1);
}

#[test]
fn test_strict_source_that_answers_late() {
    init_logging();
    let source = Arc::new(ScriptedSource::new(|_, _| Ok(6.0)));
    let pool = Arc::new(TilePool::new(2).unwrap());
    let params = GridCacheParams::new(5, TILE, 0, 0).with_unknown_tiles(UnknownTilePolicy::Strict);
    let cache = cache_with(&source, &pool, params);

    cache.set_current_position(0, 0);
    assert_eq!(cache.check_for_updates(), 0);
    assert_eq!(cache.check_for_updates(), 0);
    assert_eq!(source.valid_queries(), 2);
    assert_eq!(source.total_calls(), 0);

    source.set_valid(Some(Tile::block(-2, -2, 5, 5).collect()));
    assert_eq!(cache.check_for_updates(), 25);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(source.valid_queries(), 3);
    assert!(cache.is_valid());
    assert_eq!(cache.check_for_updates(), 0);
}

#[test]
fn test_default_locator_covers_derived_window() {
    init_logging();
    let settings = ClipmapSettings::default().with_worker_threads(2);
    let cache_size = settings.cache_size_for(127, 8);
    assert!(cache_size > settings.locator_size);

    let config = TerrainConfiguration::new(1, 8, Vec3::ONE, (0.0, 1000.0));
    let source: Arc<dyn TerrainSource> =
        Arc::new(InMemoryTerrainSource::from_fn(512, config, |x, z| (x + z) as f32).unwrap());
    let pool = Arc::new(TilePool::new(2).unwrap());
    let params = GridCacheParams::new(cache_size, 8, 0, 0).with_settings(&settings);
    let cache = TerrainGridCache::new(params, source, Arc::clone(&pool), 127);

    cache.set_current_position(256, 256);
    assert_eq!(cache.check_for_updates(), (cache_size * cache_size) as usize);
    assert!(pool.wait_idle(WAIT));
    let tiles = cache.core().debug_tiles();
    assert_eq!(tiles.len(), (cache_size * cache_size) as usize);
    assert!(tiles.iter().all(|snapshot| snapshot.state == TaskState::Finished));

    // Drifting within the threshold keeps every new edge tile covered
    cache.set_current_position(256 + 2 * 8, 256 + 2 * 8);
    assert!(cache.check_for_updates() > 0);
    assert!(pool.wait_idle(WAIT));
    assert!(cache.core().pending_tiles().is_empty());
    assert!(cache.core().debug_tiles().iter().all(|snapshot| snapshot.state == TaskState::Finished));
}

#[test]
fn test_edit_during_fetch_is_reloaded() {
    init_logging();
    let edited = Tile::new(0, 0);
    // The first fetch sees the old height, later ones the edit
    let source = Arc::new(ScriptedSource::gated(|_, call| Ok(if call == 0 { 1.0 } else { 50.0 })));
    let pool = Arc::new(TilePool::new(1).unwrap());
    let cache = cache_with(&source, &pool, GridCacheParams::new(1, TILE, 0, 0));

    cache.set_current_position(0, 0);
    assert_eq!(cache.check_for_updates(), 1);
    wait_for_state(&cache, edited, TaskState::Loading);

    source.mark_changed(edited);
    let scheduled = cache.handle_update_requests().unwrap();
    assert!(scheduled.contains(&edited));

    source.open_gate();
    assert!(pool.wait_idle(WAIT));
    assert_eq!(cache.core().task_state(edited), Some(TaskState::Requeue));
    assert_eq!(cache.local_height(3, 3), Some(1.0));

    assert_eq!(cache.check_for_updates(), 1);
    assert!(pool.wait_idle(WAIT));
    assert_eq!(cache.core().task_state(edited), Some(TaskState::Finished));
    assert_eq!(cache.local_height(3, 3), Some(50.0));
    assert_eq!(source.calls(edited), 2);
}
