//! Position-driven tile scheduler shared by the terrain and texture caches.
//!
//! A grid cache keeps a `cache_size x cache_size` window of tiles around the
//! camera. Each wanted tile gets one [`LoadTask`] bound to the slot
//! `tile mod cache_size`. Moving the window cancels tasks that fell out of it
//! and queues new ones; a periodic maintenance pass hands queued tasks to the
//! shared [`TilePool`] with a distance-based priority.
//!
//! Slot contents live in a [`SlotGrid`]. A slot is only marked valid by a
//! commit that holds the slot lock and sees its task still uncancelled, so a
//! superseded load can never publish data into a reassigned slot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use crate::core::double_buffer::Mailbox;
use crate::core::ring_index::RingIndex;
use crate::core::tile_pool::{CancelToken, TilePool};
use crate::error::SourceError;
use crate::terrain::config::{ClipmapSettings, UnknownTilePolicy};
use crate::terrain::source::{TerrainSource, TextureSource};
use crate::terrain::tiling::{Region, Tile};

/// Base priority for tiles close to the window center
pub const NEAR_PRIORITY: i32 = 10_000;

/// Lifecycle of a load task
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Init = 0,
    Loading = 1,
    Finished = 2,
    Cancelled = 3,
    Error = 4,
    Requeue = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskState::Loading,
            2 => TaskState::Finished,
            3 => TaskState::Cancelled,
            4 => TaskState::Error,
            5 => TaskState::Requeue,
            _ => TaskState::Init,
        }
    }

    /// True once a run has ended, whatever the outcome
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Cancelled | TaskState::Error | TaskState::Requeue
        )
    }
}

/// One source tile bound to one destination slot
#[derive(Debug)]
pub struct LoadTask {
    source: Tile,
    dest: Tile,
    level: u32,
    state: AtomicU8,
    cancel: CancelToken,
    reload: AtomicBool,
}

impl LoadTask {
    pub fn new(source: Tile, dest: Tile, level: u32) -> Self {
        Self {
            source,
            dest,
            level,
            state: AtomicU8::new(TaskState::Init as u8),
            cancel: CancelToken::new(),
            reload: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> Tile {
        self.source
    }

    pub fn dest(&self) -> Tile {
        self.dest
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Ask for one more load once the running one ends
    pub(crate) fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

/// Inspection record of a tracked task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub source: Tile,
    pub dest: Tile,
    pub state: TaskState,
}

struct SlotContents<T> {
    tile: Option<Tile>,
    samples: Vec<T>,
}

struct Slot<T> {
    valid: AtomicBool,
    contents: RwLock<SlotContents<T>>,
}

/// Toroidal grid of tile slots, each holding `tile_size^2 * channels` samples
pub struct SlotGrid<T> {
    ring: RingIndex,
    tile_size: i32,
    channels: usize,
    slots: Vec<Slot<T>>,
}

impl<T: Copy> SlotGrid<T> {
    pub fn new(cache_size: u32, tile_size: u32, channels: usize, fill: T) -> Self {
        let ring = RingIndex::new(cache_size);
        let per_slot = (tile_size as usize).pow(2) * channels;
        let slots = (0..ring.size() * ring.size())
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                contents: RwLock::new(SlotContents {
                    tile: None,
                    samples: vec![fill; per_slot],
                }),
            })
            .collect();
        Self {
            ring,
            tile_size: tile_size as i32,
            channels,
            slots,
        }
    }

    pub fn ring(&self) -> RingIndex {
        self.ring
    }

    pub fn tile_size(&self) -> i32 {
        self.tile_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples one tile must deliver
    pub fn samples_per_tile(&self) -> usize {
        (self.tile_size as usize).pow(2) * self.channels
    }

    fn slot(&self, dest: Tile) -> &Slot<T> {
        &self.slots[self.ring.linear(dest.x, dest.y)]
    }

    pub fn is_valid(&self, dest: Tile) -> bool {
        self.slot(dest).valid.load(Ordering::SeqCst)
    }

    /// Source tile whose data the slot currently holds
    pub fn owner(&self, dest: Tile) -> Option<Tile> {
        let slot = self.slot(dest);
        let contents = slot.contents.read().unwrap_or_else(PoisonError::into_inner);
        contents.tile
    }

    pub fn invalidate(&self, dest: Tile) {
        let slot = self.slot(dest);
        let mut contents = slot.contents.write().unwrap_or_else(PoisonError::into_inner);
        slot.valid.store(false, Ordering::SeqCst);
        contents.tile = None;
    }

    /// Copy a whole tile into its slot and mark it valid, unless `cancel` fired.
    /// `samples` must hold at least [`Self::samples_per_tile`] values.
    pub fn commit(&self, dest: Tile, source: Tile, cancel: &CancelToken, samples: &[T]) -> bool {
        let row = self.tile_size as usize * self.channels;
        if samples.len() < row * self.tile_size as usize {
            return false;
        }
        let slot = self.slot(dest);
        let mut contents = slot.contents.write().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            return false;
        }
        slot.valid.store(false, Ordering::SeqCst);
        for (dst, src) in contents
            .samples
            .chunks_exact_mut(row)
            .zip(samples.chunks_exact(row))
        {
            dst.copy_from_slice(src);
        }
        contents.tile = Some(source);
        slot.valid.store(true, Ordering::SeqCst);
        true
    }

    /// Run `f` on the samples at `(x, y)` when the slot holds the tile covering it
    pub fn read<R>(&self, x: i32, y: i32, f: impl FnOnce(&[T]) -> R) -> Option<R> {
        let tile = Tile::containing(x, y, self.tile_size);
        let slot = self.slot(tile);
        if !slot.valid.load(Ordering::SeqCst) {
            return None;
        }
        let contents = slot.contents.read().unwrap_or_else(PoisonError::into_inner);
        if contents.tile != Some(tile) {
            return None;
        }
        let lx = (x - tile.x * self.tile_size) as usize;
        let ly = (y - tile.y * self.tile_size) as usize;
        let offset = (ly * self.tile_size as usize + lx) * self.channels;
        contents.samples.get(offset..offset + self.channels).map(f)
    }

    /// True when sample `(x, y)` is covered by a valid slot
    pub fn covers(&self, x: i32, y: i32) -> bool {
        self.read(x, y, |_| ()).is_some()
    }
}

/// Storage side of a grid cache as seen by the scheduler and its tasks
pub trait TileStore: Send + Sync + 'static {
    /// Pull one tile from the backing source into slot `dest`
    fn copy_tile_data(&self, source: Tile, dest: Tile, cancel: &CancelToken) -> TaskState;

    fn valid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Result<Option<HashSet<Tile>>, SourceError>;

    fn invalid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Result<Option<HashSet<Tile>>, SourceError>;

    fn slot_valid(&self, dest: Tile) -> bool;

    fn slot_owner(&self, dest: Tile) -> Option<Tile>;

    fn invalidate_slot(&self, dest: Tile);
}

/// Uniform view of the terrain and texture source traits
pub trait TileFetch: Send + Sync {
    type Sample: Copy + Send + Sync + 'static;

    fn fetch_tile(&self, level: u32, tile: Tile) -> Result<Vec<Self::Sample>, SourceError>;

    fn fetch_valid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32)
        -> Result<Option<HashSet<Tile>>, SourceError>;

    fn fetch_invalid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32)
        -> Result<Option<HashSet<Tile>>, SourceError>;
}

impl TileFetch for dyn TerrainSource {
    type Sample = f32;

    fn fetch_tile(&self, level: u32, tile: Tile) -> Result<Vec<f32>, SourceError> {
        self.get_tile(level, tile)
    }

    fn fetch_valid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32)
        -> Result<Option<HashSet<Tile>>, SourceError> {
        self.get_valid_tiles(level, x, y, width, height)
    }

    fn fetch_invalid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32)
        -> Result<Option<HashSet<Tile>>, SourceError> {
        self.get_invalid_tiles(level, x, y, width, height)
    }
}

impl TileFetch for dyn TextureSource {
    type Sample = u8;

    fn fetch_tile(&self, level: u32, tile: Tile) -> Result<Vec<u8>, SourceError> {
        self.get_tile(level, tile)
    }

    fn fetch_valid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32)
        -> Result<Option<HashSet<Tile>>, SourceError> {
        self.get_valid_tiles(level, x, y, width, height)
    }

    fn fetch_invalid_tiles(&self, level: u32, x: i32, y: i32, width: u32, height: u32)
        -> Result<Option<HashSet<Tile>>, SourceError> {
        self.get_invalid_tiles(level, x, y, width, height)
    }
}

/// Slot grid filled from one data level of a source
pub struct SourceSlots<S: ?Sized + TileFetch> {
    source: Arc<S>,
    data_level: u32,
    slots: SlotGrid<S::Sample>,
}

impl<S: ?Sized + TileFetch> SourceSlots<S> {
    pub fn new(source: Arc<S>, data_level: u32, slots: SlotGrid<S::Sample>) -> Self {
        Self {
            source,
            data_level,
            slots,
        }
    }

    pub fn slots(&self) -> &SlotGrid<S::Sample> {
        &self.slots
    }

    pub fn data_level(&self) -> u32 {
        self.data_level
    }
}

impl<S: ?Sized + TileFetch + 'static> TileStore for SourceSlots<S> {
    fn copy_tile_data(&self, source: Tile, dest: Tile, cancel: &CancelToken) -> TaskState {
        if cancel.is_cancelled() {
            return TaskState::Cancelled;
        }
        match self.source.fetch_tile(self.data_level, source) {
            Ok(samples) => {
                if samples.len() < self.slots.samples_per_tile() {
                    log::warn!(
                        "level {} tile ({}, {}): expected {} samples, got {}",
                        self.data_level,
                        source.x,
                        source.y,
                        self.slots.samples_per_tile(),
                        samples.len()
                    );
                    return TaskState::Error;
                }
                if self.slots.commit(dest, source, cancel, &samples) {
                    TaskState::Finished
                } else {
                    TaskState::Cancelled
                }
            }
            Err(SourceError::Interrupted) => TaskState::Cancelled,
            Err(SourceError::NotReady) => TaskState::Requeue,
            Err(err) => {
                log::warn!(
                    "level {} tile ({}, {}) failed: {}",
                    self.data_level,
                    source.x,
                    source.y,
                    err
                );
                TaskState::Error
            }
        }
    }

    fn valid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        self.source.fetch_valid_tiles(self.data_level, x, y, width, height)
    }

    fn invalid_tiles(&self, x: i32, y: i32, width: u32, height: u32) -> Result<Option<HashSet<Tile>>, SourceError> {
        self.source.fetch_invalid_tiles(self.data_level, x, y, width, height)
    }

    fn slot_valid(&self, dest: Tile) -> bool {
        self.slots.is_valid(dest)
    }

    fn slot_owner(&self, dest: Tile) -> Option<Tile> {
        self.slots.owner(dest)
    }

    fn invalidate_slot(&self, dest: Tile) {
        self.slots.invalidate(dest);
    }
}

/// Construction parameters of a grid cache
#[derive(Debug, Clone, PartialEq)]
pub struct GridCacheParams {
    /// Tiles per window side, odd
    pub cache_size: u32,
    pub tile_size: u32,
    /// Geometry level, 0 is the finest
    pub level: u32,
    /// Source level, higher is finer
    pub data_level: u32,
    /// Units per sample in posted regions
    pub vertex_distance: i32,
    pub locator_size: u32,
    pub locator_drift: u32,
    pub near_priority_radius: u32,
    pub unknown_tiles: UnknownTilePolicy,
}

impl GridCacheParams {
    pub fn new(cache_size: u32, tile_size: u32, level: u32, data_level: u32) -> Self {
        let defaults = ClipmapSettings::default();
        Self {
            cache_size,
            tile_size,
            level,
            data_level,
            vertex_distance: 1,
            locator_size: defaults.locator_size,
            locator_drift: defaults.locator_drift,
            near_priority_radius: defaults.near_priority_radius,
            unknown_tiles: defaults.unknown_tiles,
        }
    }

    pub fn with_settings(mut self, settings: &ClipmapSettings) -> Self {
        self.locator_size = settings.locator_size;
        self.locator_drift = settings.locator_drift;
        self.near_priority_radius = settings.near_priority_radius;
        self.unknown_tiles = settings.unknown_tiles;
        self
    }

    pub fn with_vertex_distance(mut self, vertex_distance: i32) -> Self {
        self.vertex_distance = vertex_distance.max(1);
        self
    }

    pub fn with_unknown_tiles(mut self, policy: UnknownTilePolicy) -> Self {
        self.unknown_tiles = policy;
        self
    }

    /// Side of the locator query in tiles. Covers the window plus the drift
    /// allowed before the next query, whatever `locator_size` says.
    pub fn locator_span(&self) -> u32 {
        self.locator_size.max(self.cache_size + 2 * self.locator_drift)
    }
}

/// Tiles added and dropped by a window move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowChange {
    pub center: Tile,
    pub added: Vec<Tile>,
    pub cancelled: Vec<Tile>,
}

#[derive(Default)]
struct Scheduler {
    center: Option<Tile>,
    current: HashMap<Tile, Arc<LoadTask>>,
    pending: HashMap<Tile, Arc<LoadTask>>,
}

enum TileFilter {
    All,
    Nothing,
    Only(HashSet<Tile>),
}

impl TileFilter {
    fn allows(&self, tile: Tile) -> bool {
        match self {
            TileFilter::All => true,
            TileFilter::Nothing => false,
            TileFilter::Only(tiles) => tiles.contains(&tile),
        }
    }

    fn unknown(policy: UnknownTilePolicy) -> Self {
        match policy {
            UnknownTilePolicy::Permissive => TileFilter::All,
            UnknownTilePolicy::Strict => TileFilter::Nothing,
        }
    }
}

struct Locator {
    anchor: Option<Tile>,
    filter: TileFilter,
}

/// Scheduling state shared by every concrete grid cache
pub struct GridCacheCore {
    params: GridCacheParams,
    ring: RingIndex,
    store: Arc<dyn TileStore>,
    pool: Arc<TilePool>,
    mailbox: OnceLock<Arc<Mailbox<Region>>>,
    scheduler: Mutex<Scheduler>,
    locator: Mutex<Locator>,
}

impl GridCacheCore {
    pub fn new(params: GridCacheParams, store: Arc<dyn TileStore>, pool: Arc<TilePool>) -> Self {
        let ring = RingIndex::new(params.cache_size);
        let filter = TileFilter::unknown(params.unknown_tiles);
        Self {
            params,
            ring,
            store,
            pool,
            mailbox: OnceLock::new(),
            scheduler: Mutex::new(Scheduler::default()),
            locator: Mutex::new(Locator { anchor: None, filter }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn params(&self) -> &GridCacheParams {
        &self.params
    }

    pub fn cache_size(&self) -> u32 {
        self.params.cache_size
    }

    pub fn tile_size(&self) -> u32 {
        self.params.tile_size
    }

    pub fn level(&self) -> u32 {
        self.params.level
    }

    /// Slot that holds `tile`
    pub fn dest_for(&self, tile: Tile) -> Tile {
        Tile::new(self.ring.wrap(tile.x) as i32, self.ring.wrap(tile.y) as i32)
    }

    /// Route completion regions to `mailbox`. Only the first attachment sticks.
    pub fn attach_mailbox(&self, mailbox: Arc<Mailbox<Region>>) -> bool {
        self.mailbox.set(mailbox).is_ok()
    }

    pub fn mailbox(&self) -> Option<&Arc<Mailbox<Region>>> {
        self.mailbox.get()
    }

    pub fn center_tile(&self) -> Option<Tile> {
        self.lock().center
    }

    /// Re-center the window on the tile containing sample `(x, y)`
    pub fn set_current_position(&self, x: i32, y: i32) -> Option<WindowChange> {
        let center = Tile::containing(x, y, self.params.tile_size as i32);
        let change = {
            let mut sched = self.lock();
            if sched.center == Some(center) {
                return None;
            }
            sched.center = Some(center);

            let size = self.params.cache_size;
            let half = (size / 2) as i32;
            let mut wanted: HashSet<Tile> =
                Tile::block(center.x - half, center.y - half, size, size).collect();

            let mut cancelled = Vec::new();
            let Scheduler { current, pending, .. } = &mut *sched;
            current.retain(|source, task| {
                if wanted.remove(source) {
                    return true;
                }
                task.cancel();
                self.store.invalidate_slot(task.dest());
                pending.remove(source);
                cancelled.push(*source);
                false
            });

            let mut added: Vec<Tile> = wanted.into_iter().collect();
            added.sort_unstable();
            for source in &added {
                let task = Arc::new(LoadTask::new(*source, self.dest_for(*source), self.params.level));
                pending.insert(*source, Arc::clone(&task));
                current.insert(*source, task);
            }
            cancelled.sort_unstable();

            WindowChange {
                center,
                added,
                cancelled,
            }
        };

        let purged = self.pool.purge();
        log::debug!(
            "level {}: window centered on ({}, {}), {} added, {} cancelled, {} purged",
            self.params.level,
            center.x,
            center.y,
            change.added.len(),
            change.cancelled.len(),
            purged
        );
        Some(change)
    }

    /// Maintenance pass: requeue, swap pending tasks out, refresh the locator
    /// and submit. Returns the number of tasks handed to the pool.
    pub fn check_for_updates(&self) -> usize {
        let (ready, center) = {
            let mut sched = self.lock();
            let Some(center) = sched.center else {
                return 0;
            };
            let requeued: Vec<Arc<LoadTask>> = sched
                .current
                .values()
                .filter(|task| task.state() == TaskState::Requeue)
                .cloned()
                .collect();
            for task in requeued {
                task.set_state(TaskState::Init);
                sched.pending.insert(task.source(), task);
            }
            if sched.pending.is_empty() {
                return 0;
            }
            (std::mem::take(&mut sched.pending), center)
        };

        self.refresh_locator(center);
        let locator = self.locator.lock().unwrap_or_else(PoisonError::into_inner);

        let mut submitted = 0;
        let mut deferred = Vec::new();
        for task in ready.into_values() {
            if task.is_cancelled() {
                continue;
            }
            if !locator.filter.allows(task.source()) {
                log::trace!(
                    "level {}: tile ({}, {}) not offered by source",
                    self.params.level,
                    task.source().x,
                    task.source().y
                );
                deferred.push(task);
                continue;
            }
            if self.store.slot_owner(task.dest()) != Some(task.source()) {
                self.store.invalidate_slot(task.dest());
            }

            let priority = self.priority(task.source(), center);
            let region = self.region_for(task.source());
            let store = Arc::clone(&self.store);
            let mailbox = self.mailbox.get().cloned();
            let cancel = task.cancel_token().clone();
            let job = Arc::clone(&task);
            if self.pool.submit(priority, cancel, move || {
                run_load_task(&job, store.as_ref(), mailbox.as_deref(), region)
            }) {
                submitted += 1;
            }
        }

        drop(locator);

        // Refused tiles wait for the next locator answer
        if !deferred.is_empty() {
            let mut sched = self.lock();
            for task in deferred {
                let tracked = sched
                    .current
                    .get(&task.source())
                    .is_some_and(|current| Arc::ptr_eq(current, &task));
                if tracked && !task.is_cancelled() {
                    sched.pending.entry(task.source()).or_insert(task);
                }
            }
        }

        if submitted > 0 {
            log::debug!("level {}: submitted {} tile loads", self.params.level, submitted);
        }
        submitted
    }

    fn refresh_locator(&self, center: Tile) {
        let mut locator = self.locator.lock().unwrap_or_else(PoisonError::into_inner);
        let drift = self.params.locator_drift as i32;
        let stale = match locator.anchor {
            None => true,
            Some(anchor) => (center.x - anchor.x).abs() > drift || (center.y - anchor.y).abs() > drift,
        };
        if !stale {
            return;
        }

        let size = self.params.locator_span();
        let half = (size / 2) as i32;
        match self.store.valid_tiles(center.x - half, center.y - half, size, size) {
            Ok(Some(tiles)) => {
                log::debug!(
                    "level {}: locator at ({}, {}) found {} valid tiles",
                    self.params.level,
                    center.x,
                    center.y,
                    tiles.len()
                );
                locator.filter = TileFilter::Only(tiles);
                locator.anchor = Some(center);
            }
            Ok(None) => {
                locator.filter = TileFilter::unknown(self.params.unknown_tiles);
                // A strict cache keeps asking until the source can answer
                locator.anchor = match self.params.unknown_tiles {
                    UnknownTilePolicy::Permissive => Some(center),
                    UnknownTilePolicy::Strict => None,
                };
            }
            Err(err) => {
                log::warn!("level {}: valid tile query failed: {}", self.params.level, err);
                locator.filter = TileFilter::unknown(self.params.unknown_tiles);
                locator.anchor = None;
            }
        }
    }

    /// Near tiles outrank everything, finer data levels first; farther tiles
    /// fall off with distance.
    pub fn priority(&self, source: Tile, center: Tile) -> i32 {
        let distance = source.manhattan(center);
        let level = self.params.data_level as i32;
        if distance <= self.params.near_priority_radius as i32 {
            NEAR_PRIORITY * (level + 1)
        } else {
            2 * level - distance
        }
    }

    /// Region covered by `source` in posted units
    pub fn region_for(&self, source: Tile) -> Region {
        let span = self.params.tile_size as i32 * self.params.vertex_distance;
        Region::new(self.params.level, source.x * span, source.y * span, span, span)
    }

    /// Schedule tracked tiles the source reports as changed for reload on the
    /// next maintenance pass. A tile whose fetch is running is loaded again
    /// once that fetch ends. Returns the tiles that will see the change.
    pub fn handle_update_requests(&self) -> Option<HashSet<Tile>> {
        let center = self.center_tile()?;
        let size = self.params.cache_size;
        let half = (size / 2) as i32;
        let changed = match self.store.invalid_tiles(center.x - half, center.y - half, size, size) {
            Ok(Some(tiles)) if !tiles.is_empty() => tiles,
            Ok(_) => return None,
            Err(err) => {
                log::warn!("level {}: invalid tile query failed: {}", self.params.level, err);
                return None;
            }
        };

        let mut sched = self.lock();
        let mut scheduled = HashSet::new();
        for tile in changed {
            let Some(task) = sched.current.get(&tile).cloned() else {
                continue;
            };
            match task.state() {
                TaskState::Finished | TaskState::Error | TaskState::Cancelled => {
                    task.set_state(TaskState::Init);
                    sched.pending.insert(tile, task);
                }
                TaskState::Loading => {
                    // The running fetch may have read the old data
                    task.request_reload();
                    if task.state() != TaskState::Loading && task.take_reload() {
                        task.set_state(TaskState::Init);
                        sched.pending.insert(tile, task);
                    }
                }
                // Not fetched yet, the next run reads the new data
                TaskState::Init | TaskState::Requeue => {}
            }
            scheduled.insert(tile);
        }
        drop(sched);

        if scheduled.is_empty() {
            None
        } else {
            log::debug!("level {}: reloading {} changed tiles", self.params.level, scheduled.len());
            Some(scheduled)
        }
    }

    /// True when any tracked tile has valid data
    pub fn is_valid(&self) -> bool {
        let sched = self.lock();
        sched.current.values().any(|task| self.store.slot_valid(task.dest()))
    }

    pub fn task_state(&self, source: Tile) -> Option<TaskState> {
        self.lock().current.get(&source).map(|task| task.state())
    }

    /// Tracked source tiles, sorted
    pub fn tracked_tiles(&self) -> Vec<Tile> {
        let mut tiles: Vec<Tile> = self.lock().current.keys().copied().collect();
        tiles.sort_unstable();
        tiles
    }

    /// Tiles waiting for the next maintenance pass, sorted
    pub fn pending_tiles(&self) -> Vec<Tile> {
        let mut tiles: Vec<Tile> = self.lock().pending.keys().copied().collect();
        tiles.sort_unstable();
        tiles
    }

    pub fn debug_tiles(&self) -> Vec<TaskSnapshot> {
        let mut tiles: Vec<TaskSnapshot> = self
            .lock()
            .current
            .values()
            .map(|task| TaskSnapshot {
                source: task.source(),
                dest: task.dest(),
                state: task.state(),
            })
            .collect();
        tiles.sort_unstable_by_key(|snapshot| snapshot.source);
        tiles
    }

    /// Cancel every tracked task and forget the window
    pub fn shutdown(&self) {
        let mut sched = self.lock();
        for task in sched.current.values() {
            task.cancel();
        }
        sched.current.clear();
        sched.pending.clear();
        sched.center = None;
        drop(sched);
        self.pool.purge();
    }
}

impl Drop for GridCacheCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_load_task(task: &LoadTask, store: &dyn TileStore, mailbox: Option<&Mailbox<Region>>, region: Region) {
    task.set_state(TaskState::Loading);
    if task.is_cancelled() {
        task.set_state(TaskState::Cancelled);
        log::trace!("tile ({}, {}) cancelled before load", task.source().x, task.source().y);
        return;
    }

    let state = store.copy_tile_data(task.source(), task.dest(), task.cancel_token());
    task.set_state(state);
    if state == TaskState::Finished {
        if let Some(mailbox) = mailbox {
            mailbox.add(region);
        }
    }
    if state != TaskState::Cancelled && task.take_reload() {
        task.set_state(TaskState::Requeue);
    }
    log::trace!(
        "level {} tile ({}, {}) -> {:?}",
        task.level(),
        task.source().x,
        task.source().y,
        state
    );
}
