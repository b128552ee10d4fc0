//! Tile coordinates and axis-aligned integer regions
//!
//! A [`Tile`] addresses a `tile_size`-square block of samples at one level of
//! detail. A [`Region`] is a half-open integer rectangle tagged with the level
//! it belongs to; loaders post regions to tell the update thread which part of
//! a level changed.

use crate::core::ring_index::floor_div;

/// Integer tile coordinate at a single level of detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
}

impl Tile {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Tile containing sample `(x, y)` for tiles of `tile_size` samples
    pub fn containing(x: i32, y: i32, tile_size: i32) -> Self {
        Self::new(floor_div(x, tile_size), floor_div(y, tile_size))
    }

    /// Manhattan distance in tiles
    pub fn manhattan(&self, other: Tile) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    /// Tiles of a `width` x `height` block whose corner is `(x, y)`, row-major
    pub fn block(x: i32, y: i32, width: u32, height: u32) -> impl Iterator<Item = Tile> {
        (0..height as i32).flat_map(move |j| (0..width as i32).map(move |i| Tile::new(x + i, y + j)))
    }
}

/// Half-open rectangle `[x, x + width) x [y, y + height)` at a level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Region {
    pub level: u32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(level: u32, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            level,
            x,
            y,
            width,
            height,
        }
    }

    pub fn left(&self) -> i32 {
        self.x
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn top(&self) -> i32 {
        self.y
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn set_origin(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    /// Same rectangle tagged with another level
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    /// True when both regions share a positive area. Levels are ignored.
    pub fn intersects(&self, other: &Region) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left() < other.right()
            && other.left() < self.right()
            && self.top() < other.bottom()
            && other.top() < self.bottom()
    }

    /// Overlap of two regions, carrying `self`'s level
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        if !self.intersects(other) {
            return None;
        }
        let left = self.left().max(other.left());
        let top = self.top().max(other.top());
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Region::new(self.level, left, top, right - left, bottom - top))
    }

    /// True when `other` lies entirely inside `self` on the same level
    pub fn contains(&self, other: &Region) -> bool {
        self.level == other.level
            && other.left() >= self.left()
            && other.right() <= self.right()
            && other.top() >= self.top()
            && other.bottom() <= self.bottom()
    }
}

/// Clip posted regions to their level's window, copy each survivor down
/// through the finer levels with `to_finer`, clip again and order the result
/// coarse to fine. Regions whose level has no window are dropped.
pub fn propagate_regions<W, F>(posted: Vec<Region>, window: W, to_finer: F) -> Vec<Region>
where
    W: Fn(u32) -> Option<Region>,
    F: Fn(&Region) -> Region,
{
    let clip = |regions: Vec<Region>| -> Vec<Region> {
        regions
            .into_iter()
            .filter_map(|region| window(region.level)?.intersection(&region))
            .collect()
    };

    let mut regions = clip(posted);
    let seeds = regions.clone();
    for seed in seeds {
        let mut current = seed;
        while current.level > 0 {
            let finer = to_finer(&current);
            if regions.iter().any(|existing| existing.contains(&finer)) {
                break;
            }
            regions.push(finer);
            current = finer;
        }
    }

    let mut regions = clip(regions);
    regions.sort_by(|a, b| b.level.cmp(&a.level));
    regions
}
