//! Terrain streaming: tile sources, grid caches and the clipmaps they feed.
//!
//! Geometry level 0 is the finest. Each level owns a grid cache that keeps a
//! toroidal window of source tiles around the eye and falls back to the next
//! coarser cache while its own tiles are loading.

pub mod builder;
pub mod clipmap;
pub mod clipmap_terrain;
pub mod config;
pub mod grid_cache;
pub mod level_chain;
pub mod picker;
pub mod source;
pub mod terrain_cache;
pub mod texture_cache;
pub mod tiling;

pub use builder::{LevelPlan, TerrainBuilder};
pub use clipmap::{Aabb, BlockStats, ClipLevel, ClipmapVertex, FrustumPlanes, TextureClipmap, TextureUpdate};
pub use clipmap_terrain::{ClipmapTerrain, UpdateStats, ViewState};
pub use config::{
    is_valid_clip_side, ClipmapSettings, TerrainConfiguration, TextureConfiguration, UnknownTilePolicy,
};
pub use grid_cache::{GridCacheCore, GridCacheParams, LoadTask, TaskSnapshot, TaskState, WindowChange};
pub use level_chain::{ChainRef, LevelChain};
pub use picker::GridWalk;
pub use source::{
    InMemoryTerrainSource, InMemoryTextureSource, ProceduralTerrainSource, ProceduralTextureSource, TerrainSource,
    TextureSource,
};
pub use terrain_cache::TerrainGridCache;
pub use texture_cache::{color, TextureGridCache};
pub use tiling::{propagate_regions, Region, Tile};
