//! Coarser-level fallback for height and color reads

use std::sync::Arc;

use glam::Vec3;
use terrain_clipmap::core::TilePool;
use terrain_clipmap::terrain::{
    color, GridCacheParams, InMemoryTerrainSource, InMemoryTextureSource, LevelChain, TaskState,
    TerrainConfiguration, TerrainGridCache, TerrainSource, TextureConfiguration, TextureGridCache, TextureSource,
    Tile,
};

const TILE: u32 = 4;

fn plane(x: usize, z: usize) -> f32 {
    (2 * x + 10 * z) as f32
}

/// `levels` caches over one source, finest first, nothing loaded
fn terrain_chain(levels: u32) -> LevelChain<TerrainGridCache> {
    let config = TerrainConfiguration::new(levels, TILE, Vec3::new(1.0, 0.5, 1.0), (0.0, 10_000.0));
    let source: Arc<dyn TerrainSource> = Arc::new(InMemoryTerrainSource::from_fn(64, config, plane).unwrap());
    let pool = Arc::new(TilePool::new(1).unwrap());
    let caches = (0..levels)
        .map(|level| {
            let params = GridCacheParams::new(5, TILE, level, levels - 1 - level).with_vertex_distance(1 << level);
            Arc::new(TerrainGridCache::new(params, Arc::clone(&source), Arc::clone(&pool), 15))
        })
        .collect();
    LevelChain::new(caches)
}

#[test]
fn test_child_reads_parent_when_not_loaded() {
    let chain = terrain_chain(2);
    let parent = chain.get(1).unwrap();
    assert_eq!(parent.copy_tile_data(Tile::new(0, 0), 0, 0), TaskState::Finished);
    let child = chain.level(0).unwrap();

    // Parent sample (2, 2) is finest sample (4, 4), height scale 0.5
    assert_eq!(child.get_height(4, 4, true), plane(4, 4) * 0.5);
    // Odd finest sample between parent samples (2, 2) and (3, 2)
    assert_eq!(child.get_height(5, 4, true), (plane(4, 4) + plane(6, 4)) * 0.25);
    // Fallback disabled: default height, the scaled minimum
    assert_eq!(child.get_height(4, 4, false), 0.0);

    // Once the child tile lands it wins over the parent
    assert_eq!(chain.get(0).unwrap().copy_tile_data(Tile::new(1, 1), 1, 1), TaskState::Finished);
    assert_eq!(child.get_height(5, 4, true), plane(5, 4) * 0.5);
}

#[test]
fn test_bilinear_fallback_matches_plane() {
    let chain = terrain_chain(2);
    chain.get(1).unwrap().copy_tile_data(Tile::new(0, 0), 0, 0);
    let child = chain.level(0).unwrap();
    // A plane survives point sampling and bilinear blending exactly
    let height = child.get_sub_height(4.5, 5.0, true);
    assert!((height - (2.0 * 4.5 + 10.0 * 5.0) * 0.5).abs() < 1e-3, "{}", height);
}

#[test]
fn test_recursion_stops_at_chain_end() {
    let chain = terrain_chain(5);
    let finest = chain.level(0).unwrap();
    assert_eq!(finest.depth(), 4);
    // Nothing loaded anywhere: every path ends in the default height
    for (x, z) in [(0, 0), (7, 3), (-5, 9), (1023, -1023)] {
        assert_eq!(finest.get_height(x, z, true), 0.0);
        assert_eq!(finest.get_sub_height(x as f32 + 0.25, z as f32 + 0.75, true), 0.0);
    }

    // Only the coarsest level has data, four levels up
    assert_eq!(chain.get(4).unwrap().copy_tile_data(Tile::new(0, 0), 0, 0), TaskState::Finished);
    // Finest (16, 16) is coarsest (1, 1)
    assert_eq!(finest.get_height(16, 16, true), plane(16, 16) * 0.5);
}

#[test]
fn test_color_fallback() {
    let config = TextureConfiguration {
        level_count: 2,
        tile_size: TILE,
        use_alpha: true,
        texture_density: 1.0,
    };
    let side = 32;
    let mut texels = Vec::with_capacity(side * side * 4);
    for y in 0..side {
        for x in 0..side {
            texels.extend_from_slice(&[(x * 4) as u8, (y * 4) as u8, 50, 255]);
        }
    }
    let source: Arc<dyn TextureSource> = Arc::new(InMemoryTextureSource::new(side, texels, config).unwrap());
    let pool = Arc::new(TilePool::new(1).unwrap());
    let fine = TextureGridCache::new(GridCacheParams::new(5, TILE, 0, 1), Arc::clone(&source), Arc::clone(&pool), 16);
    let coarse = TextureGridCache::new(GridCacheParams::new(5, TILE, 1, 0), source, pool, 16);
    let chain = LevelChain::new(vec![Arc::new(fine), Arc::new(coarse)]);

    let finest = chain.level(0).unwrap();
    assert_eq!(finest.get_color(4, 4, true), 0);
    chain.get(1).unwrap().copy_tile_data(Tile::new(0, 0), 0, 0);
    assert_eq!(finest.get_color(4, 4, true), color::pack(16, 16, 50, 255));
    assert_eq!(finest.get_color(5, 4, true), color::pack(20, 16, 50, 255));
}
