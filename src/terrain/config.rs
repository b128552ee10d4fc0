//! Runtime settings and source descriptions
//!
//! `ClipmapSettings` holds every tunable of the streaming core and is loaded
//! from JSON with serde. `TerrainConfiguration` and `TextureConfiguration`
//! describe what a source can deliver.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{ClipmapError, ClipmapResult};

/// How a grid cache reads a source that cannot enumerate its tiles
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTilePolicy {
    /// Unknown valid set means every tile is valid; unknown invalid set means none changed
    #[default]
    Permissive,
    /// Unknown valid set means nothing is scheduled; unknown invalid set means none changed
    Strict,
}

impl UnknownTilePolicy {
    pub fn canonical(self) -> &'static str {
        match self {
            Self::Permissive => "permissive",
            Self::Strict => "strict",
        }
    }
}

impl fmt::Display for UnknownTilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

impl FromStr for UnknownTilePolicy {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "permissive" | "all" => Ok(Self::Permissive),
            "strict" | "none" => Ok(Self::Strict),
            _ => Err("unknown tile policy"),
        }
    }
}

/// True for side lengths of the form `2^k - 1` with `k >= 3`
pub fn is_valid_clip_side(size: u32) -> bool {
    size >= 7 && (size + 1).is_power_of_two()
}

/// Tunables shared by the geometry and texture clipmaps
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipmapSettings {
    /// Vertices per side of each geometry level, `2^k - 1`
    pub clip_side_size: u32,
    /// Upper bound on geometry levels taken from the source
    pub max_levels: u32,
    /// Extra tiles per cache side beyond what one window needs
    pub cache_buffer_size: u32,
    /// Tile loader threads
    pub worker_threads: usize,
    /// Minimum time between mailbox drains
    pub mailbox_interval_ms: u64,
    /// Sleep between maintenance passes
    pub maintenance_interval_ms: u64,
    /// Interval for change polling and hidden-level cache centering
    pub refresh_interval_ms: u64,
    /// Minimum side of the tile window queried for valid tiles. Each cache
    /// widens it to its own window plus twice `locator_drift`.
    pub locator_size: u32,
    /// Tiles the cache center may drift before the locator is re-queried
    pub locator_drift: u32,
    /// Manhattan radius, in tiles, that gets near priority
    pub near_priority_radius: u32,
    pub unknown_tiles: UnknownTilePolicy,
    pub culling_enabled: bool,
    pub min_visible_level: u32,
    /// Texels per side of each texture clipmap slice
    pub texture_size: u32,
    pub max_texture_levels: u32,
}

impl Default for ClipmapSettings {
    fn default() -> Self {
        Self {
            clip_side_size: 127,
            max_levels: 20,
            cache_buffer_size: 4,
            worker_threads: crate::core::TilePool::default_size(),
            mailbox_interval_ms: 300,
            maintenance_interval_ms: 250,
            refresh_interval_ms: 500,
            locator_size: 20,
            locator_drift: 2,
            near_priority_radius: 3,
            unknown_tiles: UnknownTilePolicy::Permissive,
            culling_enabled: true,
            min_visible_level: 0,
            texture_size: 128,
            max_texture_levels: 20,
        }
    }
}

impl ClipmapSettings {
    pub fn from_json_str(json: &str) -> ClipmapResult<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ClipmapResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn with_clip_side_size(mut self, size: u32) -> Self {
        self.clip_side_size = size;
        self
    }

    pub fn with_max_levels(mut self, levels: u32) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_unknown_tiles(mut self, policy: UnknownTilePolicy) -> Self {
        self.unknown_tiles = policy;
        self
    }

    pub fn with_intervals(mut self, mailbox_ms: u64, maintenance_ms: u64, refresh_ms: u64) -> Self {
        self.mailbox_interval_ms = mailbox_ms;
        self.maintenance_interval_ms = maintenance_ms;
        self.refresh_interval_ms = refresh_ms;
        self
    }

    pub fn with_texture_size(mut self, size: u32) -> Self {
        self.texture_size = size;
        self
    }

    pub fn with_culling(mut self, enabled: bool) -> Self {
        self.culling_enabled = enabled;
        self
    }

    pub fn validate(&self) -> ClipmapResult<()> {
        if !is_valid_clip_side(self.clip_side_size) {
            return Err(ClipmapError::configuration(format!(
                "clip_side_size must be 2^k - 1 and at least 7, got {}",
                self.clip_side_size
            )));
        }
        if self.max_levels == 0 || self.max_texture_levels == 0 {
            return Err(ClipmapError::configuration("level limits must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(ClipmapError::configuration("worker_threads must be at least 1"));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ClipmapError::configuration(
                "maintenance_interval_ms must be greater than zero",
            ));
        }
        if self.locator_size == 0 || self.locator_drift * 2 >= self.locator_size {
            return Err(ClipmapError::configuration(format!(
                "locator_drift {} must be less than half of locator_size {}",
                self.locator_drift, self.locator_size
            )));
        }
        if self.texture_size < 8 || self.texture_size % 2 != 0 {
            return Err(ClipmapError::configuration(format!(
                "texture_size must be even and at least 8, got {}",
                self.texture_size
            )));
        }
        Ok(())
    }

    /// Odd cache side, in tiles, for a window of `window_side` samples
    pub fn cache_size_for(&self, window_side: u32, tile_size: u32) -> u32 {
        let mut size = (window_side + 1) / tile_size.max(1) + self.cache_buffer_size;
        size += (size & 1) ^ 1;
        size
    }
}

/// Description of a terrain height source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerrainConfiguration {
    /// Number of data levels; level `level_count - 1` is the finest
    pub level_count: u32,
    /// Samples per tile side
    pub tile_size: u32,
    /// World units per sample along x and z, height multiplier along y
    pub scale: Vec3,
    /// Raw heights outside this range are treated as missing
    pub height_range: (f32, f32),
}

impl TerrainConfiguration {
    pub fn new(level_count: u32, tile_size: u32, scale: Vec3, height_range: (f32, f32)) -> Self {
        Self {
            level_count,
            tile_size,
            scale,
            height_range,
        }
    }

    pub fn validate(&self) -> ClipmapResult<()> {
        if self.level_count == 0 {
            return Err(ClipmapError::configuration("terrain source reports no levels"));
        }
        if self.tile_size == 0 {
            return Err(ClipmapError::configuration("tile_size must be greater than zero"));
        }
        if self.height_range.0 >= self.height_range.1 {
            return Err(ClipmapError::configuration(format!(
                "height range min {} must be below max {}",
                self.height_range.0, self.height_range.1
            )));
        }
        if self.scale.x <= 0.0 || self.scale.z <= 0.0 {
            return Err(ClipmapError::configuration("horizontal scale must be positive"));
        }
        Ok(())
    }
}

/// Description of a texture source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextureConfiguration {
    pub level_count: u32,
    pub tile_size: u32,
    /// Four channels (RGBA) when set, three (RGB) otherwise
    pub use_alpha: bool,
    /// World units spanned by one finest-level texel
    pub texture_density: f32,
}

impl TextureConfiguration {
    pub fn channels(&self) -> usize {
        if self.use_alpha {
            4
        } else {
            3
        }
    }

    pub fn validate(&self) -> ClipmapResult<()> {
        if self.level_count == 0 {
            return Err(ClipmapError::configuration("texture source reports no levels"));
        }
        if self.tile_size == 0 {
            return Err(ClipmapError::configuration("tile_size must be greater than zero"));
        }
        if self.texture_density <= 0.0 {
            return Err(ClipmapError::configuration("texture_density must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        let settings = ClipmapSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.clip_side_size, 127);
        assert_eq!(settings.unknown_tiles, UnknownTilePolicy::Permissive);
        assert!(settings.worker_threads >= 1);
    }

    #[test]
    fn test_settings_json_round_trip() {
        let settings = ClipmapSettings::default()
            .with_clip_side_size(63)
            .with_unknown_tiles(UnknownTilePolicy::Strict);
        let json = serde_json::to_string(&settings).unwrap();
        let parsed = ClipmapSettings::from_json_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed =
            ClipmapSettings::from_json_str(r#"{ "clip_side_size": 31, "unknown_tiles": "strict" }"#)
                .unwrap();
        assert_eq!(parsed.clip_side_size, 31);
        assert_eq!(parsed.unknown_tiles, UnknownTilePolicy::Strict);
        assert_eq!(parsed.mailbox_interval_ms, 300);
        assert_eq!(parsed.locator_size, 20);
    }

    #[test]
    fn test_invalid_clip_side_rejected() {
        for bad in [0, 3, 64, 100, 128] {
            let settings = ClipmapSettings::default().with_clip_side_size(bad);
            assert!(
                matches!(settings.validate(), Err(ClipmapError::Configuration(_))),
                "{bad} should be rejected"
            );
        }
        for good in [7, 15, 31, 127, 255] {
            assert!(is_valid_clip_side(good));
        }
    }

    #[test]
    fn test_locator_drift_must_fit_window() {
        let mut settings = ClipmapSettings::default();
        settings.locator_drift = 10;
        assert!(settings.validate().is_err());
        assert!(ClipmapSettings::from_json_str(r#"{ "worker_threads": 0 }"#).is_err());
        assert!(matches!(
            ClipmapSettings::from_json_str("{ not json"),
            Err(ClipmapError::Json(_))
        ));
    }

    #[test]
    fn test_cache_size_is_odd() {
        let settings = ClipmapSettings::default();
        // (127 + 1) / 32 + 4 = 8 -> 9
        assert_eq!(settings.cache_size_for(127, 32), 9);
        // (127 + 1) / 64 + 4 = 6 -> 7
        assert_eq!(settings.cache_size_for(127, 64), 7);
        // (127 + 1) / 128 + 4 = 5 stays
        assert_eq!(settings.cache_size_for(127, 128), 5);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Strict".parse::<UnknownTilePolicy>().unwrap(), UnknownTilePolicy::Strict);
        assert_eq!(
            UnknownTilePolicy::Permissive.canonical().parse::<UnknownTilePolicy>().unwrap(),
            UnknownTilePolicy::Permissive
        );
        assert!("maybe".parse::<UnknownTilePolicy>().is_err());
    }

    #[test]
    fn test_source_configuration_validation() {
        let good = TerrainConfiguration::new(4, 32, Vec3::ONE, (0.0, 100.0));
        good.validate().unwrap();
        let flat = TerrainConfiguration::new(4, 32, Vec3::ONE, (5.0, 5.0));
        assert!(flat.validate().is_err());
        let texture = TextureConfiguration {
            level_count: 3,
            tile_size: 0,
            use_alpha: false,
            texture_density: 1.0,
        };
        assert!(texture.validate().is_err());
        assert_eq!(texture.channels(), 3);
    }
}
