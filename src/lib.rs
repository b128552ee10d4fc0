//! Streaming geometry and texture clipmaps over tiled terrain sources.
//!
//! A [`TerrainBuilder`] turns a [`TerrainSource`] and [`ClipmapSettings`] into
//! a [`ClipmapTerrain`]. Each frame the caller passes the eye position to
//! [`ClipmapTerrain::update`] and uploads the vertex rings, strip indices and
//! texture slice updates it produces. Tile loading runs on a worker pool and
//! never blocks the update.

pub mod core;
pub mod error;
pub mod terrain;

pub use crate::core::{CancelToken, Mailbox, RingIndex, TilePool};
pub use error::{ClipmapError, ClipmapResult, SourceError};
pub use terrain::{
    ClipLevel, ClipmapSettings, ClipmapTerrain, ClipmapVertex, Region, TerrainBuilder, TerrainConfiguration,
    TerrainSource, TextureClipmap, TextureConfiguration, TextureSource, TextureUpdate, Tile, UpdateStats, ViewState,
};
