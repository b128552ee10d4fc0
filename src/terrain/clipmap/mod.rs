//! Geometry and texture clipmaps built on the grid caches.
//!
//! Each geometry level is an `N x N` vertex ring whose window follows the eye.
//! Levels nest: level `n + 1` spaces vertices twice as far apart and leaves a
//! hole exactly where level `n` sits.
//!
//! ```text
//! Level 2: 4x spacing  ████████████████
//! Level 1: 2x spacing    ████████████
//! Level 0: 1x spacing      ████████
//! ```

pub mod culling;
pub mod level;
pub mod texture;
pub mod vertex;

pub use culling::{Aabb, FrustumPlanes};
pub use level::{BlockStats, ClipLevel};
pub use texture::{TextureClipmap, TextureUpdate};
pub use vertex::ClipmapVertex;
