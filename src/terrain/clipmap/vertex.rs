//! Clipmap vertex format with a coarse-level blend height.

use bytemuck::{Pod, Zeroable};

/// Clipmap vertex carrying the height of the next coarser level.
///
/// Layout: 16 bytes, `[x, y, z, w]` as four `f32`.
/// - position: world-space sample position, y is the scaled height
/// - coarse_height: height the coarser level gives at the same spot, for
///   blending across level boundaries in the shader
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ClipmapVertex {
    pub position: [f32; 3],
    pub coarse_height: f32,
}

impl ClipmapVertex {
    /// Bytes between consecutive vertices
    pub const STRIDE: usize = std::mem::size_of::<Self>();

    pub fn new(x: f32, y: f32, z: f32, coarse_height: f32) -> Self {
        Self {
            position: [x, y, z],
            coarse_height,
        }
    }

    pub fn height(&self) -> f32 {
        self.position[1]
    }

    /// Difference between this level's height and the coarser one
    pub fn blend_delta(&self) -> f32 {
        self.coarse_height - self.position[1]
    }

    /// View a vertex slice as raw bytes for upload
    pub fn as_bytes(vertices: &[Self]) -> &[u8] {
        bytemuck::cast_slice(vertices)
    }
}
