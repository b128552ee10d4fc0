//! Block visibility tests for clip level index generation.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

/// Frustum planes for culling (Ax + By + Cz + D = 0 format, normals inward).
#[derive(Debug, Clone, Copy)]
pub struct FrustumPlanes {
    pub left: Vec4,
    pub right: Vec4,
    pub bottom: Vec4,
    pub top: Vec4,
    pub near: Vec4,
    pub far: Vec4,
}

impl FrustumPlanes {
    /// Extract frustum planes from a view-projection matrix with depth in [0, 1].
    pub fn from_view_proj(vp: Mat4) -> Self {
        let rows = [
            Vec4::new(vp.x_axis.x, vp.y_axis.x, vp.z_axis.x, vp.w_axis.x),
            Vec4::new(vp.x_axis.y, vp.y_axis.y, vp.z_axis.y, vp.w_axis.y),
            Vec4::new(vp.x_axis.z, vp.y_axis.z, vp.z_axis.z, vp.w_axis.z),
            Vec4::new(vp.x_axis.w, vp.y_axis.w, vp.z_axis.w, vp.w_axis.w),
        ];

        Self {
            left: normalize_plane(rows[3] + rows[0]),
            right: normalize_plane(rows[3] - rows[0]),
            bottom: normalize_plane(rows[3] + rows[1]),
            top: normalize_plane(rows[3] - rows[1]),
            near: normalize_plane(rows[2]),
            far: normalize_plane(rows[3] - rows[2]),
        }
    }

    pub fn planes(&self) -> [Vec4; 6] {
        [self.left, self.right, self.bottom, self.top, self.near, self.far]
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes()
            .iter()
            .all(|plane| plane.xyz().dot(point) + plane.w >= 0.0)
    }

    /// True unless the box lies entirely behind one plane
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.planes().iter().all(|plane| {
            let normal = plane.xyz();
            // Corner furthest along the plane normal
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max(), aabb.min());
            normal.dot(positive) + plane.w >= 0.0
        })
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.xyz().length();
    if length > f32::EPSILON {
        plane / length
    } else {
        plane
    }
}

/// Axis-aligned box as center plus half extents
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub center: Vec3,
    pub extent: Vec3,
}

impl Aabb {
    pub fn new(center: Vec3, extent: Vec3) -> Self {
        Self {
            center,
            extent: extent.abs(),
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.extent
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.extent
    }

    /// Scale both center and extent, as a world transform without rotation would
    pub fn scaled(&self, scale: Vec3) -> Self {
        Self::new(self.center * scale, self.extent * scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looking_down_negative_z() -> FrustumPlanes {
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), Vec3::Y);
        let proj = Mat4::perspective_rh(60.0_f32.to_radians(), 1.0, 1.0, 500.0);
        FrustumPlanes::from_view_proj(proj * view)
    }

    #[test]
    fn test_frustum_planes_extraction() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 100.0, 100.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(45.0_f32.to_radians(), 1.0, 1.0, 1000.0);
        let frustum = FrustumPlanes::from_view_proj(proj * view);

        for plane in frustum.planes() {
            assert!((plane.xyz().length() - 1.0).abs() < 0.01);
        }
        assert!(frustum.contains_point(Vec3::ZERO));
    }

    #[test]
    fn test_box_in_front_is_visible() {
        let frustum = looking_down_negative_z();
        let aabb = Aabb::new(Vec3::new(0.0, 0.0, -50.0), Vec3::splat(5.0));
        assert!(frustum.intersects_aabb(&aabb));
    }

    #[test]
    fn test_box_behind_is_culled() {
        let frustum = looking_down_negative_z();
        let aabb = Aabb::new(Vec3::new(0.0, 0.0, 50.0), Vec3::splat(5.0));
        assert!(!frustum.intersects_aabb(&aabb));
        let beyond_far = Aabb::new(Vec3::new(0.0, 0.0, -900.0), Vec3::splat(5.0));
        assert!(!frustum.intersects_aabb(&beyond_far));
    }

    #[test]
    fn test_box_straddling_plane_is_visible() {
        let frustum = looking_down_negative_z();
        // Center sits outside the left plane but the box reaches into view
        let aabb = Aabb::new(Vec3::new(-60.0, 0.0, -50.0), Vec3::new(40.0, 1.0, 1.0));
        assert!(frustum.intersects_aabb(&aabb));
    }

    #[test]
    fn test_scaled_box() {
        let aabb = Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ONE).scaled(Vec3::new(2.0, 1.0, -1.0));
        assert_eq!(aabb.center, Vec3::new(2.0, 2.0, -3.0));
        assert_eq!(aabb.extent, Vec3::new(2.0, 1.0, 1.0));
    }
}
