//! Ray picking against a height field sampled on a regular XZ grid.
//!
//! The ray is walked cell by cell over the XZ plane. Each cell is split into
//! two triangles built from the heights at its corners and tested in walk
//! order, so the first hit is the nearest one. The cell size may change along
//! the ray, which lets the walk use coarse cells where only coarse data is
//! shown.

use glam::{IVec2, Vec2, Vec3};

/// Cells visited before a pick gives up
pub const DEFAULT_MAX_CHECKS: usize = 1 << 14;

const PARALLEL_EPSILON: f32 = 1e-6;

/// Traversal of the grid cells a ray crosses, in order
#[derive(Debug, Clone)]
pub struct GridWalk {
    spacing: Vec2,
    cell: IVec2,
    step: IVec2,
    next_crossing: Vec2,
    crossing_delta: Vec2,
    traveled: f32,
}

impl GridWalk {
    /// `direction` must be normalized. `traveled` starts at `start`.
    pub fn new(origin: Vec3, direction: Vec3, spacing: Vec2, start: f32) -> Self {
        let flat = Vec2::new(origin.x, origin.z) / spacing;
        let cell = flat.floor().as_ivec2();
        let dir = Vec2::new(direction.x, direction.z);

        let axis = |d: f32, position: f32, cell: i32, size: f32| -> (i32, f32, f32) {
            if d > PARALLEL_EPSILON {
                (1, start + ((cell + 1) as f32 - position) * size / d, size / d)
            } else if d < -PARALLEL_EPSILON {
                (-1, start + (position - cell as f32) * size / -d, size / -d)
            } else {
                (0, f32::INFINITY, f32::INFINITY)
            }
        };
        let (sx, tx, dx) = axis(dir.x, flat.x, cell.x, spacing.x);
        let (sz, tz, dz) = axis(dir.y, flat.y, cell.y, spacing.y);

        Self {
            spacing,
            cell,
            step: IVec2::new(sx, sz),
            next_crossing: Vec2::new(tx, tz),
            crossing_delta: Vec2::new(dx, dz),
            traveled: start,
        }
    }

    pub fn cell(&self) -> IVec2 {
        self.cell
    }

    pub fn spacing(&self) -> Vec2 {
        self.spacing
    }

    /// Ray distance at which the current cell was entered
    pub fn traveled(&self) -> f32 {
        self.traveled
    }

    /// False for a ray with no XZ motion, which never leaves its cell
    pub fn moves(&self) -> bool {
        self.step != IVec2::ZERO
    }

    pub fn next(&mut self) {
        if self.next_crossing.x < self.next_crossing.y {
            self.cell.x += self.step.x;
            self.traveled = self.next_crossing.x;
            self.next_crossing.x += self.crossing_delta.x;
        } else {
            self.cell.y += self.step.y;
            self.traveled = self.next_crossing.y;
            self.next_crossing.y += self.crossing_delta.y;
        }
    }
}

/// Distance along the ray to triangle `(a, b, c)`, either face
pub fn ray_triangle(origin: Vec3, direction: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let edge1 = b - a;
    let edge2 = c - a;
    let p = direction.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < PARALLEL_EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    let s = origin - a;
    let u = s.dot(p) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = direction.dot(q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(q) * inv;
    (t >= 0.0).then_some(t)
}

/// Nearest hit of the ray with the two triangles of one cell
fn hit_cell<H>(origin: Vec3, direction: Vec3, cell: IVec2, spacing: Vec2, height: &H) -> Option<f32>
where
    H: Fn(f32, f32) -> f32,
{
    let x0 = cell.x as f32 * spacing.x;
    let z0 = cell.y as f32 * spacing.y;
    let (x1, z1) = (x0 + spacing.x, z0 + spacing.y);
    let corner = |x: f32, z: f32| Vec3::new(x, height(x, z), z);
    let p00 = corner(x0, z0);
    let p10 = corner(x1, z0);
    let p01 = corner(x0, z1);
    let p11 = corner(x1, z1);

    let first = ray_triangle(origin, direction, p00, p01, p10);
    let second = ray_triangle(origin, direction, p10, p01, p11);
    match (first, second) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// First point where the ray meets the height field within `max_distance`.
///
/// `spacing_at` gives the cell size to walk at a world point, `height` the
/// world height at `(x, z)`.
pub fn trace<S, H>(
    origin: Vec3,
    direction: Vec3,
    max_distance: f32,
    max_checks: usize,
    spacing_at: S,
    height: H,
) -> Option<Vec3>
where
    S: Fn(Vec3) -> Vec2,
    H: Fn(f32, f32) -> f32,
{
    let direction = direction.normalize_or_zero();
    if direction == Vec3::ZERO || max_distance <= 0.0 {
        return None;
    }

    let mut walk = GridWalk::new(origin, direction, spacing_at(origin), 0.0);
    if !walk.moves() {
        // Straight up or down: one height lookup settles it
        let ground = height(origin.x, origin.z);
        let t = (ground - origin.y) / direction.y;
        return (0.0..=max_distance).contains(&t).then(|| Vec3::new(origin.x, ground, origin.z));
    }

    for _ in 0..max_checks {
        if walk.traveled() > max_distance {
            return None;
        }
        if let Some(t) = hit_cell(origin, direction, walk.cell(), walk.spacing(), &height) {
            return (t <= max_distance).then(|| origin + direction * t);
        }

        walk.next();
        let entry = walk.traveled();
        let spacing = spacing_at(origin + direction * entry);
        if spacing != walk.spacing() {
            walk = GridWalk::new(origin + direction * entry, direction, spacing, entry);
        }
    }
    log::trace!("pick gave up after {} cells", max_checks);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(_: Vec3) -> Vec2 {
        Vec2::ONE
    }

    fn assert_close(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-3, "{} != {}", a, b);
    }

    #[test]
    fn test_grid_walk_visits_cells_in_order() {
        let mut walk = GridWalk::new(Vec3::new(0.5, 0.0, 0.5), Vec3::new(1.0, 0.0, 0.5).normalize(), Vec2::ONE, 0.0);
        let mut cells = vec![walk.cell()];
        for _ in 0..3 {
            walk.next();
            cells.push(walk.cell());
        }
        assert_eq!(
            cells,
            vec![IVec2::new(0, 0), IVec2::new(1, 0), IVec2::new(1, 1), IVec2::new(2, 1)]
        );
    }

    #[test]
    fn test_ray_triangle() {
        let (a, b, c) = (Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.0, 0.0));
        let t = ray_triangle(Vec3::new(0.25, 3.0, 0.25), Vec3::NEG_Y, a, b, c);
        assert_eq!(t, Some(3.0));
        assert_eq!(ray_triangle(Vec3::new(0.9, 3.0, 0.9), Vec3::NEG_Y, a, b, c), None);
        assert_eq!(ray_triangle(Vec3::new(0.25, 3.0, 0.25), Vec3::Y, a, b, c), None);
    }

    #[test]
    fn test_trace_flat_ground() {
        let hit = trace(Vec3::new(0.3, 20.0, 0.7), Vec3::new(1.0, -1.0, 0.5), 100.0, DEFAULT_MAX_CHECKS, unit, |_, _| 5.0);
        // 15 units down: x and z advance 15 and 7.5
        assert_close(hit.unwrap(), Vec3::new(15.3, 5.0, 8.2));
    }

    #[test]
    fn test_trace_slope_and_limits() {
        let slope = |x: f32, _: f32| x;
        let origin = Vec3::new(-5.0, 2.5, 0.25);
        let hit = trace(origin, Vec3::X, 100.0, DEFAULT_MAX_CHECKS, unit, slope);
        assert_close(hit.unwrap(), Vec3::new(2.5, 2.5, 0.25));
        // Too short to get there
        assert_eq!(trace(origin, Vec3::X, 6.0, DEFAULT_MAX_CHECKS, unit, slope), None);
        // Away from the ground
        assert_eq!(trace(origin, Vec3::NEG_X, 100.0, DEFAULT_MAX_CHECKS, unit, slope), None);
    }

    #[test]
    fn test_trace_vertical_ray() {
        let ground = |x: f32, z: f32| x + z;
        let down = trace(Vec3::new(1.5, 10.0, 2.0), Vec3::NEG_Y, 50.0, DEFAULT_MAX_CHECKS, unit, ground);
        assert_eq!(down, Some(Vec3::new(1.5, 3.5, 2.0)));
        assert_eq!(trace(Vec3::new(1.5, 10.0, 2.0), Vec3::Y, 50.0, DEFAULT_MAX_CHECKS, unit, ground), None);
    }

    #[test]
    fn test_trace_switches_cell_size() {
        let coarse_far = |p: Vec3| if p.x < 10.0 { Vec2::ONE } else { Vec2::splat(4.0) };
        let origin = Vec3::new(0.0, 9.0, 0.3);
        let hit = trace(origin, Vec3::new(2.0, -1.0, 0.0), 100.0, DEFAULT_MAX_CHECKS, coarse_far, |_, _| 0.0);
        assert_close(hit.unwrap(), Vec3::new(18.0, 0.0, 0.3));
    }
}
