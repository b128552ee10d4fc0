//! Toroidal addressing shared by tile slots, vertex buffers and texture slices.
//!
//! Every ring buffer in the crate maps an unbounded integer coordinate onto a
//! fixed number of cells with a Euclidean remainder, so negative coordinates
//! wrap the same way positive ones do.

use std::ops::Range;

/// Fixed-size ring over signed integer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingIndex {
    size: i32,
}

impl RingIndex {
    /// Create a ring with `size` cells. Zero is clamped to one cell.
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1) as i32,
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Cell that holds `coord`.
    pub fn wrap(&self, coord: i32) -> usize {
        coord.rem_euclid(self.size) as usize
    }

    /// Row-major cell index of `(x, y)` in a `size * size` grid.
    pub fn linear(&self, x: i32, y: i32) -> usize {
        self.wrap(y) * self.size() + self.wrap(x)
    }

    /// Split `len` consecutive coordinates starting at `start` into at most two
    /// contiguous cell ranges. `len` is clamped to the ring size.
    pub fn split(&self, start: i32, len: usize) -> (Range<usize>, Option<Range<usize>>) {
        let len = len.min(self.size());
        let first = self.wrap(start);
        let end = first + len;
        if end <= self.size() {
            (first..end, None)
        } else {
            (first..self.size(), Some(0..end - self.size()))
        }
    }
}

/// Floor division for tile lookups; `divisor` must be positive.
pub fn floor_div(value: i32, divisor: i32) -> i32 {
    value.div_euclid(divisor)
}
