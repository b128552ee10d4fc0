//! Ordered list of per-level caches, finest first.
//!
//! Fallback reads walk toward coarser entries through [`ChainRef`], which
//! borrows the remainder of the list. No cache stores a pointer to its parent,
//! and a walk ends after at most `len()` steps because the slice shrinks on
//! every hop.

use std::sync::Arc;

pub struct LevelChain<C> {
    levels: Vec<Arc<C>>,
}

impl<C> LevelChain<C> {
    /// `levels[0]` is the finest level
    pub fn new(levels: Vec<Arc<C>>) -> Self {
        Self { levels }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<C>> {
        self.levels.get(index)
    }

    /// Fallback view starting at `index`
    pub fn level(&self, index: usize) -> Option<ChainRef<'_, C>> {
        let cache = self.levels.get(index)?;
        Some(ChainRef {
            cache,
            coarser: &self.levels[index + 1..],
        })
    }

    /// Levels coarser than `index`
    pub fn coarser_than(&self, index: usize) -> &[Arc<C>] {
        self.levels.get(index + 1..).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<C>> {
        self.levels.iter()
    }

    pub fn to_vec(&self) -> Vec<Arc<C>> {
        self.levels.clone()
    }
}

/// A cache plus the coarser levels it may fall back to
pub struct ChainRef<'a, C> {
    cache: &'a C,
    coarser: &'a [Arc<C>],
}

impl<C> Clone for ChainRef<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for ChainRef<'_, C> {}

impl<'a, C> ChainRef<'a, C> {
    /// View `cache` with `coarser` as its fallback levels, nearest first
    pub fn new(cache: &'a C, coarser: &'a [Arc<C>]) -> Self {
        Self { cache, coarser }
    }

    pub fn cache(&self) -> &'a C {
        self.cache
    }

    /// Next coarser level, if any
    pub fn parent(&self) -> Option<ChainRef<'a, C>> {
        let (first, rest) = self.coarser.split_first()?;
        Some(ChainRef {
            cache: first,
            coarser: rest,
        })
    }

    /// Coarser levels still reachable from here
    pub fn depth(&self) -> usize {
        self.coarser.len()
    }
}

impl<'a, C> std::ops::Deref for ChainRef<'a, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.cache
    }
}
