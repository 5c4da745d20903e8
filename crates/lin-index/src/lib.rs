//! # Dense Indices
//!
//! Identifiers in the lin IR are `u32` newtypes that index directly into
//! arena-like vectors (nodes of a graph, operands of a kernel). The [`Idx`]
//! trait is the conversion contract between such a newtype and `usize`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::fmt::Debug;
use std::hash::Hash;

/// A newtype usable as a dense index.
pub trait Idx: Copy + Eq + Hash + Debug + 'static {
    /// Creates an index from a `usize` position.
    fn new(idx: usize) -> Self;

    /// Returns the `usize` position of this index.
    fn index(self) -> usize;

    /// Returns the index following this one.
    #[must_use]
    fn next(self) -> Self {
        Self::new(self.index() + 1)
    }
}

impl Idx for usize {
    fn new(idx: usize) -> Self {
        idx
    }

    fn index(self) -> usize {
        self
    }
}

impl Idx for u32 {
    #[allow(clippy::cast_possible_truncation)]
    fn new(idx: usize) -> Self {
        debug_assert!(u32::try_from(idx).is_ok(), "index overflow");
        idx as u32
    }

    fn index(self) -> usize {
        self as usize
    }
}
