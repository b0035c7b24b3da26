// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Comparator-driven binary min-heap with identity-based removal.
//!
//! Both dispatch heaps in the [`crate::queue`] module are instances of this
//! container with different comparators over the same item type. Unlike
//! `std::collections::BinaryHeap` it supports removing an arbitrary element
//! by *identity* (pointer equality for `Arc` items), which the dispatch
//! queue needs when a priority-slot holder is superseded.
//!
//! # Example
//!
//! ```
//! use shadow_gateway::heap::BinHeap;
//!
//! let mut heap: BinHeap<i32> = BinHeap::new(|a: &i32, b: &i32| a.cmp(b));
//! heap.insert(3);
//! heap.insert(1);
//! heap.insert(2);
//!
//! assert_eq!(heap.pop().unwrap(), 1);
//! assert_eq!(heap.pop().unwrap(), 2);
//! assert_eq!(heap.pop().unwrap(), 3);
//! assert!(heap.pop().is_err());
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;

/// Error returned by [`BinHeap::pop`] on an empty heap.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("empty binheap")]
pub struct EmptyHeapError;

/// Identity comparison, distinct from value equality.
///
/// [`BinHeap::remove_by_identity`] extracts the element that *is* the given
/// one, not one that merely compares equal. For `Arc` items this is pointer
/// equality, so two separately-allocated items with identical fields are
/// still distinct.
pub trait Identity {
    fn same_identity(&self, other: &Self) -> bool;
}

impl<T> Identity for Arc<T> {
    fn same_identity(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send>;

/// Binary min-heap ordered by an injected three-way comparator.
///
/// The comparator defines the pop order: `pop()` always returns an element
/// that orders `Less` than (or equal to) everything remaining.
pub struct BinHeap<T> {
    slots: Vec<T>,
    cmp: Comparator<T>,
}

impl<T> BinHeap<T> {
    pub fn new(cmp: impl Fn(&T, &T) -> Ordering + Send + 'static) -> Self {
        Self {
            slots: Vec::new(),
            cmp: Box::new(cmp),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert an element. O(log n).
    pub fn insert(&mut self, e: T) {
        self.slots.push(e);
        self.sift_up(self.slots.len() - 1);
    }

    /// Remove and return the minimal element per the comparator.
    pub fn pop(&mut self) -> Result<T, EmptyHeapError> {
        if self.slots.is_empty() {
            return Err(EmptyHeapError);
        }
        Ok(self.extract(0))
    }

    /// Remove the element that *is* `e` (identity, not value equality).
    ///
    /// Returns the extracted element, or `None` if `e` is not resident.
    /// O(n) scan plus O(log n) extraction.
    pub fn remove_by_identity(&mut self, e: &T) -> Option<T>
    where
        T: Identity,
    {
        let idx = self.slots.iter().position(|x| x.same_identity(e))?;
        Some(self.extract(idx))
    }

    /// Extract the element at `idx`, swapping the last element into its slot
    /// and sifting both up and down. One of the two sifts is a no-op, but
    /// which one depends on where the removal happened.
    fn extract(&mut self, idx: usize) -> T {
        let last = self.slots.len() - 1;
        self.slots.swap(idx, last);
        let e = self.slots.pop().unwrap_or_else(|| unreachable!());
        if idx < self.slots.len() {
            self.sift_up(idx);
            self.sift_down(idx);
        }
        e
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if (self.cmp)(&self.slots[idx], &self.slots[parent]) == Ordering::Less {
                self.slots.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = idx * 2 + 1;
            let right = idx * 2 + 2;
            if left >= self.slots.len() {
                break;
            }
            let smaller = if right < self.slots.len()
                && (self.cmp)(&self.slots[right], &self.slots[left]) == Ordering::Less
            {
                right
            } else {
                left
            };
            if (self.cmp)(&self.slots[idx], &self.slots[smaller]) == Ordering::Greater {
                self.slots.swap(idx, smaller);
                idx = smaller;
            } else {
                break;
            }
        }
    }
}

impl<T> std::fmt::Debug for BinHeap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinHeap").field("size", &self.size()).finish()
    }
}
