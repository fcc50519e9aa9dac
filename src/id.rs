// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Reusable small-integer ID allocation, backed by a bitset.
//!
//! Coroutine IDs and machine-internal slot indices both come from here: the
//! lowest free slot is always handed out next, so IDs stay dense and are
//! immediately recyclable once a coroutine dies.

use fixedbitset::FixedBitSet;

/// Allocates small nonnegative integer IDs, reusing the lowest free slot.
#[derive(Debug)]
pub struct IdAllocator {
    bits: FixedBitSet,
    next_id: usize,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        IdAllocator {
            bits: FixedBitSet::with_capacity(64),
            next_id: 0,
        }
    }

    /// Returns the lowest clear bit below `next_id`, or grows `next_id` by one
    /// if the bitset has no holes yet.
    pub fn allocate(&mut self) -> usize {
        for id in 0..self.next_id {
            if !self.bits.contains(id) {
                self.bits.insert(id);
                return id;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        if id >= self.bits.len() {
            self.bits.grow(self.next_id);
        }
        self.bits.insert(id);
        id
    }

    /// Releases `id` so it can be handed out again by a later `allocate`.
    pub fn release(&mut self, id: usize) {
        debug_assert!(id < self.bits.len() && self.bits.contains(id));
        self.bits.set(id, false);
    }

    pub fn is_live(&self, id: usize) -> bool {
        id < self.bits.len() && self.bits.contains(id)
    }

    pub fn live_count(&self) -> usize {
        self.bits.count_ones(..)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_slot() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);

        ids.release(1);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 3);
    }

    #[test]
    fn tracks_liveness() {
        let mut ids = IdAllocator::new();
        let a = ids.allocate();
        assert!(ids.is_live(a));
        ids.release(a);
        assert!(!ids.is_live(a));
    }

    #[test]
    fn live_count_reflects_allocations() {
        let mut ids = IdAllocator::new();
        let a = ids.allocate();
        let _b = ids.allocate();
        assert_eq!(ids.live_count(), 2);
        ids.release(a);
        assert_eq!(ids.live_count(), 1);
    }
}
