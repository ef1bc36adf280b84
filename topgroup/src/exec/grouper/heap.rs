//! Bounded min-max heap of bucket offsets
//!
//! The heap stores the offsets of the buckets as 4-byte integers in a byte region
//! borrowed from the grouper's buffer. It never owns the buckets: ordering is provided
//! by an [`OffsetComparator`] that reads the bucket bytes, and every move of an offset
//! is reported to a [`HeapIndexUpdater`] so that the bucket always knows where it
//! lives in the heap.
//!
//! Capacity is `limit + 1`: an insertion into a full heap evicts the worst element,
//! which may be the one just inserted. Even levels are min levels, odd levels are max
//! levels. The minimum is the root and the maximum is one of its children.

use std::cmp::Ordering;

use crate::common::utils::bytes::{read_i32, write_i32};

/// Number of bytes used to store an offset in the heap
pub const OFFSET_SIZE: usize = 4;

/// Compare two buckets by their offsets
pub trait OffsetComparator {
    /// Compare the bucket at `lhs` with the bucket at `rhs`
    fn compare_offsets(&self, lhs: usize, rhs: usize) -> Ordering;
}

/// Keep the heap index stored in the bucket in sync with the heap
pub trait HeapIndexUpdater {
    /// Heap index of the bucket at `offset`, `None` if it is not in the heap
    fn heap_index(&self, offset: usize) -> Option<usize>;

    /// Record the heap index of the bucket at `offset`
    fn set_heap_index(&mut self, offset: usize, index: Option<usize>);
}

/// Number of bytes needed by a heap that keeps `limit` elements
#[inline]
pub fn heap_bytes(limit: usize) -> usize {
    (limit + 1) * OFFSET_SIZE
}

#[inline]
fn is_min_level(index: usize) -> bool {
    (index + 1).ilog2() % 2 == 0
}

#[inline]
fn parent(index: usize) -> usize {
    (index - 1) / 2
}

/// Min-max heap of offsets with capacity `limit + 1`
#[derive(Debug)]
pub struct BoundedOffsetHeap<'a> {
    buffer: &'a mut [u8],
    limit: usize,
    heap_size: usize,
}

impl<'a> BoundedOffsetHeap<'a> {
    /// Create an empty heap on top of `buffer`
    ///
    /// # Panics
    ///
    /// Panics if the `buffer` can not hold `limit + 1` offsets
    pub fn new(buffer: &'a mut [u8], limit: usize) -> Self {
        assert!(
            buffer.len() >= heap_bytes(limit),
            "Heap with limit `{}` needs `{}` bytes, found `{}`",
            limit,
            heap_bytes(limit),
            buffer.len()
        );
        Self {
            buffer,
            limit,
            heap_size: 0,
        }
    }

    /// Number of offsets in the heap
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Max number of offsets kept between two operations
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Remove all of the offsets. Heap indices stored in the buckets are not touched,
    /// caller should clear the buckets as well
    #[inline]
    pub fn reset(&mut self) {
        self.heap_size = 0;
    }

    /// Offset stored at `index`
    #[inline]
    pub fn offset_at(&self, index: usize) -> usize {
        debug_assert!(index < self.heap_size);
        read_i32(self.buffer, index * OFFSET_SIZE) as usize
    }

    /// Overwrite the offset stored at `index`. Used when the buckets are moved to
    /// another place without changing their relative order
    #[inline]
    pub fn set_offset_at(&mut self, index: usize, offset: usize) {
        debug_assert!(index < self.heap_size);
        write_i32(self.buffer, index * OFFSET_SIZE, offset as i32);
    }

    #[inline]
    fn place<C: HeapIndexUpdater>(&mut self, index: usize, offset: usize, ctx: &mut C) {
        write_i32(self.buffer, index * OFFSET_SIZE, offset as i32);
        ctx.set_heap_index(offset, Some(index));
    }

    #[inline]
    fn swap<C: HeapIndexUpdater>(&mut self, lhs: usize, rhs: usize, ctx: &mut C) {
        let lhs_offset = self.offset_at(lhs);
        let rhs_offset = self.offset_at(rhs);
        self.place(lhs, rhs_offset, ctx);
        self.place(rhs, lhs_offset, ctx);
    }

    #[inline]
    fn compare<C: OffsetComparator>(&self, lhs: usize, rhs: usize, ctx: &C) -> Ordering {
        ctx.compare_offsets(self.offset_at(lhs), self.offset_at(rhs))
    }

    /// Insert the `offset`. If the heap exceeds the limit after insertion, the max
    /// element is evicted and returned
    pub fn add_offset<C>(&mut self, offset: usize, ctx: &mut C) -> Option<usize>
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        let index = self.heap_size;
        self.heap_size += 1;
        self.place(index, offset, ctx);
        self.bubble_up(index, ctx);

        if self.heap_size > self.limit {
            self.remove_max(ctx)
        } else {
            None
        }
    }

    /// Remove the element at `index` and return its offset
    pub fn delete_at<C>(&mut self, index: usize, ctx: &mut C) -> usize
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        debug_assert!(index < self.heap_size);
        let removed = self.offset_at(index);
        self.heap_size -= 1;
        let last = self.heap_size;
        if index != last {
            let moved = read_i32(self.buffer, last * OFFSET_SIZE) as usize;
            self.place(index, moved, ctx);
            let position = self.trickle_down(index, ctx);
            self.bubble_up(position, ctx);
        }
        ctx.set_heap_index(removed, None);
        removed
    }

    /// Remove the min element
    pub fn remove_min<C>(&mut self, ctx: &mut C) -> Option<usize>
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        (self.heap_size > 0).then(|| self.delete_at(0, ctx))
    }

    /// Remove the max element
    pub fn remove_max<C>(&mut self, ctx: &mut C) -> Option<usize>
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        let index = match self.heap_size {
            0 => return None,
            1 => 0,
            2 => 1,
            _ => {
                if self.compare(1, 2, ctx) == Ordering::Less {
                    2
                } else {
                    1
                }
            }
        };
        Some(self.delete_at(index, ctx))
    }

    /// Sort the offsets in place. The heap is no longer a valid heap after sorting, it
    /// should only be read with [`Self::offset_at`] until [`Self::reset`]
    pub fn sort_by<F>(&mut self, mut cmp: F)
    where
        F: FnMut(usize, usize) -> Ordering,
    {
        let mut offsets = (0..self.heap_size)
            .map(|index| self.offset_at(index))
            .collect::<Vec<_>>();
        offsets.sort_by(|&lhs, &rhs| cmp(lhs, rhs));
        offsets
            .into_iter()
            .enumerate()
            .for_each(|(index, offset)| self.set_offset_at(index, offset));
    }

    /// Move the element at `index` up, returns its final position
    fn bubble_up<C>(&mut self, index: usize, ctx: &mut C) -> usize
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        if index == 0 {
            return 0;
        }

        let parent_index = parent(index);
        let ordering = self.compare(index, parent_index, ctx);
        if is_min_level(index) {
            if ordering == Ordering::Greater {
                self.swap(index, parent_index, ctx);
                self.bubble_up_grandparents(parent_index, Ordering::Greater, ctx)
            } else {
                self.bubble_up_grandparents(index, Ordering::Less, ctx)
            }
        } else if ordering == Ordering::Less {
            self.swap(index, parent_index, ctx);
            self.bubble_up_grandparents(parent_index, Ordering::Less, ctx)
        } else {
            self.bubble_up_grandparents(index, Ordering::Greater, ctx)
        }
    }

    fn bubble_up_grandparents<C>(&mut self, mut index: usize, want: Ordering, ctx: &mut C) -> usize
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        while index > 2 {
            let grandparent = parent(parent(index));
            if self.compare(index, grandparent, ctx) != want {
                break;
            }
            self.swap(index, grandparent, ctx);
            index = grandparent;
        }
        index
    }

    /// Move the element at `index` down, returns the final position of that element
    fn trickle_down<C>(&mut self, mut index: usize, ctx: &mut C) -> usize
    where
        C: OffsetComparator + HeapIndexUpdater,
    {
        let want = if is_min_level(index) {
            Ordering::Less
        } else {
            Ordering::Greater
        };
        // Once the element is swapped into a parent slot it stays there, the loop
        // keeps trickling the element it displaced
        let mut settled = None;

        loop {
            let first_child = 2 * index + 1;
            if first_child >= self.heap_size {
                return settled.unwrap_or(index);
            }

            let first_grandchild = 4 * index + 3;
            let mut best = first_child;
            for candidate in [
                first_child + 1,
                first_grandchild,
                first_grandchild + 1,
                first_grandchild + 2,
                first_grandchild + 3,
            ] {
                if candidate < self.heap_size && self.compare(candidate, best, ctx) == want {
                    best = candidate;
                }
            }

            if self.compare(best, index, ctx) != want {
                return settled.unwrap_or(index);
            }
            self.swap(best, index, ctx);

            if best <= first_child + 1 {
                return settled.unwrap_or(best);
            }

            let parent_index = parent(best);
            if self.compare(best, parent_index, ctx) == want.reverse() {
                self.swap(best, parent_index, ctx);
                settled.get_or_insert(parent_index);
            }
            index = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Offsets index into `values`
    #[derive(Debug)]
    struct VecContext {
        values: Vec<i64>,
        heap_indices: Vec<Option<usize>>,
    }

    impl VecContext {
        fn new(values: Vec<i64>) -> Self {
            let len = values.len();
            Self {
                values,
                heap_indices: vec![None; len],
            }
        }
    }

    impl OffsetComparator for VecContext {
        fn compare_offsets(&self, lhs: usize, rhs: usize) -> Ordering {
            self.values[lhs].cmp(&self.values[rhs])
        }
    }

    impl HeapIndexUpdater for VecContext {
        fn heap_index(&self, offset: usize) -> Option<usize> {
            self.heap_indices[offset]
        }

        fn set_heap_index(&mut self, offset: usize, index: Option<usize>) {
            self.heap_indices[offset] = index;
        }
    }

    fn assert_valid(heap: &BoundedOffsetHeap<'_>, ctx: &VecContext) {
        for index in 0..heap.heap_size() {
            let offset = heap.offset_at(index);
            assert_eq!(ctx.heap_index(offset), Some(index));
            let mut descendant = 2 * index + 1;
            let mut width = 2;
            while descendant < heap.heap_size() {
                for d in descendant..(descendant + width).min(heap.heap_size()) {
                    let ordering = ctx.compare_offsets(offset, heap.offset_at(d));
                    if is_min_level(index) {
                        assert_ne!(ordering, Ordering::Greater);
                    } else {
                        assert_ne!(ordering, Ordering::Less);
                    }
                }
                descendant = 2 * descendant + 1;
                width *= 2;
            }
        }
    }

    #[test]
    fn test_levels() {
        let levels = (0..8).map(is_min_level).collect::<Vec<_>>();
        assert_eq!(
            levels,
            [true, false, false, true, true, true, true, false]
        );
    }

    #[test]
    fn test_keeps_smallest_limit_elements() {
        let values = vec![50, 10, 40, 20, 30, 60, 0];
        let mut ctx = VecContext::new(values);
        let mut buffer = vec![0; heap_bytes(3)];
        let mut heap = BoundedOffsetHeap::new(&mut buffer, 3);

        let evicted = (0..7)
            .filter_map(|offset| heap.add_offset(offset, &mut ctx))
            .collect::<Vec<_>>();
        assert_eq!(evicted, [0, 2, 5, 4]);
        assert_valid(&heap, &ctx);
        assert!(ctx.heap_index(0).is_none());

        let mut drained = Vec::new();
        while let Some(offset) = heap.remove_min(&mut ctx) {
            drained.push(ctx.values[offset]);
        }
        assert_eq!(drained, [0, 10, 20]);
        assert!(ctx.heap_indices.iter().all(Option::is_none));
    }

    #[test]
    fn test_remove_max_and_delete_at() {
        let mut ctx = VecContext::new(vec![5, 3, 9, 1, 7]);
        let mut buffer = vec![0; heap_bytes(5)];
        let mut heap = BoundedOffsetHeap::new(&mut buffer, 5);
        (0..5).for_each(|offset| assert!(heap.add_offset(offset, &mut ctx).is_none()));

        assert_eq!(heap.remove_max(&mut ctx), Some(2));
        let index = ctx.heap_index(0).unwrap();
        assert_eq!(heap.delete_at(index, &mut ctx), 0);
        assert_valid(&heap, &ctx);
        assert_eq!(heap.remove_min(&mut ctx), Some(3));
        assert_eq!(heap.remove_max(&mut ctx), Some(4));
        assert_eq!(heap.remove_max(&mut ctx), Some(1));
        assert_eq!(heap.remove_max(&mut ctx), None);
    }

    #[test]
    fn test_random_operations_against_sorted_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        let num_offsets = 256;
        let limit = 17;
        let mut ctx = VecContext::new((0..num_offsets).map(|_| rng.gen_range(0..64)).collect());
        let mut buffer = vec![0; heap_bytes(limit)];
        let mut heap = BoundedOffsetHeap::new(&mut buffer, limit);
        let mut reference: Vec<usize> = Vec::new();

        for _ in 0..5000 {
            let offset = rng.gen_range(0..num_offsets);
            match ctx.heap_index(offset) {
                Some(index) => {
                    // Reinsert with a new value, like the aggregator sort does
                    assert_eq!(heap.delete_at(index, &mut ctx), offset);
                    reference.retain(|&o| o != offset);
                    ctx.values[offset] = rng.gen_range(0..64);
                }
                None => {
                    if rng.gen_bool(0.1) {
                        if let Some(removed) = heap.remove_min(&mut ctx) {
                            let min = reference
                                .iter()
                                .map(|&o| ctx.values[o])
                                .min()
                                .unwrap();
                            assert_eq!(ctx.values[removed], min);
                            reference.retain(|&o| o != removed);
                        }
                        continue;
                    }
                }
            }

            reference.push(offset);
            if let Some(evicted) = heap.add_offset(offset, &mut ctx) {
                let max = reference.iter().map(|&o| ctx.values[o]).max().unwrap();
                assert_eq!(ctx.values[evicted], max);
                reference.retain(|&o| o != evicted);
            }
            assert!(heap.heap_size() <= limit);
            assert_eq!(heap.heap_size(), reference.len());
            assert_valid(&heap, &ctx);
        }
    }

    #[test]
    fn test_sort_by() {
        let mut ctx = VecContext::new(vec![4, 2, 8, 6]);
        let mut buffer = vec![0; heap_bytes(4)];
        let mut heap = BoundedOffsetHeap::new(&mut buffer, 4);
        (0..4).for_each(|offset| {
            heap.add_offset(offset, &mut ctx);
        });
        heap.sort_by(|lhs, rhs| ctx.values[rhs].cmp(&ctx.values[lhs]));
        let sorted = (0..4).map(|i| heap.offset_at(i)).collect::<Vec<_>>();
        assert_eq!(sorted, [2, 3, 0, 1]);
    }
}
