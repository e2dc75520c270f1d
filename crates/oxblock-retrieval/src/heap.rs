//! Index-tracking binary heap over retrieval slots.
//!
//! The heap stores [`SlotId`]s only. Entries live in an arena owned by the
//! caller (the retrieval table), which also records each entry's current
//! heap position. Every swap writes both positions back so `fix` and
//! `remove` can locate an entry in O(1) and restore order in O(log n).

use crate::table::SlotId;

/// Arena view the heap needs: ordering and position bookkeeping.
pub(crate) trait HeapSlots {
    /// Whether `a` must be dispatched before `b`.
    fn precedes(&self, a: SlotId, b: SlotId) -> bool;

    /// Record the slot's heap position, `None` once it leaves the heap.
    fn set_heap_index(&mut self, slot: SlotId, index: Option<usize>);
}

/// Max-heap of pending retrievals.
#[derive(Debug, Default)]
pub(crate) struct RetrievalHeap {
    order: Vec<SlotId>,
}

impl RetrievalHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn push<S: HeapSlots>(&mut self, slots: &mut S, slot: SlotId) {
        let index = self.order.len();
        self.order.push(slot);
        slots.set_heap_index(slot, Some(index));
        self.sift_up(slots, index);
    }

    /// Remove and return the highest-priority slot.
    pub(crate) fn pop<S: HeapSlots>(&mut self, slots: &mut S) -> Option<SlotId> {
        self.remove(slots, 0)
    }

    /// Restore heap order after the entry at `index` changed priority.
    pub(crate) fn fix<S: HeapSlots>(&mut self, slots: &mut S, index: usize) {
        if index >= self.order.len() {
            return;
        }
        if !self.sift_down(slots, index) {
            self.sift_up(slots, index);
        }
    }

    /// Remove the entry at `index`.
    pub(crate) fn remove<S: HeapSlots>(&mut self, slots: &mut S, index: usize) -> Option<SlotId> {
        let last = self.order.len().checked_sub(1)?;
        if index > last {
            return None;
        }
        if index != last {
            self.swap(slots, index, last);
        }
        let removed = self.order.pop()?;
        slots.set_heap_index(removed, None);
        if index < self.order.len() {
            self.fix(slots, index);
        }
        Some(removed)
    }

    /// Drop every slot, clearing their recorded positions.
    pub(crate) fn clear<S: HeapSlots>(&mut self, slots: &mut S) {
        for slot in self.order.drain(..) {
            slots.set_heap_index(slot, None);
        }
    }

    fn swap<S: HeapSlots>(&mut self, slots: &mut S, i: usize, j: usize) {
        self.order.swap(i, j);
        slots.set_heap_index(self.order[i], Some(i));
        slots.set_heap_index(self.order[j], Some(j));
    }

    fn sift_up<S: HeapSlots>(&mut self, slots: &mut S, mut index: usize) -> bool {
        let start = index;
        while index > 0 {
            let parent = (index - 1) / 2;
            if !slots.precedes(self.order[index], self.order[parent]) {
                break;
            }
            self.swap(slots, index, parent);
            index = parent;
        }
        index != start
    }

    fn sift_down<S: HeapSlots>(&mut self, slots: &mut S, mut index: usize) -> bool {
        let start = index;
        let len = self.order.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && slots.precedes(self.order[right], self.order[left]) {
                best = right;
            }
            if !slots.precedes(self.order[best], self.order[index]) {
                break;
            }
            self.swap(slots, index, best);
            index = best;
        }
        index != start
    }
}
