//! Retrieval table: the arena of pending retrievals and the coalescing index.
//!
//! Each block pointer maps to at most one pending [`Retrieval`]. Requests for
//! a block that already has an entry are appended to it instead of creating
//! a second fetch. Entries leave the table when a worker receives them; a
//! later request for the same block starts a fresh entry.

use std::collections::HashMap;

use crate::block::BlockPointer;
use crate::heap::HeapSlots;
use crate::request::PendingRequest;
use crate::retrieval::Retrieval;

/// Position of a retrieval in the table's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(usize);

impl SlotId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub(crate) const fn get(self) -> usize {
        self.0
    }
}

/// Result of admitting one request into the table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Admission {
    pub slot: SlotId,
    /// A new entry was created for the request.
    pub created: bool,
    /// The request raised an existing entry's priority.
    pub raised: bool,
    /// Entry priority after admission.
    pub priority: i32,
    /// Number of requests now attached to the entry.
    pub requests: usize,
}

#[derive(Debug, Default)]
pub(crate) struct RetrievalTable {
    slots: Vec<Option<Retrieval>>,
    free: Vec<usize>,
    by_block: HashMap<BlockPointer, SlotId>,
}

impl RetrievalTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            by_block: HashMap::with_capacity(capacity),
        }
    }

    /// Number of pending entries.
    pub(crate) fn len(&self) -> usize {
        self.by_block.len()
    }

    pub(crate) fn find(&self, block: &BlockPointer) -> Option<SlotId> {
        self.by_block.get(block).copied()
    }

    pub(crate) fn get(&self, slot: SlotId) -> Option<&Retrieval> {
        self.slots.get(slot.get()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut Retrieval> {
        self.slots.get_mut(slot.get()).and_then(Option::as_mut)
    }

    /// Attach `request` to the pending entry for `block`, creating the entry
    /// if there is none.
    pub(crate) fn find_or_create(&mut self, block: BlockPointer, request: PendingRequest) -> Admission {
        if let Some(slot) = self.find(&block) {
            if let Some(retrieval) = self.get_mut(slot) {
                let raised = retrieval.attach(request);
                return Admission {
                    slot,
                    created: false,
                    raised,
                    priority: retrieval.priority(),
                    requests: retrieval.request_count(),
                };
            }
        }

        let retrieval = Retrieval::new(block, request);
        let priority = retrieval.priority();
        let slot = self.insert(retrieval);
        Admission {
            slot,
            created: true,
            raised: false,
            priority,
            requests: 1,
        }
    }

    /// Remove an entry from the arena and the coalescing index.
    pub(crate) fn take(&mut self, slot: SlotId) -> Option<Retrieval> {
        let retrieval = self.slots.get_mut(slot.get())?.take()?;
        self.by_block.remove(&retrieval.block());
        self.free.push(slot.get());
        Some(retrieval)
    }

    /// Put back an entry that was taken but never received by a worker.
    ///
    /// The entry keeps its priority and insertion order, so its place in the
    /// dispatch order is unchanged once re-pushed.
    pub(crate) fn restore(&mut self, retrieval: Retrieval) -> SlotId {
        self.insert(retrieval)
    }

    /// Take every entry out of the table.
    pub(crate) fn drain(&mut self) -> Vec<Retrieval> {
        self.by_block.clear();
        self.free.clear();
        self.slots.drain(..).flatten().collect()
    }

    fn insert(&mut self, retrieval: Retrieval) -> SlotId {
        let block = retrieval.block();
        let slot = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(retrieval);
                SlotId::new(index)
            }
            None => {
                self.slots.push(Some(retrieval));
                SlotId::new(self.slots.len() - 1)
            }
        };
        self.by_block.insert(block, slot);
        slot
    }
}

impl HeapSlots for RetrievalTable {
    fn precedes(&self, a: SlotId, b: SlotId) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(a), Some(b)) => a.precedes(b),
            _ => false,
        }
    }

    fn set_heap_index(&mut self, slot: SlotId, index: Option<usize>) {
        if let Some(retrieval) = self.get_mut(slot) {
            retrieval.set_heap_index(index);
        }
    }
}
