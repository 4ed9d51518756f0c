//! Bounded pool of scratch slots for partially decoded or encoded bytes.

use bytes::BytesMut;
use tracing::warn;

pub type SlotId = usize;

#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Option<BytesMut>>,
    owners: Vec<Option<u64>>,
    free: Vec<SlotId>,
    capacity: usize,
}

impl SlotPool {
    pub fn new(slot_count: usize, slot_capacity: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| None).collect(),
            owners: vec![None; slot_count],
            free: (0..slot_count).rev().collect(),
            capacity: slot_capacity,
        }
    }

    pub fn slot_capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Takes a free slot for `stream_id`, `None` when the pool is exhausted.
    pub fn acquire(&mut self, stream_id: u64) -> Option<SlotId> {
        let Some(slot) = self.free.pop() else {
            warn!("slot pool exhausted, stream {} refused", stream_id);
            return None;
        };
        let buffer = self.slots[slot].get_or_insert_with(|| BytesMut::with_capacity(self.capacity));
        buffer.clear();
        self.owners[slot] = Some(stream_id);
        Some(slot)
    }

    pub fn buffer(&self, slot: SlotId) -> &[u8] {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map_or(&[], |buffer| &buffer[..])
    }

    pub fn buffer_mut(&mut self, slot: SlotId) -> Option<&mut BytesMut> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Appends to a slot, failing when it would exceed the slot capacity.
    pub fn append(&mut self, slot: SlotId, bytes: &[u8]) -> bool {
        let capacity = self.capacity;
        match self.buffer_mut(slot) {
            Some(buffer) if buffer.len() + bytes.len() <= capacity => {
                buffer.extend_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, slot: SlotId) {
        if let Some(owner) = self.owners.get_mut(slot) {
            if owner.take().is_some() {
                if let Some(Some(buffer)) = self.slots.get_mut(slot) {
                    buffer.clear();
                }
                self.free.push(slot);
            }
        }
    }
}
