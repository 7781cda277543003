//! Per-port buffer pool management.
//!
//! Each port owns a fixed-capacity pool whose occupancy is a bitset: bit `i`
//! set means slot `i` has a buffer allocated. The capacity is established by
//! the first allocation on the port (the port's actual buffer count) and
//! dropped again once every slot has been freed.
//!
//! Besides occupancy, every allocated slot records who currently owns the
//! buffer:
//!
//! ```text
//!   Client ──submit──> Component ──queue──> Device
//!     ^                    │                  │
//!     └──── returned ──────┴──── completion ──┘
//! ```
//!
//! While the device holds a buffer its descriptor is parked in the slot, so
//! a completion for a buffer the device does not hold (duplicate, stale)
//! finds nothing to return and is dropped.

use tracing::{debug, warn};

use venc_common::{BufferIndex, PortIndex, SharedMemory};

use crate::buffer::BufferDescriptor;
use crate::error::PoolError;

// ---------------------------------------------------------------------------
// Slot bitset
// ---------------------------------------------------------------------------

/// Fixed-length bitset over slot indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotMask {
    words: Vec<u64>,
    len: usize,
}

impl SlotMask {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_set(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn set(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] |= 1 << (i % 64);
        }
    }

    pub fn clear(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest clear bit.
    pub fn first_clear(&self) -> Option<usize> {
        self.words.iter().enumerate().find_map(|(w, bits)| {
            let i = w * 64 + (!bits).trailing_zeros() as usize;
            (*bits != u64::MAX && i < self.len).then_some(i)
        })
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.is_set(i))
    }
}

// ---------------------------------------------------------------------------
// Buffer pool
// ---------------------------------------------------------------------------

/// Current holder of an allocated buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    Client,
    /// Accepted by the worker but not (yet) handed to the device.
    Component,
    Device,
}

#[derive(Debug)]
struct Slot {
    memory: SharedMemory,
    owner: Owner,
    from_allocator: bool,
    registered: bool,
    parked: Option<BufferDescriptor>,
}

/// What a freed slot was backed by, so the caller can undo registration and
/// return component-allocated memory.
#[derive(Debug)]
pub struct FreedSlot {
    pub index: BufferIndex,
    pub memory: SharedMemory,
    pub from_allocator: bool,
    pub registered: bool,
}

/// Bitset pool of one port.
#[derive(Debug)]
pub struct BufferPool {
    port: PortIndex,
    buffer_size: usize,
    allocated: SlotMask,
    slots: Vec<Option<Slot>>,
}

impl BufferPool {
    pub fn new(port: PortIndex) -> Self {
        Self {
            port,
            buffer_size: 0,
            allocated: SlotMask::new(0),
            slots: Vec::new(),
        }
    }

    pub fn port(&self) -> PortIndex {
        self.port
    }

    pub fn capacity(&self) -> usize {
        self.allocated.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.count()
    }

    /// Establish the pool capacity. Fails while any slot is allocated.
    pub fn allocate_pool(&mut self, count: usize, size: usize) -> Result<(), PoolError> {
        if count == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let allocated = self.allocated.count();
        if allocated > 0 {
            return Err(PoolError::AlreadyEstablished { allocated });
        }
        self.allocated = SlotMask::new(count);
        self.slots = std::iter::repeat_with(|| None).take(count).collect();
        self.buffer_size = size;
        debug!(port = %self.port, count, size, "Buffer pool established");
        Ok(())
    }

    /// Claim the lowest free slot.
    pub fn acquire_slot(&mut self) -> Result<BufferIndex, PoolError> {
        let i = self.allocated.first_clear().ok_or(PoolError::Exhausted {
            capacity: self.capacity(),
        })?;
        self.allocated.set(i);
        Ok(BufferIndex(i))
    }

    /// Give a slot back. The slot must be allocated.
    pub fn release_slot(&mut self, index: BufferIndex) -> Result<(), PoolError> {
        let i = index.get();
        if i >= self.capacity() {
            return Err(PoolError::BadParameter {
                index,
                reason: "index out of range",
            });
        }
        if !self.allocated.is_set(i) {
            return Err(PoolError::BadParameter {
                index,
                reason: "slot is not allocated",
            });
        }
        self.allocated.clear(i);
        self.slots[i] = None;
        Ok(())
    }

    /// Every slot allocated and the capacity matches the requested count.
    pub fn is_populated(&self, requested: usize) -> bool {
        self.capacity() == requested && requested > 0 && self.allocated.is_full()
    }

    /// No slot allocated.
    pub fn is_released(&self) -> bool {
        self.allocated.is_empty()
    }

    /// Drop the established capacity once every slot is free.
    pub fn reset(&mut self) {
        if self.is_released() && self.capacity() > 0 {
            debug!(port = %self.port, "Buffer pool released");
            self.allocated = SlotMask::new(0);
            self.slots.clear();
            self.buffer_size = 0;
        }
    }

    // ── Ownership ──

    /// Attach backing memory to a freshly acquired slot, owned by the client.
    pub fn attach(
        &mut self,
        index: BufferIndex,
        memory: SharedMemory,
        from_allocator: bool,
        registered: bool,
    ) {
        if let Some(slot) = self.slots.get_mut(index.get()) {
            *slot = Some(Slot {
                memory,
                owner: Owner::Client,
                from_allocator,
                registered,
                parked: None,
            });
        }
    }

    pub fn owner(&self, index: BufferIndex) -> Option<Owner> {
        self.slot(index).map(|s| s.owner)
    }

    /// Take a client-owned buffer into the component.
    pub fn accept(&mut self, buffer: &BufferDescriptor) -> Result<(), PoolError> {
        let index = buffer.index();
        let slot = self.matching_slot_mut(buffer)?;
        if slot.owner != Owner::Client {
            return Err(PoolError::BadParameter {
                index,
                reason: "buffer is not owned by the client",
            });
        }
        slot.owner = Owner::Component;
        Ok(())
    }

    /// Park an accepted buffer while the device holds it.
    pub fn park_with_device(&mut self, buffer: BufferDescriptor) -> Result<(), BufferDescriptor> {
        match self.slots.get_mut(buffer.index().get()).and_then(Option::as_mut) {
            Some(slot) if slot.owner == Owner::Component && slot.parked.is_none() => {
                slot.owner = Owner::Device;
                slot.parked = Some(buffer);
                Ok(())
            }
            _ => Err(buffer),
        }
    }

    /// Take back a buffer the device has completed. `None` if the device did
    /// not hold it.
    pub fn take_from_device(&mut self, index: BufferIndex) -> Option<BufferDescriptor> {
        let slot = self.slots.get_mut(index.get()).and_then(Option::as_mut)?;
        if slot.owner != Owner::Device {
            warn!(port = %self.port, %index, owner = ?slot.owner, "Completion for a buffer the device does not hold");
            return None;
        }
        slot.owner = Owner::Client;
        slot.parked.take()
    }

    /// Record that a buffer goes back to the client.
    pub fn hand_back(&mut self, index: BufferIndex) {
        if let Some(slot) = self.slots.get_mut(index.get()).and_then(Option::as_mut) {
            slot.owner = Owner::Client;
        }
    }

    /// Indices currently held by the device.
    pub fn held_by_device(&self) -> Vec<BufferIndex> {
        self.indices_owned_by(Owner::Device)
    }

    pub fn indices_owned_by(&self, owner: Owner) -> Vec<BufferIndex> {
        self.allocated
            .iter_set()
            .filter(|&i| matches!(&self.slots[i], Some(s) if s.owner == owner))
            .map(BufferIndex)
            .collect()
    }

    /// Indices whose memory is registered with the device.
    pub fn registered_indices(&self) -> Vec<BufferIndex> {
        self.allocated
            .iter_set()
            .filter(|&i| matches!(&self.slots[i], Some(s) if s.registered))
            .map(BufferIndex)
            .collect()
    }

    /// Free a client-owned buffer and release its slot.
    pub fn free(&mut self, buffer: &BufferDescriptor) -> Result<FreedSlot, PoolError> {
        let index = buffer.index();
        let slot = self.matching_slot_mut(buffer)?;
        if slot.owner != Owner::Client {
            return Err(PoolError::BadParameter {
                index,
                reason: "buffer is still held by the component",
            });
        }
        let freed = FreedSlot {
            index,
            memory: slot.memory.clone(),
            from_allocator: slot.from_allocator,
            registered: slot.registered,
        };
        self.release_slot(index)?;
        Ok(freed)
    }

    fn slot(&self, index: BufferIndex) -> Option<&Slot> {
        self.slots.get(index.get()).and_then(Option::as_ref)
    }

    fn matching_slot_mut(&mut self, buffer: &BufferDescriptor) -> Result<&mut Slot, PoolError> {
        let index = buffer.index();
        if buffer.port() != self.port {
            return Err(PoolError::BadParameter {
                index,
                reason: "buffer belongs to the other port",
            });
        }
        let slot = self
            .slots
            .get_mut(index.get())
            .and_then(Option::as_mut)
            .ok_or(PoolError::BadParameter {
                index,
                reason: "slot is not allocated",
            })?;
        if slot.memory.id() != buffer.memory().id() {
            return Err(PoolError::BadParameter {
                index,
                reason: "buffer memory does not match the slot",
            });
        }
        Ok(slot)
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let outstanding = self.indices_owned_by(Owner::Device).len()
            + self.indices_owned_by(Owner::Component).len();
        if outstanding > 0 {
            warn!(
                port = %self.port,
                outstanding,
                "Buffer pool dropped while buffers are still held by the component"
            );
        }
    }
}
