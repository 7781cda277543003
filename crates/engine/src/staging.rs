//! Internal staging buffers for `InputMode::Staged`.
//!
//! In staged mode client input buffers are never registered with the device.
//! The component owns one staging buffer per input slot, registered with the
//! device in their place: a client payload is copied into a free staging
//! buffer, the staging buffer is submitted, and the client buffer goes back
//! to its owner right away. A zero-payload end-of-stream buffer is
//! substituted by an empty staging buffer carrying the EOS flag.
//!
//! Client buffers that arrive while every staging buffer is with the device
//! wait in a FIFO backlog.

use std::collections::VecDeque;

use tracing::debug;

use venc_common::{BufferIndex, MemoryAllocator, MemoryError, SharedMemory};

use crate::buffer::BufferDescriptor;
use crate::pool::SlotMask;

#[derive(Default)]
pub struct StagingPool {
    regions: Vec<SharedMemory>,
    busy: SlotMask,
    backlog: VecDeque<BufferDescriptor>,
}

impl StagingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_allocated(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Allocate `count` regions of `size` bytes; nothing is kept on failure.
    pub fn allocate(
        &mut self,
        count: usize,
        size: usize,
        allocator: &dyn MemoryAllocator,
    ) -> Result<(), MemoryError> {
        let mut regions = Vec::with_capacity(count);
        for _ in 0..count {
            match allocator.allocate(size) {
                Ok(region) => regions.push(region),
                Err(e) => {
                    for region in &regions {
                        allocator.release(region);
                    }
                    return Err(e);
                }
            }
        }
        debug!(count, size, "Staging buffers allocated");
        self.busy = SlotMask::new(count);
        self.regions = regions;
        Ok(())
    }

    /// Drop every region. Returns the indices that were allocated.
    pub fn release(&mut self, allocator: &dyn MemoryAllocator) -> Vec<BufferIndex> {
        let indices = (0..self.regions.len()).map(BufferIndex).collect();
        for region in self.regions.drain(..) {
            allocator.release(&region);
        }
        self.busy = SlotMask::new(0);
        indices
    }

    pub fn regions(&self) -> impl Iterator<Item = (BufferIndex, &SharedMemory)> {
        self.regions
            .iter()
            .enumerate()
            .map(|(i, region)| (BufferIndex(i), region))
    }

    pub fn memory(&self, index: BufferIndex) -> Option<&SharedMemory> {
        self.regions.get(index.get())
    }

    /// Claim a free staging buffer.
    pub fn acquire(&mut self) -> Option<BufferIndex> {
        let i = self.busy.first_clear()?;
        self.busy.set(i);
        Some(BufferIndex(i))
    }

    /// Mark a staging buffer free again. `false` if it was not busy.
    pub fn complete(&mut self, index: BufferIndex) -> bool {
        let was_busy = self.busy.is_set(index.get());
        self.busy.clear(index.get());
        was_busy
    }

    pub fn busy_count(&self) -> usize {
        self.busy.count()
    }

    // ── Backlog ──

    pub fn push_backlog(&mut self, buffer: BufferDescriptor) {
        self.backlog.push_back(buffer);
    }

    pub fn pop_backlog(&mut self) -> Option<BufferDescriptor> {
        self.backlog.pop_front()
    }

    pub fn take_backlog(&mut self) -> Vec<BufferDescriptor> {
        self.backlog.drain(..).collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use venc_common::{HeapAllocator, PortIndex};

    #[test]
    fn acquire_and_complete() {
        let alloc = HeapAllocator::new();
        let mut staging = StagingPool::new();
        staging.allocate(2, 8, &alloc).unwrap();

        assert_eq!(staging.acquire(), Some(BufferIndex(0)));
        assert_eq!(staging.acquire(), Some(BufferIndex(1)));
        assert_eq!(staging.acquire(), None);
        assert_eq!(staging.busy_count(), 2);

        assert!(staging.complete(BufferIndex(0)));
        assert!(!staging.complete(BufferIndex(0)));
        assert_eq!(staging.busy_count(), 1);
        assert_eq!(staging.acquire(), Some(BufferIndex(0)));
    }

    #[test]
    fn failed_allocation_keeps_nothing() {
        let alloc = HeapAllocator::with_budget(20);
        let mut staging = StagingPool::new();
        assert!(staging.allocate(3, 8, &alloc).is_err());
        assert!(!staging.is_allocated());
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn release_returns_memory() {
        let alloc = HeapAllocator::new();
        let mut staging = StagingPool::new();
        staging.allocate(3, 8, &alloc).unwrap();
        assert_eq!(alloc.outstanding(), 24);
        let indices = staging.release(&alloc);
        assert_eq!(indices.len(), 3);
        assert_eq!(alloc.outstanding(), 0);
        assert!(staging.is_empty());
    }

    #[test]
    fn backlog_is_fifo() {
        let mut staging = StagingPool::new();
        for i in 0..3 {
            staging.push_backlog(BufferDescriptor::new(
                PortIndex::Input,
                BufferIndex(i),
                SharedMemory::new(4),
                4,
            ));
        }
        assert_eq!(staging.pop_backlog().unwrap().index(), BufferIndex(0));
        let rest: Vec<_> = staging.take_backlog().iter().map(|b| b.index()).collect();
        assert_eq!(rest, vec![BufferIndex(1), BufferIndex(2)]);
        assert_eq!(staging.backlog_len(), 0);
    }
}
