//! Shared memory regions backing buffer descriptors.
//!
//! A `SharedMemory` is the host-side view of a buffer's backing storage. The
//! component, the client and the device adapter all hold handles to the same
//! region (the way an mmap'd ION/DMA buffer is visible to every party), while
//! *ownership* of the buffer itself is tracked separately by the descriptor.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::MemoryError;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Cloneable handle to a fixed-size byte region.
#[derive(Clone)]
pub struct SharedMemory {
    id: u64,
    bytes: Arc<Mutex<Box<[u8]>>>,
}

impl SharedMemory {
    /// Zero-filled region of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            bytes: Arc::new(Mutex::new(data.into_boxed_slice())),
        }
    }

    /// Process-unique identity of the region (stable across clones).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let mut bytes = self.bytes.lock();
        let range = checked_range(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the region starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let bytes = self.bytes.lock();
        let range = checked_range(offset, len, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    /// Copy up to `len` bytes from this region into `dst`, truncating to
    /// whatever fits in `dst` after `dst_offset`. Returns the bytes copied.
    pub fn copy_into(
        &self,
        src_offset: usize,
        len: usize,
        dst: &SharedMemory,
        dst_offset: usize,
    ) -> Result<usize, MemoryError> {
        if self.id == dst.id {
            let mut bytes = self.bytes.lock();
            let size = bytes.len();
            checked_range(src_offset, len, size)?;
            let n = len.min(size.saturating_sub(dst_offset));
            bytes.copy_within(src_offset..src_offset + n, dst_offset);
            return Ok(n);
        }

        let src = self.bytes.lock();
        let range = checked_range(src_offset, len, src.len())?;
        let mut dst_bytes = dst.bytes.lock();
        let room = dst_bytes.len().saturating_sub(dst_offset);
        let n = len.min(room);
        dst_bytes[dst_offset..dst_offset + n].copy_from_slice(&src[range][..n]);
        Ok(n)
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

fn checked_range(
    offset: usize,
    len: usize,
    size: usize,
) -> Result<std::ops::Range<usize>, MemoryError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(MemoryError::OutOfBounds { offset, len, size }),
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Source of backing memory for component-allocated buffers.
///
/// Platform integrations plug their DMA / ION allocator in here.
pub trait MemoryAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<SharedMemory, MemoryError>;

    /// Return a region obtained from `allocate`.
    fn release(&self, _memory: &SharedMemory) {}
}

/// Heap-backed allocator with an optional byte budget.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    budget: Option<usize>,
    outstanding: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator that fails once more than `bytes` are outstanding.
    pub fn with_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl MemoryAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<SharedMemory, MemoryError> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                match self.budget {
                    Some(budget) if next > budget => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            debug!(size, budget = ?self.budget, "Heap allocation refused");
            return Err(MemoryError::AllocationFailed { size });
        }
        Ok(SharedMemory::new(size))
    }

    fn release(&self, memory: &SharedMemory) {
        let size = memory.len();
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }
}
