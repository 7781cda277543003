//! Buffer descriptors exchanged between client and component.
//!
//! A `BufferDescriptor` is not `Clone`: whoever holds the value owns the
//! buffer. Submitting moves it into the component, and it comes back by
//! value through the return callbacks.

use venc_common::{
    BufferFlags, BufferIndex, CompletionStatus, MarkTag, MemoryError, PortIndex, SharedMemory,
    Timestamp,
};

/// One buffer of a port's pool, plus the metadata of its current payload.
#[derive(Debug)]
pub struct BufferDescriptor {
    port: PortIndex,
    index: BufferIndex,
    memory: SharedMemory,
    alloc_len: usize,
    /// Start of the payload within the backing memory.
    pub offset: usize,
    /// Payload bytes starting at `offset`.
    pub filled_len: usize,
    pub timestamp: Timestamp,
    pub flags: BufferFlags,
    /// Opaque client data; never touched by the component.
    pub client_tag: u64,
    mark: Option<MarkTag>,
    status: CompletionStatus,
}

impl BufferDescriptor {
    pub(crate) fn new(
        port: PortIndex,
        index: BufferIndex,
        memory: SharedMemory,
        alloc_len: usize,
    ) -> Self {
        Self {
            port,
            index,
            memory,
            alloc_len,
            offset: 0,
            filled_len: 0,
            timestamp: Timestamp::ZERO,
            flags: BufferFlags::empty(),
            client_tag: 0,
            mark: None,
            status: CompletionStatus::Ok,
        }
    }

    pub fn port(&self) -> PortIndex {
        self.port
    }

    pub fn index(&self) -> BufferIndex {
        self.index
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn alloc_len(&self) -> usize {
        self.alloc_len
    }

    /// Mark propagated from a `MarkBuffer` command (output buffers only).
    pub fn mark(&self) -> Option<MarkTag> {
        self.mark
    }

    /// Why the buffer was last handed back.
    pub fn status(&self) -> CompletionStatus {
        self.status
    }

    pub fn is_eos(&self) -> bool {
        self.flags.is_eos()
    }

    /// Copy `data` to the start of the buffer and describe it as the payload.
    pub fn write_payload(&mut self, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() > self.alloc_len {
            return Err(MemoryError::OutOfBounds {
                offset: 0,
                len: data.len(),
                size: self.alloc_len,
            });
        }
        self.memory.write(0, data)?;
        self.offset = 0;
        self.filled_len = data.len();
        Ok(())
    }

    /// Copy of the current payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>, MemoryError> {
        self.memory.read(self.offset, self.filled_len)
    }

    /// Whether `offset + filled_len` fits in the allocation.
    pub(crate) fn payload_in_bounds(&self) -> bool {
        self.offset
            .checked_add(self.filled_len)
            .is_some_and(|end| end <= self.alloc_len)
    }

    pub(crate) fn set_status(&mut self, status: CompletionStatus) {
        self.status = status;
    }

    pub(crate) fn set_mark(&mut self, mark: Option<MarkTag>) {
        self.mark = mark;
    }

    /// Forget the previous payload before the device fills the buffer.
    pub(crate) fn clear_payload(&mut self) {
        self.offset = 0;
        self.filled_len = 0;
        self.flags = BufferFlags::empty();
        self.mark = None;
        self.status = CompletionStatus::Ok;
    }
}
