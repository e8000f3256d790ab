//! Memory Allocation Handles
//!
//! A [`MemoryAllocation`] is a range of device memory handed to a buffer or
//! image. It is either a sub-allocation of a pooled block or a dedicated
//! memory object. Freeing clears the owning allocator id so that a second
//! free of the same handle is rejected.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::block::BlockId;
use crate::device_memory::DeviceMemory;
use crate::pool::PoolKey;
use crate::types::RawDeviceMemory;

// ============================================================================
// Allocator Id
// ============================================================================

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`MemoryAllocator`](crate::MemoryAllocator).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AllocatorId(u64);

impl AllocatorId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocatorId({})", self.0)
    }
}

// ============================================================================
// Allocation Kind
// ============================================================================

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// Sub-allocated from a pooled block.
    Pooled {
        /// Owning pool.
        pool: PoolKey,
        /// Owning block.
        block: BlockId,
    },
    /// Owns its device memory object.
    Dedicated,
}

// ============================================================================
// Memory Allocation
// ============================================================================

/// A live range of device memory.
///
/// Not `Clone`: each handle is freed exactly once through the allocator
/// that created it.
#[derive(Debug)]
pub struct MemoryAllocation {
    pub(crate) allocator: Option<AllocatorId>,
    pub(crate) kind: AllocationKind,
    pub(crate) memory: Arc<DeviceMemory>,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    /// Map references taken through this handle.
    pub(crate) map_count: AtomicU32,
}

impl MemoryAllocation {
    pub(crate) fn new(
        allocator: AllocatorId,
        kind: AllocationKind,
        memory: Arc<DeviceMemory>,
        offset: u64,
        size: u64,
    ) -> Self {
        Self {
            allocator: Some(allocator),
            kind,
            memory,
            offset,
            size,
            map_count: AtomicU32::new(0),
        }
    }

    /// Allocator that owns this allocation, `None` once freed.
    pub fn allocator(&self) -> Option<AllocatorId> {
        self.allocator
    }

    /// Check if not yet freed.
    pub fn is_valid(&self) -> bool {
        self.allocator.is_some()
    }

    /// Allocation kind.
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Check if dedicated.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.kind, AllocationKind::Dedicated)
    }

    /// Offset inside the device memory object.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Outstanding maps taken through this handle.
    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    /// Memory type index.
    pub fn memory_type(&self) -> u32 {
        self.memory.memory_type()
    }

    /// Native memory handle the resource is bound to.
    pub fn raw_memory(&self) -> RawDeviceMemory {
        self.memory.raw()
    }

    /// Backing device memory.
    pub fn device_memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }
}
