//! LUMINA Alloc - Device Memory Sub-Allocator
//!
//! Places GPU buffers and images into device memory. Small resources are
//! sub-allocated from large pooled blocks; large or driver-preferred ones
//! get dedicated memory objects.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    MemoryAllocator                       │
//! ├──────────────────┬──────────────────┬───────────────────┤
//! │   Memory Types   │      Pools       │    Dedicated      │
//! │ (flags, blocks)  │ (type, linear)   │  (one resource)   │
//! ├──────────────────┴──────────────────┴───────────────────┤
//! │   MemoryBlock: best-fit free list with coalescing        │
//! ├─────────────────────────────────────────────────────────┤
//! │   DeviceMemory: native handle + map reference count      │
//! ├─────────────────────────────────────────────────────────┤
//! │   MemoryDevice: native allocate/bind/map/flush           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Pooling**: Best-fit sub-allocation with neighbour coalescing
//! - **Dedicated**: Driver hints and oversized resources
//! - **Mapping**: Reference-counted or persistent host mappings
//! - **Coherency**: Atom-aligned flush/invalidate for non-coherent memory

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocation;
pub mod allocator;
pub mod block;
pub mod config;
pub mod device;
pub mod device_memory;
pub mod error;
pub mod memory_type;
pub mod pool;
pub mod types;

#[cfg(test)]
mod mock;

/// Prelude for common imports
pub mod prelude {
    pub use crate::allocation::{AllocationKind, AllocatorId, MemoryAllocation};
    pub use crate::allocator::{AllocatorStats, MemoryAllocator};
    pub use crate::block::{BlockId, BlockInfo, MemoryBlock};
    pub use crate::config::AllocatorConfig;
    pub use crate::device::{DedicatedResource, MemoryDevice};
    pub use crate::device_memory::DeviceMemory;
    pub use crate::error::{Error, OperationError, Result};
    pub use crate::memory_type::{MemoryType, MemoryTypeRegistry};
    pub use crate::pool::{MemoryPool, PoolKey};
    pub use crate::types::{
        DedicatedRequirements, DeviceMemoryProperties, ImageTiling, MappedMemoryRange,
        MemoryHeap, MemoryPropertyFlags, MemoryRequirements, MemoryTypeInfo, RawDeviceMemory,
        ResourceRequirements, WHOLE_SIZE,
    };
}

pub use prelude::*;
