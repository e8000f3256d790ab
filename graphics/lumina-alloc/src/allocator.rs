//! # Device Memory Allocator
//!
//! Façade over memory types, pools and dedicated allocations.
//!
//! ```text
//!  allocate_buffer / allocate_image
//!              │
//!              ▼
//!   select memory type (mask ∩ flags)
//!              │
//!   size > block size? ──yes──▶ dedicated required
//!              │
//!   dedicated preferred? ──yes──▶ dedicated allocation ──OOM & optional──┐
//!              │                                                        │
//!              ▼                                                        │
//!   pool (type, linear) ◀──────────────────────────────────────────────┘
//!     best fit over blocks, new block on demand
//! ```
//!
//! `allocate`/`free`/`trim` take `&mut self`; map, unmap, flush and
//! invalidate take `&self` and only lock the individual device memory.

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use hashbrown::HashMap;

use crate::allocation::{AllocationKind, AllocatorId, MemoryAllocation};
use crate::config::AllocatorConfig;
use crate::device::{DedicatedResource, MemoryDevice};
use crate::device_memory::DeviceMemory;
use crate::error::{Error, OperationError, Result};
use crate::memory_type::{MemoryType, MemoryTypeRegistry};
use crate::pool::{MemoryPool, PoolKey};
use crate::types::{
    combine_alignment, DedicatedRequirements, ImageTiling, MappedMemoryRange, MemoryPropertyFlags,
    ResourceRequirements, WHOLE_SIZE,
};

// =============================================================================
// STATISTICS
// =============================================================================

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Pooled blocks
    pub block_count: usize,
    /// Device memory held by pooled blocks
    pub committed_bytes: u64,
    /// Bytes of pooled blocks handed out
    pub pooled_bytes: u64,
    /// Live pooled allocations
    pub pooled_allocations: u32,
    /// Live dedicated allocations
    pub dedicated_allocations: u32,
    /// Bytes held by dedicated allocations
    pub dedicated_bytes: u64,
}

impl AllocatorStats {
    /// Total device memory held through this allocator
    pub fn total_device_bytes(&self) -> u64 {
        self.committed_bytes + self.dedicated_bytes
    }
}

// =============================================================================
// MEMORY ALLOCATOR
// =============================================================================

/// Device memory sub-allocator
pub struct MemoryAllocator<D: MemoryDevice> {
    id: AllocatorId,
    device: D,
    config: AllocatorConfig,
    types: MemoryTypeRegistry,
    pools: HashMap<PoolKey, MemoryPool>,
    dedicated_allocations: u32,
    dedicated_bytes: u64,
}

impl<D: MemoryDevice> MemoryAllocator<D> {
    /// Create an allocator, querying the device memory properties once.
    pub fn new(device: D, config: AllocatorConfig) -> Self {
        let properties = device.memory_properties();
        let types = MemoryTypeRegistry::new(&properties, device.non_coherent_atom_size(), &config);

        let id = AllocatorId::next();
        log::debug!(
            "allocator {:?}: {} heap(s), {} memory type(s), persistent mapping {}",
            id,
            properties.heaps.len(),
            types.types().len(),
            config.persistent_mapping
        );

        Self {
            id,
            device,
            config,
            types,
            pools: HashMap::new(),
            dedicated_allocations: 0,
            dedicated_bytes: 0,
        }
    }

    /// Allocator id
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// Native device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Configuration
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Memory types
    pub fn memory_types(&self) -> &MemoryTypeRegistry {
        &self.types
    }

    /// Pool for a key, if it has been created
    pub fn pool(&self, key: PoolKey) -> Option<&MemoryPool> {
        self.pools.get(&key)
    }

    /// All pools
    pub fn pools(&self) -> impl Iterator<Item = &MemoryPool> {
        self.pools.values()
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate memory for a buffer and bind it.
    pub fn allocate_buffer(
        &mut self,
        buffer: &D::Buffer,
        flags: MemoryPropertyFlags,
    ) -> Result<MemoryAllocation> {
        let requirements = self.device.buffer_requirements(buffer);
        let mut allocation = self.allocate_memory(
            &requirements,
            flags,
            true,
            Some(DedicatedResource::Buffer(buffer)),
        )?;

        if let Err(e) =
            self.device
                .bind_buffer_memory(buffer, allocation.raw_memory(), allocation.offset())
        {
            self.release_after_bind_failure(&mut allocation);
            return Err(e);
        }
        Ok(allocation)
    }

    /// Allocate memory for an image and bind it.
    pub fn allocate_image(
        &mut self,
        image: &D::Image,
        flags: MemoryPropertyFlags,
        tiling: ImageTiling,
    ) -> Result<MemoryAllocation> {
        let requirements = self.device.image_requirements(image);
        let mut allocation = self.allocate_memory(
            &requirements,
            flags,
            tiling.is_linear(),
            Some(DedicatedResource::Image(image)),
        )?;

        if let Err(e) =
            self.device
                .bind_image_memory(image, allocation.raw_memory(), allocation.offset())
        {
            self.release_after_bind_failure(&mut allocation);
            return Err(e);
        }
        Ok(allocation)
    }

    fn release_after_bind_failure(&mut self, allocation: &mut MemoryAllocation) {
        if let Err(e) = self.free(allocation) {
            log::warn!("allocator {:?}: release after bind failure: {}", self.id, e);
        }
    }

    /// Allocate memory for raw requirements without binding anything.
    pub fn allocate_memory(
        &mut self,
        requirements: &ResourceRequirements,
        flags: MemoryPropertyFlags,
        linear: bool,
        dedicated_to: Option<DedicatedResource<'_, D::Buffer, D::Image>>,
    ) -> Result<MemoryAllocation> {
        let memory = requirements.memory;
        if memory.size == 0 {
            return Err(Error::InvalidArgument);
        }

        let memory_type = *self.types.find(memory.memory_type_bits, flags)?;

        // A resource that cannot fit a whole block never competes for pool space.
        let dedicated = if memory.size > memory_type.block_size {
            DedicatedRequirements::required()
        } else {
            requirements.dedicated
        };

        if dedicated.prefers_dedicated || dedicated.requires_dedicated {
            match self.allocate_dedicated(&memory_type, memory.size, dedicated_to) {
                Ok(allocation) => return Ok(allocation),
                Err(Error::OutOfMemory) if !dedicated.requires_dedicated => {
                    log::debug!(
                        "allocator {:?}: dedicated {} bytes of type {} out of memory, using pool",
                        self.id,
                        memory.size,
                        memory_type.index
                    );
                },
                Err(e) => return Err(e),
            }
        }

        self.allocate_pooled(&memory_type, memory.size, memory.alignment, linear)
    }

    fn allocate_dedicated(
        &mut self,
        memory_type: &MemoryType,
        size: u64,
        dedicated_to: Option<DedicatedResource<'_, D::Buffer, D::Image>>,
    ) -> Result<MemoryAllocation> {
        let memory = DeviceMemory::allocate(
            &self.device,
            memory_type,
            size,
            dedicated_to,
            self.config.persistent_mapping,
        )?;
        log::debug!(
            "allocator {:?}: dedicated {:?} of {} bytes, type {}",
            self.id,
            memory.raw(),
            size,
            memory_type.index
        );

        self.dedicated_allocations += 1;
        self.dedicated_bytes += size;

        Ok(MemoryAllocation::new(
            self.id,
            AllocationKind::Dedicated,
            Arc::new(memory),
            0,
            size,
        ))
    }

    fn allocate_pooled(
        &mut self,
        memory_type: &MemoryType,
        size: u64,
        alignment: u64,
        linear: bool,
    ) -> Result<MemoryAllocation> {
        let alignment = combine_alignment(alignment, memory_type.min_alignment)
            .ok_or(Error::InvalidArgument)?;
        let key = PoolKey::new(memory_type.index, linear);

        let pool = self
            .pools
            .entry(key)
            .or_insert_with(|| MemoryPool::new(key, memory_type.block_size));
        let slot = pool.allocate(
            &self.device,
            memory_type,
            size,
            alignment,
            self.config.persistent_mapping,
        )?;

        Ok(MemoryAllocation::new(
            self.id,
            AllocationKind::Pooled {
                pool: key,
                block: slot.block,
            },
            slot.memory,
            slot.offset,
            size,
        ))
    }

    // -------------------------------------------------------------------------
    // Free
    // -------------------------------------------------------------------------

    /// Free an allocation and invalidate the handle.
    ///
    /// The allocation must not be mapped through this handle.
    pub fn free(&mut self, allocation: &mut MemoryAllocation) -> Result<()> {
        self.check_owner(allocation)?;
        if allocation.map_count() > 0 {
            return Err(OperationError::StillMapped.into());
        }

        match allocation.kind {
            AllocationKind::Pooled { pool, block } => {
                self.pools
                    .get_mut(&pool)
                    .ok_or(Error::InvalidArgument)?
                    .free(block, allocation.offset, allocation.size)?;
            },
            AllocationKind::Dedicated => {
                allocation.memory.release(&self.device);
                self.dedicated_allocations -= 1;
                self.dedicated_bytes -= allocation.size;
            },
        }

        allocation.allocator = None;
        Ok(())
    }

    /// Release idle pooled blocks back to the device.
    ///
    /// Never runs implicitly; call between frames when memory pressure
    /// matters more than block reuse.
    pub fn trim(&mut self) -> usize {
        let device = &self.device;
        self.pools.values_mut().map(|pool| pool.trim(device)).sum()
    }

    // -------------------------------------------------------------------------
    // Mapping
    // -------------------------------------------------------------------------

    /// Map an allocation, returning a host pointer to its first byte.
    pub fn map(&self, allocation: &MemoryAllocation) -> Result<NonNull<u8>> {
        self.check_owner(allocation)?;
        let memory = &allocation.memory;
        let base = memory.map(&self.device)?;
        match memory.offset_ptr(base, allocation.offset) {
            Ok(ptr) => {
                allocation.map_count.fetch_add(1, Ordering::AcqRel);
                Ok(ptr)
            },
            Err(e) => {
                memory.unmap(&self.device)?;
                Err(e)
            },
        }
    }

    /// Release one map reference of an allocation.
    ///
    /// Unmaps are balanced per handle, also for persistently mapped memory.
    pub fn unmap(&self, allocation: &MemoryAllocation) -> Result<()> {
        self.check_owner(allocation)?;
        if !allocation.memory.flags().is_host_visible() {
            return Err(OperationError::NotHostVisible.into());
        }

        allocation
            .map_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| OperationError::UnbalancedUnmap)?;

        if let Err(e) = allocation.memory.unmap(&self.device) {
            allocation.map_count.fetch_add(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    /// Flush host writes in `[offset, offset + size)` of the allocation.
    ///
    /// No device call for host-coherent memory.
    pub fn flush_mapped_range(
        &self,
        allocation: &MemoryAllocation,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        match self.mapped_range(allocation, offset, size)? {
            Some(range) => self.device.flush_mapped_range(range),
            None => Ok(()),
        }
    }

    /// Invalidate `[offset, offset + size)` of the allocation before host reads.
    ///
    /// No device call for host-coherent memory.
    pub fn invalidate_mapped_range(
        &self,
        allocation: &MemoryAllocation,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        match self.mapped_range(allocation, offset, size)? {
            Some(range) => self.device.invalidate_mapped_range(range),
            None => Ok(()),
        }
    }

    /// Device range for a flush/invalidate, `None` when no call is needed.
    fn mapped_range(
        &self,
        allocation: &MemoryAllocation,
        offset: u64,
        size: u64,
    ) -> Result<Option<MappedMemoryRange>> {
        self.check_owner(allocation)?;

        let memory = &allocation.memory;
        if !memory.flags().is_host_visible() {
            return Err(OperationError::NotHostVisible.into());
        }

        let size = if size == WHOLE_SIZE {
            allocation.size.checked_sub(offset).ok_or(Error::InvalidArgument)?
        } else {
            size
        };
        if offset.checked_add(size).map_or(true, |end| end > allocation.size) {
            return Err(Error::InvalidArgument);
        }

        if memory.flags().is_host_coherent() || size == 0 {
            return Ok(None);
        }
        if !memory.is_mapped() {
            return Err(OperationError::NotMapped.into());
        }

        Ok(Some(memory.atom_aligned_range(
            allocation.offset + offset,
            size,
            self.types.non_coherent_atom_size(),
        )))
    }

    fn check_owner(&self, allocation: &MemoryAllocation) -> Result<()> {
        match allocation.allocator {
            None => Err(OperationError::DoubleFree.into()),
            Some(id) if id != self.id => Err(OperationError::ForeignAllocation.into()),
            Some(_) => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    /// Current statistics
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            dedicated_allocations: self.dedicated_allocations,
            dedicated_bytes: self.dedicated_bytes,
            ..AllocatorStats::default()
        };

        for pool in self.pools.values() {
            stats.block_count += pool.block_count();
            stats.committed_bytes += pool.committed_bytes();
            stats.pooled_bytes += pool.used_bytes();
            stats.pooled_allocations += pool.live_allocations();
        }

        stats
    }
}

impl<D: MemoryDevice> Drop for MemoryAllocator<D> {
    fn drop(&mut self) {
        if self.dedicated_allocations > 0 {
            log::warn!(
                "allocator {:?}: dropped with {} dedicated allocation(s) ({} bytes) outstanding",
                self.id,
                self.dedicated_allocations,
                self.dedicated_bytes
            );
        }

        let device = &self.device;
        for pool in self.pools.values_mut() {
            pool.release_all(device);
        }
    }
}

impl<D: MemoryDevice> fmt::Debug for MemoryAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("types", &self.types)
            .field("pools", &self.pools.len())
            .field("dedicated_allocations", &self.dedicated_allocations)
            .finish_non_exhaustive()
    }
}
