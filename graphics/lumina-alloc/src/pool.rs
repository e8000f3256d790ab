//! # Memory Pool
//!
//! All blocks of one `(memory type, linear)` pair. Linear and non-linear
//! resources never share a block.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block::{BlockId, BlockInfo, Fit, MemoryBlock};
use crate::device::MemoryDevice;
use crate::device_memory::DeviceMemory;
use crate::error::{Error, Result};
use crate::memory_type::MemoryType;

// =============================================================================
// POOL KEY
// =============================================================================

/// Pool identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    /// Memory type index.
    pub memory_type: u32,
    /// Linear resources (buffers, linear images).
    pub linear: bool,
}

impl PoolKey {
    /// Create a pool key
    pub const fn new(memory_type: u32, linear: bool) -> Self {
        Self {
            memory_type,
            linear,
        }
    }
}

// =============================================================================
// POOL SLOT
// =============================================================================

/// Result of a pooled sub-allocation.
#[derive(Debug, Clone)]
pub struct PoolSlot {
    /// Block the range was carved from.
    pub block: BlockId,
    /// Block memory.
    pub memory: Arc<DeviceMemory>,
    /// Offset inside the block.
    pub offset: u64,
}

// =============================================================================
// MEMORY POOL
// =============================================================================

/// Growable list of blocks for one pool key.
#[derive(Debug)]
pub struct MemoryPool {
    key: PoolKey,
    block_size: u64,
    /// Blocks in creation order.
    blocks: Vec<MemoryBlock>,
    next_block_id: u32,
}

impl MemoryPool {
    /// Create an empty pool
    pub fn new(key: PoolKey, block_size: u64) -> Self {
        Self {
            key,
            block_size,
            blocks: Vec::new(),
            next_block_id: 0,
        }
    }

    /// Pool key
    pub fn key(&self) -> PoolKey {
        self.key
    }

    /// Size of blocks created by this pool
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Blocks in creation order
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// Number of blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Get a block
    pub fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.iter().find(|b| b.id() == id)
    }

    /// Device memory committed by this pool
    pub fn committed_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size()).sum()
    }

    /// Bytes handed out to live allocations
    pub fn used_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size() - b.free_bytes()).sum()
    }

    /// Live sub-allocations across all blocks
    pub fn live_allocations(&self) -> u32 {
        self.blocks.iter().map(|b| b.live_allocations()).sum()
    }

    /// Per-block information
    pub fn block_infos(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks.iter().map(BlockInfo::from_block)
    }

    /// Best fit across every block, in creation order.
    fn find_fit(&self, size: u64, alignment: u64) -> Option<(usize, Fit)> {
        let mut best: Option<(usize, Fit)> = None;

        for (index, block) in self.blocks.iter().enumerate() {
            let Some(fit) = block.best_fit(size, alignment) else {
                continue;
            };
            if fit.is_exact() {
                return Some((index, fit));
            }
            if best.map_or(true, |(_, b)| fit.leftover < b.leftover) {
                best = Some((index, fit));
            }
        }

        best
    }

    /// Sub-allocate `size` bytes, creating a new block when nothing fits.
    pub fn allocate<D: MemoryDevice>(
        &mut self,
        device: &D,
        memory_type: &MemoryType,
        size: u64,
        alignment: u64,
        persistent: bool,
    ) -> Result<PoolSlot> {
        if size == 0 || size > self.block_size {
            return Err(Error::InvalidArgument);
        }

        let (index, offset) = match self.find_fit(size, alignment) {
            Some((index, fit)) => (index, self.blocks[index].commit(fit, size)?),
            None => {
                let memory =
                    DeviceMemory::allocate(device, memory_type, self.block_size, None, persistent)?;
                let id = BlockId(self.next_block_id);
                self.next_block_id += 1;
                log::debug!(
                    "pool {:?}: new block {:?} of {} bytes ({:?})",
                    self.key,
                    id,
                    self.block_size,
                    memory.raw()
                );

                // Offset 0 satisfies any alignment, so a fresh block always fits.
                let mut block = MemoryBlock::new(id, memory);
                let Some(offset) = block.allocate(size, alignment) else {
                    block.memory().release(device);
                    return Err(Error::InvalidArgument);
                };
                self.blocks.push(block);
                (self.blocks.len() - 1, offset)
            },
        };

        let block = &self.blocks[index];
        Ok(PoolSlot {
            block: block.id(),
            memory: Arc::clone(block.memory()),
            offset,
        })
    }

    /// Return a range to its block.
    pub fn free(&mut self, block: BlockId, offset: u64, size: u64) -> Result<()> {
        self.blocks
            .iter_mut()
            .find(|b| b.id() == block)
            .ok_or(Error::InvalidArgument)?
            .free(offset, size)
    }

    /// Release blocks with no live allocations and no outstanding maps.
    pub fn trim<D: MemoryDevice>(&mut self, device: &D) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|block| {
            let idle = block.is_empty() && block.memory().map_count() == 0;
            if idle {
                block.memory().release(device);
            }
            !idle
        });

        let released = before - self.blocks.len();
        if released > 0 {
            log::debug!("pool {:?}: trimmed {} block(s)", self.key, released);
        }
        released
    }

    /// Release every block regardless of live allocations.
    pub fn release_all<D: MemoryDevice>(&mut self, device: &D) {
        for block in self.blocks.drain(..) {
            if !block.is_empty() {
                log::warn!(
                    "pool {:?}: block {:?} released with {} live allocation(s)",
                    self.key,
                    block.id(),
                    block.live_allocations()
                );
            }
            block.memory().release(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::mock::MockDevice;

    fn setup() -> (MockDevice, MemoryType, MemoryPool) {
        let device = MockDevice::new();
        let ty = *device
            .registry(&AllocatorConfig::default())
            .get(MockDevice::DEVICE_LOCAL)
            .unwrap();
        let pool = MemoryPool::new(PoolKey::new(ty.index, true), ty.block_size);
        (device, ty, pool)
    }

    #[test]
    fn test_grows_on_demand() {
        let (device, ty, mut pool) = setup();
        assert_eq!(pool.block_size(), 1024);

        let a = pool.allocate(&device, &ty, 1000, 1, false).unwrap();
        let b = pool.allocate(&device, &ty, 1000, 1, false).unwrap();
        assert_ne!(a.block, b.block);
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.committed_bytes(), 2048);
        assert_eq!(device.stats().allocate_calls, 2);

        // the 24 byte tail of the first block is the best fit
        let c = pool.allocate(&device, &ty, 24, 1, false).unwrap();
        assert_eq!(c.block, a.block);
        assert_eq!(c.offset, 1000);
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_rejects_oversized() {
        let (device, ty, mut pool) = setup();
        assert_eq!(
            pool.allocate(&device, &ty, 2048, 1, false).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_new_block_out_of_memory() {
        let (device, ty, mut pool) = setup();
        device.set_fail_block_allocations(true);
        assert_eq!(
            pool.allocate(&device, &ty, 64, 1, false).err(),
            Some(Error::OutOfMemory)
        );
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_trim_releases_idle_blocks() {
        let (device, ty, mut pool) = setup();
        let a = pool.allocate(&device, &ty, 1000, 1, false).unwrap();
        let b = pool.allocate(&device, &ty, 1000, 1, false).unwrap();

        pool.free(a.block, a.offset, 1000).unwrap();
        assert_eq!(pool.trim(&device), 1);
        assert_eq!(pool.block_count(), 1);
        assert_eq!(device.stats().free_calls, 1);
        assert!(pool.block(b.block).is_some());

        // ids are never reused
        pool.free(b.block, b.offset, 1000).unwrap();
        let c = pool.allocate(&device, &ty, 10, 1, false).unwrap();
        assert_eq!(c.block, b.block);
        assert_eq!(pool.free(a.block, 0, 10), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_block_info() {
        let device = MockDevice::new();
        let ty = *device
            .registry(&AllocatorConfig::default())
            .get(MockDevice::HOST_COHERENT)
            .unwrap();
        let mut pool = MemoryPool::new(PoolKey::new(ty.index, true), ty.block_size);

        let a = pool.allocate(&device, &ty, 100, 1, false).unwrap();
        let b = pool.allocate(&device, &ty, 200, 1, false).unwrap();

        let info = pool.block_infos().next().unwrap();
        assert_eq!(info.id, a.block);
        assert_eq!(info.size, 1024);
        assert_eq!(info.free_bytes, 724);
        assert_eq!(info.free_slices, 1);
        assert_eq!(info.live_allocations, 2);
        assert_eq!(info.map_count, 0);
        assert_eq!(info.used_bytes(), 300);

        a.memory.map(&device).unwrap();
        pool.free(a.block, a.offset, 100).unwrap();

        let info = pool.block_infos().next().unwrap();
        assert_eq!(info.free_bytes, 824);
        assert_eq!(info.free_slices, 2);
        assert_eq!(info.live_allocations, 1);
        assert_eq!(info.map_count, 1);
        assert_eq!(info.used_bytes(), 200);

        a.memory.unmap(&device).unwrap();
        pool.free(b.block, b.offset, 200).unwrap();

        let info = pool.block_infos().next().unwrap();
        assert_eq!(info.free_bytes, 1024);
        assert_eq!(info.free_slices, 1);
        assert_eq!(info.live_allocations, 0);
        assert_eq!(info.map_count, 0);
        assert_eq!(info.used_bytes(), 0);
        assert_eq!(pool.block_infos().count(), 1);
    }

    #[test]
    fn test_release_all() {
        let (device, ty, mut pool) = setup();
        pool.allocate(&device, &ty, 1000, 1, false).unwrap();
        pool.allocate(&device, &ty, 1000, 1, false).unwrap();
        pool.release_all(&device);
        assert_eq!(pool.block_count(), 0);
        assert_eq!(device.stats().free_calls, 2);
        assert_eq!(device.live_memory_objects(), 0);
    }
}
