//! Memory Block Management
//!
//! A memory block subdivides one [`DeviceMemory`] into sub-allocations using
//! an explicit free list of `(offset, size)` slices.
//!
//! ```text
//! offset 0                                                      size
//! ├──────────┬───────┬───────────────────┬──────┬────────────────┤
//! │  live A  │ free  │      live B       │ free │     live C     │
//! └──────────┴───────┴───────────────────┴──────┴────────────────┘
//!              ▲                           ▲
//!              └──── free_slices ──────────┘
//! ```
//!
//! Free slices never overlap and never touch: every release coalesces with
//! its neighbours. The sum of free slice sizes plus live allocation sizes is
//! always the size of the device memory.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::device_memory::DeviceMemory;
use crate::error::{Error, Result};
use crate::types::align_up;

// ============================================================================
// Block Id
// ============================================================================

/// Identifier of a block inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Get the raw id.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

// ============================================================================
// Fit
// ============================================================================

/// A candidate placement found by [`MemoryBlock::best_fit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fit {
    /// Start of the free slice.
    pub slice_offset: u64,
    /// Size of the free slice.
    pub slice_size: u64,
    /// Aligned offset of the allocation.
    pub offset: u64,
    /// Slice size minus requested size.
    pub leftover: u64,
}

impl Fit {
    /// Exact fit, nothing left over.
    pub fn is_exact(&self) -> bool {
        self.leftover == 0
    }
}

// ============================================================================
// Memory Block
// ============================================================================

/// A sub-allocated device memory object.
#[derive(Debug)]
pub struct MemoryBlock {
    id: BlockId,
    memory: Arc<DeviceMemory>,
    /// Free slices keyed by offset.
    free_slices: BTreeMap<u64, u64>,
    live_allocations: u32,
}

impl MemoryBlock {
    /// Create a block whose whole range is free.
    pub fn new(id: BlockId, memory: DeviceMemory) -> Self {
        let mut free_slices = BTreeMap::new();
        free_slices.insert(0, memory.size());

        Self {
            id,
            memory: Arc::new(memory),
            free_slices,
            live_allocations: 0,
        }
    }

    /// Block id.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Backing device memory.
    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    /// Block size.
    pub fn size(&self) -> u64 {
        self.memory.size()
    }

    /// Free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free_slices.values().sum()
    }

    /// Number of live sub-allocations.
    pub fn live_allocations(&self) -> u32 {
        self.live_allocations
    }

    /// Check if nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.live_allocations == 0
    }

    /// Free slices as `(offset, size)` in offset order.
    pub fn free_slices(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free_slices.iter().map(|(&offset, &size)| (offset, size))
    }

    /// Number of free slices.
    pub fn free_slice_count(&self) -> usize {
        self.free_slices.len()
    }

    /// Best-fit search over every free slice.
    ///
    /// Returns the fitting slice with the smallest leftover, stopping at the
    /// first exact fit. Ties go to the lowest offset.
    pub fn best_fit(&self, size: u64, alignment: u64) -> Option<Fit> {
        let mut best: Option<Fit> = None;

        for (&slice_offset, &slice_size) in &self.free_slices {
            if slice_size < size {
                continue;
            }

            let Some(offset) = align_up(slice_offset, alignment) else {
                continue;
            };
            let slice_end = slice_offset + slice_size;
            if offset.checked_add(size).map_or(true, |end| end > slice_end) {
                continue;
            }

            let fit = Fit {
                slice_offset,
                slice_size,
                offset,
                leftover: slice_size - size,
            };

            if fit.is_exact() {
                return Some(fit);
            }
            if best.map_or(true, |b| fit.leftover < b.leftover) {
                best = Some(fit);
            }
        }

        best
    }

    /// Carve `size` bytes out of the slice described by `fit`.
    ///
    /// Leading and trailing remainders go back on the free list.
    pub fn commit(&mut self, fit: Fit, size: u64) -> Result<u64> {
        match self.free_slices.get(&fit.slice_offset) {
            Some(&slice_size) if slice_size == fit.slice_size => {},
            _ => return Err(Error::InvalidArgument),
        }
        let slice_end = fit.slice_offset + fit.slice_size;
        if fit.offset < fit.slice_offset || fit.offset + size > slice_end {
            return Err(Error::InvalidArgument);
        }

        self.free_slices.remove(&fit.slice_offset);

        if fit.offset > fit.slice_offset {
            self.free_slices
                .insert(fit.slice_offset, fit.offset - fit.slice_offset);
        }
        let end = fit.offset + size;
        if end < slice_end {
            self.free_slices.insert(end, slice_end - end);
        }

        self.live_allocations += 1;
        log::trace!(
            "block {:?}: allocated [{}, {}) from slice [{}, {})",
            self.id,
            fit.offset,
            end,
            fit.slice_offset,
            slice_end
        );
        Ok(fit.offset)
    }

    /// Find a place for `size` bytes and take it.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let fit = self.best_fit(size, alignment)?;
        self.commit(fit, size).ok()
    }

    /// Return `[offset, offset + size)` to the free list, coalescing with
    /// adjacent free slices.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        let end = offset.checked_add(size).ok_or(Error::InvalidArgument)?;
        if size == 0 || end > self.size() || self.live_allocations == 0 {
            return Err(Error::InvalidArgument);
        }

        let prev = self
            .free_slices
            .range(..=offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        let next = self
            .free_slices
            .range(offset..)
            .next()
            .map(|(&o, &s)| (o, s));

        // The range must not overlap anything already free.
        if prev.is_some_and(|(o, s)| o + s > offset) || next.is_some_and(|(o, _)| o < end) {
            return Err(Error::InvalidArgument);
        }

        let mut start = offset;
        let mut merged = size;

        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == offset {
                self.free_slices.remove(&prev_offset);
                start = prev_offset;
                merged += prev_size;
            }
        }
        if let Some((next_offset, next_size)) = next {
            if next_offset == end {
                self.free_slices.remove(&next_offset);
                merged += next_size;
            }
        }

        self.free_slices.insert(start, merged);
        self.live_allocations -= 1;
        log::trace!("block {:?}: freed [{}, {})", self.id, offset, end);
        Ok(())
    }
}

// ============================================================================
// Block Info
// ============================================================================

/// Memory block information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block id.
    pub id: BlockId,
    /// Block size.
    pub size: u64,
    /// Free bytes.
    pub free_bytes: u64,
    /// Number of free slices.
    pub free_slices: usize,
    /// Live sub-allocations.
    pub live_allocations: u32,
    /// Outstanding map count.
    pub map_count: u32,
}

impl BlockInfo {
    /// Create from block.
    pub fn from_block(block: &MemoryBlock) -> Self {
        Self {
            id: block.id,
            size: block.size(),
            free_bytes: block.free_bytes(),
            free_slices: block.free_slice_count(),
            live_allocations: block.live_allocations,
            map_count: block.memory.map_count(),
        }
    }

    /// Used bytes.
    pub fn used_bytes(&self) -> u64 {
        self.size - self.free_bytes
    }
}
