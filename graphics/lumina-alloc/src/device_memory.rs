//! Device Memory
//!
//! One native memory allocation. Shared (through `Arc`) by the block that
//! sub-allocates it and by every allocation handed out from it, so its map
//! state lives behind a per-object lock.

use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::assert_impl_all;

use crate::device::{DedicatedResource, MemoryDevice};
use crate::error::{Error, OperationError, Result};
use crate::memory_type::MemoryType;
use crate::types::{align_down, align_up, MappedMemoryRange, MemoryPropertyFlags, RawDeviceMemory};

// ============================================================================
// Map State
// ============================================================================

#[derive(Debug, Default)]
struct MapState {
    /// Outstanding `map` calls.
    count: u32,
    /// Base host pointer while mapped.
    ptr: Option<NonNull<u8>>,
    /// Mapped once at creation, kept until release.
    persistent: bool,
}

// SAFETY: the pointer is a device mapping owned by this memory object, not
// thread-local data. Access is serialized by the surrounding mutex.
unsafe impl Send for MapState {}

// ============================================================================
// Device Memory
// ============================================================================

/// A native device memory allocation.
#[derive(Debug)]
pub struct DeviceMemory {
    raw: RawDeviceMemory,
    memory_type: u32,
    flags: MemoryPropertyFlags,
    size: u64,
    map: Mutex<MapState>,
}

assert_impl_all!(DeviceMemory: Send, Sync);

impl DeviceMemory {
    pub(crate) fn new(raw: RawDeviceMemory, memory_type: &MemoryType, size: u64) -> Self {
        Self {
            raw,
            memory_type: memory_type.index,
            flags: memory_type.flags,
            size,
            map: Mutex::new(MapState::default()),
        }
    }

    /// Allocate from the device, mapping immediately when `persistent` and
    /// the type is host visible.
    pub(crate) fn allocate<D: MemoryDevice>(
        device: &D,
        memory_type: &MemoryType,
        size: u64,
        dedicated: Option<DedicatedResource<'_, D::Buffer, D::Image>>,
        persistent: bool,
    ) -> Result<Self> {
        let raw = device.allocate_memory(memory_type.index, size, dedicated)?;
        let memory = Self::new(raw, memory_type, size);

        if persistent && memory.flags.is_host_visible() {
            match device.map_memory(raw, size) {
                Ok(ptr) => {
                    let mut state = memory.map.lock();
                    state.ptr = Some(ptr);
                    state.persistent = true;
                },
                Err(e) => {
                    device.free_memory(raw);
                    return Err(e);
                },
            }
        }

        Ok(memory)
    }

    /// Native handle.
    pub fn raw(&self) -> RawDeviceMemory {
        self.raw
    }

    /// Memory type index.
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Property flags of the memory type.
    pub fn flags(&self) -> MemoryPropertyFlags {
        self.flags
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Outstanding map count (always 0 for persistent mappings).
    pub fn map_count(&self) -> u32 {
        self.map.lock().count
    }

    /// Check if persistently mapped.
    pub fn is_persistently_mapped(&self) -> bool {
        self.map.lock().persistent
    }

    /// Check if a host pointer is currently valid.
    pub fn is_mapped(&self) -> bool {
        let state = self.map.lock();
        state.persistent || state.count > 0
    }

    /// Map the memory, returning the base host pointer.
    ///
    /// Only the first outstanding map issues a native call.
    pub fn map<D: MemoryDevice>(&self, device: &D) -> Result<NonNull<u8>> {
        if !self.flags.is_host_visible() {
            return Err(OperationError::NotHostVisible.into());
        }

        let mut state = self.map.lock();
        if state.persistent {
            return state.ptr.ok_or(Error::MappingFailed);
        }

        let ptr = match state.ptr {
            Some(ptr) if state.count > 0 => ptr,
            _ => {
                let ptr = device.map_memory(self.raw, self.size)?;
                log::trace!("mapped {:?} ({} bytes)", self.raw, self.size);
                state.ptr = Some(ptr);
                ptr
            },
        };
        state.count += 1;
        Ok(ptr)
    }

    /// Release one map reference.
    ///
    /// The last outstanding reference issues the native unmap.
    pub fn unmap<D: MemoryDevice>(&self, device: &D) -> Result<()> {
        if !self.flags.is_host_visible() {
            return Err(OperationError::NotHostVisible.into());
        }

        let mut state = self.map.lock();
        if state.persistent {
            return Ok(());
        }

        match state.count {
            0 => Err(OperationError::UnbalancedUnmap.into()),
            1 => {
                device.unmap_memory(self.raw);
                log::trace!("unmapped {:?}", self.raw);
                state.count = 0;
                state.ptr = None;
                Ok(())
            },
            _ => {
                state.count -= 1;
                Ok(())
            },
        }
    }

    /// Offset a base pointer returned by [`DeviceMemory::map`].
    pub(crate) fn offset_ptr(&self, base: NonNull<u8>, offset: u64) -> Result<NonNull<u8>> {
        if offset >= self.size {
            return Err(Error::InvalidArgument);
        }
        // SAFETY: the device maps the whole object, so `base..base + size`
        // is one host mapping and `offset < size`.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
    }

    /// Range covering `[offset, offset + size)` widened to `atom` and
    /// clamped to the end of the memory object.
    pub(crate) fn atom_aligned_range(&self, offset: u64, size: u64, atom: u64) -> MappedMemoryRange {
        let start = align_down(offset, atom);
        let end = align_up(offset + size, atom).map_or(self.size, |end| end.min(self.size));
        MappedMemoryRange {
            memory: self.raw,
            offset: start,
            size: end - start,
        }
    }

    /// Unmap if needed and return the memory to the device.
    pub(crate) fn release<D: MemoryDevice>(&self, device: &D) {
        let mut state = self.map.lock();
        if state.persistent || state.count > 0 {
            device.unmap_memory(self.raw);
        }
        *state = MapState::default();
        drop(state);

        device.free_memory(self.raw);
        log::debug!("released {:?} ({} bytes)", self.raw, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::mock::MockDevice;

    fn memory_type(device: &MockDevice, index: u32) -> MemoryType {
        *device.registry(&AllocatorConfig::default()).get(index).unwrap()
    }

    #[test]
    fn test_map_refcounting() {
        let device = MockDevice::new();
        let ty = memory_type(&device, MockDevice::HOST_COHERENT);
        let memory = DeviceMemory::allocate(&device, &ty, 1024, None, false).unwrap();

        let a = memory.map(&device).unwrap();
        let b = memory.map(&device).unwrap();
        let c = memory.map(&device).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(memory.map_count(), 3);

        memory.unmap(&device).unwrap();
        memory.unmap(&device).unwrap();
        assert!(memory.is_mapped());
        memory.unmap(&device).unwrap();
        assert!(!memory.is_mapped());

        assert_eq!(device.stats().map_calls, 1);
        assert_eq!(device.stats().unmap_calls, 1);

        assert_eq!(
            memory.unmap(&device),
            Err(Error::InvalidOperation(OperationError::UnbalancedUnmap))
        );
    }

    #[test]
    fn test_map_device_local_rejected() {
        let device = MockDevice::new();
        let ty = memory_type(&device, MockDevice::DEVICE_LOCAL);
        let memory = DeviceMemory::allocate(&device, &ty, 256, None, false).unwrap();

        assert_eq!(
            memory.map(&device),
            Err(Error::InvalidOperation(OperationError::NotHostVisible))
        );
        assert_eq!(device.stats().map_calls, 0);
    }

    #[test]
    fn test_persistent_mapping() {
        let device = MockDevice::new();
        let ty = memory_type(&device, MockDevice::HOST_COHERENT);
        let memory = DeviceMemory::allocate(&device, &ty, 512, None, true).unwrap();

        assert!(memory.is_persistently_mapped());
        assert_eq!(device.stats().map_calls, 1);

        memory.map(&device).unwrap();
        memory.unmap(&device).unwrap();
        memory.unmap(&device).unwrap();
        assert_eq!(memory.map_count(), 0);
        assert_eq!(device.stats().map_calls, 1);
        assert_eq!(device.stats().unmap_calls, 0);

        memory.release(&device);
        assert_eq!(device.stats().unmap_calls, 1);
        assert_eq!(device.stats().free_calls, 1);
    }

    #[test]
    fn test_persistent_ignored_for_device_local() {
        let device = MockDevice::new();
        let ty = memory_type(&device, MockDevice::DEVICE_LOCAL);
        let memory = DeviceMemory::allocate(&device, &ty, 512, None, true).unwrap();
        assert!(!memory.is_persistently_mapped());
        assert_eq!(device.stats().map_calls, 0);
    }

    #[test]
    fn test_atom_aligned_range() {
        let device = MockDevice::new();
        let ty = memory_type(&device, MockDevice::HOST_NON_COHERENT);
        let memory = DeviceMemory::allocate(&device, &ty, 1000, None, false).unwrap();

        let range = memory.atom_aligned_range(70, 10, 64);
        assert_eq!(range.offset, 64);
        assert_eq!(range.size, 64);

        // clamped to the object size
        let range = memory.atom_aligned_range(960, 30, 64);
        assert_eq!(range.offset, 960);
        assert_eq!(range.size, 40);
    }

    #[test]
    fn test_concurrent_map() {
        use alloc::sync::Arc;
        use std::thread;

        let device = Arc::new(MockDevice::new());
        let ty = memory_type(&device, MockDevice::HOST_COHERENT);
        let memory = Arc::new(DeviceMemory::allocate(&*device, &ty, 1024, None, false).unwrap());

        let workers: alloc::vec::Vec<_> = (0..4)
            .map(|_| {
                let device = Arc::clone(&device);
                let memory = Arc::clone(&memory);
                thread::spawn(move || {
                    for _ in 0..100 {
                        memory.map(&*device).unwrap();
                        memory.unmap(&*device).unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(memory.map_count(), 0);
        let stats = device.stats();
        assert_eq!(stats.map_calls, stats.unmap_calls);
    }
}
