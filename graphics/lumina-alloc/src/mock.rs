//! Mock device for tests.
//!
//! Three memory types over two 16 KiB heaps, a 64 byte non-coherent atom,
//! host backing storage for mappings and call counters.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::assert_impl_all;

use crate::config::AllocatorConfig;
use crate::device::{DedicatedResource, MemoryDevice};
use crate::error::{Error, Result};
use crate::memory_type::MemoryTypeRegistry;
use crate::types::{
    DedicatedRequirements, DeviceMemoryProperties, MappedMemoryRange, MemoryHeap,
    MemoryPropertyFlags, MemoryRequirements, MemoryTypeInfo, RawDeviceMemory,
    ResourceRequirements,
};

const HEAP_SIZE: u64 = 16 * 1024;

/// Device call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MockStats {
    pub allocate_calls: u32,
    pub dedicated_calls: u32,
    pub free_calls: u32,
    pub map_calls: u32,
    pub unmap_calls: u32,
    pub flush_calls: u32,
    pub invalidate_calls: u32,
    pub bind_calls: u32,
    pub last_flush: Option<MappedMemoryRange>,
    pub last_invalidate: Option<MappedMemoryRange>,
}

struct MockMemory {
    heap: usize,
    size: u64,
    backing: Option<Box<[u8]>>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    objects: BTreeMap<u64, MockMemory>,
    heap_usage: [u64; 2],
    stats: MockStats,
    fail_blocks: bool,
    fail_dedicated: bool,
    fail_bind: bool,
}

pub(crate) struct MockDevice {
    properties: DeviceMemoryProperties,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub const DEVICE_LOCAL: u32 = 0;
    pub const HOST_COHERENT: u32 = 1;
    pub const HOST_NON_COHERENT: u32 = 2;

    pub const ATOM_SIZE: u64 = 64;

    pub fn new() -> Self {
        let heaps = vec![
            MemoryHeap {
                size: HEAP_SIZE,
                device_local: true,
            },
            MemoryHeap {
                size: HEAP_SIZE,
                device_local: false,
            },
        ];
        let types = vec![
            MemoryTypeInfo {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryTypeInfo {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryTypeInfo {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            },
        ];

        Self {
            properties: DeviceMemoryProperties { heaps, types },
            state: Mutex::new(MockState {
                next_handle: 1,
                ..MockState::default()
            }),
        }
    }

    pub fn registry(&self, config: &AllocatorConfig) -> MemoryTypeRegistry {
        MemoryTypeRegistry::new(&self.properties, Self::ATOM_SIZE, config)
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().stats
    }

    pub fn live_memory_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn set_fail_block_allocations(&self, fail: bool) {
        self.state.lock().fail_blocks = fail;
    }

    pub fn set_fail_dedicated_allocations(&self, fail: bool) {
        self.state.lock().fail_dedicated = fail;
    }

    pub fn set_fail_bind(&self, fail: bool) {
        self.state.lock().fail_bind = fail;
    }

    fn bind(&self, resource: &MockResource, memory: RawDeviceMemory, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.bind_calls += 1;
        if state.fail_bind {
            return Err(Error::OutOfMemory);
        }
        let object = state
            .objects
            .get(&memory.raw())
            .ok_or(Error::InvalidArgument)?;
        if offset + resource.requirements.memory.size > object.size {
            return Err(Error::InvalidArgument);
        }
        *resource.binding.lock() = Some((memory, offset));
        Ok(())
    }
}

impl MemoryDevice for MockDevice {
    type Buffer = MockResource;
    type Image = MockResource;

    fn memory_properties(&self) -> DeviceMemoryProperties {
        self.properties.clone()
    }

    fn non_coherent_atom_size(&self) -> u64 {
        Self::ATOM_SIZE
    }

    fn buffer_requirements(&self, buffer: &MockResource) -> ResourceRequirements {
        buffer.requirements
    }

    fn image_requirements(&self, image: &MockResource) -> ResourceRequirements {
        image.requirements
    }

    fn allocate_memory(
        &self,
        memory_type: u32,
        size: u64,
        dedicated: Option<DedicatedResource<'_, MockResource, MockResource>>,
    ) -> Result<RawDeviceMemory> {
        let heap = self
            .properties
            .types
            .get(memory_type as usize)
            .ok_or(Error::InvalidMemoryType)?
            .heap_index as usize;

        let mut state = self.state.lock();
        state.stats.allocate_calls += 1;
        if dedicated.is_some() {
            state.stats.dedicated_calls += 1;
        }

        let fail = if dedicated.is_some() {
            state.fail_dedicated
        } else {
            state.fail_blocks
        };
        if fail || state.heap_usage[heap] + size > HEAP_SIZE {
            return Err(Error::OutOfMemory);
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.heap_usage[heap] += size;
        state.objects.insert(
            handle,
            MockMemory {
                heap,
                size,
                backing: None,
            },
        );
        Ok(RawDeviceMemory(handle))
    }

    fn free_memory(&self, memory: RawDeviceMemory) {
        let mut state = self.state.lock();
        state.stats.free_calls += 1;
        let object = state
            .objects
            .remove(&memory.raw())
            .unwrap_or_else(|| panic!("free of unknown {:?}", memory));
        state.heap_usage[object.heap] -= object.size;
    }

    fn bind_buffer_memory(
        &self,
        buffer: &MockResource,
        memory: RawDeviceMemory,
        offset: u64,
    ) -> Result<()> {
        self.bind(buffer, memory, offset)
    }

    fn bind_image_memory(
        &self,
        image: &MockResource,
        memory: RawDeviceMemory,
        offset: u64,
    ) -> Result<()> {
        self.bind(image, memory, offset)
    }

    fn map_memory(&self, memory: RawDeviceMemory, size: u64) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        state.stats.map_calls += 1;
        let object = state
            .objects
            .get_mut(&memory.raw())
            .ok_or(Error::MappingFailed)?;
        assert_eq!(size, object.size, "partial map of {:?}", memory);

        let backing = object
            .backing
            .get_or_insert_with(|| vec![0u8; size as usize].into_boxed_slice());
        NonNull::new(backing.as_mut_ptr()).ok_or(Error::MappingFailed)
    }

    fn unmap_memory(&self, memory: RawDeviceMemory) {
        let mut state = self.state.lock();
        state.stats.unmap_calls += 1;
        assert!(
            state.objects.contains_key(&memory.raw()),
            "unmap of unknown {:?}",
            memory
        );
    }

    fn flush_mapped_range(&self, range: MappedMemoryRange) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.flush_calls += 1;
        state.stats.last_flush = Some(range);
        Ok(())
    }

    fn invalidate_mapped_range(&self, range: MappedMemoryRange) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.invalidate_calls += 1;
        state.stats.last_invalidate = Some(range);
        Ok(())
    }
}

/// Buffer or image with fixed requirements.
pub(crate) struct MockResource {
    pub requirements: ResourceRequirements,
    binding: Mutex<Option<(RawDeviceMemory, u64)>>,
}

impl MockResource {
    pub fn new(size: u64, alignment: u64, memory_type_bits: u32) -> Self {
        Self {
            requirements: ResourceRequirements {
                memory: MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits,
                },
                dedicated: DedicatedRequirements::default(),
            },
            binding: Mutex::new(None),
        }
    }

    pub fn with_dedicated(mut self, dedicated: DedicatedRequirements) -> Self {
        self.requirements.dedicated = dedicated;
        self
    }

    pub fn binding(&self) -> Option<(RawDeviceMemory, u64)> {
        *self.binding.lock()
    }
}

/// Type mask accepting every mock memory type.
pub(crate) const ALL_TYPES: u32 = 0b111;

assert_impl_all!(MockDevice: Send, Sync);
assert_impl_all!(MockResource: Send, Sync);
