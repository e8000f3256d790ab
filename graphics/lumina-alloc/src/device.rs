//! # Native Device Boundary
//!
//! The allocator never talks to the graphics API directly. Everything it
//! needs from the device goes through [`MemoryDevice`]: memory property
//! queries, raw allocate/free, binding, and map/unmap/flush/invalidate.
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │   MemoryAllocator    │ ─────▶ │    MemoryDevice      │
//! │ (types, pools, maps) │        │ (native API calls)   │
//! └──────────────────────┘        └──────────────────────┘
//! ```

use core::ptr::NonNull;

use crate::error::Result;
use crate::types::{DeviceMemoryProperties, MappedMemoryRange, RawDeviceMemory, ResourceRequirements};

/// Resource a dedicated allocation is tagged with.
#[derive(Debug)]
pub enum DedicatedResource<'a, B, I> {
    /// Dedicated to a buffer.
    Buffer(&'a B),
    /// Dedicated to an image.
    Image(&'a I),
}

impl<B, I> Clone for DedicatedResource<'_, B, I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B, I> Copy for DedicatedResource<'_, B, I> {}

/// Native device operations used by the allocator.
///
/// Implementations report native out-of-memory as
/// [`Error::OutOfMemory`](crate::Error::OutOfMemory) so the allocator can
/// fall back from a preferred dedicated allocation to a pool.
pub trait MemoryDevice {
    /// Native buffer type.
    type Buffer;
    /// Native image type.
    type Image;

    /// Query heaps and memory types.
    fn memory_properties(&self) -> DeviceMemoryProperties;

    /// Alignment of flush/invalidate ranges for non-coherent memory.
    fn non_coherent_atom_size(&self) -> u64;

    /// Memory requirements of a buffer.
    fn buffer_requirements(&self, buffer: &Self::Buffer) -> ResourceRequirements;

    /// Memory requirements of an image.
    fn image_requirements(&self, image: &Self::Image) -> ResourceRequirements;

    /// Allocate `size` bytes of memory type `memory_type`.
    fn allocate_memory(
        &self,
        memory_type: u32,
        size: u64,
        dedicated: Option<DedicatedResource<'_, Self::Buffer, Self::Image>>,
    ) -> Result<RawDeviceMemory>;

    /// Release a memory object.
    fn free_memory(&self, memory: RawDeviceMemory);

    /// Bind a buffer to `memory` at `offset`.
    fn bind_buffer_memory(
        &self,
        buffer: &Self::Buffer,
        memory: RawDeviceMemory,
        offset: u64,
    ) -> Result<()>;

    /// Bind an image to `memory` at `offset`.
    fn bind_image_memory(
        &self,
        image: &Self::Image,
        memory: RawDeviceMemory,
        offset: u64,
    ) -> Result<()>;

    /// Map the whole memory object, returning its base host pointer.
    fn map_memory(&self, memory: RawDeviceMemory, size: u64) -> Result<NonNull<u8>>;

    /// Unmap a memory object.
    fn unmap_memory(&self, memory: RawDeviceMemory);

    /// Make host writes in `range` visible to the device.
    fn flush_mapped_range(&self, range: MappedMemoryRange) -> Result<()>;

    /// Make device writes in `range` visible to the host.
    fn invalidate_mapped_range(&self, range: MappedMemoryRange) -> Result<()>;
}

impl<T: MemoryDevice + ?Sized> MemoryDevice for &T {
    type Buffer = T::Buffer;
    type Image = T::Image;

    fn memory_properties(&self) -> DeviceMemoryProperties {
        (**self).memory_properties()
    }

    fn non_coherent_atom_size(&self) -> u64 {
        (**self).non_coherent_atom_size()
    }

    fn buffer_requirements(&self, buffer: &Self::Buffer) -> ResourceRequirements {
        (**self).buffer_requirements(buffer)
    }

    fn image_requirements(&self, image: &Self::Image) -> ResourceRequirements {
        (**self).image_requirements(image)
    }

    fn allocate_memory(
        &self,
        memory_type: u32,
        size: u64,
        dedicated: Option<DedicatedResource<'_, Self::Buffer, Self::Image>>,
    ) -> Result<RawDeviceMemory> {
        (**self).allocate_memory(memory_type, size, dedicated)
    }

    fn free_memory(&self, memory: RawDeviceMemory) {
        (**self).free_memory(memory)
    }

    fn bind_buffer_memory(
        &self,
        buffer: &Self::Buffer,
        memory: RawDeviceMemory,
        offset: u64,
    ) -> Result<()> {
        (**self).bind_buffer_memory(buffer, memory, offset)
    }

    fn bind_image_memory(
        &self,
        image: &Self::Image,
        memory: RawDeviceMemory,
        offset: u64,
    ) -> Result<()> {
        (**self).bind_image_memory(image, memory, offset)
    }

    fn map_memory(&self, memory: RawDeviceMemory, size: u64) -> Result<NonNull<u8>> {
        (**self).map_memory(memory, size)
    }

    fn unmap_memory(&self, memory: RawDeviceMemory) {
        (**self).unmap_memory(memory)
    }

    fn flush_mapped_range(&self, range: MappedMemoryRange) -> Result<()> {
        (**self).flush_mapped_range(range)
    }

    fn invalidate_mapped_range(&self, range: MappedMemoryRange) -> Result<()> {
        (**self).invalidate_mapped_range(range)
    }
}
