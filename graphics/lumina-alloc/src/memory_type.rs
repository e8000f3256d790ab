//! Memory Type Registry
//!
//! Built once from the device memory properties and read-only afterwards.

use alloc::vec::Vec;

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::types::{DeviceMemoryProperties, MemoryPropertyFlags};

// ============================================================================
// Memory Type
// ============================================================================

/// Memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Memory type index.
    pub index: u32,
    /// Heap index.
    pub heap_index: u32,
    /// Property flags.
    pub flags: MemoryPropertyFlags,
    /// Size of pooled blocks of this type.
    pub block_size: u64,
    /// Minimum alignment of every sub-allocation of this type.
    pub min_alignment: u64,
}

impl MemoryType {
    /// Check if host visible.
    pub fn is_host_visible(&self) -> bool {
        self.flags.is_host_visible()
    }

    /// Check if host coherent.
    pub fn is_host_coherent(&self) -> bool {
        self.flags.is_host_coherent()
    }

    /// Check compatibility with a type mask and required flags.
    pub fn is_compatible(&self, type_bits: u32, required: MemoryPropertyFlags) -> bool {
        self.index < u32::BITS
            && type_bits & (1 << self.index) != 0
            && self.flags.contains(required)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All memory types of the device.
#[derive(Debug, Clone)]
pub struct MemoryTypeRegistry {
    types: Vec<MemoryType>,
    non_coherent_atom_size: u64,
}

impl MemoryTypeRegistry {
    /// Build the registry.
    pub fn new(
        properties: &DeviceMemoryProperties,
        non_coherent_atom_size: u64,
        config: &AllocatorConfig,
    ) -> Self {
        let atom = non_coherent_atom_size.max(1);

        let types = properties
            .types
            .iter()
            .enumerate()
            .map(|(index, info)| {
                let heap_size = properties
                    .heaps
                    .get(info.heap_index as usize)
                    .map_or(0, |h| h.size);

                let min_alignment = if info.property_flags.is_non_coherent() {
                    atom
                } else {
                    1
                };

                MemoryType {
                    index: index as u32,
                    heap_index: info.heap_index,
                    flags: info.property_flags,
                    block_size: config.block_size_for_heap(heap_size),
                    min_alignment,
                }
            })
            .collect();

        Self {
            types,
            non_coherent_atom_size: atom,
        }
    }

    /// Get a memory type.
    pub fn get(&self, index: u32) -> Option<&MemoryType> {
        self.types.get(index as usize)
    }

    /// All memory types.
    pub fn types(&self) -> &[MemoryType] {
        &self.types
    }

    /// Non-coherent atom size.
    pub fn non_coherent_atom_size(&self) -> u64 {
        self.non_coherent_atom_size
    }

    /// First type in `type_bits` whose flags contain `required`.
    pub fn find(&self, type_bits: u32, required: MemoryPropertyFlags) -> Result<&MemoryType> {
        self.types
            .iter()
            .find(|t| t.is_compatible(type_bits, required))
            .ok_or(Error::InvalidMemoryType)
    }
}
