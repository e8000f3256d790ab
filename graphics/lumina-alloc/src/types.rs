//! # Device Memory Types
//!
//! Value types exchanged with the native device: property flags, memory
//! properties, resource requirements and raw handles.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

/// Sentinel size meaning "up to the end of the allocation".
pub const WHOLE_SIZE: u64 = u64::MAX;

// ============================================================================
// Property Flags
// ============================================================================

bitflags! {
    /// Memory property flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Device local memory.
        const DEVICE_LOCAL = 1 << 0;
        /// Host visible memory.
        const HOST_VISIBLE = 1 << 1;
        /// Host coherent memory.
        const HOST_COHERENT = 1 << 2;
        /// Host cached memory.
        const HOST_CACHED = 1 << 3;
        /// Lazily allocated.
        const LAZILY_ALLOCATED = 1 << 4;
        /// Protected memory.
        const PROTECTED = 1 << 5;
    }
}

impl Default for MemoryPropertyFlags {
    fn default() -> Self {
        MemoryPropertyFlags::empty()
    }
}

impl MemoryPropertyFlags {
    /// Check if host visible.
    pub fn is_host_visible(&self) -> bool {
        self.contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Check if host coherent.
    pub fn is_host_coherent(&self) -> bool {
        self.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Host visible but needs explicit flush/invalidate.
    pub fn is_non_coherent(&self) -> bool {
        self.is_host_visible() && !self.is_host_coherent()
    }
}

// ============================================================================
// Memory Properties
// ============================================================================

/// A device memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    /// Heap size in bytes.
    pub size: u64,
    /// Device local heap.
    pub device_local: bool,
}

/// A device memory type as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    /// Property flags.
    pub property_flags: MemoryPropertyFlags,
    /// Index of the heap backing this type.
    pub heap_index: u32,
}

/// Device memory properties.
#[derive(Debug, Clone, Default)]
pub struct DeviceMemoryProperties {
    /// Memory heaps.
    pub heaps: Vec<MemoryHeap>,
    /// Memory types.
    pub types: Vec<MemoryTypeInfo>,
}

// ============================================================================
// Resource Requirements
// ============================================================================

/// Size, alignment and type compatibility of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Required size in bytes.
    pub size: u64,
    /// Required alignment in bytes.
    pub alignment: u64,
    /// Bit `i` set if memory type `i` can back the resource.
    pub memory_type_bits: u32,
}

/// Dedicated allocation preference of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DedicatedRequirements {
    /// The resource performs better in its own allocation.
    pub prefers_dedicated: bool,
    /// The resource must be in its own allocation.
    pub requires_dedicated: bool,
}

impl DedicatedRequirements {
    /// Both preferred and required.
    pub const fn required() -> Self {
        Self {
            prefers_dedicated: true,
            requires_dedicated: true,
        }
    }

    /// Preferred, not required.
    pub const fn preferred() -> Self {
        Self {
            prefers_dedicated: true,
            requires_dedicated: false,
        }
    }
}

/// Full per-resource memory requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Size/alignment/type mask.
    pub memory: MemoryRequirements,
    /// Dedicated allocation preference.
    pub dedicated: DedicatedRequirements,
}

/// Image tiling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageTiling {
    /// Implementation defined (optimal) layout.
    #[default]
    Optimal,
    /// Row-major linear layout.
    Linear,
}

impl ImageTiling {
    /// Whether resources with this tiling are linear.
    pub const fn is_linear(&self) -> bool {
        matches!(self, ImageTiling::Linear)
    }
}

// ============================================================================
// Raw Handles
// ============================================================================

/// Opaque native device memory handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RawDeviceMemory(pub u64);

impl RawDeviceMemory {
    /// Null handle.
    pub const NULL: Self = Self(0);

    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Is null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RawDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawDeviceMemory(0x{:x})", self.0)
    }
}

/// A range of mapped device memory passed to flush/invalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedMemoryRange {
    /// Memory object.
    pub memory: RawDeviceMemory,
    /// Offset from the start of the memory object.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

// ============================================================================
// Alignment
// ============================================================================

/// Align `value` up to `alignment` (any non-zero alignment).
///
/// `None` if the result does not fit in a `u64`.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        Some(value)
    } else if alignment.is_power_of_two() {
        match value.checked_add(alignment - 1) {
            Some(v) => Some(v & !(alignment - 1)),
            None => None,
        }
    } else {
        value.div_ceil(alignment).checked_mul(alignment)
    }
}

/// Align `value` down to `alignment` (any non-zero alignment).
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else if alignment.is_power_of_two() {
        value & !(alignment - 1)
    } else {
        value - value % alignment
    }
}

/// Smallest alignment satisfying both `a` and `b`.
///
/// Powers of two combine to their maximum; anything else to the least
/// common multiple, `None` if that overflows.
pub const fn combine_alignment(a: u64, b: u64) -> Option<u64> {
    let a = if a == 0 { 1 } else { a };
    let b = if b == 0 { 1 } else { b };
    if a.is_power_of_two() && b.is_power_of_two() {
        Some(if a > b { a } else { b })
    } else {
        (a / gcd(a, b)).checked_mul(b)
    }
}

const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
