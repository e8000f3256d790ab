//! # Allocator Configuration

/// 64 MiB
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Blocks per heap targeted by the block size heuristic.
pub const DEFAULT_BLOCK_SIZE_DIVISOR: u64 = 16;

/// Device memory allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Map host-visible memory once at creation and keep it mapped
    pub persistent_mapping: bool,
    /// Upper bound of a pooled block
    pub max_block_size: u64,
    /// Block size is `heap_size / block_size_divisor`, capped at `max_block_size`
    pub block_size_divisor: u64,
}

impl AllocatorConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            persistent_mapping: false,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            block_size_divisor: DEFAULT_BLOCK_SIZE_DIVISOR,
        }
    }

    /// Enable or disable persistent mapping
    pub const fn with_persistent_mapping(mut self, enabled: bool) -> Self {
        self.persistent_mapping = enabled;
        self
    }

    /// Set the block size cap
    pub const fn with_max_block_size(mut self, size: u64) -> Self {
        self.max_block_size = size;
        self
    }

    /// Set the heap divisor
    pub const fn with_block_size_divisor(mut self, divisor: u64) -> Self {
        self.block_size_divisor = divisor;
        self
    }

    /// Block size for a heap of `heap_size` bytes
    pub const fn block_size_for_heap(&self, heap_size: u64) -> u64 {
        let divisor = if self.block_size_divisor == 0 {
            1
        } else {
            self.block_size_divisor
        };
        let size = heap_size / divisor;
        if size < self.max_block_size {
            size
        } else {
            self.max_block_size
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
