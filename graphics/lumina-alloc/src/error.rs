//! # Allocator Error Handling
//!
//! Errors fall into two classes:
//! - Resource exhaustion ([`Error::OutOfMemory`]): the device refused a
//!   dedicated or block allocation. Callers may recover (evict, retry).
//! - Contract violations (everything else): double free, unbalanced unmap,
//!   unsatisfiable flag requests. These are never retried internally.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Allocator result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Device memory allocator error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The device refused to allocate memory
    OutOfMemory,
    /// No memory type matches the type mask and requested property flags
    InvalidMemoryType,
    /// Invalid size, alignment or range
    InvalidArgument,
    /// Operation is not valid for the current state of the allocation
    InvalidOperation(OperationError),
    /// The native map call failed
    MappingFailed,
}

impl Error {
    /// Check if this is a resource exhaustion error
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of device memory"),
            Self::InvalidMemoryType => write!(f, "no compatible memory type"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidOperation(e) => write!(f, "invalid operation: {}", e),
            Self::MappingFailed => write!(f, "memory mapping failed"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// State errors reported through [`Error::InvalidOperation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationError {
    /// Allocation was already freed
    DoubleFree,
    /// Allocation belongs to another allocator
    ForeignAllocation,
    /// Dedicated memory freed while still mapped
    StillMapped,
    /// Memory type has no host-visible property
    NotHostVisible,
    /// Range operation on memory that is not mapped
    NotMapped,
    /// Unmap without a matching map
    UnbalancedUnmap,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleFree => write!(f, "allocation already freed"),
            Self::ForeignAllocation => write!(f, "allocation owned by another allocator"),
            Self::StillMapped => write!(f, "memory is still mapped"),
            Self::NotHostVisible => write!(f, "memory type is not host visible"),
            Self::NotMapped => write!(f, "memory is not mapped"),
            Self::UnbalancedUnmap => write!(f, "unmap without matching map"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<OperationError> for Error {
    fn from(e: OperationError) -> Self {
        Error::InvalidOperation(e)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
