//! Error types for block cache operations

use crate::addr::Addr;
use thiserror::Error;

/// Errors that can occur during cache and block store operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error from the backing store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing store cannot satisfy an allocation
    #[error("Out of space: requested {requested} bytes, {available} available")]
    OutOfSpace {
        /// Bytes requested
        requested: u64,
        /// Bytes still available in the store
        available: u64,
    },

    /// A loaded image failed its integrity check or could not be decoded
    #[error("Corruption detected at {addr}: {reason}")]
    Corruption {
        /// Address of the damaged image
        addr: Addr,
        /// What failed
        reason: String,
    },

    /// Access outside the allocated region of the store
    #[error("Address range {addr}+{len} is outside the store (end of allocation {eoa})")]
    OutOfBounds {
        /// Start of the access
        addr: Addr,
        /// Length of the access
        len: u64,
        /// Current end of allocation
        eoa: u64,
    },

    /// The entry is not resident in the cache
    #[error("Entry {0} is not resident")]
    NotResident(Addr),

    /// An entry is already resident at this address
    #[error("Entry {0} is already resident")]
    AlreadyResident(Addr),

    /// A mutation was attempted through a read-only protect
    #[error("Entry {0} was protected read-only")]
    ReadOnly(Addr),

    /// The entry is pinned or protected and cannot be evicted or removed
    #[error("Entry {0} is pinned")]
    Pinned(Addr),

    /// Unpin without a matching pin
    #[error("Entry {0} is not pinned")]
    NotPinned(Addr),

    /// Flush dependency misuse (self edge, cycle, duplicate or missing edge)
    #[error("Flush dependency error: {0}")]
    Dependency(String),

    /// A child was about to be written while its parent was still dirty
    #[error("Flush order violated: {child} written before parent {parent}")]
    FlushOrder {
        /// Parent that is still dirty
        parent: Addr,
        /// Child being written
        child: Addr,
    },

    /// Invalid cache configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}

impl CacheError {
    /// Build a corruption error for `addr`
    pub fn corruption(addr: Addr, reason: impl Into<String>) -> Self {
        Self::Corruption {
            addr,
            reason: reason.into(),
        }
    }

    /// Whether this error reports damaged on-disk state
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    /// Whether this error reports exhausted store or memory space
    pub const fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }
}

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::corruption(Addr::new(0x40), "checksum mismatch");
        assert_eq!(
            err.to_string(),
            "Corruption detected at 0x40: checksum mismatch"
        );
        assert!(err.is_corruption());

        let err = CacheError::FlushOrder {
            parent: Addr::new(1),
            child: Addr::new(2),
        };
        assert!(!err.is_corruption());
        assert_eq!(
            err.to_string(),
            "Flush order violated: 0x2 written before parent 0x1"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: CacheError = io.into();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
