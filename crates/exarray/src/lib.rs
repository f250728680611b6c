//! Growable on-disk extensible array
//!
//! An extensible array maps a dense `u64` index space onto a tree of
//! lazily materialized nodes kept in an [`exarray_cache::BlockCache`]:
//!
//! - **Header**: creation parameters, fill value and statistics, shared by
//!   every handle open on the same address
//! - **Index block**: the first few elements inline plus address slots
//! - **Super blocks**: one per larger tier, addressing that tier's data blocks
//! - **Data blocks**: element storage, created on first write into their range
//! - **Pages**: independently created slices of data blocks above the page
//!   threshold
//!
//! Reads of indices whose storage was never written return the fill value.
//!
//! # Example
//!
//! ```
//! use exarray::{ArrayCache, CreateParams, ExtensibleArray};
//! use exarray_cache::{CacheConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(ArrayCache::new(Arc::new(MemoryStore::new()), CacheConfig::default())?);
//! let array = ExtensibleArray::create(&cache, CreateParams::new(4).with_fill_value(u32::MAX))?;
//!
//! array.set(100, &7u32.to_le_bytes())?;
//! let mut out = [0u8; 4];
//! array.get(100, &mut out)?;
//! assert_eq!(u32::from_le_bytes(out), 7);
//! array.get(99, &mut out)?;
//! assert_eq!(u32::from_le_bytes(out), u32::MAX);
//! assert_eq!(array.nelmts()?, 101);
//! array.close()?;
//! # Ok::<(), exarray::ArrayError>(())
//! ```

#![warn(missing_docs)]

pub mod array;
mod delete;
pub mod fill;
pub mod node;
pub mod params;
mod read;
pub mod shared;
pub mod stats;
pub mod tier;
mod write;

pub use array::{ExtensibleArray, IterControl, IterStatus, NodeLocation};
pub use fill::FillValue;
pub use node::{ArrayNode, LoadRequest, NodeKind};
pub use params::{CreateParams, MAX_NELMTS_BITS};
pub use shared::{ArrayLayout, HeaderState, SharedHeader};
pub use stats::ArrayStats;
pub use tier::{Location, TierTable};

use exarray_cache::{Addr, BlockCache, CacheError};
use thiserror::Error;

/// Block cache specialized to extensible array nodes
pub type ArrayCache = BlockCache<ArrayNode>;

/// Errors that can occur during extensible array operations
#[derive(Debug, Error)]
pub enum ArrayError {
    /// Failure reported by the block cache or its store
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Bad argument; nothing was modified
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Creation parameters failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A cached node had a different kind than its parent promised
    #[error("Node at {addr} is a {found}, expected {expected}")]
    WrongNodeKind {
        /// Node address
        addr: Addr,
        /// Kind the caller expected
        expected: NodeKind,
        /// Kind actually resident
        found: NodeKind,
    },
}

impl ArrayError {
    /// Whether this error reports damaged on-disk state
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Cache(e) if e.is_corruption())
    }

    /// Whether the backing store ran out of space
    pub const fn is_out_of_space(&self) -> bool {
        matches!(self, Self::Cache(CacheError::OutOfSpace { .. }))
    }
}

/// Result type for extensible array operations
pub type Result<T> = std::result::Result<T, ArrayError>;
