//! Checksummed block cache with flush-dependency ordering
//!
//! This crate provides the metadata cache that on-disk index structures are
//! built on. Clients describe their node kinds through [`CacheEntry`] and
//! address them by their byte offset in a [`BlockStore`].
//!
//! # Components
//!
//! - **Block stores**: [`MemoryStore`] and [`FileStore`] with first-fit reuse
//!   of freed space
//! - **Integrity**: every stored image carries a trailing Jenkins lookup3
//!   checksum, verified on load
//! - **Protection**: shared or exclusive latches on resident entries via
//!   [`Protected`]
//! - **Flush dependencies**: a DAG of parent-before-child write constraints
//!   honored by flush and eviction
//! - **Shared state**: an address-keyed [`SharedArena`] for per-structure
//!   objects that entries report their lifecycle to
//!
//! # Example
//!
//! ```
//! use exarray_cache::{checksum, Addr, BlockStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let image = checksum::seal(b"node payload".to_vec());
//! let addr = store.allocate(image.len() as u64)?;
//! store.write_at(addr, &image)?;
//!
//! let mut read_back = vec![0u8; image.len()];
//! store.read_at(addr, &mut read_back)?;
//! assert_eq!(checksum::verify(addr, &read_back)?, b"node payload");
//! assert_eq!(addr, Addr::new(0));
//! # Ok::<(), exarray_cache::CacheError>(())
//! ```

#![warn(missing_docs)]

pub mod addr;
pub mod arena;
pub mod buffer;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod entry;
pub mod error;
pub mod flush;
pub mod stats;
pub mod store;

pub use addr::{Addr, UNDEFINED_ADDR};
pub use arena::SharedArena;
pub use cache::{BlockCache, Protected};
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryState, Notify, SharedState};
pub use error::{CacheError, CacheResult};
pub use flush::FlushGraph;
pub use stats::CacheStats;
pub use store::{BlockStore, FileStore, MemoryStore};
