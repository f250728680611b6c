//! In-memory block store

use super::{BlockStore, FreeSpace};
use crate::addr::Addr;
use crate::buffer;
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Block store backed by a growable byte buffer.
///
/// Clones share the same buffer, so a store can be handed to a second cache
/// to simulate reopening a file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    bytes: Vec<u8>,
    space: FreeSpace,
}

impl MemoryStore {
    /// Create an empty, unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that refuses to grow past `limit` bytes
    pub fn with_limit(limit: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                bytes: Vec::new(),
                space: FreeSpace::new(0, Some(limit)),
            })),
        }
    }

    /// Change the growth limit. `None` removes it.
    pub fn set_limit(&self, limit: Option<u64>) {
        self.inner.lock().space.set_limit(limit);
    }

    /// Copy of the allocated bytes
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().bytes.clone()
    }
}

impl BlockStore for MemoryStore {
    fn allocate(&self, len: u64) -> CacheResult<Addr> {
        let mut inner = self.inner.lock();
        let addr = inner.space.allocate(len)?;
        let grown = usize::try_from(inner.space.eoa())
            .map_err(|_| CacheError::OutOfSpace {
                requested: len,
                available: 0,
            })
            .and_then(|eoa| buffer::grow(&mut inner.bytes, eoa));
        if let Err(e) = grown {
            inner.space.free(addr, len)?;
            return Err(e);
        }
        trace!("Allocated {} bytes at {}", len, addr);
        Ok(addr)
    }

    fn free(&self, addr: Addr, len: u64) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        inner.space.free(addr, len)?;
        let eoa = inner.space.eoa() as usize;
        inner.bytes.truncate(eoa);
        trace!("Freed {} bytes at {}", len, addr);
        Ok(())
    }

    fn read_at(&self, addr: Addr, buf: &mut [u8]) -> CacheResult<()> {
        let inner = self.inner.lock();
        inner.space.check_range(addr, buf.len())?;
        let start = addr.get() as usize;
        buf.copy_from_slice(&inner.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, addr: Addr, data: &[u8]) -> CacheResult<()> {
        let mut inner = self.inner.lock();
        inner.space.check_range(addr, data.len())?;
        let start = addr.get() as usize;
        inner.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sync(&self) -> CacheResult<()> {
        Ok(())
    }

    fn end_of_allocation(&self) -> u64 {
        self.inner.lock().space.eoa()
    }
}
