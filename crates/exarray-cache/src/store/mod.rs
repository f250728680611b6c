//! Backing block stores.
//!
//! A store is a flat, byte-addressed space with an allocator. The cache only
//! ever reads and writes whole images at addresses the store handed out.
//!
//! - [`MemoryStore`]: shared in-memory buffer, optional capacity limit
//! - [`FileStore`]: single file, grows at the end

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::addr::Addr;
use crate::error::{CacheError, CacheResult};
use std::collections::BTreeMap;
use std::fmt;

/// Byte-addressed storage with space management.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Reserve `len` bytes and return their address.
    fn allocate(&self, len: u64) -> CacheResult<Addr>;

    /// Return `len` bytes at `addr` to the free space.
    fn free(&self, addr: Addr, len: u64) -> CacheResult<()>;

    /// Read exactly `buf.len()` bytes from `addr`.
    fn read_at(&self, addr: Addr, buf: &mut [u8]) -> CacheResult<()>;

    /// Write all of `data` at `addr`.
    fn write_at(&self, addr: Addr, data: &[u8]) -> CacheResult<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> CacheResult<()>;

    /// One past the highest allocated byte.
    fn end_of_allocation(&self) -> u64;
}

/// First-fit free-space tracker shared by the store implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct FreeSpace {
    /// End of allocation
    eoa: u64,
    /// Free extents below `eoa`, start -> length
    extents: BTreeMap<u64, u64>,
    /// Hard limit on `eoa`
    limit: Option<u64>,
}

impl FreeSpace {
    pub(crate) fn new(eoa: u64, limit: Option<u64>) -> Self {
        Self {
            eoa,
            extents: BTreeMap::new(),
            limit,
        }
    }

    pub(crate) const fn eoa(&self) -> u64 {
        self.eoa
    }

    pub(crate) fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    pub(crate) fn allocate(&mut self, len: u64) -> CacheResult<Addr> {
        let len = len.max(1);

        let fit = self
            .extents
            .iter()
            .find(|&(_, &extent)| extent >= len)
            .map(|(&start, &extent)| (start, extent));
        if let Some((start, extent)) = fit {
            self.extents.remove(&start);
            if extent > len {
                self.extents.insert(start + len, extent - len);
            }
            return Ok(Addr::new(start));
        }

        let end = self.eoa.checked_add(len).ok_or(CacheError::OutOfSpace {
            requested: len,
            available: u64::MAX - self.eoa,
        })?;
        if let Some(limit) = self.limit {
            if end > limit {
                return Err(CacheError::OutOfSpace {
                    requested: len,
                    available: limit.saturating_sub(self.eoa),
                });
            }
        }
        let addr = Addr::new(self.eoa);
        self.eoa = end;
        Ok(addr)
    }

    pub(crate) fn free(&mut self, addr: Addr, len: u64) -> CacheResult<()> {
        let mut start = addr.get();
        let mut len = len.max(1);
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.eoa)
            .ok_or(CacheError::OutOfBounds {
                addr,
                len,
                eoa: self.eoa,
            })?;

        if let Some((&prev, &prev_len)) = self.extents.range(..start).next_back() {
            if prev + prev_len > start {
                return Err(CacheError::OutOfBounds {
                    addr,
                    len,
                    eoa: self.eoa,
                });
            }
            if prev + prev_len == start {
                self.extents.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.extents.remove(&end) {
            len += next_len;
        }

        if start + len == self.eoa {
            self.eoa = start;
        } else {
            self.extents.insert(start, len);
        }
        Ok(())
    }

    pub(crate) fn check_range(&self, addr: Addr, len: usize) -> CacheResult<()> {
        let len = len as u64;
        match addr.get().checked_add(len) {
            Some(end) if end <= self.eoa => Ok(()),
            _ => Err(CacheError::OutOfBounds {
                addr,
                len,
                eoa: self.eoa,
            }),
        }
    }
}
