//! File-backed block store

use super::{BlockStore, FreeSpace};
use crate::addr::Addr;
use crate::error::CacheResult;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Block store over a single file.
///
/// New space is appended at the end of the file. Freed extents are reused
/// for the lifetime of the store but are not recorded in the file, so a
/// reopened store only grows.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: Mutex<File>,
    space: Mutex<FreeSpace>,
}

impl FileStore {
    /// Create (or truncate) the file at `path`
    pub fn create(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!("Created block store at {:?}", path);
        Ok(Self {
            path,
            file: Mutex::new(file),
            space: Mutex::new(FreeSpace::new(0, None)),
        })
    }

    /// Open an existing file at `path`
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        debug!("Opened block store at {:?} ({} bytes)", path, len);
        Ok(Self {
            path,
            file: Mutex::new(file),
            space: Mutex::new(FreeSpace::new(len, None)),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileStore {
    fn allocate(&self, len: u64) -> CacheResult<Addr> {
        let mut space = self.space.lock();
        let before = space.eoa();
        let addr = space.allocate(len)?;
        if space.eoa() > before {
            if let Err(e) = self.file.lock().set_len(space.eoa()) {
                space.free(addr, len)?;
                return Err(e.into());
            }
        }
        trace!("Allocated {} bytes at {} in {:?}", len, addr, self.path);
        Ok(addr)
    }

    fn free(&self, addr: Addr, len: u64) -> CacheResult<()> {
        let mut space = self.space.lock();
        space.free(addr, len)?;
        let file = self.file.lock();
        if file.metadata()?.len() > space.eoa() {
            file.set_len(space.eoa())?;
        }
        trace!("Freed {} bytes at {} in {:?}", len, addr, self.path);
        Ok(())
    }

    fn read_at(&self, addr: Addr, buf: &mut [u8]) -> CacheResult<()> {
        self.space.lock().check_range(addr, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(addr.get()))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, addr: Addr, data: &[u8]) -> CacheResult<()> {
        self.space.lock().check_range(addr, data.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(addr.get()))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> CacheResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    fn end_of_allocation(&self) -> u64 {
        self.space.lock().eoa()
    }
}
