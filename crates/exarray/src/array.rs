//! Array handles.
//!
//! Every [`ExtensibleArray`] is one open handle on an array header. Handles
//! on the same address share one [`SharedHeader`] through the cache's arena
//! and see each other's writes immediately, since they resolve to the same
//! resident nodes. The header stays pinned in the cache while any handle is
//! open.

use crate::delete;
use crate::node::{ArrayNode, HeaderNode, LoadRequest, NodeKind};
use crate::params::CreateParams;
use crate::read;
use crate::shared::{ArrayLayout, SharedHeader};
use crate::stats::ArrayStats;
use crate::write;
use crate::{ArrayCache, Result};
use exarray_cache::Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback verdict during [`ExtensibleArray::iterate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterControl {
    /// Visit the next index
    Continue,
    /// Stop iterating
    Stop,
}

/// Outcome of [`ExtensibleArray::iterate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterStatus {
    /// Every index below `nelmts()` was visited
    Completed,
    /// The callback stopped at `index`
    Stopped {
        /// Last index visited
        index: u64,
    },
}

/// Structural node holding an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLocation {
    /// Kind of node
    pub kind: NodeKind,
    /// Node address
    pub addr: Addr,
}

/// An open handle on an extensible array
#[derive(Debug)]
pub struct ExtensibleArray {
    cache: Arc<ArrayCache>,
    shared: Arc<SharedHeader>,
    closed: bool,
}

impl ExtensibleArray {
    /// Create a new, empty array in `cache`'s store.
    pub fn create(cache: &Arc<ArrayCache>, params: CreateParams) -> Result<Self> {
        let layout = Arc::new(ArrayLayout::new(params)?);
        let extent = layout.header_extent();
        let addr = cache.store().allocate(extent)?;

        let header = ArrayNode::Header(HeaderNode::new(addr, &layout));
        if let Err(e) = cache.insert(addr, header) {
            abandon(cache, addr, extent);
            return Err(e.into());
        }

        let candidate = SharedHeader::new(addr, Arc::clone(&layout));
        let shared = match cache
            .shared()
            .acquire_or_insert(addr, candidate, SharedHeader::acquire_handle)
        {
            Ok(shared) => shared,
            Err(e) => {
                abandon(cache, addr, extent);
                return Err(e);
            }
        };
        // Pinned before the first write so the clean header stays resident
        let stored = cache.pin(addr).and_then(|()| {
            cache.flush_entry(addr).inspect_err(|_| {
                if let Err(e) = cache.unpin(addr) {
                    warn!("Could not unpin header at {}: {}", addr, e);
                }
            })
        });
        if let Err(e) = stored {
            shared.release_handle();
            cache.shared().remove(addr);
            abandon(cache, addr, extent);
            return Err(e.into());
        }

        info!(
            "Created array at {} ({} byte elements, up to 2^{} indices)",
            addr,
            layout.element_size(),
            layout.params().max_nelmts_bits
        );
        Ok(Self {
            cache: Arc::clone(cache),
            shared,
            closed: false,
        })
    }

    /// Open the array whose header is at `addr`.
    ///
    /// A second open of an address shares the first handle's header.
    pub fn open(cache: &Arc<ArrayCache>, addr: Addr) -> Result<Self> {
        let shared = match cache
            .shared()
            .acquire_existing(addr, SharedHeader::acquire_handle)
        {
            Some(shared) => shared?,
            None => {
                let header = cache.protect(addr, &LoadRequest::Header, true)?;
                let params = header.header()?.params().clone();
                cache.unprotect(header, false)?;

                let layout = Arc::new(ArrayLayout::new(params)?);
                cache.shared().acquire_or_insert(
                    addr,
                    SharedHeader::new(addr, layout),
                    SharedHeader::acquire_handle,
                )?
            }
        };

        if let Err(e) = pin_header(cache, addr) {
            shared.release_handle();
            cache.shared().release_if_idle(addr);
            return Err(e);
        }
        debug!("Opened array at {} ({} handles)", addr, shared.open_handles());
        Ok(Self {
            cache: Arc::clone(cache),
            shared,
            closed: false,
        })
    }

    /// Delete the array at `addr`.
    ///
    /// If other handles are open the deletion is deferred until the last of
    /// them closes. Deleting an array already pending deletion succeeds
    /// without doing anything.
    pub fn delete(cache: &Arc<ArrayCache>, addr: Addr) -> Result<()> {
        if cache
            .shared()
            .get(addr)
            .is_some_and(|shared| !shared.state().is_active())
        {
            debug!("Array at {} is already being deleted", addr);
            return Ok(());
        }

        let array = Self::open(cache, addr)?;
        if array.shared.request_delete() && array.shared.open_handles() > 1 {
            info!("Deferring delete of array at {} until its handles close", addr);
        }
        array.close()
    }

    /// Close this handle.
    ///
    /// The last close writes the array's dirty nodes to the store, or
    /// removes all of them if the array is pending deletion.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let addr = self.shared.addr();
        let unpinned = self.cache.unpin(addr);
        let release = self.shared.release_handle();
        if release.last && release.pending_delete {
            let result = delete::teardown(&self.cache, &self.shared);
            self.shared.mark_deleted();
            self.cache.shared().remove(addr);
            match &result {
                Ok(()) => info!("Deleted array at {}", addr),
                Err(e) => warn!("Delete of array at {} left nodes behind: {}", addr, e),
            }
            result?;
        } else if release.last {
            let flushed = self.cache.flush_owned(addr);
            if let Err(e) = &flushed {
                warn!("Flush of array at {} on close failed: {}", addr, e);
            }
            if self.cache.shared().release_if_idle(addr) {
                debug!("Released shared header of array at {}", addr);
            }
            flushed?;
        }
        unpinned?;
        Ok(())
    }

    /// Store `value` at `index`. `value` must be exactly one element.
    pub fn set(&self, index: u64, value: &[u8]) -> Result<()> {
        write::set(&self.cache, &self.shared, index, value)
    }

    /// Read the element at `index` into `out`; unwritten indices read as
    /// the fill value.
    pub fn get(&self, index: u64, out: &mut [u8]) -> Result<()> {
        read::get(&self.cache, &self.shared, index, out)
    }

    /// Visit indices `0..nelmts()` in order.
    pub fn iterate<F>(&self, mut visit: F) -> Result<IterStatus>
    where
        F: FnMut(u64, &[u8]) -> IterControl,
    {
        let nelmts = self.nelmts()?;
        let mut element = vec![0u8; self.shared.layout().element_size()];
        for index in 0..nelmts {
            self.get(index, &mut element)?;
            if visit(index, &element) == IterControl::Stop {
                return Ok(IterStatus::Stopped { index });
            }
        }
        Ok(IterStatus::Completed)
    }

    /// One past the highest index ever set
    pub fn nelmts(&self) -> Result<u64> {
        Ok(read::header_view(&self.cache, &self.shared)?.max_idx_set)
    }

    /// Header address
    pub fn address(&self) -> Addr {
        self.shared.addr()
    }

    /// Creation parameters, fill value included
    pub fn params(&self) -> &CreateParams {
        self.shared.layout().params()
    }

    /// Array geometry
    pub fn layout(&self) -> &Arc<ArrayLayout> {
        self.shared.layout()
    }

    /// Shared header state
    pub fn shared(&self) -> &Arc<SharedHeader> {
        &self.shared
    }

    /// The cache this handle works through
    pub fn cache(&self) -> &Arc<ArrayCache> {
        &self.cache
    }

    /// Node counts and sizes
    pub fn stats(&self) -> Result<ArrayStats> {
        let hdr = self.cache.protect(self.address(), &LoadRequest::Header, true)?;
        let stats = {
            let header = hdr.header()?;
            ArrayStats::new(self.shared.layout(), &header.stats, header.idx_blk_addr.is_some())
        };
        self.cache.unprotect(hdr, false)?;
        Ok(stats)
    }

    /// Write every dirty node in the cache, parents first.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()?;
        Ok(())
    }

    /// Order the header after `parent`: `parent` is written no later than
    /// the header.
    pub fn depend(&self, parent: Addr) -> Result<()> {
        self.cache.create_flush_dependency(parent, self.address())?;
        Ok(())
    }

    /// Remove an ordering added with [`depend`](Self::depend).
    pub fn undepend(&self, parent: Addr) -> Result<()> {
        self.cache.destroy_flush_dependency(parent, self.address())?;
        Ok(())
    }

    /// Node holding `index`, if it has been created
    pub fn node_location(&self, index: u64) -> Result<Option<NodeLocation>> {
        let found = read::locate_node(&self.cache, &self.shared, index)?;
        Ok(found.map(|(kind, addr)| NodeLocation { kind, addr }))
    }
}

impl Drop for ExtensibleArray {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!("Closing array at {} on drop failed: {}", self.shared.addr(), e);
        }
    }
}

fn pin_header(cache: &ArrayCache, addr: Addr) -> Result<()> {
    let header = cache.protect(addr, &LoadRequest::Header, true)?;
    header.header()?;
    cache.pin(addr)?;
    cache.unprotect(header, false)?;
    Ok(())
}

/// Undo a partially created header.
fn abandon(cache: &ArrayCache, addr: Addr, extent: u64) {
    if cache.contains(addr) {
        if let Err(e) = cache.remove(addr) {
            warn!("Could not discard header at {}: {}", addr, e);
        }
    }
    if let Err(e) = cache.store().free(addr, extent) {
        warn!("Could not free header space at {}: {}", addr, e);
    }
}
