//! State shared by every handle on one array.
//!
//! [`SharedHeader`] lives in the block cache's arena keyed by the header
//! address, so a second `open` of the same address finds the first handle's
//! object instead of building a duplicate. Two counts keep it alive: open
//! handles, and resident child nodes reporting in through cache
//! notifications.

use crate::fill::FillValue;
use crate::node::{data_block, header, index_block, page, super_block};
use crate::params::CreateParams;
use crate::tier::TierTable;
use crate::{ArrayError, Result};
use exarray_cache::{Addr, SharedState, checksum};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Immutable geometry of an array: parameters, tiers and image sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLayout {
    params: CreateParams,
    tiers: TierTable,
    fill: FillValue,
}

impl ArrayLayout {
    /// Validate `params` and derive the layout.
    pub fn new(mut params: CreateParams) -> Result<Self> {
        params.validate().map_err(ArrayError::InvalidConfiguration)?;
        let fill = params.fill();
        params.fill_value = Some(fill.clone());

        let tiers = TierTable::new(&params);
        if let Some(sblk) = (0..tiers.iblock_nsblks()).find(|&sblk| tiers.is_paged(sblk)) {
            return Err(ArrayError::InvalidConfiguration(format!(
                "data blocks of tier {sblk} hang off the index block but exceed the page size of {} elements",
                tiers.page_nelmts()
            )));
        }

        Ok(Self {
            params,
            tiers,
            fill,
        })
    }

    /// Creation parameters (fill value always present)
    pub fn params(&self) -> &CreateParams {
        &self.params
    }

    /// Tier table
    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Fill value
    pub fn fill(&self) -> &FillValue {
        &self.fill
    }

    /// Bytes per element
    pub fn element_size(&self) -> usize {
        self.params.element_size
    }

    /// Header payload length
    pub fn header_len(&self) -> usize {
        header::PREFIX_LEN + self.element_size()
    }

    /// Index block payload length
    pub fn iblock_len(&self) -> usize {
        index_block::PREFIX_LEN
            + self.tiers.idx_blk_elmts() * self.element_size()
            + 8 * (self.tiers.ndblk_addrs() + self.tiers.nsblk_addrs())
    }

    /// Bytes of page-initialized bitmap in a super block of tier `sblk`
    pub fn page_init_len(&self, sblk: usize) -> usize {
        let ndblks = self.tiers.info(sblk).ndblks as usize;
        (ndblks * self.tiers.npages(sblk)).div_ceil(8)
    }

    /// Super block payload length for tier `sblk`
    pub fn sblk_len(&self, sblk: usize) -> usize {
        super_block::PREFIX_LEN
            + self.page_init_len(sblk)
            + 8 * self.tiers.info(sblk).ndblks as usize
    }

    /// Elements held by the data block image itself (0 when paged)
    pub fn dblk_image_nelmts(&self, sblk: usize) -> usize {
        if self.tiers.is_paged(sblk) {
            0
        } else {
            self.tiers.info(sblk).dblk_nelmts as usize
        }
    }

    /// Data block payload length for tier `sblk`
    pub fn dblk_len(&self, sblk: usize) -> usize {
        data_block::PREFIX_LEN + self.dblk_image_nelmts(sblk) * self.element_size()
    }

    /// Page payload length
    pub fn page_len(&self) -> usize {
        page::payload_len(self.tiers.page_nelmts() as usize, self.element_size())
    }

    /// Stored bytes of the header
    pub fn header_extent(&self) -> u64 {
        checksum::stored_len(self.header_len()) as u64
    }

    /// Stored bytes of the index block
    pub fn iblock_extent(&self) -> u64 {
        checksum::stored_len(self.iblock_len()) as u64
    }

    /// Stored bytes of a super block of tier `sblk`
    pub fn sblk_extent(&self, sblk: usize) -> u64 {
        checksum::stored_len(self.sblk_len(sblk)) as u64
    }

    /// Stored bytes of a data block of tier `sblk`, pages included
    pub fn dblk_extent(&self, sblk: usize) -> u64 {
        let pages = self.tiers.npages(sblk) as u64 * checksum::stored_len(self.page_len()) as u64;
        checksum::stored_len(self.dblk_len(sblk)) as u64 + pages
    }

    /// Address of page `page` of the data block at `dblk_addr`
    pub fn page_addr(&self, dblk_addr: Addr, sblk: usize, page: usize) -> Addr {
        let first = checksum::stored_len(self.dblk_len(sblk)) as u64;
        dblk_addr.offset(first + page as u64 * checksum::stored_len(self.page_len()) as u64)
    }
}

/// Lifecycle of an array's shared header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Open for use
    Active,
    /// Delete requested while handles were open; torn down on last close
    PendingDelete,
    /// Storage released
    Deleted,
}

impl HeaderState {
    /// Transition for a delete request
    #[must_use]
    pub const fn request_delete(self) -> Self {
        match self {
            Self::Active | Self::PendingDelete => Self::PendingDelete,
            Self::Deleted => Self::Deleted,
        }
    }

    /// Transition once storage is released
    #[must_use]
    pub const fn mark_deleted(self) -> Self {
        Self::Deleted
    }

    /// Whether new handles may be opened
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: HeaderState,
    /// Open handles
    file_refcount: usize,
    /// Resident child nodes
    open_refcount: usize,
}

/// Outcome of releasing a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Release {
    /// No handles remain
    pub last: bool,
    /// Deletion is pending
    pub pending_delete: bool,
}

/// Header state shared by every handle on one array.
#[derive(Debug)]
pub struct SharedHeader {
    addr: Addr,
    layout: Arc<ArrayLayout>,
    lifecycle: Mutex<Lifecycle>,
}

impl SharedHeader {
    /// Create an unreferenced shared header
    pub fn new(addr: Addr, layout: Arc<ArrayLayout>) -> Self {
        Self {
            addr,
            layout,
            lifecycle: Mutex::new(Lifecycle {
                state: HeaderState::Active,
                file_refcount: 0,
                open_refcount: 0,
            }),
        }
    }

    /// Header address
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Array layout
    pub fn layout(&self) -> &Arc<ArrayLayout> {
        &self.layout
    }

    /// Current lifecycle state
    pub fn state(&self) -> HeaderState {
        self.lifecycle.lock().state
    }

    /// Open handles
    pub fn open_handles(&self) -> usize {
        self.lifecycle.lock().file_refcount
    }

    /// Resident child nodes
    pub fn resident_nodes(&self) -> usize {
        self.lifecycle.lock().open_refcount
    }

    pub(crate) fn acquire_handle(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.state.is_active() {
            return Err(ArrayError::InvalidArgument(format!(
                "array at {} is {:?}",
                self.addr, lifecycle.state
            )));
        }
        lifecycle.file_refcount += 1;
        Ok(())
    }

    pub(crate) fn release_handle(&self) -> Release {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.file_refcount = lifecycle.file_refcount.saturating_sub(1);
        Release {
            last: lifecycle.file_refcount == 0,
            pending_delete: lifecycle.state == HeaderState::PendingDelete,
        }
    }

    /// Returns `false` if deletion was already requested.
    pub(crate) fn request_delete(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let fresh = lifecycle.state == HeaderState::Active;
        lifecycle.state = lifecycle.state.request_delete();
        if fresh {
            debug!(
                "Array at {} pending delete ({} handles open)",
                self.addr, lifecycle.file_refcount
            );
        }
        fresh
    }

    pub(crate) fn mark_deleted(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = lifecycle.state.mark_deleted();
    }

    pub(crate) fn add_dependent(&self) {
        self.lifecycle.lock().open_refcount += 1;
    }

    pub(crate) fn remove_dependent(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.open_refcount == 0 {
            warn!("Array at {} released more child nodes than it held", self.addr);
            return;
        }
        lifecycle.open_refcount -= 1;
    }
}

impl SharedState for SharedHeader {
    /// A header pending deletion stays tracked until its teardown finishes.
    fn is_idle(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.file_refcount == 0
            && lifecycle.open_refcount == 0
            && lifecycle.state != HeaderState::PendingDelete
    }
}
