//! Array statistics

use crate::node::HeaderStats;
use crate::shared::ArrayLayout;
use serde::{Deserialize, Serialize};

/// Node counts and stored sizes of one array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayStats {
    /// Stored bytes of the header
    pub hdr_size: u64,
    /// Index blocks (0 or 1)
    pub nindex_blks: u64,
    /// Stored bytes of the index block
    pub index_blk_size: u64,
    /// Super blocks created
    pub nsuper_blks: u64,
    /// Stored bytes of all super blocks
    pub super_blk_size: u64,
    /// Data blocks created
    pub ndata_blks: u64,
    /// Stored bytes of all data blocks, pages included
    pub data_blk_size: u64,
    /// One past the highest index ever written
    pub max_idx_set: u64,
}

impl ArrayStats {
    pub(crate) fn new(layout: &ArrayLayout, header: &HeaderStats, has_iblock: bool) -> Self {
        let nindex_blks = u64::from(has_iblock);
        Self {
            hdr_size: layout.header_extent(),
            nindex_blks,
            index_blk_size: nindex_blks * layout.iblock_extent(),
            nsuper_blks: header.nsuper_blks,
            super_blk_size: header.super_blk_size,
            ndata_blks: header.ndata_blks,
            data_blk_size: header.data_blk_size,
            max_idx_set: header.max_idx_set,
        }
    }

    /// Total stored bytes of every structural node
    pub fn total_size(&self) -> u64 {
        self.hdr_size + self.index_blk_size + self.super_blk_size + self.data_blk_size
    }
}
