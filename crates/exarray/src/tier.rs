//! Tier table: the mapping from logical index to structural node.
//!
//! Indices below `idx_blk_elmts` live in the index block. The rest are split
//! into super block tiers. Tier `u` owns `2^(u/2)` data blocks of
//! `2^((u+1)/2) * data_blk_min_elmts` elements each, so tier `u` starts at
//! `data_blk_min_elmts * (2^u - 1)` past the index block and the tiers cover
//! every index without gaps or overlap. The first tiers are small enough
//! that their data blocks are addressed straight from the index block.

use crate::params::CreateParams;
use crate::{ArrayError, Result};

/// Shape of one super block tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlockInfo {
    /// Data blocks in the tier
    pub ndblks: u64,
    /// Elements per data block
    pub dblk_nelmts: u64,
    /// First index of the tier, relative to the end of the index block
    pub start_idx: u64,
    /// Ordinal of the tier's first data block across all tiers
    pub start_dblk: u64,
}

/// Where an element lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Stored directly in the index block
    IndexBlock {
        /// Element offset in the index block
        elmt: usize,
    },
    /// Stored in a data block
    DataBlock {
        /// Tier (super block number)
        sblk: usize,
        /// Data block within the tier
        dblk: usize,
        /// Element offset within the data block
        elmt: u64,
    },
}

/// Precomputed tier table for one set of creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    sblks: Vec<SuperBlockInfo>,
    idx_blk_elmts: u64,
    data_blk_min_elmts: u64,
    iblock_nsblks: usize,
    ndblk_addrs: usize,
    max_nelmts: u64,
    page_nelmts: u64,
}

impl TierTable {
    /// Build the table. `params` must already be validated.
    pub fn new(params: &CreateParams) -> Self {
        let min_elmts = u64::from(params.data_blk_min_elmts);
        let nsblks = 1 + usize::from(params.max_nelmts_bits) - min_elmts.ilog2() as usize;

        let mut sblks = Vec::with_capacity(nsblks);
        let mut start_idx = 0u64;
        let mut start_dblk = 0u64;
        for u in 0..nsblks {
            let ndblks = 1u64 << (u / 2);
            let dblk_nelmts = (1u64 << u.div_ceil(2)) * min_elmts;
            sblks.push(SuperBlockInfo {
                ndblks,
                dblk_nelmts,
                start_idx,
                start_dblk,
            });
            start_idx = start_idx.saturating_add(ndblks * dblk_nelmts);
            start_dblk += ndblks;
        }

        let iblock_nsblks =
            (2 * params.sup_blk_min_data_ptrs.ilog2() as usize).min(nsblks);
        let ndblk_addrs = sblks[..iblock_nsblks]
            .iter()
            .map(|info| info.ndblks as usize)
            .sum();

        Self {
            sblks,
            idx_blk_elmts: u64::from(params.idx_blk_elmts),
            data_blk_min_elmts: min_elmts,
            iblock_nsblks,
            ndblk_addrs,
            max_nelmts: 1u64 << params.max_nelmts_bits,
            page_nelmts: 1u64 << params.max_dblk_page_nelmts_bits,
        }
    }

    /// Number of super block tiers
    pub fn nsblks(&self) -> usize {
        self.sblks.len()
    }

    /// Shape of tier `sblk`
    pub fn info(&self, sblk: usize) -> &SuperBlockInfo {
        &self.sblks[sblk]
    }

    /// Every tier, smallest first
    pub fn tiers(&self) -> &[SuperBlockInfo] {
        &self.sblks
    }

    /// Elements stored directly in the index block
    pub fn idx_blk_elmts(&self) -> usize {
        self.idx_blk_elmts as usize
    }

    /// Tiers whose data blocks hang directly off the index block
    pub fn iblock_nsblks(&self) -> usize {
        self.iblock_nsblks
    }

    /// Data block address slots in the index block
    pub fn ndblk_addrs(&self) -> usize {
        self.ndblk_addrs
    }

    /// Super block address slots in the index block
    pub fn nsblk_addrs(&self) -> usize {
        self.sblks.len() - self.iblock_nsblks
    }

    /// Exclusive upper bound on indices
    pub fn max_nelmts(&self) -> u64 {
        self.max_nelmts
    }

    /// Elements per data block page
    pub fn page_nelmts(&self) -> u64 {
        self.page_nelmts
    }

    /// Whether tier `sblk` has its data blocks addressed from the index block
    pub fn is_direct(&self, sblk: usize) -> bool {
        sblk < self.iblock_nsblks
    }

    /// Index block slot of data block `dblk` in a direct tier
    pub fn direct_slot(&self, sblk: usize, dblk: usize) -> usize {
        self.sblks[sblk].start_dblk as usize + dblk
    }

    /// Index block slot of the super block for tier `sblk`
    pub fn sblk_slot(&self, sblk: usize) -> usize {
        sblk - self.iblock_nsblks
    }

    /// Whether data blocks of tier `sblk` are split into pages
    pub fn is_paged(&self, sblk: usize) -> bool {
        self.sblks[sblk].dblk_nelmts > self.page_nelmts
    }

    /// Pages per data block of tier `sblk` (0 if unpaged)
    pub fn npages(&self, sblk: usize) -> usize {
        if self.is_paged(sblk) {
            (self.sblks[sblk].dblk_nelmts / self.page_nelmts) as usize
        } else {
            0
        }
    }

    /// First array index of tier `sblk`
    pub fn sblk_offset(&self, sblk: usize) -> u64 {
        self.idx_blk_elmts + self.sblks[sblk].start_idx
    }

    /// First array index of data block `dblk` in tier `sblk`
    pub fn dblk_offset(&self, sblk: usize, dblk: usize) -> u64 {
        self.sblk_offset(sblk) + dblk as u64 * self.sblks[sblk].dblk_nelmts
    }

    /// Map `index` to its location. Pure: depends only on the table.
    pub fn locate(&self, index: u64) -> Result<Location> {
        if index >= self.max_nelmts {
            return Err(ArrayError::InvalidArgument(format!(
                "index {index} exceeds the array limit of {} elements",
                self.max_nelmts
            )));
        }
        if index < self.idx_blk_elmts {
            return Ok(Location::IndexBlock {
                elmt: index as usize,
            });
        }

        let rel = index - self.idx_blk_elmts;
        let sblk = (rel / self.data_blk_min_elmts + 1).ilog2() as usize;
        let info = self.sblks.get(sblk).ok_or_else(|| {
            ArrayError::InvalidArgument(format!("index {index} is beyond the last tier"))
        })?;
        let off = rel - info.start_idx;
        Ok(Location::DataBlock {
            sblk,
            dblk: (off / info.dblk_nelmts) as usize,
            elmt: off % info.dblk_nelmts,
        })
    }
}
