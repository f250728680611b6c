//! Super block node: data block addresses for one tier, plus a bitmap of
//! initialized pages when the tier's data blocks are paged.

use super::{
    FORMAT_VERSION, NodeKind, addrs_from_raw, addrs_to_raw, append_cursor, check_block_off,
    check_prefix, decode_error, encode_error,
};
use crate::Result;
use crate::shared::ArrayLayout;
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use exarray_cache::{Addr, CacheResult, buffer};

/// Payload bytes before the page bitmap
pub const PREFIX_LEN: usize = 21;

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"EASB")]
#[br(import(page_init_len: usize, ndblks: usize))]
struct SuperBlockImage {
    version: u8,
    hdr_addr: u64,
    block_off: u64,
    #[br(count = page_init_len)]
    page_init: Vec<u8>,
    #[br(count = ndblks)]
    dblk_addrs: Vec<u64>,
}

/// Super block as it lives in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub(crate) addr: Addr,
    pub(crate) hdr_addr: Addr,
    pub(crate) parent: Addr,
    sblk: usize,
    block_off: u64,
    npages: usize,
    page_init: Vec<u8>,
    /// Data blocks of the tier
    pub dblk_addrs: Vec<Option<Addr>>,
}

impl SuperBlock {
    /// Fresh super block for tier `sblk` under the index block at `parent`
    pub fn new(
        addr: Addr,
        hdr_addr: Addr,
        parent: Addr,
        sblk: usize,
        layout: &ArrayLayout,
    ) -> Result<Self> {
        let tiers = layout.tiers();
        Ok(Self {
            addr,
            hdr_addr,
            parent,
            sblk,
            block_off: tiers.sblk_offset(sblk),
            npages: tiers.npages(sblk),
            page_init: buffer::zeroed(layout.page_init_len(sblk))?,
            dblk_addrs: buffer::filled(None, tiers.info(sblk).ndblks as usize)?,
        })
    }

    /// Address of the super block
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Tier this block serves
    pub fn sblk(&self) -> usize {
        self.sblk
    }

    /// First array index covered
    pub fn block_off(&self) -> u64 {
        self.block_off
    }

    fn page_bit(&self, dblk: usize, page: usize) -> (usize, u8) {
        let bit = dblk * self.npages + page;
        (bit / 8, 1 << (bit % 8))
    }

    /// Whether page `page` of data block `dblk` has been written
    pub fn page_initialized(&self, dblk: usize, page: usize) -> bool {
        let (byte, mask) = self.page_bit(dblk, page);
        self.page_init.get(byte).is_some_and(|b| b & mask != 0)
    }

    /// Record whether page `page` of data block `dblk` has been written
    pub fn set_page_initialized(&mut self, dblk: usize, page: usize, initialized: bool) {
        let (byte, mask) = self.page_bit(dblk, page);
        if let Some(b) = self.page_init.get_mut(byte) {
            if initialized {
                *b |= mask;
            } else {
                *b &= !mask;
            }
        }
    }

    pub(crate) fn decode(
        addr: Addr,
        payload: &[u8],
        layout: &ArrayLayout,
        hdr: Addr,
        parent: Addr,
        sblk: usize,
    ) -> CacheResult<Self> {
        let tiers = layout.tiers();
        let mut block = Self {
            addr,
            hdr_addr: hdr,
            parent,
            sblk,
            block_off: tiers.sblk_offset(sblk),
            npages: tiers.npages(sblk),
            page_init: buffer::zeroed(layout.page_init_len(sblk))?,
            dblk_addrs: buffer::filled(None, tiers.info(sblk).ndblks as usize)?,
        };
        let args = (block.page_init.len(), block.dblk_addrs.len());
        let image = SuperBlockImage::read_args(&mut Cursor::new(payload), args)
            .map_err(|e| decode_error(addr, NodeKind::SuperBlock, &e))?;
        check_prefix(addr, NodeKind::SuperBlock, image.version, image.hdr_addr, hdr)?;
        check_block_off(addr, NodeKind::SuperBlock, image.block_off, block.block_off)?;

        block.page_init = image.page_init;
        block.dblk_addrs = addrs_from_raw(image.dblk_addrs);
        Ok(block)
    }

    pub(crate) fn image_len(&self) -> usize {
        PREFIX_LEN + self.page_init.len() + 8 * self.dblk_addrs.len()
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> CacheResult<()> {
        let image = SuperBlockImage {
            version: FORMAT_VERSION,
            hdr_addr: self.hdr_addr.get(),
            block_off: self.block_off,
            page_init: self.page_init.clone(),
            dblk_addrs: addrs_to_raw(&self.dblk_addrs),
        };
        image
            .write(&mut append_cursor(out))
            .map_err(|e| encode_error(&e))
    }
}
