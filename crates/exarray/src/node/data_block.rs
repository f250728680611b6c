//! Data block node. Unpaged blocks carry their elements inline; paged
//! blocks are a bare prefix with the pages stored right after it.

use super::{
    Elements, FORMAT_VERSION, NodeKind, append_cursor, check_block_off, check_prefix,
    decode_error, encode_error,
};
use crate::Result;
use crate::shared::ArrayLayout;
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use exarray_cache::{Addr, CacheResult};

/// Payload bytes before the elements
pub const PREFIX_LEN: usize = 21;

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"EADB")]
#[br(import(elements_len: usize))]
struct DataBlockImage {
    version: u8,
    hdr_addr: u64,
    block_off: u64,
    #[br(count = elements_len)]
    elements: Vec<u8>,
}

/// Data block as it lives in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub(crate) addr: Addr,
    pub(crate) hdr_addr: Addr,
    pub(crate) parent: Addr,
    block_off: u64,
    pub(crate) elements: Elements,
}

impl DataBlock {
    /// Fresh data block `dblk` of tier `sblk`, filled with the fill value
    pub fn new(
        addr: Addr,
        hdr_addr: Addr,
        parent: Addr,
        sblk: usize,
        dblk: usize,
        layout: &ArrayLayout,
    ) -> Result<Self> {
        Ok(Self {
            addr,
            hdr_addr,
            parent,
            block_off: layout.tiers().dblk_offset(sblk, dblk),
            elements: Elements::filled(layout.dblk_image_nelmts(sblk), layout)?,
        })
    }

    /// Address of the data block
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// First array index covered
    pub fn block_off(&self) -> u64 {
        self.block_off
    }

    /// Inline elements (none when paged)
    pub fn nelmts(&self) -> usize {
        self.elements.len()
    }

    /// Bytes of element `i`
    pub fn element(&self, i: usize) -> &[u8] {
        self.elements.get(i)
    }

    /// Overwrite element `i`
    pub fn set_element(&mut self, i: usize, value: &[u8]) {
        self.elements.set(i, value);
    }

    pub(crate) fn decode(
        addr: Addr,
        payload: &[u8],
        layout: &ArrayLayout,
        hdr: Addr,
        parent: Addr,
        sblk: usize,
        dblk: usize,
    ) -> CacheResult<Self> {
        let elements_len = layout.dblk_image_nelmts(sblk) * layout.element_size();
        let image = DataBlockImage::read_args(&mut Cursor::new(payload), (elements_len,))
            .map_err(|e| decode_error(addr, NodeKind::DataBlock, &e))?;
        check_prefix(addr, NodeKind::DataBlock, image.version, image.hdr_addr, hdr)?;
        let block_off = layout.tiers().dblk_offset(sblk, dblk);
        check_block_off(addr, NodeKind::DataBlock, image.block_off, block_off)?;

        Ok(Self {
            addr,
            hdr_addr: hdr,
            parent,
            block_off,
            elements: Elements::from_bytes(image.elements, layout.element_size()),
        })
    }

    pub(crate) fn image_len(&self) -> usize {
        PREFIX_LEN + self.elements.as_bytes().len()
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> CacheResult<()> {
        let image = DataBlockImage {
            version: FORMAT_VERSION,
            hdr_addr: self.hdr_addr.get(),
            block_off: self.block_off,
            elements: self.elements.as_bytes().to_vec(),
        };
        image
            .write(&mut append_cursor(out))
            .map_err(|e| encode_error(&e))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::params::CreateParams;

    fn layout(page_bits: u8) -> ArrayLayout {
        ArrayLayout::new(
            CreateParams::new(4)
                .with_idx_blk_elmts(4)
                .with_data_blk_min_elmts(4)
                .with_max_nelmts_bits(16)
                .with_max_dblk_page_nelmts_bits(page_bits)
                .with_fill_value(u32::MAX),
        )
        .expect("layout")
    }

    #[test]
    fn test_block_covers_its_range() {
        let layout = layout(10);
        let mut block = DataBlock::new(Addr::new(512), Addr::new(0), Addr::new(64), 2, 1, &layout)
            .expect("new node");
        assert_eq!(block.block_off(), 4 + 12 + 8);
        assert_eq!(block.nelmts(), 8);
        assert_eq!(block.element(7), &[0xff; 4]);

        block.set_element(7, &[1, 0, 0, 0]);
        let mut out = Vec::new();
        block.encode(&mut out).expect("encode");
        assert_eq!(out.len(), layout.dblk_len(2));
        let decoded = DataBlock::decode(Addr::new(512), &out, &layout, Addr::new(0), Addr::new(64), 2, 1)
            .expect("decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_paged_block_is_prefix_only() {
        let layout = layout(4);
        let block = DataBlock::new(Addr::new(512), Addr::new(0), Addr::new(64), 5, 0, &layout)
            .expect("new node");
        assert_eq!(block.nelmts(), 0);
        assert_eq!(block.image_len(), PREFIX_LEN);
    }

    #[test]
    fn test_offset_mismatch_is_corruption() {
        let layout = layout(10);
        let block = DataBlock::new(Addr::new(512), Addr::new(0), Addr::new(64), 2, 0, &layout)
            .expect("new node");
        let mut out = Vec::new();
        block.encode(&mut out).expect("encode");
        let err = DataBlock::decode(Addr::new(512), &out, &layout, Addr::new(0), Addr::new(64), 2, 1)
            .expect_err("wrong block");
        assert!(err.is_corruption());
    }
}
