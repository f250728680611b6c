//! Index block node: the first elements inline, then address slots for the
//! direct data blocks and for the super blocks of the larger tiers.

use super::{
    Elements, FORMAT_VERSION, NodeKind, addrs_from_raw, addrs_to_raw, append_cursor,
    check_prefix, decode_error, encode_error,
};
use crate::Result;
use crate::shared::ArrayLayout;
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use exarray_cache::{Addr, CacheResult, buffer};

/// Payload bytes before the inline elements
pub const PREFIX_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"EAIB")]
#[br(import(elements_len: usize, ndblk_addrs: usize, nsblk_addrs: usize))]
struct IndexBlockImage {
    version: u8,
    hdr_addr: u64,
    #[br(count = elements_len)]
    elements: Vec<u8>,
    #[br(count = ndblk_addrs)]
    dblk_addrs: Vec<u64>,
    #[br(count = nsblk_addrs)]
    sblk_addrs: Vec<u64>,
}

/// Index block as it lives in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub(crate) addr: Addr,
    pub(crate) hdr_addr: Addr,
    pub(crate) elements: Elements,
    /// Data blocks of the direct tiers, in tier order
    pub dblk_addrs: Vec<Option<Addr>>,
    /// Super blocks of the remaining tiers
    pub sblk_addrs: Vec<Option<Addr>>,
}

impl IndexBlock {
    /// Fresh index block: fill-valued elements, every slot undefined
    pub fn new(addr: Addr, hdr_addr: Addr, layout: &ArrayLayout) -> Result<Self> {
        let tiers = layout.tiers();
        Ok(Self {
            addr,
            hdr_addr,
            elements: Elements::filled(tiers.idx_blk_elmts(), layout)?,
            dblk_addrs: buffer::filled(None, tiers.ndblk_addrs())?,
            sblk_addrs: buffer::filled(None, tiers.nsblk_addrs())?,
        })
    }

    /// Address of the index block
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Owning header
    pub fn hdr_addr(&self) -> Addr {
        self.hdr_addr
    }

    /// Bytes of inline element `i`
    pub fn element(&self, i: usize) -> &[u8] {
        self.elements.get(i)
    }

    /// Overwrite inline element `i`
    pub fn set_element(&mut self, i: usize, value: &[u8]) {
        self.elements.set(i, value);
    }

    pub(crate) fn decode(
        addr: Addr,
        payload: &[u8],
        layout: &ArrayLayout,
        hdr: Addr,
    ) -> CacheResult<Self> {
        let tiers = layout.tiers();
        let args = (
            tiers.idx_blk_elmts() * layout.element_size(),
            tiers.ndblk_addrs(),
            tiers.nsblk_addrs(),
        );
        let image = IndexBlockImage::read_args(&mut Cursor::new(payload), args)
            .map_err(|e| decode_error(addr, NodeKind::IndexBlock, &e))?;
        check_prefix(addr, NodeKind::IndexBlock, image.version, image.hdr_addr, hdr)?;

        Ok(Self {
            addr,
            hdr_addr: hdr,
            elements: Elements::from_bytes(image.elements, layout.element_size()),
            dblk_addrs: addrs_from_raw(image.dblk_addrs),
            sblk_addrs: addrs_from_raw(image.sblk_addrs),
        })
    }

    pub(crate) fn image_len(&self) -> usize {
        PREFIX_LEN + self.elements.as_bytes().len() + 8 * (self.dblk_addrs.len() + self.sblk_addrs.len())
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> CacheResult<()> {
        let image = IndexBlockImage {
            version: FORMAT_VERSION,
            hdr_addr: self.hdr_addr.get(),
            elements: self.elements.as_bytes().to_vec(),
            dblk_addrs: addrs_to_raw(&self.dblk_addrs),
            sblk_addrs: addrs_to_raw(&self.sblk_addrs),
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
    use exarray_cache::UNDEFINED_ADDR;

    fn layout() -> ArrayLayout {
        ArrayLayout::new(
            CreateParams::new(2)
                .with_idx_blk_elmts(3)
                .with_data_blk_min_elmts(4)
                .with_fill_value(0xffffu16),
        )
        .expect("layout")
    }

    #[test]
    fn test_fresh_block_is_fill_and_undefined() {
        let layout = layout();
        let block = IndexBlock::new(Addr::new(64), Addr::new(0), &layout)
            .expect("new node");
        assert_eq!(block.element(2), &[0xff, 0xff]);
        assert!(block.dblk_addrs.iter().all(Option::is_none));
        assert_eq!(block.image_len(), layout.iblock_len());

        let mut out = Vec::new();
        block.encode(&mut out).expect("encode");
        let undefined = UNDEFINED_ADDR.to_le_bytes();
        assert_eq!(&out[out.len() - 8..], &undefined);
    }

    #[test]
    fn test_encode_decode_keeps_slots() {
        let layout = layout();
        let mut block = IndexBlock::new(Addr::new(64), Addr::new(0), &layout)
            .expect("new node");
        block.set_element(1, &[1, 2]);
        block.dblk_addrs[2] = Some(Addr::new(512));
        block.sblk_addrs[0] = Some(Addr::new(1024));

        let mut out = Vec::new();
        block.encode(&mut out).expect("encode");
        assert_eq!(out.len(), layout.iblock_len());
        let decoded = IndexBlock::decode(Addr::new(64), &out, &layout, Addr::new(0)).expect("decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_foreign_header_rejected() {
        let layout = layout();
        let block = IndexBlock::new(Addr::new(64), Addr::new(0), &layout)
            .expect("new node");
        let mut out = Vec::new();
        block.encode(&mut out).expect("encode");
        let err = IndexBlock::decode(Addr::new(64), &out, &layout, Addr::new(8)).expect_err("wrong owner");
        assert!(err.is_corruption());
    }
}
