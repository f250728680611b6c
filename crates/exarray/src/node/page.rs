//! Data block page: a bare run of elements at a fixed offset behind its
//! data block. Pages are addressed through the owning super block, which
//! records which of them have been written.

use super::Elements;
use crate::Result;
use crate::shared::ArrayLayout;
use exarray_cache::Addr;

/// Payload length of a page of `nelmts` elements
pub const fn payload_len(nelmts: usize, element_size: usize) -> usize {
    nelmts * element_size
}

/// Data block page as it lives in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlockPage {
    pub(crate) addr: Addr,
    pub(crate) hdr_addr: Addr,
    pub(crate) parent: Addr,
    pub(crate) elements: Elements,
}

impl DataBlockPage {
    /// Fresh fill-valued page owned by the super block at `parent`
    pub fn new(addr: Addr, hdr_addr: Addr, parent: Addr, layout: &ArrayLayout) -> Result<Self> {
        Ok(Self {
            addr,
            hdr_addr,
            parent,
            elements: Elements::filled(layout.tiers().page_nelmts() as usize, layout)?,
        })
    }

    /// Address of the page
    pub fn addr(&self) -> Addr {
        self.addr
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
    ) -> Self {
        Self {
            addr,
            hdr_addr: hdr,
            parent,
            elements: Elements::from_bytes(payload.to_vec(), layout.element_size()),
        }
    }

    pub(crate) fn image_len(&self) -> usize {
        self.elements.as_bytes().len()
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.elements.as_bytes());
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::params::CreateParams;

    #[test]
    fn test_page_is_raw_elements() {
        let layout = ArrayLayout::new(
            CreateParams::new(2)
                .with_max_dblk_page_nelmts_bits(3)
                .with_data_blk_min_elmts(2)
                .with_fill_value([0xaa, 0xbb]),
        )
        .expect("layout");
        let mut page = DataBlockPage::new(Addr::new(128), Addr::new(0), Addr::new(64), &layout)
            .expect("new node");
        page.set_element(7, &[1, 2]);

        let mut out = Vec::new();
        page.encode(&mut out);
        assert_eq!(out.len(), layout.page_len());
        assert_eq!(&out[..2], &[0xaa, 0xbb]);
        assert_eq!(&out[14..], &[1, 2]);

        let decoded = DataBlockPage::decode(Addr::new(128), &out, &layout, Addr::new(0), Addr::new(64));
        assert_eq!(decoded, page);
    }
}
