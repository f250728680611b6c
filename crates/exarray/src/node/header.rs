//! Array header node.
//!
//! The header is the array's root: it persists the creation parameters and
//! fill value, the running node statistics and the index block address.
//! Its image length depends on the element size, so loads read the fixed
//! prefix first and then the full image.

use super::{FORMAT_VERSION, NodeKind, append_cursor, decode_error, encode_error};
use crate::fill::FillValue;
use crate::params::CreateParams;
use crate::shared::ArrayLayout;
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use exarray_cache::{Addr, CacheError, CacheResult};
use serde::{Deserialize, Serialize};

/// Header magic bytes
pub const HEADER_MAGIC: [u8; 4] = *b"EAHD";

/// Payload bytes before the fill value
pub const PREFIX_LEN: usize = 60;

/// Offset of the little-endian element size in the payload
const ELEMENT_SIZE_OFFSET: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little, magic = b"EAHD")]
struct HeaderImage {
    version: u8,
    element_size: u16,
    max_nelmts_bits: u8,
    idx_blk_elmts: u8,
    data_blk_min_elmts: u8,
    sup_blk_min_data_ptrs: u8,
    max_dblk_page_nelmts_bits: u8,
    nsuper_blks: u64,
    super_blk_size: u64,
    ndata_blks: u64,
    data_blk_size: u64,
    max_idx_set: u64,
    idx_blk_addr: u64,
    #[br(count = usize::from(element_size))]
    fill: Vec<u8>,
}

/// Running statistics persisted in the header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderStats {
    /// One past the highest index ever written
    pub max_idx_set: u64,
    /// Super blocks created
    pub nsuper_blks: u64,
    /// Stored bytes of all super blocks
    pub super_blk_size: u64,
    /// Data blocks created
    pub ndata_blks: u64,
    /// Stored bytes of all data blocks, pages included
    pub data_blk_size: u64,
}

/// The array header as it lives in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNode {
    pub(crate) addr: Addr,
    params: CreateParams,
    /// Node statistics
    pub stats: HeaderStats,
    /// Index block, once created
    pub idx_blk_addr: Option<Addr>,
}

impl HeaderNode {
    /// Header for a freshly created array
    pub fn new(addr: Addr, layout: &ArrayLayout) -> Self {
        Self {
            addr,
            params: layout.params().clone(),
            stats: HeaderStats::default(),
            idx_blk_addr: None,
        }
    }

    /// Address of the header
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Persisted creation parameters, fill value included
    pub fn params(&self) -> &CreateParams {
        &self.params
    }

    pub(crate) fn decode(addr: Addr, payload: &[u8]) -> CacheResult<Self> {
        let image = HeaderImage::read(&mut Cursor::new(payload))
            .map_err(|e| decode_error(addr, NodeKind::Header, &e))?;
        if image.version != FORMAT_VERSION {
            return Err(CacheError::corruption(
                addr,
                format!("unsupported header version {}", image.version),
            ));
        }

        let params = CreateParams {
            element_size: usize::from(image.element_size),
            max_nelmts_bits: image.max_nelmts_bits,
            idx_blk_elmts: image.idx_blk_elmts,
            data_blk_min_elmts: image.data_blk_min_elmts,
            sup_blk_min_data_ptrs: image.sup_blk_min_data_ptrs,
            max_dblk_page_nelmts_bits: image.max_dblk_page_nelmts_bits,
            fill_value: Some(FillValue::new(image.fill)),
        };
        params
            .validate()
            .map_err(|reason| CacheError::corruption(addr, format!("bad header parameters: {reason}")))?;

        Ok(Self {
            addr,
            params,
            stats: HeaderStats {
                max_idx_set: image.max_idx_set,
                nsuper_blks: image.nsuper_blks,
                super_blk_size: image.super_blk_size,
                ndata_blks: image.ndata_blks,
                data_blk_size: image.data_blk_size,
            },
            idx_blk_addr: Addr::from_raw(image.idx_blk_addr),
        })
    }

    pub(crate) fn image_len(&self) -> usize {
        PREFIX_LEN + self.params.element_size
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> CacheResult<()> {
        let params = &self.params;
        let image = HeaderImage {
            version: FORMAT_VERSION,
            element_size: u16::try_from(params.element_size)
                .map_err(|_| CacheError::InvalidConfiguration(format!(
                    "element size {} does not fit the header",
                    params.element_size
                )))?,
            max_nelmts_bits: params.max_nelmts_bits,
            idx_blk_elmts: params.idx_blk_elmts,
            data_blk_min_elmts: params.data_blk_min_elmts,
            sup_blk_min_data_ptrs: params.sup_blk_min_data_ptrs,
            max_dblk_page_nelmts_bits: params.max_dblk_page_nelmts_bits,
            nsuper_blks: self.stats.nsuper_blks,
            super_blk_size: self.stats.super_blk_size,
            ndata_blks: self.stats.ndata_blks,
            data_blk_size: self.stats.data_blk_size,
            max_idx_set: self.stats.max_idx_set,
            idx_blk_addr: Addr::to_raw(self.idx_blk_addr),
            fill: params.fill().as_bytes().to_vec(),
        };
        image
            .write(&mut append_cursor(out))
            .map_err(|e| encode_error(&e))
    }
}

/// Full header payload length given its fixed prefix.
pub(crate) fn image_len_from_prefix(prefix: &[u8]) -> CacheResult<usize> {
    let element_size = prefix
        .get(ELEMENT_SIZE_OFFSET..ELEMENT_SIZE_OFFSET + 2)
        .map_or(0, |bytes| usize::from(u16::from_le_bytes([bytes[0], bytes[1]])));
    Ok(PREFIX_LEN + element_size)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header() -> HeaderNode {
        let layout = ArrayLayout::new(CreateParams::new(3).with_fill_value([7u8, 8, 9])).expect("layout");
        let mut header = HeaderNode::new(Addr::new(0x40), &layout);
        header.stats.max_idx_set = 12;
        header.stats.ndata_blks = 2;
        header.idx_blk_addr = Some(Addr::new(0x80));
        header
    }

    #[test]
    fn test_image_layout() {
        let header = header();
        let mut out = Vec::new();
        header.encode(&mut out).expect("encode");

        assert_eq!(out.len(), header.image_len());
        assert_eq!(&out[..4], &HEADER_MAGIC);
        assert_eq!(out[4], FORMAT_VERSION);
        assert_eq!(image_len_from_prefix(&out[..PREFIX_LEN]).expect("len"), PREFIX_LEN + 3);
        assert_eq!(&out[PREFIX_LEN..], &[7, 8, 9]);

        let decoded = HeaderNode::decode(Addr::new(0x40), &out).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let mut out = Vec::new();
        header().encode(&mut out).expect("encode");
        out[0] = b'X';
        let err = HeaderNode::decode(Addr::new(0x40), &out).expect_err("bad magic");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_bad_parameters_are_corruption() {
        let mut out = Vec::new();
        header().encode(&mut out).expect("encode");
        // data_blk_min_elmts must be a power of two
        out[9] = 3;
        let err = HeaderNode::decode(Addr::new(0x40), &out).expect_err("bad params");
        assert!(err.is_corruption());
    }
}
