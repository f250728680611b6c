//! Structural node kinds and their cache integration.
//!
//! Every node image is a little-endian `binrw` record (pages are bare
//! element runs) followed by the cache's trailing checksum. Child nodes
//! carry their header's address and report their residency to the shared
//! header through cache notifications.

pub mod data_block;
pub mod header;
pub mod index_block;
pub mod page;
pub mod super_block;

pub use data_block::DataBlock;
pub use header::{HeaderNode, HeaderStats};
pub use index_block::IndexBlock;
pub use page::DataBlockPage;
pub use super_block::SuperBlock;

use crate::shared::{ArrayLayout, SharedHeader};
use crate::{ArrayError, Result};
use binrw::io::Cursor;
use exarray_cache::{Addr, CacheEntry, CacheError, CacheResult, Notify, buffer};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Image format version written into every prefixed node
pub const FORMAT_VERSION: u8 = 0;

/// Kind of structural node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Array header
    Header,
    /// Index block
    IndexBlock,
    /// Super block
    SuperBlock,
    /// Data block
    DataBlock,
    /// Data block page
    Page,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Header => "header",
            Self::IndexBlock => "index block",
            Self::SuperBlock => "super block",
            Self::DataBlock => "data block",
            Self::Page => "data block page",
        };
        f.write_str(name)
    }
}

/// What the cache needs to know to load a node image
#[derive(Debug, Clone)]
pub enum LoadRequest {
    /// Array header at the protected address
    Header,
    /// Index block of the array at `hdr`
    IndexBlock {
        /// Array layout
        layout: Arc<ArrayLayout>,
        /// Header address
        hdr: Addr,
    },
    /// Super block for tier `sblk`
    SuperBlock {
        /// Array layout
        layout: Arc<ArrayLayout>,
        /// Header address
        hdr: Addr,
        /// Index block address
        parent: Addr,
        /// Tier
        sblk: usize,
    },
    /// Data block `dblk` of tier `sblk`
    DataBlock {
        /// Array layout
        layout: Arc<ArrayLayout>,
        /// Header address
        hdr: Addr,
        /// Index block or super block address
        parent: Addr,
        /// Tier
        sblk: usize,
        /// Data block within the tier
        dblk: usize,
    },
    /// Page of a paged data block
    Page {
        /// Array layout
        layout: Arc<ArrayLayout>,
        /// Header address
        hdr: Addr,
        /// Owning super block address
        parent: Addr,
    },
}

impl LoadRequest {
    /// Node kind this request loads
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Header => NodeKind::Header,
            Self::IndexBlock { .. } => NodeKind::IndexBlock,
            Self::SuperBlock { .. } => NodeKind::SuperBlock,
            Self::DataBlock { .. } => NodeKind::DataBlock,
            Self::Page { .. } => NodeKind::Page,
        }
    }
}

/// Fixed-size element storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elements {
    bytes: Vec<u8>,
    element_size: usize,
}

impl Elements {
    /// `count` copies of the layout's fill value
    pub fn filled(count: usize, layout: &ArrayLayout) -> Result<Self> {
        let element_size = layout.element_size();
        let mut bytes = buffer::zeroed(buffer::byte_len(count, element_size)?)?;
        layout.fill().fill_into(&mut bytes);
        Ok(Self {
            bytes,
            element_size,
        })
    }

    pub(crate) fn from_bytes(bytes: Vec<u8>, element_size: usize) -> Self {
        Self {
            bytes,
            element_size,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.bytes.len() / self.element_size
    }

    /// Whether there are no elements
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes of element `i`
    pub fn get(&self, i: usize) -> &[u8] {
        let start = i * self.element_size;
        &self.bytes[start..start + self.element_size]
    }

    /// Overwrite element `i`
    pub fn set(&mut self, i: usize, value: &[u8]) {
        let start = i * self.element_size;
        self.bytes[start..start + self.element_size].copy_from_slice(value);
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A node resident in the block cache
#[derive(Debug)]
pub enum ArrayNode {
    /// Array header
    Header(HeaderNode),
    /// Index block
    IndexBlock(IndexBlock),
    /// Super block
    SuperBlock(SuperBlock),
    /// Data block
    DataBlock(DataBlock),
    /// Data block page
    Page(DataBlockPage),
}

macro_rules! node_accessors {
    ($($variant:ident, $ty:ty, $get:ident, $get_mut:ident;)*) => {
        $(
            #[doc = concat!("Borrow as a `", stringify!($ty), "`")]
            pub fn $get(&self) -> Result<&$ty> {
                match self {
                    Self::$variant(node) => Ok(node),
                    other => Err(other.wrong_kind(NodeKind::$variant)),
                }
            }

            #[doc = concat!("Mutably borrow as a `", stringify!($ty), "`")]
            pub fn $get_mut(&mut self) -> Result<&mut $ty> {
                match self {
                    Self::$variant(node) => Ok(node),
                    other => Err(other.wrong_kind(NodeKind::$variant)),
                }
            }
        )*
    };
}

impl ArrayNode {
    /// Kind of this node
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Header(_) => NodeKind::Header,
            Self::IndexBlock(_) => NodeKind::IndexBlock,
            Self::SuperBlock(_) => NodeKind::SuperBlock,
            Self::DataBlock(_) => NodeKind::DataBlock,
            Self::Page(_) => NodeKind::Page,
        }
    }

    /// Address of this node
    pub fn addr(&self) -> Addr {
        match self {
            Self::Header(node) => node.addr,
            Self::IndexBlock(node) => node.addr,
            Self::SuperBlock(node) => node.addr,
            Self::DataBlock(node) => node.addr,
            Self::Page(node) => node.addr,
        }
    }

    fn wrong_kind(&self, expected: NodeKind) -> ArrayError {
        ArrayError::WrongNodeKind {
            addr: self.addr(),
            expected,
            found: self.kind(),
        }
    }

    node_accessors! {
        Header, HeaderNode, header, header_mut;
        IndexBlock, IndexBlock, index_block, index_block_mut;
        SuperBlock, SuperBlock, super_block, super_block_mut;
        DataBlock, DataBlock, data_block, data_block_mut;
        Page, DataBlockPage, page, page_mut;
    }

    fn hdr_addr(&self) -> Option<Addr> {
        match self {
            Self::Header(_) => None,
            Self::IndexBlock(node) => Some(node.hdr_addr),
            Self::SuperBlock(node) => Some(node.hdr_addr),
            Self::DataBlock(node) => Some(node.hdr_addr),
            Self::Page(node) => Some(node.hdr_addr),
        }
    }
}

impl CacheEntry for ArrayNode {
    type LoadContext = LoadRequest;
    type Shared = SharedHeader;

    fn initial_load_len(ctx: &LoadRequest) -> usize {
        match ctx {
            LoadRequest::Header => header::PREFIX_LEN,
            LoadRequest::IndexBlock { layout, .. } => layout.iblock_len(),
            LoadRequest::SuperBlock { layout, sblk, .. } => layout.sblk_len(*sblk),
            LoadRequest::DataBlock { layout, sblk, .. } => layout.dblk_len(*sblk),
            LoadRequest::Page { layout, .. } => layout.page_len(),
        }
    }

    fn final_load_len(ctx: &LoadRequest, prefix: &[u8]) -> CacheResult<usize> {
        match ctx {
            LoadRequest::Header => header::image_len_from_prefix(prefix),
            _ => Ok(Self::initial_load_len(ctx)),
        }
    }

    fn decode(addr: Addr, payload: &[u8], ctx: &LoadRequest) -> CacheResult<Self> {
        let node = match ctx {
            LoadRequest::Header => Self::Header(HeaderNode::decode(addr, payload)?),
            LoadRequest::IndexBlock { layout, hdr } => {
                Self::IndexBlock(IndexBlock::decode(addr, payload, layout, *hdr)?)
            }
            LoadRequest::SuperBlock {
                layout,
                hdr,
                parent,
                sblk,
            } => Self::SuperBlock(SuperBlock::decode(
                addr, payload, layout, *hdr, *parent, *sblk,
            )?),
            LoadRequest::DataBlock {
                layout,
                hdr,
                parent,
                sblk,
                dblk,
            } => Self::DataBlock(DataBlock::decode(
                addr, payload, layout, *hdr, *parent, *sblk, *dblk,
            )?),
            LoadRequest::Page {
                layout,
                hdr,
                parent,
            } => Self::Page(DataBlockPage::decode(addr, payload, layout, *hdr, *parent)),
        };
        trace!("Decoded {} at {}", node.kind(), addr);
        Ok(node)
    }

    fn image_len(&self) -> usize {
        match self {
            Self::Header(node) => node.image_len(),
            Self::IndexBlock(node) => node.image_len(),
            Self::SuperBlock(node) => node.image_len(),
            Self::DataBlock(node) => node.image_len(),
            Self::Page(node) => node.image_len(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> CacheResult<()> {
        match self {
            Self::Header(node) => node.encode(out),
            Self::IndexBlock(node) => node.encode(out),
            Self::SuperBlock(node) => node.encode(out),
            Self::DataBlock(node) => node.encode(out),
            Self::Page(node) => {
                node.encode(out);
                Ok(())
            }
        }
    }

    fn flush_parent(&self) -> Option<Addr> {
        match self {
            Self::Header(_) => None,
            Self::IndexBlock(node) => Some(node.hdr_addr),
            Self::SuperBlock(node) => Some(node.parent),
            Self::DataBlock(node) => Some(node.parent),
            Self::Page(node) => Some(node.parent),
        }
    }

    fn owner(&self) -> Option<Addr> {
        self.hdr_addr()
    }

    fn notify(&mut self, action: Notify, shared: Option<&SharedHeader>) -> CacheResult<()> {
        let Some(shared) = shared else {
            if self.hdr_addr().is_some() {
                trace!("{} at {} has no shared header for {:?}", self.kind(), self.addr(), action);
            }
            return Ok(());
        };
        match action {
            Notify::AfterInsert | Notify::AfterLoad => shared.add_dependent(),
            Notify::BeforeEvict | Notify::BeforeRemove => shared.remove_dependent(),
        }
        Ok(())
    }
}

/// Cursor appending to `out`
pub(crate) fn append_cursor(out: &mut Vec<u8>) -> Cursor<&mut Vec<u8>> {
    let end = out.len() as u64;
    let mut cursor = Cursor::new(out);
    cursor.set_position(end);
    cursor
}

/// Map a decode failure to a corruption report
pub(crate) fn decode_error(addr: Addr, kind: NodeKind, err: &binrw::Error) -> CacheError {
    CacheError::corruption(addr, format!("undecodable {kind} image: {err}"))
}

/// Map an encode failure
pub(crate) fn encode_error(err: &binrw::Error) -> CacheError {
    CacheError::Io(std::io::Error::other(err.to_string()))
}

/// Check the fields every prefixed image carries
pub(crate) fn check_prefix(
    addr: Addr,
    kind: NodeKind,
    version: u8,
    hdr_addr: u64,
    expected_hdr: Addr,
) -> CacheResult<()> {
    if version != FORMAT_VERSION {
        return Err(CacheError::corruption(
            addr,
            format!("unsupported {kind} version {version}"),
        ));
    }
    if hdr_addr != expected_hdr.get() {
        return Err(CacheError::corruption(
            addr,
            format!("{kind} belongs to header {hdr_addr:#x}, expected {expected_hdr}"),
        ));
    }
    Ok(())
}

/// Check a stored block offset
pub(crate) fn check_block_off(addr: Addr, kind: NodeKind, found: u64, expected: u64) -> CacheResult<()> {
    if found != expected {
        return Err(CacheError::corruption(
            addr,
            format!("{kind} covers index {found}, expected {expected}"),
        ));
    }
    Ok(())
}

/// Decode on-disk address slots
pub(crate) fn addrs_from_raw(raw: Vec<u64>) -> Vec<Option<Addr>> {
    raw.into_iter().map(Addr::from_raw).collect()
}

/// Encode address slots for disk
pub(crate) fn addrs_to_raw(addrs: &[Option<Addr>]) -> Vec<u64> {
    addrs.iter().map(|&addr| Addr::to_raw(addr)).collect()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::params::CreateParams;

    #[test]
    fn test_elements_get_set() {
        let layout = ArrayLayout::new(CreateParams::new(2).with_fill_value(0xbeefu16)).expect("layout");
        let mut elements = Elements::filled(3, &layout).expect("elements");
        assert_eq!(elements.len(), 3);
        assert_eq!(elements.get(1), &[0xef, 0xbe]);

        elements.set(1, &[1, 2]);
        assert_eq!(elements.as_bytes(), &[0xef, 0xbe, 1, 2, 0xef, 0xbe]);
    }

    #[test]
    fn test_wrong_kind_reported() {
        let layout = Arc::new(ArrayLayout::new(CreateParams::new(4)).expect("layout"));
        let mut node = ArrayNode::Page(
            DataBlockPage::new(Addr::new(64), Addr::new(0), Addr::new(32), &layout).expect("page"),
        );
        let err = node.header_mut().expect_err("not a header");
        assert_eq!(
            err.to_string(),
            "Node at 0x40 is a data block page, expected header"
        );
        assert!(node.page().is_ok());
    }

    #[test]
    fn test_notify_tracks_dependents() {
        let layout = Arc::new(ArrayLayout::new(CreateParams::new(4)).expect("layout"));
        let shared = SharedHeader::new(Addr::new(0), Arc::clone(&layout));
        let mut node = ArrayNode::Page(
            DataBlockPage::new(Addr::new(64), Addr::new(0), Addr::new(32), &layout).expect("page"),
        );

        node.notify(Notify::AfterLoad, Some(&shared)).expect("notify");
        assert_eq!(shared.resident_nodes(), 1);
        node.notify(Notify::BeforeEvict, Some(&shared)).expect("notify");
        assert_eq!(shared.resident_nodes(), 0);
        assert_eq!(node.owner(), Some(Addr::new(0)));
        assert_eq!(node.flush_parent(), Some(Addr::new(32)));
    }
}
