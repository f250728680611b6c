//! Write path.
//!
//! `set` holds the header exclusively for the whole call and walks down the
//! tree, creating every missing node parent first. Each new node is
//! inserted dirty, ordered after its parent with a flush dependency and only
//! then linked into the parent. If any step fails, the nodes created so far
//! are unlinked, removed and freed in reverse order and the header is
//! restored, so no parent is left pointing at a node that does not exist.

use crate::node::{
    ArrayNode, DataBlock, DataBlockPage, HeaderNode, HeaderStats, IndexBlock, LoadRequest,
    NodeKind, SuperBlock,
};
use crate::shared::{ArrayLayout, SharedHeader};
use crate::tier::Location;
use crate::{ArrayCache, ArrayError, Result};
use exarray_cache::{Addr, CacheError, Protected};
use std::sync::Arc;
use tracing::{debug, trace, warn};

type Node = Protected<ArrayNode>;

/// Parent slot a created node was linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    IblockDblk(usize),
    IblockSblk(usize),
    SblkDblk(usize),
    PageBit { dblk: usize, page: usize },
}

impl Slot {
    fn set(self, parent: &mut Node, child: Option<Addr>) -> Result<()> {
        match (self, parent.get_mut()?) {
            (Self::IblockDblk(i), ArrayNode::IndexBlock(block)) => block.dblk_addrs[i] = child,
            (Self::IblockSblk(i), ArrayNode::IndexBlock(block)) => block.sblk_addrs[i] = child,
            (Self::SblkDblk(i), ArrayNode::SuperBlock(block)) => block.dblk_addrs[i] = child,
            (Self::PageBit { dblk, page }, ArrayNode::SuperBlock(block)) => {
                block.set_page_initialized(dblk, page, child.is_some());
            }
            (_, other) => {
                return Err(ArrayError::WrongNodeKind {
                    addr: other.addr(),
                    expected: self.parent_kind(),
                    found: other.kind(),
                });
            }
        }
        parent.mark_dirty()?;
        Ok(())
    }

    fn parent_kind(self) -> NodeKind {
        match self {
            Self::IblockDblk(_) | Self::IblockSblk(_) => NodeKind::IndexBlock,
            Self::SblkDblk(_) | Self::PageBit { .. } => NodeKind::SuperBlock,
        }
    }
}

#[derive(Debug)]
enum Link {
    /// Index block, recorded in the header
    Header,
    Parent { request: LoadRequest, slot: Slot },
}

/// Where a new node's bytes come from
enum Placement {
    Allocate(u64),
    /// Inside space already allocated for another node
    Fixed(Addr),
}

/// Payload length and placement of a node about to be created
struct Shape {
    payload_len: usize,
    placement: Placement,
}

#[derive(Debug)]
struct Created {
    addr: Addr,
    extent: Option<u64>,
    parent: Addr,
    link: Link,
    inserted: bool,
}

struct WriteTxn<'a> {
    cache: &'a ArrayCache,
    layout: &'a Arc<ArrayLayout>,
    hdr: Addr,
    created: Vec<Created>,
}

fn header_mut(node: &mut Node) -> Result<&mut HeaderNode> {
    node.get_mut()?.header_mut()
}

/// Store `value` at `index`, creating missing nodes.
pub(crate) fn set(cache: &ArrayCache, shared: &SharedHeader, index: u64, value: &[u8]) -> Result<()> {
    let layout = shared.layout();
    if value.len() != layout.element_size() {
        return Err(ArrayError::InvalidArgument(format!(
            "value is {} bytes, elements are {}",
            value.len(),
            layout.element_size()
        )));
    }
    let location = layout.tiers().locate(index)?;

    let mut hdr = cache.protect(shared.addr(), &LoadRequest::Header, false)?;
    let before: (HeaderStats, Option<Addr>) = {
        let header = hdr.header()?;
        (header.stats, header.idx_blk_addr)
    };

    let mut txn = WriteTxn {
        cache,
        layout,
        hdr: shared.addr(),
        created: Vec::new(),
    };
    match txn.store(&mut hdr, location, value) {
        Ok(()) => {
            let header = header_mut(&mut hdr)?;
            header.stats.max_idx_set = header.stats.max_idx_set.max(index + 1);
            let changed = (header.stats, header.idx_blk_addr) != before;
            cache.unprotect(hdr, changed)?;
            Ok(())
        }
        Err(e) => {
            warn!(
                "Write of index {} in array at {} failed, unwinding {} new nodes: {}",
                index,
                shared.addr(),
                txn.created.len(),
                e
            );
            match header_mut(&mut hdr) {
                Ok(header) => {
                    header.stats = before.0;
                    header.idx_blk_addr = before.1;
                }
                Err(restore) => warn!("Could not restore header at {}: {}", shared.addr(), restore),
            }
            txn.rollback();
            cache.unprotect(hdr, false)?;
            Err(e)
        }
    }
}

impl WriteTxn<'_> {
    fn store(&mut self, hdr: &mut Node, location: Location, value: &[u8]) -> Result<()> {
        let layout = self.layout;
        let tiers = layout.tiers();
        let iblock_addr = self.index_block(hdr)?;
        let iblock_req = LoadRequest::IndexBlock {
            layout: Arc::clone(layout),
            hdr: self.hdr,
        };
        let mut iblock = self.cache.protect(iblock_addr, &iblock_req, false)?;

        let (sblk, dblk, elmt) = match location {
            Location::IndexBlock { elmt } => {
                iblock.get_mut()?.index_block_mut()?.set_element(elmt, value);
                self.cache.unprotect(iblock, true)?;
                return Ok(());
            }
            Location::DataBlock { sblk, dblk, elmt } => (sblk, dblk, elmt),
        };

        if tiers.is_direct(sblk) {
            let slot = tiers.direct_slot(sblk, dblk);
            let existing = iblock.index_block()?.dblk_addrs[slot];
            let dblk_addr = match existing {
                Some(addr) => addr,
                None => self.data_block(hdr, &mut iblock, &iblock_req, Slot::IblockDblk(slot), sblk, dblk)?,
            };
            self.cache.unprotect(iblock, false)?;

            let request = LoadRequest::DataBlock {
                layout: Arc::clone(layout),
                hdr: self.hdr,
                parent: iblock_addr,
                sblk,
                dblk,
            };
            return self.write_element(dblk_addr, &request, elmt as usize, value);
        }

        let sblk_slot = tiers.sblk_slot(sblk);
        let existing = iblock.index_block()?.sblk_addrs[sblk_slot];
        let sblk_addr = match existing {
            Some(addr) => addr,
            None => self.super_block(hdr, &mut iblock, &iblock_req, sblk_slot, sblk)?,
        };
        self.cache.unprotect(iblock, false)?;

        let sblk_req = LoadRequest::SuperBlock {
            layout: Arc::clone(layout),
            hdr: self.hdr,
            parent: iblock_addr,
            sblk,
        };
        let mut sblock = self.cache.protect(sblk_addr, &sblk_req, false)?;
        let existing = sblock.super_block()?.dblk_addrs[dblk];
        let dblk_addr = match existing {
            Some(addr) => addr,
            None => self.data_block(hdr, &mut sblock, &sblk_req, Slot::SblkDblk(dblk), sblk, dblk)?,
        };

        if !tiers.is_paged(sblk) {
            self.cache.unprotect(sblock, false)?;
            let request = LoadRequest::DataBlock {
                layout: Arc::clone(layout),
                hdr: self.hdr,
                parent: sblk_addr,
                sblk,
                dblk,
            };
            return self.write_element(dblk_addr, &request, elmt as usize, value);
        }

        let page_nelmts = tiers.page_nelmts();
        let page = (elmt / page_nelmts) as usize;
        let page_addr = layout.page_addr(dblk_addr, sblk, page);
        if !sblock.super_block()?.page_initialized(dblk, page) {
            self.page(&mut sblock, &sblk_req, page_addr, dblk, page)?;
        }
        self.cache.unprotect(sblock, false)?;

        let request = LoadRequest::Page {
            layout: Arc::clone(layout),
            hdr: self.hdr,
            parent: sblk_addr,
        };
        self.write_element(page_addr, &request, (elmt % page_nelmts) as usize, value)
    }

    fn index_block(&mut self, hdr: &mut Node) -> Result<Addr> {
        if let Some(addr) = hdr.header()?.idx_blk_addr {
            return Ok(addr);
        }
        let (layout, hdr_addr) = (self.layout, self.hdr);
        let shape = Shape {
            payload_len: layout.iblock_len(),
            placement: Placement::Allocate(layout.iblock_extent()),
        };
        let addr = self.materialize(shape, hdr_addr, Link::Header, |addr| {
            Ok(ArrayNode::IndexBlock(IndexBlock::new(addr, hdr_addr, layout)?))
        })?;
        header_mut(hdr)?.idx_blk_addr = Some(addr);
        Ok(addr)
    }

    fn super_block(
        &mut self,
        hdr: &mut Node,
        iblock: &mut Node,
        iblock_req: &LoadRequest,
        slot: usize,
        sblk: usize,
    ) -> Result<Addr> {
        let (layout, hdr_addr, parent) = (self.layout, self.hdr, iblock.addr());
        let extent = layout.sblk_extent(sblk);
        let link = Link::Parent {
            request: iblock_req.clone(),
            slot: Slot::IblockSblk(slot),
        };
        let shape = Shape {
            payload_len: layout.sblk_len(sblk),
            placement: Placement::Allocate(extent),
        };
        let addr = self.materialize(shape, parent, link, |addr| {
            Ok(ArrayNode::SuperBlock(SuperBlock::new(addr, hdr_addr, parent, sblk, layout)?))
        })?;
        Slot::IblockSblk(slot).set(iblock, Some(addr))?;

        let stats = &mut header_mut(hdr)?.stats;
        stats.nsuper_blks += 1;
        stats.super_blk_size += extent;
        Ok(addr)
    }

    fn data_block(
        &mut self,
        hdr: &mut Node,
        parent_node: &mut Node,
        parent_req: &LoadRequest,
        slot: Slot,
        sblk: usize,
        dblk: usize,
    ) -> Result<Addr> {
        let (layout, hdr_addr, parent) = (self.layout, self.hdr, parent_node.addr());
        let extent = layout.dblk_extent(sblk);
        let link = Link::Parent {
            request: parent_req.clone(),
            slot,
        };
        let shape = Shape {
            payload_len: layout.dblk_len(sblk),
            placement: Placement::Allocate(extent),
        };
        let addr = self.materialize(shape, parent, link, |addr| {
            Ok(ArrayNode::DataBlock(DataBlock::new(addr, hdr_addr, parent, sblk, dblk, layout)?))
        })?;
        slot.set(parent_node, Some(addr))?;

        let stats = &mut header_mut(hdr)?.stats;
        stats.ndata_blks += 1;
        stats.data_blk_size += extent;
        Ok(addr)
    }

    fn page(
        &mut self,
        sblock: &mut Node,
        sblk_req: &LoadRequest,
        page_addr: Addr,
        dblk: usize,
        page: usize,
    ) -> Result<()> {
        let (layout, hdr_addr, parent) = (self.layout, self.hdr, sblock.addr());
        let slot = Slot::PageBit { dblk, page };
        let link = Link::Parent {
            request: sblk_req.clone(),
            slot,
        };
        let shape = Shape {
            payload_len: layout.page_len(),
            placement: Placement::Fixed(page_addr),
        };
        self.materialize(shape, parent, link, |addr| {
            Ok(ArrayNode::Page(DataBlockPage::new(addr, hdr_addr, parent, layout)?))
        })?;
        slot.set(sblock, Some(page_addr))
    }

    /// Place, insert and order a new node after `parent`. The caller links it.
    fn materialize(
        &mut self,
        shape: Shape,
        parent: Addr,
        link: Link,
        build: impl FnOnce(Addr) -> Result<ArrayNode>,
    ) -> Result<Addr> {
        self.cache.check_image_len(shape.payload_len)?;
        let (addr, extent) = match shape.placement {
            Placement::Allocate(len) => (self.cache.store().allocate(len)?, Some(len)),
            Placement::Fixed(addr) => (addr, None),
        };
        self.created.push(Created {
            addr,
            extent,
            parent,
            link,
            inserted: false,
        });

        let node = build(addr)?;
        let kind = node.kind();
        self.cache.insert(addr, node)?;
        if let Some(created) = self.created.last_mut() {
            created.inserted = true;
        }
        self.cache.create_flush_dependency(parent, addr)?;
        debug!("Created {} at {} under {}", kind, addr, parent);
        Ok(addr)
    }

    fn write_element(&self, addr: Addr, request: &LoadRequest, elmt: usize, value: &[u8]) -> Result<()> {
        let mut node = self.cache.protect(addr, request, false)?;
        match node.get_mut()? {
            ArrayNode::DataBlock(block) => block.set_element(elmt, value),
            ArrayNode::Page(page) => page.set_element(elmt, value),
            other => {
                return Err(ArrayError::WrongNodeKind {
                    addr,
                    expected: request.kind(),
                    found: other.kind(),
                });
            }
        }
        self.cache.unprotect(node, true)?;
        Ok(())
    }

    fn rollback(&mut self) {
        for created in std::mem::take(&mut self.created).into_iter().rev() {
            if let Err(e) = self.undo(&created) {
                warn!("Could not unwind node at {}: {}", created.addr, e);
            }
        }
    }

    fn undo(&self, created: &Created) -> Result<()> {
        if let Link::Parent { request, slot } = &created.link {
            let mut parent = self.cache.protect(created.parent, request, false)?;
            slot.set(&mut parent, None)?;
            self.cache.unprotect(parent, true)?;
        }
        if created.inserted {
            if let Err(e) = self.cache.destroy_flush_dependency(created.parent, created.addr) {
                trace!("No flush dependency to drop for {}: {}", created.addr, e);
            }
            match self.cache.remove(created.addr) {
                Ok(()) | Err(CacheError::NotResident(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(len) = created.extent {
            self.cache.store().free(created.addr, len)?;
        }
        trace!("Unwound node at {}", created.addr);
        Ok(())
    }
}
