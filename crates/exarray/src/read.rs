//! Read path.
//!
//! Every node on the way down is protected read-only and released before
//! the next one is taken. The walk stops at the first undefined address or
//! unset page bit; the caller then reports the fill value.

use crate::node::{ArrayNode, LoadRequest, NodeKind};
use crate::shared::{ArrayLayout, SharedHeader};
use crate::tier::Location;
use crate::{ArrayCache, ArrayError, Result};
use exarray_cache::Addr;
use std::sync::Arc;

/// Materialized node holding one element
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub addr: Addr,
    pub request: LoadRequest,
    pub elmt: usize,
}

/// Header fields the read path needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderView {
    pub max_idx_set: u64,
    pub idx_blk_addr: Option<Addr>,
}

pub(crate) fn header_view(cache: &ArrayCache, shared: &SharedHeader) -> Result<HeaderView> {
    let hdr = cache.protect(shared.addr(), &LoadRequest::Header, true)?;
    let view = {
        let header = hdr.header()?;
        HeaderView {
            max_idx_set: header.stats.max_idx_set,
            idx_blk_addr: header.idx_blk_addr,
        }
    };
    cache.unprotect(hdr, false)?;
    Ok(view)
}

/// Fill `out` with the element at `index`.
pub(crate) fn get(cache: &ArrayCache, shared: &SharedHeader, index: u64, out: &mut [u8]) -> Result<()> {
    let layout = shared.layout();
    if out.len() != layout.element_size() {
        return Err(ArrayError::InvalidArgument(format!(
            "output is {} bytes, elements are {}",
            out.len(),
            layout.element_size()
        )));
    }
    let location = layout.tiers().locate(index)?;

    // Held for the whole lookup so a concurrent set is seen entirely or not at all.
    let hdr = cache.protect(shared.addr(), &LoadRequest::Header, true)?;
    let (max_idx_set, idx_blk_addr) = {
        let header = hdr.header()?;
        (header.stats.max_idx_set, header.idx_blk_addr)
    };
    let leaf = match idx_blk_addr {
        Some(iblock) if index < max_idx_set => {
            find_leaf(cache, layout, shared.addr(), iblock, location)?
        }
        _ => None,
    };

    match leaf {
        Some(leaf) => {
            let node = cache.protect(leaf.addr, &leaf.request, true)?;
            out.copy_from_slice(element(&node, &leaf)?);
            cache.unprotect(node, false)?;
        }
        None => layout.fill().fill_into(out),
    }
    cache.unprotect(hdr, false)?;
    Ok(())
}

fn element<'n>(node: &'n ArrayNode, leaf: &Leaf) -> Result<&'n [u8]> {
    match node {
        ArrayNode::IndexBlock(block) => Ok(block.element(leaf.elmt)),
        ArrayNode::DataBlock(block) => Ok(block.element(leaf.elmt)),
        ArrayNode::Page(page) => Ok(page.element(leaf.elmt)),
        ArrayNode::Header(_) | ArrayNode::SuperBlock(_) => Err(ArrayError::WrongNodeKind {
            addr: leaf.addr,
            expected: leaf.request.kind(),
            found: node.kind(),
        }),
    }
}

/// Walk from the index block to the node holding `location`, without
/// creating anything.
pub(crate) fn find_leaf(
    cache: &ArrayCache,
    layout: &Arc<ArrayLayout>,
    hdr: Addr,
    iblock_addr: Addr,
    location: Location,
) -> Result<Option<Leaf>> {
    let tiers = layout.tiers();
    let iblock_req = LoadRequest::IndexBlock {
        layout: Arc::clone(layout),
        hdr,
    };

    let (sblk, dblk, elmt) = match location {
        Location::IndexBlock { elmt } => {
            return Ok(Some(Leaf {
                addr: iblock_addr,
                request: iblock_req,
                elmt,
            }));
        }
        Location::DataBlock { sblk, dblk, elmt } => (sblk, dblk, elmt),
    };

    let iblock = cache.protect(iblock_addr, &iblock_req, true)?;
    if tiers.is_direct(sblk) {
        let dblk_addr = iblock.index_block()?.dblk_addrs[tiers.direct_slot(sblk, dblk)];
        cache.unprotect(iblock, false)?;
        return Ok(dblk_addr.map(|addr| Leaf {
            addr,
            request: LoadRequest::DataBlock {
                layout: Arc::clone(layout),
                hdr,
                parent: iblock_addr,
                sblk,
                dblk,
            },
            elmt: elmt as usize,
        }));
    }

    let sblk_addr = iblock.index_block()?.sblk_addrs[tiers.sblk_slot(sblk)];
    cache.unprotect(iblock, false)?;
    let Some(sblk_addr) = sblk_addr else {
        return Ok(None);
    };

    let sblk_req = LoadRequest::SuperBlock {
        layout: Arc::clone(layout),
        hdr,
        parent: iblock_addr,
        sblk,
    };
    let sblock = cache.protect(sblk_addr, &sblk_req, true)?;
    let block = sblock.super_block()?;
    let page_nelmts = tiers.page_nelmts();
    let page = tiers.is_paged(sblk).then(|| (elmt / page_nelmts) as usize);
    let written = page.is_none_or(|page| block.page_initialized(dblk, page));
    let dblk_addr = block.dblk_addrs[dblk].filter(|_| written);
    cache.unprotect(sblock, false)?;

    let Some(dblk_addr) = dblk_addr else {
        return Ok(None);
    };
    Ok(Some(match page {
        Some(page) => Leaf {
            addr: layout.page_addr(dblk_addr, sblk, page),
            request: LoadRequest::Page {
                layout: Arc::clone(layout),
                hdr,
                parent: sblk_addr,
            },
            elmt: (elmt % page_nelmts) as usize,
        },
        None => Leaf {
            addr: dblk_addr,
            request: LoadRequest::DataBlock {
                layout: Arc::clone(layout),
                hdr,
                parent: sblk_addr,
                sblk,
                dblk,
            },
            elmt: elmt as usize,
        },
    }))
}

/// Kind and address of the node holding `index`, if materialized
pub(crate) fn locate_node(
    cache: &ArrayCache,
    shared: &SharedHeader,
    index: u64,
) -> Result<Option<(NodeKind, Addr)>> {
    let layout = shared.layout();
    let location = layout.tiers().locate(index)?;
    let view = header_view(cache, shared)?;
    let Some(iblock) = view.idx_blk_addr else {
        return Ok(None);
    };
    let leaf = find_leaf(cache, layout, shared.addr(), iblock, location)?;
    Ok(leaf.map(|leaf| (leaf.request.kind(), leaf.addr)))
}
