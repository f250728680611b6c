//! Teardown of every node reachable from a header.
//!
//! Children go before their parents so no resident node is ever left
//! ordered after a node that no longer exists. Each node's resident copy is
//! discarded without write-back and its stored extent is freed.

use crate::node::LoadRequest;
use crate::shared::{ArrayLayout, SharedHeader};
use crate::{ArrayCache, Result};
use exarray_cache::{Addr, CacheError};
use std::sync::Arc;
use tracing::{debug, trace};

/// Drop the resident copy of `addr`, if any, then free `extent` bytes.
fn discard(cache: &ArrayCache, addr: Addr, extent: Option<u64>) -> Result<()> {
    match cache.remove(addr) {
        Ok(()) | Err(CacheError::NotResident(_)) => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(len) = extent {
        cache.store().free(addr, len)?;
    }
    trace!("Discarded node at {}", addr);
    Ok(())
}

fn super_block(
    cache: &ArrayCache,
    layout: &Arc<ArrayLayout>,
    hdr: Addr,
    iblock: Addr,
    sblk: usize,
    addr: Addr,
) -> Result<()> {
    let request = LoadRequest::SuperBlock {
        layout: Arc::clone(layout),
        hdr,
        parent: iblock,
        sblk,
    };
    let node = cache.protect(addr, &request, true)?;
    let npages = layout.tiers().npages(sblk);
    let (dblks, pages): (Vec<Option<Addr>>, Vec<(usize, usize)>) = {
        let block = node.super_block()?;
        let pages = (0..block.dblk_addrs.len())
            .flat_map(|dblk| (0..npages).map(move |page| (dblk, page)))
            .filter(|&(dblk, page)| block.page_initialized(dblk, page))
            .collect();
        (block.dblk_addrs.clone(), pages)
    };
    cache.unprotect(node, false)?;

    for (dblk, page) in pages {
        if let Some(dblk_addr) = dblks[dblk] {
            discard(cache, layout.page_addr(dblk_addr, sblk, page), None)?;
        }
    }
    for dblk_addr in dblks.into_iter().flatten() {
        discard(cache, dblk_addr, Some(layout.dblk_extent(sblk)))?;
    }
    discard(cache, addr, Some(layout.sblk_extent(sblk)))
}

/// Remove and free every node of the array, header last.
pub(crate) fn teardown(cache: &ArrayCache, shared: &SharedHeader) -> Result<()> {
    let layout = shared.layout();
    let tiers = layout.tiers();
    let hdr = shared.addr();

    let header = cache.protect(hdr, &LoadRequest::Header, true)?;
    let iblock = header.header()?.idx_blk_addr;
    cache.unprotect(header, false)?;

    if let Some(iblock) = iblock {
        let request = LoadRequest::IndexBlock {
            layout: Arc::clone(layout),
            hdr,
        };
        let node = cache.protect(iblock, &request, true)?;
        let (dblks, sblks) = {
            let block = node.index_block()?;
            (block.dblk_addrs.clone(), block.sblk_addrs.clone())
        };
        cache.unprotect(node, false)?;

        for (slot, sblk_addr) in sblks.into_iter().enumerate() {
            if let Some(sblk_addr) = sblk_addr {
                super_block(cache, layout, hdr, iblock, tiers.iblock_nsblks() + slot, sblk_addr)?;
            }
        }
        for sblk in 0..tiers.iblock_nsblks() {
            for dblk in 0..tiers.info(sblk).ndblks as usize {
                if let Some(dblk_addr) = dblks[tiers.direct_slot(sblk, dblk)] {
                    discard(cache, dblk_addr, Some(layout.dblk_extent(sblk)))?;
                }
            }
        }
        discard(cache, iblock, Some(layout.iblock_extent()))?;
    }

    discard(cache, hdr, Some(layout.header_extent()))?;
    debug!("Tore down array at {}", hdr);
    Ok(())
}
