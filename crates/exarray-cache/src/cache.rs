//! Address-keyed block cache.
//!
//! Entries are loaded on demand, verified against their trailing checksum,
//! protected for shared or exclusive access, and written back in an order
//! that respects flush dependencies. Lock order is entry latch, then slot
//! status; the dependency graph lock may be taken while holding either but
//! never held while acquiring them.

use crate::addr::Addr;
use crate::arena::SharedArena;
use crate::buffer;
use crate::checksum::{self, CHECKSUM_LEN};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryState, Notify};
use crate::error::{CacheError, CacheResult};
use crate::flush::FlushGraph;
use crate::stats::{CacheMetrics, CacheStats};
use crate::store::BlockStore;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Bookkeeping for one resident entry
#[derive(Debug)]
struct SlotStatus {
    state: EntryState,
    pins: u32,
    /// Set once the slot has left the map; protectors holding a stale
    /// `Arc` must retry.
    evicted: bool,
    last_use: u64,
}

struct CacheSlot<E> {
    entry: Arc<RwLock<E>>,
    status: Mutex<SlotStatus>,
}

impl<E> CacheSlot<E> {
    fn new(entry: E, state: EntryState, last_use: u64) -> Self {
        Self {
            entry: Arc::new(RwLock::new(entry)),
            status: Mutex::new(SlotStatus {
                state,
                pins: 0,
                evicted: false,
                last_use,
            }),
        }
    }
}

enum Latch<E> {
    Read(ArcRwLockReadGuard<RawRwLock, E>),
    Write(ArcRwLockWriteGuard<RawRwLock, E>),
}

/// A protected (latched) resident entry.
///
/// Read-only protects share the latch; writable protects are exclusive.
/// Dropping the handle releases the latch and records any mutation.
pub struct Protected<E: CacheEntry> {
    addr: Addr,
    slot: Arc<CacheSlot<E>>,
    latch: Latch<E>,
    dirtied: bool,
}

impl<E: CacheEntry> Protected<E> {
    /// Address of the protected entry
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Whether this protect only allows reads
    pub fn is_read_only(&self) -> bool {
        matches!(self.latch, Latch::Read(_))
    }

    /// Mutable access. Changes are only written back once the entry is
    /// marked dirty, either here or through `unprotect`.
    pub fn get_mut(&mut self) -> CacheResult<&mut E> {
        match &mut self.latch {
            Latch::Read(_) => Err(CacheError::ReadOnly(self.addr)),
            Latch::Write(guard) => Ok(&mut **guard),
        }
    }

    /// Mark the entry dirty; recorded when the protect is released.
    pub fn mark_dirty(&mut self) -> CacheResult<()> {
        if self.is_read_only() {
            return Err(CacheError::ReadOnly(self.addr));
        }
        self.dirtied = true;
        Ok(())
    }
}

impl<E: CacheEntry> Deref for Protected<E> {
    type Target = E;

    fn deref(&self) -> &E {
        match &self.latch {
            Latch::Read(guard) => &**guard,
            Latch::Write(guard) => &**guard,
        }
    }
}

impl<E: CacheEntry> Drop for Protected<E> {
    fn drop(&mut self) {
        // Status changes before the latch is released so a concurrent
        // write-back never sees a mutated image marked clean.
        let mut status = self.slot.status.lock();
        if self.dirtied {
            status.state = status.state.mark_dirty();
        }
    }
}

/// Block cache over a [`BlockStore`] for one entry type.
pub struct BlockCache<E: CacheEntry> {
    store: Arc<dyn BlockStore>,
    config: CacheConfig,
    slots: DashMap<Addr, Arc<CacheSlot<E>>>,
    graph: Mutex<FlushGraph>,
    shared: SharedArena<E::Shared>,
    metrics: CacheMetrics,
    clock: AtomicU64,
}

impl<E: CacheEntry> BlockCache<E> {
    /// Create a cache over `store`
    pub fn new(store: Arc<dyn BlockStore>, config: CacheConfig) -> CacheResult<Self> {
        config.validate().map_err(CacheError::InvalidConfiguration)?;
        debug!(
            "Creating block cache (max_entries={}, sync_on_flush={})",
            config.max_entries, config.sync_on_flush
        );
        Ok(Self {
            store,
            config,
            slots: DashMap::new(),
            graph: Mutex::new(FlushGraph::new()),
            shared: SharedArena::new(),
            metrics: CacheMetrics::default(),
            clock: AtomicU64::new(0),
        })
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Arena of shared per-structure objects
    pub fn shared(&self) -> &SharedArena<E::Shared> {
        &self.shared
    }

    /// Reserve space for a stored image with `payload_len` payload bytes.
    pub fn allocate(&self, payload_len: usize) -> CacheResult<Addr> {
        self.store
            .allocate(checksum::stored_len(payload_len) as u64)
    }

    /// Release space obtained from [`allocate`](Self::allocate).
    pub fn free(&self, addr: Addr, payload_len: usize) -> CacheResult<()> {
        self.store
            .free(addr, checksum::stored_len(payload_len) as u64)
    }

    /// Insert a newly created entry. It starts dirty.
    pub fn insert(&self, addr: Addr, mut entry: E) -> CacheResult<()> {
        let shared = entry.owner().and_then(|owner| self.shared.get(owner));
        entry.notify(Notify::AfterInsert, shared.as_deref())?;

        drop(shared);

        let slot = Arc::new(CacheSlot::new(entry, EntryState::Dirty, self.tick()));
        let inserted = match self.slots.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
                true
            }
        };
        if !inserted {
            self.undo_notify(addr, &slot, Notify::BeforeRemove);
            return Err(CacheError::AlreadyResident(addr));
        }

        self.metrics.record_insert();
        trace!("Inserted entry at {}", addr);
        self.maybe_evict();
        Ok(())
    }

    /// Protect the entry at `addr`, loading it from the store if needed.
    pub fn protect(
        &self,
        addr: Addr,
        ctx: &E::LoadContext,
        read_only: bool,
    ) -> CacheResult<Protected<E>> {
        loop {
            let resident = self.slots.get(&addr).map(|slot| Arc::clone(slot.value()));
            let slot = if let Some(slot) = resident {
                self.metrics.record_hit();
                slot
            } else {
                self.metrics.record_miss();
                self.load(addr, ctx)?
            };

            let latch = if read_only {
                Latch::Read(slot.entry.read_arc())
            } else {
                Latch::Write(slot.entry.write_arc())
            };

            {
                let mut status = slot.status.lock();
                if status.evicted {
                    trace!("Entry {} evicted while waiting for latch, retrying", addr);
                    continue;
                }
                status.last_use = self.tick();
            }

            return Ok(Protected {
                addr,
                slot,
                latch,
                dirtied: false,
            });
        }
    }

    /// Release a protect. `dirty` records a mutation made through it.
    pub fn unprotect(&self, mut node: Protected<E>, dirty: bool) -> CacheResult<()> {
        if dirty {
            node.mark_dirty()?;
        }
        drop(node);
        self.maybe_evict();
        Ok(())
    }

    /// Mark a protected entry dirty
    pub fn mark_dirty(&self, node: &mut Protected<E>) -> CacheResult<()> {
        node.mark_dirty()
    }

    /// Pin a resident entry so it cannot be evicted
    pub fn pin(&self, addr: Addr) -> CacheResult<()> {
        let slot = self.slot(addr)?;
        slot.status.lock().pins += 1;
        Ok(())
    }

    /// Drop one pin
    pub fn unpin(&self, addr: Addr) -> CacheResult<()> {
        let slot = self.slot(addr)?;
        let mut status = slot.status.lock();
        if status.pins == 0 {
            return Err(CacheError::NotPinned(addr));
        }
        status.pins -= 1;
        Ok(())
    }

    /// Record that `parent` must be written no later than `child`.
    pub fn create_flush_dependency(&self, parent: Addr, child: Addr) -> CacheResult<()> {
        if !self.contains(parent) {
            return Err(CacheError::NotResident(parent));
        }
        if !self.contains(child) {
            return Err(CacheError::NotResident(child));
        }
        self.graph.lock().add(parent, child)?;
        trace!("Flush dependency {} -> {}", parent, child);
        Ok(())
    }

    /// Remove a flush dependency
    pub fn destroy_flush_dependency(&self, parent: Addr, child: Addr) -> CacheResult<()> {
        self.graph.lock().remove(parent, child)?;
        trace!("Dropped flush dependency {} -> {}", parent, child);
        Ok(())
    }

    /// Parents `addr` waits on at flush time
    pub fn flush_dependency_parents(&self, addr: Addr) -> Vec<Addr> {
        self.graph.lock().parents_of(addr)
    }

    /// Children waiting on `addr` at flush time
    pub fn flush_dependency_children(&self, addr: Addr) -> Vec<Addr> {
        self.graph.lock().children_of(addr)
    }

    /// Write every dirty entry back, parents before children.
    pub fn flush(&self) -> CacheResult<()> {
        let dirty: BTreeSet<Addr> = self
            .slots
            .iter()
            .filter(|slot| slot.status.lock().state.is_dirty())
            .map(|slot| *slot.key())
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let order = self.graph.lock().flush_order(&dirty)?;
        debug!("Flushing {} dirty entries", order.len());
        for addr in order {
            self.write_back(addr)?;
        }

        if self.config.sync_on_flush {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Write one entry back now, after any dirty flush parents.
    pub fn flush_entry(&self, addr: Addr) -> CacheResult<()> {
        if !self.contains(addr) {
            return Err(CacheError::NotResident(addr));
        }
        self.write_back(addr)?;
        if self.config.sync_on_flush {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Write back `owner` and every dirty entry it owns, parents before
    /// children. Dirty entries of other owners are written only when
    /// they are flush parents of the set.
    pub fn flush_owned(&self, owner: Addr) -> CacheResult<()> {
        let candidates: Vec<(Addr, Arc<CacheSlot<E>>)> = self
            .slots
            .iter()
            .filter(|slot| slot.status.lock().state.is_dirty())
            .map(|slot| (*slot.key(), Arc::clone(slot.value())))
            .collect();
        let dirty: BTreeSet<Addr> = candidates
            .into_iter()
            .filter(|(addr, slot)| *addr == owner || slot.entry.read().owner() == Some(owner))
            .map(|(addr, _)| addr)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let order = self.graph.lock().flush_order(&dirty)?;
        debug!("Flushing {} dirty entries of {}", order.len(), owner);
        for addr in order {
            self.write_back(addr)?;
        }

        if self.config.sync_on_flush {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Fail with out of space unless an entry with `payload_len` payload
    /// bytes is within the configured image bound.
    pub fn check_image_len(&self, payload_len: usize) -> CacheResult<()> {
        if payload_len > self.config.max_image_len {
            return Err(CacheError::OutOfSpace {
                requested: checksum::stored_len(payload_len) as u64,
                available: checksum::stored_len(self.config.max_image_len) as u64,
            });
        }
        Ok(())
    }

    /// Write `addr` back (dirty ancestors first) and drop it from memory.
    ///
    /// The caller must not hold a protect on the entry.
    pub fn evict(&self, addr: Addr) -> CacheResult<()> {
        let slot = self.slot(addr)?;
        if slot.status.lock().pins > 0 {
            return Err(CacheError::Pinned(addr));
        }
        self.write_back(addr)?;

        let mut guard = slot.entry.write_arc();
        {
            let mut status = slot.status.lock();
            if status.evicted {
                return Err(CacheError::NotResident(addr));
            }
            if status.pins > 0 {
                return Err(CacheError::Pinned(addr));
            }
            if status.state.is_dirty() {
                // Dirtied again between write-back and latch
                let image = self.encode(&guard)?;
                self.store.write_at(addr, &image)?;
                self.metrics.record_write();
                status.state = status.state.mark_clean();
            }
            status.evicted = true;
        }

        self.detach(addr, &mut guard, Notify::BeforeEvict);
        self.metrics.record_eviction();
        trace!("Evicted entry at {}", addr);
        Ok(())
    }

    /// Drop `addr` from memory without writing it back.
    ///
    /// Used when the on-disk image is being discarded. The space is not
    /// freed; call [`free`](Self::free) for that.
    pub fn remove(&self, addr: Addr) -> CacheResult<()> {
        let slot = self.slot(addr)?;
        let mut guard = slot.entry.write_arc();
        {
            let mut status = slot.status.lock();
            if status.evicted {
                return Err(CacheError::NotResident(addr));
            }
            if status.pins > 0 {
                return Err(CacheError::Pinned(addr));
            }
            status.evicted = true;
        }

        self.detach(addr, &mut guard, Notify::BeforeRemove);
        self.metrics.record_removal();
        trace!("Removed entry at {}", addr);
        Ok(())
    }

    /// Flush, then evict every unpinned entry. Returns how many left memory.
    pub fn evict_all(&self) -> CacheResult<usize> {
        self.flush()?;
        let addrs: Vec<Addr> = self.slots.iter().map(|slot| *slot.key()).collect();
        let evicted = addrs
            .into_iter()
            .filter(|&addr| self.try_evict_clean(addr))
            .count();
        debug!("Evicted {} entries", evicted);
        Ok(evicted)
    }

    /// Whether `addr` is resident
    pub fn contains(&self, addr: Addr) -> bool {
        self.slots.contains_key(&addr)
    }

    /// Whether `addr` is resident and dirty
    pub fn is_dirty(&self, addr: Addr) -> bool {
        self.slots
            .get(&addr)
            .map(|slot| Arc::clone(slot.value()))
            .is_some_and(|slot| slot.status.lock().state.is_dirty())
    }

    /// Whether `addr` is resident and pinned
    pub fn is_pinned(&self, addr: Addr) -> bool {
        self.slots
            .get(&addr)
            .map(|slot| Arc::clone(slot.value()))
            .is_some_and(|slot| slot.status.lock().pins > 0)
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is resident
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of cache activity
    pub fn stats(&self) -> CacheStats {
        let dirty = self
            .slots
            .iter()
            .filter(|slot| slot.status.lock().state.is_dirty())
            .count();
        let dependencies = self.graph.lock().edge_count();
        self.metrics.snapshot(self.slots.len(), dirty, dependencies)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn slot(&self, addr: Addr) -> CacheResult<Arc<CacheSlot<E>>> {
        self.slots
            .get(&addr)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(CacheError::NotResident(addr))
    }

    fn read_image(&self, addr: Addr, payload_len: usize) -> CacheResult<Vec<u8>> {
        if payload_len > self.config.max_image_len {
            return Err(CacheError::corruption(
                addr,
                format!(
                    "image of {} bytes exceeds the {} byte bound",
                    payload_len, self.config.max_image_len
                ),
            ));
        }
        let mut image = buffer::zeroed(checksum::stored_len(payload_len))?;
        self.store
            .read_at(addr, &mut image)
            .map_err(|e| match e {
                CacheError::OutOfBounds { .. } => {
                    CacheError::corruption(addr, format!("image extends past the store: {e}"))
                }
                other => other,
            })?;
        Ok(image)
    }

    fn read_entry(&self, addr: Addr, ctx: &E::LoadContext) -> CacheResult<E> {
        let initial = E::initial_load_len(ctx);
        let mut image = self.read_image(addr, initial)?;
        let len = E::final_load_len(ctx, &image[..initial])?;
        if len > initial {
            image = self.read_image(addr, len)?;
        } else {
            image.truncate(checksum::stored_len(len));
        }

        let payload = checksum::verify(addr, &image)?;
        E::decode(addr, payload, ctx)
    }

    fn load(&self, addr: Addr, ctx: &E::LoadContext) -> CacheResult<Arc<CacheSlot<E>>> {
        let mut entry = match self.read_entry(addr, ctx) {
            Ok(entry) => entry,
            Err(e) => {
                if e.is_corruption() {
                    self.metrics.record_corruption();
                    warn!("Failed to load entry at {}: {}", addr, e);
                }
                return Err(e);
            }
        };

        let owner = entry.owner();
        let shared = owner.and_then(|owner| self.shared.get(owner));
        entry.notify(Notify::AfterLoad, shared.as_deref())?;
        drop(shared);
        let parent = entry.flush_parent();

        let slot = Arc::new(CacheSlot::new(entry, EntryState::Clean, self.tick()));
        match self.slots.entry(addr) {
            Entry::Occupied(occupied) => {
                // Another thread loaded it first
                let winner = Arc::clone(occupied.get());
                drop(occupied);
                self.undo_notify(addr, &slot, Notify::BeforeEvict);
                return Ok(winner);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }
        self.metrics.record_load();
        trace!("Loaded entry at {}", addr);

        if let Some(parent) = parent {
            if self.contains(parent) {
                let mut graph = self.graph.lock();
                if !graph.contains(parent, addr) {
                    if let Err(e) = graph.add(parent, addr) {
                        warn!("Could not order loaded entry {} after {}: {}", addr, parent, e);
                    }
                }
            }
        }
        Ok(slot)
    }

    /// Deliver the release notification for an entry that never became
    /// visible.
    fn undo_notify(&self, addr: Addr, slot: &Arc<CacheSlot<E>>, action: Notify) {
        let mut entry = slot.entry.write();
        let owner = entry.owner();
        let shared = owner.and_then(|owner| self.shared.get(owner));
        if let Err(e) = entry.notify(action, shared.as_deref()) {
            warn!("Notification {:?} for discarded entry {} failed: {}", action, addr, e);
        }
        drop(shared);
        if let Some(owner) = owner {
            self.shared.release_if_idle(owner);
        }
    }

    /// Unlink an entry already marked evicted.
    fn detach(&self, addr: Addr, entry: &mut E, action: Notify) {
        let owner = entry.owner();
        let shared = owner.and_then(|owner| self.shared.get(owner));
        if let Err(e) = entry.notify(action, shared.as_deref()) {
            warn!("Notification {:?} for {} failed: {}", action, addr, e);
        }
        drop(shared);

        self.slots.remove(&addr);
        let dropped = self.graph.lock().detach(addr);
        if dropped > 0 {
            trace!("Dropped {} flush dependencies of {}", dropped, addr);
        }
        if let Some(owner) = owner {
            if self.shared.release_if_idle(owner) {
                trace!("Released shared state {}", owner);
            }
        }
    }

    fn encode(&self, entry: &E) -> CacheResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(entry.image_len() + CHECKSUM_LEN);
        entry.encode(&mut payload)?;
        Ok(checksum::seal(payload))
    }

    /// Write `addr` if dirty, after any dirty flush parents.
    fn write_back(&self, addr: Addr) -> CacheResult<()> {
        let parents = self.graph.lock().parents_of(addr);
        for parent in parents {
            if self.is_dirty(parent) {
                self.write_back(parent)?;
            }
        }

        let Ok(slot) = self.slot(addr) else {
            return Ok(());
        };
        let guard = slot.entry.read();
        if !slot.status.lock().state.is_dirty() {
            return Ok(());
        }

        let parents = self.graph.lock().parents_of(addr);
        if let Some(parent) = parents.into_iter().find(|&parent| self.is_dirty(parent)) {
            return Err(CacheError::FlushOrder {
                parent,
                child: addr,
            });
        }

        let image = self.encode(&guard)?;
        self.store.write_at(addr, &image)?;
        {
            let mut status = slot.status.lock();
            status.state = status.state.mark_clean();
        }
        self.metrics.record_write();
        trace!("Wrote {} bytes at {}", image.len(), addr);
        Ok(())
    }

    /// Evict a clean, unpinned, unlatched entry. Never blocks.
    fn try_evict_clean(&self, addr: Addr) -> bool {
        let Ok(slot) = self.slot(addr) else {
            return false;
        };
        let Some(mut guard) = slot.entry.try_write_arc() else {
            return false;
        };
        {
            let mut status = slot.status.lock();
            if status.evicted || status.pins > 0 || status.state.is_dirty() {
                return false;
            }
            status.evicted = true;
        }
        self.detach(addr, &mut guard, Notify::BeforeEvict);
        self.metrics.record_eviction();
        true
    }

    /// Shrink toward `max_entries`, least recently used first. Only clean
    /// leaves of the dependency graph are candidates.
    fn maybe_evict(&self) {
        let excess = self.slots.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return;
        }

        let mut candidates: Vec<(u64, Addr)> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let status = slot.status.lock();
                (!status.state.is_dirty() && status.pins == 0)
                    .then_some((status.last_use, *slot.key()))
            })
            .collect();
        {
            let graph = self.graph.lock();
            candidates.retain(|&(_, addr)| graph.children_of(addr).is_empty());
        }
        candidates.sort_unstable();

        let evicted = candidates
            .into_iter()
            .map(|(_, addr)| addr)
            .filter(|&addr| self.try_evict_clean(addr))
            .take(excess)
            .count();
        if evicted > 0 {
            trace!("Evicted {} entries over capacity", evicted);
        }
    }
}

impl<E: CacheEntry> std::fmt::Debug for BlockCache<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("resident", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl<E: CacheEntry> Drop for BlockCache<E> {
    fn drop(&mut self) {
        let dirty = self
            .slots
            .iter()
            .filter(|slot| slot.status.lock().state.is_dirty())
            .count();
        if dirty > 0 {
            warn!("Block cache dropped with {} dirty entries", dirty);
        }
    }
}
