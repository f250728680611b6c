//! Cache entry contract.
//!
//! The cache is generic over one entry type, usually an enum of every node
//! kind a client stores. The entry knows how to decode itself from a
//! verified payload, how to encode itself, which structural parent it
//! hangs from, and which shared object (if any) owns it.

use crate::addr::Addr;
use crate::error::CacheResult;

/// Lifecycle events delivered to entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// A newly created entry was inserted
    AfterInsert,
    /// An entry was loaded from the store
    AfterLoad,
    /// A clean entry is about to leave memory
    BeforeEvict,
    /// An entry is being discarded along with its on-disk image
    BeforeRemove,
}

/// Dirty state of a resident entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// In-memory image matches the store
    Clean,
    /// In-memory image has changes not yet written
    Dirty,
}

impl EntryState {
    /// Transition after a mutation
    #[must_use]
    pub const fn mark_dirty(self) -> Self {
        Self::Dirty
    }

    /// Transition after a successful write-back
    #[must_use]
    pub const fn mark_clean(self) -> Self {
        Self::Clean
    }

    /// Whether a write-back is pending
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::Dirty)
    }
}

/// Object shared by every handle on one on-disk structure and tracked in
/// the cache's arena.
pub trait SharedState: Send + Sync {
    /// Whether nothing references the object any more and the arena may
    /// drop it.
    fn is_idle(&self) -> bool;
}

/// A node type that can live in a [`BlockCache`](crate::BlockCache).
pub trait CacheEntry: Send + Sync + Sized + 'static {
    /// Information needed to decode an image (expected kind, sizes, owner).
    type LoadContext;

    /// Shared per-structure state the entries report to.
    type Shared: SharedState;

    /// Number of payload bytes to read for a load.
    fn initial_load_len(ctx: &Self::LoadContext) -> usize;

    /// Final payload length once the first `initial_load_len` bytes are
    /// known. Kinds with variable-size images override this.
    fn final_load_len(ctx: &Self::LoadContext, prefix: &[u8]) -> CacheResult<usize> {
        let _ = prefix;
        Ok(Self::initial_load_len(ctx))
    }

    /// Decode a verified payload.
    fn decode(addr: Addr, payload: &[u8], ctx: &Self::LoadContext) -> CacheResult<Self>;

    /// Payload length of the current image.
    fn image_len(&self) -> usize;

    /// Encode the current image payload into `out`.
    fn encode(&self, out: &mut Vec<u8>) -> CacheResult<()>;

    /// Structural parent whose image holds this entry's address.
    fn flush_parent(&self) -> Option<Addr> {
        None
    }

    /// Address of the shared object that owns this entry.
    fn owner(&self) -> Option<Addr> {
        None
    }

    /// Lifecycle callback.
    fn notify(&mut self, action: Notify, shared: Option<&Self::Shared>) -> CacheResult<()> {
        let _ = (action, shared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = EntryState::Clean;
        assert!(!state.is_dirty());
        let state = state.mark_dirty();
        assert!(state.is_dirty());
        assert_eq!(state.mark_clean(), EntryState::Clean);
    }
}
