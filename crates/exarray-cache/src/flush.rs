//! Flush dependency graph.
//!
//! An edge `parent -> child` means the parent's image (which records the
//! child's address) must reach the store no later than the child's image.
//! Edges only connect resident entries and always form a DAG.

use crate::addr::Addr;
use crate::error::{CacheError, CacheResult};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Directed acyclic graph of flush dependencies between resident entries.
#[derive(Debug, Default)]
pub struct FlushGraph {
    /// child -> parents
    parents: BTreeMap<Addr, BTreeSet<Addr>>,
    /// parent -> children
    children: BTreeMap<Addr, BTreeSet<Addr>>,
}

impl FlushGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the edge exists
    pub fn contains(&self, parent: Addr, child: Addr) -> bool {
        self.children
            .get(&parent)
            .is_some_and(|set| set.contains(&child))
    }

    /// Add `parent -> child`, rejecting self edges, duplicates and cycles.
    pub fn add(&mut self, parent: Addr, child: Addr) -> CacheResult<()> {
        if parent == child {
            return Err(CacheError::Dependency(format!(
                "entry {parent} cannot depend on itself"
            )));
        }
        if self.contains(parent, child) {
            return Err(CacheError::Dependency(format!(
                "edge {parent} -> {child} already exists"
            )));
        }
        if self.reaches(child, parent) {
            return Err(CacheError::Dependency(format!(
                "edge {parent} -> {child} would create a cycle"
            )));
        }
        self.children.entry(parent).or_default().insert(child);
        self.parents.entry(child).or_default().insert(parent);
        Ok(())
    }

    /// Remove `parent -> child`.
    pub fn remove(&mut self, parent: Addr, child: Addr) -> CacheResult<()> {
        let removed = self
            .children
            .get_mut(&parent)
            .is_some_and(|set| set.remove(&child));
        if !removed {
            return Err(CacheError::Dependency(format!(
                "edge {parent} -> {child} does not exist"
            )));
        }
        prune(&mut self.children, parent);
        if let Some(set) = self.parents.get_mut(&child) {
            set.remove(&parent);
        }
        prune(&mut self.parents, child);
        Ok(())
    }

    /// Drop every edge touching `addr`. Returns how many edges went away.
    pub fn detach(&mut self, addr: Addr) -> usize {
        let mut dropped = 0;
        if let Some(parents) = self.parents.remove(&addr) {
            for parent in parents {
                if let Some(set) = self.children.get_mut(&parent) {
                    set.remove(&addr);
                }
                prune(&mut self.children, parent);
                dropped += 1;
            }
        }
        if let Some(children) = self.children.remove(&addr) {
            for child in children {
                if let Some(set) = self.parents.get_mut(&child) {
                    set.remove(&addr);
                }
                prune(&mut self.parents, child);
                dropped += 1;
            }
        }
        dropped
    }

    /// Parents of `child`
    pub fn parents_of(&self, child: Addr) -> Vec<Addr> {
        self.parents
            .get(&child)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Children of `parent`
    pub fn children_of(&self, parent: Addr) -> Vec<Addr> {
        self.children
            .get(&parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.children.values().map(BTreeSet::len).sum()
    }

    /// Order `dirty` so that every parent precedes its children.
    ///
    /// Only edges between members of `dirty` constrain the order; a clean
    /// parent is already durable. Fails if the restricted graph has a cycle.
    pub fn flush_order(&self, dirty: &BTreeSet<Addr>) -> CacheResult<Vec<Addr>> {
        let mut pending: BTreeMap<Addr, usize> = dirty
            .iter()
            .map(|&addr| {
                let count = self
                    .parents
                    .get(&addr)
                    .map_or(0, |set| set.iter().filter(|p| dirty.contains(p)).count());
                (addr, count)
            })
            .collect();

        let mut ready: VecDeque<Addr> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&addr, _)| addr)
            .collect();
        let mut order = Vec::with_capacity(dirty.len());

        while let Some(addr) = ready.pop_front() {
            order.push(addr);
            for child in self.children_of(addr) {
                if let Some(count) = pending.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        if order.len() != dirty.len() {
            return Err(CacheError::Dependency(format!(
                "flush dependencies among {} dirty entries contain a cycle",
                dirty.len()
            )));
        }
        Ok(order)
    }

    fn reaches(&self, from: Addr, to: Addr) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(addr) = stack.pop() {
            if addr == to {
                return true;
            }
            if seen.insert(addr) {
                stack.extend(self.children_of(addr));
            }
        }
        false
    }
}

fn prune(map: &mut BTreeMap<Addr, BTreeSet<Addr>>, key: Addr) {
    if map.get(&key).is_some_and(BTreeSet::is_empty) {
        map.remove(&key);
    }
}
