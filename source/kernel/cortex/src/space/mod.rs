// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-domain object and memory spaces with derivation links
//! OWNERS: @kernel-cap-team
//! PUBLIC API: Space<V>, Node, Link, Quota, SpaceError, ObjSpace, MemSpace
//! DEPENDS_ON: obj::PdId, alloc::collections::BTreeMap
//! INVARIANTS: Every child link has a matching parent link in the child's node;
//!             a domain never holds more nodes than its quota allows

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::cap::ObjRef;
use crate::obj::PdId;

/// Position of a node: domain and index within its space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub pd: PdId,
    pub index: u64,
}

#[derive(Clone, Debug)]
pub struct Node<V> {
    pub value: V,
    /// Permissions (object space) or access rights (memory space).
    pub attr: u8,
    /// Node this one was derived from; `None` for roots.
    pub parent: Option<Link>,
    pub children: Vec<Link>,
}

impl<V> Node<V> {
    pub const fn root(value: V, attr: u8) -> Self {
        Self { value, attr, parent: None, children: Vec::new() }
    }
}

#[must_use = "space errors must be mapped to a status"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceError {
    /// Target index already populated.
    Occupied,
    OutOfMemory,
    InvalidMapping,
}

/// Sparse index-to-node map.
#[derive(Clone, Debug)]
pub struct Space<V> {
    nodes: BTreeMap<u64, Node<V>>,
}

impl<V: Copy> Space<V> {
    pub const fn new() -> Self {
        Self { nodes: BTreeMap::new() }
    }

    pub fn lookup(&self, index: u64) -> Option<&Node<V>> {
        self.nodes.get(&index)
    }

    pub fn lookup_mut(&mut self, index: u64) -> Option<&mut Node<V>> {
        self.nodes.get_mut(&index)
    }

    pub fn get(&self, index: u64) -> Option<(V, u8)> {
        self.nodes.get(&index).map(|n| (n.value, n.attr))
    }

    pub fn insert(&mut self, index: u64, node: Node<V>) -> Result<(), SpaceError> {
        if self.nodes.contains_key(&index) {
            return Err(SpaceError::Occupied);
        }
        self.nodes.insert(index, node);
        Ok(())
    }

    pub fn remove(&mut self, index: u64) -> Option<Node<V>> {
        self.nodes.remove(&index)
    }

    /// Populated indices in `[base, base + size)`.
    pub fn indices(&self, base: u64, size: u64) -> Vec<u64> {
        let end = base.saturating_add(size);
        self.nodes.range(base..end).map(|(i, _)| *i).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<V: Copy> Default for Space<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Object space: selector to object with permission bits in `attr`.
pub type ObjSpace = Space<ObjRef>;

/// Memory space: user page number to physical page number.
pub type MemSpace = Space<u64>;

/// Node budget of a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    limit: Option<usize>,
    used: usize,
}

impl Quota {
    pub const fn unlimited() -> Self {
        Self { limit: None, used: 0 }
    }

    pub const fn limited(limit: usize) -> Self {
        Self { limit: Some(limit), used: 0 }
    }

    pub fn charge(&mut self) -> Result<(), SpaceError> {
        if let Some(limit) = self.limit {
            if self.used >= limit {
                return Err(SpaceError::OutOfMemory);
            }
        }
        self.used += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        self.used = self.used.saturating_sub(1);
    }

    pub const fn used(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_refuses_occupied_slot() {
        let mut space: MemSpace = Space::new();
        assert_eq!(space.insert(4, Node::root(0x100, 3)), Ok(()));
        assert_eq!(space.insert(4, Node::root(0x200, 3)), Err(SpaceError::Occupied));
        assert_eq!(space.get(4), Some((0x100, 3)));
    }

    #[test]
    fn indices_respect_range_bounds() {
        let mut space: MemSpace = Space::new();
        for i in [1, 4, 7, 8] {
            space.insert(i, Node::root(i, 1)).unwrap();
        }
        assert_eq!(space.indices(4, 4), [4, 7]);
    }

    #[test]
    fn quota_exhausts() {
        let mut q = Quota::limited(1);
        assert!(q.charge().is_ok());
        assert_eq!(q.charge(), Err(SpaceError::OutOfMemory));
        q.release();
        assert!(q.charge().is_ok());
    }
}
