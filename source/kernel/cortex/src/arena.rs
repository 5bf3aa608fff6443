// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generational object arena with reference counts
//! OWNERS: @kernel-cap-team
//! PUBLIC API: Arena<T>, Handle<T>, RefOutcome
//! DEPENDS_ON: alloc::vec
//! INVARIANTS: A handle never resolves to a different object than the one it was issued for;
//!             retired objects stay readable until freed; freed slots bump their generation

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// Stable reference to an arena object.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation, _marker: PhantomData }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

enum State<T> {
    Live(T),
    /// Unreachable for new references, waiting for a grace period.
    Retired(T),
    Free,
}

struct Slot<T> {
    generation: u32,
    refs: u32,
    state: State<T>,
}

#[must_use = "the last reference must hand the object to the reclaimer"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefOutcome {
    Alive,
    /// Count dropped to zero; the object is now retired.
    LastRef,
}

/// Typed object store.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Stores `value` with a reference count of zero.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.refs = 0;
            slot.state = State::Live(value);
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, refs: 0, state: State::Live(value) });
        Handle::new(index, 0)
    }

    fn slot(&self, h: Handle<T>) -> Option<&Slot<T>> {
        self.slots.get(h.index as usize).filter(|s| s.generation == h.generation)
    }

    fn slot_mut(&mut self, h: Handle<T>) -> Option<&mut Slot<T>> {
        self.slots.get_mut(h.index as usize).filter(|s| s.generation == h.generation)
    }

    /// Live or retired object behind `h`.
    pub fn get(&self, h: Handle<T>) -> Option<&T> {
        match &self.slot(h)?.state {
            State::Live(v) | State::Retired(v) => Some(v),
            State::Free => None,
        }
    }

    pub fn get_mut(&mut self, h: Handle<T>) -> Option<&mut T> {
        match &mut self.slot_mut(h)?.state {
            State::Live(v) | State::Retired(v) => Some(v),
            State::Free => None,
        }
    }

    pub fn is_live(&self, h: Handle<T>) -> bool {
        matches!(self.slot(h).map(|s| &s.state), Some(State::Live(_)))
    }

    pub fn is_retired(&self, h: Handle<T>) -> bool {
        matches!(self.slot(h).map(|s| &s.state), Some(State::Retired(_)))
    }

    pub fn refs(&self, h: Handle<T>) -> u32 {
        self.slot(h).map_or(0, |s| s.refs)
    }

    /// Takes a reference; fails once the object is retired.
    pub fn add_ref(&mut self, h: Handle<T>) -> bool {
        match self.slot_mut(h) {
            Some(slot) if matches!(slot.state, State::Live(_)) => {
                slot.refs += 1;
                true
            }
            _ => false,
        }
    }

    pub fn del_ref(&mut self, h: Handle<T>) -> RefOutcome {
        let Some(slot) = self.slot_mut(h) else {
            return RefOutcome::Alive;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs != 0 {
            return RefOutcome::Alive;
        }
        match core::mem::replace(&mut slot.state, State::Free) {
            State::Live(v) => {
                slot.state = State::Retired(v);
                RefOutcome::LastRef
            }
            other => {
                slot.state = other;
                RefOutcome::Alive
            }
        }
    }

    /// Releases a retired slot for reuse. Only the reclaimer calls this.
    pub fn free(&mut self, h: Handle<T>) -> Option<T> {
        let slot = self.slot_mut(h)?;
        if !matches!(slot.state, State::Retired(_)) {
            return None;
        }
        let State::Retired(value) = core::mem::replace(&mut slot.state, State::Free) else {
            return None;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
        Some(value)
    }

    /// Live objects.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match &s.state {
            State::Live(v) => Some((Handle::new(i as u32, s.generation), v)),
            _ => None,
        })
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
