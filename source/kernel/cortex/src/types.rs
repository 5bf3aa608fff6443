// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the EC core (processor ids, selectors, cpu sets)
//! OWNERS: @kernel-team
//! PUBLIC API: Mword, CpuId, Selector, CpuMask, PAGE_BITS/PAGE_SIZE/USER_PAGE_MASK
//! DEPENDS_ON: config::MAX_CPUS
//! INVARIANTS: CpuId always indexes per-CPU tables below MAX_CPUS;
//!             CpuMask bits above MAX_CPUS stay clear

use core::fmt;

use crate::config::MAX_CPUS;

/// Machine word as seen by user space registers.
pub type Mword = u64;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
/// Offset bits within a page.
pub const USER_PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Logical processor identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    /// Boot processor.
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Decodes a user supplied processor number, rejecting values outside the per-CPU tables.
    #[inline]
    pub fn decode(raw: Mword) -> Option<Self> {
        if (raw as usize) < MAX_CPUS {
            Some(Self(raw as u16))
        } else {
            None
        }
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into a protection domain's object space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Selector(u64);

impl Selector {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Selector `n` slots after this one (event base + vector).
    #[inline]
    pub const fn offset(self, n: u64) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Set of processors, one bit per `CpuId`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const EMPTY: Self = Self(0);

    /// Mask with the first `n` processors set.
    pub const fn first(n: usize) -> Self {
        let n = if n > MAX_CPUS { MAX_CPUS } else { n };
        if n >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu.as_index() < 64 && self.0 & (1u64 << cpu.as_index()) != 0
    }

    #[inline]
    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1u64 << cpu.as_index();
    }

    #[inline]
    pub fn remove(&mut self, cpu: CpuId) {
        self.0 &= !(1u64 << cpu.as_index());
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS as u16)
            .map(CpuId::from_raw)
            .filter(move |cpu| self.contains(*cpu))
    }
}
