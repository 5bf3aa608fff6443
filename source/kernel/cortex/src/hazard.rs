// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deferred-work flags checked at every user-boundary crossing
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Hazard, AtomicHazard, drain masks
//! DEPENDS_ON: bitflags, core::sync::atomic
//! INVARIANTS: Remote processors only set bits; the owning processor reads and clears them.
//!             Drain order is fixed: RCU, SCHED, RECALL, STEP.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Pending conditions. CPU hazards: SCHED, RCU, TR. EC hazards: RECALL, STEP, DS_ES.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Hazard: u32 {
        /// Reschedule before returning to user mode.
        const SCHED = 1 << 0;
        /// Announce a quiescent state to the reclaimer.
        const RCU = 1 << 1;
        /// Task-register limit went stale; repair on the next #GP.
        const TR = 1 << 2;
        /// Deliver a recall exception.
        const RECALL = 1 << 3;
        /// Deliver a single-step exception.
        const STEP = 1 << 4;
        /// Reload DS/ES before sysret.
        const DS_ES = 1 << 5;
    }
}

impl Hazard {
    /// Checked on the sysret path.
    pub const SYSEXIT: Self = Self::RECALL
        .union(Self::STEP)
        .union(Self::RCU)
        .union(Self::DS_ES)
        .union(Self::SCHED);
    /// Checked on the iret path; segments are restored from the frame.
    pub const IRET: Self = Self::RECALL.union(Self::STEP).union(Self::RCU).union(Self::SCHED);
    /// Checked by the idle loop.
    pub const IDLE: Self = Self::RCU.union(Self::SCHED);

    /// Next hazard to handle out of `pending`, in drain order.
    pub fn next(pending: Self) -> Option<Self> {
        [Self::RCU, Self::SCHED, Self::RECALL, Self::STEP, Self::DS_ES]
            .into_iter()
            .find(|h| pending.contains(*h))
    }
}

/// Hazard bitmask shared with remote processors.
#[derive(Debug, Default)]
pub struct AtomicHazard(AtomicU32);

impl AtomicHazard {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> Hazard {
        Hazard::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Sets `h` and returns the bits that were set before.
    #[inline]
    pub fn set(&self, h: Hazard) -> Hazard {
        Hazard::from_bits_truncate(self.0.fetch_or(h.bits(), Ordering::AcqRel))
    }

    #[inline]
    pub fn clear(&self, h: Hazard) {
        self.0.fetch_and(!h.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn contains(&self, h: Hazard) -> bool {
        self.load().contains(h)
    }
}
