// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Bounded kernel event ring for post-mortem triage
//! OWNERS: @kernel-ipc-team
//! STATUS: Functional (`trace_ring` feature, default on)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (wraparound, per-kind query)
//!
//! Records a fixed number of events in-memory (no heap, no UART). Every
//! killed EC leaves a `Kill` record carrying the state `die` reports.

use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceKind {
    Kill = 1,
    Recall = 2,
    SingleStep = 3,
    Shootdown = 4,
    Timeout = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct TraceEvent {
    /// Monotonic sequence number (wraps).
    pub seq: u32,
    pub kind: TraceKind,
    pub cpu: u16,
    /// Arena index of the EC involved.
    pub ec: u32,
    /// Arena index of the SC current at the time.
    pub sc: u32,
    pub vec: u64,
    pub cs: u64,
    pub rip: u64,
    pub cr2: u64,
    pub err: u64,
}

impl TraceEvent {
    pub const fn new(kind: TraceKind, cpu: u16, ec: u32, sc: u32) -> Self {
        Self { seq: 0, kind, cpu, ec, sc, vec: 0, cs: 0, rip: 0, cr2: 0, err: 0 }
    }
}

// Power-of-two ring size for cheap masking.
const RING_SIZE: usize = 64;
const RING_MASK: usize = RING_SIZE - 1;

pub struct TraceRing {
    write_seq: AtomicUsize,
    ring: [Option<TraceEvent>; RING_SIZE],
}

impl TraceRing {
    pub const fn new() -> Self {
        Self { write_seq: AtomicUsize::new(0), ring: [None; RING_SIZE] }
    }

    #[inline]
    pub fn record(&mut self, mut ev: TraceEvent) {
        if !cfg!(feature = "trace_ring") {
            return;
        }
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        ev.seq = seq as u32;
        self.ring[seq & RING_MASK] = Some(ev);
    }

    /// Events still in the ring, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        let end = self.write_seq.load(Ordering::Relaxed);
        let start = end.saturating_sub(RING_SIZE);
        (start..end).filter_map(move |seq| self.ring[seq & RING_MASK].as_ref())
    }

    /// Most recent event of `kind`.
    pub fn last(&self, kind: TraceKind) -> Option<TraceEvent> {
        self.iter().filter(|ev| ev.kind == kind).last().copied()
    }
}

impl Default for TraceRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, feature = "trace_ring"))]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_newest_events() {
        let mut ring = TraceRing::new();
        for ec in 0..(RING_SIZE as u32 + 5) {
            ring.record(TraceEvent::new(TraceKind::Recall, 0, ec, 0));
        }
        let first = ring.iter().next().copied();
        assert_eq!(first.map(|ev| ev.ec), Some(5));
        assert_eq!(ring.iter().count(), RING_SIZE);
    }

    #[test]
    fn last_filters_by_kind() {
        let mut ring = TraceRing::new();
        let mut kill = TraceEvent::new(TraceKind::Kill, 1, 3, 2);
        kill.vec = 14;
        ring.record(kill);
        ring.record(TraceEvent::new(TraceKind::Recall, 1, 4, 2));
        let found = ring.last(TraceKind::Kill);
        assert_eq!(found.map(|ev| (ev.ec, ev.vec)), Some((3, 14)));
        assert!(ring.last(TraceKind::Shootdown).is_none());
    }
}
