// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Run-queue collaborator of the EC core
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (trait), PriorityScheduler, EnqueueOutcome, EnqueueRejectReason
//! DEPENDS_ON: obj::ScId, config::{MAX_CPUS, NUM_PRIORITIES}
//! INVARIANTS: Bounded queue capacity + deterministic reject on saturation; RR within a priority;
//!             highest priority first; queues are per processor and never stolen from
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::collections::VecDeque;
use core::{array, marker::PhantomData};

use crate::config::{MAX_CPUS, NUM_PRIORITIES};
use crate::obj::ScId;
use crate::types::CpuId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct QueueCapacity(usize);

impl QueueCapacity {
    const fn new(raw: usize) -> Self {
        Self(raw)
    }

    const fn raw(self) -> usize {
        self.0
    }
}

const PRIO_QUEUE_CAPACITY: QueueCapacity = QueueCapacity::new(64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    QueueFull { prio: u8, capacity: usize },
    InvalidCpu { cpu: CpuId },
    InvalidPriority { prio: u8 },
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Rejected(EnqueueRejectReason),
}

/// Ready-queue operations the EC core consumes.
pub trait Scheduler {
    /// Makes `sc` runnable on `cpu` at `prio`.
    fn enqueue(&mut self, cpu: CpuId, sc: ScId, prio: u8) -> EnqueueOutcome;
    /// Removes and returns the next SC to run on `cpu`.
    fn pick_next(&mut self, cpu: CpuId) -> Option<ScId>;
    /// Drops every queued reference to `sc`.
    fn remove(&mut self, sc: ScId);
    fn queued(&self, cpu: CpuId) -> usize;
}

struct CpuRunQueues {
    queues: [VecDeque<ScId>; NUM_PRIORITIES],
}

impl CpuRunQueues {
    fn new() -> Self {
        Self { queues: array::from_fn(|_| VecDeque::new()) }
    }
}

/// Per-CPU round-robin scheduler with strict priorities.
///
/// `PriorityScheduler` is `!Send` and `!Sync`: it is owned by the kernel
/// value and only touched by whichever processor holds it.
pub struct PriorityScheduler {
    cpus: [CpuRunQueues; MAX_CPUS],
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(PriorityScheduler: Send, Sync);

impl PriorityScheduler {
    pub fn new() -> Self {
        Self { cpus: array::from_fn(|_| CpuRunQueues::new()), _not_send_sync: PhantomData }
    }

    #[inline]
    const fn queue_capacity_for(_prio: u8) -> QueueCapacity {
        PRIO_QUEUE_CAPACITY
    }

    #[inline]
    fn bounded_push(
        queue: &mut VecDeque<ScId>,
        sc: ScId,
        prio: u8,
        capacity: QueueCapacity,
    ) -> EnqueueOutcome {
        if queue.len() >= capacity.raw() {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull {
                prio,
                capacity: capacity.raw(),
            });
        }
        queue.push_back(sc);
        EnqueueOutcome::Enqueued
    }

    pub fn queue_len(&self, cpu: CpuId, prio: u8) -> usize {
        self.cpus
            .get(cpu.as_index())
            .and_then(|rq| rq.queues.get(prio as usize))
            .map_or(0, VecDeque::len)
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn enqueue(&mut self, cpu: CpuId, sc: ScId, prio: u8) -> EnqueueOutcome {
        let Some(rq) = self.cpus.get_mut(cpu.as_index()) else {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::InvalidCpu { cpu });
        };
        let Some(queue) = rq.queues.get_mut(prio as usize) else {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::InvalidPriority { prio });
        };
        log_trace!(target: "sched", "enqueue sc={:?} cpu={} prio={}", sc, cpu, prio);
        Self::bounded_push(queue, sc, prio, Self::queue_capacity_for(prio))
    }

    fn pick_next(&mut self, cpu: CpuId) -> Option<ScId> {
        let rq = self.cpus.get_mut(cpu.as_index())?;
        rq.queues.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    fn remove(&mut self, sc: ScId) {
        for rq in &mut self.cpus {
            for q in &mut rq.queues {
                q.retain(|s| *s != sc);
            }
        }
    }

    fn queued(&self, cpu: CpuId) -> usize {
        self.cpus.get(cpu.as_index()).map_or(0, |rq| rq.queues.iter().map(VecDeque::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::obj::Sc;

    fn scs(n: usize) -> (Arena<Sc>, alloc::vec::Vec<ScId>) {
        let mut ecs: Arena<crate::ec::Ec> = Arena::new();
        let mut pds: Arena<crate::obj::Pd> = Arena::new();
        let pd = pds.insert(crate::obj::Pd::new(false, None));
        let ec = ecs.insert(crate::ec::Ec::idle(pd, CpuId::BOOT));
        let mut arena = Arena::new();
        let ids = (0..n).map(|_| arena.insert(Sc::new(ec, CpuId::BOOT, 1, 10))).collect();
        (arena, ids)
    }

    #[test]
    fn priority_ordering() {
        let (_arena, ids) = scs(3);
        let mut sched = PriorityScheduler::new();
        let cpu = CpuId::BOOT;
        assert!(matches!(sched.enqueue(cpu, ids[0], 1), EnqueueOutcome::Enqueued));
        assert!(matches!(sched.enqueue(cpu, ids[1], 50), EnqueueOutcome::Enqueued));
        assert!(matches!(sched.enqueue(cpu, ids[2], 127), EnqueueOutcome::Enqueued));
        assert_eq!(sched.pick_next(cpu), Some(ids[2]));
        assert_eq!(sched.pick_next(cpu), Some(ids[1]));
        assert_eq!(sched.pick_next(cpu), Some(ids[0]));
        assert_eq!(sched.pick_next(cpu), None);
    }

    #[test]
    fn round_robin_within_priority() {
        let (_arena, ids) = scs(2);
        let mut sched = PriorityScheduler::new();
        let cpu = CpuId::BOOT;
        let _ = sched.enqueue(cpu, ids[0], 5);
        let _ = sched.enqueue(cpu, ids[1], 5);
        let first = sched.pick_next(cpu);
        assert_eq!(first, Some(ids[0]));
        let _ = sched.enqueue(cpu, ids[0], 5);
        assert_eq!(sched.pick_next(cpu), Some(ids[1]));
    }

    #[test]
    fn queues_are_per_cpu() {
        let (_arena, ids) = scs(1);
        let mut sched = PriorityScheduler::new();
        let _ = sched.enqueue(CpuId::from_raw(1), ids[0], 5);
        assert_eq!(sched.pick_next(CpuId::BOOT), None);
        assert_eq!(sched.queued(CpuId::from_raw(1)), 1);
        sched.remove(ids[0]);
        assert_eq!(sched.queued(CpuId::from_raw(1)), 0);
    }

    #[test]
    fn test_reject_enqueue_above_bound() {
        let (_arena, ids) = scs(1);
        let mut sched = PriorityScheduler::new();
        let cpu = CpuId::BOOT;
        let capacity = PriorityScheduler::queue_capacity_for(9).raw();
        for _ in 0..capacity {
            assert!(matches!(sched.enqueue(cpu, ids[0], 9), EnqueueOutcome::Enqueued));
        }
        let rejected = sched.enqueue(cpu, ids[0], 9);
        assert!(matches!(
            rejected,
            EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull { prio: 9, capacity: cap })
                if cap == capacity
        ));
        assert_eq!(sched.queue_len(cpu, 9), capacity);
    }

    #[test]
    fn test_reject_invalid_cpu_and_priority() {
        let (_arena, ids) = scs(1);
        let mut sched = PriorityScheduler::new();
        let bad_cpu = CpuId::from_raw(MAX_CPUS as u16);
        assert!(matches!(
            sched.enqueue(bad_cpu, ids[0], 1),
            EnqueueOutcome::Rejected(EnqueueRejectReason::InvalidCpu { .. })
        ));
        assert!(matches!(
            sched.enqueue(CpuId::BOOT, ids[0], NUM_PRIORITIES as u8),
            EnqueueOutcome::Rejected(EnqueueRejectReason::InvalidPriority { .. })
        ));
    }
}
