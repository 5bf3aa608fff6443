// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Grace-period reclamation of retired kernel objects
//! OWNERS: @kernel-cap-team
//! PUBLIC API: Rcu (retire/quiet/take_done/in_flight)
//! DEPENDS_ON: cap::ObjRef, types::CpuMask
//! INVARIANTS: An object retired during batch N is handed back only after every processor
//!             online at the start of batch N+1 announced a quiescent state
//!
//! The reclaimer itself is passive. It reports which processors must be
//! asked to quiesce; the kernel raises `Hazard::RCU` on them and frees what
//! `take_done` returns.

extern crate alloc;

use alloc::vec::Vec;

use crate::cap::ObjRef;
use crate::types::{CpuId, CpuMask};

#[derive(Default)]
pub struct Rcu {
    next: Vec<ObjRef>,
    current: Vec<ObjRef>,
    done: Vec<ObjRef>,
    pending: CpuMask,
    batches: u64,
}

impl Rcu {
    pub const fn new() -> Self {
        Self {
            next: Vec::new(),
            current: Vec::new(),
            done: Vec::new(),
            pending: CpuMask::EMPTY,
            batches: 0,
        }
    }

    /// Queues `obj`. Returns the processors to signal if this starts a batch.
    pub fn retire(&mut self, obj: ObjRef, online: CpuMask) -> CpuMask {
        self.next.push(obj);
        self.start(online)
    }

    /// Records a quiescent state on `cpu`. Returns the processors to signal
    /// if completing this batch starts the next one.
    pub fn quiet(&mut self, cpu: CpuId, online: CpuMask) -> CpuMask {
        if !self.pending.contains(cpu) {
            return CpuMask::EMPTY;
        }
        self.pending.remove(cpu);
        if !self.pending.is_empty() {
            return CpuMask::EMPTY;
        }
        self.done.append(&mut self.current);
        self.batches += 1;
        self.start(online)
    }

    /// Objects whose grace period has elapsed.
    pub fn take_done(&mut self) -> Vec<ObjRef> {
        core::mem::take(&mut self.done)
    }

    pub fn in_flight(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn completed_batches(&self) -> u64 {
        self.batches
    }

    fn start(&mut self, online: CpuMask) -> CpuMask {
        if self.in_flight() || self.next.is_empty() {
            return CpuMask::EMPTY;
        }
        self.current.append(&mut self.next);
        self.pending = online;
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::obj::Sm;

    #[test]
    fn batch_completes_after_every_cpu_quiesced() {
        let mut sms: Arena<Sm> = Arena::new();
        let a = ObjRef::Sm(sms.insert(Sm::new(0)));
        let online = CpuMask::first(2);
        let mut rcu = Rcu::new();
        assert_eq!(rcu.retire(a, online), online);
        assert!(rcu.quiet(CpuId::from_raw(0), online).is_empty());
        assert!(rcu.take_done().is_empty());
        assert!(rcu.quiet(CpuId::from_raw(1), online).is_empty());
        assert_eq!(rcu.take_done(), [a]);
    }

    #[test]
    fn retire_during_batch_waits_for_next_batch() {
        let mut sms: Arena<Sm> = Arena::new();
        let a = ObjRef::Sm(sms.insert(Sm::new(0)));
        let b = ObjRef::Sm(sms.insert(Sm::new(0)));
        let online = CpuMask::first(1);
        let mut rcu = Rcu::new();
        let _ = rcu.retire(a, online);
        assert!(rcu.retire(b, online).is_empty());
        // Finishing the first batch starts the second.
        assert_eq!(rcu.quiet(CpuId::BOOT, online), online);
        assert_eq!(rcu.take_done(), [a]);
        let _ = rcu.quiet(CpuId::BOOT, online);
        assert_eq!(rcu.take_done(), [b]);
        assert_eq!(rcu.completed_batches(), 2);
    }
}
