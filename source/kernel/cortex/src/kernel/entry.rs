// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hypercall and interrupt entry, the scheduler tick and recall.

use core::sync::atomic::Ordering;

use super::{Exit, Kernel, Step};
use crate::config::{NUM_USER_VECTORS, VEC_IPI_RKE, VEC_IPI_RRQ, VEC_LVT_TIMER, VEC_USER};
use crate::ec::{Continuation, EcId, ExcRegs};
use crate::hal::Hal;
use crate::hazard::Hazard;
use crate::sched::Scheduler;
use crate::types::CpuId;

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    /// Hypercall entry. `frame` holds the user registers at the syscall instruction.
    pub fn syscall(&mut self, cpu: CpuId, frame: &ExcRegs) -> Exit {
        self.cpus[cpu.as_index()].shadow.cpulocal.store(true, Ordering::Release);
        if let Some(regs) = self.regs_mut(cpu) {
            *regs = *frame;
        }
        let step = self.hypercall(cpu);
        self.run(cpu, step)
    }

    /// External interrupt entry. `frame.vec` is the vector number.
    pub fn interrupt(&mut self, cpu: CpuId, frame: &ExcRegs) -> Exit {
        let from_user = frame.user();
        if from_user {
            self.cpus[cpu.as_index()].shadow.cpulocal.store(true, Ordering::Release);
            if let Some(regs) = self.regs_mut(cpu) {
                *regs = *frame;
            }
        }

        match u8::try_from(frame.vec) {
            Ok(VEC_LVT_TIMER) => self.timer_tick(cpu),
            // Remote work arrives as hazards; the IPI only forces a kernel entry.
            Ok(VEC_IPI_RRQ) | Ok(VEC_IPI_RKE) => {}
            Ok(v) if v >= VEC_USER && usize::from(v - VEC_USER) < NUM_USER_VECTORS => {
                self.user_vector(cpu, v - VEC_USER)
            }
            _ => log_warn!(target: "irq", "spurious vector {:#x} on cpu {}", frame.vec, cpu),
        }

        if from_user {
            return self.run(cpu, Step::Continue(Continuation::RetUserIret));
        }
        let cur = self.current(cpu);
        if self.ecs.get(cur).and_then(|e| e.cont) == Some(Continuation::Idle) {
            return self.run(cpu, Step::Continue(Continuation::Idle));
        }
        Exit::Trap
    }

    /// Charges the running SC and expires semaphore timeouts.
    fn timer_tick(&mut self, cpu: CpuId) {
        let now = self.hal.now();
        let i = cpu.as_index();
        let elapsed = now.saturating_sub(self.cpus[i].last_tick);
        self.cpus[i].last_tick = now;
        let sc = self.cpus[i].current_sc;
        if sc != self.cpus[i].idle_sc && self.scs.get_mut(sc).map_or(false, |s| s.charge(elapsed)) {
            self.cpus[i].hazard.set(Hazard::SCHED);
        }
        self.expire_timeouts(cpu, now);
    }

    fn user_vector(&mut self, cpu: CpuId, vector: u8) {
        let Some(binding) = self.vectors.get(&(cpu.as_raw(), vector)).copied() else {
            log_debug!(target: "irq", "unbound vector {} on cpu {}", vector, cpu);
            return;
        };
        if let Some(kp) = self.kps.get_mut(binding.kp) {
            kp.set_bit(binding.bit);
        }
        self.sm_up(cpu, binding.sm);
    }

    /// Asks `ec` to deliver a recall exception at its next return to user
    /// mode. An EC running on another processor is kicked with an IPI.
    pub(crate) fn recall(&mut self, cpu: CpuId, ec: EcId) {
        let Some(e) = self.ecs.get(ec) else {
            return;
        };
        if e.hazard.set(Hazard::RECALL).contains(Hazard::RECALL) {
            return;
        }
        let home = e.cpu;
        if home != cpu && self.cpus[home.as_index()].current_ec == ec {
            self.hal.send_ipi(home, VEC_IPI_RKE);
        }
    }
}
