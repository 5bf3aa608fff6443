// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Return-to-user paths, hazard draining and the idle loop.

use core::sync::atomic::Ordering;

use super::{Exit, Kernel, Step};
use crate::config::{EXC_DB, EXC_RECALL};
use crate::diag::trace::TraceKind;
use crate::ec::{Continuation, EcId, Resume};
use crate::hal::{GdtKind, Hal};
use crate::hazard::Hazard;
use crate::sched::Scheduler;
use crate::syscall::Status;
use crate::types::CpuId;

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    fn pending(&self, cpu: CpuId, ec: EcId, mask: Hazard) -> Hazard {
        let ec_hazards = self.ecs.get(ec).map_or(Hazard::empty(), |e| e.hazard.load());
        (self.cpus[cpu.as_index()].hazard.load() | ec_hazards) & mask
    }

    /// Handles hazards in `mask` until none is pending. Finishing an RCU
    /// batch may start the next one and raise `Hazard::RCU` again, so the
    /// mask is re-read after every pass.
    fn drain(&mut self, cpu: CpuId, mask: Hazard, resume: Continuation) -> Option<Step> {
        loop {
            let pending = self.pending(cpu, self.current(cpu), mask);
            if pending.is_empty() {
                return None;
            }
            if let Some(step) = self.handle_hazard(cpu, pending, resume) {
                return Some(step);
            }
        }
    }

    /// Handles `pending` in drain order. Returns the step to take instead of
    /// returning to user mode, or `None` once nothing is left to do.
    fn handle_hazard(&mut self, cpu: CpuId, pending: Hazard, resume: Continuation) -> Option<Step> {
        let cur = self.current(cpu);
        let mut pending = pending;
        while let Some(h) = Hazard::next(pending) {
            pending.remove(h);
            if h == Hazard::RCU {
                self.rcu_quiet(cpu);
            } else if h == Hazard::SCHED {
                if let Some(ec) = self.ecs.get_mut(cur) {
                    ec.cont = Some(resume);
                }
                return Some(Step::Schedule { blocked: false });
            } else if h == Hazard::RECALL || h == Hazard::STEP {
                let (vector, kind) = if h == Hazard::RECALL {
                    (EXC_RECALL, TraceKind::Recall)
                } else {
                    (EXC_DB, TraceKind::SingleStep)
                };
                let ec = self.ecs.get_mut(cur)?;
                ec.hazard.clear(h);
                if resume.is_sysexit() {
                    ec.regs.redirect_to_iret();
                }
                ec.regs.dst_portal = vector;
                let regs = ec.regs;
                self.record(kind, cpu, cur, &regs);
                return Some(Step::Continue(Continuation::SendMsg(Resume::Iret)));
            } else if h == Hazard::DS_ES {
                if let Some(ec) = self.ecs.get(cur) {
                    ec.hazard.clear(Hazard::DS_ES);
                }
                self.hal.reload_segments();
            }
        }
        None
    }

    pub(crate) fn ret_user_sysexit(&mut self, cpu: CpuId) -> Step {
        if let Some(step) = self.drain(cpu, Hazard::SYSEXIT, Continuation::RetUserSysexit) {
            return step;
        }
        let cur = self.current(cpu);
        if self.cpus[cpu.as_index()].shadow.gdt_kind() == GdtKind::KernelOnly {
            // sysret ignores the descriptor table; take the faulting iret so
            // the work an NMI deferred still runs.
            if let Some(ec) = self.ecs.get_mut(cur) {
                ec.regs.redirect_to_iret();
            }
            return self.ret_user_iret(cpu);
        }
        self.cpus[cpu.as_index()].shadow.cpulocal.store(false, Ordering::Release);
        Step::Exit(Exit::Sysret(cur))
    }

    pub(crate) fn ret_user_iret(&mut self, cpu: CpuId) -> Step {
        if let Some(step) = self.drain(cpu, Hazard::IRET, Continuation::RetUserIret) {
            return step;
        }
        let cur = self.current(cpu);
        self.cpus[cpu.as_index()].shadow.cpulocal.store(false, Ordering::Release);
        Step::Exit(Exit::Iret(cur))
    }

    /// Idle continuation: drains processor hazards, frees what the
    /// reclaimer finished and halts. Freeing can retire further objects,
    /// so it halts only once both settled.
    pub(crate) fn idle(&mut self, cpu: CpuId) -> Step {
        loop {
            if let Some(step) = self.drain(cpu, Hazard::IDLE, Continuation::Idle) {
                return step;
            }
            self.rcu_update();
            if self.pending(cpu, self.current(cpu), Hazard::IDLE).is_empty() {
                return Step::Exit(Exit::Halt);
            }
        }
    }

    /// Completes the current hypercall with `status`.
    pub(crate) fn sys_finish(&mut self, cpu: CpuId, status: Status, clear_timeout: bool) -> Step {
        let cur = self.current(cpu);
        if clear_timeout {
            self.clr_timeout(cur);
        }
        if let Some(ec) = self.ecs.get_mut(cur) {
            ec.regs.set_status(status);
            ec.help = 0;
        }
        self.ret_user_sysexit(cpu)
    }

    pub(crate) fn clr_timeout(&mut self, ec: EcId) {
        let Some(e) = self.ecs.get_mut(ec) else {
            return;
        };
        if e.timeout.take().is_some() {
            let cpu = e.cpu;
            self.cpus[cpu.as_index()].timeouts.retain(|t| *t != ec);
        }
    }
}
