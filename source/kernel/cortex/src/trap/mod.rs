// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Exception entry: fixups, lazy object-window faults, deferred NMI work and
//!          delivery to user handlers
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::exception, Kernel::nmi, nmi::{handle_exc_altstack, AltstackOutcome}
//! DEPENDS_ON: kernel::Kernel, hal::{Platform, NmiSafe}, ipc (send_msg/die)
//! INVARIANTS: A #GP at the return-to-user iret with kernel CS is the deferred-NMI signature and
//!             is checked before anything else; user exceptions are always delivered through the
//!             faulting EC's event base or kill it; kernel faults without a fixup kill the
//!             current EC
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod nmi;

use core::sync::atomic::Ordering;

use crate::config::{EXC_GP, EXC_MC, EXC_PF, SEL_KERN_CODE, SPC_LOCAL_OBJ};
use crate::ec::{Continuation, ExcRegs, Resume};
use crate::hal::{GdtKind, Hal};
use crate::hazard::Hazard;
use crate::kernel::{Exit, Kernel, Step};
use crate::sched::Scheduler;
use crate::types::{CpuId, PAGE_BITS};

use self::nmi::{handle_exc_altstack, AltstackOutcome};

/// How a page fault was resolved.
enum PfOutcome {
    /// Fixed in the kernel; retry the access.
    Resolved,
    /// Belongs to the user handler.
    User,
    Fatal,
}

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    /// Exception entry on the regular kernel stack.
    pub fn exception(&mut self, cpu: CpuId, frame: &mut ExcRegs) -> Exit {
        if let Some(step) = self.handle_deferred_nmi_work(cpu, frame) {
            return self.run(cpu, step);
        }

        let from_user = frame.user();
        if from_user {
            self.cpus[cpu.as_index()].shadow.cpulocal.store(true, Ordering::Release);
            if let Some(regs) = self.regs_mut(cpu) {
                *regs = *frame;
            }
        } else {
            self.cpus[cpu.as_index()].last_trap = Some(*frame);
        }

        match frame.vec {
            EXC_GP => {
                if self.handle_exc_gp(cpu, frame) {
                    return Exit::Trap;
                }
            }
            EXC_PF => match self.handle_exc_pf(cpu, frame) {
                PfOutcome::Resolved => return Exit::Trap,
                PfOutcome::User => {}
                PfOutcome::Fatal => {
                    let step = self.die_with(cpu, "#PF (kernel)", frame);
                    return self.run(cpu, step);
                }
            },
            EXC_MC => self.hal.machine_check(),
            _ => {}
        }

        if from_user {
            if let Some(regs) = self.regs_mut(cpu) {
                regs.dst_portal = frame.vec;
            }
            return self.run(cpu, Step::Continue(Continuation::SendMsg(Resume::Iret)));
        }
        let step = self.die_with(cpu, "EXC", frame);
        self.run(cpu, step)
    }

    /// Alternate-stack entry for NMIs and double faults.
    pub fn nmi(&self, cpu: CpuId, frame: &mut ExcRegs) -> AltstackOutcome {
        handle_exc_altstack(&self.cpus[cpu.as_index()].shadow, &self.hal, frame)
    }

    /// Finishes what an NMI in kernel mode deferred. Recognised by a #GP
    /// raised by the return-to-user iret under the kernel-only table.
    fn handle_deferred_nmi_work(&mut self, cpu: CpuId, frame: &ExcRegs) -> Option<Step> {
        let labels = self.hal.labels();
        if frame.vec != EXC_GP || frame.cs != SEL_KERN_CODE || frame.rip != labels.iret_to_user {
            return None;
        }
        let shadow = &self.cpus[cpu.as_index()].shadow;
        shadow.cpulocal.store(true, Ordering::Release);

        self.hal.load_gdt(GdtKind::Full);
        shadow.gdt.store(GdtKind::Full as u8, Ordering::Release);
        if shadow.vmcs_active.load(Ordering::Acquire) {
            self.hal.write_host_sel_cs(SEL_KERN_CODE as u16);
        }

        if shadow.stale_tlb.swap(false, Ordering::AcqRel) {
            self.hal.flush_all();
        }
        log_trace!(target: "trap", "deferred nmi work on cpu {}", cpu);
        Some(Step::Continue(Continuation::RetUserIret))
    }

    /// Kernel #GP: fixup table first, then a stale task register.
    fn handle_exc_gp(&mut self, cpu: CpuId, frame: &mut ExcRegs) -> bool {
        if let Some(fixup) = self.hal.fixups().iter().find(|f| f.fault_rip == frame.rip) {
            frame.rip = fixup.resume_rip;
            frame.rfl |= ExcRegs::EFL_CF;
            return true;
        }
        let hazard = &self.cpus[cpu.as_index()].hazard;
        if hazard.contains(Hazard::TR) {
            hazard.clear(Hazard::TR);
            self.hal.reload_tss();
            return true;
        }
        false
    }

    fn handle_exc_pf(&mut self, cpu: CpuId, frame: &ExcRegs) -> PfOutcome {
        if frame.err & ExcRegs::ERR_U != 0 {
            return PfOutcome::User;
        }
        if frame.cr2 >= SPC_LOCAL_OBJ {
            let page = (frame.cr2 - SPC_LOCAL_OBJ) >> PAGE_BITS;
            let pd = self.current_pd(cpu);
            if let Some(pd) = self.pds.get_mut(pd) {
                pd.obj_window.insert(page);
            }
            return PfOutcome::Resolved;
        }
        PfOutcome::Fatal
    }
}
