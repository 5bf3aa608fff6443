// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous portal IPC: call, exception messages, reply and abort
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: (crate) sys_call, send_msg, recv_kern, recv_user, sys_reply, reply, die,
//!             sm_up, sm_down
//! DEPENDS_ON: kernel::Kernel, xfer (typed items), utcb::Utcb
//! INVARIANTS: A callee accepts a call only while `cont == None`; caller and callee are linked
//!             before the callee runs and unlinked exactly once on reply; a killed EC's caller
//!             always learns about it (Aborted or Dead), never hangs
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;

use crate::cap::{ObjRef, Perms};
use crate::diag::trace::TraceKind;
use crate::ec::{Continuation, EcId, ExcRegs, Mtd, Resume};
use crate::hal::Hal;
use crate::hazard::Hazard;
use crate::kernel::{Exit, Kernel, Step};
use crate::obj::{Pt, Sm, SmId};
use crate::sched::Scheduler;
use crate::syscall::Status;
use crate::types::CpuId;

/// Call flag: fail with `Timeout` instead of helping a busy callee.
pub const DISABLE_BLOCKING: u8 = 1 << 0;

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    /// `call`: rendezvous with the local EC behind a portal.
    pub(crate) fn sys_call(&mut self, cpu: CpuId) -> Step {
        let cur = self.current(cpu);
        let regs = self.regs(cpu);
        let pt = match self.lookup::<Pt>(cpu, regs.sel(), Perms::PT_CALL) {
            Ok(pt) => pt,
            Err(status) => return self.sys_finish(cpu, status, false),
        };
        let Some(&Pt { ec: dst, ip, id, .. }) = self.pts.get(pt) else {
            return self.sys_finish(cpu, Status::BadCapability, false);
        };
        let (Some(caller_cpu), Some((dst_cpu, dst_cont))) =
            (self.ecs.get(cur).map(|e| e.cpu), self.ecs.get(dst).map(|e| (e.cpu, e.cont)))
        else {
            return self.sys_finish(cpu, Status::BadCapability, false);
        };
        if caller_cpu != dst_cpu {
            return self.sys_finish(cpu, Status::BadCpu, false);
        }

        if dst_cont.is_none() {
            if let Some(caller) = self.ecs.get_mut(cur) {
                caller.cont = Some(Continuation::RetUserSysexit);
                caller.help = 0;
            }
            self.set_partner(cpu, cur, dst);
            if let Some(callee) = self.ecs.get_mut(dst) {
                callee.cont = Some(Continuation::RecvUser);
                callee.regs.set_pt(id);
                callee.regs.set_ip(ip);
            }
            return Step::Resume(dst);
        }

        if regs.flags() & DISABLE_BLOCKING == 0 {
            if let Some(step) = self.help(cpu, dst, Continuation::SysCall) {
                return step;
            }
        }
        self.sys_finish(cpu, Status::Timeout, false)
    }

    /// Delivers the exception named by `regs.dst_portal` to the handler
    /// portal in the current EC's event base.
    pub(crate) fn send_msg(&mut self, cpu: CpuId, resume: Resume) -> Step {
        let cur = self.current(cpu);
        let sender = self.ecs.get(cur).map(|e| (e.evt, e.regs.dst_portal, e.cpu));
        let Some((evt, vector, ec_cpu)) = sender else {
            return Step::Schedule { blocked: true };
        };
        let sel = evt.offset(vector);
        let pt = self
            .pds
            .get(self.current_pd(cpu))
            .and_then(|pd| pd.cast::<Pt>(sel, Perms::empty()).ok())
            .and_then(|pt| self.pts.get(pt).copied());
        let Some(pt) = pt else {
            return self.die(cpu, "PT not found");
        };
        let Some((dst_cpu, dst_cont)) = self.ecs.get(pt.ec).map(|e| (e.cpu, e.cont)) else {
            return self.die(cpu, "PT not found");
        };
        if dst_cpu != ec_cpu {
            return self.die(cpu, "PT wrong CPU");
        }

        if dst_cont.is_none() {
            if let Some(sender) = self.ecs.get_mut(cur) {
                sender.cont = Some(resume.continuation());
                sender.regs.mtd = pt.mtd;
                sender.help = 0;
            }
            self.set_partner(cpu, cur, pt.ec);
            if let Some(handler) = self.ecs.get_mut(pt.ec) {
                handler.cont = Some(Continuation::RecvKern);
                handler.regs.set_pt(pt.id);
                handler.regs.set_ip(pt.ip);
            }
            return Step::Resume(pt.ec);
        }

        if let Some(step) = self.help(cpu, pt.ec, Continuation::SendMsg(resume)) {
            return step;
        }
        self.die(cpu, "IPC Timeout")
    }

    /// Handler side of an exception message: exposes the faulting state in
    /// the handler's UTCB.
    pub(crate) fn recv_kern(&mut self, cpu: CpuId) -> Step {
        let cur = self.current(cpu);
        let Some(caller) = self.ecs.get(cur).and_then(|e| e.rcap) else {
            log_error!(target: "ipc", "kernel message for ec={:?} without sender", cur);
            return self.ret_user_sysexit(cpu);
        };
        let Some((caller_cont, caller_regs)) = self.ecs.get(caller).map(|e| (e.cont, e.regs)) else {
            return self.ret_user_sysexit(cpu);
        };
        if caller_cont == Some(Continuation::RetUserIret) {
            let fpu = self
                .ecs
                .get_mut(cur)
                .and_then(|e| e.utcb.as_deref_mut())
                .map_or(false, |utcb| utcb.load_exc(&caller_regs));
            if fpu {
                self.sync_fpu(cpu, caller, false);
                let state = self.ecs.get(caller).map(|e| e.fpu.clone());
                if let Some(utcb) = self.ecs.get_mut(cur).and_then(|e| e.utcb.as_deref_mut()) {
                    utcb.fpu = state;
                }
            }
        }
        self.ret_user_sysexit(cpu)
    }

    /// Callee side of a call: copies the message and transfers typed items.
    pub(crate) fn recv_user(&mut self, cpu: CpuId) -> Step {
        let cur = self.current(cpu);
        let Some(caller) = self.ecs.get(cur).and_then(|e| e.rcap) else {
            log_error!(target: "ipc", "user message for ec={:?} without caller", cur);
            return self.ret_user_sysexit(cpu);
        };
        self.copy_message(caller, cur);

        let has_items = self
            .ecs
            .get(caller)
            .and_then(|e| e.utcb.as_deref())
            .map_or(false, |utcb| !utcb.items.is_empty());
        if has_items {
            if let Err(err) = self.delegate_ipc(cpu, true) {
                let status = Status::from(err);
                log_debug!(target: "ipc", "call from ec={:?} aborted: {}", caller, status);
                if let Some(c) = self.ecs.get_mut(caller) {
                    c.cont = Some(Continuation::SysFinish { status, clear_timeout: false });
                }
                return self.reply(cpu, None, None);
            }
        }
        self.ret_user_sysexit(cpu)
    }

    /// `reply`: answers the current caller (if any) and waits for the next one.
    pub(crate) fn sys_reply(&mut self, cpu: CpuId) -> Step {
        let cur = self.current(cpu);
        let regs = self.regs(cpu);
        let mut sm = None;

        if let Some(caller) = self.ecs.get(cur).and_then(|e| e.rcap) {
            if regs.sel() != 0 {
                if let Ok(handle) = self.lookup::<Sm>(cpu, regs.sel(), Perms::empty()) {
                    sm = Some(handle);
                    if let Some(c) = self.ecs.get_mut(caller) {
                        if c.cont == Some(Continuation::RetUserSysexit) {
                            c.cont = Some(Continuation::SysCall);
                        }
                    }
                }
            }

            let has_items = self
                .ecs
                .get(cur)
                .and_then(|e| e.utcb.as_deref())
                .map_or(false, |utcb| !utcb.items.is_empty());
            if has_items {
                if let Err(err) = self.delegate_ipc(cpu, false) {
                    self.reply_failed(caller, Status::from(err));
                }
            }

            match self.ecs.get(caller).and_then(|e| e.cont) {
                Some(Continuation::RetUserSysexit) => self.copy_message(cur, caller),
                Some(Continuation::RetUserIret) => self.reply_exception(cpu, cur, caller),
                _ => {}
            }
        }
        self.reply(cpu, None, sm)
    }

    /// Hands the error of a failed reply transfer to the caller. An
    /// exception sender cannot take a status; it resumes without the items.
    fn reply_failed(&mut self, caller: EcId, status: Status) {
        let Some(c) = self.ecs.get_mut(caller) else {
            return;
        };
        match c.cont {
            Some(Continuation::RetUserIret) => {
                log_warn!(target: "ipc", "reply items to ec={:?} dropped: {}", caller, status);
            }
            _ => c.cont = Some(Continuation::SysFinish { status, clear_timeout: false }),
        }
    }

    /// Writes the handler's answer back into the faulting EC's frame.
    fn reply_exception(&mut self, cpu: CpuId, handler: EcId, caller: EcId) {
        let Some(utcb) = self.ecs.get_mut(handler).and_then(|e| e.utcb.take()) else {
            return;
        };
        let mut fpu = false;
        if let Some(c) = self.ecs.get_mut(caller) {
            fpu = utcb.save_exc(&mut c.regs);
            if utcb.mtd.contains(Mtd::DS_ES) {
                c.hazard.set(Hazard::DS_ES);
            }
            if let (true, Some(state)) = (fpu, utcb.fpu.as_ref()) {
                c.fpu = state.clone();
            }
        }
        if let Some(e) = self.ecs.get_mut(handler) {
            e.utcb = Some(utcb);
        }
        if fpu {
            self.sync_fpu(cpu, caller, true);
        }
    }

    fn copy_message(&mut self, from: EcId, to: EcId) {
        let Some(mut dst) = self.ecs.get_mut(to).and_then(|e| e.utcb.take()) else {
            return;
        };
        if let Some(src) = self.ecs.get(from).and_then(|e| e.utcb.as_deref()) {
            src.save(&mut dst);
        }
        if let Some(e) = self.ecs.get_mut(to) {
            e.utcb = Some(dst);
        }
    }

    /// Ends the current EC's part in a call. `cont` becomes its
    /// continuation (`None`: available for the next caller). With `sm` the
    /// caller waits on the semaphore before it resumes.
    pub(crate) fn reply(
        &mut self,
        cpu: CpuId,
        cont: Option<Continuation>,
        sm: Option<SmId>,
    ) -> Step {
        let cur = self.current(cpu);
        let Some(ec) = self.ecs.get_mut(cur) else {
            return Step::Schedule { blocked: true };
        };
        ec.cont = cont;
        if ec.glb {
            return Step::Schedule { blocked: true };
        }
        let Some(caller) = ec.rcap else {
            return Step::Activate(self.sc_ec(cpu));
        };

        let clr = self.clr_partner(cpu, caller);
        let sc = self.cpus[cpu.as_index()].current_sc;
        if self.scs.get(sc).map(|s| s.ec) == Some(caller) && self.scs.is_retired(sc) {
            return Step::Schedule { blocked: true };
        }
        if let Some(sm) = sm {
            if let Some(step) = self.sm_down(cpu, sm, false, 0, caller, clr) {
                return step;
            }
        }
        if !clr {
            return Step::Activate(self.sc_ec(cpu));
        }
        Step::Resume(caller)
    }

    /// EC bound to the current SC.
    fn sc_ec(&self, cpu: CpuId) -> EcId {
        let percpu = &self.cpus[cpu.as_index()];
        self.scs.get(percpu.current_sc).map_or(percpu.idle_ec, |sc| sc.ec)
    }

    /// Kills the current EC with the state in its registers.
    pub(crate) fn die(&mut self, cpu: CpuId, reason: &str) -> Step {
        let regs = self.regs(cpu);
        self.die_with(cpu, reason, &regs)
    }

    /// Kills the current EC, reporting `regs` (a kernel frame for kernel faults).
    pub(crate) fn die_with(&mut self, cpu: CpuId, reason: &str, regs: &ExcRegs) -> Step {
        let cur = self.current(cpu);
        let sc = self.cpus[cpu.as_index()].current_sc;
        log_warn!(
            target: "ec",
            "killed ec={:?} sc={:?} v={:#x} cs={:#x} rip={:#x} cr2={:#x} err={:#x} ({})",
            cur, sc, regs.vec, regs.cs, regs.rip, regs.cr2, regs.err, reason
        );
        self.record(TraceKind::Kill, cpu, cur, regs);
        if self.is_idle_ec(cur) {
            log_error!(target: "ec", "fault in idle context on cpu {}", cpu);
            return Step::Exit(Exit::Halt);
        }

        if let Some(caller) = self.ecs.get(cur).and_then(|e| e.rcap) {
            if let Some(c) = self.ecs.get_mut(caller) {
                c.cont = Some(if c.cont == Some(Continuation::RetUserSysexit) {
                    Continuation::SysFinish { status: Status::Aborted, clear_timeout: false }
                } else {
                    Continuation::Dead
                });
            }
        }
        self.reply(cpu, Some(Continuation::Dead), None)
    }

    /// Wakes the oldest waiter of `sm`, or banks the signal.
    pub(crate) fn sm_up(&mut self, cpu: CpuId, sm: SmId) {
        let Some(s) = self.sms.get_mut(sm) else {
            return;
        };
        let Some(ec) = s.dequeue() else {
            s.counter += 1;
            return;
        };
        self.release(cpu, ec, None);
        self.put(ObjRef::Ec(ec));
    }

    /// Consumes a signal of `sm` for `ec`, or blocks `ec` on it until
    /// `deadline` (0: no timeout). `None` when a signal was available and
    /// the caller simply continues.
    ///
    /// With `block == false` the current SC is not parked on `ec`; the
    /// processor reschedules instead.
    pub(crate) fn sm_down(
        &mut self,
        cpu: CpuId,
        sm: SmId,
        zero: bool,
        deadline: u64,
        ec: EcId,
        block: bool,
    ) -> Option<Step> {
        if self.sms.get_mut(sm)?.try_down(zero) {
            return None;
        }
        if !self.ecs.add_ref(ec) {
            return Some(Step::Schedule { blocked: block });
        }
        if let Some(s) = self.sms.get_mut(sm) {
            s.enqueue(ec);
        }
        let e = self.ecs.get_mut(ec)?;
        e.blocked = true;
        if !block {
            return Some(Step::Schedule { blocked: false });
        }
        if deadline != 0 {
            e.timeout = Some((deadline, sm));
            let home = e.cpu;
            self.cpus[home.as_index()].timeouts.push(ec);
        }
        self.block_sc(cpu, ec)
    }

    /// Fails every semaphore wait whose deadline passed.
    pub(crate) fn expire_timeouts(&mut self, cpu: CpuId, now: u64) {
        let due: Vec<EcId> = self.cpus[cpu.as_index()]
            .timeouts
            .iter()
            .copied()
            .filter(|ec| self.ecs.get(*ec).and_then(|e| e.timeout).map_or(true, |(t, _)| t <= now))
            .collect();
        for ec in due {
            self.cpus[cpu.as_index()].timeouts.retain(|t| *t != ec);
            let Some((_, sm)) = self.ecs.get_mut(ec).and_then(|e| e.timeout.take()) else {
                continue;
            };
            if !self.sms.get_mut(sm).map_or(false, |s| s.remove(ec)) {
                continue;
            }
            let regs = self.ecs.get(ec).map(|e| e.regs).unwrap_or_default();
            self.record(TraceKind::Timeout, cpu, ec, &regs);
            let cont = Continuation::SysFinish { status: Status::Timeout, clear_timeout: true };
            self.release(cpu, ec, Some(cont));
            self.put(ObjRef::Ec(ec));
        }
    }
}
