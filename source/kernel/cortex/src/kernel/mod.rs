// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state and the continuation trampoline driving every kernel entry
//! OWNERS: @kernel-team @kernel-sched-team
//! PUBLIC API: Kernel (new/bootstrap/boot_cpu/syscall/exception/interrupt/nmi), Exit, RootTask
//! DEPENDS_ON: hal::Hal, sched::Scheduler, arena::Arena, rcu::Rcu, syscall::HypercallTable
//! INVARIANTS: Every entry ends in exactly one Exit; `Step::Continue` never writes `ec.cont`;
//!             the idle SC is never enqueued; a dispatched EC always has a continuation
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Kernel paths never return into each other. Each one names the next step
//! and `run` keeps stepping until control goes back to the machine: a
//! return to user mode, a direct return from a trap, or halting in idle.
//! Nothing is kept on the kernel stack between entries.

extern crate alloc;

mod entry;
mod exit;
#[cfg(test)]
mod tests_prop;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::arena::{Arena, Handle, RefOutcome};
use crate::cap::{ObjRef, Perms, Typed};
use crate::config::{KernelConfig, MAX_CPUS, SEL_ROOT_EC, SEL_ROOT_PD, SEL_ROOT_SC};
use crate::cpu::PerCpu;
use crate::diag::trace::{TraceEvent, TraceKind, TraceRing};
use crate::ec::{Continuation, Ec, EcId, EcState, ExcRegs};
use crate::ec::regs::R11;
use crate::hal::Hal;
use crate::hazard::Hazard;
use crate::obj::{Kp, KpId, Pd, PdId, Pt, Sc, ScId, Sm, SmId};
use crate::rcu::Rcu;
use crate::sched::{EnqueueOutcome, Scheduler};
use crate::space::Node;
use crate::syscall::{api, HypercallTable, Status, SysResult};
use crate::types::{CpuId, CpuMask, Mword, Selector};

/// How control leaves the kernel.
#[must_use = "the entry stub must act on the exit"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Return to user mode through sysret with the EC's registers.
    Sysret(EcId),
    /// Return to user mode through iret with the EC's registers.
    Iret(EcId),
    /// Return directly to the interrupted kernel code with the (possibly updated) frame.
    Trap,
    /// Halt until the next interrupt.
    Halt,
}

/// Next step of the trampoline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Switch to an EC and run its continuation.
    Resume(EcId),
    /// Run a continuation for the current EC.
    Continue(Continuation),
    /// Follow an EC's partner chain and resume its end.
    Activate(EcId),
    Schedule { blocked: bool },
    Exit(Exit),
}

/// Interrupt vector wired to a kernel page bit and a semaphore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorBinding {
    pub kp: KpId,
    pub bit: u64,
    pub sm: SmId,
}

/// Objects created for the first user domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootTask {
    pub pd: PdId,
    pub ec: EcId,
    pub sc: ScId,
}

pub struct Kernel<H: Hal, S: Scheduler> {
    pub(crate) hal: H,
    pub(crate) sched: S,
    pub(crate) config: KernelConfig,
    pub(crate) cpus: Vec<PerCpu>,
    /// Domain owning the idle ECs.
    pub(crate) kern_pd: PdId,
    pub(crate) pds: Arena<Pd>,
    pub(crate) ecs: Arena<Ec>,
    pub(crate) scs: Arena<Sc>,
    pub(crate) pts: Arena<Pt>,
    pub(crate) sms: Arena<Sm>,
    pub(crate) kps: Arena<Kp>,
    pub(crate) rcu: Rcu,
    /// Keyed by (processor, user vector).
    pub(crate) vectors: BTreeMap<(u16, u8), VectorBinding>,
    pub(crate) trace: TraceRing,
    pub(crate) table: HypercallTable<H, S>,
    pub(crate) root: Option<RootTask>,
    /// Steps taken by the last `run`.
    pub(crate) steps: usize,
}

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    pub fn new(hal: H, sched: S, config: KernelConfig) -> Self {
        let mut pds = Arena::new();
        let kern_pd = pds.insert(Pd::new(false, Some(0)));
        let _ = pds.add_ref(kern_pd);
        let mut ecs = Arena::new();
        let mut scs = Arena::new();
        let mut cpus = Vec::with_capacity(MAX_CPUS);
        for raw in 0..MAX_CPUS as u16 {
            let cpu = CpuId::from_raw(raw);
            let idle_ec = ecs.insert(Ec::idle(kern_pd, cpu));
            let _ = ecs.add_ref(idle_ec);
            let _ = pds.add_ref(kern_pd);
            let idle_sc = scs.insert(Sc::new(idle_ec, cpu, 0, u64::MAX));
            let _ = scs.add_ref(idle_sc);
            cpus.push(PerCpu::new(cpu, idle_ec, idle_sc));
        }
        let mut table = HypercallTable::new();
        api::install_handlers(&mut table);
        Self {
            hal,
            sched,
            config,
            cpus,
            kern_pd,
            pds,
            ecs,
            scs,
            pts: Arena::new(),
            sms: Arena::new(),
            kps: Arena::new(),
            rcu: Rcu::new(),
            vectors: BTreeMap::new(),
            trace: TraceRing::new(),
            table,
            root: None,
            steps: 0,
        }
    }

    /// Creates the root task: a passthrough domain with unlimited quota,
    /// a global EC entering at `entry` and a scheduling context for it.
    ///
    /// The root EC finds its processor number in the first argument register
    /// and capabilities for all three objects at `SEL_ROOT_*`.
    pub fn bootstrap(&mut self, entry: Mword, stack: Mword) -> SysResult<RootTask> {
        let cpu = CpuId::BOOT;
        let pd = self.pds.insert(Pd::new(true, None));

        let mut ec = Ec::new(pd, cpu, Selector::from_raw(0), true, 0, stack);
        ec.cont = Some(Continuation::RetUserSysexit);
        ec.regs.set_ip(entry);
        ec.regs.gpr[R11] = ExcRegs::EFL_IF;
        ec.regs.set_pt(Mword::from(cpu.as_raw()));
        let ec = self.ecs.insert(ec);
        let _ = self.pds.add_ref(pd);

        let sc = self.scs.insert(Sc::new(ec, cpu, self.config.root_prio, self.config.root_quantum));
        let _ = self.ecs.add_ref(ec);

        let caps = [
            (SEL_ROOT_PD, ObjRef::Pd(pd)),
            (SEL_ROOT_EC, ObjRef::Ec(ec)),
            (SEL_ROOT_SC, ObjRef::Sc(sc)),
        ];
        for (sel, obj) in caps {
            let sel = Selector::from_raw(sel);
            self.reserve_slot(pd, sel)?;
            self.fill_slot(pd, sel, obj, Perms::ALL);
        }

        if self.remote_enqueue(cpu, sc) != Some(EnqueueOutcome::Enqueued) {
            return Err(Status::BadParameter);
        }
        let root = RootTask { pd, ec, sc };
        self.root = Some(root);
        log_info!(
            target: "kernel",
            "root task pd={:?} ec={:?} sc={:?} ip={:#x}",
            pd,
            ec,
            sc,
            entry
        );
        Ok(root)
    }

    /// First scheduling decision on `cpu`.
    pub fn boot_cpu(&mut self, cpu: CpuId) -> Exit {
        self.cpus[cpu.as_index()].last_tick = self.hal.now();
        self.run(cpu, Step::Schedule { blocked: false })
    }

    /// Steps until control leaves the kernel.
    pub(crate) fn run(&mut self, cpu: CpuId, mut step: Step) -> Exit {
        self.steps = 0;
        loop {
            self.steps += 1;
            step = match step {
                Step::Exit(exit) => return exit,
                Step::Resume(ec) => self.make_current(cpu, ec),
                Step::Continue(cont) => self.dispatch(cpu, cont),
                Step::Activate(ec) => self.activate(cpu, ec),
                Step::Schedule { blocked } => self.schedule(cpu, blocked),
            };
        }
    }

    fn dispatch(&mut self, cpu: CpuId, cont: Continuation) -> Step {
        match cont {
            Continuation::Idle => self.idle(cpu),
            Continuation::RetUserSysexit => self.ret_user_sysexit(cpu),
            Continuation::RetUserIret => self.ret_user_iret(cpu),
            Continuation::RecvKern => self.recv_kern(cpu),
            Continuation::RecvUser => self.recv_user(cpu),
            Continuation::SendMsg(resume) => self.send_msg(cpu, resume),
            Continuation::SysCall => self.sys_call(cpu),
            Continuation::SysFinish { status, clear_timeout } => {
                self.sys_finish(cpu, status, clear_timeout)
            }
            Continuation::Dead => self.die(cpu, "IPC Abort"),
        }
    }

    /// Switches `cpu` to `ec` and continues where it left off.
    fn make_current(&mut self, cpu: CpuId, ec: EcId) -> Step {
        let Some((cont, pd)) = self.ecs.get(ec).and_then(|e| e.cont.map(|c| (c, e.pd))) else {
            log_error!(target: "sched", "resume of ec={:?} without continuation", ec);
            return Step::Schedule { blocked: true };
        };
        let i = cpu.as_index();
        let prev = self.cpus[i].current_ec;
        self.cpus[i].current_ec = ec;
        self.transfer_fpu(cpu, ec, prev);
        if let Some(pd) = self.pds.get_mut(pd) {
            pd.cpus.insert(cpu);
        }
        if self.cpus[i].shadow.stale_tlb.swap(false, Ordering::AcqRel) {
            self.hal.flush_all();
        }
        Step::Continue(cont)
    }

    /// Resumes the end of `ec`'s partner chain, or parks the current SC
    /// there if that EC is blocked.
    fn activate(&mut self, cpu: CpuId, ec: EcId) -> Step {
        let mut end = ec;
        let mut links = 0;
        while let Some(next) = self.ecs.get(end).and_then(|e| e.partner) {
            end = next;
            links += 1;
        }
        self.cpus[cpu.as_index()].ctr_link = links;
        match self.block_sc(cpu, end) {
            Some(step) => step,
            None => Step::Resume(end),
        }
    }

    /// Picks the next SC on `cpu`. The current SC goes back to its run
    /// queue unless it blocked.
    fn schedule(&mut self, cpu: CpuId, blocked: bool) -> Step {
        let i = cpu.as_index();
        self.cpus[i].hazard.clear(Hazard::SCHED);
        let current = self.cpus[i].current_sc;
        if !blocked && current != self.cpus[i].idle_sc && self.scs.is_live(current) {
            if let Some(EnqueueOutcome::Rejected(_)) = self.enqueue_local(current) {
                // A full run queue keeps the current SC on the processor.
                self.cpus[i].ctr_link = 0;
                let ec = self.scs.get(current).map_or(self.cpus[i].idle_ec, |sc| sc.ec);
                return Step::Activate(ec);
            }
        }
        let next = loop {
            match self.sched.pick_next(cpu) {
                Some(sc) if self.scs.is_live(sc) => break sc,
                Some(_) => continue,
                None => break self.cpus[i].idle_sc,
            }
        };
        self.cpus[i].current_sc = next;
        self.cpus[i].ctr_link = 0;
        match self.scs.get(next) {
            Some(sc) => Step::Activate(sc.ec),
            None => Step::Activate(self.cpus[i].idle_ec),
        }
    }

    /// Parks the current SC on `ec` if `ec` is blocked.
    pub(crate) fn block_sc(&mut self, cpu: CpuId, ec: EcId) -> Option<Step> {
        let sc = self.cpus[cpu.as_index()].current_sc;
        let target = self.ecs.get_mut(ec)?;
        if !target.blocked {
            return None;
        }
        if sc != self.cpus[cpu.as_index()].idle_sc {
            target.parked.push(sc);
        }
        Some(Step::Schedule { blocked: true })
    }

    /// Unblocks `ec`, optionally replacing its continuation, and requeues
    /// every SC parked on it.
    pub(crate) fn release(&mut self, cpu: CpuId, ec: EcId, cont: Option<Continuation>) {
        let Some(e) = self.ecs.get_mut(ec) else {
            return;
        };
        e.blocked = false;
        if let Some(cont) = cont {
            e.cont = Some(cont);
        }
        let parked = core::mem::take(&mut e.parked);
        for sc in parked {
            if let Some(EnqueueOutcome::Rejected(reason)) = self.remote_enqueue(cpu, sc) {
                log_error!(target: "sched", "parked sc={:?} dropped: {:?}", sc, reason);
            }
        }
    }

    /// Queues `sc` on its home processor. `None` once `sc` is gone.
    fn enqueue_local(&mut self, sc: ScId) -> Option<EnqueueOutcome> {
        let &Sc { cpu, prio, .. } = self.scs.get(sc)?;
        let outcome = self.sched.enqueue(cpu, sc, prio);
        if let EnqueueOutcome::Rejected(reason) = outcome {
            log_warn!(target: "sched", "enqueue of sc={:?} rejected: {:?}", sc, reason);
        }
        Some(outcome)
    }

    /// Makes `sc` runnable on its processor, asking that processor to
    /// reschedule when `sc` outranks what it runs. Nothing is signalled
    /// when the run queue refuses `sc`.
    pub(crate) fn remote_enqueue(&mut self, from: CpuId, sc: ScId) -> Option<EnqueueOutcome> {
        let &Sc { cpu, prio, .. } = self.scs.get(sc)?;
        let outcome = self.enqueue_local(sc)?;
        if outcome != EnqueueOutcome::Enqueued {
            return Some(outcome);
        }
        let current = self.cpus[cpu.as_index()].current_sc;
        let current_prio = self.scs.get(current).map_or(0, |s| s.prio);
        if prio > current_prio {
            self.cpus[cpu.as_index()].hazard.set(Hazard::SCHED);
        }
        if cpu != from {
            self.hal.send_ipi(cpu, crate::config::VEC_IPI_RRQ);
        }
        Some(outcome)
    }

    /// Links a caller to its callee for the duration of a call.
    pub(crate) fn set_partner(&mut self, cpu: CpuId, caller: EcId, callee: EcId) {
        if let Some(c) = self.ecs.get_mut(caller) {
            c.partner = Some(callee);
        }
        if let Some(c) = self.ecs.get_mut(callee) {
            c.rcap = Some(caller);
        }
        let _ = self.ecs.add_ref(callee);
        let _ = self.ecs.add_ref(caller);
        self.cpus[cpu.as_index()].ctr_link += 1;
    }

    /// Breaks the link between `caller` and its callee. Returns whether the
    /// caller sits on the current SC's chain and can be resumed directly.
    pub(crate) fn clr_partner(&mut self, cpu: CpuId, caller: EcId) -> bool {
        let callee = self.ecs.get_mut(caller).and_then(|c| c.partner.take());
        if let Some(callee) = callee {
            if let Some(c) = self.ecs.get_mut(callee) {
                c.rcap = None;
            }
            self.put(ObjRef::Ec(callee));
            self.put(ObjRef::Ec(caller));
        }
        let link = &mut self.cpus[cpu.as_index()].ctr_link;
        let on_chain = *link != 0;
        *link = link.saturating_sub(1);
        on_chain
    }

    /// Lends the current SC to the busy EC `dst`. The current EC retries
    /// with `retry` once it runs again. `None` when helping is pointless
    /// or the help budget is spent.
    pub(crate) fn help(&mut self, cpu: CpuId, dst: EcId, retry: Continuation) -> Option<Step> {
        if self.ecs.get(dst).map_or(true, |e| e.cont == Some(Continuation::Dead)) {
            return None;
        }
        let budget = self.config.help_budget;
        let cur = self.current(cpu);
        let cur = self.ecs.get_mut(cur)?;
        cur.cont = Some(retry);
        cur.help += 1;
        if cur.help > budget {
            return None;
        }
        Some(Step::Activate(dst))
    }

    // Object references and reclamation.

    pub(crate) fn add_ref(&mut self, obj: ObjRef) -> bool {
        match obj {
            ObjRef::Pd(h) => self.pds.add_ref(h),
            ObjRef::Ec(h) => self.ecs.add_ref(h),
            ObjRef::Sc(h) => self.scs.add_ref(h),
            ObjRef::Pt(h) => self.pts.add_ref(h),
            ObjRef::Sm(h) => self.sms.add_ref(h),
            ObjRef::Kp(h) => self.kps.add_ref(h),
        }
    }

    /// Drops a reference; the last one retires the object.
    pub(crate) fn put(&mut self, obj: ObjRef) {
        let outcome = match obj {
            ObjRef::Pd(h) => self.pds.del_ref(h),
            ObjRef::Ec(h) => self.ecs.del_ref(h),
            ObjRef::Sc(h) => self.scs.del_ref(h),
            ObjRef::Pt(h) => self.pts.del_ref(h),
            ObjRef::Sm(h) => self.sms.del_ref(h),
            ObjRef::Kp(h) => self.kps.del_ref(h),
        };
        if outcome == RefOutcome::LastRef {
            log_debug!(target: "rcu", "retire {:?}", obj);
            if let ObjRef::Sc(sc) = obj {
                self.sched.remove(sc);
            }
            let signal = self.rcu.retire(obj, self.config.online);
            self.signal_rcu(signal);
        }
    }

    fn signal_rcu(&mut self, cpus: CpuMask) {
        for cpu in cpus.iter() {
            self.cpus[cpu.as_index()].hazard.set(Hazard::RCU);
        }
    }

    /// Quiescent state on `cpu`.
    pub(crate) fn rcu_quiet(&mut self, cpu: CpuId) {
        self.cpus[cpu.as_index()].hazard.clear(Hazard::RCU);
        let signal = self.rcu.quiet(cpu, self.config.online);
        self.signal_rcu(signal);
    }

    /// Frees every object whose grace period elapsed.
    pub(crate) fn rcu_update(&mut self) {
        let mut done = self.rcu.take_done();
        while !done.is_empty() {
            for obj in done {
                self.reclaim(obj);
            }
            done = self.rcu.take_done();
        }
    }

    fn reclaim(&mut self, obj: ObjRef) {
        match obj {
            ObjRef::Pd(h) => {
                let Some(mut pd) = self.pds.free(h) else {
                    return;
                };
                for sel in pd.obj.indices(0, u64::MAX) {
                    if let Some(node) = pd.obj.remove(sel) {
                        self.put(node.value);
                    }
                }
            }
            ObjRef::Ec(h) => {
                if let Some(ec) = self.ecs.free(h) {
                    self.put(ObjRef::Pd(ec.pd));
                }
            }
            ObjRef::Sc(h) => {
                if let Some(sc) = self.scs.free(h) {
                    self.put(ObjRef::Ec(sc.ec));
                }
            }
            ObjRef::Pt(h) => {
                if let Some(pt) = self.pts.free(h) {
                    self.put(ObjRef::Ec(pt.ec));
                }
            }
            ObjRef::Sm(h) => {
                if let Some(mut sm) = self.sms.free(h) {
                    while let Some(ec) = sm.dequeue() {
                        self.put(ObjRef::Ec(ec));
                    }
                }
            }
            ObjRef::Kp(h) => {
                let _ = self.kps.free(h);
            }
        }
    }

    // Object space slots.

    /// Checks that `sel` is free in `pd` and charges the node against its quota.
    pub(crate) fn reserve_slot(&mut self, pd: PdId, sel: Selector) -> SysResult<()> {
        let pd = self.pds.get_mut(pd).ok_or(Status::BadCapability)?;
        if pd.obj.lookup(sel.as_raw()).is_some() {
            return Err(Status::BadCapability);
        }
        pd.quota.charge()?;
        Ok(())
    }

    /// Gives back the quota `reserve_slot` charged when the object is not
    /// created after all.
    pub(crate) fn unreserve_slot(&mut self, pd: PdId) {
        if let Some(pd) = self.pds.get_mut(pd) {
            pd.quota.release();
        }
    }

    /// Installs a capability in a slot reserved with `reserve_slot`.
    pub(crate) fn fill_slot(&mut self, pd: PdId, sel: Selector, obj: ObjRef, perms: Perms) {
        if !self.add_ref(obj) {
            self.unreserve_slot(pd);
            return;
        }
        if let Some(space) = self.pds.get_mut(pd) {
            let _ = space.obj.insert(sel.as_raw(), Node::root(obj, perms.bits()));
        }
    }

    // Accessors.

    #[inline]
    pub(crate) fn current(&self, cpu: CpuId) -> EcId {
        self.cpus[cpu.as_index()].current_ec
    }

    /// Copy of the current EC's registers.
    pub(crate) fn regs(&self, cpu: CpuId) -> ExcRegs {
        self.ecs.get(self.current(cpu)).map(|e| e.regs).unwrap_or_default()
    }

    pub(crate) fn regs_mut(&mut self, cpu: CpuId) -> Option<&mut ExcRegs> {
        let cur = self.current(cpu);
        self.ecs.get_mut(cur).map(|e| &mut e.regs)
    }

    pub(crate) fn current_pd(&self, cpu: CpuId) -> PdId {
        self.ecs.get(self.current(cpu)).map_or(self.kern_pd, |e| e.pd)
    }

    /// Resolves `sel` in the current domain.
    pub(crate) fn lookup<T: Typed>(
        &self,
        cpu: CpuId,
        sel: Mword,
        perms: Perms,
    ) -> SysResult<Handle<T>> {
        let pd = self.pds.get(self.current_pd(cpu)).ok_or(Status::BadCapability)?;
        Ok(pd.cast::<T>(Selector::from_raw(sel), perms)?)
    }

    pub(crate) fn is_idle_ec(&self, ec: EcId) -> bool {
        self.ecs.get(ec).map_or(false, Ec::is_idle)
    }

    pub(crate) fn record(&mut self, kind: TraceKind, cpu: CpuId, ec: EcId, regs: &ExcRegs) {
        let sc = self.cpus[cpu.as_index()].current_sc;
        let mut ev = TraceEvent::new(kind, cpu.as_raw(), ec.index(), sc.index());
        ev.vec = regs.vec;
        ev.cs = regs.cs;
        ev.rip = regs.rip;
        ev.cr2 = regs.cr2;
        ev.err = regs.err;
        self.trace.record(ev);
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn root(&self) -> Option<RootTask> {
        self.root
    }

    pub fn trace(&self) -> &TraceRing {
        &self.trace
    }

    pub fn current_ec(&self, cpu: CpuId) -> EcId {
        self.current(cpu)
    }

    pub fn current_sc(&self, cpu: CpuId) -> ScId {
        self.cpus[cpu.as_index()].current_sc
    }

    pub fn ec(&self, ec: EcId) -> Option<&Ec> {
        self.ecs.get(ec)
    }

    pub fn ec_state(&self, ec: EcId) -> Option<EcState> {
        self.ecs.get(ec).map(Ec::state)
    }

    pub fn pd(&self, pd: PdId) -> Option<&Pd> {
        self.pds.get(pd)
    }

    pub fn sm(&self, sm: SmId) -> Option<&Sm> {
        self.sms.get(sm)
    }

    pub fn kp(&self, kp: KpId) -> Option<&Kp> {
        self.kps.get(kp)
    }

    pub fn percpu(&self, cpu: CpuId) -> &PerCpu {
        &self.cpus[cpu.as_index()]
    }
}
