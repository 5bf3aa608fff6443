// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hypercall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table)
//! DEPENDS_ON: kernel::Kernel, syscall::abi (register layout), ipc, xfer
//! INVARIANTS: Stable hypercall IDs; Decode→Check→Execute pattern;
//!             every handler ends in one status;
//!             sub-operations are closed matches falling back to BadParameter;
//!             platform hypercalls require a passthrough domain
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use super::abi;
use super::{
    HypercallTable, Status, SysResult, HC_ASSIGN_PCI, HC_CALL, HC_CREATE_EC, HC_CREATE_KP,
    HC_CREATE_PD, HC_CREATE_PT, HC_CREATE_SC, HC_CREATE_SM, HC_CREATE_VCPU, HC_EC_CTRL,
    HC_IRQ_CTRL, HC_KP_CTRL, HC_MACHINE_CTRL, HC_PD_CTRL, HC_PT_CTRL, HC_REPLY, HC_REVOKE,
    HC_SC_CTRL, HC_SM_CTRL, HC_VCPU_CTRL,
};
use crate::cap::{Crd, CrdKind, ObjRef, Perms, XferItem};
use crate::config::{KernelConfig, NUM_PRIORITIES, NUM_USER_VECTORS, USER_ADDR, VEC_USER};
use crate::ec::{Continuation, Ec, ExcRegs, Mtd};
use crate::hal::{Hal, IoapicRoute, LvtEntry};
use crate::kernel::{Kernel, Step, VectorBinding};
use crate::obj::{Kp, Pd, PdId, Pt, Sc, Sm};
use crate::sched::{EnqueueOutcome, Scheduler};
use crate::types::{CpuId, Mword, Selector, PAGE_BITS};

// Typed decoders for seL4-style Decode→Check→Execute

#[derive(Copy, Clone)]
struct CreatePdArgsTyped {
    sel: Selector,
    parent: Mword,
    crd: Crd,
    passthrough: bool,
}

impl CreatePdArgsTyped {
    #[inline]
    fn decode(regs: &ExcRegs) -> Self {
        Self {
            sel: Selector::from_raw(regs.sel()),
            parent: regs.arg2(),
            crd: Crd::decode(regs.arg3()),
            passthrough: regs.flags() & 1 != 0,
        }
    }
}

#[derive(Copy, Clone)]
struct CreateEcArgsTyped {
    sel: Selector,
    pd: Mword,
    cpu: Option<CpuId>,
    user_page: Mword,
    sp: Mword,
    evt: Selector,
    global: bool,
    vcpu: bool,
}

impl CreateEcArgsTyped {
    #[inline]
    fn decode(regs: &ExcRegs) -> Self {
        let (cpu, user_page) = abi::decode_ec_placement(regs.arg3());
        Self {
            sel: Selector::from_raw(regs.sel()),
            pd: regs.arg2(),
            cpu: CpuId::decode(cpu),
            user_page,
            sp: regs.arg4(),
            evt: Selector::from_raw(regs.arg5()),
            global: regs.flags() & 1 != 0,
            vcpu: regs.flags() & 2 != 0,
        }
    }

    /// Processor and feature checks; they come before the domain lookup.
    #[inline]
    fn check(&self, config: &KernelConfig) -> SysResult<CpuId> {
        let cpu = self.cpu.filter(|c| config.online.contains(*c)).ok_or(Status::BadCpu)?;
        if self.vcpu {
            return Err(Status::BadFeature);
        }
        Ok(cpu)
    }

    #[inline]
    fn check_user_page(&self) -> SysResult<()> {
        if self.user_page >= USER_ADDR {
            return Err(Status::BadParameter);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct CreateScArgsTyped {
    sel: Selector,
    pd: Mword,
    ec: Mword,
    prio: u8,
    quantum: u64,
}

impl CreateScArgsTyped {
    #[inline]
    fn decode(regs: &ExcRegs) -> Self {
        let (prio, quantum) = abi::decode_qpd(regs.arg4());
        Self {
            sel: Selector::from_raw(regs.sel()),
            pd: regs.arg2(),
            ec: regs.arg3(),
            prio,
            quantum,
        }
    }

    #[inline]
    fn check(&self) -> SysResult<()> {
        if self.prio == 0 || usize::from(self.prio) >= NUM_PRIORITIES || self.quantum == 0 {
            return Err(Status::BadParameter);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct CreatePtArgsTyped {
    sel: Selector,
    pd: Mword,
    ec: Mword,
    mtd: Mtd,
    ip: Mword,
}

impl CreatePtArgsTyped {
    #[inline]
    fn decode(regs: &ExcRegs) -> Self {
        Self {
            sel: Selector::from_raw(regs.sel()),
            pd: regs.arg2(),
            ec: regs.arg3(),
            mtd: Mtd::from_bits_truncate(regs.arg4()),
            ip: regs.arg5(),
        }
    }
}

/// Vector and processor of the irq_ctrl operations that route an interrupt.
#[derive(Copy, Clone)]
struct IrqTargetArgsTyped {
    vector: u8,
    cpu: Option<CpuId>,
    bit: u64,
}

impl IrqTargetArgsTyped {
    #[inline]
    fn decode(raw: Mword) -> Self {
        let (vector, cpu, bit) = abi::decode_irq_target(raw);
        Self { vector, cpu: CpuId::decode(cpu), bit }
    }

    #[inline]
    fn check(&self, config: &KernelConfig) -> SysResult<CpuId> {
        if usize::from(self.vector) >= NUM_USER_VECTORS {
            return Err(Status::BadParameter);
        }
        self.cpu.filter(|c| config.online.contains(*c)).ok_or(Status::BadCpu)
    }

    #[inline]
    fn host_vector(&self) -> u8 {
        VEC_USER + self.vector
    }
}

#[derive(Copy, Clone)]
struct SmCtrlArgsTyped {
    sel: Mword,
    down: bool,
    zero: bool,
    deadline: u64,
}

impl SmCtrlArgsTyped {
    #[inline]
    fn decode(regs: &ExcRegs) -> Self {
        Self {
            sel: regs.sel(),
            down: regs.flags() & 1 != 0,
            zero: regs.flags() & 2 != 0,
            deadline: regs.arg2(),
        }
    }

    /// Capability permission the operation needs.
    #[inline]
    fn perms(&self) -> Perms {
        if self.down {
            Perms::SM_DOWN
        } else {
            Perms::SM_UP
        }
    }
}

// Sub-operations.

const PD_LOOKUP: u8 = 0;
const PD_MAP_ACCESS_PAGE: u8 = 1;
const PD_DELEGATE: u8 = 2;
const PD_MSR_ACCESS: u8 = 3;

const EC_RECALL: u8 = 0;

const KP_MAP: u8 = 0;
const KP_UNMAP: u8 = 1;

const MACHINE_SUSPEND: u8 = 0;
const MACHINE_UPDATE_MICROCODE: u8 = 1;

const IRQ_CONFIGURE_VECTOR: u8 = 0;
const IRQ_ASSIGN_IOAPIC_PIN: u8 = 1;
const IRQ_MASK_IOAPIC_PIN: u8 = 2;
const IRQ_ASSIGN_MSI: u8 = 3;
const IRQ_ASSIGN_LVT: u8 = 4;
const IRQ_MASK_LVT: u8 = 5;

/// Thermal sensor LVT entry; it exists once the APIC reports this many entries.
const LVT_THERMAL: Mword = 0;
const LVT_THERMAL_MIN_MAX: u8 = 5;

/// Registers all hypercall handlers.
pub fn install_handlers<H: Hal, S: Scheduler>(table: &mut HypercallTable<H, S>) {
    table.register(HC_CALL, sys_call);
    table.register(HC_REPLY, sys_reply);
    table.register(HC_CREATE_PD, sys_create_pd);
    table.register(HC_CREATE_EC, sys_create_ec);
    table.register(HC_CREATE_SC, sys_create_sc);
    table.register(HC_CREATE_PT, sys_create_pt);
    table.register(HC_CREATE_SM, sys_create_sm);
    table.register(HC_REVOKE, sys_revoke);
    table.register(HC_PD_CTRL, sys_pd_ctrl);
    table.register(HC_EC_CTRL, sys_ec_ctrl);
    table.register(HC_SC_CTRL, sys_sc_ctrl);
    table.register(HC_PT_CTRL, sys_pt_ctrl);
    table.register(HC_SM_CTRL, sys_sm_ctrl);
    table.register(HC_ASSIGN_PCI, sys_assign_pci);
    table.register(HC_MACHINE_CTRL, sys_machine_ctrl);
    table.register(HC_IRQ_CTRL, sys_irq_ctrl);
    table.register(HC_CREATE_KP, sys_create_kp);
    table.register(HC_KP_CTRL, sys_kp_ctrl);
    table.register(HC_CREATE_VCPU, sys_create_vcpu);
    table.register(HC_VCPU_CTRL, sys_vcpu_ctrl);
}

/// Writes the outcome of `result` and returns to user mode.
fn finish<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId, result: SysResult<()>) -> Step {
    let status = match result {
        Ok(()) => Status::Success,
        Err(status) => {
            log_trace!(target: "syscall", "hypercall {} -> {}", k.regs(cpu).id(), status);
            status
        }
    };
    k.sys_finish(cpu, status, false)
}

fn sys_call<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    k.sys_call(cpu)
}

fn sys_reply<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    k.sys_reply(cpu)
}

/// Fails unless the current domain may use platform hypercalls.
fn require_passthrough<H: Hal, S: Scheduler>(k: &Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    match k.pds.get(k.current_pd(cpu)) {
        Some(pd) if pd.passthrough => Ok(()),
        _ => Err(Status::BadCapability),
    }
}

/// Charges `sel` in the current domain for a new object, failing before
/// anything is created.
fn reserve<H: Hal, S: Scheduler>(
    k: &mut Kernel<H, S>,
    cpu: CpuId,
    sel: Selector,
) -> SysResult<PdId> {
    let cur = k.current_pd(cpu);
    k.reserve_slot(cur, sel)?;
    Ok(cur)
}

fn sys_create_pd<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = create_pd(k, cpu);
    finish(k, cpu, result)
}

fn create_pd<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let typed = CreatePdArgsTyped::decode(&k.regs(cpu));
    let parent = k.lookup::<Pd>(cpu, typed.parent, Perms::OBJ_CREATION)?;
    // Passthrough is inherited, never gained.
    let passthrough = typed.passthrough && k.pds.get(parent).map_or(false, |p| p.passthrough);
    let cur = reserve(k, cpu, typed.sel)?;
    let quota = k.config.default_quota;
    let pd = k.pds.insert(Pd::new(passthrough, Some(quota)));
    let _ = k.pds.add_ref(pd);

    // The domain is published only once its initial capabilities are in.
    if !typed.crd.is_null() {
        // Initial capabilities keep their selectors in the new domain.
        let window = Crd::obj(0, Crd::MAX_ORDER, Perms::ALL.bits());
        let item = XferItem::delegate(typed.crd, typed.crd.base);
        if let Err(err) = k.xfer_items(cur, pd, Crd::null(), window, &[item]) {
            k.unreserve_slot(cur);
            k.put(ObjRef::Pd(pd));
            return Err(err.into());
        }
    }
    k.fill_slot(cur, typed.sel, ObjRef::Pd(pd), Perms::ALL);
    k.put(ObjRef::Pd(pd));
    log_debug!(
        target: "syscall",
        "create_pd sel={:#x} pd={:?} passthrough={}",
        typed.sel.as_raw(),
        pd,
        passthrough
    );
    Ok(())
}

fn sys_create_ec<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = create_ec(k, cpu);
    finish(k, cpu, result)
}

fn create_ec<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let typed = CreateEcArgsTyped::decode(&k.regs(cpu));
    let home = typed.check(&k.config)?;
    let pd = k.lookup::<Pd>(cpu, typed.pd, Perms::OBJ_CREATION)?;
    typed.check_user_page()?;
    let cur = reserve(k, cpu, typed.sel)?;
    let ec = k.ecs.insert(Ec::new(pd, home, typed.evt, typed.global, typed.user_page, typed.sp));
    let _ = k.pds.add_ref(pd);
    k.fill_slot(cur, typed.sel, ObjRef::Ec(ec), Perms::ALL);
    log_debug!(
        target: "syscall",
        "create_ec sel={:#x} ec={:?} cpu={} global={} evt={:#x}",
        typed.sel.as_raw(),
        ec,
        home,
        typed.global,
        typed.evt.as_raw()
    );
    Ok(())
}

fn sys_create_sc<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = create_sc(k, cpu);
    finish(k, cpu, result)
}

fn create_sc<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let typed = CreateScArgsTyped::decode(&k.regs(cpu));
    k.lookup::<Pd>(cpu, typed.pd, Perms::OBJ_CREATION)?;
    let ec = k.lookup::<Ec>(cpu, typed.ec, Perms::CREATE_SC)?;
    let home = match k.ecs.get(ec) {
        Some(e) if e.glb && !e.is_idle() => e.cpu,
        _ => return Err(Status::BadCapability),
    };
    typed.check()?;
    let cur = reserve(k, cpu, typed.sel)?;
    let sc = k.scs.insert(Sc::new(ec, home, typed.prio, typed.quantum));
    let _ = k.scs.add_ref(sc);
    let _ = k.ecs.add_ref(ec);

    // An SC the run queue refuses would never be dispatched.
    if k.remote_enqueue(cpu, sc) != Some(EnqueueOutcome::Enqueued) {
        k.unreserve_slot(cur);
        k.put(ObjRef::Sc(sc));
        return Err(Status::OutOfMemory);
    }
    k.fill_slot(cur, typed.sel, ObjRef::Sc(sc), Perms::ALL);
    k.put(ObjRef::Sc(sc));
    log_debug!(
        target: "syscall",
        "create_sc sc={:?} ec={:?} prio={} quantum={}",
        sc,
        ec,
        typed.prio,
        typed.quantum
    );
    Ok(())
}

fn sys_create_pt<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = create_pt(k, cpu);
    finish(k, cpu, result)
}

fn create_pt<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let typed = CreatePtArgsTyped::decode(&k.regs(cpu));
    k.lookup::<Pd>(cpu, typed.pd, Perms::OBJ_CREATION)?;
    let ec = k.lookup::<Ec>(cpu, typed.ec, Perms::CREATE_PT)?;
    if k.ecs.get(ec).map_or(true, |e| e.glb) {
        return Err(Status::BadCapability);
    }
    let cur = reserve(k, cpu, typed.sel)?;
    let pt = k.pts.insert(Pt::new(ec, typed.mtd, typed.ip));
    let _ = k.ecs.add_ref(ec);
    k.fill_slot(cur, typed.sel, ObjRef::Pt(pt), Perms::ALL);
    Ok(())
}

fn sys_create_sm<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = create_sm(k, cpu);
    finish(k, cpu, result)
}

fn create_sm<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let sel = Selector::from_raw(regs.sel());
    k.lookup::<Pd>(cpu, regs.arg2(), Perms::OBJ_CREATION)?;
    let cur = reserve(k, cpu, sel)?;
    let sm = k.sms.insert(Sm::new(regs.arg3()));
    k.fill_slot(cur, sel, ObjRef::Sm(sm), Perms::ALL);
    Ok(())
}

fn sys_create_kp<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = create_kp(k, cpu);
    finish(k, cpu, result)
}

fn create_kp<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let sel = Selector::from_raw(regs.sel());
    k.lookup::<Pd>(cpu, regs.arg2(), Perms::OBJ_CREATION)?;
    let cur = reserve(k, cpu, sel)?;
    let kp = k.kps.insert(Kp::new());
    k.fill_slot(cur, sel, ObjRef::Kp(kp), Perms::ALL);
    Ok(())
}

fn sys_create_vcpu<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    k.sys_finish(cpu, Status::BadFeature, false)
}

fn sys_revoke<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = revoke(k, cpu);
    finish(k, cpu, result)
}

fn revoke<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let crd = Crd::decode(regs.arg2());
    let include_self = regs.flags() & 1 != 0;
    let pd = if regs.flags() & 2 != 0 {
        k.lookup::<Pd>(cpu, regs.arg3(), Perms::empty())?
    } else {
        k.current_pd(cpu)
    };
    k.revoke(cpu, pd, crd, include_self);
    Ok(())
}

fn sys_pd_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = match k.regs(cpu).flags() {
        PD_LOOKUP => pd_lookup(k, cpu),
        PD_MAP_ACCESS_PAGE => pd_map_access_page(k, cpu),
        PD_DELEGATE => pd_delegate(k, cpu),
        PD_MSR_ACCESS => pd_msr_access(k, cpu),
        _ => Err(Status::BadParameter),
    };
    finish(k, cpu, result)
}

fn pd_lookup<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let crd = Crd::decode(k.regs(cpu).arg2());
    let found = k.lookup_crd(k.current_pd(cpu), crd);
    if let Some(regs) = k.regs_mut(cpu) {
        regs.set_arg2(found.encode());
    }
    Ok(())
}

fn pd_map_access_page<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let crd = Crd::decode(k.regs(cpu).arg2());
    if crd.kind != CrdKind::Mem || crd.order != 0 || crd.attr != 0x3 {
        return Err(Status::BadParameter);
    }
    let cur = k.current_pd(cpu);
    let pd = k.pds.get_mut(cur).ok_or(Status::BadCapability)?;
    pd.access_page = Some(crd.base);
    Ok(())
}

fn pd_delegate<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let src = k.lookup::<Pd>(cpu, regs.sel(), Perms::empty())?;
    let dst = k.lookup::<Pd>(cpu, regs.arg2(), Perms::empty())?;
    let item = XferItem::decode(regs.arg3(), regs.arg4());
    let window = Crd::decode(regs.arg5());
    let out = k.xfer_items(src, dst, window, window, &[item])?;
    if let (Some(result), Some(regs)) = (out.first().copied(), k.regs_mut(cpu)) {
        let (crd, flags) = result.encode();
        regs.set_arg3(crd);
        regs.set_arg4(flags);
    }
    Ok(())
}

fn pd_msr_access<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    require_passthrough(k, cpu)?;
    let regs = k.regs(cpu);
    let index = u32::try_from(regs.arg2()).map_err(|_| Status::BadParameter)?;
    if regs.sel() & 1 != 0 {
        if !k.hal.msr_write(index, regs.arg3()) {
            return Err(Status::BadParameter);
        }
        return Ok(());
    }
    let value = k.hal.msr_read(index).ok_or(Status::BadParameter)?;
    if let Some(regs) = k.regs_mut(cpu) {
        regs.set_arg3(value);
    }
    Ok(())
}

fn sys_ec_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = ec_ctrl(k, cpu);
    finish(k, cpu, result)
}

fn ec_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    match regs.flags() {
        EC_RECALL => {
            let ec = k.lookup::<Ec>(cpu, regs.sel(), Perms::EC_CTRL)?;
            k.recall(cpu, ec);
            Ok(())
        }
        _ => Err(Status::BadParameter),
    }
}

fn sys_sc_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = sc_ctrl(k, cpu);
    finish(k, cpu, result)
}

fn sc_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let sc = k.lookup::<Sc>(cpu, k.regs(cpu).sel(), Perms::SC_CTRL)?;
    let ticks = k.scs.get(sc).map_or(0, |s| s.time);
    let micros = ticks.saturating_mul(1000) / k.config.tsc_khz.max(1);
    if let Some(regs) = k.regs_mut(cpu) {
        regs.set_arg2(micros);
    }
    Ok(())
}

fn sys_pt_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = pt_ctrl(k, cpu);
    finish(k, cpu, result)
}

fn pt_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let pt = k.lookup::<Pt>(cpu, regs.sel(), Perms::PT_CTRL)?;
    let pt = k.pts.get_mut(pt).ok_or(Status::BadCapability)?;
    pt.id = regs.arg2();
    Ok(())
}

fn sys_sm_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let typed = SmCtrlArgsTyped::decode(&k.regs(cpu));
    let sm = match k.lookup::<Sm>(cpu, typed.sel, typed.perms()) {
        Ok(sm) => sm,
        Err(status) => return k.sys_finish(cpu, status, false),
    };
    if !typed.down {
        k.sm_up(cpu, sm);
        return k.sys_finish(cpu, Status::Success, false);
    }
    let cur = k.current(cpu);
    if let Some(ec) = k.ecs.get_mut(cur) {
        ec.cont = Some(Continuation::SysFinish { status: Status::Success, clear_timeout: true });
    }
    match k.sm_down(cpu, sm, typed.zero, typed.deadline, cur, true) {
        Some(step) => step,
        None => k.sys_finish(cpu, Status::Success, false),
    }
}

fn sys_kp_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = kp_ctrl(k, cpu);
    finish(k, cpu, result)
}

fn kp_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let kp = k.lookup::<Kp>(cpu, regs.sel(), Perms::KP_CTRL)?;
    match regs.flags() {
        KP_MAP => {
            let pd = k.lookup::<Pd>(cpu, regs.arg2(), Perms::empty())?;
            let kp = k.kps.get_mut(kp).ok_or(Status::BadCapability)?;
            if !kp.add_user_mapping(pd, regs.arg3()) {
                return Err(Status::BadParameter);
            }
            Ok(())
        }
        KP_UNMAP => {
            let kp = k.kps.get_mut(kp).ok_or(Status::BadCapability)?;
            kp.remove_user_mapping().map(|_| ()).ok_or(Status::BadParameter)
        }
        _ => Err(Status::BadParameter),
    }
}

fn sys_vcpu_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let status = match k.regs(cpu).flags() {
        0 | 1 => Status::BadFeature,
        _ => Status::BadParameter,
    };
    k.sys_finish(cpu, status, false)
}

/// Physical address behind the user page holding `addr` in `pd`.
fn device_phys<H: Hal, S: Scheduler>(k: &Kernel<H, S>, pd: PdId, addr: Mword) -> Option<u64> {
    let pd = k.pds.get(pd)?;
    pd.mem.get(addr >> PAGE_BITS).map(|(ppn, _)| ppn << PAGE_BITS)
}

fn sys_assign_pci<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = assign_pci(k, cpu);
    finish(k, cpu, result)
}

fn assign_pci<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    require_passthrough(k, cpu)?;
    let regs = k.regs(cpu);
    let pd = k.lookup::<Pd>(cpu, regs.sel(), Perms::empty())?;
    let phys = device_phys(k, pd, regs.arg2()).ok_or(Status::BadDevice)?;
    let rid = k.hal.pci_rid(phys).ok_or(Status::BadDevice)?;
    if !k.hal.iommu_assign(regs.arg3(), rid, pd.index()) {
        return Err(Status::BadDevice);
    }
    log_info!(target: "syscall", "assign_pci rid={:#x} -> pd={:?}", rid, pd);
    Ok(())
}

fn sys_machine_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = require_passthrough(k, cpu).and_then(|()| match k.regs(cpu).flags() {
        MACHINE_SUSPEND => machine_suspend(k, cpu),
        MACHINE_UPDATE_MICROCODE => machine_update_microcode(k, cpu),
        _ => Err(Status::BadParameter),
    });
    finish(k, cpu, result)
}

fn machine_suspend<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let (slp_typa, slp_typb) = abi::decode_sleep_types(k.regs(cpu).arg2());
    let waking = k.hal.waking_vector();
    if let Some(regs) = k.regs_mut(cpu) {
        regs.set_arg2(waking);
    }
    log_info!(target: "syscall", "suspend slp_typ={:#x}/{:#x}", slp_typa, slp_typb);
    if k.hal.suspend(slp_typa, slp_typb) {
        Ok(())
    } else {
        Err(Status::BadParameter)
    }
}

fn machine_update_microcode<H: Hal, S: Scheduler>(
    k: &mut Kernel<H, S>,
    cpu: CpuId,
) -> SysResult<()> {
    let regs = k.regs(cpu);
    let (addr, size) = (regs.arg2(), regs.arg3());
    if size > k.config.microcode_remap_size || !k.hal.update_microcode(addr) {
        return Err(Status::BadParameter);
    }
    Ok(())
}

fn sys_irq_ctrl<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> Step {
    let result = require_passthrough(k, cpu).and_then(|()| match k.regs(cpu).flags() {
        IRQ_CONFIGURE_VECTOR => irq_configure_vector(k, cpu),
        IRQ_ASSIGN_IOAPIC_PIN => irq_assign_ioapic_pin(k, cpu),
        IRQ_MASK_IOAPIC_PIN => irq_mask_ioapic_pin(k, cpu),
        IRQ_ASSIGN_MSI => irq_assign_msi(k, cpu),
        IRQ_ASSIGN_LVT => irq_assign_lvt(k, cpu),
        IRQ_MASK_LVT => irq_mask_lvt(k, cpu),
        _ => Err(Status::BadParameter),
    });
    finish(k, cpu, result)
}

fn irq_configure_vector<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let target = IrqTargetArgsTyped::decode(regs.arg2());
    let on = target.check(&k.config)?;
    let key = (on.as_raw(), target.vector);
    let sm = k.lookup::<Sm>(cpu, regs.arg3(), Perms::empty());
    let kp = k.lookup::<Kp>(cpu, regs.arg4(), Perms::empty());
    let binding = match (sm, kp) {
        (Err(_), Err(_)) => None,
        (Ok(sm), Ok(kp)) => {
            if target.bit >= Kp::BITS {
                return Err(Status::BadParameter);
            }
            Some(VectorBinding { kp, bit: target.bit, sm })
        }
        _ => return Err(Status::BadCapability),
    };
    if let Some(b) = binding {
        if !k.add_ref(ObjRef::Sm(b.sm)) {
            return Err(Status::BadCapability);
        }
        if !k.add_ref(ObjRef::Kp(b.kp)) {
            k.put(ObjRef::Sm(b.sm));
            return Err(Status::BadCapability);
        }
    }
    let old = match binding {
        Some(b) => k.vectors.insert(key, b),
        None => k.vectors.remove(&key),
    };
    if let Some(old) = old {
        k.put(ObjRef::Sm(old.sm));
        k.put(ObjRef::Kp(old.kp));
    }
    log_debug!(target: "irq", "vector {} on cpu {} -> {:?}", target.vector, on, binding);
    Ok(())
}

fn irq_assign_ioapic_pin<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let target = IrqTargetArgsTyped::decode(regs.arg2());
    let on = target.check(&k.config)?;
    let (ioapic, pin, level, active_low) = abi::decode_ioapic_pin(regs.arg3());
    match k.hal.ioapic_pins(ioapic) {
        Some(pins) if pin < pins => {}
        _ => return Err(Status::BadParameter),
    }
    k.hal.ioapic_route(IoapicRoute {
        ioapic,
        pin,
        cpu: on,
        vector: target.host_vector(),
        level,
        active_low,
    });
    Ok(())
}

fn irq_mask_ioapic_pin<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let (ioapic, pin, _, _) = abi::decode_ioapic_pin(regs.arg3());
    match k.hal.ioapic_pins(ioapic) {
        Some(pins) if pin < pins => {}
        _ => return Err(Status::BadParameter),
    }
    k.hal.ioapic_mask(ioapic, pin, regs.sel() & 1 != 0);
    Ok(())
}

fn irq_assign_msi<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let target = IrqTargetArgsTyped::decode(regs.arg2());
    let on = target.check(&k.config)?;
    let phys = device_phys(k, k.current_pd(cpu), regs.arg3()).ok_or(Status::BadDevice)?;
    let rid = k.hal.pci_rid(phys).or_else(|| k.hal.hpet_rid(phys)).ok_or(Status::BadDevice)?;
    let msg = k.hal.msi_compose(on, target.host_vector(), rid);
    if let Some(regs) = k.regs_mut(cpu) {
        regs.set_arg2(msg.address);
        regs.set_arg3(Mword::from(msg.data));
    }
    Ok(())
}

/// Only the thermal sensor entry is handed out, and only when the APIC has one.
fn lvt_entry<H: Hal, S: Scheduler>(k: &Kernel<H, S>, raw: Mword) -> SysResult<LvtEntry> {
    if raw == LVT_THERMAL && k.hal.lvt_max() >= LVT_THERMAL_MIN_MAX {
        Ok(LvtEntry::Thermal)
    } else {
        Err(Status::BadParameter)
    }
}

fn irq_assign_lvt<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let vector = u8::try_from(regs.arg2())
        .ok()
        .filter(|v| usize::from(*v) < NUM_USER_VECTORS)
        .ok_or(Status::BadParameter)?;
    let entry = lvt_entry(k, regs.arg3())?;
    k.hal.lvt_assign(entry, VEC_USER + vector);
    Ok(())
}

fn irq_mask_lvt<H: Hal, S: Scheduler>(k: &mut Kernel<H, S>, cpu: CpuId) -> SysResult<()> {
    let regs = k.regs(cpu);
    let entry = lvt_entry(k, regs.arg3())?;
    k.hal.lvt_mask(entry, regs.sel() & 1 != 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_for(call: abi::Hypercall) -> ExcRegs {
        let mut regs = ExcRegs::default();
        call.apply(&mut regs);
        regs
    }

    #[test]
    fn create_ec_checks_cpu_then_feature_then_utcb() {
        let cfg = KernelConfig::DEFAULT;
        let offline =
            regs_for(abi::Hypercall::new(HC_CREATE_EC, 1).arg(3, abi::ec_placement(3, 0x1000)));
        assert_eq!(CreateEcArgsTyped::decode(&offline).check(&cfg), Err(Status::BadCpu));

        // Stray low bits land in the processor field.
        let unaligned = regs_for(abi::Hypercall::new(HC_CREATE_EC, 1).arg(3, 0x1000 | 0x800));
        assert_eq!(CreateEcArgsTyped::decode(&unaligned).check(&cfg), Err(Status::BadCpu));

        let vcpu = regs_for(
            abi::Hypercall::new(HC_CREATE_EC, 1).flags(2).arg(3, abi::ec_placement(0, 0x1000)),
        );
        assert_eq!(CreateEcArgsTyped::decode(&vcpu).check(&cfg), Err(Status::BadFeature));

        let kernel_half = CreateEcArgsTyped::decode(&regs_for(
            abi::Hypercall::new(HC_CREATE_EC, 1).arg(3, abi::ec_placement(0, USER_ADDR)),
        ));
        assert_eq!(kernel_half.check(&cfg), Ok(CpuId::BOOT));
        assert_eq!(kernel_half.check_user_page(), Err(Status::BadParameter));
    }

    #[test]
    fn create_sc_rejects_idle_priority_and_empty_quantum() {
        let idle = regs_for(abi::Hypercall::new(HC_CREATE_SC, 1).arg(4, abi::qpd(0, 100)));
        assert_eq!(CreateScArgsTyped::decode(&idle).check(), Err(Status::BadParameter));
        let empty = regs_for(abi::Hypercall::new(HC_CREATE_SC, 1).arg(4, abi::qpd(5, 0)));
        assert_eq!(CreateScArgsTyped::decode(&empty).check(), Err(Status::BadParameter));
        let ok = regs_for(abi::Hypercall::new(HC_CREATE_SC, 1).arg(4, abi::qpd(5, 100)));
        assert_eq!(CreateScArgsTyped::decode(&ok).check(), Ok(()));
    }

    #[test]
    fn irq_target_rejects_kernel_vectors() {
        let cfg = KernelConfig::DEFAULT;
        let beyond = IrqTargetArgsTyped::decode(abi::irq_target(NUM_USER_VECTORS as u8, 0, 0));
        assert_eq!(beyond.check(&cfg), Err(Status::BadParameter));
        let offline = IrqTargetArgsTyped::decode(abi::irq_target(4, 1, 0));
        assert_eq!(offline.check(&cfg), Err(Status::BadCpu));
        let ok = IrqTargetArgsTyped::decode(abi::irq_target(4, 0, 0));
        assert_eq!(ok.check(&cfg), Ok(CpuId::BOOT));
        assert_eq!(ok.host_vector(), VEC_USER + 4);
    }

    #[test]
    fn sm_ctrl_permission_follows_operation() {
        let up = SmCtrlArgsTyped::decode(&regs_for(abi::Hypercall::new(HC_SM_CTRL, 9)));
        assert_eq!(up.perms(), Perms::SM_UP);
        let down = regs_for(abi::Hypercall::new(HC_SM_CTRL, 9).flags(3).arg(2, 77));
        let down = SmCtrlArgsTyped::decode(&down);
        assert!(down.zero);
        assert_eq!((down.perms(), down.deadline), (Perms::SM_DOWN, 77));
    }
}
