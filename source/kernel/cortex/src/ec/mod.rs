// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Execution contexts and their kernel-side continuations
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Ec, EcId, EcKind, EcState, Continuation, Resume, ExcRegs, Mtd, FpuState
//! DEPENDS_ON: arena::Handle, hazard::AtomicHazard, utcb::Utcb
//! INVARIANTS: `cont == None` marks a local EC that can accept a call;
//!             `partner`/`rcap` always come in matching pairs
//!             (caller.partner == callee iff callee.rcap == caller);
//!             only the processor running an EC mutates its registers,
//!             remote processors only set hazards
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

pub mod fpu;
pub mod regs;

use alloc::boxed::Box;
use alloc::vec::Vec;

pub use fpu::FpuState;
pub use regs::{ExcRegs, Mtd};

use crate::arena::Handle;
use crate::hazard::AtomicHazard;
use crate::obj::{PdId, ScId, SmId};
use crate::syscall::Status;
use crate::types::{CpuId, Mword, Selector};
use crate::utcb::Utcb;

pub type EcId = Handle<Ec>;

/// How an interrupted sender returns to user mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    Sysexit,
    Iret,
}

impl Resume {
    pub const fn continuation(self) -> Continuation {
        match self {
            Resume::Sysexit => Continuation::RetUserSysexit,
            Resume::Iret => Continuation::RetUserIret,
        }
    }
}

/// What an EC runs the next time it is dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// Per-processor idle loop.
    Idle,
    RetUserSysexit,
    RetUserIret,
    /// Receive an exception message from the kernel on behalf of the caller.
    RecvKern,
    /// Receive a user message from the caller.
    RecvUser,
    /// Deliver `regs.dst_portal` as an exception, resuming as given.
    SendMsg(Resume),
    /// Re-issue the call hypercall.
    SysCall,
    SysFinish { status: Status, clear_timeout: bool },
    Dead,
}

impl Continuation {
    /// Returns through the sysret path.
    pub const fn is_sysexit(self) -> bool {
        matches!(self, Continuation::RetUserSysexit)
    }

    pub const fn is_iret(self) -> bool {
        matches!(self, Continuation::RetUserIret)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcKind {
    /// Permanent per-processor idle context; never enters user mode.
    Idle,
    User,
}

/// Observable state derived from continuation, links and blocking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcState {
    Idle,
    /// Local EC waiting for a caller.
    Available,
    RunningSysexit,
    RunningIret,
    AwaitingKernelMessage,
    AwaitingUserMessage,
    Blocked,
    Dead,
}

/// Execution context.
pub struct Ec {
    /// Home protection domain.
    pub pd: PdId,
    pub cpu: CpuId,
    /// Event base for exception portals.
    pub evt: Selector,
    /// Independently schedulable (may own SCs).
    pub glb: bool,
    pub kind: EcKind,
    pub cont: Option<Continuation>,
    /// Callee of the call this EC is engaged in.
    pub partner: Option<EcId>,
    /// Caller this EC is servicing.
    pub rcap: Option<EcId>,
    pub regs: ExcRegs,
    pub hazard: AtomicHazard,
    pub utcb: Option<Box<Utcb>>,
    pub fpu: FpuState,
    /// Waiting on a semaphore.
    pub blocked: bool,
    /// Scheduling contexts parked on this EC while it is blocked.
    pub parked: Vec<ScId>,
    /// Semaphore timeout deadline.
    pub timeout: Option<(u64, SmId)>,
    /// Help attempts since the last completed call.
    pub help: u32,
    /// User address of the UTCB mapping, zero if none.
    pub user_page: Mword,
}

impl Ec {
    pub fn idle(pd: PdId, cpu: CpuId) -> Self {
        Self {
            pd,
            cpu,
            evt: Selector::from_raw(0),
            glb: true,
            kind: EcKind::Idle,
            cont: Some(Continuation::Idle),
            partner: None,
            rcap: None,
            regs: ExcRegs::default(),
            hazard: AtomicHazard::new(),
            utcb: None,
            fpu: FpuState::new(),
            blocked: false,
            parked: Vec::new(),
            timeout: None,
            help: 0,
            user_page: 0,
        }
    }

    /// User EC. Global ECs start by delivering a startup exception;
    /// local ECs wait for their first call.
    pub fn new(
        pd: PdId,
        cpu: CpuId,
        evt: Selector,
        glb: bool,
        user_page: Mword,
        sp: Mword,
    ) -> Self {
        let mut regs = ExcRegs { dst_portal: crate::config::EXC_STARTUP, ..ExcRegs::default() };
        let cont = if glb {
            regs.cs = crate::config::SEL_USER_CODE;
            regs.ss = crate::config::SEL_USER_DATA;
            regs.rfl = ExcRegs::EFL_IF;
            regs.rsp = sp;
            Some(Continuation::SendMsg(Resume::Iret))
        } else {
            regs.set_sp(sp);
            None
        };
        Self {
            pd,
            cpu,
            evt,
            glb,
            kind: EcKind::User,
            cont,
            partner: None,
            rcap: None,
            regs,
            hazard: AtomicHazard::new(),
            utcb: Some(Box::new(Utcb::new())),
            fpu: FpuState::new(),
            blocked: false,
            parked: Vec::new(),
            timeout: None,
            help: 0,
            user_page,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.kind == EcKind::Idle
    }

    pub fn state(&self) -> EcState {
        if self.is_idle() {
            return EcState::Idle;
        }
        if self.blocked {
            return EcState::Blocked;
        }
        match self.cont {
            None => EcState::Available,
            Some(Continuation::Dead) => EcState::Dead,
            Some(Continuation::RecvKern) => EcState::AwaitingKernelMessage,
            Some(Continuation::RecvUser) => EcState::AwaitingUserMessage,
            Some(Continuation::RetUserIret | Continuation::SendMsg(_)) => EcState::RunningIret,
            Some(_) => EcState::RunningSysexit,
        }
    }
}
