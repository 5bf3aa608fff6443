// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved register frame of an EC and the message transfer descriptor.
//!
//! One frame serves both return paths. The sysret path takes the user
//! instruction pointer from RCX and the flags from R11; the iret path uses
//! `rip`/`cs`/`rfl`/`rsp`/`ss`. Hypercall arguments sit in RDI, RSI, RDX,
//! RAX and R8, and the status is written back to RDI.

use bitflags::bitflags;

use crate::config::{SEL_USER_CODE, SEL_USER_DATA};
use crate::syscall::Status;
use crate::types::Mword;

pub const RAX: usize = 0;
pub const RCX: usize = 1;
pub const RDX: usize = 2;
pub const RBX: usize = 3;
pub const RBP: usize = 4;
pub const RSI: usize = 5;
pub const RDI: usize = 6;
pub const R8: usize = 7;
pub const R11: usize = 10;
pub const R15: usize = 14;

bitflags! {
    /// Which parts of an exception frame travel through the UTCB.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Mtd: u64 {
        const GPR_ACDB = 1 << 0;
        const GPR_BSD = 1 << 1;
        const RSP = 1 << 2;
        const RIP_LEN = 1 << 3;
        const RFLAGS = 1 << 4;
        const DS_ES = 1 << 5;
        const QUAL = 1 << 15;
        const GPR_R8_R15 = 1 << 22;
        const FPU = 1 << 31;
    }
}

/// Register frame saved on kernel entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ExcRegs {
    pub gpr: [Mword; 15],
    /// Event-base offset of the portal the next `send_msg` targets.
    pub dst_portal: Mword,
    /// Transfer descriptor of the portal that delivered the last exception.
    pub mtd: Mtd,
    pub vec: Mword,
    pub err: Mword,
    pub cr2: Mword,
    pub rip: Mword,
    pub cs: Mword,
    pub rfl: Mword,
    pub rsp: Mword,
    pub ss: Mword,
}

impl ExcRegs {
    pub const EFL_CF: Mword = 1 << 0;
    pub const EFL_IF: Mword = 1 << 9;
    /// Page-fault error code bit: access from user mode.
    pub const ERR_U: Mword = 1 << 2;

    #[inline]
    pub const fn user(&self) -> bool {
        self.cs & 3 == 3
    }

    #[inline]
    pub const fn arg1(&self) -> Mword {
        self.gpr[RDI]
    }

    #[inline]
    pub const fn arg2(&self) -> Mword {
        self.gpr[RSI]
    }

    #[inline]
    pub const fn arg3(&self) -> Mword {
        self.gpr[RDX]
    }

    #[inline]
    pub const fn arg4(&self) -> Mword {
        self.gpr[RAX]
    }

    #[inline]
    pub const fn arg5(&self) -> Mword {
        self.gpr[R8]
    }

    #[inline]
    pub fn set_arg2(&mut self, v: Mword) {
        self.gpr[RSI] = v;
    }

    #[inline]
    pub fn set_arg3(&mut self, v: Mword) {
        self.gpr[RDX] = v;
    }

    #[inline]
    pub fn set_arg4(&mut self, v: Mword) {
        self.gpr[RAX] = v;
    }

    /// Hypercall number.
    #[inline]
    pub const fn id(&self) -> u8 {
        (self.arg1() & 0xff) as u8
    }

    /// Flags or sub-operation.
    #[inline]
    pub const fn flags(&self) -> u8 {
        ((self.arg1() >> 8) & 0xf) as u8
    }

    /// Selector operand carried in ARG1.
    #[inline]
    pub const fn sel(&self) -> Mword {
        self.arg1() >> 12
    }

    #[inline]
    pub fn set_status(&mut self, status: Status) {
        self.gpr[RDI] = status as Mword;
    }

    #[inline]
    pub fn status(&self) -> u8 {
        (self.gpr[RDI] & 0xff) as u8
    }

    /// Portal id handed to a receiver.
    #[inline]
    pub fn set_pt(&mut self, id: Mword) {
        self.gpr[RDI] = id;
    }

    /// Entry point for the next sysret.
    #[inline]
    pub fn set_ip(&mut self, ip: Mword) {
        self.gpr[RCX] = ip;
    }

    #[inline]
    pub fn set_sp(&mut self, sp: Mword) {
        self.rsp = sp;
    }

    /// Converts a sysret frame into an iret frame.
    pub fn redirect_to_iret(&mut self) {
        self.rip = self.gpr[RCX];
        self.rfl = self.gpr[R11];
        self.cs = SEL_USER_CODE;
        self.ss = SEL_USER_DATA;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysret_frame_redirects_to_iret() {
        let mut r = ExcRegs::default();
        r.set_ip(0x4000);
        r.gpr[R11] = ExcRegs::EFL_IF;
        r.redirect_to_iret();
        assert_eq!((r.rip, r.rfl), (0x4000, ExcRegs::EFL_IF));
        assert!(r.user());
    }

    #[test]
    fn arg1_splits_into_id_flags_and_selector() {
        let mut r = ExcRegs::default();
        r.gpr[RDI] = (0x42 << 12) | (0x3 << 8) | 0x07;
        assert_eq!((r.id(), r.flags(), r.sel()), (0x07, 0x3, 0x42));
    }
}
