// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hypercall dispatcher and status codes
//! OWNERS: @kernel-team
//! PUBLIC API: HypercallTable, Handler, Status, HC_* IDs
//! DEPENDS_ON: kernel::Kernel, syscall::api (handlers), syscall::abi (register layout)
//! INVARIANTS: Fixed MAX_HYPERCALL window; stable IDs; every handler ends in exactly one status;
//!             unknown numbers finish with BadHypercall
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod abi;
pub mod api;

use core::fmt;

use crate::cap::CapError;
use crate::hal::Hal;
use crate::kernel::{Kernel, Step};
use crate::sched::Scheduler;
use crate::space::SpaceError;
use crate::types::CpuId;
use crate::xfer::XferError;

/// Size of the dispatch table.
const MAX_HYPERCALL: usize = 32;

/// Hypercall numbers (low byte of ARG1).
pub const HC_CALL: u8 = 0;
pub const HC_REPLY: u8 = 1;
pub const HC_CREATE_PD: u8 = 2;
pub const HC_CREATE_EC: u8 = 3;
pub const HC_CREATE_SC: u8 = 4;
pub const HC_CREATE_PT: u8 = 5;
pub const HC_CREATE_SM: u8 = 6;
pub const HC_REVOKE: u8 = 7;
pub const HC_PD_CTRL: u8 = 8;
pub const HC_EC_CTRL: u8 = 9;
pub const HC_SC_CTRL: u8 = 10;
pub const HC_PT_CTRL: u8 = 11;
pub const HC_SM_CTRL: u8 = 12;
pub const HC_ASSIGN_PCI: u8 = 13;
pub const HC_MACHINE_CTRL: u8 = 14;
pub const HC_IRQ_CTRL: u8 = 15;
pub const HC_CREATE_KP: u8 = 16;
pub const HC_KP_CTRL: u8 = 17;
pub const HC_CREATE_VCPU: u8 = 18;
pub const HC_VCPU_CTRL: u8 = 19;

/// Result code written to the caller's status register.
///
/// **ABI STABILITY**: discriminants are visible to user space. New
/// variants must be appended.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    Timeout = 1,
    Aborted = 2,
    BadHypercall = 3,
    BadCapability = 4,
    BadParameter = 5,
    BadFeature = 6,
    BadCpu = 7,
    BadDevice = 8,
    OutOfMemory = 9,
}

impl Status {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            1 => Self::Timeout,
            2 => Self::Aborted,
            3 => Self::BadHypercall,
            4 => Self::BadCapability,
            5 => Self::BadParameter,
            6 => Self::BadFeature,
            7 => Self::BadCpu,
            8 => Self::BadDevice,
            9 => Self::OutOfMemory,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<CapError> for Status {
    fn from(_: CapError) -> Self {
        Self::BadCapability
    }
}

impl From<XferError> for Status {
    fn from(value: XferError) -> Self {
        match value {
            XferError::OutOfMemory => Self::OutOfMemory,
            XferError::InvalidMapping => Self::BadParameter,
        }
    }
}

impl From<SpaceError> for Status {
    fn from(value: SpaceError) -> Self {
        match value {
            SpaceError::Occupied => Self::BadCapability,
            SpaceError::OutOfMemory => Self::OutOfMemory,
            SpaceError::InvalidMapping => Self::BadParameter,
        }
    }
}

/// Result type used by hypercall helpers.
pub type SysResult<T> = Result<T, Status>;

/// Hypercall handler: runs on the calling processor and names the next step.
pub type Handler<H, S> = fn(&mut Kernel<H, S>, CpuId) -> Step;

/// Dispatch table storing handlers by hypercall number.
pub struct HypercallTable<H: Hal, S: Scheduler> {
    handlers: [Option<Handler<H, S>>; MAX_HYPERCALL],
}

impl<H: Hal, S: Scheduler> HypercallTable<H, S> {
    pub const fn new() -> Self {
        Self { handlers: [None; MAX_HYPERCALL] }
    }

    pub fn register(&mut self, number: u8, handler: Handler<H, S>) {
        if let Some(slot) = self.handlers.get_mut(number as usize) {
            *slot = Some(handler);
        }
    }

    /// Handler registered for `number`.
    #[must_use]
    pub fn lookup(&self, number: u8) -> Option<Handler<H, S>> {
        self.handlers.get(number as usize).and_then(|entry| *entry)
    }
}

impl<H: Hal, S: Scheduler> Default for HypercallTable<H, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    /// Decodes the hypercall in the current EC's registers and runs it.
    pub(crate) fn hypercall(&mut self, cpu: CpuId) -> Step {
        let id = self.regs(cpu).id();
        match self.table.lookup(id) {
            Some(handler) => handler(self, cpu),
            None => {
                log_debug!(target: "syscall", "unknown hypercall {}", id);
                self.sys_finish(cpu, Status::BadHypercall, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_raw() {
        for raw in 0..=9u8 {
            assert_eq!(Status::from_raw(raw).map(|s| s as u8), Some(raw));
        }
        assert_eq!(Status::from_raw(10), None);
    }

    #[test]
    fn xfer_errors_map_to_distinct_statuses() {
        assert_eq!(Status::from(XferError::OutOfMemory), Status::OutOfMemory);
        assert_eq!(Status::from(XferError::InvalidMapping), Status::BadParameter);
    }
}
