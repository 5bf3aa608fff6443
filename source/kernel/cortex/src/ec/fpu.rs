// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lazily switched floating-point state.
//!
//! Each processor remembers which EC's registers are live in hardware. The
//! registers only move when an EC other than the owner becomes current; the
//! per-processor idle EC never takes ownership.

use core::fmt;

use super::EcId;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::sched::Scheduler;
use crate::types::CpuId;

/// FXSAVE image.
#[derive(Clone, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct FpuState {
    data: [u8; Self::SIZE],
}

impl FpuState {
    pub const SIZE: usize = 512;

    const FCW: usize = 0;
    const MXCSR: usize = 24;

    /// Power-on state: all exceptions masked.
    pub fn new() -> Self {
        let mut data = [0u8; Self::SIZE];
        data[Self::FCW..Self::FCW + 2].copy_from_slice(&0x037fu16.to_le_bytes());
        data[Self::MXCSR..Self::MXCSR + 4].copy_from_slice(&0x1f80u32.to_le_bytes());
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fcw = u16::from_le_bytes([self.data[0], self.data[1]]);
        f.debug_struct("FpuState").field("fcw", &fcw).finish()
    }
}

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    /// Moves hardware FPU ownership on `cpu` from `from` to `to`.
    pub(crate) fn transfer_fpu(&mut self, cpu: CpuId, to: EcId, from: EcId) {
        if to == from || self.is_idle_ec(to) {
            return;
        }
        let owner = self.cpus[cpu.as_index()].fpu_owner;
        if owner == Some(to) {
            return;
        }
        if let Some(prev) = owner {
            self.save_fpu(prev);
        }
        if let Some(ec) = self.ecs.get(to) {
            self.hal.load(&ec.fpu);
        }
        self.cpus[cpu.as_index()].fpu_owner = Some(to);
    }

    /// Writes the live registers back into `ec`'s save area.
    pub(crate) fn save_fpu(&mut self, ec: EcId) {
        if self.is_idle_ec(ec) {
            return;
        }
        if let Some(ec) = self.ecs.get_mut(ec) {
            self.hal.save(&mut ec.fpu);
        }
    }

    /// Makes `ec`'s save area authoritative: the hardware copy is saved if
    /// `ec` owns it, and ownership is dropped so the next switch reloads.
    pub(crate) fn sync_fpu(&mut self, cpu: CpuId, ec: EcId, invalidate: bool) {
        let slot = &mut self.cpus[cpu.as_index()].fpu_owner;
        if *slot != Some(ec) {
            return;
        }
        if invalidate {
            *slot = None;
        } else {
            self.save_fpu(ec);
        }
    }
}
