// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-processor kernel state and its NMI-visible shadow
//! OWNERS: @kernel-team
//! PUBLIC API: PerCpu, CpuShadow, ShootdownTicket
//! DEPENDS_ON: hazard::AtomicHazard, hal::GdtKind
//! INVARIANTS: Only the owning processor writes PerCpu fields other than `hazard`;
//!             CpuShadow is all atomics and is the only per-CPU state the NMI path may touch

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

use crate::ec::{EcId, ExcRegs};
use crate::hal::GdtKind;
use crate::hazard::AtomicHazard;
use crate::obj::ScId;
use crate::types::CpuId;

/// Per-processor state safe to read and update from NMI context.
#[derive(Debug)]
pub struct CpuShadow {
    /// Shootdown acknowledgements; bumped by every NMI.
    pub tlb_shootdown: AtomicU16,
    /// The host TLB holds translations removed from the current domain.
    pub stale_tlb: AtomicBool,
    /// GS points at this processor's kernel data (the interrupted code ran in the kernel).
    pub cpulocal: AtomicBool,
    /// Descriptor table currently loaded, as `GdtKind`.
    pub gdt: AtomicU8,
    /// A VMCS is loaded on this processor.
    pub vmcs_active: AtomicBool,
}

impl CpuShadow {
    pub const fn new() -> Self {
        Self {
            tlb_shootdown: AtomicU16::new(0),
            stale_tlb: AtomicBool::new(false),
            cpulocal: AtomicBool::new(true),
            gdt: AtomicU8::new(GdtKind::Full as u8),
            vmcs_active: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn shootdown_count(&self) -> u16 {
        self.tlb_shootdown.load(Ordering::Acquire)
    }

    #[inline]
    pub fn gdt_kind(&self) -> GdtKind {
        if self.gdt.load(Ordering::Relaxed) == GdtKind::KernelOnly as u8 {
            GdtKind::KernelOnly
        } else {
            GdtKind::Full
        }
    }
}

impl Default for CpuShadow {
    fn default() -> Self {
        Self::new()
    }
}

/// Acknowledgement counters sampled when a shootdown was sent.
#[must_use = "a shootdown is complete only after every target acknowledged"]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShootdownTicket {
    pub targets: Vec<(CpuId, u16)>,
}

/// Kernel state of one processor.
pub struct PerCpu {
    pub id: CpuId,
    pub hazard: AtomicHazard,
    pub current_ec: EcId,
    pub current_sc: ScId,
    pub idle_ec: EcId,
    pub idle_sc: ScId,
    /// EC whose FPU registers are live in hardware.
    pub fpu_owner: Option<EcId>,
    /// Length of the partner chain found by the last activation.
    pub ctr_link: u32,
    pub shadow: CpuShadow,
    /// Last exception frame seen in kernel mode, for diagnostics.
    pub last_trap: Option<ExcRegs>,
    /// ECs with a pending semaphore timeout.
    pub timeouts: Vec<EcId>,
    /// Timestamp of the last timer interrupt.
    pub last_tick: u64,
}

impl PerCpu {
    pub fn new(id: CpuId, idle_ec: EcId, idle_sc: ScId) -> Self {
        Self {
            id,
            hazard: AtomicHazard::new(),
            current_ec: idle_ec,
            current_sc: idle_sc,
            idle_ec,
            idle_sc,
            fpu_owner: None,
            ctr_link: 0,
            shadow: CpuShadow::new(),
            last_trap: None,
            timeouts: Vec::new(),
            last_tick: 0,
        }
    }
}
