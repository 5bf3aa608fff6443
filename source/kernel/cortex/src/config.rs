// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel configuration and fixed layout constants
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, Features, MAX_CPUS, NUM_PRIORITIES, vector and selector constants
//! DEPENDS_ON: bitflags
//! INVARIANTS: KernelConfig::DEFAULT stable across boots; cpus <= MAX_CPUS
//!
//! Values that user space can observe (vector numbers, window bases, the user
//! address limit) are constants. Tunables that differ between machines or
//! tests live in `KernelConfig`, handed to `Kernel::new` once.

use bitflags::bitflags;

use crate::types::CpuMask;

/// Upper bound for per-CPU tables.
pub const MAX_CPUS: usize = 8;

/// Scheduling priorities `0..NUM_PRIORITIES`; 0 is reserved for the idle SC.
pub const NUM_PRIORITIES: usize = 128;

/// Exception vectors.
pub const EXC_DB: u64 = 1;
pub const EXC_NMI: u64 = 2;
pub const EXC_DF: u64 = 8;
pub const EXC_GP: u64 = 13;
pub const EXC_PF: u64 = 14;
pub const EXC_MC: u64 = 18;
/// Number of architectural exception slots in an event base.
pub const NUM_EXC: u64 = 32;
/// Artificial vectors delivered through the exception portals.
pub const EXC_STARTUP: u64 = NUM_EXC - 2;
pub const EXC_RECALL: u64 = NUM_EXC - 1;

/// First interrupt vector handed to user space.
pub const VEC_USER: u8 = 32;
pub const NUM_USER_VECTORS: usize = 0xf0 - VEC_USER as usize;
pub const VEC_LVT_TIMER: u8 = 0xf0;
/// Remote run queue IPI.
pub const VEC_IPI_RRQ: u8 = 0xfc;
/// Remote kernel entry IPI (recall).
pub const VEC_IPI_RKE: u8 = 0xfd;

/// Segment selectors.
pub const SEL_KERN_CODE: u64 = 0x08;
pub const SEL_USER_CODE: u64 = 0x1b;
pub const SEL_USER_DATA: u64 = 0x23;

/// Selectors of the root task's own capabilities, right after its exception portals.
pub const SEL_ROOT_PD: u64 = NUM_EXC;
pub const SEL_ROOT_EC: u64 = NUM_EXC + 1;
pub const SEL_ROOT_SC: u64 = NUM_EXC + 2;

/// End of the user half of the address space.
pub const USER_ADDR: u64 = 0x0000_8000_0000_0000;
/// Kernel window backing object spaces; faults here are lazy mapping faults.
pub const SPC_LOCAL_OBJ: u64 = 0xffff_ff00_0000_0000;

bitflags! {
    /// Platform features discovered at boot.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Features: u32 {
        const VMX = 1 << 0;
        const IOMMU = 1 << 1;
        const IOMMU_IRQ_REMAP = 1 << 2;
        const SUSPEND = 1 << 3;
    }
}

/// Kernel tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Processors brought online.
    pub online: CpuMask,
    /// Help attempts a blocked call may make before it reports `Timeout`.
    pub help_budget: u32,
    /// Space nodes a new protection domain may allocate.
    pub default_quota: usize,
    /// Timestamp counter frequency, used to report SC time in microseconds.
    pub tsc_khz: u64,
    /// Largest microcode blob the kernel can map in one piece.
    pub microcode_remap_size: u64,
    pub features: Features,
    /// Priority of the root task's scheduling context.
    pub root_prio: u8,
    /// Quantum of the root task's scheduling context, in ticks.
    pub root_quantum: u64,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        online: CpuMask::first(1),
        help_budget: 1,
        default_quota: 1024,
        tsc_khz: 1_000_000,
        microcode_remap_size: 2 * 1024 * 1024,
        features: Features::empty(),
        root_prio: 1,
        root_quantum: 10_000,
    };

    /// Same configuration with the first `n` processors online.
    pub const fn with_cpus(mut self, n: usize) -> Self {
        self.online = CpuMask::first(n);
        self
    }

    pub const fn with_help_budget(mut self, budget: u32) -> Self {
        self.help_budget = budget;
        self
    }

    pub const fn with_default_quota(mut self, quota: usize) -> Self {
        self.default_quota = quota;
        self
    }

    pub const fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub const fn with_root_sc(mut self, prio: u8, quantum: u64) -> Self {
        self.root_prio = prio;
        self.root_quantum = quantum;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
