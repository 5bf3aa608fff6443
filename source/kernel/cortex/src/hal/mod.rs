// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! The core never touches hardware directly. Entry stubs, descriptor tables,
//! the local APIC and platform services sit behind these traits; `Hal` is the
//! bundle `Kernel` is generic over.

#[cfg(test)]
pub mod host;

use crate::ec::FpuState;
use crate::types::CpuId;

/// Abstraction for a monotonic timer.
pub trait Timer {
    /// Returns the current time in timestamp-counter ticks.
    fn now(&self) -> u64;
    /// Programs the next wake-up time.
    fn set_wakeup(&self, deadline: u64);
}

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache of the calling processor.
    fn flush_all(&self);
}

/// Floating-point register file.
pub trait Fpu {
    /// Stores the hardware FPU registers into `state`.
    fn save(&self, state: &mut FpuState);
    /// Loads `state` into the hardware FPU registers.
    fn load(&self, state: &FpuState);
}

/// Inter-processor signalling.
pub trait Ipi {
    fn send_ipi(&self, cpu: CpuId, vector: u8);
    fn send_nmi(&self, cpu: CpuId);
}

/// Which descriptor table is loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GdtKind {
    Full = 0,
    /// No user segments: the next `iret` to user mode faults with #GP.
    KernelOnly = 1,
}

/// Addresses of kernel instructions the trap paths must recognise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLabels {
    /// The `iret` of the return-to-user path.
    pub iret_to_user: u64,
    /// The `hlt` of the idle loop.
    pub idle_hlt: u64,
}

/// Operations reachable from the NMI path.
///
/// Implementations must not lock, allocate or log.
pub trait NmiSafe: Tlb {
    fn labels(&self) -> KernelLabels;
    fn load_gdt(&self, kind: GdtKind);
    /// Writes the host CS selector of the loaded VMCS.
    fn write_host_sel_cs(&self, sel: u16);
}

/// Instruction that may fault and the address execution resumes at when it does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fixup {
    pub fault_rip: u64,
    pub resume_rip: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LvtEntry {
    Thermal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoapicRoute {
    pub ioapic: u8,
    pub pin: u8,
    pub cpu: CpuId,
    pub vector: u8,
    pub level: bool,
    pub active_low: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u32,
}

/// Privileged platform services; only reachable from passthrough domains.
pub trait Platform {
    /// Fixup table of instructions allowed to fault in kernel mode.
    fn fixups(&self) -> &[Fixup];
    /// Restores the task register after its limit went stale.
    fn reload_tss(&self);
    /// Reloads DS/ES with the flat user selectors.
    fn reload_segments(&self);
    fn machine_check(&self);
    fn msr_read(&self, index: u32) -> Option<u64>;
    fn msr_write(&self, index: u32, value: u64) -> bool;
    /// Returns only on failure.
    fn suspend(&self, slp_typa: u8, slp_typb: u8) -> bool;
    fn waking_vector(&self) -> u64;
    fn update_microcode(&self, phys: u64) -> bool;
    /// PCI requester id of the device whose config space lives at `phys`.
    fn pci_rid(&self, phys: u64) -> Option<u16>;
    fn hpet_rid(&self, phys: u64) -> Option<u16>;
    /// Binds requester `rid` to DMA domain `domain` on the IOMMU selected by `hint`.
    fn iommu_assign(&self, hint: u64, rid: u16, domain: u32) -> bool;
    fn ioapic_pins(&self, ioapic: u8) -> Option<u8>;
    fn ioapic_route(&self, route: IoapicRoute);
    fn ioapic_mask(&self, ioapic: u8, pin: u8, masked: bool);
    fn msi_compose(&self, cpu: CpuId, vector: u8, rid: u16) -> MsiMessage;
    fn lvt_max(&self) -> u8;
    fn lvt_assign(&self, entry: LvtEntry, vector: u8);
    fn lvt_mask(&self, entry: LvtEntry, masked: bool);
}

/// Everything the core needs from the machine.
pub trait Hal: Timer + Fpu + Ipi + NmiSafe + Platform {}

impl<T> Hal for T where T: Timer + Fpu + Ipi + NmiSafe + Platform {}
