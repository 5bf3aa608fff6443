// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host HAL used by unit tests: records every hardware operation.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use super::{
    Fixup, Fpu, GdtKind, IoapicRoute, Ipi, KernelLabels, LvtEntry, MsiMessage, NmiSafe, Platform,
    Timer, Tlb,
};
use crate::ec::FpuState;
use crate::types::CpuId;

pub const IRET_TO_USER: u64 = 0xffff_ffff_8010_0040;
pub const IDLE_HLT: u64 = 0xffff_ffff_8010_0100;
pub const RDMSR_PROBE: u64 = 0xffff_ffff_8010_0200;
pub const RDMSR_PROBE_FIXUP: u64 = 0xffff_ffff_8010_0210;

pub struct HostHal {
    pub now: AtomicU64,
    pub fpu_saves: AtomicUsize,
    pub fpu_loads: AtomicUsize,
    /// Contents of the hardware FPU registers.
    pub fpu_hw: Mutex<FpuState>,
    pub tlb_flushes: AtomicUsize,
    pub ipis: Mutex<Vec<(CpuId, u8)>>,
    pub nmis: Mutex<Vec<CpuId>>,
    pub gdt: AtomicU8,
    pub host_sel_cs: AtomicU16,
    pub tss_reloads: AtomicUsize,
    pub segment_reloads: AtomicUsize,
    pub machine_checks: AtomicUsize,
    pub msrs: Mutex<BTreeMap<u32, u64>>,
    pub fixups: Vec<Fixup>,
    pub suspend_ok: AtomicBool,
    pub microcode_loads: Mutex<Vec<u64>>,
    /// Physical config-space address to requester id.
    pub pci: BTreeMap<u64, u16>,
    pub iommu_hints: Vec<u64>,
    pub assigned: Mutex<Vec<(u16, u32)>>,
    /// IOAPIC id to pin count.
    pub ioapics: BTreeMap<u8, u8>,
    pub routes: Mutex<Vec<IoapicRoute>>,
    pub pin_masks: Mutex<BTreeMap<(u8, u8), bool>>,
    pub lvt_entries: u8,
    pub therm_vector: AtomicU8,
    pub therm_masked: AtomicBool,
}

impl HostHal {
    pub fn new() -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(0x10, 0);
        let mut pci = BTreeMap::new();
        pci.insert(0xe000_0000, 0x0010);
        let mut ioapics = BTreeMap::new();
        ioapics.insert(0, 24);
        Self {
            now: AtomicU64::new(0),
            fpu_saves: AtomicUsize::new(0),
            fpu_loads: AtomicUsize::new(0),
            fpu_hw: Mutex::new(FpuState::new()),
            tlb_flushes: AtomicUsize::new(0),
            ipis: Mutex::new(Vec::new()),
            nmis: Mutex::new(Vec::new()),
            gdt: AtomicU8::new(GdtKind::Full as u8),
            host_sel_cs: AtomicU16::new(0x08),
            tss_reloads: AtomicUsize::new(0),
            segment_reloads: AtomicUsize::new(0),
            machine_checks: AtomicUsize::new(0),
            msrs: Mutex::new(msrs),
            fixups: alloc::vec![Fixup { fault_rip: RDMSR_PROBE, resume_rip: RDMSR_PROBE_FIXUP }],
            suspend_ok: AtomicBool::new(false),
            microcode_loads: Mutex::new(Vec::new()),
            pci,
            iommu_hints: alloc::vec![0],
            assigned: Mutex::new(Vec::new()),
            ioapics,
            routes: Mutex::new(Vec::new()),
            pin_masks: Mutex::new(BTreeMap::new()),
            lvt_entries: 6,
            therm_vector: AtomicU8::new(0),
            therm_masked: AtomicBool::new(true),
        }
    }

    pub fn fpu_accesses(&self) -> usize {
        self.fpu_saves.load(Ordering::Relaxed) + self.fpu_loads.load(Ordering::Relaxed)
    }

    pub fn gdt_kind(&self) -> GdtKind {
        if self.gdt.load(Ordering::Relaxed) == GdtKind::KernelOnly as u8 {
            GdtKind::KernelOnly
        } else {
            GdtKind::Full
        }
    }
}

impl Default for HostHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for HostHal {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn set_wakeup(&self, _deadline: u64) {}
}

impl Tlb for HostHal {
    fn flush_all(&self) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Fpu for HostHal {
    fn save(&self, state: &mut FpuState) {
        self.fpu_saves.fetch_add(1, Ordering::Relaxed);
        *state = self.fpu_hw.lock().clone();
    }

    fn load(&self, state: &FpuState) {
        self.fpu_loads.fetch_add(1, Ordering::Relaxed);
        *self.fpu_hw.lock() = state.clone();
    }
}

impl Ipi for HostHal {
    fn send_ipi(&self, cpu: CpuId, vector: u8) {
        self.ipis.lock().push((cpu, vector));
    }

    fn send_nmi(&self, cpu: CpuId) {
        self.nmis.lock().push(cpu);
    }
}

impl NmiSafe for HostHal {
    fn labels(&self) -> KernelLabels {
        KernelLabels { iret_to_user: IRET_TO_USER, idle_hlt: IDLE_HLT }
    }

    fn load_gdt(&self, kind: GdtKind) {
        self.gdt.store(kind as u8, Ordering::Relaxed);
    }

    fn write_host_sel_cs(&self, sel: u16) {
        self.host_sel_cs.store(sel, Ordering::Relaxed);
    }
}

impl Platform for HostHal {
    fn fixups(&self) -> &[Fixup] {
        &self.fixups
    }

    fn reload_tss(&self) {
        self.tss_reloads.fetch_add(1, Ordering::Relaxed);
    }

    fn reload_segments(&self) {
        self.segment_reloads.fetch_add(1, Ordering::Relaxed);
    }

    fn machine_check(&self) {
        self.machine_checks.fetch_add(1, Ordering::Relaxed);
    }

    fn msr_read(&self, index: u32) -> Option<u64> {
        self.msrs.lock().get(&index).copied()
    }

    fn msr_write(&self, index: u32, value: u64) -> bool {
        match self.msrs.lock().get_mut(&index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn suspend(&self, _slp_typa: u8, _slp_typb: u8) -> bool {
        self.suspend_ok.load(Ordering::Relaxed)
    }

    fn waking_vector(&self) -> u64 {
        0x9_a000
    }

    fn update_microcode(&self, phys: u64) -> bool {
        self.microcode_loads.lock().push(phys);
        true
    }

    fn pci_rid(&self, phys: u64) -> Option<u16> {
        self.pci.get(&phys).copied()
    }

    fn hpet_rid(&self, _phys: u64) -> Option<u16> {
        None
    }

    fn iommu_assign(&self, hint: u64, rid: u16, domain: u32) -> bool {
        if !self.iommu_hints.contains(&hint) {
            return false;
        }
        self.assigned.lock().push((rid, domain));
        true
    }

    fn ioapic_pins(&self, ioapic: u8) -> Option<u8> {
        self.ioapics.get(&ioapic).copied()
    }

    fn ioapic_route(&self, route: IoapicRoute) {
        self.routes.lock().push(route);
    }

    fn ioapic_mask(&self, ioapic: u8, pin: u8, masked: bool) {
        self.pin_masks.lock().insert((ioapic, pin), masked);
    }

    fn msi_compose(&self, cpu: CpuId, vector: u8, _rid: u16) -> MsiMessage {
        MsiMessage {
            address: 0xfee0_0000 | (u64::from(cpu.as_raw()) << 12),
            data: u32::from(vector),
        }
    }

    fn lvt_max(&self) -> u8 {
        self.lvt_entries
    }

    fn lvt_assign(&self, _entry: LvtEntry, vector: u8) {
        self.therm_vector.store(vector, Ordering::Relaxed);
    }

    fn lvt_mask(&self, _entry: LvtEntry, masked: bool) {
        self.therm_masked.store(masked, Ordering::Relaxed);
    }
}
