// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NMI and double-fault handling on the alternate stack
//! OWNERS: @kernel-team
//! PUBLIC API: handle_exc_altstack, AltstackOutcome
//! DEPENDS_ON: cpu::CpuShadow (atomics only), hal::NmiSafe
//! INVARIANTS: Touches nothing but the processor shadow and NmiSafe operations: no locks, no
//!             allocation, no logging, no kernel objects. Work that needs more is deferred by
//!             loading the kernel-only descriptor table so the next iret to user mode faults.
//!
//! The handler is a free function over the shadow and the HAL. It cannot
//! reach `Kernel`, so nothing NMI-unsafe is callable from here.

use core::sync::atomic::Ordering;

use crate::config::{EXC_DF, EXC_NMI, SEL_KERN_CODE};
use crate::cpu::CpuShadow;
use crate::ec::ExcRegs;
use crate::hal::{GdtKind, NmiSafe};

/// What the entry stub does after the alternate-stack handler.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AltstackOutcome {
    /// Return to the interrupted context with the (possibly updated) frame.
    Return,
    /// Unrecoverable; stop the processor.
    Halt { vector: u64 },
}

pub fn handle_exc_altstack<N: NmiSafe + ?Sized>(
    shadow: &CpuShadow,
    hal: &N,
    frame: &mut ExcRegs,
) -> AltstackOutcome {
    match frame.vec {
        EXC_NMI => {
            // Any NMI acknowledges pending shootdowns.
            shadow.tlb_shootdown.fetch_add(1, Ordering::AcqRel);
            if frame.user() {
                if shadow.stale_tlb.swap(false, Ordering::AcqRel) {
                    hal.flush_all();
                }
            } else {
                defer_to_iret(shadow, hal, frame);
            }
            AltstackOutcome::Return
        }
        EXC_DF => AltstackOutcome::Halt { vector: EXC_DF },
        vector => AltstackOutcome::Halt { vector },
    }
}

/// Arms the descriptor-table trap for an NMI that hit kernel code.
fn defer_to_iret<N: NmiSafe + ?Sized>(shadow: &CpuShadow, hal: &N, frame: &mut ExcRegs) {
    let labels = hal.labels();
    if frame.cs == SEL_KERN_CODE && frame.rip == labels.idle_hlt {
        // Skip the hlt so the idle loop rechecks its hazards.
        frame.rip += 1;
    }
    hal.load_gdt(GdtKind::KernelOnly);
    shadow.gdt.store(GdtKind::KernelOnly as u8, Ordering::Release);
    if shadow.vmcs_active.load(Ordering::Acquire) {
        // A VM exit with a null host CS also lands in the fixup path.
        hal.write_host_sel_cs(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::host::{HostHal, IDLE_HLT};

    fn kernel_frame(rip: u64) -> ExcRegs {
        ExcRegs { vec: EXC_NMI, cs: SEL_KERN_CODE, rip, ..ExcRegs::default() }
    }

    #[test]
    fn nmi_in_user_mode_flushes_pending_shootdown() {
        let hal = HostHal::new();
        let shadow = CpuShadow::new();
        shadow.stale_tlb.store(true, Ordering::Relaxed);
        let mut frame =
            ExcRegs { vec: EXC_NMI, cs: crate::config::SEL_USER_CODE, ..ExcRegs::default() };
        assert_eq!(handle_exc_altstack(&shadow, &hal, &mut frame), AltstackOutcome::Return);
        assert_eq!(hal.tlb_flushes.load(Ordering::Relaxed), 1);
        assert_eq!(shadow.shootdown_count(), 1);
        assert_eq!(shadow.gdt_kind(), GdtKind::Full);
    }

    #[test]
    fn nmi_in_kernel_defers_through_gdt() {
        let hal = HostHal::new();
        let shadow = CpuShadow::new();
        shadow.stale_tlb.store(true, Ordering::Relaxed);
        shadow.vmcs_active.store(true, Ordering::Relaxed);
        let mut frame = kernel_frame(0xffff_ffff_8000_1234);
        assert_eq!(handle_exc_altstack(&shadow, &hal, &mut frame), AltstackOutcome::Return);
        assert_eq!(hal.tlb_flushes.load(Ordering::Relaxed), 0, "flush waits for the iret fault");
        assert!(shadow.stale_tlb.load(Ordering::Relaxed));
        assert_eq!(shadow.gdt_kind(), GdtKind::KernelOnly);
        assert_eq!(hal.gdt_kind(), GdtKind::KernelOnly);
        assert_eq!(hal.host_sel_cs.load(Ordering::Relaxed), 0);
        assert_eq!(frame.rip, 0xffff_ffff_8000_1234);
    }

    #[test]
    fn nmi_on_idle_hlt_skips_instruction() {
        let hal = HostHal::new();
        let shadow = CpuShadow::new();
        let mut frame = kernel_frame(IDLE_HLT);
        let _ = handle_exc_altstack(&shadow, &hal, &mut frame);
        assert_eq!(frame.rip, IDLE_HLT + 1);
    }

    #[test]
    fn double_fault_halts() {
        let hal = HostHal::new();
        let shadow = CpuShadow::new();
        let mut frame = ExcRegs { vec: EXC_DF, ..ExcRegs::default() };
        assert_eq!(
            handle_exc_altstack(&shadow, &hal, &mut frame),
            AltstackOutcome::Halt { vector: EXC_DF }
        );
    }
}
