// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the continuation trampoline
//! OWNERS: @kernel-ipc-team @kernel-sched-team
//! NOTE: Tests only; no kernel logic. Drives random hypercall and timer sequences through
//!       the host HAL.
//!
//! TEST_SCOPE:
//!   - Call/reply links: partner and reply capability always come in matching pairs
//!   - Hazard draining: every entry reaches an exit in a bounded number of steps
//!   - Processor affinity: calls never cross processors
//!
//! TEST_SCENARIOS:
//!   - links_stay_paired(): random call/reply/tick sequences keep partner/rcap symmetric
//!   - hazards_drain_before_user_mode(): processor hazards are gone once control returns to
//!     user mode
//!   - remote_callee_is_refused(): a portal bound to another processor yields BadCpu

use core::sync::atomic::Ordering;

use proptest::prelude::*;

use super::{Exit, Kernel};
use crate::cap::Perms;
use crate::config::{KernelConfig, EXC_DB, EXC_RECALL, SEL_ROOT_PD, SEL_USER_CODE, VEC_LVT_TIMER};
use crate::ec::{EcId, Mtd};
use crate::hal::host::HostHal;
use crate::hazard::Hazard;
use crate::obj::Pt;
use crate::sched::PriorityScheduler;
use crate::syscall::abi::{self, Hypercall};
use crate::syscall::{Status, HC_CALL, HC_CREATE_EC, HC_CREATE_PT, HC_REPLY};
use crate::types::{CpuId, Mword, Selector};

type TestKernel = Kernel<HostHal, PriorityScheduler>;

const BOOT: CpuId = CpuId::BOOT;
/// Steps any single entry may take before it must have left the kernel.
const STEP_BOUND: usize = 64;
const PORTALS: Mword = 0x40;
const HANDLERS: Mword = 0x80;

#[derive(Clone, Copy, Debug)]
enum Op {
    Call(Mword),
    Reply,
    Tick(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3 as Mword).prop_map(Op::Call),
        Just(Op::Reply),
        (1u64..20_000).prop_map(Op::Tick),
    ]
}

fn hypercall(k: &mut TestKernel, call: Hypercall) -> Exit {
    let mut regs = k.regs(BOOT);
    call.apply(&mut regs);
    k.syscall(BOOT, &regs)
}

/// Boots a root task with `n` local ECs, each behind a portal at `PORTALS + i`.
fn boot_with_servers(config: KernelConfig, cpu: u16, n: Mword) -> (TestKernel, EcId) {
    let mut k = Kernel::new(HostHal::new(), PriorityScheduler::new(), config);
    let root = k.bootstrap(0x40_0000, 0x80_0000).expect("bootstrap");
    assert_eq!(k.boot_cpu(BOOT), Exit::Sysret(root.ec));
    for i in 0..n {
        let ec = HANDLERS + i;
        let create = Hypercall::new(HC_CREATE_EC, ec)
            .arg(2, SEL_ROOT_PD)
            .arg(3, abi::ec_placement(cpu, 0));
        assert_eq!(hypercall(&mut k, create), Exit::Sysret(root.ec));
        let pt = Hypercall::new(HC_CREATE_PT, PORTALS + i)
            .arg(2, SEL_ROOT_PD)
            .arg(3, ec)
            .arg(5, 0x1000 * (i + 1));
        assert_eq!(hypercall(&mut k, pt), Exit::Sysret(root.ec));
    }
    (k, root.ec)
}

fn running(exit: Exit) -> Option<EcId> {
    match exit {
        Exit::Sysret(ec) | Exit::Iret(ec) => Some(ec),
        Exit::Trap | Exit::Halt => None,
    }
}

fn assert_links_paired(k: &TestKernel) {
    for (id, ec) in k.ecs.iter() {
        if let Some(callee) = ec.partner {
            assert_eq!(k.ecs.get(callee).and_then(|e| e.rcap), Some(id), "partner of {:?}", id);
        }
        if let Some(caller) = ec.rcap {
            assert_eq!(k.ecs.get(caller).and_then(|e| e.partner), Some(id), "rcap of {:?}", id);
        }
    }
}

proptest! {
    #[test]
    fn links_stay_paired(ops in prop::collection::vec(arb_op(), 1..40)) {
        let (mut k, _) = boot_with_servers(KernelConfig::DEFAULT, 0, 3);
        let mut now = 0;
        for op in ops {
            let cur = k.current_ec(BOOT);
            if k.is_idle_ec(cur) {
                break;
            }
            let exit = match op {
                Op::Call(i) => hypercall(&mut k, Hypercall::new(HC_CALL, PORTALS + i)),
                Op::Reply => hypercall(&mut k, Hypercall::new(HC_REPLY, 0)),
                Op::Tick(dt) => {
                    now += dt;
                    k.hal.now.store(now, Ordering::Relaxed);
                    let mut frame = k.regs(BOOT);
                    frame.vec = Mword::from(VEC_LVT_TIMER);
                    frame.cs = SEL_USER_CODE;
                    k.interrupt(BOOT, &frame)
                }
            };
            prop_assert!(k.steps < STEP_BOUND);
            if let Some(ec) = running(exit) {
                prop_assert_eq!(ec, k.current_ec(BOOT));
            }
            assert_links_paired(&k);
        }
    }

    #[test]
    fn hazards_drain_before_user_mode(
        cpu_bits in 0u32..4,
        ec_bits in 0u32..8,
    ) {
        let (mut k, root) = boot_with_servers(KernelConfig::DEFAULT, 0, 1);
        // Exception handlers for recall and single-step share the first server.
        for vector in [EXC_DB, EXC_RECALL] {
            let pt = Hypercall::new(HC_CREATE_PT, vector)
                .arg(2, SEL_ROOT_PD)
                .arg(3, HANDLERS)
                .arg(4, Mtd::RIP_LEN.bits());
            prop_assert_eq!(hypercall(&mut k, pt), Exit::Sysret(root));
        }
        let cpu_hazards = [Hazard::RCU, Hazard::SCHED]
            .into_iter()
            .enumerate()
            .filter(|(i, _)| cpu_bits & (1 << i) != 0)
            .fold(Hazard::empty(), |acc, (_, h)| acc | h);
        let ec_hazards = [Hazard::DS_ES, Hazard::RECALL, Hazard::STEP]
            .into_iter()
            .enumerate()
            .filter(|(i, _)| ec_bits & (1 << i) != 0)
            .fold(Hazard::empty(), |acc, (_, h)| acc | h);
        k.cpus[BOOT.as_index()].hazard.set(cpu_hazards);
        let _ = k.ecs.get(root).map(|e| e.hazard.set(ec_hazards));

        let exit = hypercall(&mut k, Hypercall::new(31, 0));
        prop_assert!(k.steps < STEP_BOUND);
        prop_assert!(!k.percpu(BOOT).hazard.load().intersects(Hazard::RCU | Hazard::SCHED));

        let handler = k.pds.get(k.current_pd(BOOT))
            .and_then(|pd| pd.cast::<Pt>(Selector::from_raw(EXC_RECALL), Perms::empty()).ok())
            .and_then(|pt| k.pts.get(pt).map(|p| p.ec));
        if ec_hazards.intersects(Hazard::RECALL | Hazard::STEP) {
            prop_assert_eq!(running(exit), handler);
            let expected =
                if ec_hazards.contains(Hazard::RECALL) { Hazard::RECALL } else { Hazard::STEP };
            let left = k.ecs.get(root).map_or(Hazard::empty(), |e| e.hazard.load());
            prop_assert!(!left.contains(expected));
        } else {
            prop_assert_eq!(exit, Exit::Sysret(root));
            prop_assert_eq!(k.ecs.get(root).map(|e| e.hazard.load()), Some(Hazard::empty()));
            let reloads = k.hal().segment_reloads.load(Ordering::Relaxed);
            prop_assert_eq!(reloads, usize::from(ec_hazards.contains(Hazard::DS_ES)));
        }
    }

    #[test]
    fn remote_callee_is_refused(cpu in 1u16..4, slot in 0..3 as Mword) {
        let (mut k, root) = boot_with_servers(KernelConfig::DEFAULT.with_cpus(4), cpu, 3);
        let call = Hypercall::new(HC_CALL, PORTALS + slot);
        prop_assert_eq!(hypercall(&mut k, call), Exit::Sysret(root));
        let status = k.ec(root).map(|e| e.regs.status()).and_then(Status::from_raw);
        prop_assert_eq!(status, Some(Status::BadCpu));
        prop_assert_eq!(k.ec(root).and_then(|e| e.partner), None);
    }
}
