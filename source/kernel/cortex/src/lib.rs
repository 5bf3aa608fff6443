// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cortex microhypervisor core: EC scheduling, IPC and exception dispatch
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, Exit, Status, KernelConfig, hal::Hal, sched::Scheduler
//! DEPENDS_ON: bitflags, spin, linked_list_allocator (bare metal only)
//! INVARIANTS: All kernel state is reachable through one Kernel value; no global mutable state
//!             outside the NMI shadow, the log sink and the heap
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod arena;
pub mod cap;
pub mod config;
pub mod cpu;
pub mod ec;
pub mod hal;
pub mod hazard;
pub mod ipc;
pub mod kernel;
pub mod obj;
pub mod rcu;
pub mod sched;
pub mod space;
pub mod syscall;
pub mod trap;
pub mod types;
pub mod utcb;
pub mod xfer;

#[cfg(target_os = "none")]
pub mod heap;

pub use config::KernelConfig;
pub use kernel::{Exit, Kernel, RootTask};
pub use syscall::Status;
