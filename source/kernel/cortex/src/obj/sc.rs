// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scheduling context: priority and time budget bound to one global EC.

use crate::ec::EcId;
use crate::types::CpuId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sc {
    pub ec: EcId,
    pub cpu: CpuId,
    pub prio: u8,
    /// Quantum in timestamp-counter ticks.
    pub quantum: u64,
    /// Budget left in the running quantum.
    pub left: u64,
    /// Consumed time in ticks.
    pub time: u64,
}

impl Sc {
    pub const fn new(ec: EcId, cpu: CpuId, prio: u8, quantum: u64) -> Self {
        Self { ec, cpu, prio, quantum, left: quantum, time: 0 }
    }

    /// Charges `ticks`. Returns `true` when the quantum ran out; the
    /// budget is refilled for the next round.
    pub fn charge(&mut self, ticks: u64) -> bool {
        self.time = self.time.saturating_add(ticks);
        if ticks < self.left {
            self.left -= ticks;
            return false;
        }
        self.left = self.quantum;
        true
    }
}
