// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Register layout of hypercall arguments.
//!
//! ARG1 packs the hypercall number (bits 7:0), flags or sub-operation
//! (bits 11:8) and a selector (bits 63:12). ARG2..ARG5 are plain words;
//! the helpers below pack the composite ones. Kernel-side decoding and
//! user-side encoding share these definitions.

use crate::ec::ExcRegs;
use crate::ec::regs::{R8, RAX, RDI, RDX, RSI};
use crate::types::Mword;

/// Hypercall as it sits in the argument registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hypercall {
    pub id: u8,
    pub flags: u8,
    pub sel: Mword,
    /// ARG2..ARG5.
    pub args: [Mword; 4],
}

impl Hypercall {
    pub const fn new(id: u8, sel: Mword) -> Self {
        Self { id, flags: 0, sel, args: [0; 4] }
    }

    pub const fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Sets ARG`n` for `n` in 2..=5; other positions are ignored.
    pub const fn arg(mut self, n: usize, value: Mword) -> Self {
        if n >= 2 && n <= 5 {
            self.args[n - 2] = value;
        }
        self
    }

    pub const fn arg1(&self) -> Mword {
        (self.sel << 12) | ((self.flags as Mword & 0xf) << 8) | self.id as Mword
    }

    /// Loads the hypercall into `regs`.
    pub fn apply(&self, regs: &mut ExcRegs) {
        regs.gpr[RDI] = self.arg1();
        regs.gpr[RSI] = self.args[0];
        regs.gpr[RDX] = self.args[1];
        regs.gpr[RAX] = self.args[2];
        regs.gpr[R8] = self.args[3];
    }
}

/// create_ec ARG3: processor in the low 12 bits, UTCB page above.
pub const fn ec_placement(cpu: u16, user_page: Mword) -> Mword {
    (user_page & !0xfff) | (cpu as Mword & 0xfff)
}

pub const fn decode_ec_placement(raw: Mword) -> (Mword, Mword) {
    (raw & 0xfff, raw & !0xfff)
}

/// create_sc ARG4: priority in bits 7:0, quantum from bit 12.
pub const fn qpd(prio: u8, quantum: u64) -> Mword {
    (quantum << 12) | prio as Mword
}

pub const fn decode_qpd(raw: Mword) -> (u8, u64) {
    ((raw & 0xff) as u8, raw >> 12)
}

/// irq_ctrl ARG2: vector in bits 7:0, processor in bits 23:8, kernel page bit from bit 24.
pub const fn irq_target(vector: u8, cpu: u16, bit: u64) -> Mword {
    (bit << 24) | ((cpu as Mword) << 8) | vector as Mword
}

pub const fn decode_irq_target(raw: Mword) -> (u8, Mword, u64) {
    ((raw & 0xff) as u8, (raw >> 8) & 0xffff, raw >> 24)
}

/// irq_ctrl ARG3 for IOAPIC pins: id, pin, trigger and polarity.
pub const fn ioapic_pin(ioapic: u8, pin: u8, level: bool, active_low: bool) -> Mword {
    ((active_low as Mword) << 17)
        | ((level as Mword) << 16)
        | ((pin as Mword) << 8)
        | ioapic as Mword
}

pub const fn decode_ioapic_pin(raw: Mword) -> (u8, u8, bool, bool) {
    ((raw & 0xff) as u8, ((raw >> 8) & 0xff) as u8, raw & (1 << 16) != 0, raw & (1 << 17) != 0)
}

/// machine_ctrl suspend ARG2: SLP_TYPa in bits 7:0, SLP_TYPb in bits 15:8.
pub const fn sleep_types(a: u8, b: u8) -> Mword {
    ((b as Mword) << 8) | a as Mword
}

pub const fn decode_sleep_types(raw: Mword) -> (u8, u8) {
    ((raw & 0xff) as u8, ((raw >> 8) & 0xff) as u8)
}
