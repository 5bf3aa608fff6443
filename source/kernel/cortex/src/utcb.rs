// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User thread control block: message words, transfer items and the
//! exception state exchanged with a handler.

extern crate alloc;

use alloc::vec::Vec;

use crate::cap::{Crd, XferItem};
use crate::ec::regs::{ExcRegs, Mtd, R15, R8, RAX, RBP, RBX, RCX, RDI, RDX, RSI};
use crate::ec::FpuState;
use crate::types::Mword;

/// Untyped message words per UTCB.
pub const UTCB_WORDS: usize = 64;

#[derive(Clone, Debug)]
pub struct Utcb {
    /// Descriptor for the exception state words in this UTCB.
    pub mtd: Mtd,
    /// Receive window for translate items.
    pub xlt: Crd,
    /// Receive window for delegate items.
    pub del: Crd,
    /// Number of valid untyped words.
    pub untyped: usize,
    pub words: [Mword; UTCB_WORDS],
    /// Typed items. A completed transfer replaces the receiver's items with the results.
    pub items: Vec<XferItem>,
    /// Exception state per `mtd`.
    pub exc: ExcRegs,
    pub fpu: Option<FpuState>,
}

impl Utcb {
    pub fn new() -> Self {
        Self {
            mtd: Mtd::empty(),
            xlt: Crd::null(),
            del: Crd::null(),
            untyped: 0,
            words: [0; UTCB_WORDS],
            items: Vec::new(),
            exc: ExcRegs::default(),
            fpu: None,
        }
    }

    /// Copies the untyped message into `dst`.
    pub fn save(&self, dst: &mut Utcb) {
        let n = self.untyped.min(UTCB_WORDS);
        dst.words[..n].copy_from_slice(&self.words[..n]);
        dst.untyped = n;
    }

    /// Fills the UTCB from a faulting frame according to `mtd`.
    /// Returns whether FPU state was requested.
    pub fn load_exc(&mut self, regs: &ExcRegs) -> bool {
        let mtd = regs.mtd;
        self.mtd = mtd;
        copy_frame(&mut self.exc, regs, mtd);
        if mtd.contains(Mtd::QUAL) {
            self.exc.vec = regs.vec;
            self.exc.err = regs.err;
            self.exc.cr2 = regs.cr2;
        }
        mtd.contains(Mtd::FPU)
    }

    /// Writes the handler's reply back into the faulting frame according to
    /// the UTCB's own `mtd`. Returns whether FPU state is to be restored.
    pub fn save_exc(&self, regs: &mut ExcRegs) -> bool {
        copy_frame(regs, &self.exc, self.mtd);
        self.mtd.contains(Mtd::FPU)
    }
}

impl Default for Utcb {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_frame(dst: &mut ExcRegs, src: &ExcRegs, mtd: Mtd) {
    if mtd.contains(Mtd::GPR_ACDB) {
        for r in [RAX, RCX, RDX, RBX] {
            dst.gpr[r] = src.gpr[r];
        }
    }
    if mtd.contains(Mtd::GPR_BSD) {
        for r in [RBP, RSI, RDI] {
            dst.gpr[r] = src.gpr[r];
        }
    }
    if mtd.contains(Mtd::GPR_R8_R15) {
        dst.gpr[R8..=R15].copy_from_slice(&src.gpr[R8..=R15]);
    }
    if mtd.contains(Mtd::RSP) {
        dst.rsp = src.rsp;
    }
    if mtd.contains(Mtd::RIP_LEN) {
        dst.rip = src.rip;
    }
    if mtd.contains(Mtd::RFLAGS) {
        dst.rfl = src.rfl;
    }
}
