// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel page: one page of kernel memory shared with user space, used for
//! interrupt notification bits.

extern crate alloc;

use alloc::boxed::Box;

use crate::obj::PdId;
use crate::types::{Mword, PAGE_SIZE, USER_PAGE_MASK};

const WORDS: usize = (PAGE_SIZE / 8) as usize;

pub struct Kp {
    page: Box<[u64; WORDS]>,
    mapping: Option<(PdId, Mword)>,
}

impl Kp {
    /// Number of notification bits in one page.
    pub const BITS: u64 = PAGE_SIZE * 8;

    pub fn new() -> Self {
        Self { page: Box::new([0; WORDS]), mapping: None }
    }

    /// Sets notification `bit`; out-of-range bits are ignored.
    pub fn set_bit(&mut self, bit: u64) {
        if bit < Self::BITS {
            self.page[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn test_bit(&self, bit: u64) -> bool {
        bit < Self::BITS && self.page[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Maps the page at `addr` in `pd`. Fails if already mapped or `addr` is not a user page.
    pub fn add_user_mapping(&mut self, pd: PdId, addr: Mword) -> bool {
        if self.mapping.is_some()
            || addr & USER_PAGE_MASK != 0
            || addr >= crate::config::USER_ADDR
        {
            return false;
        }
        self.mapping = Some((pd, addr));
        true
    }

    pub fn remove_user_mapping(&mut self) -> Option<(PdId, Mword)> {
        self.mapping.take()
    }

    pub fn mapping(&self) -> Option<(PdId, Mword)> {
        self.mapping
    }
}

impl Default for Kp {
    fn default() -> Self {
        Self::new()
    }
}
